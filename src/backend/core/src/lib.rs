//! # Vantage Core
//!
//! Experiment lifecycle and live statistics engine for A/B testing.
//!
//! ## Architecture
//!
//! - **Experiment Store**: keyed persistence behind a trait, with an
//!   in-process implementation
//! - **Statistics Engine**: pure conversion-rate, confidence, and winner
//!   computation (two-proportion z-test)
//! - **Lifecycle Manager**: validated state transitions and traffic accrual
//!   with per-experiment writer serialization
//! - **Live Broadcaster**: per-experiment snapshot fan-out with
//!   version-ordered delivery to any number of subscribers
//! - **API**: REST operations plus a server-sent event stream per experiment

pub mod api;
pub mod config;
pub mod error;
pub mod experiment;
pub mod lifecycle;
pub mod live;
pub mod stats;
pub mod store;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, Result, VantageError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::api::{build_router, ApiResponse, AppState};
    pub use crate::config::Config;
    pub use crate::error::{ErrorCode, ErrorContext, Result, VantageError};
    pub use crate::experiment::{
        Experiment, ExperimentId, ExperimentSpec, ExperimentStatus, Metric, MetricGoal,
        MetricId, MetricSpec, MetricType, Variant, VariantId, VariantSpec,
    };
    pub use crate::lifecycle::LifecycleManager;
    pub use crate::live::{BroadcastStats, LiveBroadcaster, LiveEvent, LiveSubscription, Snapshot};
    pub use crate::stats::{Analysis, VariantComparison};
    pub use crate::store::{ExperimentStore, ListFilter, MemoryStore};
}
