//! Experiment domain model.
//!
//! Defines the experiment record, its variants and metrics, and the status
//! state machine that governs lifecycle transitions.

mod model;

pub use model::{
    Experiment, ExperimentId, ExperimentSpec, ExperimentStatus, Metric, MetricGoal, MetricId,
    MetricSpec, MetricType, Variant, VariantId, VariantSpec,
};
