//! Live snapshot distribution.
//!
//! One fan-out channel per experiment: state is recomputed once per
//! mutation and distributed to every subscriber, bounding server cost to
//! the number of experiments in use rather than the number of subscribers.

mod broadcaster;
mod message;

pub use broadcaster::{BroadcastStats, LiveBroadcaster, LiveSubscription, Snapshot};
pub use message::LiveEvent;
