//! Per-experiment snapshot fan-out.
//!
//! Subscriptions are explicit owned handles in an `id -> channel` registry,
//! never a single shared slot: switching which experiment a client watches
//! detaches the old handle instead of silently overwriting it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use crate::experiment::{Experiment, ExperimentId};
use crate::stats;

/// A derived, self-consistent view of an experiment at a point in time.
pub type Snapshot = Arc<Experiment>;

/// Per-experiment fan-out channel. Keeps the latest snapshot so a
/// mid-run joiner's first delivery is current state, not history.
struct Channel {
    sender: broadcast::Sender<Snapshot>,
    latest: Option<Snapshot>,
}

/// Statistics about the broadcaster.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BroadcastStats {
    pub total_published: u64,
    pub total_delivered: u64,
    pub channels_closed: u64,
    pub active_channels: usize,
}

/// Fan-out of experiment snapshots to live subscribers.
///
/// Exactly one evaluation/broadcast path exists per experiment id regardless
/// of subscriber count: [`publish`](Self::publish) derives the snapshot once
/// and the channel distributes it.
pub struct LiveBroadcaster {
    /// Per-experiment broadcast channels
    channels: RwLock<HashMap<ExperimentId, Channel>>,
    /// Channel capacity
    capacity: usize,
    /// Statistics
    total_published: AtomicU64,
    total_delivered: AtomicU64,
    channels_closed: AtomicU64,
}

impl LiveBroadcaster {
    /// Create a new broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
            total_published: AtomicU64::new(0),
            total_delivered: AtomicU64::new(0),
            channels_closed: AtomicU64::new(0),
        }
    }

    /// Register a new independent subscriber for an experiment.
    ///
    /// If a snapshot has already been published for this id, it is delivered
    /// as the subscription's first item.
    pub async fn subscribe(&self, experiment_id: ExperimentId) -> LiveSubscription {
        // Fast path: channel exists
        {
            let channels = self.channels.read().await;
            if let Some(channel) = channels.get(&experiment_id) {
                return LiveSubscription::new(
                    experiment_id,
                    channel.latest.clone(),
                    channel.sender.subscribe(),
                );
            }
        }

        // Slow path: create the channel
        let mut channels = self.channels.write().await;

        // Double-check after acquiring the write lock
        if let Some(channel) = channels.get(&experiment_id) {
            return LiveSubscription::new(
                experiment_id,
                channel.latest.clone(),
                channel.sender.subscribe(),
            );
        }

        let (sender, receiver) = broadcast::channel(self.capacity);
        channels.insert(
            experiment_id,
            Channel {
                sender,
                latest: None,
            },
        );
        LiveSubscription::new(experiment_id, None, receiver)
    }

    /// Recompute and distribute a snapshot for a mutated experiment.
    ///
    /// Derived statistics are computed exactly once here, then fanned out to
    /// every current subscriber.
    pub async fn publish(&self, experiment: &Experiment) {
        let snapshot: Snapshot = Arc::new(stats::derive(experiment));
        self.send(snapshot).await;
    }

    /// Publish one final snapshot, then close the channel for this id.
    /// Subscribers drain the final snapshot and observe end of stream.
    pub async fn finalize(&self, experiment: &Experiment) {
        let snapshot: Snapshot = Arc::new(stats::derive(experiment));
        let id = experiment.id;
        self.send(snapshot).await;

        let mut channels = self.channels.write().await;
        if channels.remove(&id).is_some() {
            self.channels_closed.fetch_add(1, Ordering::Relaxed);
            debug!(experiment = %id, "Live channel closed after terminal transition");
        }
    }

    /// Close the channel for an experiment without a final snapshot
    /// (delete path). Idempotent.
    pub async fn close(&self, experiment_id: ExperimentId) {
        let mut channels = self.channels.write().await;
        if channels.remove(&experiment_id).is_some() {
            self.channels_closed.fetch_add(1, Ordering::Relaxed);
            debug!(experiment = %experiment_id, "Live channel closed");
        }
    }

    /// Release channels that have no subscribers and whose experiment is no
    /// longer running, so idle experiments cost nothing.
    pub async fn cleanup_idle<F>(&self, is_running: F)
    where
        F: Fn(&ExperimentId) -> bool,
    {
        let mut channels = self.channels.write().await;
        let closed = &self.channels_closed;
        channels.retain(|id, channel| {
            let keep = channel.sender.receiver_count() > 0 || is_running(id);
            if !keep {
                closed.fetch_add(1, Ordering::Relaxed);
                debug!(experiment = %id, "Releasing idle live channel");
            }
            keep
        });
    }

    /// Current subscriber count for an experiment.
    pub async fn subscriber_count(&self, experiment_id: ExperimentId) -> usize {
        self.channels
            .read()
            .await
            .get(&experiment_id)
            .map(|channel| channel.sender.receiver_count())
            .unwrap_or(0)
    }

    /// Number of active channels.
    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Get broadcast statistics.
    pub fn stats(&self) -> BroadcastStats {
        // try_read keeps this callable from sync contexts; a contended lock
        // just reports zero active channels.
        let active_channels = self
            .channels
            .try_read()
            .map(|channels| channels.len())
            .unwrap_or(0);

        BroadcastStats {
            total_published: self.total_published.load(Ordering::Relaxed),
            total_delivered: self.total_delivered.load(Ordering::Relaxed),
            channels_closed: self.channels_closed.load(Ordering::Relaxed),
            active_channels,
        }
    }

    async fn send(&self, snapshot: Snapshot) {
        let id = snapshot.id;
        let version = snapshot.version;

        let mut channels = self.channels.write().await;
        let channel = channels.entry(id).or_insert_with(|| {
            let (sender, _) = broadcast::channel(self.capacity);
            Channel {
                sender,
                latest: None,
            }
        });
        channel.latest = Some(snapshot.clone());

        self.total_published.fetch_add(1, Ordering::Relaxed);
        match channel.sender.send(snapshot) {
            Ok(subscriber_count) => {
                self.total_delivered
                    .fetch_add(subscriber_count as u64, Ordering::Relaxed);
                debug!(
                    experiment = %id,
                    version,
                    subscribers = subscriber_count,
                    "Snapshot published"
                );
            }
            Err(_) => {
                // No subscribers; the latest snapshot is retained for joiners.
                debug!(experiment = %id, version, "No subscribers for snapshot");
            }
        }
    }
}

/// An owned handle to one live subscription.
///
/// Dropping the handle (or calling [`unsubscribe`](Self::unsubscribe))
/// detaches immediately and never affects other subscribers of the same
/// experiment.
pub struct LiveSubscription {
    experiment_id: ExperimentId,
    /// Latest snapshot at subscribe time, delivered first.
    pending: Option<Snapshot>,
    receiver: broadcast::Receiver<Snapshot>,
    last_version: u64,
}

impl LiveSubscription {
    fn new(
        experiment_id: ExperimentId,
        pending: Option<Snapshot>,
        receiver: broadcast::Receiver<Snapshot>,
    ) -> Self {
        Self {
            experiment_id,
            pending,
            receiver,
            last_version: 0,
        }
    }

    pub fn experiment_id(&self) -> ExperimentId {
        self.experiment_id
    }

    /// Provide a first snapshot when none had been published yet (a caller
    /// that fetched current state from the store seeds it here). Ignored if
    /// a published snapshot is already pending.
    pub fn seed(&mut self, snapshot: Snapshot) {
        if self.pending.is_none() {
            self.pending = Some(snapshot);
        }
    }

    /// Wait for the next snapshot.
    ///
    /// Snapshots arrive in non-decreasing version order: anything at or
    /// below the last delivered version is suppressed. Returns `None` once
    /// the channel is closed and drained.
    pub async fn next_snapshot(&mut self) -> Option<Snapshot> {
        if let Some(snapshot) = self.pending.take() {
            self.last_version = snapshot.version;
            return Some(snapshot);
        }

        loop {
            match self.receiver.recv().await {
                Ok(snapshot) => {
                    if snapshot.version > self.last_version {
                        self.last_version = snapshot.version;
                        return Some(snapshot);
                    }
                    // Stale or duplicate: suppressed server-side.
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Skipping forward preserves the ordering guarantee; the
                    // next received snapshot is newer than anything missed.
                    warn!(
                        experiment = %self.experiment_id,
                        missed,
                        "Subscriber lagged; skipping to newest snapshot"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Explicitly detach. Equivalent to dropping the handle.
    pub fn unsubscribe(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{
        ExperimentSpec, ExperimentStatus, MetricGoal, MetricSpec, MetricType, VariantSpec,
    };

    fn experiment() -> Experiment {
        Experiment::from_spec(ExperimentSpec {
            name: "Search ranking".to_string(),
            description: String::new(),
            variants: vec![
                VariantSpec {
                    name: "Control".to_string(),
                    description: String::new(),
                    traffic_percentage: 50.0,
                    is_control: true,
                },
                VariantSpec {
                    name: "A".to_string(),
                    description: String::new(),
                    traffic_percentage: 50.0,
                    is_control: false,
                },
            ],
            metrics: vec![MetricSpec {
                name: "Click".to_string(),
                metric_type: MetricType::Conversion,
                goal: MetricGoal::Maximize,
                baseline: 0.0,
                target: 0.0,
            }],
            target_audience: String::new(),
            duration_days: 14,
            traffic_allocation: 100.0,
            confidence_level: 95.0,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_then_publish_delivers() {
        let broadcaster = LiveBroadcaster::new(16);
        let experiment = experiment();

        let mut subscription = broadcaster.subscribe(experiment.id).await;
        broadcaster.publish(&experiment).await;

        let snapshot = subscription.next_snapshot().await.unwrap();
        assert_eq!(snapshot.id, experiment.id);
        assert_eq!(snapshot.version, experiment.version);
    }

    #[tokio::test]
    async fn test_late_joiner_gets_latest_snapshot_first() {
        let broadcaster = LiveBroadcaster::new(16);
        let mut experiment = experiment();

        broadcaster.publish(&experiment).await;
        experiment.touch();
        broadcaster.publish(&experiment).await;

        let mut subscription = broadcaster.subscribe(experiment.id).await;
        let first = subscription.next_snapshot().await.unwrap();
        assert_eq!(first.version, experiment.version);
    }

    #[tokio::test]
    async fn test_two_subscribers_receive_identical_ordered_sequences() {
        let broadcaster = LiveBroadcaster::new(16);
        let mut experiment = experiment();

        let mut first = broadcaster.subscribe(experiment.id).await;
        let mut second = broadcaster.subscribe(experiment.id).await;

        for _ in 0..3 {
            experiment.touch();
            broadcaster.publish(&experiment).await;
        }

        let mut versions_first = Vec::new();
        let mut versions_second = Vec::new();
        for _ in 0..3 {
            versions_first.push(first.next_snapshot().await.unwrap().version);
            versions_second.push(second.next_snapshot().await.unwrap().version);
        }

        assert_eq!(versions_first, versions_second);
        assert!(versions_first.windows(2).all(|w| w[0] < w[1]));

        // Dropping one subscriber must not affect the other.
        first.unsubscribe();
        experiment.touch();
        broadcaster.publish(&experiment).await;
        let snapshot = second.next_snapshot().await.unwrap();
        assert_eq!(snapshot.version, experiment.version);
    }

    #[tokio::test]
    async fn test_stale_snapshot_is_suppressed() {
        let broadcaster = LiveBroadcaster::new(16);
        let mut experiment = experiment();
        experiment.version = 5;

        let mut subscription = broadcaster.subscribe(experiment.id).await;
        broadcaster.publish(&experiment).await;
        assert_eq!(subscription.next_snapshot().await.unwrap().version, 5);

        // A duplicate of an already-seen version never reaches the subscriber.
        broadcaster.publish(&experiment).await;
        experiment.version = 6;
        broadcaster.publish(&experiment).await;
        assert_eq!(subscription.next_snapshot().await.unwrap().version, 6);
    }

    #[tokio::test]
    async fn test_finalize_sends_final_snapshot_then_closes() {
        let broadcaster = LiveBroadcaster::new(16);
        let mut experiment = experiment();

        let mut subscription = broadcaster.subscribe(experiment.id).await;

        experiment.status = ExperimentStatus::Running;
        experiment.touch();
        broadcaster.publish(&experiment).await;

        experiment.status = ExperimentStatus::Stopped;
        experiment.touch();
        broadcaster.finalize(&experiment).await;

        assert_eq!(
            subscription.next_snapshot().await.unwrap().status,
            ExperimentStatus::Running
        );
        let last = subscription.next_snapshot().await.unwrap();
        assert_eq!(last.status, ExperimentStatus::Stopped);
        assert!(subscription.next_snapshot().await.is_none());
        assert_eq!(broadcaster.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_close_ends_streams_without_final_snapshot() {
        let broadcaster = LiveBroadcaster::new(16);
        let experiment = experiment();

        let mut subscription = broadcaster.subscribe(experiment.id).await;
        broadcaster.close(experiment.id).await;
        assert!(subscription.next_snapshot().await.is_none());

        // Idempotent.
        broadcaster.close(experiment.id).await;
    }

    #[tokio::test]
    async fn test_cleanup_releases_idle_channels_only() {
        let broadcaster = LiveBroadcaster::new(16);
        let running = experiment();
        let idle = experiment();

        broadcaster.publish(&running).await;
        broadcaster.publish(&idle).await;
        assert_eq!(broadcaster.channel_count().await, 2);

        // A subscribed channel survives even when not running.
        let _subscription = broadcaster.subscribe(idle.id).await;
        broadcaster.cleanup_idle(|id| *id == running.id).await;
        assert_eq!(broadcaster.channel_count().await, 2);

        drop(_subscription);
        broadcaster.cleanup_idle(|id| *id == running.id).await;
        assert_eq!(broadcaster.channel_count().await, 1);
        assert_eq!(broadcaster.subscriber_count(running.id).await, 0);
    }

    #[tokio::test]
    async fn test_seed_is_ignored_when_snapshot_pending() {
        let broadcaster = LiveBroadcaster::new(16);
        let mut experiment = experiment();
        experiment.version = 7;
        broadcaster.publish(&experiment).await;

        let mut subscription = broadcaster.subscribe(experiment.id).await;
        let mut stale = experiment.clone();
        stale.version = 2;
        subscription.seed(Arc::new(stale));

        assert_eq!(subscription.next_snapshot().await.unwrap().version, 7);
    }

    #[tokio::test]
    async fn test_stats_counters() {
        let broadcaster = LiveBroadcaster::new(16);
        let experiment = experiment();

        let _subscription = broadcaster.subscribe(experiment.id).await;
        broadcaster.publish(&experiment).await;

        let stats = broadcaster.stats();
        assert_eq!(stats.total_published, 1);
        assert_eq!(stats.total_delivered, 1);
        assert_eq!(stats.active_channels, 1);
    }
}
