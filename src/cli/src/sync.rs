//! View synchronizer: reconciles live snapshots into a local cache.
//!
//! One subscription at a time, held as an explicit session handle with its
//! own cancellation token. Switching the watched experiment always cancels
//! the previous session before opening the next one, so a channel is never
//! silently orphaned. Transport failures mark the entry disconnected and
//! schedule a reconnect with exponential backoff; the last-known-good
//! snapshot is never discarded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::client::Experiment;

/// First reconnect delay after a transport failure.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
/// Reconnect delay ceiling.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Errors surfaced by a live feed.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("experiment not found: {0}")]
    NotFound(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Source of live experiment snapshots. The real implementation reads the
/// server-sent event stream; tests substitute an in-memory fake.
#[async_trait]
pub trait LiveFeed: Send + Sync {
    async fn subscribe(
        &self,
        experiment_id: &str,
    ) -> Result<BoxStream<'static, Result<Experiment, FeedError>>, FeedError>;
}

/// Connection state of a cached experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Live updates are flowing
    Live,
    /// Transport failed; reconnecting, cached snapshot still valid
    Disconnected,
    /// No live subscription
    Off,
}

/// One cached experiment plus its live-link state.
#[derive(Debug, Clone)]
pub struct CachedExperiment {
    pub experiment: Experiment,
    pub link: LinkState,
}

/// Keyed local cache of experiments.
///
/// Detail and list views read the same entries, so a snapshot lands in both
/// with a single logical write.
#[derive(Default)]
pub struct ExperimentCache {
    entries: Mutex<HashMap<String, CachedExperiment>>,
}

impl ExperimentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or refresh an entry from a request/response read. Keeps the
    /// existing link state.
    pub fn insert(&self, experiment: Experiment) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let link = entries
            .get(&experiment.id)
            .map(|cached| cached.link)
            .unwrap_or(LinkState::Off);
        entries.insert(experiment.id.clone(), CachedExperiment { experiment, link });
    }

    /// Apply an inbound live snapshot. The snapshot replaces the cached copy
    /// only when its version is newer; stale or duplicate snapshots are
    /// ignored. Returns whether it was applied.
    pub fn apply_snapshot(&self, experiment: Experiment) -> bool {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        if let Some(cached) = entries.get(&experiment.id) {
            if experiment.version <= cached.experiment.version {
                return false;
            }
        }
        entries.insert(
            experiment.id.clone(),
            CachedExperiment {
                experiment,
                link: LinkState::Live,
            },
        );
        true
    }

    /// Update only the link state, preserving the cached snapshot.
    pub fn set_link(&self, experiment_id: &str, link: LinkState) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        if let Some(cached) = entries.get_mut(experiment_id) {
            cached.link = link;
        }
    }

    /// Detail view: one entry.
    pub fn get(&self, experiment_id: &str) -> Option<CachedExperiment> {
        self.entries
            .lock()
            .expect("cache lock poisoned")
            .get(experiment_id)
            .cloned()
    }

    /// List view: all entries.
    pub fn list(&self) -> Vec<CachedExperiment> {
        let mut all: Vec<CachedExperiment> = self
            .entries
            .lock()
            .expect("cache lock poisoned")
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.experiment.name.cmp(&b.experiment.name));
        all
    }
}

/// An owned live session: its cancellation token stops the reader task.
struct LiveSession {
    experiment_id: String,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

/// Drives live subscriptions and reconciles snapshots into the cache.
pub struct ViewSynchronizer {
    cache: Arc<ExperimentCache>,
    feed: Arc<dyn LiveFeed>,
    active: tokio::sync::Mutex<Option<LiveSession>>,
}

impl ViewSynchronizer {
    pub fn new(feed: Arc<dyn LiveFeed>) -> Self {
        Self {
            cache: Arc::new(ExperimentCache::new()),
            feed,
            active: tokio::sync::Mutex::new(None),
        }
    }

    pub fn cache(&self) -> Arc<ExperimentCache> {
        self.cache.clone()
    }

    /// Which experiment currently has a live session, if any.
    pub async fn live_target(&self) -> Option<String> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|session| session.experiment_id.clone())
    }

    /// Open a live subscription for an experiment.
    ///
    /// Any previous session is cancelled and awaited first: enabling live
    /// mode for experiment B while A was live unsubscribes A, never orphans
    /// it.
    pub async fn enable_live(&self, experiment_id: &str) {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            Self::shutdown(previous, &self.cache).await;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_session(
            self.cache.clone(),
            self.feed.clone(),
            experiment_id.to_string(),
            cancel.clone(),
        ));
        *active = Some(LiveSession {
            experiment_id: experiment_id.to_string(),
            cancel,
            task,
        });
    }

    /// Close the live subscription for an experiment. No further snapshot
    /// updates are applied for that id until re-enabled. Idempotent.
    pub async fn disable_live(&self, experiment_id: &str) {
        let mut active = self.active.lock().await;
        if active
            .as_ref()
            .map(|session| session.experiment_id == experiment_id)
            .unwrap_or(false)
        {
            if let Some(session) = active.take() {
                Self::shutdown(session, &self.cache).await;
            }
        }
    }

    async fn shutdown(session: LiveSession, cache: &ExperimentCache) {
        session.cancel.cancel();
        let _ = session.task.await;
        cache.set_link(&session.experiment_id, LinkState::Off);
    }
}

/// Reader loop for one live session: subscribe, apply snapshots, and on
/// transport failure mark the entry disconnected and retry with backoff
/// until cancelled or the stream ends normally.
async fn run_session(
    cache: Arc<ExperimentCache>,
    feed: Arc<dyn LiveFeed>,
    experiment_id: String,
    cancel: CancellationToken,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let failed = match feed.subscribe(&experiment_id).await {
            Ok(mut stream) => loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    item = stream.next() => match item {
                        Some(Ok(experiment)) => {
                            backoff = INITIAL_BACKOFF;
                            cache.apply_snapshot(experiment);
                        }
                        Some(Err(_)) => break true,
                        // Normal end of stream: the experiment reached a
                        // terminal state or was deleted.
                        None => {
                            cache.set_link(&experiment_id, LinkState::Off);
                            return;
                        }
                    }
                }
            },
            Err(_) => true,
        };

        if failed {
            // Keep the last-known-good snapshot; only the link state changes.
            cache.set_link(&experiment_id, LinkState::Disconnected);
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}
