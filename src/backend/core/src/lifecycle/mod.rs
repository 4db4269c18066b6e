//! Experiment lifecycle management.
//!
//! Validates and executes state transitions, applies traffic increments,
//! and drives the live broadcaster. All writer paths for one experiment id
//! (status transitions and traffic ingestion) serialize on a per-id lock,
//! so the traffic-sum invariant and counter monotonicity are never observed
//! violated; readers get owned clones.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, VantageError};
use crate::experiment::{Experiment, ExperimentId, ExperimentSpec, ExperimentStatus, VariantId};
use crate::live::LiveBroadcaster;
use crate::stats::{self, Analysis};
use crate::store::{ExperimentStore, ListFilter};

/// Orchestrates experiment state transitions and traffic accrual.
pub struct LifecycleManager {
    store: Arc<dyn ExperimentStore>,
    broadcaster: Arc<LiveBroadcaster>,
    /// Per-experiment writer locks (single writer at a time per id).
    locks: DashMap<ExperimentId, Arc<Mutex<()>>>,
}

impl LifecycleManager {
    pub fn new(store: Arc<dyn ExperimentStore>, broadcaster: Arc<LiveBroadcaster>) -> Self {
        Self {
            store,
            broadcaster,
            locks: DashMap::new(),
        }
    }

    pub fn broadcaster(&self) -> &Arc<LiveBroadcaster> {
        &self.broadcaster
    }

    fn writer_lock(&self, id: ExperimentId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Read operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Fetch an experiment with freshly derived statistics.
    pub async fn get(&self, id: ExperimentId) -> Result<Experiment> {
        let experiment = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| VantageError::experiment_not_found(id))?;
        Ok(stats::derive(&experiment))
    }

    /// List experiments with freshly derived statistics.
    pub async fn list(&self, filter: ListFilter) -> Result<Vec<Experiment>> {
        let experiments = self.store.list(filter).await?;
        Ok(experiments.iter().map(stats::derive).collect())
    }

    /// Read-only statistical evaluation. Never mutates the record; winner
    /// and significance are persisted only by the terminal path.
    pub async fn analyze(&self, id: ExperimentId) -> Result<(Experiment, Analysis)> {
        let experiment = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| VantageError::experiment_not_found(id))?;
        let analysis = stats::analyze(&experiment);
        Ok((stats::derive(&experiment), analysis))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Write operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a draft experiment from a spec. Ids are assigned here.
    pub async fn create(&self, spec: ExperimentSpec) -> Result<Experiment> {
        let experiment = Experiment::from_spec(spec)?;
        let experiment = self.store.create(experiment).await?;
        info!(experiment = %experiment.id, name = %experiment.name, "Experiment created");
        Ok(experiment)
    }

    /// Start (or restart from paused) an experiment.
    ///
    /// Preconditions: status is draft or paused, variant traffic percentages
    /// sum to 100, and exactly one control variant exists. Violations are
    /// reported as validation errors naming the broken invariant.
    pub async fn start(&self, id: ExperimentId) -> Result<Experiment> {
        let lock = self.writer_lock(id);
        let _guard = lock.lock().await;

        let mut experiment = self.fetch(id).await?;
        if !matches!(
            experiment.status,
            ExperimentStatus::Draft | ExperimentStatus::Paused
        ) {
            return Err(VantageError::validation(format!(
                "experiment can only be started from draft or paused status, currently {}",
                experiment.status
            )));
        }
        experiment.validate_for_start()?;

        let now = Utc::now();
        if experiment.status == ExperimentStatus::Paused {
            self.close_pause_span(&mut experiment, now);
        }
        experiment.transition_to(ExperimentStatus::Running)?;
        experiment.start_date.get_or_insert(now);
        experiment.touch();

        let experiment = self.store.update(experiment).await?;
        self.broadcaster.publish(&experiment).await;
        info!(experiment = %id, "Experiment started");
        Ok(stats::derive(&experiment))
    }

    /// Pause a running experiment: traffic accrual and the duration
    /// countdown both freeze until resume.
    pub async fn pause(&self, id: ExperimentId) -> Result<Experiment> {
        let lock = self.writer_lock(id);
        let _guard = lock.lock().await;

        let mut experiment = self.fetch(id).await?;
        if let Some(finalized) = self.expire_if_due(&mut experiment).await? {
            return Err(VantageError::invalid_transition(
                finalized.status,
                ExperimentStatus::Paused,
            ));
        }
        experiment.transition_to(ExperimentStatus::Paused)?;
        experiment.paused_at = Some(Utc::now());
        experiment.touch();

        let experiment = self.store.update(experiment).await?;
        self.broadcaster.publish(&experiment).await;
        info!(experiment = %id, "Experiment paused");
        Ok(stats::derive(&experiment))
    }

    /// Resume a paused experiment: countdown and accrual continue.
    pub async fn resume(&self, id: ExperimentId) -> Result<Experiment> {
        let lock = self.writer_lock(id);
        let _guard = lock.lock().await;

        let mut experiment = self.fetch(id).await?;
        if experiment.status != ExperimentStatus::Paused {
            return Err(VantageError::invalid_transition(
                experiment.status,
                ExperimentStatus::Running,
            ));
        }
        self.close_pause_span(&mut experiment, Utc::now());
        experiment.transition_to(ExperimentStatus::Running)?;
        experiment.touch();

        let experiment = self.store.update(experiment).await?;
        self.broadcaster.publish(&experiment).await;
        info!(experiment = %id, "Experiment resumed");
        Ok(stats::derive(&experiment))
    }

    /// Stop an experiment, running the final evaluation.
    ///
    /// Idempotent: stopping an already-terminal experiment returns its
    /// current state unchanged, and an absent id yields `None` rather than
    /// an error.
    pub async fn stop(&self, id: ExperimentId) -> Result<Option<Experiment>> {
        let lock = self.writer_lock(id);
        let _guard = lock.lock().await;

        let Some(mut experiment) = self.store.get(id).await? else {
            return Ok(None);
        };
        if experiment.status.is_terminal() {
            return Ok(Some(stats::derive(&experiment)));
        }
        if experiment.status == ExperimentStatus::Draft {
            return Err(VantageError::invalid_transition(
                ExperimentStatus::Draft,
                ExperimentStatus::Stopped,
            ));
        }

        let experiment = self
            .finalize(&mut experiment, ExperimentStatus::Stopped)
            .await?;
        Ok(Some(experiment))
    }

    /// Delete an experiment in any status, closing all live subscriptions
    /// for its id. Absent ids are a quiet no-op.
    pub async fn delete(&self, id: ExperimentId) -> Result<Option<Experiment>> {
        let lock = self.writer_lock(id);
        let removed = {
            let _guard = lock.lock().await;
            self.store.delete(id).await?
        };
        self.locks.remove(&id);
        self.broadcaster.close(id).await;
        if removed.is_some() {
            info!(experiment = %id, "Experiment deleted");
        }
        Ok(removed)
    }

    /// Apply visitor/conversion increments for one variant.
    ///
    /// Accrual only happens while the experiment is running; in any other
    /// status the increments are dropped and the current state is returned
    /// unchanged. The conversion increment is clamped so `conversions ≤
    /// visitors` always holds.
    pub async fn record_traffic(
        &self,
        id: ExperimentId,
        variant_id: VariantId,
        visitors: u64,
        conversions: u64,
    ) -> Result<Experiment> {
        let lock = self.writer_lock(id);
        let _guard = lock.lock().await;

        let mut experiment = self.fetch(id).await?;
        if let Some(finalized) = self.expire_if_due(&mut experiment).await? {
            return Ok(finalized);
        }
        if experiment.variant(variant_id).is_none() {
            return Err(VantageError::variant_not_found(variant_id));
        }
        if experiment.status != ExperimentStatus::Running {
            debug!(
                experiment = %id,
                status = %experiment.status,
                "Traffic increment dropped; accrual is suspended"
            );
            return Ok(stats::derive(&experiment));
        }

        let variant = experiment
            .variant_mut(variant_id)
            .ok_or_else(|| VantageError::variant_not_found(variant_id))?;
        variant.visitors += visitors;
        let headroom = variant.visitors.saturating_sub(variant.conversions);
        if conversions > headroom {
            warn!(
                experiment = %id,
                variant = %variant_id,
                conversions,
                headroom,
                "Conversion increment clamped to keep conversions <= visitors"
            );
        }
        variant.conversions += conversions.min(headroom);
        experiment.touch();

        let experiment = self.store.update(experiment).await?;
        self.broadcaster.publish(&experiment).await;
        Ok(stats::derive(&experiment))
    }

    /// Complete every running experiment whose duration has elapsed.
    /// Returns how many were finalized.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let running = self
            .store
            .list(ListFilter {
                status: Some(ExperimentStatus::Running),
            })
            .await?;

        let mut completed = 0;
        for candidate in running {
            let lock = self.writer_lock(candidate.id);
            let _guard = lock.lock().await;

            // Re-read under the lock; state may have moved since the list.
            let Some(mut experiment) = self.store.get(candidate.id).await? else {
                continue;
            };
            if self.expire_if_due(&mut experiment).await?.is_some() {
                completed += 1;
            }
        }
        if completed > 0 {
            info!(completed, "Expired experiments completed by sweep");
        }
        Ok(completed)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    async fn fetch(&self, id: ExperimentId) -> Result<Experiment> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| VantageError::experiment_not_found(id))
    }

    fn close_pause_span(&self, experiment: &mut Experiment, now: chrono::DateTime<Utc>) {
        if let Some(paused_at) = experiment.paused_at.take() {
            experiment.paused_secs += (now - paused_at).num_seconds().max(0);
        }
    }

    /// Complete the experiment if its duration has elapsed. Caller holds the
    /// writer lock. Returns the finalized record when it fired.
    async fn expire_if_due(&self, experiment: &mut Experiment) -> Result<Option<Experiment>> {
        if !experiment.is_expired(Utc::now()) {
            return Ok(None);
        }
        let finalized = self
            .finalize(experiment, ExperimentStatus::Completed)
            .await?;
        Ok(Some(finalized))
    }

    /// Shared terminal path for stop and automatic completion: run the final
    /// evaluation, persist winner and significance, emit the last snapshot,
    /// and close the live channel.
    async fn finalize(
        &self,
        experiment: &mut Experiment,
        terminal: ExperimentStatus,
    ) -> Result<Experiment> {
        let now = Utc::now();
        self.close_pause_span(experiment, now);

        let analysis = stats::analyze(experiment);
        experiment.winner = analysis.winner;
        experiment.statistical_significance = analysis.significance;
        experiment.end_date = Some(now);
        experiment.transition_to(terminal)?;
        experiment.touch();

        let experiment = self.store.update(experiment.clone()).await?;
        self.broadcaster.finalize(&experiment).await;
        info!(
            experiment = %experiment.id,
            status = %experiment.status,
            winner = ?experiment.winner,
            significance = experiment.statistical_significance,
            "Experiment finalized"
        );
        Ok(stats::derive(&experiment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::experiment::{MetricGoal, MetricSpec, MetricType, VariantSpec};
    use crate::store::MemoryStore;
    use chrono::Duration;

    fn spec(control_pct: f64, variant_pct: f64) -> ExperimentSpec {
        ExperimentSpec {
            name: "Landing headline".to_string(),
            description: String::new(),
            variants: vec![
                VariantSpec {
                    name: "Control".to_string(),
                    description: String::new(),
                    traffic_percentage: control_pct,
                    is_control: true,
                },
                VariantSpec {
                    name: "A".to_string(),
                    description: String::new(),
                    traffic_percentage: variant_pct,
                    is_control: false,
                },
            ],
            metrics: vec![MetricSpec {
                name: "Signup".to_string(),
                metric_type: MetricType::Conversion,
                goal: MetricGoal::Maximize,
                baseline: 0.0,
                target: 0.0,
            }],
            target_audience: String::new(),
            duration_days: 14,
            traffic_allocation: 100.0,
            confidence_level: 95.0,
        }
    }

    fn manager() -> (LifecycleManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let broadcaster = Arc::new(LiveBroadcaster::new(16));
        (
            LifecycleManager::new(store.clone(), broadcaster),
            store,
        )
    }

    #[tokio::test]
    async fn test_start_succeeds_from_valid_draft() {
        let (manager, _) = manager();
        let experiment = manager.create(spec(50.0, 50.0)).await.unwrap();
        assert_eq!(experiment.status, ExperimentStatus::Draft);

        let started = manager.start(experiment.id).await.unwrap();
        assert_eq!(started.status, ExperimentStatus::Running);
        assert!(started.start_date.is_some());
        assert!(started.version > experiment.version);
    }

    #[tokio::test]
    async fn test_start_rejects_bad_traffic_sum() {
        let (manager, _) = manager();
        let experiment = manager.create(spec(60.0, 50.0)).await.unwrap();

        let err = manager.start(experiment.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
        assert!(err.user_message().contains("sum to 100"));

        // The failed start must leave the experiment untouched.
        let unchanged = manager.get(experiment.id).await.unwrap();
        assert_eq!(unchanged.status, ExperimentStatus::Draft);
        assert_eq!(unchanged.version, experiment.version);
    }

    #[tokio::test]
    async fn test_start_unknown_id_is_not_found() {
        let (manager, _) = manager();
        let err = manager.start(ExperimentId::new()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ExperimentNotFound);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_spec() {
        let (manager, _) = manager();
        let mut bad = spec(50.0, 50.0);
        bad.metrics.clear();
        assert!(manager.create(bad).await.is_err());
    }

    #[tokio::test]
    async fn test_pause_suspends_accrual_and_resume_restores_it() {
        let (manager, _) = manager();
        let experiment = manager.create(spec(50.0, 50.0)).await.unwrap();
        let variant_id = experiment.variants[1].id;
        manager.start(experiment.id).await.unwrap();

        let paused = manager.pause(experiment.id).await.unwrap();
        assert_eq!(paused.status, ExperimentStatus::Paused);
        assert!(paused.paused_at.is_some());

        // Increments while paused are dropped without bumping the version.
        let after_drop = manager
            .record_traffic(experiment.id, variant_id, 100, 10)
            .await
            .unwrap();
        assert_eq!(after_drop.variants[1].visitors, 0);
        assert_eq!(after_drop.version, paused.version);

        let resumed = manager.resume(experiment.id).await.unwrap();
        assert_eq!(resumed.status, ExperimentStatus::Running);
        assert!(resumed.paused_at.is_none());

        let after_apply = manager
            .record_traffic(experiment.id, variant_id, 100, 10)
            .await
            .unwrap();
        assert_eq!(after_apply.variants[1].visitors, 100);
        assert_eq!(after_apply.variants[1].conversions, 10);
        assert!(after_apply.version > resumed.version);
    }

    #[tokio::test]
    async fn test_pause_requires_running() {
        let (manager, _) = manager();
        let experiment = manager.create(spec(50.0, 50.0)).await.unwrap();
        let err = manager.pause(experiment.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStateTransition);
    }

    #[tokio::test]
    async fn test_conversion_increment_is_clamped() {
        let (manager, _) = manager();
        let experiment = manager.create(spec(50.0, 50.0)).await.unwrap();
        let variant_id = experiment.variants[1].id;
        manager.start(experiment.id).await.unwrap();

        let updated = manager
            .record_traffic(experiment.id, variant_id, 10, 50)
            .await
            .unwrap();
        assert_eq!(updated.variants[1].visitors, 10);
        assert_eq!(updated.variants[1].conversions, 10);
    }

    #[tokio::test]
    async fn test_record_traffic_unknown_variant() {
        let (manager, _) = manager();
        let experiment = manager.create(spec(50.0, 50.0)).await.unwrap();
        manager.start(experiment.id).await.unwrap();

        let err = manager
            .record_traffic(experiment.id, VariantId::new(), 10, 1)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::VariantNotFound);
    }

    #[tokio::test]
    async fn test_stop_runs_final_evaluation_and_is_idempotent() {
        let (manager, _) = manager();
        let experiment = manager.create(spec(50.0, 50.0)).await.unwrap();
        let control_id = experiment.variants[0].id;
        let variant_id = experiment.variants[1].id;
        manager.start(experiment.id).await.unwrap();

        manager
            .record_traffic(experiment.id, control_id, 1000, 50)
            .await
            .unwrap();
        manager
            .record_traffic(experiment.id, variant_id, 1000, 80)
            .await
            .unwrap();

        let stopped = manager.stop(experiment.id).await.unwrap().unwrap();
        assert_eq!(stopped.status, ExperimentStatus::Stopped);
        assert!(stopped.end_date.is_some());
        assert_eq!(stopped.winner, Some(variant_id));
        assert!(stopped.statistical_significance >= 95.0);

        // Second stop: identical state, no error, no version bump.
        let again = manager.stop(experiment.id).await.unwrap().unwrap();
        assert_eq!(again.end_date, stopped.end_date);
        assert_eq!(again.winner, stopped.winner);
        assert_eq!(again.version, stopped.version);
    }

    #[tokio::test]
    async fn test_stop_without_qualifying_variant_has_no_winner() {
        let (manager, _) = manager();
        let experiment = manager.create(spec(50.0, 50.0)).await.unwrap();
        let control_id = experiment.variants[0].id;
        let variant_id = experiment.variants[1].id;
        manager.start(experiment.id).await.unwrap();

        manager
            .record_traffic(experiment.id, control_id, 100, 5)
            .await
            .unwrap();
        manager
            .record_traffic(experiment.id, variant_id, 100, 8)
            .await
            .unwrap();

        let stopped = manager.stop(experiment.id).await.unwrap().unwrap();
        assert!(stopped.winner.is_none());
        assert!(stopped.statistical_significance < 95.0);
    }

    #[tokio::test]
    async fn test_stop_absent_and_draft() {
        let (manager, _) = manager();
        assert!(manager.stop(ExperimentId::new()).await.unwrap().is_none());

        let draft = manager.create(spec(50.0, 50.0)).await.unwrap();
        let err = manager.stop(draft.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStateTransition);
    }

    #[tokio::test]
    async fn test_delete_closes_live_channels() {
        let (manager, _) = manager();
        let experiment = manager.create(spec(50.0, 50.0)).await.unwrap();
        manager.start(experiment.id).await.unwrap();

        let mut subscription = manager.broadcaster().subscribe(experiment.id).await;
        // Drain the start snapshot.
        assert!(subscription.next_snapshot().await.is_some());

        let removed = manager.delete(experiment.id).await.unwrap();
        assert!(removed.is_some());
        assert!(subscription.next_snapshot().await.is_none());

        // Deleting again is a quiet no-op.
        assert!(manager.delete(experiment.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_experiment_completes_on_mutation() {
        let (manager, store) = manager();
        let experiment = manager.create(spec(50.0, 50.0)).await.unwrap();
        let variant_id = experiment.variants[1].id;
        manager.start(experiment.id).await.unwrap();

        // Backdate the start so the configured duration has elapsed.
        let mut backdated = store.get(experiment.id).await.unwrap().unwrap();
        backdated.start_date = Some(Utc::now() - Duration::days(15));
        store.update(backdated).await.unwrap();

        let finalized = manager
            .record_traffic(experiment.id, variant_id, 10, 1)
            .await
            .unwrap();
        assert_eq!(finalized.status, ExperimentStatus::Completed);
        assert!(finalized.end_date.is_some());
        // The triggering increment is not applied; the experiment was
        // already past its duration.
        assert_eq!(finalized.variants[1].visitors, 0);
    }

    #[tokio::test]
    async fn test_sweep_completes_expired_experiments() {
        let (manager, store) = manager();
        let expired = manager.create(spec(50.0, 50.0)).await.unwrap();
        let fresh = manager.create(spec(50.0, 50.0)).await.unwrap();
        manager.start(expired.id).await.unwrap();
        manager.start(fresh.id).await.unwrap();

        let mut backdated = store.get(expired.id).await.unwrap().unwrap();
        backdated.start_date = Some(Utc::now() - Duration::days(30));
        store.update(backdated).await.unwrap();

        let completed = manager.sweep_expired().await.unwrap();
        assert_eq!(completed, 1);
        assert_eq!(
            manager.get(expired.id).await.unwrap().status,
            ExperimentStatus::Completed
        );
        assert_eq!(
            manager.get(fresh.id).await.unwrap().status,
            ExperimentStatus::Running
        );
    }

    #[tokio::test]
    async fn test_version_strictly_increases_across_mutations() {
        let (manager, _) = manager();
        let experiment = manager.create(spec(50.0, 50.0)).await.unwrap();
        let variant_id = experiment.variants[1].id;

        let mut last = experiment.version;
        let started = manager.start(experiment.id).await.unwrap();
        assert!(started.version > last);
        last = started.version;

        for _ in 0..3 {
            let updated = manager
                .record_traffic(experiment.id, variant_id, 10, 1)
                .await
                .unwrap();
            assert!(updated.version > last);
            last = updated.version;
        }

        let stopped = manager.stop(experiment.id).await.unwrap().unwrap();
        assert!(stopped.version > last);
    }
}
