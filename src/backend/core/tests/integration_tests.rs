//! Integration tests for the Vantage experiment engine.
//!
//! These tests verify end-to-end functionality across modules.

use std::sync::Arc;

use tokio_test::assert_ok;

use vantage_core::experiment::{
    ExperimentSpec, ExperimentStatus, MetricGoal, MetricSpec, MetricType, VariantSpec,
};
use vantage_core::lifecycle::LifecycleManager;
use vantage_core::live::LiveBroadcaster;
use vantage_core::store::{ListFilter, MemoryStore};

// ============================================================================
// Test Utilities
// ============================================================================

fn two_variant_spec(control_pct: f64, variant_pct: f64) -> ExperimentSpec {
    ExperimentSpec {
        name: "Checkout redesign".to_string(),
        description: "New one-page checkout".to_string(),
        variants: vec![
            VariantSpec {
                name: "Control".to_string(),
                description: "Current checkout".to_string(),
                traffic_percentage: control_pct,
                is_control: true,
            },
            VariantSpec {
                name: "A".to_string(),
                description: "One-page checkout".to_string(),
                traffic_percentage: variant_pct,
                is_control: false,
            },
        ],
        metrics: vec![MetricSpec {
            name: "Purchase".to_string(),
            metric_type: MetricType::Conversion,
            goal: MetricGoal::Maximize,
            baseline: 5.0,
            target: 7.0,
        }],
        target_audience: "all".to_string(),
        duration_days: 14,
        traffic_allocation: 100.0,
        confidence_level: 95.0,
    }
}

fn engine() -> LifecycleManager {
    let store = Arc::new(MemoryStore::new());
    let broadcaster = Arc::new(LiveBroadcaster::new(64));
    LifecycleManager::new(store, broadcaster)
}

// ============================================================================
// Lifecycle + Statistics Integration
// ============================================================================

#[tokio::test]
async fn test_full_run_produces_winner() {
    let manager = engine();

    let experiment = manager.create(two_variant_spec(50.0, 50.0)).await.unwrap();
    let control_id = experiment.variants[0].id;
    let variant_id = experiment.variants[1].id;

    let started = tokio_test::assert_ok!(manager.start(experiment.id).await);
    assert_eq!(started.status, ExperimentStatus::Running);
    assert!(started.start_date.is_some());

    // Feed traffic in batches: control converts at 5%, variant at 8%.
    for _ in 0..10 {
        manager
            .record_traffic(experiment.id, control_id, 100, 5)
            .await
            .unwrap();
        manager
            .record_traffic(experiment.id, variant_id, 100, 8)
            .await
            .unwrap();
    }

    let stopped = manager.stop(experiment.id).await.unwrap().unwrap();
    assert_eq!(stopped.status, ExperimentStatus::Stopped);
    assert_eq!(stopped.winner, Some(variant_id));
    assert!(stopped.statistical_significance >= 95.0);
    assert_eq!(stopped.variants[0].visitors, 1000);
    assert_eq!(stopped.variants[1].conversions, 80);
}

#[tokio::test]
async fn test_invalid_traffic_split_never_runs() {
    let manager = engine();

    let experiment = manager.create(two_variant_spec(60.0, 50.0)).await.unwrap();
    assert!(manager.start(experiment.id).await.is_err());

    // The record is still listed as a draft, and the invariant holds for
    // every non-draft experiment in the store.
    let drafts = manager
        .list(ListFilter {
            status: Some(ExperimentStatus::Draft),
        })
        .await
        .unwrap();
    assert_eq!(drafts.len(), 1);

    let non_draft = manager.list(ListFilter::default()).await.unwrap();
    for experiment in non_draft
        .iter()
        .filter(|e| e.status != ExperimentStatus::Draft)
    {
        let sum: f64 = experiment
            .variants
            .iter()
            .map(|v| v.traffic_percentage)
            .sum();
        assert!((sum - 100.0).abs() <= 0.01);
    }
}

// ============================================================================
// Live Fan-out Integration
// ============================================================================

#[tokio::test]
async fn test_two_live_subscribers_see_the_same_ordered_run() {
    let manager = engine();

    let experiment = manager.create(two_variant_spec(50.0, 50.0)).await.unwrap();
    let variant_id = experiment.variants[1].id;
    manager.start(experiment.id).await.unwrap();

    let mut first = manager.broadcaster().subscribe(experiment.id).await;
    let mut second = manager.broadcaster().subscribe(experiment.id).await;

    for _ in 0..3 {
        manager
            .record_traffic(experiment.id, variant_id, 50, 2)
            .await
            .unwrap();
    }
    manager.stop(experiment.id).await.unwrap();

    let mut sequence_first = Vec::new();
    while let Some(snapshot) = first.next_snapshot().await {
        sequence_first.push((snapshot.version, snapshot.status));
    }
    let mut sequence_second = Vec::new();
    while let Some(snapshot) = second.next_snapshot().await {
        sequence_second.push((snapshot.version, snapshot.status));
    }

    // Identical, version-ordered sequences ending in the terminal snapshot.
    assert_eq!(sequence_first, sequence_second);
    assert!(!sequence_first.is_empty());
    assert!(sequence_first.windows(2).all(|w| w[0].0 < w[1].0));
    assert_eq!(
        sequence_first.last().unwrap().1,
        ExperimentStatus::Stopped
    );
}

#[tokio::test]
async fn test_unsubscribing_one_does_not_affect_the_other() {
    let manager = engine();

    let experiment = manager.create(two_variant_spec(50.0, 50.0)).await.unwrap();
    let variant_id = experiment.variants[1].id;
    manager.start(experiment.id).await.unwrap();

    let first = manager.broadcaster().subscribe(experiment.id).await;
    let mut second = manager.broadcaster().subscribe(experiment.id).await;

    first.unsubscribe();
    let updated = manager
        .record_traffic(experiment.id, variant_id, 25, 1)
        .await
        .unwrap();

    // Drain up to the newest version; the remaining subscriber still
    // receives everything.
    let mut newest = 0;
    while let Some(snapshot) = second.next_snapshot().await {
        newest = snapshot.version;
        if newest == updated.version {
            break;
        }
    }
    assert_eq!(newest, updated.version);
}

#[tokio::test]
async fn test_snapshots_carry_derived_statistics() {
    let manager = engine();

    let experiment = manager.create(two_variant_spec(50.0, 50.0)).await.unwrap();
    let control_id = experiment.variants[0].id;
    let variant_id = experiment.variants[1].id;
    manager.start(experiment.id).await.unwrap();

    let mut subscription = manager.broadcaster().subscribe(experiment.id).await;

    manager
        .record_traffic(experiment.id, control_id, 1000, 50)
        .await
        .unwrap();
    let updated = manager
        .record_traffic(experiment.id, variant_id, 1000, 80)
        .await
        .unwrap();

    let mut snapshot = None;
    while let Some(s) = subscription.next_snapshot().await {
        let done = s.version == updated.version;
        snapshot = Some(s);
        if done {
            break;
        }
    }
    let snapshot = snapshot.unwrap();

    // The broadcast snapshot agrees with what a polling client reads.
    let polled = manager.get(experiment.id).await.unwrap();
    assert_eq!(snapshot.variants[1].conversion_rate, 0.08);
    assert_eq!(
        snapshot.variants[1].confidence,
        polled.variants[1].confidence
    );
    assert_eq!(
        snapshot.statistical_significance,
        polled.statistical_significance
    );
    // Winner is never set on a running experiment's snapshot.
    assert!(snapshot.winner.is_none());
}
