//! Experiment, variant, and metric definitions plus the status state machine.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, VantageError};

/// Tolerance when checking that variant traffic percentages sum to 100.
pub const TRAFFIC_SUM_TOLERANCE: f64 = 0.01;

/// Unique identifier for an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExperimentId(pub Uuid);

impl ExperimentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExperimentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a variant within an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VariantId(pub Uuid);

impl VariantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for VariantId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for VariantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricId(pub Uuid);

impl MetricId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MetricId {
    fn default() -> Self {
        Self::new()
    }
}

/// Status of an experiment in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    /// Configured but not yet collecting traffic
    Draft,
    /// Actively collecting traffic and broadcasting snapshots
    Running,
    /// Traffic accrual and the duration countdown are frozen
    Paused,
    /// Reached the end of its configured duration
    Completed,
    /// Explicitly stopped before the duration elapsed
    Stopped,
}

impl ExperimentStatus {
    /// Check if a transition to another status is valid.
    pub fn can_transition_to(&self, target: &ExperimentStatus) -> bool {
        use ExperimentStatus::*;
        matches!(
            (self, target),
            (Draft, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Stopped)
                | (Paused, Stopped)
                | (Running, Completed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExperimentStatus::Completed | ExperimentStatus::Stopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Draft => "draft",
            ExperimentStatus::Running => "running",
            ExperimentStatus::Paused => "paused",
            ExperimentStatus::Completed => "completed",
            ExperimentStatus::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a metric measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Conversion,
    Engagement,
    Revenue,
}

/// Direction in which a metric should move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricGoal {
    Maximize,
    Minimize,
}

/// A measured goal attached to an experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    pub id: MetricId,
    pub name: String,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub goal: MetricGoal,
    pub baseline: f64,
    pub target: f64,
}

/// One arm of an experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    pub id: VariantId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Share of eligible traffic routed to this variant (0-100).
    pub traffic_percentage: f64,
    #[serde(default)]
    pub visitors: u64,
    #[serde(default)]
    pub conversions: u64,
    /// Derived: conversions / visitors, 0 when visitors = 0.
    #[serde(default)]
    pub conversion_rate: f64,
    /// Derived: certainty (0-100) that the difference vs control is real.
    #[serde(default)]
    pub confidence: f64,
    pub is_control: bool,
}

/// A configured comparison between two or more variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: ExperimentId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: ExperimentStatus,
    pub variants: Vec<Variant>,
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub target_audience: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    /// Planned run length in days.
    #[serde(rename = "duration")]
    pub duration_days: u32,
    /// Percent of total traffic eligible for the experiment (1-100).
    pub traffic_allocation: f64,
    /// Target confidence threshold for declaring a winner (80-99).
    pub confidence_level: f64,
    /// Derived: confidence associated with the winner, or the best
    /// comparison when no variant qualifies.
    #[serde(default)]
    pub statistical_significance: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<VariantId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Monotonic counter bumped on every state-affecting mutation; snapshots
    /// are ordered by it.
    pub version: u64,
    /// Set while the experiment is paused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    /// Accumulated paused wall time, excluded from the duration countdown.
    #[serde(default)]
    pub paused_secs: i64,
}

impl Experiment {
    /// Build a draft experiment from a validated spec, assigning ids.
    pub fn from_spec(spec: ExperimentSpec) -> Result<Self> {
        spec.validate()?;

        let now = Utc::now();
        let variants = spec
            .variants
            .into_iter()
            .map(|v| Variant {
                id: VariantId::new(),
                name: v.name,
                description: v.description,
                traffic_percentage: v.traffic_percentage,
                visitors: 0,
                conversions: 0,
                conversion_rate: 0.0,
                confidence: 0.0,
                is_control: v.is_control,
            })
            .collect();
        let metrics = spec
            .metrics
            .into_iter()
            .map(|m| Metric {
                id: MetricId::new(),
                name: m.name,
                metric_type: m.metric_type,
                goal: m.goal,
                baseline: m.baseline,
                target: m.target,
            })
            .collect();

        Ok(Self {
            id: ExperimentId::new(),
            name: spec.name,
            description: spec.description,
            status: ExperimentStatus::Draft,
            variants,
            metrics,
            target_audience: spec.target_audience,
            start_date: None,
            end_date: None,
            duration_days: spec.duration_days,
            traffic_allocation: spec.traffic_allocation,
            confidence_level: spec.confidence_level,
            statistical_significance: 0.0,
            winner: None,
            created_at: now,
            updated_at: now,
            version: 1,
            paused_at: None,
            paused_secs: 0,
        })
    }

    /// Record a state-affecting mutation: bump the version and refresh
    /// `updated_at`.
    pub fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }

    /// Move to a new status, enforcing the state machine.
    pub fn transition_to(&mut self, target: ExperimentStatus) -> Result<()> {
        if !self.status.can_transition_to(&target) {
            return Err(VantageError::invalid_transition(self.status, target));
        }
        self.status = target;
        Ok(())
    }

    pub fn variant(&self, id: VariantId) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == id)
    }

    pub fn variant_mut(&mut self, id: VariantId) -> Option<&mut Variant> {
        self.variants.iter_mut().find(|v| v.id == id)
    }

    pub fn control(&self) -> Option<&Variant> {
        self.variants.iter().find(|v| v.is_control)
    }

    /// Sum of variant traffic percentages.
    pub fn traffic_sum(&self) -> f64 {
        self.variants.iter().map(|v| v.traffic_percentage).sum()
    }

    /// Wall time spent running, excluding paused spans.
    pub fn elapsed_run_time(&self, now: DateTime<Utc>) -> Duration {
        let Some(start) = self.start_date else {
            return Duration::zero();
        };
        let mut paused = Duration::seconds(self.paused_secs);
        if let Some(paused_at) = self.paused_at {
            paused = paused + (now - paused_at);
        }
        let elapsed = (now - start) - paused;
        elapsed.max(Duration::zero())
    }

    /// Whether a running experiment has exhausted its configured duration.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == ExperimentStatus::Running
            && self.elapsed_run_time(now) >= Duration::days(i64::from(self.duration_days))
    }

    /// Preconditions for entering the running state: traffic percentages sum
    /// to 100 and exactly one control variant exists.
    pub fn validate_for_start(&self) -> Result<()> {
        let sum = self.traffic_sum();
        if (sum - 100.0).abs() > TRAFFIC_SUM_TOLERANCE {
            return Err(VantageError::validation(format!(
                "variant traffic percentages must sum to 100, got {sum}"
            )));
        }
        let controls = self.variants.iter().filter(|v| v.is_control).count();
        if controls != 1 {
            return Err(VantageError::validation(format!(
                "exactly one control variant is required, found {controls}"
            )));
        }
        Ok(())
    }
}

/// Payload used to create an experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub variants: Vec<VariantSpec>,
    pub metrics: Vec<MetricSpec>,
    #[serde(default)]
    pub target_audience: String,
    #[serde(rename = "duration", default = "default_duration_days")]
    pub duration_days: u32,
    #[serde(default = "default_traffic_allocation")]
    pub traffic_allocation: f64,
    #[serde(default = "default_confidence_level")]
    pub confidence_level: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub traffic_percentage: f64,
    #[serde(default)]
    pub is_control: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub goal: MetricGoal,
    #[serde(default)]
    pub baseline: f64,
    #[serde(default)]
    pub target: f64,
}

fn default_duration_days() -> u32 {
    14
}

fn default_traffic_allocation() -> f64 {
    100.0
}

fn default_confidence_level() -> f64 {
    95.0
}

impl ExperimentSpec {
    /// Shape validation applied on create.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(VantageError::missing_field("name"));
        }
        if self.variants.len() < 2 {
            return Err(VantageError::validation(
                "at least 2 variants are required",
            ));
        }
        if self.metrics.is_empty() {
            return Err(VantageError::validation("at least 1 metric is required"));
        }
        if !(1.0..=100.0).contains(&self.traffic_allocation) {
            return Err(VantageError::invalid_input(format!(
                "trafficAllocation must be between 1 and 100, got {}",
                self.traffic_allocation
            )));
        }
        if !(80.0..=99.0).contains(&self.confidence_level) {
            return Err(VantageError::invalid_input(format!(
                "confidenceLevel must be between 80 and 99, got {}",
                self.confidence_level
            )));
        }
        Ok(())
    }
}
