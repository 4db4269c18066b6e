//! In-process experiment store backed by a concurrent map.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{ExperimentStore, ListFilter};
use crate::error::{Result, VantageError};
use crate::experiment::{Experiment, ExperimentId};

/// Concurrent in-memory store. Cheap to clone record-wise: every read
/// returns an owned copy of the stored record.
#[derive(Debug, Default)]
pub struct MemoryStore {
    experiments: DashMap<ExperimentId, Experiment>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.experiments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty()
    }
}

#[async_trait]
impl ExperimentStore for MemoryStore {
    async fn create(&self, experiment: Experiment) -> Result<Experiment> {
        self.experiments.insert(experiment.id, experiment.clone());
        Ok(experiment)
    }

    async fn get(&self, id: ExperimentId) -> Result<Option<Experiment>> {
        Ok(self.experiments.get(&id).map(|entry| entry.value().clone()))
    }

    async fn list(&self, filter: ListFilter) -> Result<Vec<Experiment>> {
        let mut experiments: Vec<Experiment> = self
            .experiments
            .iter()
            .filter(|entry| match filter.status {
                Some(status) => entry.value().status == status,
                None => true,
            })
            .map(|entry| entry.value().clone())
            .collect();
        experiments.sort_by_key(|e| e.created_at);
        Ok(experiments)
    }

    async fn update(&self, experiment: Experiment) -> Result<Experiment> {
        if !self.experiments.contains_key(&experiment.id) {
            return Err(VantageError::experiment_not_found(experiment.id));
        }
        self.experiments.insert(experiment.id, experiment.clone());
        Ok(experiment)
    }

    async fn delete(&self, id: ExperimentId) -> Result<Option<Experiment>> {
        Ok(self.experiments.remove(&id).map(|(_, experiment)| experiment))
    }
}
