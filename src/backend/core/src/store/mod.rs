//! Experiment persistence.
//!
//! The engine treats the store as an external collaborator behind the
//! [`ExperimentStore`] trait; the in-process [`MemoryStore`] is the shipped
//! implementation. All reads hand out owned clones (copy-on-read), so a
//! caller never observes a record mid-mutation.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::experiment::{Experiment, ExperimentId, ExperimentStatus};

/// Filter for list queries.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListFilter {
    pub status: Option<ExperimentStatus>,
}

/// Keyed persistence for experiment records.
#[async_trait]
pub trait ExperimentStore: Send + Sync {
    /// Insert a new record.
    async fn create(&self, experiment: Experiment) -> Result<Experiment>;

    /// Fetch a record by id.
    async fn get(&self, id: ExperimentId) -> Result<Option<Experiment>>;

    /// List records matching the filter, ordered by creation time.
    async fn list(&self, filter: ListFilter) -> Result<Vec<Experiment>>;

    /// Replace an existing record.
    async fn update(&self, experiment: Experiment) -> Result<Experiment>;

    /// Remove a record, returning it if it existed.
    async fn delete(&self, id: ExperimentId) -> Result<Option<Experiment>>;
}
