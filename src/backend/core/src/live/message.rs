//! Event envelope carried on the live channel.

use serde::{Deserialize, Serialize};

use crate::experiment::Experiment;

/// Envelope for events on the `/experiments/{id}/live` stream.
///
/// The tag is carried in a `type` field, so a snapshot serializes as
/// `{"type":"experiment","experiment":{...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LiveEvent {
    /// A full experiment snapshot with freshly derived statistics.
    Experiment { experiment: Experiment },

    /// A non-fatal stream-level error.
    Error { message: String },
}
