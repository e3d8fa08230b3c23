//! Immutable, sequenced stage outputs.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::stage::StageKind;

/// One stage output. `sequence_id` is assigned by the artifact store and is
/// unique and increasing per stage kind; the artifact with the highest
/// `sequence_id` for a stage is that stage's current artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub stage_kind: StageKind,
    pub sequence_id: u64,
    pub created_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Artifact {
    /// Decode the payload into a typed stage payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    /// `stage#seq`, used in logs and the CLI.
    pub fn label(&self) -> String {
        format!("{}#{}", self.stage_kind, self.sequence_id)
    }
}
