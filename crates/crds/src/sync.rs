//! Sync status types
//!
//! Shared between the node state status and the result file written by the
//! one-shot systemd service.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
/// Outcome of a reconciliation
///
/// Serializes as PascalCase ("InProgress", "Succeeded", "Failed"). The
/// spaced "In Progress" spelling is still accepted on read.
#[serde(rename_all = "PascalCase")]
pub enum SyncStatus {
    /// Configuration is being applied
    #[default]
    #[serde(alias = "In Progress")]
    InProgress,

    /// Last generation was applied
    Succeeded,

    /// Last generation failed
    Failed,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncStatus::InProgress => "InProgress",
            SyncStatus::Succeeded => "Succeeded",
            SyncStatus::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Result of an out-of-process configuration run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    /// Generation the result belongs to
    #[serde(default)]
    pub generation: i64,

    /// Outcome
    #[serde(default)]
    pub sync_status: SyncStatus,

    /// Error text when the run failed
    #[serde(default)]
    pub last_sync_error: String,
}

impl SyncResult {
    /// Whether the run reported a failure.
    pub fn is_failed(&self) -> bool {
        self.sync_status == SyncStatus::Failed
    }
}
