//! Command event model

use crate::git::DiffMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Stable identity of a command text: hex SHA-256 of its bytes.
pub fn command_hash(command: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(command.as_bytes());
    hex::encode(hasher.finalize())
}

/// Why a command never saw its EXIT line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncompleteReason {
    /// A new CMD arrived first (e.g. the command was killed before the
    /// completion hook could run)
    Superseded,
    /// The session ended with the command still open
    SessionEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Completed,
    Incomplete { reason: IncompleteReason },
}

/// One command's execution record, as handed to the event sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEvent {
    pub id: Uuid,
    pub session_id: Uuid,
    /// Per-session generation number assigned when the CMD line arrived
    pub sequence: u64,
    pub command: String,
    /// [`command_hash`] of `command`
    #[serde(default)]
    pub command_hash: String,
    pub started_at: DateTime<Utc>,
    /// Present only for completed events
    pub exit_code: Option<i32>,
    pub duration_ms: Option<u64>,
    /// Working directory at completion
    pub cwd: Option<String>,
    pub status: EventStatus,
    /// Uncommitted changes in the repository at `cwd` when the command
    /// finished, if collected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<DiffMetrics>,
}

impl CommandEvent {
    pub fn is_completed(&self) -> bool {
        self.status == EventStatus::Completed
    }

    pub fn incomplete_reason(&self) -> Option<IncompleteReason> {
        match self.status {
            EventStatus::Completed => None,
            EventStatus::Incomplete { reason } => Some(reason),
        }
    }
}
