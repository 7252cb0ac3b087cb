use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a run. Once a run reaches `Running`, it only moves
/// forward to one of the terminal states; the single exception is a queued
/// run cancelled before it ever starts, which goes straight to `RunFail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    BuildFail,
    RunFail,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::BuildFail | RunStatus::RunFail
        )
    }
}

/// JSON payload of the `run_data` column of a run row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunData {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunData {
    pub fn queued() -> Self {
        Self {
            status: RunStatus::Queued,
            started_at: None,
            finished_at: None,
        }
    }
}
