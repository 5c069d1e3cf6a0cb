use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of an assistant run as reported by the backend.
///
/// Backends report free-form strings; anything outside the known set
/// folds into `Unknown` so the poll loop never has to reason about
/// vendor-specific values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Completed,
    Failed,
    Unknown,
}

impl RunStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "queued" => RunStatus::Queued,
            "in_progress" => RunStatus::InProgress,
            "requires_action" => RunStatus::RequiresAction,
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            _ => RunStatus::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::InProgress => "in_progress",
            RunStatus::RequiresAction => "requires_action",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Unknown => "unknown",
        }
    }

    /// A terminal run never transitions again.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status slot of a [`PollingResult`]: the last observed run status, or
/// one of the two sentinels for attempts that ended abnormally. On the
/// wire it is the flat status string (`completed`, `timeout`, ...).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(into = "String", from = "String")]
pub enum PollStatus {
    Run(RunStatus),
    TimedOut,
    Error,
}

impl PollStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PollStatus::Run(status) => status.as_str(),
            PollStatus::TimedOut => "timeout",
            PollStatus::Error => "error",
        }
    }
}

impl From<PollStatus> for String {
    fn from(status: PollStatus) -> Self {
        status.as_str().to_string()
    }
}

impl From<String> for PollStatus {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "timeout" => PollStatus::TimedOut,
            "error" => PollStatus::Error,
            other => PollStatus::Run(RunStatus::parse(other)),
        }
    }
}

impl fmt::Display for PollStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<RunStatus> for PollStatus {
    fn from(status: RunStatus) -> Self {
        PollStatus::Run(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_maps_known_statuses() {
        assert_eq!(RunStatus::parse("queued"), RunStatus::Queued);
        assert_eq!(RunStatus::parse("in_progress"), RunStatus::InProgress);
        assert_eq!(RunStatus::parse("requires_action"), RunStatus::RequiresAction);
        assert_eq!(RunStatus::parse("completed"), RunStatus::Completed);
        assert_eq!(RunStatus::parse("failed"), RunStatus::Failed);
    }

    #[test]
    fn parse_folds_vendor_values_into_unknown() {
        assert_eq!(RunStatus::parse("cancelling"), RunStatus::Unknown);
        assert_eq!(RunStatus::parse("expired"), RunStatus::Unknown);
        assert_eq!(RunStatus::parse(""), RunStatus::Unknown);
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::InProgress.is_terminal());
        assert!(!RunStatus::RequiresAction.is_terminal());
        assert!(!RunStatus::Unknown.is_terminal());
    }

    #[test]
    fn poll_status_sentinels_have_wire_spellings() {
        assert_eq!(PollStatus::TimedOut.as_str(), "timeout");
        assert_eq!(PollStatus::Error.as_str(), "error");
        assert_eq!(PollStatus::from(RunStatus::Completed).as_str(), "completed");
    }

    #[test]
    fn poll_status_serializes_as_the_flat_string() {
        let json = serde_json::to_string(&PollStatus::TimedOut).expect("json");
        assert_eq!(json, "\"timeout\"");
        let json = serde_json::to_string(&PollStatus::Run(RunStatus::InProgress)).expect("json");
        assert_eq!(json, "\"in_progress\"");

        let parsed: PollStatus = serde_json::from_str("\"error\"").expect("parse");
        assert_eq!(parsed, PollStatus::Error);
        let parsed: PollStatus = serde_json::from_str("\"failed\"").expect("parse");
        assert_eq!(parsed, PollStatus::Run(RunStatus::Failed));
    }
}
