use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::polling::PollingResult;

/// One conversational turn to drive against the assistant backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub message: String,
    /// Existing thread to continue; a new thread is created when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Correlates the turn across log lines and metrics.
    #[serde(default = "new_correlation_id")]
    pub correlation_id: String,
}

fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

impl TurnRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            thread_id: None,
            model: None,
            correlation_id: new_correlation_id(),
        }
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }
}

/// Everything the caller gets back from a driven turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResult {
    pub reply: String,
    pub thread_id: String,
    pub run_id: String,
    pub polling: PollingResult,
}
