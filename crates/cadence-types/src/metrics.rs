use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Named stage of a conversational turn, tracked independently for
/// latency and alerting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    ThreadCreation,
    RunCreation,
    Polling,
    ResponseFormatting,
}

impl PhaseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseKind::ThreadCreation => "thread_creation",
            PhaseKind::RunCreation => "run_creation",
            PhaseKind::Polling => "polling",
            PhaseKind::ResponseFormatting => "response_formatting",
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One completed phase execution. Created frozen when the phase ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseMetric {
    pub function: String,
    pub phase: PhaseKind,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    TimeoutRisk,
    HighLatency,
    ErrorSpike,
    CacheMissRate,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::TimeoutRisk => "timeout_risk",
            AlertKind::HighLatency => "high_latency",
            AlertKind::ErrorSpike => "error_spike",
            AlertKind::CacheMissRate => "cache_miss_rate",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// A detected threshold violation. Appended to a bounded buffer and
/// never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceAlert {
    pub kind: AlertKind,
    pub message: String,
    pub severity: AlertSeverity,
    pub timestamp: DateTime<Utc>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PhaseBreakdown {
    pub average_duration_ms: f64,
    pub count: usize,
}

/// Aggregated view over the monitor's retained metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub total_calls: usize,
    pub success_rate: f64,
    pub average_duration_ms: f64,
    pub phases: Vec<(PhaseKind, PhaseBreakdown)>,
    pub recent_alerts: Vec<PerformanceAlert>,
}
