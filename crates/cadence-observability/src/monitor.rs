//! Phase-level performance monitor.
//!
//! Records timing and success/failure per phase, keeps bounded ring
//! buffers of recent metrics and alerts, and raises alerts when latency,
//! error-rate or cache-miss thresholds are crossed. One monitor instance
//! is injected per engine; it carries no process-wide state.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, warn};

use cadence_types::{
    AlertKind, AlertSeverity, PerformanceAlert, PerformanceSummary, PhaseBreakdown, PhaseKind,
    PhaseMetric,
};

pub const DEFAULT_MAX_STORED_METRICS: usize = 500;
pub const DEFAULT_MAX_STORED_ALERTS: usize = 100;

const HIGH_LATENCY_MS: u64 = 20_000;
const CRITICAL_LATENCY_MS: u64 = 30_000;
const TIMEOUT_RISK_MS: u64 = 25_000;
const ERROR_RATE_HIGH: f64 = 0.15;
const ERROR_RATE_CRITICAL: f64 = 0.3;
const ERROR_RATE_DECAY: f64 = 0.95;
const ERROR_RATE_STEP: f64 = 0.1;
const CACHE_MISS_ALERT_RATE: f64 = 0.8;
const CACHE_MISS_MIN_SAMPLES: u64 = 10;
const SUMMARY_ALERT_COUNT: usize = 10;

/// Opaque handle returned by [`PerformanceMonitor::start_phase`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhaseId(String);

impl PhaseId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug)]
struct OpenPhase {
    function: String,
    phase: PhaseKind,
    started_instant: Instant,
    started_at: chrono::DateTime<Utc>,
    metadata: Option<Value>,
}

#[derive(Debug, Default)]
struct CacheStats {
    miss_rate: f64,
    samples: u64,
}

#[derive(Debug)]
struct MonitorState {
    open_phases: HashMap<String, OpenPhase>,
    metrics: VecDeque<PhaseMetric>,
    alerts: VecDeque<PerformanceAlert>,
    error_rates: HashMap<String, f64>,
    cache_stats: HashMap<String, CacheStats>,
    max_metrics: usize,
    max_alerts: usize,
}

/// Cloneable handle over shared monitor state. All methods are plain
/// synchronous calls with logging side effects only.
#[derive(Clone)]
pub struct PerformanceMonitor {
    state: Arc<Mutex<MonitorState>>,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_STORED_METRICS, DEFAULT_MAX_STORED_ALERTS)
    }

    pub fn with_capacity(max_metrics: usize, max_alerts: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MonitorState {
                open_phases: HashMap::new(),
                metrics: VecDeque::new(),
                alerts: VecDeque::new(),
                error_rates: HashMap::new(),
                cache_stats: HashMap::new(),
                max_metrics: max_metrics.max(1),
                max_alerts: max_alerts.max(1),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        // A panic while holding the lock only loses bookkeeping; recover
        // the inner state rather than propagating the poison.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Opens a phase timing window. The returned id must be passed back
    /// to [`end_phase`](Self::end_phase).
    pub fn start_phase(
        &self,
        function: &str,
        phase: PhaseKind,
        metadata: Option<Value>,
    ) -> PhaseId {
        let id = format!("{function}-{phase}-{}", Utc::now().timestamp_millis());
        debug!(function, phase = %phase, id = %id, "phase started");
        self.lock().open_phases.insert(
            id.clone(),
            OpenPhase {
                function: function.to_string(),
                phase,
                started_instant: Instant::now(),
                started_at: Utc::now(),
                metadata,
            },
        );
        PhaseId(id)
    }

    /// Closes a phase and records its metric. Unknown or already-ended
    /// ids are tolerated as a no-op.
    pub fn end_phase(
        &self,
        id: &PhaseId,
        success: bool,
        error: Option<String>,
        metadata: Option<Value>,
    ) {
        let mut state = self.lock();
        let Some(open) = state.open_phases.remove(&id.0) else {
            return;
        };
        let duration = open.started_instant.elapsed();
        let metric = PhaseMetric {
            function: open.function,
            phase: open.phase,
            started_at: open.started_at,
            ended_at: Utc::now(),
            duration_ms: duration.as_millis() as u64,
            success,
            error,
            metadata: metadata.or(open.metadata),
        };
        ingest(&mut state, metric);
    }

    /// Records a single-shot remote call outside the phase abstraction.
    /// `cached` feeds the cache-hit bookkeeping when the call went
    /// through a response cache.
    pub fn record_call(
        &self,
        function: &str,
        phase: PhaseKind,
        duration: Duration,
        success: bool,
        error: Option<String>,
        cached: Option<bool>,
    ) {
        let ended_at = Utc::now();
        let duration_ms = duration.as_millis() as u64;
        let metric = PhaseMetric {
            function: function.to_string(),
            phase,
            started_at: ended_at - chrono::Duration::milliseconds(duration_ms as i64),
            ended_at,
            duration_ms,
            success,
            error,
            metadata: None,
        };
        let mut state = self.lock();
        if let Some(hit) = cached {
            record_cache_access(&mut state, function, hit);
        }
        ingest(&mut state, metric);
    }

    /// Aggregates retained metrics, optionally narrowed to one function.
    pub fn performance_summary(&self, function: Option<&str>) -> PerformanceSummary {
        let state = self.lock();
        let selected: Vec<&PhaseMetric> = state
            .metrics
            .iter()
            .filter(|m| function.map_or(true, |f| m.function == f))
            .collect();

        let total_calls = selected.len();
        let successes = selected.iter().filter(|m| m.success).count();
        let success_rate = if total_calls == 0 {
            1.0
        } else {
            successes as f64 / total_calls as f64
        };
        let average_duration_ms = if total_calls == 0 {
            0.0
        } else {
            selected.iter().map(|m| m.duration_ms as f64).sum::<f64>() / total_calls as f64
        };

        let mut phases: HashMap<PhaseKind, (f64, usize)> = HashMap::new();
        for metric in &selected {
            let entry = phases.entry(metric.phase).or_insert((0.0, 0));
            entry.0 += metric.duration_ms as f64;
            entry.1 += 1;
        }
        let mut phases: Vec<(PhaseKind, PhaseBreakdown)> = phases
            .into_iter()
            .map(|(phase, (total, count))| {
                (
                    phase,
                    PhaseBreakdown {
                        average_duration_ms: total / count as f64,
                        count,
                    },
                )
            })
            .collect();
        phases.sort_by_key(|(phase, _)| phase.as_str());

        let recent_alerts = state
            .alerts
            .iter()
            .rev()
            .take(SUMMARY_ALERT_COUNT)
            .cloned()
            .collect();

        PerformanceSummary {
            total_calls,
            success_rate,
            average_duration_ms,
            phases,
            recent_alerts,
        }
    }

    /// Rule-based advisories derived from the retained metrics for one
    /// function.
    pub fn optimization_recommendations(&self, function: &str) -> Vec<String> {
        let summary = self.performance_summary(Some(function));
        let (miss_rate, cache_samples) = {
            let state = self.lock();
            state
                .cache_stats
                .get(function)
                .map(|c| (c.miss_rate, c.samples))
                .unwrap_or((0.0, 0))
        };

        let mut recommendations = Vec::new();
        if summary.total_calls == 0 {
            recommendations
                .push(format!("no recorded calls for `{function}` yet; nothing to tune"));
            return recommendations;
        }
        if summary.average_duration_ms > 15_000.0 {
            recommendations.push(
                "average latency above 15s: lower the polling attempt budget or move long runs to a background queue"
                    .to_string(),
            );
        }
        if summary.success_rate < 0.85 {
            recommendations.push(
                "success rate below 85%: add a circuit breaker in front of the backend and retry with jitter"
                    .to_string(),
            );
        }
        if cache_samples >= CACHE_MISS_MIN_SAMPLES && miss_rate > CACHE_MISS_ALERT_RATE {
            recommendations.push(
                "cache miss rate above 80%: widen the response cache key or raise its TTL"
                    .to_string(),
            );
        }
        let has_recent_critical = summary
            .recent_alerts
            .iter()
            .any(|a| a.severity == AlertSeverity::Critical);
        if has_recent_critical {
            recommendations.push(
                "critical latency alerts recorded: raise timeout_ms or reduce per-phase work"
                    .to_string(),
            );
        }
        recommendations
    }

    /// Retained metric count, oldest first capped at the buffer size.
    pub fn stored_metrics(&self) -> Vec<PhaseMetric> {
        self.lock().metrics.iter().cloned().collect()
    }

    pub fn stored_alerts(&self) -> Vec<PerformanceAlert> {
        self.lock().alerts.iter().cloned().collect()
    }
}

fn ingest(state: &mut MonitorState, metric: PhaseMetric) {
    update_error_rate(state, &metric);
    check_latency_thresholds(state, &metric);
    if metric.success {
        debug!(
            function = %metric.function,
            phase = %metric.phase,
            duration_ms = metric.duration_ms,
            "phase completed"
        );
    } else {
        warn!(
            function = %metric.function,
            phase = %metric.phase,
            duration_ms = metric.duration_ms,
            error = metric.error.as_deref().unwrap_or(""),
            "phase failed"
        );
    }
    state.metrics.push_back(metric);
    while state.metrics.len() > state.max_metrics {
        state.metrics.pop_front();
    }
}

fn update_error_rate(state: &mut MonitorState, metric: &PhaseMetric) {
    let rate = state
        .error_rates
        .entry(metric.function.clone())
        .or_insert(0.0);
    if metric.success {
        *rate *= ERROR_RATE_DECAY;
    } else {
        *rate = (*rate + ERROR_RATE_STEP).min(1.0);
    }
    let rate = *rate;

    // Only a failing call can push the rate up past a threshold, so the
    // spike alert fires on failures alone.
    if !metric.success && rate > ERROR_RATE_HIGH {
        let severity = if rate > ERROR_RATE_CRITICAL {
            AlertSeverity::Critical
        } else {
            AlertSeverity::High
        };
        push_alert(
            state,
            AlertKind::ErrorSpike,
            severity,
            format!(
                "error rate for `{}` climbed to {:.0}%",
                metric.function,
                rate * 100.0
            ),
            json!({ "function": metric.function, "error_rate": rate }),
        );
    }
}

fn check_latency_thresholds(state: &mut MonitorState, metric: &PhaseMetric) {
    if metric.duration_ms > HIGH_LATENCY_MS {
        let severity = if metric.duration_ms > CRITICAL_LATENCY_MS {
            AlertSeverity::Critical
        } else {
            AlertSeverity::High
        };
        push_alert(
            state,
            AlertKind::HighLatency,
            severity,
            format!(
                "phase {} of `{}` took {}ms",
                metric.phase, metric.function, metric.duration_ms
            ),
            json!({
                "function": metric.function,
                "phase": metric.phase.as_str(),
                "duration_ms": metric.duration_ms,
            }),
        );
    }
    if metric.duration_ms > TIMEOUT_RISK_MS {
        push_alert(
            state,
            AlertKind::TimeoutRisk,
            AlertSeverity::Critical,
            format!(
                "phase {} of `{}` is approaching the timeout ceiling ({}ms)",
                metric.phase, metric.function, metric.duration_ms
            ),
            json!({
                "function": metric.function,
                "phase": metric.phase.as_str(),
                "duration_ms": metric.duration_ms,
            }),
        );
    }
}

fn record_cache_access(state: &mut MonitorState, function: &str, hit: bool) {
    let stats = state.cache_stats.entry(function.to_string()).or_default();
    stats.samples += 1;
    if hit {
        stats.miss_rate *= ERROR_RATE_DECAY;
    } else {
        stats.miss_rate = (stats.miss_rate + ERROR_RATE_STEP).min(1.0);
    }
    let (miss_rate, samples) = (stats.miss_rate, stats.samples);

    if !hit && samples >= CACHE_MISS_MIN_SAMPLES && miss_rate > CACHE_MISS_ALERT_RATE {
        push_alert(
            state,
            AlertKind::CacheMissRate,
            AlertSeverity::Medium,
            format!(
                "cache miss rate for `{function}` climbed to {:.0}%",
                miss_rate * 100.0
            ),
            json!({ "function": function, "miss_rate": miss_rate, "samples": samples }),
        );
    }
}

fn push_alert(
    state: &mut MonitorState,
    kind: AlertKind,
    severity: AlertSeverity,
    message: String,
    metadata: Value,
) {
    warn!(kind = kind.as_str(), severity = ?severity, %message, "performance alert");
    state.alerts.push_back(PerformanceAlert {
        kind,
        message,
        severity,
        timestamp: Utc::now(),
        metadata,
    });
    while state.alerts.len() > state.max_alerts {
        state.alerts.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(
        monitor: &PerformanceMonitor,
        function: &str,
        duration_ms: u64,
        success: bool,
    ) {
        monitor.record_call(
            function,
            PhaseKind::Polling,
            Duration::from_millis(duration_ms),
            success,
            if success { None } else { Some("boom".to_string()) },
            None,
        );
    }

    #[test]
    fn start_end_phase_records_one_metric() {
        let monitor = PerformanceMonitor::new();
        let id = monitor.start_phase("run_turn", PhaseKind::ThreadCreation, None);
        monitor.end_phase(&id, true, None, Some(json!({ "thread": "t1" })));

        let metrics = monitor.stored_metrics();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].function, "run_turn");
        assert_eq!(metrics[0].phase, PhaseKind::ThreadCreation);
        assert!(metrics[0].success);
        assert_eq!(metrics[0].metadata, Some(json!({ "thread": "t1" })));
    }

    #[test]
    fn end_phase_with_unknown_id_is_a_no_op() {
        let monitor = PerformanceMonitor::new();
        let id = monitor.start_phase("run_turn", PhaseKind::Polling, None);
        monitor.end_phase(&id, true, None, None);
        // double end: tolerated, nothing new recorded
        monitor.end_phase(&id, false, Some("late".to_string()), None);
        assert_eq!(monitor.stored_metrics().len(), 1);
    }

    #[test]
    fn ring_buffer_evicts_oldest_metrics_first() {
        let monitor = PerformanceMonitor::with_capacity(5, 10);
        for i in 0..8u64 {
            monitor.record_call(
                &format!("fn_{i}"),
                PhaseKind::Polling,
                Duration::from_millis(i),
                true,
                None,
                None,
            );
        }
        let metrics = monitor.stored_metrics();
        assert_eq!(metrics.len(), 5);
        // oldest three evicted, most recent retained in order
        assert_eq!(metrics[0].function, "fn_3");
        assert_eq!(metrics[4].function, "fn_7");
    }

    #[test]
    fn latency_21s_raises_exactly_one_high_latency_alert() {
        let monitor = PerformanceMonitor::new();
        call(&monitor, "poll_run_completion", 21_000, true);

        let alerts = monitor.stored_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::HighLatency);
        assert_eq!(alerts[0].severity, AlertSeverity::High);
    }

    #[test]
    fn latency_31s_raises_critical_latency_and_timeout_risk() {
        let monitor = PerformanceMonitor::new();
        call(&monitor, "poll_run_completion", 31_000, true);

        let alerts = monitor.stored_alerts();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].kind, AlertKind::HighLatency);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
        assert_eq!(alerts[1].kind, AlertKind::TimeoutRisk);
        assert_eq!(alerts[1].severity, AlertSeverity::Critical);
    }

    #[test]
    fn repeated_failures_raise_error_spike_with_escalating_severity() {
        let monitor = PerformanceMonitor::new();
        // two failures: rate 0.1 then 0.2 -> first alert is HIGH
        call(&monitor, "fetch", 10, false);
        call(&monitor, "fetch", 10, false);
        let alerts = monitor.stored_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::ErrorSpike);
        assert_eq!(alerts[0].severity, AlertSeverity::High);

        // two more failures push the rate past 0.3 -> CRITICAL
        call(&monitor, "fetch", 10, false);
        call(&monitor, "fetch", 10, false);
        let alerts = monitor.stored_alerts();
        assert_eq!(alerts.last().expect("alert").severity, AlertSeverity::Critical);
    }

    #[test]
    fn successes_decay_the_error_rate_without_alerting() {
        let monitor = PerformanceMonitor::new();
        call(&monitor, "fetch", 10, false);
        call(&monitor, "fetch", 10, false);
        let alerts_after_failures = monitor.stored_alerts().len();
        for _ in 0..20 {
            call(&monitor, "fetch", 10, true);
        }
        assert_eq!(monitor.stored_alerts().len(), alerts_after_failures);
    }

    #[test]
    fn cache_misses_alert_only_after_enough_samples() {
        let monitor = PerformanceMonitor::new();
        for _ in 0..9 {
            monitor.record_call(
                "cached_fetch",
                PhaseKind::ResponseFormatting,
                Duration::from_millis(5),
                true,
                None,
                Some(false),
            );
        }
        assert!(monitor
            .stored_alerts()
            .iter()
            .all(|a| a.kind != AlertKind::CacheMissRate));

        monitor.record_call(
            "cached_fetch",
            PhaseKind::ResponseFormatting,
            Duration::from_millis(5),
            true,
            None,
            Some(false),
        );
        assert!(monitor
            .stored_alerts()
            .iter()
            .any(|a| a.kind == AlertKind::CacheMissRate));
    }

    #[test]
    fn summary_aggregates_per_phase_and_filters_by_function() {
        let monitor = PerformanceMonitor::new();
        monitor.record_call("a", PhaseKind::Polling, Duration::from_millis(100), true, None, None);
        monitor.record_call("a", PhaseKind::Polling, Duration::from_millis(300), false, Some("x".to_string()), None);
        monitor.record_call(
            "a",
            PhaseKind::ThreadCreation,
            Duration::from_millis(50),
            true,
            None,
            None,
        );
        monitor.record_call("b", PhaseKind::Polling, Duration::from_millis(900), true, None, None);

        let summary = monitor.performance_summary(Some("a"));
        assert_eq!(summary.total_calls, 3);
        assert!((summary.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((summary.average_duration_ms - 150.0).abs() < 1e-9);
        let polling = summary
            .phases
            .iter()
            .find(|(phase, _)| *phase == PhaseKind::Polling)
            .map(|(_, b)| b)
            .expect("polling breakdown");
        assert_eq!(polling.count, 2);
        assert!((polling.average_duration_ms - 200.0).abs() < 1e-9);

        let all = monitor.performance_summary(None);
        assert_eq!(all.total_calls, 4);
    }

    #[test]
    fn summary_keeps_only_ten_most_recent_alerts() {
        let monitor = PerformanceMonitor::new();
        for _ in 0..15 {
            call(&monitor, "slow", 21_000, true);
        }
        let summary = monitor.performance_summary(None);
        assert_eq!(summary.recent_alerts.len(), 10);
    }

    #[test]
    fn recommendations_cover_latency_and_success_rules() {
        let monitor = PerformanceMonitor::new();
        assert_eq!(monitor.optimization_recommendations("quiet").len(), 1);

        for _ in 0..4 {
            call(&monitor, "slow", 16_000, true);
        }
        let recs = monitor.optimization_recommendations("slow");
        assert!(recs.iter().any(|r| r.contains("average latency above 15s")));

        for _ in 0..4 {
            call(&monitor, "flaky", 10, false);
        }
        let recs = monitor.optimization_recommendations("flaky");
        assert!(recs.iter().any(|r| r.contains("success rate below 85%")));
    }
}
