//! Adaptive run polling.
//!
//! Drives one assistant run to a terminal state by re-checking its
//! status with a status-aware inter-poll delay: fast while the run is
//! expected to move soon, backed off once it has been working for a
//! while. The wall clock is the hard bound; the attempt budget is the
//! soft one.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn, Level};

use cadence_observability::{emit_run_event, PerformanceMonitor, ProcessKind, RunEvent};
use cadence_providers::SharedBackend;
use cadence_types::{PhaseKind, PollStatus, PollingConfig, PollingResult, RunStatus};

/// Elapsed time past which the loop stops polling tightly no matter
/// what the status-specific rule says.
const LONG_RUN_ELAPSED_MS: u64 = 30_000;
const LONG_RUN_FLOOR_MS: u64 = 300;

/// A queued run is polled fast for this many attempts, assuming quick
/// dequeue, then at the relaxed queued cadence.
const QUEUED_FAST_ATTEMPTS: u32 = 3;
const QUEUED_FAST_MS: u64 = 50;
const QUEUED_SLOW_MS: u64 = 150;
const REQUIRES_ACTION_MS: u64 = 100;

pub(crate) const RETRY_BACKOFF_STEP_MS: u64 = 1_000;
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Polls assistant runs against one backend, reporting timing to the
/// injected monitor.
#[derive(Clone)]
pub struct RunPoller {
    backend: SharedBackend,
    monitor: PerformanceMonitor,
}

impl RunPoller {
    pub fn new(backend: SharedBackend, monitor: PerformanceMonitor) -> Self {
        Self { backend, monitor }
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    /// Polls `run_id` until it completes, fails, times out, or the
    /// attempt budget runs out. Expected failure modes come back in the
    /// result, never as an error: a fetch that blows up mid-loop is
    /// logged and treated as an `unknown` status read.
    pub async fn poll_run_completion(
        &self,
        thread_id: &str,
        run_id: &str,
        config: &PollingConfig,
    ) -> PollingResult {
        let started = Instant::now();
        let mut attempts: u32 = 0;
        let mut status = RunStatus::Queued;
        let mut current_interval = config.initial_interval();
        let mut first_iteration = true;

        while attempts < config.max_attempts && !status.is_terminal() {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            if elapsed_ms > config.timeout_ms {
                emit_run_event(
                    Level::WARN,
                    ProcessKind::Engine,
                    RunEvent {
                        event: "poll.timeout",
                        component: "core.poller",
                        correlation_id: None,
                        thread_id: Some(thread_id),
                        run_id: Some(run_id),
                        status: Some(status.as_str()),
                        attempts: Some(attempts),
                        error_code: Some("POLL_TIMEOUT"),
                        detail: None,
                    },
                );
                return PollingResult::failure(
                    PollStatus::TimedOut,
                    attempts,
                    elapsed_ms,
                    format!("timeout after {}ms", config.timeout_ms),
                );
            }

            if !first_iteration {
                tokio::time::sleep(current_interval).await;
            }
            first_iteration = false;

            match self.backend.run_status(thread_id, run_id).await {
                Ok(observed) => {
                    attempts += 1;
                    status = observed;
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    // Remaining-time estimate only means something once
                    // the run is actually executing.
                    let estimated_remaining_ms = (status == RunStatus::InProgress)
                        .then(|| config.timeout_ms.saturating_sub(elapsed_ms));
                    debug!(
                        thread_id,
                        run_id,
                        status = %status,
                        attempts,
                        elapsed_ms,
                        estimated_remaining_ms,
                        "run status observed"
                    );
                }
                Err(err) => {
                    warn!(
                        thread_id,
                        run_id,
                        attempts,
                        error = %err,
                        "status fetch failed, treating as unknown"
                    );
                    status = RunStatus::Unknown;
                    if config.count_failed_fetches {
                        attempts += 1;
                    }
                }
            }

            if status == RunStatus::RequiresAction {
                self.acknowledge_required_action(thread_id, run_id).await;
            }

            current_interval = next_interval(status, attempts, started.elapsed(), config);
        }

        let total_time_ms = started.elapsed().as_millis() as u64;
        match status {
            RunStatus::Completed => {
                info!(thread_id, run_id, attempts, total_time_ms, "run completed");
                PollingResult::completed(attempts, total_time_ms)
            }
            RunStatus::Failed => {
                warn!(thread_id, run_id, attempts, total_time_ms, "run failed");
                PollingResult::failure(
                    PollStatus::Run(RunStatus::Failed),
                    attempts,
                    total_time_ms,
                    "run failed",
                )
            }
            other => PollingResult::failure(
                PollStatus::Run(other),
                attempts,
                total_time_ms,
                format!("run not completed after {attempts} attempts"),
            ),
        }
    }

    /// Up to `max_retries + 1` full polling attempts with linear
    /// backoff in between. Returns the first success, or the last
    /// result once retries are exhausted.
    pub async fn poll_with_retry(
        &self,
        thread_id: &str,
        run_id: &str,
        config: &PollingConfig,
        max_retries: u32,
    ) -> PollingResult {
        let mut last: Option<PollingResult> = None;
        for attempt in 0..=max_retries {
            if attempt > 0 {
                let backoff = Duration::from_millis(RETRY_BACKOFF_STEP_MS * attempt as u64);
                debug!(thread_id, run_id, attempt, backoff_ms = backoff.as_millis() as u64, "retrying run polling");
                tokio::time::sleep(backoff).await;
            }
            let result = self.poll_run_completion(thread_id, run_id, config).await;
            if result.success {
                return result;
            }
            warn!(
                thread_id,
                run_id,
                attempt,
                status = %result.status,
                "polling attempt unsuccessful"
            );
            last = Some(result);
        }
        last.unwrap_or_else(|| {
            PollingResult::failure(PollStatus::Error, 0, 0, "no polling attempt executed")
        })
    }

    /// A run stuck in `requires_action` is waiting on tool results this
    /// system does not produce; an empty acknowledgment lets it proceed
    /// to completion or failure on its own. Errors here never abort the
    /// poll loop.
    async fn acknowledge_required_action(&self, thread_id: &str, run_id: &str) {
        let started = std::time::Instant::now();
        let result = self.backend.submit_tool_outputs(thread_id, run_id, &[]).await;
        let error = result.as_ref().err().map(|err| err.to_string());
        if let Some(error) = &error {
            warn!(
                thread_id,
                run_id,
                error,
                "tool output acknowledgment failed, polling continues"
            );
        }
        self.monitor.record_call(
            "submit_tool_outputs",
            PhaseKind::Polling,
            started.elapsed(),
            error.is_none(),
            error,
            None,
        );
    }
}

/// Status-aware inter-poll delay.
///
/// Tiered heuristics for the statuses with predictable dynamics, a
/// bounded exponential backoff for everything else, and a global floor
/// once the run has been going for over thirty seconds.
pub fn next_interval(
    status: RunStatus,
    attempts: u32,
    elapsed: Duration,
    config: &PollingConfig,
) -> Duration {
    let ms: u64 = match status {
        RunStatus::Queued => {
            if attempts <= QUEUED_FAST_ATTEMPTS {
                QUEUED_FAST_MS
            } else {
                QUEUED_SLOW_MS
            }
        }
        RunStatus::InProgress => match attempts {
            0..=4 => 75,
            5..=14 => 150,
            15..=29 => 250,
            _ => 400,
        },
        RunStatus::RequiresAction => REQUIRES_ACTION_MS,
        RunStatus::Completed | RunStatus::Failed | RunStatus::Unknown => {
            let backoff =
                config.initial_interval_ms as f64 * config.backoff_factor.powi(attempts as i32);
            backoff.min(config.max_interval_ms as f64).round() as u64
        }
    };

    let ms = if elapsed.as_millis() as u64 > LONG_RUN_ELAPSED_MS {
        ms.max(LONG_RUN_FLOOR_MS)
    } else {
        ms
    };
    Duration::from_millis(ms)
}
