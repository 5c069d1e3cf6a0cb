//! Conversational-turn driver.
//!
//! Runs one user message end to end: thread, message, run, poll,
//! reply. Each stage is tracked as its own monitor phase so slow or
//! failing stages show up independently in summaries and alerts.

use std::time::Duration;

use serde_json::json;
use tracing::{warn, Level};

use cadence_observability::{emit_run_event, redact_text, ProcessKind, RunEvent};
use cadence_types::{PhaseKind, PollStatus, PollingConfig, PollingResult, TurnRequest, TurnResult};

use crate::poller::{RunPoller, RETRY_BACKOFF_STEP_MS};

const TURN_FN: &str = "run_turn";

impl RunPoller {
    /// Drives one turn to a final reply. Driver failures (thread,
    /// message or run creation, reply retrieval) are errors; a run that
    /// polls to an unsuccessful outcome is not: the caller gets the
    /// `PollingResult` and an empty reply.
    pub async fn run_turn(
        &self,
        request: &TurnRequest,
        config: &PollingConfig,
    ) -> anyhow::Result<TurnResult> {
        emit_run_event(
            Level::INFO,
            ProcessKind::Engine,
            RunEvent {
                event: "turn.start",
                component: "core.turn",
                correlation_id: Some(&request.correlation_id),
                thread_id: request.thread_id.as_deref(),
                run_id: None,
                status: None,
                attempts: None,
                error_code: None,
                detail: Some(&redact_text(&request.message)),
            },
        );

        let phase = self.monitor().start_phase(
            TURN_FN,
            PhaseKind::ThreadCreation,
            Some(json!({ "correlation_id": request.correlation_id })),
        );
        let thread_id = match &request.thread_id {
            Some(id) => {
                self.monitor()
                    .end_phase(&phase, true, None, Some(json!({ "reused": true })));
                id.clone()
            }
            None => match self.backend().create_thread().await {
                Ok(id) => {
                    self.monitor()
                        .end_phase(&phase, true, None, Some(json!({ "thread_id": id })));
                    id
                }
                Err(err) => {
                    self.monitor()
                        .end_phase(&phase, false, Some(err.to_string()), None);
                    return Err(err.context("thread creation failed"));
                }
            },
        };

        let phase = self
            .monitor()
            .start_phase(TURN_FN, PhaseKind::RunCreation, None);
        let created = async {
            self.backend()
                .add_message(&thread_id, &request.message)
                .await?;
            self.backend()
                .create_run(&thread_id, request.model.as_deref())
                .await
        }
        .await;
        let run_id = match created {
            Ok(id) => {
                self.monitor()
                    .end_phase(&phase, true, None, Some(json!({ "run_id": id })));
                id
            }
            Err(err) => {
                self.monitor()
                    .end_phase(&phase, false, Some(err.to_string()), None);
                return Err(err.context("run creation failed"));
            }
        };

        let phase = self.monitor().start_phase(
            TURN_FN,
            PhaseKind::Polling,
            Some(json!({ "run_id": run_id })),
        );
        let polling = self.poll_run_completion(&thread_id, &run_id, config).await;
        self.monitor().end_phase(
            &phase,
            polling.success,
            polling.error.clone(),
            Some(json!({ "attempts": polling.attempts, "status": polling.status.as_str() })),
        );

        if !polling.success {
            emit_run_event(
                Level::WARN,
                ProcessKind::Engine,
                RunEvent {
                    event: "turn.run_unsuccessful",
                    component: "core.turn",
                    correlation_id: Some(&request.correlation_id),
                    thread_id: Some(&thread_id),
                    run_id: Some(&run_id),
                    status: Some(polling.status.as_str()),
                    attempts: Some(polling.attempts),
                    error_code: None,
                    detail: polling.error.as_deref(),
                },
            );
            return Ok(TurnResult {
                reply: String::new(),
                thread_id,
                run_id,
                polling,
            });
        }

        let phase = self
            .monitor()
            .start_phase(TURN_FN, PhaseKind::ResponseFormatting, None);
        match self.backend().latest_assistant_message(&thread_id).await {
            Ok(reply) => {
                self.monitor().end_phase(&phase, true, None, None);
                emit_run_event(
                    Level::INFO,
                    ProcessKind::Engine,
                    RunEvent {
                        event: "turn.completed",
                        component: "core.turn",
                        correlation_id: Some(&request.correlation_id),
                        thread_id: Some(&thread_id),
                        run_id: Some(&run_id),
                        status: Some(polling.status.as_str()),
                        attempts: Some(polling.attempts),
                        error_code: None,
                        detail: None,
                    },
                );
                Ok(TurnResult {
                    reply,
                    thread_id,
                    run_id,
                    polling,
                })
            }
            Err(err) => {
                self.monitor()
                    .end_phase(&phase, false, Some(err.to_string()), None);
                Err(err.context("response retrieval failed"))
            }
        }
    }

    /// Retries the whole turn with the same linear backoff as
    /// [`poll_with_retry`](Self::poll_with_retry). Driver errors are
    /// caught on every attempt; after the last one they surface as a
    /// result with the `error` sentinel status. Each retry starts a
    /// fresh run; a failed run is never resumed.
    pub async fn run_turn_with_retry(
        &self,
        request: &TurnRequest,
        config: &PollingConfig,
        max_retries: u32,
    ) -> TurnResult {
        let started = tokio::time::Instant::now();
        let mut last: Option<TurnResult> = None;
        for attempt in 0..=max_retries {
            if attempt > 0 {
                let backoff = Duration::from_millis(RETRY_BACKOFF_STEP_MS * attempt as u64);
                tokio::time::sleep(backoff).await;
            }
            match self.run_turn(request, config).await {
                Ok(result) if result.polling.success => return result,
                Ok(result) => {
                    warn!(
                        attempt,
                        status = %result.polling.status,
                        "turn attempt unsuccessful"
                    );
                    last = Some(result);
                }
                Err(err) => {
                    warn!(attempt, error = %err, "turn attempt errored");
                    last = Some(TurnResult {
                        reply: String::new(),
                        thread_id: request.thread_id.clone().unwrap_or_default(),
                        run_id: String::new(),
                        polling: PollingResult::failure(
                            PollStatus::Error,
                            0,
                            started.elapsed().as_millis() as u64,
                            format!("{err:#}"),
                        ),
                    });
                }
            }
        }
        last.unwrap_or_else(|| TurnResult {
            reply: String::new(),
            thread_id: request.thread_id.clone().unwrap_or_default(),
            run_id: String::new(),
            polling: PollingResult::failure(PollStatus::Error, 0, 0, "no turn attempt executed"),
        })
    }
}
