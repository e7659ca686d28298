//! The session execution loop.
//!
//! `SessionRunner` drives one session from `Running` to a terminal status:
//! it dispatches ready steps up to the concurrency bound, routes each step
//! through the retry controller, applies results to the board, persists a
//! snapshot on every transition and emits progress events. Pause, resume
//! and cancel arrive over a watch channel; cancellation additionally fires
//! the `CancelSignal` cloned into in-flight tasks.

use crate::engine::board::StepBoard;
use crate::errors::EngineError;
use crate::exec::OperationExecutor;
use crate::plan::StepGraph;
use crate::retry::{RetryController, RetryOutcome};
use crate::session::{FailureReport, MigrationSession, SessionStatus};
use crate::store::SessionStore;
use crate::telemetry::{CancelSignal, ProgressEvent, Stage, TelemetryPublisher};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

/// Scheduler control values sent by the session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlSignal {
    #[default]
    Run,
    Pause,
    Cancel,
}

/// What the runner hands back when the loop ends.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub status: SessionStatus,
    pub failure: Option<FailureReport>,
}

struct StepResult {
    step_id: String,
    outcome: RetryOutcome,
}

pub struct SessionRunner {
    executor: Arc<dyn OperationExecutor>,
    retry: RetryController,
    store: SessionStore,
    telemetry: TelemetryPublisher,
}

impl SessionRunner {
    pub fn new(
        executor: Arc<dyn OperationExecutor>,
        retry: RetryController,
        store: SessionStore,
        telemetry: TelemetryPublisher,
    ) -> Self {
        Self {
            executor,
            retry,
            store,
            telemetry,
        }
    }

    /// Drive the session until every step is terminal, a failure halts it,
    /// or it is cancelled. Safe to call on a rehydrated session: succeeded
    /// steps are never re-executed and interrupted ones restart from
    /// pending.
    pub async fn run(
        &self,
        session: Arc<Mutex<MigrationSession>>,
        graph: Arc<StepGraph>,
        mut control: watch::Receiver<ControlSignal>,
        cancel: CancelSignal,
    ) -> Result<SessionOutcome, EngineError> {
        let (session_id, max_concurrent, step_timeout) = {
            let mut s = session.lock().await;
            if s.status.is_terminal() {
                return Err(EngineError::InvalidSessionState {
                    status: s.status.as_str().to_string(),
                    action: "start".to_string(),
                });
            }
            (
                s.id,
                s.config.max_concurrent_steps.max(1),
                s.config.step_timeout_secs.map(Duration::from_secs),
            )
        };

        let mut board = {
            let mut s = session.lock().await;
            let board = StepBoard::rehydrate(graph.clone(), &mut s);
            let resumed = s.started_at.is_some();
            s.status = SessionStatus::Running;
            if s.started_at.is_none() {
                s.started_at = Some(Utc::now());
            }
            self.persist(&s);
            let stage = if resumed {
                Stage::SessionResumed
            } else {
                Stage::SessionStarted
            };
            self.telemetry.emit(ProgressEvent::new(
                session_id,
                stage,
                format!("session with {} steps", s.steps.len()),
            ));
            board
        };

        tracing::info!(session = %session_id, steps = graph.len(), "session running");

        let (result_tx, mut result_rx) = mpsc::channel::<StepResult>(max_concurrent * 2);
        let mut active = 0usize;
        let mut halted = false;

        loop {
            let ctl = *control.borrow();

            if ctl == ControlSignal::Cancel {
                return Ok(self
                    .drain_cancelled(&session, &mut board, &mut result_rx, active)
                    .await);
            }

            let paused = ctl == ControlSignal::Pause;
            {
                let mut s = session.lock().await;
                if paused && s.status == SessionStatus::Running {
                    s.status = SessionStatus::Paused;
                    self.persist(&s);
                    self.telemetry.emit(ProgressEvent::new(
                        session_id,
                        Stage::SessionPaused,
                        "dispatch paused; in-flight steps will finish",
                    ));
                    tracing::info!(session = %session_id, "session paused");
                } else if !paused && s.status == SessionStatus::Paused {
                    s.status = SessionStatus::Running;
                    self.persist(&s);
                    self.telemetry.emit(ProgressEvent::new(
                        session_id,
                        Stage::SessionResumed,
                        "dispatch resumed",
                    ));
                    tracing::info!(session = %session_id, "session resumed");
                }
            }

            if !paused && !halted {
                let ready = {
                    let mut s = session.lock().await;
                    let ready = board.ready_steps(&s);
                    // Eligible steps become observable as `Ready` even when
                    // the concurrency bound defers their dispatch.
                    let mut newly_ready = false;
                    for id in &ready {
                        newly_ready |= board.mark_ready(&mut s, id);
                    }
                    if newly_ready {
                        self.persist(&s);
                    }
                    ready
                };
                for step_id in ready {
                    if active >= max_concurrent {
                        break;
                    }
                    self.dispatch_step(
                        &session,
                        &board,
                        session_id,
                        step_id,
                        step_timeout,
                        &cancel,
                        result_tx.clone(),
                    )
                    .await;
                    active += 1;
                }
            }

            if active == 0 {
                if !paused {
                    // Nothing in flight and nothing dispatchable: done,
                    // halted after a failure, or every remaining step is
                    // unreachable.
                    break;
                }
                if control.changed().await.is_err() {
                    break;
                }
                continue;
            }

            tokio::select! {
                result = result_rx.recv() => {
                    if let Some(done) = result {
                        active -= 1;
                        self.apply_result(&session, &mut board, done, &mut halted).await;
                    }
                }
                _ = control.changed() => {}
            }
        }

        let mut s = session.lock().await;
        let status = if board.any_failed() || !board.all_terminal(&s) {
            SessionStatus::Failed
        } else {
            SessionStatus::Completed
        };
        s.status = status;
        s.ended_at = Some(Utc::now());
        self.persist(&s);

        let counts = s.counts();
        let stage = if status == SessionStatus::Completed {
            Stage::SessionCompleted
        } else {
            Stage::SessionFailed
        };
        self.telemetry.emit(
            ProgressEvent::new(session_id, stage, format!("session {}", status.as_str()))
                .with_metrics(serde_json::json!({
                    "succeeded": counts.succeeded,
                    "failed": counts.failed,
                    "skipped": counts.skipped,
                })),
        );
        tracing::info!(
            session = %session_id,
            status = status.as_str(),
            succeeded = counts.succeeded,
            failed = counts.failed,
            "session finished"
        );

        Ok(SessionOutcome {
            status,
            failure: s.failure.clone(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_step(
        &self,
        session: &Arc<Mutex<MigrationSession>>,
        board: &StepBoard,
        session_id: Uuid,
        step_id: String,
        step_timeout: Option<Duration>,
        cancel: &CancelSignal,
        result_tx: mpsc::Sender<StepResult>,
    ) {
        let request = {
            let mut s = session.lock().await;
            board.mark_running(&mut s, &step_id);
            self.persist(&s);
            let step = match s.step(&step_id) {
                Some(step) => step,
                None => return,
            };
            let mut request =
                crate::operation::OperationRequest::new(&step.id, step.operation.clone());
            if let Some(limit) = step_timeout {
                request = request.with_timeout(limit);
            }
            request
        };

        self.telemetry.emit(ProgressEvent::for_step(
            session_id,
            &step_id,
            Stage::StepStarted,
            format!("running {}", request.operation.name()),
        ));
        tracing::debug!(
            session = %session_id,
            step = %step_id,
            operation = request.operation.name(),
            "step dispatched"
        );

        let executor = self.executor.clone();
        let retry = self.retry.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let outcome = retry
                .execute(session_id, &step_id, &cancel, |_| {
                    let executor = executor.clone();
                    let request = request.clone();
                    let cancel = cancel.clone();
                    async move {
                        match request.timeout {
                            Some(limit) => {
                                match tokio::time::timeout(
                                    limit,
                                    executor.execute(&request, &cancel),
                                )
                                .await
                                {
                                    Ok(result) => result,
                                    Err(_) => Err(EngineError::StepTimeout {
                                        step_id: request.step_id.clone(),
                                        seconds: limit.as_secs(),
                                    }),
                                }
                            }
                            None => executor.execute(&request, &cancel).await,
                        }
                    }
                })
                .await;
            let _ = result_tx.send(StepResult { step_id, outcome }).await;
        });
    }

    async fn apply_result(
        &self,
        session: &Arc<Mutex<MigrationSession>>,
        board: &mut StepBoard,
        done: StepResult,
        halted: &mut bool,
    ) {
        let mut s = session.lock().await;
        let session_id = s.id;

        match done.outcome.result {
            Ok(result) => {
                board.mark_succeeded(&mut s, &done.step_id, done.outcome.attempts);
                // Executors report where they stashed a backup through the
                // result payload; the ledger feeds RestoreBackup
                // compensations during rollback.
                if let Some(location) =
                    result.data.get("backup_location").and_then(|v| v.as_str())
                {
                    s.record_backup(done.step_id.as_str(), location);
                }
                self.persist(&s);
                self.telemetry.emit(
                    ProgressEvent::for_step(
                        session_id,
                        &done.step_id,
                        Stage::StepSucceeded,
                        format!("completed in {} attempt(s)", done.outcome.attempts),
                    )
                    .with_metrics(serde_json::json!({
                        "duration_ms": result.duration.as_millis() as u64,
                        "bytes_processed": result.bytes_processed,
                    })),
                );
            }
            Err(EngineError::Cancelled) => {
                // Never completed; a later rehydration may run it again.
                board.revert_to_pending(&mut s, &done.step_id, done.outcome.attempts);
                self.persist(&s);
            }
            Err(err) => {
                let message = err.to_string();
                let skipped =
                    board.mark_failed(&mut s, &done.step_id, &message, done.outcome.attempts);
                if s.failure.is_none() {
                    s.failure = Some(FailureReport {
                        step_id: done.step_id.clone(),
                        error_kind: err.kind(),
                        message: message.clone(),
                        attempts: done.outcome.attempts,
                    });
                }
                if s.config.stop_on_failure {
                    *halted = true;
                }
                self.persist(&s);

                tracing::warn!(
                    session = %session_id,
                    step = %done.step_id,
                    attempts = done.outcome.attempts,
                    error = %message,
                    "step failed"
                );
                self.telemetry.emit(ProgressEvent::for_step(
                    session_id,
                    &done.step_id,
                    Stage::StepFailed,
                    message,
                ));
                for skipped_id in skipped {
                    self.telemetry.emit(ProgressEvent::for_step(
                        session_id,
                        skipped_id,
                        Stage::StepSkipped,
                        format!("dependency '{}' failed", done.step_id),
                    ));
                }
            }
        }
    }

    /// Cancel path: stop dispatching, let in-flight steps wind down (they
    /// hold the fired `CancelSignal`), then settle the session.
    async fn drain_cancelled(
        &self,
        session: &Arc<Mutex<MigrationSession>>,
        board: &mut StepBoard,
        result_rx: &mut mpsc::Receiver<StepResult>,
        mut active: usize,
    ) -> SessionOutcome {
        let session_id = {
            let mut s = session.lock().await;
            s.status = SessionStatus::Cancelling;
            self.persist(&s);
            self.telemetry.emit(ProgressEvent::new(
                s.id,
                Stage::SessionCancelling,
                "waiting for in-flight steps",
            ));
            tracing::info!(session = %s.id, in_flight = active, "session cancelling");
            s.id
        };

        let mut halted = false;
        while active > 0 {
            match result_rx.recv().await {
                Some(done) => {
                    active -= 1;
                    self.apply_result(session, board, done, &mut halted).await;
                }
                None => break,
            }
        }

        let mut s = session.lock().await;
        s.status = SessionStatus::Cancelled;
        s.ended_at = Some(Utc::now());
        self.persist(&s);
        self.telemetry.emit(ProgressEvent::new(
            session_id,
            Stage::SessionCancelled,
            "session cancelled",
        ));
        tracing::info!(session = %session_id, "session cancelled");

        SessionOutcome {
            status: SessionStatus::Cancelled,
            failure: s.failure.clone(),
        }
    }

    /// Snapshot failures must not kill a running migration; they are logged
    /// and the next transition retries the write.
    fn persist(&self, session: &MigrationSession) {
        if let Err(e) = self.store.save(session) {
            tracing::warn!(session = %session.id, error = %e, "failed to persist snapshot");
        }
    }
}
