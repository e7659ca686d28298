//! Best-effort compensation replay.
//!
//! Rollback walks the success order backwards and runs each step's
//! compensating action. Steps without one are irreversible and skipped.
//! A failed compensation is recorded and the walk continues; the session
//! always ends `RolledBack`, with unresolved entries left for manual
//! cleanup.

use crate::errors::EngineError;
use crate::exec::OperationExecutor;
use crate::operation::{Operation, OperationRequest};
use crate::retry::{RetryController, RetryPolicy};
use crate::session::{
    CompensationFailure, MigrationSession, RollbackReport, SessionStatus, StepStatus,
};
use crate::store::SessionStore;
use crate::telemetry::{CancelSignal, ProgressEvent, Stage, TelemetryPublisher};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct RollbackManager {
    executor: Arc<dyn OperationExecutor>,
    retry: RetryController,
    store: SessionStore,
    telemetry: TelemetryPublisher,
}

impl RollbackManager {
    pub fn new(
        executor: Arc<dyn OperationExecutor>,
        store: SessionStore,
        telemetry: TelemetryPublisher,
    ) -> Self {
        let retry = RetryController::new(RetryPolicy::for_rollback(), telemetry.clone());
        Self {
            executor,
            retry,
            store,
            telemetry,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = RetryController::new(policy, self.telemetry.clone());
        self
    }

    /// Replay compensations for a failed or cancelled session. Returns the
    /// report also recorded on the session; `Err` only when the session is
    /// not in a rollback-eligible state.
    pub async fn run(
        &self,
        session: Arc<Mutex<MigrationSession>>,
    ) -> Result<RollbackReport, EngineError> {
        let (session_id, prior_status, replay) = {
            let s = session.lock().await;
            if !s.status.rollback_eligible() {
                return Err(EngineError::InvalidSessionState {
                    status: s.status.as_str().to_string(),
                    action: "roll back".to_string(),
                });
            }
            let replay: Vec<(String, Option<Operation>)> = s
                .completion_order
                .iter()
                .rev()
                .map(|id| {
                    let action = s
                        .step(id)
                        .and_then(|st| st.compensating_action.clone())
                        .map(|a| resolve_action(&s, id, a));
                    (id.clone(), action)
                })
                .collect();
            (s.id, s.status, replay)
        };

        tracing::info!(
            session = %session_id,
            prior = prior_status.as_str(),
            steps = replay.len(),
            "rollback started"
        );
        self.telemetry.emit(ProgressEvent::new(
            session_id,
            Stage::RollbackStarted,
            format!("replaying compensations for {} step(s)", replay.len()),
        ));

        let mut compensated = Vec::new();
        let mut unresolved = Vec::new();
        // Rollback runs to the end even when the session was cancelled.
        let cancel = CancelSignal::never();

        for (step_id, action) in replay {
            let Some(action) = action else {
                tracing::debug!(step = %step_id, "no compensating action, skipping");
                continue;
            };

            compensated.push(step_id.clone());
            let request = OperationRequest::new(&step_id, action);
            let outcome = self
                .retry
                .execute(session_id, &step_id, &cancel, |_| {
                    let executor = self.executor.clone();
                    let request = request.clone();
                    let cancel = cancel.clone();
                    async move { executor.execute(&request, &cancel).await }
                })
                .await;

            match outcome.result {
                Ok(_) => {
                    let mut s = session.lock().await;
                    if let Some(step) = s.step_mut(&step_id) {
                        step.status = StepStatus::Compensated;
                    }
                    self.persist(&s);
                    self.telemetry.emit(ProgressEvent::for_step(
                        session_id,
                        &step_id,
                        Stage::StepCompensated,
                        "compensating action applied",
                    ));
                }
                Err(err) => {
                    let failure = EngineError::Rollback {
                        step_id: step_id.clone(),
                        message: err.to_string(),
                    };
                    tracing::warn!(
                        session = %session_id,
                        step = %step_id,
                        error = %failure,
                        "compensation failed, continuing"
                    );
                    self.telemetry.emit(ProgressEvent::for_step(
                        session_id,
                        &step_id,
                        Stage::CompensationFailed,
                        failure.to_string(),
                    ));
                    unresolved.push(CompensationFailure {
                        step_id,
                        message: err.to_string(),
                    });
                }
            }
        }

        let report = RollbackReport {
            prior_status,
            compensated,
            unresolved,
            finished_at: Utc::now(),
        };

        {
            let mut s = session.lock().await;
            s.status = SessionStatus::RolledBack;
            s.rollback = Some(report.clone());
            self.persist(&s);
        }

        tracing::info!(
            session = %session_id,
            attempted = report.compensated.len(),
            unresolved = report.unresolved.len(),
            "rollback finished"
        );
        self.telemetry.emit(
            ProgressEvent::new(session_id, Stage::RollbackFinished, "rollback finished")
                .with_metrics(serde_json::json!({
                    "attempted": report.compensated.len(),
                    "unresolved": report.unresolved.len(),
                })),
        );

        Ok(report)
    }

    fn persist(&self, session: &MigrationSession) {
        if let Err(e) = self.store.save(session) {
            tracing::warn!(session = %session.id, error = %e, "failed to persist snapshot");
        }
    }
}

/// A `RestoreBackup` compensation written at plan time may point at a
/// placeholder; a backup recorded in the ledger during the run wins.
fn resolve_action(session: &MigrationSession, step_id: &str, action: Operation) -> Operation {
    match action {
        Operation::RestoreBackup { backup, dest } => {
            let backup = session
                .backup_for(step_id)
                .map(|record| record.location.clone())
                .unwrap_or(backup);
            Operation::RestoreBackup { backup, dest }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationResult;
    use crate::plan::{PlanBuilder, StepSpec};
    use crate::session::SessionConfig;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingExecutor {
        fail_steps: HashSet<String>,
        calls: StdMutex<Vec<String>>,
        operations: StdMutex<Vec<Operation>>,
    }

    #[async_trait]
    impl OperationExecutor for RecordingExecutor {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn execute(
            &self,
            request: &OperationRequest,
            _cancel: &CancelSignal,
        ) -> Result<OperationResult, EngineError> {
            self.calls.lock().unwrap().push(request.step_id.clone());
            self.operations
                .lock()
                .unwrap()
                .push(request.operation.clone());
            if self.fail_steps.contains(&request.step_id) {
                return Err(EngineError::Fatal("compensation target missing".into()));
            }
            Ok(OperationResult::ok(
                serde_json::json!({}),
                Duration::from_millis(1),
                0,
            ))
        }
    }

    fn failed_session() -> Arc<Mutex<MigrationSession>> {
        let graph = PlanBuilder::new(vec![
            StepSpec::new(
                "copy-files",
                Operation::Copy {
                    source: "/var/www".into(),
                    dest: "/srv/www".into(),
                },
            )
            .with_compensation(Operation::Remove {
                path: "/srv/www".into(),
            }),
            StepSpec::new(
                "db-import",
                Operation::Transfer {
                    url: "https://old-host/dump.sql".into(),
                    dest: "/srv/dump.sql".into(),
                },
            )
            .depends_on(&["copy-files"])
            .with_compensation(Operation::Remove {
                path: "/srv/dump.sql".into(),
            }),
            // Irreversible: no compensating action.
            StepSpec::new("dns-check", Operation::Monitor).depends_on(&["db-import"]),
            StepSpec::new("verify", Operation::Version).depends_on(&["dns-check"]),
        ])
        .build()
        .unwrap();

        let mut session = MigrationSession::from_plan(&graph, SessionConfig::default());
        for id in ["copy-files", "db-import", "dns-check"] {
            session.step_mut(id).unwrap().status = StepStatus::Succeeded;
            session.completion_order.push(id.to_string());
        }
        session.step_mut("verify").unwrap().status = StepStatus::Failed;
        session.status = SessionStatus::Failed;
        Arc::new(Mutex::new(session))
    }

    fn manager(executor: RecordingExecutor) -> (RollbackManager, Arc<RecordingExecutor>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let executor = Arc::new(executor);
        let mgr = RollbackManager::new(executor.clone(), store, TelemetryPublisher::new());
        (mgr, executor, dir)
    }

    #[tokio::test]
    async fn test_compensations_replay_in_reverse_order() {
        let (mgr, executor, _dir) = manager(RecordingExecutor::default());
        let session = failed_session();

        let report = mgr.run(session.clone()).await.unwrap();

        assert_eq!(report.prior_status, SessionStatus::Failed);
        assert!(report.fully_succeeded());
        // dns-check has no compensation; db-import succeeded after
        // copy-files so it is undone first.
        assert_eq!(executor.calls.lock().unwrap().clone(), vec!["db-import", "copy-files"]);

        let s = session.lock().await;
        assert_eq!(s.status, SessionStatus::RolledBack);
        assert_eq!(s.step("copy-files").unwrap().status, StepStatus::Compensated);
        assert_eq!(s.step("db-import").unwrap().status, StepStatus::Compensated);
        assert_eq!(s.step("dns-check").unwrap().status, StepStatus::Succeeded);
        assert!(s.rollback.is_some());
    }

    #[tokio::test]
    async fn test_failed_compensation_recorded_and_walk_continues() {
        let (mgr, executor, _dir) = manager(RecordingExecutor {
            fail_steps: HashSet::from(["db-import".to_string()]),
            ..Default::default()
        });
        let session = failed_session();

        let report = mgr.run(session.clone()).await.unwrap();

        assert!(!report.fully_succeeded());
        assert_eq!(report.unresolved.len(), 1);
        assert_eq!(report.unresolved[0].step_id, "db-import");
        // copy-files was still compensated after db-import failed.
        assert!(executor
            .calls
            .lock()
            .unwrap()
            .contains(&"copy-files".to_string()));

        let s = session.lock().await;
        assert_eq!(s.status, SessionStatus::RolledBack);
        assert_eq!(s.step("copy-files").unwrap().status, StepStatus::Compensated);
        assert_eq!(s.step("db-import").unwrap().status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_restore_backup_resolves_through_ledger() {
        let (mgr, executor, _dir) = manager(RecordingExecutor::default());
        let session = failed_session();
        {
            let mut s = session.lock().await;
            // The compensation carries a plan-time placeholder; the ledger
            // knows where the backup actually landed.
            s.step_mut("db-import").unwrap().compensating_action =
                Some(Operation::RestoreBackup {
                    backup: "/backups/placeholder.sql".into(),
                    dest: "/srv/dump.sql".into(),
                });
            s.record_backup("db-import", "/backups/dump-final.sql");
        }

        mgr.run(session).await.unwrap();

        let operations = executor.operations.lock().unwrap();
        let restored = operations
            .iter()
            .find_map(|op| match op {
                Operation::RestoreBackup { backup, .. } => Some(backup.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            restored,
            std::path::PathBuf::from("/backups/dump-final.sql")
        );
    }

    #[tokio::test]
    async fn test_completed_session_not_eligible() {
        let (mgr, _executor, _dir) = manager(RecordingExecutor::default());
        let session = failed_session();
        session.lock().await.status = SessionStatus::Completed;

        let err = mgr.run(session).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidSessionState { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_session_is_eligible() {
        let (mgr, _executor, _dir) = manager(RecordingExecutor::default());
        let session = failed_session();
        session.lock().await.status = SessionStatus::Cancelled;

        let report = mgr.run(session.clone()).await.unwrap();
        assert_eq!(report.prior_status, SessionStatus::Cancelled);
        assert_eq!(session.lock().await.status, SessionStatus::RolledBack);
    }

    #[tokio::test]
    async fn test_rollback_events_emitted() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let telemetry = TelemetryPublisher::new();
        let mut rx = telemetry.subscribe();
        let mgr = RollbackManager::new(
            Arc::new(RecordingExecutor::default()),
            store,
            telemetry,
        );

        mgr.run(failed_session()).await.unwrap();

        let mut stages = Vec::new();
        while let Ok(event) = rx.try_recv() {
            stages.push(event.stage);
        }
        assert_eq!(stages.first(), Some(&Stage::RollbackStarted));
        assert_eq!(stages.last(), Some(&Stage::RollbackFinished));
        assert_eq!(
            stages.iter().filter(|s| **s == Stage::StepCompensated).count(),
            2
        );
    }
}
