//! Public session API.
//!
//! `SessionManager` is the crate's front door: plan a migration, start it,
//! pause/resume/cancel it, watch its progress and pick it back up after a
//! process restart. Each live session gets its own runner task, control
//! channel, cancel signal and hybrid dispatcher; the manager only routes
//! commands and never touches step state directly.

use crate::engine::{ControlSignal, SessionOutcome, SessionRunner};
use crate::errors::EngineError;
use crate::exec::{DispatcherConfig, HybridDispatcher, OperationExecutor};
use crate::operation::HostDescription;
use crate::plan::{PlanBuilder, PlatformAdapter, StepGraph, StepSpec};
use crate::retry::{RetryController, RetryPolicy};
use crate::rollback::RollbackManager;
use crate::session::{MigrationSession, SessionConfig, SessionStatus};
use crate::store::SessionStore;
use crate::telemetry::{
    cancel_pair, CancelHandle, CancelSignal, ProgressEvent, Stage, TelemetryPublisher,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

struct SessionEntry {
    session: Arc<Mutex<MigrationSession>>,
    graph: Arc<StepGraph>,
    control: watch::Sender<ControlSignal>,
    cancel_handle: CancelHandle,
    cancel_signal: CancelSignal,
    task: Option<JoinHandle<Result<SessionOutcome, EngineError>>>,
}

impl SessionEntry {
    fn new(session: MigrationSession, graph: Arc<StepGraph>) -> Self {
        let (control, _) = watch::channel(ControlSignal::Run);
        let (cancel_handle, cancel_signal) = cancel_pair();
        Self {
            session: Arc::new(Mutex::new(session)),
            graph,
            control,
            cancel_handle,
            cancel_signal,
            task: None,
        }
    }

    fn task_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

pub struct SessionManager {
    store: SessionStore,
    telemetry: TelemetryPublisher,
    retry_policy: RetryPolicy,
    dispatcher_config: DispatcherConfig,
    /// Replaces the per-session hybrid dispatcher when set. Used by tests
    /// and embedders that bring their own executor.
    executor_override: Option<Arc<dyn OperationExecutor>>,
    sessions: Mutex<HashMap<Uuid, SessionEntry>>,
}

impl SessionManager {
    pub fn new(store: SessionStore) -> Self {
        Self {
            store,
            telemetry: TelemetryPublisher::new(),
            retry_policy: RetryPolicy::default(),
            dispatcher_config: DispatcherConfig::default(),
            executor_override: None,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_dispatcher_config(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher_config = config;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn OperationExecutor>) -> Self {
        self.executor_override = Some(executor);
        self
    }

    pub fn telemetry(&self) -> &TelemetryPublisher {
        &self.telemetry
    }

    /// Join the progress event stream for all sessions; filter by
    /// `session_id` on the receiving side.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.telemetry.subscribe()
    }

    /// Plan a migration from an explicit step list. The session is
    /// persisted immediately and sits `Pending` until started.
    pub async fn plan(
        &self,
        steps: Vec<StepSpec>,
        config: SessionConfig,
    ) -> Result<Uuid, EngineError> {
        let graph = PlanBuilder::new(steps).build()?;
        self.register(graph, config).await
    }

    /// Plan a migration by asking a platform adapter for the steps.
    pub async fn plan_with_adapter(
        &self,
        adapter: &dyn PlatformAdapter,
        source: &HostDescription,
        destination: &HostDescription,
        config: SessionConfig,
    ) -> Result<Uuid, EngineError> {
        let graph = PlanBuilder::from_adapter(adapter, source, destination)?;
        self.register(graph, config).await
    }

    async fn register(
        &self,
        graph: StepGraph,
        config: SessionConfig,
    ) -> Result<Uuid, EngineError> {
        let graph = Arc::new(graph);
        let session = MigrationSession::from_plan(&graph, config);
        let id = session.id;
        self.store.save(&session)?;

        self.telemetry.emit(ProgressEvent::new(
            id,
            Stage::Planned,
            format!("planned {} step(s)", graph.len()),
        ));
        tracing::info!(session = %id, steps = graph.len(), "session planned");

        self.sessions
            .lock()
            .await
            .insert(id, SessionEntry::new(session, graph));
        Ok(id)
    }

    /// Start (or restart after rehydration) the session's runner task.
    /// When the session ends failed or cancelled and `auto_rollback` is
    /// set, compensation runs on the same task before it finishes.
    pub async fn start(&self, id: Uuid) -> Result<(), EngineError> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions
            .get_mut(&id)
            .ok_or(EngineError::SessionNotFound(id))?;

        if entry.task_running() {
            return Err(EngineError::InvalidSessionState {
                status: "running".to_string(),
                action: "start".to_string(),
            });
        }
        {
            let s = entry.session.lock().await;
            if s.status.is_terminal() {
                return Err(EngineError::InvalidSessionState {
                    status: s.status.as_str().to_string(),
                    action: "start".to_string(),
                });
            }
        }
        let _ = entry.control.send(ControlSignal::Run);

        let executor: Arc<dyn OperationExecutor> = match &self.executor_override {
            Some(executor) => executor.clone(),
            None => Arc::new(HybridDispatcher::for_session(
                &self.dispatcher_config,
                id,
                self.telemetry.clone(),
            )),
        };
        let runner = SessionRunner::new(
            executor.clone(),
            RetryController::new(self.retry_policy.clone(), self.telemetry.clone()),
            self.store.clone(),
            self.telemetry.clone(),
        );
        let rollback = RollbackManager::new(executor, self.store.clone(), self.telemetry.clone());

        let session = entry.session.clone();
        let graph = entry.graph.clone();
        let control_rx = entry.control.subscribe();
        let cancel = entry.cancel_signal.clone();
        entry.task = Some(tokio::spawn(async move {
            let outcome = runner.run(session.clone(), graph, control_rx, cancel).await?;

            let auto_rollback = session.lock().await.config.auto_rollback;
            if auto_rollback && outcome.status.rollback_eligible() {
                let report = rollback.run(session).await?;
                if !report.fully_succeeded() {
                    tracing::warn!(
                        unresolved = report.unresolved.len(),
                        "rollback left unresolved compensations"
                    );
                }
                return Ok(SessionOutcome {
                    status: SessionStatus::RolledBack,
                    failure: outcome.failure,
                });
            }
            Ok(outcome)
        }));
        Ok(())
    }

    /// Stop dispatching new steps; in-flight steps finish. Only valid for
    /// a running session.
    pub async fn pause(&self, id: Uuid) -> Result<(), EngineError> {
        let sessions = self.sessions.lock().await;
        let entry = sessions.get(&id).ok_or(EngineError::SessionNotFound(id))?;

        let status = entry.session.lock().await.status;
        if status != SessionStatus::Running || !entry.task_running() {
            return Err(EngineError::InvalidSessionState {
                status: status.as_str().to_string(),
                action: "pause".to_string(),
            });
        }
        let _ = entry.control.send(ControlSignal::Pause);
        Ok(())
    }

    /// Resume a paused session. If its runner task is gone (paused, then
    /// rehydrated after a restart) a fresh one is started.
    pub async fn resume(&self, id: Uuid) -> Result<(), EngineError> {
        let needs_start = {
            let sessions = self.sessions.lock().await;
            let entry = sessions.get(&id).ok_or(EngineError::SessionNotFound(id))?;

            let status = entry.session.lock().await.status;
            if entry.task_running() {
                if status != SessionStatus::Paused && status != SessionStatus::Running {
                    return Err(EngineError::InvalidSessionState {
                        status: status.as_str().to_string(),
                        action: "resume".to_string(),
                    });
                }
                let _ = entry.control.send(ControlSignal::Run);
                false
            } else {
                if status.is_terminal() {
                    return Err(EngineError::InvalidSessionState {
                        status: status.as_str().to_string(),
                        action: "resume".to_string(),
                    });
                }
                true
            }
        };

        if needs_start {
            self.start(id).await?;
        }
        Ok(())
    }

    /// Cancel a session. New dispatch stops immediately and the signal
    /// propagates into in-flight executors (native subprocesses included).
    pub async fn cancel(&self, id: Uuid) -> Result<(), EngineError> {
        let sessions = self.sessions.lock().await;
        let entry = sessions.get(&id).ok_or(EngineError::SessionNotFound(id))?;

        let mut s = entry.session.lock().await;
        if s.status.is_terminal() {
            return Err(EngineError::InvalidSessionState {
                status: s.status.as_str().to_string(),
                action: "cancel".to_string(),
            });
        }

        if entry.task_running() {
            drop(s);
            entry.cancel_handle.cancel();
            let _ = entry.control.send(ControlSignal::Cancel);
        } else {
            // Never started (or between restarts): settle it directly.
            s.status = SessionStatus::Cancelled;
            s.ended_at = Some(Utc::now());
            self.store.save(&s)?;
            self.telemetry.emit(ProgressEvent::new(
                id,
                Stage::SessionCancelled,
                "session cancelled before start",
            ));
        }
        Ok(())
    }

    /// Block until the session's runner task (and any auto-rollback)
    /// finishes. Consumes the task handle; callers keep the outcome.
    pub async fn wait(&self, id: Uuid) -> Result<SessionOutcome, EngineError> {
        let task = {
            let mut sessions = self.sessions.lock().await;
            let entry = sessions
                .get_mut(&id)
                .ok_or(EngineError::SessionNotFound(id))?;
            entry.task.take()
        };

        match task {
            Some(task) => task
                .await
                .map_err(|e| EngineError::Fatal(format!("session task failed: {e}")))?,
            None => Err(EngineError::InvalidSessionState {
                status: self.status(id).await?.as_str().to_string(),
                action: "wait".to_string(),
            }),
        }
    }

    pub async fn status(&self, id: Uuid) -> Result<SessionStatus, EngineError> {
        Ok(self.snapshot(id).await?.status)
    }

    /// Full session snapshot: in-memory state when the session is live,
    /// the stored one otherwise.
    pub async fn snapshot(&self, id: Uuid) -> Result<MigrationSession, EngineError> {
        let sessions = self.sessions.lock().await;
        match sessions.get(&id) {
            Some(entry) => Ok(entry.session.lock().await.clone()),
            None => self.store.load(id),
        }
    }

    /// Load a stored session back into the manager after a restart. The
    /// snapshot is registered as-is; call `resume` (non-terminal sessions)
    /// to continue execution from the persisted step states.
    pub async fn rehydrate(&self, id: Uuid) -> Result<SessionStatus, EngineError> {
        let session = self.store.load(id)?;
        let graph = Arc::new(session.rebuild_graph()?);
        let status = session.status;

        tracing::info!(
            session = %id,
            status = status.as_str(),
            "session rehydrated from store"
        );
        self.sessions
            .lock()
            .await
            .insert(id, SessionEntry::new(session, graph));
        Ok(status)
    }

    /// Rehydrate every stored session; returns the ids now registered.
    pub async fn rehydrate_all(&self) -> Result<Vec<Uuid>, EngineError> {
        let mut ids = Vec::new();
        for id in self.store.list()? {
            self.rehydrate(id).await?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Drop a terminal session from memory. Its stored snapshot remains;
    /// `SessionStore::remove` deletes that separately.
    pub async fn dispose(&self, id: Uuid) -> Result<(), EngineError> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions.get(&id).ok_or(EngineError::SessionNotFound(id))?;

        let status = entry.session.lock().await.status;
        if !status.is_terminal() {
            return Err(EngineError::InvalidSessionState {
                status: status.as_str().to_string(),
                action: "dispose".to_string(),
            });
        }
        sessions.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{Operation, OperationRequest, OperationResult};
    use crate::session::StepStatus;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::time::Duration;
    use tempfile::tempdir;

    /// Executor that succeeds everywhere except the configured step ids.
    #[derive(Default)]
    struct ScriptedExecutor {
        fail_steps: HashSet<String>,
        delay: Duration,
    }

    #[async_trait]
    impl OperationExecutor for ScriptedExecutor {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn execute(
            &self,
            request: &OperationRequest,
            cancel: &CancelSignal,
        ) -> Result<OperationResult, EngineError> {
            if !self.delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.delay) => {}
                    _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                }
            }
            if self.fail_steps.contains(&request.step_id) {
                return Err(EngineError::Fatal("scripted failure".into()));
            }
            Ok(OperationResult::ok(
                serde_json::json!({}),
                Duration::from_millis(1),
                0,
            ))
        }
    }

    fn two_step_plan() -> Vec<StepSpec> {
        vec![
            StepSpec::new(
                "export",
                Operation::Compress {
                    source: "/var/www".into(),
                    dest: "/tmp/site.tar.gz".into(),
                },
            )
            .with_compensation(Operation::Remove {
                path: "/tmp/site.tar.gz".into(),
            }),
            StepSpec::new(
                "verify",
                Operation::Checksum {
                    path: "/tmp/site.tar.gz".into(),
                },
            )
            .depends_on(&["export"]),
        ]
    }

    fn manager_with(executor: ScriptedExecutor) -> (SessionManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let manager = SessionManager::new(store)
            .with_retry_policy(RetryPolicy::default().with_base_delay(Duration::from_millis(1)))
            .with_executor(Arc::new(executor));
        (manager, dir)
    }

    #[tokio::test]
    async fn test_plan_start_wait_completes() {
        let (manager, _dir) = manager_with(ScriptedExecutor::default());
        let id = manager
            .plan(two_step_plan(), SessionConfig::default())
            .await
            .unwrap();

        assert_eq!(manager.status(id).await.unwrap(), SessionStatus::Pending);

        manager.start(id).await.unwrap();
        let outcome = manager.wait(id).await.unwrap();
        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(manager.status(id).await.unwrap(), SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_invalid_plan_rejected_up_front() {
        let (manager, _dir) = manager_with(ScriptedExecutor::default());
        let err = manager
            .plan(
                vec![StepSpec::new("a", Operation::Version).depends_on(&["missing"])],
                SessionConfig::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PlanValidation(_)));
    }

    #[tokio::test]
    async fn test_auto_rollback_after_failure() {
        let (manager, _dir) = manager_with(ScriptedExecutor {
            fail_steps: HashSet::from(["verify".to_string()]),
            ..Default::default()
        });
        let id = manager
            .plan(two_step_plan(), SessionConfig::default())
            .await
            .unwrap();

        manager.start(id).await.unwrap();
        let outcome = manager.wait(id).await.unwrap();

        assert_eq!(outcome.status, SessionStatus::RolledBack);
        assert_eq!(outcome.failure.unwrap().step_id, "verify");

        let snapshot = manager.snapshot(id).await.unwrap();
        assert_eq!(snapshot.status, SessionStatus::RolledBack);
        assert_eq!(
            snapshot.step("export").unwrap().status,
            StepStatus::Compensated
        );
        assert!(snapshot.rollback.is_some());
    }

    #[tokio::test]
    async fn test_failure_without_auto_rollback_stays_failed() {
        let (manager, _dir) = manager_with(ScriptedExecutor {
            fail_steps: HashSet::from(["verify".to_string()]),
            ..Default::default()
        });
        let id = manager
            .plan(
                two_step_plan(),
                SessionConfig::default().with_auto_rollback(false),
            )
            .await
            .unwrap();

        manager.start(id).await.unwrap();
        let outcome = manager.wait(id).await.unwrap();
        assert_eq!(outcome.status, SessionStatus::Failed);
        assert_eq!(
            manager.snapshot(id).await.unwrap().step("export").unwrap().status,
            StepStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_cancel_before_start_settles_session() {
        let (manager, _dir) = manager_with(ScriptedExecutor::default());
        let id = manager
            .plan(two_step_plan(), SessionConfig::default())
            .await
            .unwrap();

        manager.cancel(id).await.unwrap();
        assert_eq!(manager.status(id).await.unwrap(), SessionStatus::Cancelled);

        let err = manager.start(id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidSessionState { .. }));
    }

    #[tokio::test]
    async fn test_cancel_running_session() {
        let (manager, _dir) = manager_with(ScriptedExecutor {
            delay: Duration::from_secs(10),
            ..Default::default()
        });
        let id = manager
            .plan(
                two_step_plan(),
                SessionConfig::default().with_auto_rollback(false),
            )
            .await
            .unwrap();

        manager.start(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.cancel(id).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), manager.wait(id))
            .await
            .expect("cancel must interrupt the delayed step")
            .unwrap();
        assert_eq!(outcome.status, SessionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_pause_requires_running_session() {
        let (manager, _dir) = manager_with(ScriptedExecutor::default());
        let id = manager
            .plan(two_step_plan(), SessionConfig::default())
            .await
            .unwrap();

        let err = manager.pause(id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidSessionState { .. }));
    }

    #[tokio::test]
    async fn test_unknown_session_not_found() {
        let (manager, _dir) = manager_with(ScriptedExecutor::default());
        let missing = Uuid::new_v4();

        assert!(matches!(
            manager.start(missing).await.unwrap_err(),
            EngineError::SessionNotFound(_)
        ));
        assert!(matches!(
            manager.pause(missing).await.unwrap_err(),
            EngineError::SessionNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_dispose_requires_terminal_status() {
        let (manager, _dir) = manager_with(ScriptedExecutor::default());
        let id = manager
            .plan(two_step_plan(), SessionConfig::default())
            .await
            .unwrap();

        let err = manager.dispose(id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidSessionState { .. }));

        manager.start(id).await.unwrap();
        manager.wait(id).await.unwrap();
        manager.dispose(id).await.unwrap();

        // Gone from memory, still loadable from the store.
        assert!(manager.snapshot(id).await.is_ok());
        assert!(matches!(
            manager.pause(id).await.unwrap_err(),
            EngineError::SessionNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_rehydrate_and_finish_after_restart() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();

        // First process: plan, then die before starting.
        let id = {
            let manager = SessionManager::new(store.clone())
                .with_executor(Arc::new(ScriptedExecutor::default()));
            manager
                .plan(two_step_plan(), SessionConfig::default())
                .await
                .unwrap()
        };

        // Second process: pick the session up and run it to completion.
        let manager = SessionManager::new(store)
            .with_executor(Arc::new(ScriptedExecutor::default()));
        let status = manager.rehydrate(id).await.unwrap();
        assert_eq!(status, SessionStatus::Pending);

        manager.resume(id).await.unwrap();
        let outcome = manager.wait(id).await.unwrap();
        assert_eq!(outcome.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_rehydrate_all_lists_stored_sessions() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let manager = SessionManager::new(store.clone())
            .with_executor(Arc::new(ScriptedExecutor::default()));

        let a = manager
            .plan(two_step_plan(), SessionConfig::default())
            .await
            .unwrap();
        let b = manager
            .plan(two_step_plan(), SessionConfig::default())
            .await
            .unwrap();

        let other = SessionManager::new(store)
            .with_executor(Arc::new(ScriptedExecutor::default()));
        let mut ids = other.rehydrate_all().await.unwrap();
        ids.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_events_flow_through_manager_subscription() {
        let (manager, _dir) = manager_with(ScriptedExecutor::default());
        let mut rx = manager.subscribe();

        let id = manager
            .plan(two_step_plan(), SessionConfig::default())
            .await
            .unwrap();
        manager.start(id).await.unwrap();
        manager.wait(id).await.unwrap();

        let mut stages = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.session_id, id);
            stages.push(event.stage);
        }
        assert_eq!(stages.first(), Some(&Stage::Planned));
        assert!(stages.contains(&Stage::SessionStarted));
        assert!(stages.contains(&Stage::StepSucceeded));
        assert_eq!(stages.last(), Some(&Stage::SessionCompleted));
    }
}
