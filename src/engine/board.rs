//! Ready-set bookkeeping over a session's steps.
//!
//! `StepBoard` tracks which step indices have succeeded or become
//! unsatisfiable and answers "what can run next". It mutates step records
//! but never performs I/O; the runner owns persistence and events.

use crate::plan::{StepGraph, StepIndex};
use crate::session::{MigrationSession, StepStatus};
use std::collections::HashSet;
use std::sync::Arc;

pub struct StepBoard {
    graph: Arc<StepGraph>,
    succeeded: HashSet<StepIndex>,
    /// Failed and skipped indices; both make dependents unsatisfiable.
    unsatisfiable: HashSet<StepIndex>,
}

impl StepBoard {
    /// Board for a fresh session: every step pending.
    pub fn new(graph: Arc<StepGraph>) -> Self {
        Self {
            graph,
            succeeded: HashSet::new(),
            unsatisfiable: HashSet::new(),
        }
    }

    /// Board for a rehydrated session. Steps that were `Running` or `Ready`
    /// when the process died never completed, so they go back to `Pending`;
    /// succeeded steps keep their status and are never re-executed.
    pub fn rehydrate(graph: Arc<StepGraph>, session: &mut MigrationSession) -> Self {
        let mut board = Self::new(graph);
        for step in &mut session.steps {
            match step.status {
                StepStatus::Running | StepStatus::Ready => {
                    step.status = StepStatus::Pending;
                }
                StepStatus::Succeeded | StepStatus::Compensated => {
                    if let Some(idx) = board.graph.index_of(&step.id) {
                        board.succeeded.insert(idx);
                    }
                }
                StepStatus::Failed | StepStatus::Skipped => {
                    if let Some(idx) = board.graph.index_of(&step.id) {
                        board.unsatisfiable.insert(idx);
                    }
                }
                StepStatus::Pending => {}
            }
        }
        board
    }

    pub fn graph(&self) -> &StepGraph {
        &self.graph
    }

    /// Ids of dispatchable steps: pending or ready, with every dependency
    /// succeeded. Steps already marked `Ready` stay in the set until they
    /// are dispatched.
    pub fn ready_steps(&self, session: &MigrationSession) -> Vec<String> {
        session
            .steps
            .iter()
            .enumerate()
            .filter(|(idx, step)| {
                matches!(step.status, StepStatus::Pending | StepStatus::Ready)
                    && self.graph.dependencies_satisfied(*idx, &self.succeeded)
            })
            .map(|(_, step)| step.id.clone())
            .collect()
    }

    /// Transition an eligible step `Pending → Ready`. Returns true when the
    /// status changed, so the caller knows whether a snapshot is due. A step
    /// stays `Ready` while the concurrency bound defers its dispatch.
    pub fn mark_ready(&self, session: &mut MigrationSession, id: &str) -> bool {
        match session.step_mut(id) {
            Some(step) if step.status == StepStatus::Pending => {
                step.status = StepStatus::Ready;
                true
            }
            _ => false,
        }
    }

    /// Transition a dispatched step `Ready → Running`.
    pub fn mark_running(&self, session: &mut MigrationSession, id: &str) {
        if let Some(step) = session.step_mut(id) {
            debug_assert_eq!(step.status, StepStatus::Ready);
            step.status = StepStatus::Running;
        }
    }

    /// A cancelled in-flight step never completed; put it back to pending
    /// (its attempt count is kept).
    pub fn revert_to_pending(&self, session: &mut MigrationSession, id: &str, attempts: u32) {
        if let Some(step) = session.step_mut(id) {
            step.status = StepStatus::Pending;
            step.attempt_count = attempts;
        }
    }

    pub fn mark_succeeded(&mut self, session: &mut MigrationSession, id: &str, attempts: u32) {
        if let Some(idx) = self.graph.index_of(id) {
            self.succeeded.insert(idx);
        }
        if let Some(step) = session.step_mut(id) {
            step.status = StepStatus::Succeeded;
            step.attempt_count = attempts;
            step.last_error = None;
        }
        session.completion_order.push(id.to_string());
    }

    /// Mark a step failed and skip every transitive dependent — their
    /// dependencies can no longer be satisfied. Returns the skipped ids.
    pub fn mark_failed(
        &mut self,
        session: &mut MigrationSession,
        id: &str,
        error: &str,
        attempts: u32,
    ) -> Vec<String> {
        let Some(idx) = self.graph.index_of(id) else {
            return Vec::new();
        };

        self.unsatisfiable.insert(idx);
        if let Some(step) = session.step_mut(id) {
            step.status = StepStatus::Failed;
            step.attempt_count = attempts;
            step.last_error = Some(error.to_string());
        }

        let mut skipped = Vec::new();
        for dep_idx in self.graph.transitive_dependents(idx) {
            let step = &mut session.steps[dep_idx];
            if !step.status.is_terminal() && step.status != StepStatus::Running {
                step.status = StepStatus::Skipped;
                self.unsatisfiable.insert(dep_idx);
                skipped.push(step.id.clone());
            }
        }
        skipped
    }

    /// True when every step reached a terminal state.
    pub fn all_terminal(&self, session: &MigrationSession) -> bool {
        session.steps.iter().all(|s| s.status.is_terminal())
    }

    /// True when at least one step failed or was skipped.
    pub fn any_failed(&self) -> bool {
        !self.unsatisfiable.is_empty()
    }

    pub fn succeeded_count(&self) -> usize {
        self.succeeded.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;
    use crate::plan::{PlanBuilder, StepSpec};
    use crate::session::SessionConfig;

    fn diamond() -> (Arc<StepGraph>, MigrationSession) {
        let graph = Arc::new(
            PlanBuilder::new(vec![
                StepSpec::new("a", Operation::Version),
                StepSpec::new("b", Operation::Version).depends_on(&["a"]),
                StepSpec::new("c", Operation::Version).depends_on(&["a"]),
                StepSpec::new("d", Operation::Version).depends_on(&["b", "c"]),
            ])
            .build()
            .unwrap(),
        );
        let session = MigrationSession::from_plan(&graph, SessionConfig::default());
        (graph, session)
    }

    #[test]
    fn test_ready_set_progression() {
        let (graph, mut session) = diamond();
        let mut board = StepBoard::new(graph);

        assert_eq!(board.ready_steps(&session), vec!["a"]);

        board.mark_ready(&mut session, "a");
        board.mark_running(&mut session, "a");
        assert!(board.ready_steps(&session).is_empty());

        board.mark_succeeded(&mut session, "a", 1);
        let ready = board.ready_steps(&session);
        assert!(ready.contains(&"b".to_string()));
        assert!(ready.contains(&"c".to_string()));
        assert!(!ready.contains(&"d".to_string()));

        board.mark_succeeded(&mut session, "b", 1);
        assert_eq!(board.ready_steps(&session), vec!["c"]);

        board.mark_succeeded(&mut session, "c", 1);
        assert_eq!(board.ready_steps(&session), vec!["d"]);

        board.mark_succeeded(&mut session, "d", 1);
        assert!(board.all_terminal(&session));
        assert!(!board.any_failed());
        assert_eq!(
            session.completion_order,
            vec!["a", "b", "c", "d"]
        );
    }

    #[test]
    fn test_failure_skips_transitive_dependents() {
        let (graph, mut session) = diamond();
        let mut board = StepBoard::new(graph);

        board.mark_succeeded(&mut session, "a", 1);
        let skipped = board.mark_failed(&mut session, "b", "disk full", 3);

        assert_eq!(skipped, vec!["d"]);
        assert_eq!(session.step("b").unwrap().status, StepStatus::Failed);
        assert_eq!(session.step("b").unwrap().attempt_count, 3);
        assert_eq!(session.step("d").unwrap().status, StepStatus::Skipped);
        // c is independent of b and stays runnable.
        assert_eq!(board.ready_steps(&session), vec!["c"]);
    }

    #[test]
    fn test_rehydrate_resets_inflight_steps() {
        let (graph, mut session) = diamond();
        {
            let mut board = StepBoard::new(graph.clone());
            board.mark_succeeded(&mut session, "a", 1);
            board.mark_ready(&mut session, "b");
            board.mark_running(&mut session, "b");
        }

        // Simulate restart: b was mid-flight when the process died.
        let board = StepBoard::rehydrate(graph, &mut session);
        assert_eq!(session.step("b").unwrap().status, StepStatus::Pending);
        assert_eq!(board.succeeded_count(), 1);

        let ready = board.ready_steps(&session);
        assert!(ready.contains(&"b".to_string()));
        assert!(ready.contains(&"c".to_string()));
        assert!(!ready.contains(&"a".to_string()), "succeeded steps never rerun");
    }

    #[test]
    fn test_ready_is_observable_before_dispatch() {
        let (graph, mut session) = diamond();
        let board = StepBoard::new(graph);

        assert!(board.mark_ready(&mut session, "a"));
        assert_eq!(session.step("a").unwrap().status, StepStatus::Ready);
        // Marking again is a no-op, and the step stays dispatchable.
        assert!(!board.mark_ready(&mut session, "a"));
        assert_eq!(board.ready_steps(&session), vec!["a"]);

        board.mark_running(&mut session, "a");
        assert_eq!(session.step("a").unwrap().status, StepStatus::Running);
        assert!(board.ready_steps(&session).is_empty());
    }

    #[test]
    fn test_revert_to_pending_keeps_attempts() {
        let (graph, mut session) = diamond();
        let board = StepBoard::new(graph);

        board.mark_ready(&mut session, "a");
        board.mark_running(&mut session, "a");
        board.revert_to_pending(&mut session, "a", 2);

        let step = session.step("a").unwrap();
        assert_eq!(step.status, StepStatus::Pending);
        assert_eq!(step.attempt_count, 2);
    }
}
