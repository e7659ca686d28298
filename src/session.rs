//! Session and step state.
//!
//! A `MigrationSession` is the persisted record of one migration: the step
//! list (with per-step status), lifecycle timestamps, the success order
//! consumed by rollback, and the failure/rollback reports surfaced to
//! callers. It is owned by the scheduler and mutated only under the
//! session lock; everything here is serde-serializable so the store can
//! snapshot it on every transition.

use crate::errors::ErrorKind;
use crate::operation::Operation;
use crate::plan::{StepGraph, StepSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Lifecycle of a session. Reaches a terminal value once; the single
/// permitted refinement is `Failed`/`Cancelled` → `RolledBack` after
/// compensation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
    RolledBack,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::RolledBack
        )
    }

    /// Terminal states from which rollback may still run.
    pub fn rollback_eligible(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::RolledBack => "rolled_back",
        }
    }
}

/// Lifecycle of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    /// Dependencies became unsatisfiable (an ancestor failed).
    Skipped,
    /// Succeeded, then undone by its compensating action during rollback.
    Compensated,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Compensated
        )
    }
}

/// A step and its mutable execution state. The operation, dependencies and
/// compensating action are fixed at plan time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: String,
    pub operation: Operation,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensating_action: Option<Operation>,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl StepRecord {
    fn from_spec(spec: StepSpec) -> Self {
        Self {
            id: spec.id,
            operation: spec.operation,
            depends_on: spec.depends_on,
            compensating_action: spec.compensating_action,
            status: StepStatus::Pending,
            attempt_count: 0,
            last_error: None,
        }
    }
}

/// A backup created by a step, referenced later by compensating actions.
/// Records are only ever appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub step_id: String,
    pub location: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// What went wrong, for the caller. Always present on a failed session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub step_id: String,
    pub error_kind: ErrorKind,
    pub message: String,
    pub attempts: u32,
}

/// One compensation that could not be applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationFailure {
    pub step_id: String,
    pub message: String,
}

/// Outcome of a rollback pass. `unresolved` lists compensations that failed
/// and were left for manual cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackReport {
    /// Session status before rollback ran (`failed` or `cancelled`).
    pub prior_status: SessionStatus,
    /// Step ids whose compensations were attempted, in replay order.
    pub compensated: Vec<String>,
    pub unresolved: Vec<CompensationFailure>,
    pub finished_at: DateTime<Utc>,
}

impl RollbackReport {
    pub fn fully_succeeded(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Tunables for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Upper bound on concurrently running steps.
    pub max_concurrent_steps: usize,
    /// When true, a step exhausting its retries halts the session; when
    /// false, independent branches keep running.
    pub stop_on_failure: bool,
    /// Run rollback automatically when the session ends failed/cancelled.
    pub auto_rollback: bool,
    /// Per-step timeout in seconds; `None` means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_timeout_secs: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: 4,
            stop_on_failure: true,
            auto_rollback: true,
            step_timeout_secs: None,
        }
    }
}

impl SessionConfig {
    pub fn with_max_concurrent_steps(mut self, max: usize) -> Self {
        self.max_concurrent_steps = max.max(1);
        self
    }

    pub fn with_stop_on_failure(mut self, stop: bool) -> Self {
        self.stop_on_failure = stop;
        self
    }

    pub fn with_auto_rollback(mut self, auto: bool) -> Self {
        self.auto_rollback = auto;
        self
    }

    pub fn with_step_timeout_secs(mut self, secs: u64) -> Self {
        self.step_timeout_secs = Some(secs);
        self
    }
}

/// The persisted state of one migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationSession {
    pub id: Uuid,
    pub status: SessionStatus,
    pub steps: Vec<StepRecord>,
    pub config: SessionConfig,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Step ids in the order they succeeded; rollback replays this in
    /// reverse.
    #[serde(default)]
    pub completion_order: Vec<String>,
    #[serde(default)]
    pub backups: Vec<BackupRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackReport>,
}

impl MigrationSession {
    /// Create a pending session from a validated plan.
    pub fn from_plan(graph: &StepGraph, config: SessionConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: SessionStatus::Pending,
            steps: graph
                .steps()
                .iter()
                .cloned()
                .map(StepRecord::from_spec)
                .collect(),
            config,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            completion_order: Vec::new(),
            backups: Vec::new(),
            failure: None,
            rollback: None,
        }
    }

    /// Rebuild the immutable dependency graph from the persisted step list.
    /// Used on rehydration; the plan validated once already, so this only
    /// fails if the stored snapshot was corrupted by hand.
    pub fn rebuild_graph(&self) -> Result<StepGraph, crate::errors::EngineError> {
        let specs = self
            .steps
            .iter()
            .map(|s| StepSpec {
                id: s.id.clone(),
                operation: s.operation.clone(),
                depends_on: s.depends_on.clone(),
                compensating_action: s.compensating_action.clone(),
            })
            .collect();
        crate::plan::PlanBuilder::new(specs).build()
    }

    pub fn step(&self, id: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut StepRecord> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// Append a backup record. The ledger is append-only.
    pub fn record_backup(&mut self, step_id: impl Into<String>, location: impl Into<PathBuf>) {
        self.backups.push(BackupRecord {
            step_id: step_id.into(),
            location: location.into(),
            created_at: Utc::now(),
        });
    }

    /// Latest recorded backup for a step, if any. Compensating
    /// `RestoreBackup` actions resolve through this during rollback.
    pub fn backup_for(&self, step_id: &str) -> Option<&BackupRecord> {
        self.backups.iter().rev().find(|b| b.step_id == step_id)
    }

    pub fn counts(&self) -> StepCounts {
        let mut counts = StepCounts::default();
        for step in &self.steps {
            match step.status {
                StepStatus::Succeeded => counts.succeeded += 1,
                StepStatus::Failed => counts.failed += 1,
                StepStatus::Skipped => counts.skipped += 1,
                StepStatus::Compensated => counts.compensated += 1,
                StepStatus::Running => counts.running += 1,
                _ => counts.pending += 1,
            }
        }
        counts.total = self.steps.len();
        counts
    }
}

/// Per-status step tally for status reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub compensated: usize,
}
