//! Progress event fan-out and the session cancellation signal.
//!
//! Events are best-effort: the publisher never blocks on subscribers. The
//! broadcast channel is bounded; a subscriber that falls behind observes
//! `Lagged` and loses the oldest events instead of backpressuring execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

/// Default bound on the event buffer.
const DEFAULT_CAPACITY: usize = 256;

/// Where in the session lifecycle an event was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Planned,
    SessionStarted,
    StepStarted,
    StepProgress,
    RetryScheduled,
    FallbackEngaged,
    StepSucceeded,
    StepFailed,
    StepSkipped,
    SessionPaused,
    SessionResumed,
    SessionCancelling,
    SessionCancelled,
    SessionCompleted,
    SessionFailed,
    RollbackStarted,
    StepCompensated,
    CompensationFailed,
    RollbackFinished,
}

/// A single progress event. Append-only, never primary state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub session_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(session_id: Uuid, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            session_id,
            step_id: None,
            stage,
            percent: None,
            message: message.into(),
            metrics: None,
            timestamp: Utc::now(),
        }
    }

    pub fn for_step(
        session_id: Uuid,
        step_id: impl Into<String>,
        stage: Stage,
        message: impl Into<String>,
    ) -> Self {
        Self {
            step_id: Some(step_id.into()),
            ..Self::new(session_id, stage, message)
        }
    }

    pub fn with_percent(mut self, percent: f64) -> Self {
        self.percent = Some(percent);
        self
    }

    pub fn with_metrics(mut self, metrics: serde_json::Value) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Single-writer, multi-subscriber event publisher. Cheap to clone; all
/// clones feed the same channel.
#[derive(Debug, Clone)]
pub struct TelemetryPublisher {
    tx: broadcast::Sender<ProgressEvent>,
}

impl TelemetryPublisher {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event. Silently dropped when nobody is subscribed.
    pub fn emit(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }

    /// Join the stream. The receiver only sees events emitted after this
    /// call; leaving is just dropping the receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for TelemetryPublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// Owning side of a session-scoped cancellation signal.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Fire the signal. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Observing side of the cancellation signal, cloned into every in-flight
/// task. Checked at chunk boundaries by executors and raced against sleeps
/// by the retry controller.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when the signal fires. Resolves immediately if it already has.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                // Handle dropped without firing: treat as never-cancelled.
                std::future::pending::<()>().await;
            }
        }
    }

    /// A signal that never fires, for callers outside any session. The
    /// sender is dropped immediately; `cancelled` already treats a closed
    /// channel as never-cancelled.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }
}

/// Create a linked cancel handle/signal pair.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}
