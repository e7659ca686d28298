//! Hybrid native/fallback dispatch.
//!
//! Policy: prefer the native binary unless the caller disabled it, no binary
//! was configured, or native failed too many consecutive times this session
//! (then it stays down for the session's lifetime). A fallback switch logs a
//! warning and emits a `FallbackEngaged` event but never fails the step.

use crate::errors::EngineError;
use crate::exec::{FallbackExecutor, NativeExecutor, OperationExecutor};
use crate::operation::{OperationRequest, OperationResult};
use crate::telemetry::{CancelSignal, ProgressEvent, Stage, TelemetryPublisher};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Which executor the dispatcher may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorPreference {
    /// Native when healthy, fallback otherwise.
    #[default]
    Auto,
    /// Never fall back; native errors surface to the retry controller.
    NativeOnly,
    /// Never touch the native binary.
    FallbackOnly,
}

/// Dispatcher construction parameters, shared across sessions.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Path to the performance binary; `None` means fallback-only.
    pub native_binary: Option<PathBuf>,
    pub preference: ExecutorPreference,
    /// Consecutive native failures before native is marked down for the
    /// session.
    pub native_failure_threshold: u32,
    /// Grace period before force-killing a cancelled native subprocess.
    pub subprocess_grace_period: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            native_binary: None,
            preference: ExecutorPreference::Auto,
            native_failure_threshold: 3,
            subprocess_grace_period: Duration::from_secs(5),
        }
    }
}

impl DispatcherConfig {
    pub fn with_native_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.native_binary = Some(binary.into());
        self
    }

    pub fn with_preference(mut self, preference: ExecutorPreference) -> Self {
        self.preference = preference;
        self
    }

    pub fn with_native_failure_threshold(mut self, threshold: u32) -> Self {
        self.native_failure_threshold = threshold.max(1);
        self
    }
}

/// Timing comparison between the two implementations, for diagnostics only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareReport {
    pub iterations: u32,
    pub native_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_total_ms: Option<u64>,
    pub fallback_total_ms: u64,
    /// fallback time / native time; > 1.0 means native is faster.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_speedup: Option<f64>,
}

/// Per-session executor chooser. Session-scoped because native demotion
/// lasts "for the remaining session lifetime".
pub struct HybridDispatcher {
    session_id: Uuid,
    native: Option<NativeExecutor>,
    fallback: FallbackExecutor,
    preference: ExecutorPreference,
    failure_threshold: u32,
    consecutive_failures: AtomicU32,
    native_down: AtomicBool,
    telemetry: TelemetryPublisher,
}

impl HybridDispatcher {
    pub fn for_session(
        config: &DispatcherConfig,
        session_id: Uuid,
        telemetry: TelemetryPublisher,
    ) -> Self {
        let native = config.native_binary.as_ref().map(|binary| {
            NativeExecutor::new(binary).with_grace_period(config.subprocess_grace_period)
        });
        Self {
            session_id,
            native,
            fallback: FallbackExecutor::with_telemetry(session_id, telemetry.clone()),
            preference: config.preference,
            failure_threshold: config.native_failure_threshold,
            consecutive_failures: AtomicU32::new(0),
            native_down: AtomicBool::new(false),
            telemetry,
        }
    }

    /// Whether the next call would try the native path.
    pub fn native_active(&self) -> bool {
        self.native.is_some()
            && self.preference != ExecutorPreference::FallbackOnly
            && !self.native_down.load(Ordering::Acquire)
    }

    fn record_native_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.failure_threshold {
            self.native_down.store(true, Ordering::Release);
            tracing::warn!(
                session = %self.session_id,
                failures,
                "native executor marked down for the remaining session"
            );
        }
    }

    fn engage_fallback(&self, request: &OperationRequest, reason: &str) {
        tracing::warn!(
            session = %self.session_id,
            step = request.step_id,
            reason,
            "falling back to pure-software executor"
        );
        self.telemetry.emit(ProgressEvent::for_step(
            self.session_id,
            &request.step_id,
            Stage::FallbackEngaged,
            format!("native executor unavailable ({reason}); using fallback"),
        ));
    }

    /// Run the request through both implementations `iterations` times and
    /// report total timings. Never used on the scheduling path.
    pub async fn compare(
        &self,
        request: &OperationRequest,
        iterations: u32,
        cancel: &CancelSignal,
    ) -> Result<CompareReport, EngineError> {
        let iterations = iterations.max(1);

        let fallback_started = Instant::now();
        for _ in 0..iterations {
            self.fallback.execute(request, cancel).await?;
        }
        let fallback_total = fallback_started.elapsed();

        let native_total = match &self.native {
            Some(native) => {
                let started = Instant::now();
                let mut ok = true;
                for _ in 0..iterations {
                    if native.execute(request, cancel).await.is_err() {
                        ok = false;
                        break;
                    }
                }
                ok.then(|| started.elapsed())
            }
            None => None,
        };

        Ok(CompareReport {
            iterations,
            native_available: native_total.is_some(),
            native_total_ms: native_total.map(|d| d.as_millis() as u64),
            fallback_total_ms: fallback_total.as_millis() as u64,
            native_speedup: native_total.map(|n| {
                fallback_total.as_secs_f64() / n.as_secs_f64().max(f64::EPSILON)
            }),
        })
    }
}

#[async_trait]
impl OperationExecutor for HybridDispatcher {
    fn name(&self) -> &'static str {
        "hybrid"
    }

    async fn execute(
        &self,
        request: &OperationRequest,
        cancel: &CancelSignal,
    ) -> Result<OperationResult, EngineError> {
        if self.preference == ExecutorPreference::NativeOnly {
            let native = self.native.as_ref().ok_or_else(|| {
                EngineError::NativeUnavailable("no native binary configured".into())
            })?;
            return native.execute(request, cancel).await;
        }

        if self.native_active() {
            if let Some(native) = self.native.as_ref() {
                match native.execute(request, cancel).await {
                    Ok(result) => {
                        self.consecutive_failures.store(0, Ordering::Release);
                        return Ok(result);
                    }
                    Err(EngineError::NativeUnavailable(reason)) => {
                        self.record_native_failure();
                        self.engage_fallback(request, &reason);
                        // fall through to fallback
                    }
                    Err(other) => return Err(other),
                }
            }
        }

        self.fallback.execute(request, cancel).await
    }
}
