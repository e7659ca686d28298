//! Executor backed by the compiled performance binary.
//!
//! Protocol: `<binary> <operation> [--key value ...]`, response is a single
//! JSON line on stdout: `{"success": bool, "data": {...}, "error": "..."}`.
//! Anything else — spawn failure, non-zero exit, non-JSON output — is
//! `NativeUnavailable`, which the dispatcher absorbs by switching to the
//! fallback implementation.

use crate::errors::EngineError;
use crate::exec::OperationExecutor;
use crate::operation::{OperationRequest, OperationResult};
use crate::telemetry::CancelSignal;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Default grace period between closing the child's stdin and force-killing
/// it on cancellation.
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Response envelope emitted by the native binary.
#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    error: Option<String>,
}

pub struct NativeExecutor {
    binary: PathBuf,
    grace_period: Duration,
}

impl NativeExecutor {
    pub fn new(binary: impl AsRef<Path>) -> Self {
        Self {
            binary: binary.as_ref().to_path_buf(),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn parse_envelope(&self, stdout: &str) -> Result<Envelope, EngineError> {
        let line = stdout.lines().next().unwrap_or("").trim();
        serde_json::from_str(line).map_err(|e| {
            EngineError::NativeUnavailable(format!(
                "malformed response from {}: {e}",
                self.binary.display()
            ))
        })
    }
}

#[async_trait]
impl OperationExecutor for NativeExecutor {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn execute(
        &self,
        request: &OperationRequest,
        cancel: &CancelSignal,
    ) -> Result<OperationResult, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let started = Instant::now();
        let args = request.operation.to_args();

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EngineError::NativeUnavailable(format!(
                    "failed to spawn {}: {e}",
                    self.binary.display()
                ))
            })?;

        // Drain both pipes concurrently so the child can never block on a
        // full pipe while we wait on it. Only stdout carries the envelope;
        // stderr is free-form logging and gets discarded.
        let mut stdout_pipe = child.stdout.take().ok_or_else(|| {
            EngineError::NativeUnavailable("child stdout was not captured".into())
        })?;
        let reader = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stdout_pipe.read_to_string(&mut buf).await;
            buf
        });
        let mut stderr_pipe = child.stderr.take().ok_or_else(|| {
            EngineError::NativeUnavailable("child stderr was not captured".into())
        })?;
        let stderr_drain = tokio::spawn(async move {
            let mut sink = tokio::io::sink();
            let _ = tokio::io::copy(&mut stderr_pipe, &mut sink).await;
        });

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| {
                EngineError::NativeUnavailable(format!("wait on native binary failed: {e}"))
            })?,
            _ = cancel.cancelled() => {
                // Ask nicely first: closing stdin is the binary's shutdown
                // cue. Force-kill once the grace period runs out.
                drop(child.stdin.take());
                if tokio::time::timeout(self.grace_period, child.wait()).await.is_err() {
                    tracing::warn!(
                        step = request.step_id,
                        binary = %self.binary.display(),
                        "native subprocess ignored shutdown, force-killing"
                    );
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
                reader.abort();
                stderr_drain.abort();
                return Err(EngineError::Cancelled);
            }
        };

        let stdout = reader.await.unwrap_or_default();
        // The child exited, so stderr is at EOF and the drain finishes.
        let _ = stderr_drain.await;

        if !status.success() {
            return Err(EngineError::NativeUnavailable(format!(
                "{} exited with {} running '{}'",
                self.binary.display(),
                status.code().map_or_else(|| "signal".into(), |c| c.to_string()),
                args.join(" "),
            )));
        }

        let envelope = self.parse_envelope(&stdout)?;
        let duration = started.elapsed();

        if !envelope.success {
            let message = envelope
                .error
                .unwrap_or_else(|| "native operation failed without detail".into());
            return Err(EngineError::Transient(message));
        }

        let bytes_processed = envelope
            .data
            .get("bytes_processed")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        Ok(OperationResult::ok(envelope.data, duration, bytes_processed))
    }
}
