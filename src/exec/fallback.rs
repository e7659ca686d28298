//! Pure-Rust fallback executor.
//!
//! Implements the same operations as the native binary with equivalent
//! observable results: identical SHA-256 digests, a standard gzip container
//! for compression. Every I/O loop checks the cancellation signal at chunk
//! boundaries so an in-flight operation stops within one chunk of a cancel,
//! and reports byte counts through the session event stream when one is
//! attached.

use crate::errors::EngineError;
use crate::exec::OperationExecutor;
use crate::operation::{Operation, OperationRequest, OperationResult};
use crate::telemetry::{CancelSignal, ProgressEvent, Stage, TelemetryPublisher};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;
use walkdir::WalkDir;

/// I/O chunk size; cancellation latency is bounded by one chunk.
const CHUNK_SIZE: usize = 64 * 1024;

/// Emit a progress event roughly once per this many bytes.
const PROGRESS_INTERVAL: u64 = 8 * 1024 * 1024;

#[derive(Debug, Default, Clone)]
pub struct FallbackExecutor {
    telemetry: Option<(Uuid, TelemetryPublisher)>,
}

/// Per-request byte counter. Reports through the executor's event stream at
/// interval boundaries and once more when the operation finishes.
struct ProgressTracker<'a> {
    telemetry: Option<&'a (Uuid, TelemetryPublisher)>,
    step_id: &'a str,
    expected: Option<u64>,
    total: u64,
    reported: u64,
}

impl<'a> ProgressTracker<'a> {
    fn new(executor: &'a FallbackExecutor, step_id: &'a str) -> Self {
        Self {
            telemetry: executor.telemetry.as_ref(),
            step_id,
            expected: None,
            total: 0,
            reported: 0,
        }
    }

    /// Total bytes the operation expects to move, when knowable up front.
    fn expect(&mut self, bytes: u64) {
        self.expected = Some(bytes);
    }

    fn add(&mut self, bytes: u64) {
        self.total += bytes;
        if self.total - self.reported >= PROGRESS_INTERVAL {
            self.report();
        }
    }

    fn finish(&mut self) {
        if self.total > 0 {
            self.report();
        }
    }

    fn report(&mut self) {
        self.reported = self.total;
        let Some((session_id, telemetry)) = self.telemetry else {
            return;
        };
        let mut event = ProgressEvent::for_step(
            *session_id,
            self.step_id,
            Stage::StepProgress,
            format!("{} bytes processed", self.total),
        )
        .with_metrics(json!({ "bytes_processed": self.total }));
        if let Some(expected) = self.expected.filter(|e| *e > 0) {
            event = event.with_percent((self.total as f64 / expected as f64 * 100.0).min(100.0));
        }
        telemetry.emit(event);
    }
}

impl FallbackExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a session-scoped event stream; the byte loops then emit
    /// `StepProgress` events as data moves.
    pub fn with_telemetry(session_id: Uuid, telemetry: TelemetryPublisher) -> Self {
        Self {
            telemetry: Some((session_id, telemetry)),
        }
    }

    /// Chunked single-file copy with cancel checks. Returns bytes written.
    async fn copy_file(
        source: &Path,
        dest: &Path,
        cancel: &CancelSignal,
        progress: &mut ProgressTracker<'_>,
    ) -> Result<u64, EngineError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::from_io("create destination directory", e))?;
        }

        let mut reader = tokio::fs::File::open(source)
            .await
            .map_err(|e| EngineError::from_io(&format!("open {}", source.display()), e))?;
        let mut writer = tokio::fs::File::create(dest)
            .await
            .map_err(|e| EngineError::from_io(&format!("create {}", dest.display()), e))?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| EngineError::from_io("read chunk", e))?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buf[..n])
                .await
                .map_err(|e| EngineError::from_io("write chunk", e))?;
            total += n as u64;
            progress.add(n as u64);
        }
        writer
            .flush()
            .await
            .map_err(|e| EngineError::from_io("flush destination", e))?;
        Ok(total)
    }

    async fn copy(
        &self,
        source: &Path,
        dest: &Path,
        cancel: &CancelSignal,
        progress: &mut ProgressTracker<'_>,
    ) -> Result<(serde_json::Value, u64), EngineError> {
        let meta = tokio::fs::metadata(source)
            .await
            .map_err(|e| EngineError::from_io(&format!("stat {}", source.display()), e))?;

        if meta.is_file() {
            progress.expect(meta.len());
            let bytes = Self::copy_file(source, dest, cancel, progress).await?;
            return Ok((json!({ "files": 1, "bytes_processed": bytes }), bytes));
        }

        let mut files = 0u64;
        let mut total = 0u64;
        for entry in WalkDir::new(source) {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let entry =
                entry.map_err(|e| EngineError::Transient(format!("walk source tree: {e}")))?;
            let rel = entry
                .path()
                .strip_prefix(source)
                .map_err(|e| EngineError::Fatal(format!("path outside source root: {e}")))?;
            let target = dest.join(rel);

            if entry.file_type().is_dir() {
                tokio::fs::create_dir_all(&target)
                    .await
                    .map_err(|e| EngineError::from_io("create directory", e))?;
            } else if entry.file_type().is_file() {
                total += Self::copy_file(entry.path(), &target, cancel, progress).await?;
                files += 1;
            }
        }
        Ok((json!({ "files": files, "bytes_processed": total }), total))
    }

    async fn checksum(
        &self,
        path: &Path,
        cancel: &CancelSignal,
        progress: &mut ProgressTracker<'_>,
    ) -> Result<(serde_json::Value, u64), EngineError> {
        let mut reader = tokio::fs::File::open(path)
            .await
            .map_err(|e| EngineError::from_io(&format!("open {}", path.display()), e))?;
        if let Ok(meta) = reader.metadata().await {
            progress.expect(meta.len());
        }

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| EngineError::from_io("read chunk", e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            total += n as u64;
            progress.add(n as u64);
        }

        let digest = format!("{:x}", hasher.finalize());
        Ok((
            json!({ "algorithm": "sha256", "digest": digest, "bytes_processed": total }),
            total,
        ))
    }

    async fn compress(
        &self,
        source: &Path,
        dest: &Path,
        cancel: &CancelSignal,
        progress: &mut ProgressTracker<'_>,
    ) -> Result<(serde_json::Value, u64), EngineError> {
        let mut reader = tokio::fs::File::open(source)
            .await
            .map_err(|e| EngineError::from_io(&format!("open {}", source.display()), e))?;
        if let Ok(meta) = reader.metadata().await {
            progress.expect(meta.len());
        }
        let out = std::fs::File::create(dest)
            .map_err(|e| EngineError::from_io(&format!("create {}", dest.display()), e))?;

        let mut encoder = GzEncoder::new(out, Compression::default());
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut read_total = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| EngineError::from_io("read chunk", e))?;
            if n == 0 {
                break;
            }
            encoder
                .write_all(&buf[..n])
                .map_err(|e| EngineError::from_io("compress chunk", e))?;
            read_total += n as u64;
            progress.add(n as u64);
        }
        let out = encoder
            .finish()
            .map_err(|e| EngineError::from_io("finish gzip stream", e))?;
        let written = out
            .metadata()
            .map(|m| m.len())
            .unwrap_or_default();

        Ok((
            json!({
                "container": "gzip",
                "bytes_in": read_total,
                "bytes_out": written,
                "bytes_processed": read_total,
            }),
            read_total,
        ))
    }

    async fn transfer(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancelSignal,
        progress: &mut ProgressTracker<'_>,
    ) -> Result<(serde_json::Value, u64), EngineError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::from_io("create destination directory", e))?;
        }

        let response = reqwest::get(url)
            .await
            .map_err(|e| EngineError::Transient(format!("request {url}: {e}")))?;
        let mut response = response.error_for_status().map_err(|e| {
            let status = e.status();
            match status {
                // Client errors will not heal on retry.
                Some(s) if s.is_client_error() => {
                    EngineError::Fatal(format!("transfer {url}: {e}"))
                }
                _ => EngineError::Transient(format!("transfer {url}: {e}")),
            }
        })?;
        if let Some(length) = response.content_length() {
            progress.expect(length);
        }

        let mut writer = tokio::fs::File::create(dest)
            .await
            .map_err(|e| EngineError::from_io(&format!("create {}", dest.display()), e))?;

        let mut total = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| EngineError::Transient(format!("read body: {e}")))?
        {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| EngineError::from_io("write chunk", e))?;
            total += chunk.len() as u64;
            progress.add(chunk.len() as u64);
        }
        writer
            .flush()
            .await
            .map_err(|e| EngineError::from_io("flush destination", e))?;

        Ok((json!({ "url": url, "bytes_processed": total }), total))
    }

    async fn monitor(&self) -> Result<(serde_json::Value, u64), EngineError> {
        let mut metrics = json!({});

        #[cfg(target_os = "linux")]
        {
            if let Ok(loadavg) = tokio::fs::read_to_string("/proc/loadavg").await {
                let fields: Vec<&str> = loadavg.split_whitespace().collect();
                if fields.len() >= 3 {
                    metrics["load_1m"] = json!(fields[0].parse::<f64>().unwrap_or(0.0));
                    metrics["load_5m"] = json!(fields[1].parse::<f64>().unwrap_or(0.0));
                    metrics["load_15m"] = json!(fields[2].parse::<f64>().unwrap_or(0.0));
                }
            }
            if let Ok(meminfo) = tokio::fs::read_to_string("/proc/meminfo").await {
                for line in meminfo.lines() {
                    let kb = |l: &str| {
                        l.split_whitespace()
                            .nth(1)
                            .and_then(|v| v.parse::<u64>().ok())
                    };
                    if let Some(rest) = line.strip_prefix("MemTotal:") {
                        metrics["mem_total_kb"] = json!(kb(rest).unwrap_or(0));
                    } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
                        metrics["mem_available_kb"] = json!(kb(rest).unwrap_or(0));
                    }
                }
            }
        }

        metrics["sampled_at"] = json!(chrono::Utc::now().to_rfc3339());
        Ok((metrics, 0))
    }

    async fn remove(&self, path: &Path) -> Result<(serde_json::Value, u64), EngineError> {
        // Compensations must be idempotent: removing something already gone
        // is a success.
        let removed = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => {
                tokio::fs::remove_dir_all(path)
                    .await
                    .map_err(|e| EngineError::Transient(format!("remove dir: {e}")))?;
                true
            }
            Ok(_) => {
                tokio::fs::remove_file(path)
                    .await
                    .map_err(|e| EngineError::Transient(format!("remove file: {e}")))?;
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(EngineError::from_io("stat removal target", e)),
        };
        Ok((json!({ "removed": removed }), 0))
    }
}

#[async_trait]
impl OperationExecutor for FallbackExecutor {
    fn name(&self) -> &'static str {
        "fallback"
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
        let mut progress = ProgressTracker::new(self, &request.step_id);
        let (data, bytes) = match &request.operation {
            Operation::Copy { source, dest } => {
                self.copy(source, dest, cancel, &mut progress).await?
            }
            Operation::Checksum { path } => self.checksum(path, cancel, &mut progress).await?,
            Operation::Compress { source, dest } => {
                self.compress(source, dest, cancel, &mut progress).await?
            }
            Operation::Transfer { url, dest } => {
                self.transfer(url, dest, cancel, &mut progress).await?
            }
            Operation::Monitor => self.monitor().await?,
            Operation::Version => (
                json!({
                    "implementation": "fallback",
                    "version": env!("CARGO_PKG_VERSION"),
                }),
                0,
            ),
            Operation::Remove { path } => self.remove(path).await?,
            Operation::RestoreBackup { backup, dest } => {
                self.copy(backup, dest, cancel, &mut progress).await?
            }
        };
        progress.finish();

        Ok(OperationResult::ok(data, started.elapsed(), bytes))
    }
}
