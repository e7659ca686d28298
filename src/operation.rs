//! Operation value types exchanged between the scheduler and executors.
//!
//! The scheduler treats an `Operation` as opaque: it only moves requests to
//! an executor and results back. Executors pattern-match the variant.

use crate::errors::ErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// A single unit of migration work, tagged by kind.
///
/// `Remove` and `RestoreBackup` exist primarily as compensating actions for
/// `Copy`/`Transfer`/`Compress` steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    /// Copy a file or directory tree.
    Copy { source: PathBuf, dest: PathBuf },
    /// SHA-256 digest of a file.
    Checksum { path: PathBuf },
    /// Gzip-compress a single file.
    Compress { source: PathBuf, dest: PathBuf },
    /// Download a resource over HTTP(S).
    Transfer { url: String, dest: PathBuf },
    /// Sample host resource usage.
    Monitor,
    /// Report executor version information.
    Version,
    /// Delete a file or directory tree (compensation for Copy/Transfer).
    Remove { path: PathBuf },
    /// Restore a previously recorded backup over a destination.
    RestoreBackup { backup: PathBuf, dest: PathBuf },
}

impl Operation {
    /// The operation name used on the native binary's command line.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Copy { .. } => "copy",
            Self::Checksum { .. } => "checksum",
            Self::Compress { .. } => "compress",
            Self::Transfer { .. } => "transfer",
            Self::Monitor => "monitor",
            Self::Version => "version",
            Self::Remove { .. } => "remove",
            Self::RestoreBackup { .. } => "restore_backup",
        }
    }

    /// Flatten the operation's parameters into `--key value` pairs for the
    /// native binary protocol. Keys are emitted in sorted order so the argv
    /// is deterministic.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![self.name().to_string()];

        let value = serde_json::to_value(self).unwrap_or_default();
        if let serde_json::Value::Object(map) = value {
            let params: BTreeMap<_, _> =
                map.into_iter().filter(|(k, _)| k != "kind").collect();
            for (key, val) in params {
                args.push(format!("--{key}"));
                match val {
                    serde_json::Value::String(s) => args.push(s),
                    other => args.push(other.to_string()),
                }
            }
        }

        args
    }
}

/// A request handed to an `OperationExecutor`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    /// Id of the step this request belongs to.
    pub step_id: String,
    /// The work to perform.
    pub operation: Operation,
    /// Optional per-step timeout, independent of session cancellation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl OperationRequest {
    pub fn new(step_id: impl Into<String>, operation: Operation) -> Self {
        Self {
            step_id: step_id.into(),
            operation,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// The outcome of executing one operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Operation-specific payload (digest hex, bytes written, samples, ...).
    pub data: serde_json::Value,
    /// Classification of the failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Wall-clock duration of the attempt.
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    /// Bytes read or written, when measurable.
    pub bytes_processed: u64,
}

impl OperationResult {
    /// Build a successful result.
    pub fn ok(data: serde_json::Value, duration: Duration, bytes_processed: u64) -> Self {
        Self {
            success: true,
            data,
            error_kind: None,
            duration,
            bytes_processed,
        }
    }
}

/// Description of a migration endpoint, supplied by the platform adapter's
/// caller. Opaque to the engine beyond display purposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostDescription {
    /// Human-readable label ("old shared host", "new VPS").
    pub label: String,
    /// Network address or hostname.
    pub address: String,
    /// Root path of the site on this host.
    pub root_path: PathBuf,
    /// Adapter-specific parameters (database name, platform hints, ...).
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl HostDescription {
    pub fn new(
        label: impl Into<String>,
        address: impl Into<String>,
        root_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            label: label.into(),
            address: address.into(),
            root_path: root_path.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Serde helper: durations as integer milliseconds.
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
