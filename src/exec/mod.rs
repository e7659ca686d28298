//! Operation execution layer.
//!
//! Two interchangeable implementations sit behind `OperationExecutor`:
//!
//! 1. **Native** — shells out to the compiled performance binary over a
//!    one-line JSON protocol
//! 2. **Fallback** — equivalent pure-Rust implementation
//!
//! `HybridDispatcher` picks between them per call and demotes the native
//! path after repeated failures. Callers (the retry controller and the
//! scheduler) never know which one ran.

mod dispatch;
mod fallback;
mod native;

pub use dispatch::{CompareReport, DispatcherConfig, ExecutorPreference, HybridDispatcher};
pub use fallback::FallbackExecutor;
pub use native::NativeExecutor;

use crate::errors::EngineError;
use crate::operation::{OperationRequest, OperationResult};
use crate::telemetry::CancelSignal;
use async_trait::async_trait;

/// Capability contract implemented by every executor variant.
///
/// Implementations scope their side effects to the request and honor
/// `cancel` promptly: native kills its subprocess, fallback checks the
/// signal at each I/O chunk boundary.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    /// Short implementation name, for logs and version payloads.
    fn name(&self) -> &'static str;

    /// Perform the requested operation.
    async fn execute(
        &self,
        request: &OperationRequest,
        cancel: &CancelSignal,
    ) -> Result<OperationResult, EngineError>;
}
