pub mod engine;
pub mod errors;
pub mod exec;
pub mod manager;
pub mod operation;
pub mod plan;
pub mod retry;
pub mod rollback;
pub mod session;
pub mod store;
pub mod telemetry;

pub use engine::{SessionOutcome, SessionRunner};
pub use errors::{EngineError, ErrorKind};
pub use exec::{
    DispatcherConfig, ExecutorPreference, FallbackExecutor, HybridDispatcher, NativeExecutor,
    OperationExecutor,
};
pub use manager::SessionManager;
pub use operation::{HostDescription, Operation, OperationRequest, OperationResult};
pub use plan::{PlanBuilder, PlatformAdapter, StepGraph, StepSpec};
pub use retry::RetryPolicy;
pub use rollback::RollbackManager;
pub use session::{
    MigrationSession, RollbackReport, SessionConfig, SessionStatus, StepStatus,
};
pub use store::SessionStore;
pub use telemetry::{ProgressEvent, Stage, TelemetryPublisher};
