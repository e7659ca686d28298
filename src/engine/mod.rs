//! Step scheduling and session execution.
//!
//! `StepBoard` answers "what can run next" over the validated graph;
//! `SessionRunner` owns the dispatch loop, concurrency bound, retries,
//! persistence and control signals. Rollback and the public session API
//! live elsewhere and drive the runner from outside.

mod board;
mod runner;

pub use board::StepBoard;
pub use runner::{ControlSignal, SessionOutcome, SessionRunner};
