//! Scheduler/executor: owns the pipeline DAG and drives steps through
//! workspace materialization, adapter supervision, contract validation and
//! state persistence.

pub mod executor;
pub mod prompt;
pub mod validate;

pub use executor::{EngineError, Executor, ExecutorConfig, RunOutcome};
pub use validate::{ValidatedPipeline, ValidationError, validate};
