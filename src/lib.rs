pub mod config;
pub mod core;
pub mod error;
pub mod job;
pub mod lifecycle;
pub mod log;
pub mod orchestration;

pub use error::{Error, Result};
pub use job::{Job, JobSettings, JobStatus};
pub use lifecycle::{ExecutionOutcome, ExecutionReport, TaskLifecycle, Transition};
