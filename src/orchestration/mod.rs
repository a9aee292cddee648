//! Orchestration layer for the job workflow engine.
//!
//! This module turns finished tasks into graph mutations through the
//! control flow processor, and runs submitted jobs through the scheduler.

pub mod flow;
pub mod scheduler;

pub use flow::{ControlFlowProcessor, FlowEvaluator, FlowOutcome, ResultBindingEvaluator};
pub use scheduler::{HostList, NodeSelector, Scheduler, SchedulerEvent};
