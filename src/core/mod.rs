//! Core domain models for the workflow engine.
//!
//! This module contains the task identities, templates and live instances,
//! and the job graph with its flow mutations and snapshots.

pub mod dag;
pub mod flow;
pub mod identity;
pub mod snapshot;
pub mod task;
pub mod template;

pub use dag::{Dependency, JobGraph};
pub use flow::{FlowAction, FlowActionType};
pub use identity::{JobId, TaskId};
pub use snapshot::GraphMutation;
pub use task::{ExecutionCounters, TaskInfo, TaskInstance, TaskOrder, TaskStatus};
pub use template::{FlowBlock, FlowScript, OnTaskError, RestartMode, TaskTemplate};
