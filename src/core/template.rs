//! Immutable task definitions as submitted with a job.
//!
//! A [`TaskTemplate`] is one record with a closed [`ExecutableKind`] variant
//! instead of a task class hierarchy. Templates are validated once, when
//! they are added to a job graph, and never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::NamingRules;
use crate::core::flow::FlowActionType;
use crate::core::identity::sanitize_name;
use crate::error::{Error, Result};

/// Position of a task in a START/END delimited flow block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FlowBlock {
    #[default]
    None,
    Start,
    End,
}

/// Where a task may be restarted after an execution error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RestartMode {
    #[default]
    Anywhere,
    /// Hosts that already ran the task are excluded from the next attempt.
    Elsewhere,
}

/// Response once a task has no executions left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnTaskError {
    /// Task ends FAULTY; the job fails unless cancel-on-error is disabled.
    #[default]
    None,
    CancelJob,
    PauseTask,
    PauseJob,
    ContinueJobExecution,
}

impl std::fmt::Display for OnTaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OnTaskError::None => write!(f, "none"),
            OnTaskError::CancelJob => write!(f, "cancel_job"),
            OnTaskError::PauseTask => write!(f, "pause_task"),
            OnTaskError::PauseJob => write!(f, "pause_job"),
            OnTaskError::ContinueJobExecution => write!(f, "continue_job_execution"),
        }
    }
}

/// What the execution worker runs for this task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ExecutableKind {
    /// Managed code loaded by class or entry point name.
    Managed {
        entry_point: String,
        #[serde(default)]
        arguments: BTreeMap<String, String>,
    },
    /// Native command line.
    NativeCommand {
        command: Vec<String>,
        working_dir: Option<String>,
    },
    /// Script evaluated by a named engine.
    Script { engine: String, script: String },
}

/// Node layout requested by a multi-node task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Topology {
    #[default]
    Arbitrary,
    BestProximity,
    ThresholdProximity {
        threshold: u64,
    },
    SingleHost,
    SingleHostExclusive,
    MultipleHostsExclusive,
    DifferentHostsExclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelEnvironment {
    pub nodes_number: u32,
    #[serde(default)]
    pub topology: Topology,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TaskVariable {
    pub value: String,
    pub model: Option<String>,
    #[serde(default)]
    pub job_inherited: bool,
}

/// Dataspace a file selector reads from or writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    TransferFromInputSpace,
    TransferFromOutputSpace,
    TransferFromGlobalSpace,
    TransferFromUserSpace,
    TransferToOutputSpace,
    TransferToGlobalSpace,
    TransferToUserSpace,
    None,
}

/// Input/output file selection stored and forwarded to the dataspace manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSelector {
    pub includes: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
    pub access_mode: AccessMode,
}

/// Reference to the script deciding a task's control flow action.
///
/// The script itself runs in the execution worker; the targets name the
/// tasks the action refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowScript {
    pub action_type: FlowActionType,
    pub script: String,
    pub target: Option<String>,
    pub target_else: Option<String>,
    pub continuation: Option<String>,
}

impl FlowScript {
    pub fn replicate(script: &str) -> Self {
        Self {
            action_type: FlowActionType::Replicate,
            script: script.to_string(),
            target: None,
            target_else: None,
            continuation: None,
        }
    }

    pub fn looping(script: &str, target: &str) -> Self {
        Self {
            action_type: FlowActionType::Loop,
            script: script.to_string(),
            target: Some(target.to_string()),
            target_else: None,
            continuation: None,
        }
    }

    pub fn branch(script: &str, target: &str, target_else: &str, continuation: Option<&str>) -> Self {
        Self {
            action_type: FlowActionType::If,
            script: script.to_string(),
            target: Some(target.to_string()),
            target_else: Some(target_else.to_string()),
            continuation: continuation.map(str::to_string),
        }
    }

    fn validate(&self, owner: &str) -> Result<()> {
        let missing = |what: &str| {
            Err(Error::Validation(format!(
                "{} action of task '{}' requires {}",
                self.action_type, owner, what
            )))
        };
        match self.action_type {
            FlowActionType::Loop if self.target.is_none() => missing("a target"),
            FlowActionType::If if self.target.is_none() => missing("a target"),
            FlowActionType::If if self.target_else.is_none() => missing("an else target"),
            FlowActionType::If if self.target == self.target_else => Err(Error::Validation(
                format!("IF and ELSE targets of task '{}' are the same", owner),
            )),
            _ => Ok(()),
        }
    }
}

/// Definition of one task, immutable after submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub name: String,
    pub description: String,
    pub tag: Option<String>,
    /// Names of parent templates, in declaration order.
    pub dependencies: Vec<String>,
    pub flow_block: FlowBlock,
    pub flow_script: Option<FlowScript>,
    pub restart_mode: RestartMode,
    pub max_number_of_execution: u32,
    pub max_number_of_execution_on_failure: u32,
    pub on_task_error: OnTaskError,
    pub generic_information: BTreeMap<String, String>,
    pub variables: BTreeMap<String, TaskVariable>,
    pub executable: ExecutableKind,
    pub parallel_environment: Option<ParallelEnvironment>,
    pub input_files: Vec<FileSelector>,
    pub output_files: Vec<FileSelector>,
}

impl TaskTemplate {
    pub fn new(name: &str, executable: ExecutableKind) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            tag: None,
            dependencies: Vec::new(),
            flow_block: FlowBlock::None,
            flow_script: None,
            restart_mode: RestartMode::Anywhere,
            max_number_of_execution: 1,
            max_number_of_execution_on_failure: 2,
            on_task_error: OnTaskError::None,
            generic_information: BTreeMap::new(),
            variables: BTreeMap::new(),
            executable,
            parallel_environment: None,
            input_files: Vec::new(),
            output_files: Vec::new(),
        }
    }

    /// A native command template, mostly useful in tests and examples.
    pub fn command(name: &str, command: &str) -> Self {
        Self::new(
            name,
            ExecutableKind::NativeCommand {
                command: command.split_whitespace().map(str::to_string).collect(),
                working_dir: None,
            },
        )
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tag = Some(tag.to_string());
        self
    }

    pub fn depends_on(mut self, parent: &str) -> Self {
        self.dependencies.push(parent.to_string());
        self
    }

    pub fn with_flow_block(mut self, block: FlowBlock) -> Self {
        self.flow_block = block;
        self
    }

    pub fn with_flow_script(mut self, script: FlowScript) -> Self {
        self.flow_script = Some(script);
        self
    }

    pub fn with_restart_mode(mut self, mode: RestartMode) -> Self {
        self.restart_mode = mode;
        self
    }

    pub fn with_max_executions(mut self, max: u32) -> Self {
        self.max_number_of_execution = max;
        self
    }

    pub fn with_max_executions_on_failure(mut self, max: u32) -> Self {
        self.max_number_of_execution_on_failure = max;
        self
    }

    pub fn with_on_task_error(mut self, policy: OnTaskError) -> Self {
        self.on_task_error = policy;
        self
    }

    pub fn with_generic_information(mut self, key: &str, value: &str) -> Self {
        self.generic_information
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_variable(mut self, name: &str, variable: TaskVariable) -> Self {
        self.variables.insert(name.to_string(), variable);
        self
    }

    pub fn with_parallel_environment(mut self, env: ParallelEnvironment) -> Self {
        self.parallel_environment = Some(env);
        self
    }

    pub fn with_input_files(mut self, selector: FileSelector) -> Self {
        self.input_files.push(selector);
        self
    }

    pub fn with_output_files(mut self, selector: FileSelector) -> Self {
        self.output_files.push(selector);
        self
    }

    /// Check the template and return it with its name normalized by the
    /// configured reserved character policy.
    pub fn validated(mut self, config: &NamingRules) -> Result<Self> {
        self.name = sanitize_name(&self.name, config.reserved_names, config.substitute_char)?;

        if self.name.is_empty() {
            return Err(Error::Validation("task name cannot be empty".to_string()));
        }
        if self.name.chars().count() > config.max_name_length {
            return Err(Error::Validation(format!(
                "task name '{}' exceeds {} characters",
                self.name, config.max_name_length
            )));
        }
        if self.max_number_of_execution < 1 {
            return Err(Error::Validation(format!(
                "task '{}' must allow at least one execution",
                self.name
            )));
        }
        if let Some(key) = self
            .generic_information
            .keys()
            .find(|k| k.chars().count() > config.max_name_length)
        {
            return Err(Error::Validation(format!(
                "generic information key of task '{}' exceeds {} characters: {}",
                self.name, config.max_name_length, key
            )));
        }
        if let Some(env) = &self.parallel_environment {
            if env.nodes_number < 1 {
                return Err(Error::Validation(format!(
                    "parallel environment of task '{}' needs at least one node",
                    self.name
                )));
            }
        }
        if let Some(script) = &self.flow_script {
            script.validate(&self.name)?;
        }
        Ok(self)
    }
}
