//! Control flow actions produced by a task's flow script.

use serde::{Deserialize, Serialize};

/// Kind of control flow a flow script may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowActionType {
    If,
    Replicate,
    Loop,
    Continue,
}

impl std::fmt::Display for FlowActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowActionType::If => write!(f, "if"),
            FlowActionType::Replicate => write!(f, "replicate"),
            FlowActionType::Loop => write!(f, "loop"),
            FlowActionType::Continue => write!(f, "continue"),
        }
    }
}

/// Result of evaluating a flow script after a successful execution.
///
/// Targets are base task names; the graph resolves them against the
/// initiator's scope (same replication index, latest iteration).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum FlowAction {
    #[default]
    None,
    /// `target` is the branch that was selected, `target_else` the bypassed one.
    If {
        target: String,
        target_else: String,
        continuation: Option<String>,
    },
    Replicate {
        runs: u32,
    },
    Loop {
        target: String,
    },
    Continue,
}

impl FlowAction {
    pub fn action_type(&self) -> Option<FlowActionType> {
        match self {
            FlowAction::None => None,
            FlowAction::If { .. } => Some(FlowActionType::If),
            FlowAction::Replicate { .. } => Some(FlowActionType::Replicate),
            FlowAction::Loop { .. } => Some(FlowActionType::Loop),
            FlowAction::Continue => Some(FlowActionType::Continue),
        }
    }

    /// NONE and CONTINUE leave the graph untouched.
    pub fn mutates_graph(&self) -> bool {
        matches!(
            self,
            FlowAction::If { .. } | FlowAction::Replicate { .. } | FlowAction::Loop { .. }
        )
    }
}

impl std::fmt::Display for FlowAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowAction::None => write!(f, "none"),
            FlowAction::If {
                target,
                target_else,
                continuation,
            } => match continuation {
                Some(join) => write!(f, "if {} (else {}, join {})", target, target_else, join),
                None => write!(f, "if {} (else {})", target, target_else),
            },
            FlowAction::Replicate { runs } => write!(f, "replicate x{}", runs),
            FlowAction::Loop { target } => write!(f, "loop to {}", target),
            FlowAction::Continue => write!(f, "continue"),
        }
    }
}
