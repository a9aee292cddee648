//! Task identity allocation and the readable name grammar.
//!
//! Every task instance carries a [`TaskId`] made of its job, a job-local
//! sequence index and a readable name. Instances created at runtime by
//! LOOP or REPLICATE keep the base name of their origin and add a suffix:
//!
//! ```text
//! name = base [ '#' iteration ] [ '*' replication ]
//! ```
//!
//! `#` and `*` are reserved and never appear in a base name accepted by
//! [`sanitize_name`].

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use uuid::Uuid;

use crate::config::ReservedNamePolicy;
use crate::error::{Error, Result};

pub const ITERATION_SEPARATOR: char = '#';
pub const REPLICATION_SEPARATOR: char = '*';

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new unique job identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A readable task name split into its base and provenance suffixes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReadableName {
    pub base: String,
    pub iteration: Option<u32>,
    pub replication: Option<u32>,
}

fn name_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        regex::Regex::new(r"^(?P<base>.*?)(?:#(?P<it>[0-9]+))?(?:\*(?P<rep>[0-9]+))?$")
            .expect("readable name pattern is valid")
    })
}

impl ReadableName {
    /// Split a readable name. Malformed suffixes are kept as part of the base.
    pub fn parse(name: &str) -> Self {
        let whole = || Self {
            base: name.to_string(),
            iteration: None,
            replication: None,
        };
        let Some(caps) = name_pattern().captures(name) else {
            return whole();
        };
        let index = |group: &str| -> std::result::Result<Option<u32>, ()> {
            match caps.name(group) {
                Some(m) => m.as_str().parse::<u32>().map(Some).map_err(|_| ()),
                None => Ok(None),
            }
        };
        match (index("it"), index("rep")) {
            (Ok(iteration), Ok(replication)) => Self {
                base: caps["base"].to_string(),
                iteration,
                replication,
            },
            _ => whole(),
        }
    }
}

impl std::fmt::Display for ReadableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.base)?;
        if let Some(it) = self.iteration {
            write!(f, "{}{}", ITERATION_SEPARATOR, it)?;
        }
        if let Some(rep) = self.replication {
            write!(f, "{}{}", REPLICATION_SEPARATOR, rep)?;
        }
        Ok(())
    }
}

/// Identity of one task instance inside a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    job_id: JobId,
    sequence: u32,
    readable_name: String,
}

impl TaskId {
    /// Allocate the identity of a task created at submission.
    pub fn allocate(job_id: JobId, sequence: u32, base_name: &str) -> Self {
        Self {
            job_id,
            sequence,
            readable_name: base_name.to_string(),
        }
    }

    /// Identity of a REPLICATE copy: the parent's name with `*replication`.
    pub fn derive_replica(&self, sequence: u32, replication: u32) -> Self {
        let mut name = ReadableName::parse(&self.readable_name);
        name.replication = Some(replication);
        self.derived(sequence, name)
    }

    /// Identity of a LOOP copy: the parent's name with `#iteration`.
    pub fn derive_iteration(&self, sequence: u32, iteration: u32) -> Self {
        let mut name = ReadableName::parse(&self.readable_name);
        name.iteration = Some(iteration);
        self.derived(sequence, name)
    }

    /// Identity of a LOOP copy standing for every replica of this task:
    /// `#iteration` with the replication index of the enclosing block.
    pub fn derive_loop_copy(&self, sequence: u32, iteration: u32, replication: Option<u32>) -> Self {
        let mut name = ReadableName::parse(&self.readable_name);
        name.iteration = Some(iteration);
        name.replication = replication;
        self.derived(sequence, name)
    }

    fn derived(&self, sequence: u32, name: ReadableName) -> Self {
        Self {
            job_id: self.job_id,
            sequence,
            readable_name: name.to_string(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn readable_name(&self) -> &str {
        &self.readable_name
    }

    /// Name without iteration and replication suffixes. Ambiguous across copies.
    pub fn base_name(&self) -> String {
        initial_name(&self.readable_name)
    }

    pub fn iteration_index(&self) -> u32 {
        parse_iteration_index(&self.readable_name)
    }

    pub fn replication_index(&self) -> u32 {
        parse_replication_index(&self.readable_name)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.readable_name)
    }
}

/// Iteration index carried by a readable name, 0 when absent.
pub fn parse_iteration_index(name: &str) -> u32 {
    ReadableName::parse(name).iteration.unwrap_or(0)
}

/// Replication index carried by a readable name, 0 when absent.
pub fn parse_replication_index(name: &str) -> u32 {
    ReadableName::parse(name).replication.unwrap_or(0)
}

/// Base name with every suffix stripped.
pub fn initial_name(name: &str) -> String {
    ReadableName::parse(name).base
}

pub fn is_reserved(c: char) -> bool {
    c == ITERATION_SEPARATOR || c == REPLICATION_SEPARATOR
}

/// Apply the reserved character policy to a user supplied base name.
pub fn sanitize_name(name: &str, policy: ReservedNamePolicy, substitute: char) -> Result<String> {
    if !name.contains(is_reserved) {
        return Ok(name.to_string());
    }
    match policy {
        ReservedNamePolicy::Reject => Err(Error::Validation(format!(
            "task name '{}' cannot contain '{}' or '{}'",
            name, ITERATION_SEPARATOR, REPLICATION_SEPARATOR
        ))),
        ReservedNamePolicy::Substitute => Ok(name
            .chars()
            .map(|c| if is_reserved(c) { substitute } else { c })
            .collect()),
    }
}
