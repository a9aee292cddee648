//! Persisted form of a job graph and the journal of its flow mutations.
//!
//! A snapshot stores nodes in index order and edges in edge order, so a
//! restored graph has the same layout as the one that was saved. Replaying
//! the same [`GraphMutation`] sequence on equal graphs produces equal bytes.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::config::NamingRules;
use crate::core::dag::{Dependency, JobGraph};
use crate::core::identity::{JobId, TaskId};
use crate::core::task::TaskInstance;
use crate::error::{Error, Result};
use crate::zlog_debug;

const SNAPSHOT_VERSION: u32 = 1;

/// One structural mutation applied to a submitted graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mutation")]
pub enum GraphMutation {
    Replicate {
        starts: Vec<TaskId>,
        runs: u32,
    },
    Loop {
        end: TaskId,
        target: TaskId,
        continue_looping: bool,
    },
    If {
        initiator: TaskId,
        chosen: String,
    },
}

impl GraphMutation {
    /// Apply this mutation, returning the created or skipped tasks.
    pub fn apply(&self, graph: &mut JobGraph) -> Result<Vec<TaskId>> {
        match self {
            GraphMutation::Replicate { starts, runs } => graph.replicate_blocks(starts, *runs),
            GraphMutation::Loop {
                end,
                target,
                continue_looping,
            } => graph.loop_block(end, target, *continue_looping),
            GraphMutation::If { initiator, chosen } => graph.apply_if_action(initiator, chosen),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SnapshotEdge {
    parent: u32,
    child: u32,
    dependency: Dependency,
}

#[derive(Serialize, Deserialize)]
struct GraphSnapshot {
    version: u32,
    job_id: JobId,
    naming: NamingRules,
    next_sequence: u32,
    frozen: bool,
    closed_loops: BTreeSet<TaskId>,
    nodes: Vec<TaskInstance>,
    edges: Vec<SnapshotEdge>,
    journal: Vec<GraphMutation>,
}

impl JobGraph {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let snapshot = GraphSnapshot {
            version: SNAPSHOT_VERSION,
            job_id: self.job_id,
            naming: self.naming,
            next_sequence: self.next_sequence,
            frozen: self.frozen,
            closed_loops: self.closed_loops.clone(),
            nodes: self.graph.node_weights().cloned().collect(),
            edges: self
                .graph
                .edge_references()
                .map(|edge| SnapshotEdge {
                    parent: edge.source().index() as u32,
                    child: edge.target().index() as u32,
                    dependency: edge.weight().clone(),
                })
                .collect(),
            journal: self.journal.clone(),
        };
        Ok(serde_json::to_vec(&snapshot)?)
    }

    pub fn restore(bytes: &[u8]) -> Result<Self> {
        let snapshot: GraphSnapshot = serde_json::from_slice(bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::Validation(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }

        let mut graph = DiGraph::with_capacity(snapshot.nodes.len(), snapshot.edges.len());
        let mut task_index = HashMap::with_capacity(snapshot.nodes.len());
        for task in snapshot.nodes {
            if task.id.job_id() != snapshot.job_id {
                return Err(Error::Validation(format!(
                    "task {} does not belong to job {}",
                    task.id, snapshot.job_id
                )));
            }
            let id = task.id.clone();
            let index = graph.add_node(task);
            if task_index.insert(id.clone(), index).is_some() {
                return Err(Error::Validation(format!("duplicate task {} in snapshot", id)));
            }
        }
        let node_count = graph.node_count();
        for edge in snapshot.edges {
            let (parent, child) = (edge.parent as usize, edge.child as usize);
            if parent >= node_count || child >= node_count {
                return Err(Error::Validation(format!(
                    "snapshot edge {} -> {} points outside the graph",
                    parent, child
                )));
            }
            graph.add_edge(NodeIndex::new(parent), NodeIndex::new(child), edge.dependency);
        }

        zlog_debug!(
            "JobGraph::restore job={} tasks={} journal={}",
            snapshot.job_id.short(),
            graph.node_count(),
            snapshot.journal.len()
        );
        Ok(Self {
            job_id: snapshot.job_id,
            naming: snapshot.naming,
            graph,
            task_index,
            next_sequence: snapshot.next_sequence,
            frozen: snapshot.frozen,
            closed_loops: snapshot.closed_loops,
            journal: snapshot.journal,
        })
    }

    /// Apply mutations in order, stopping at the first one that fails.
    ///
    /// Mutations already in this graph's journal at the same position are
    /// skipped, so replaying a journal onto a snapshot taken part way
    /// through it only applies the remainder. A sequence that disagrees
    /// with the journal is rejected before anything is applied.
    pub fn replay(&mut self, mutations: &[GraphMutation]) -> Result<()> {
        let applied = self
            .journal
            .iter()
            .zip(mutations)
            .take_while(|(done, next)| done == next)
            .count();
        if applied < self.journal.len().min(mutations.len()) {
            return Err(Error::Validation(format!(
                "mutation {} differs from the journal of job {}",
                applied,
                self.job_id.short()
            )));
        }
        zlog_debug!(
            "JobGraph::replay job={} skipped={} applying={}",
            self.job_id.short(),
            applied,
            mutations.len().saturating_sub(applied)
        );
        for mutation in mutations.iter().skip(applied) {
            mutation.apply(self)?;
        }
        Ok(())
    }
}
