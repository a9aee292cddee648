//! Job graph: task instances and their dependencies.
//!
//! [`JobGraph`] keeps task instances in a petgraph `DiGraph`. An edge points
//! from a parent to its dependent and carries a [`Dependency`] naming the
//! logical parent it stands for. REPLICATE replaces one parent edge with one
//! edge per replica, all in the same group, and the dependent becomes
//! eligible once `required` edges of every group are satisfied.
//!
//! After submission the graph only changes through LOOP, REPLICATE and IF
//! mutations. Each mutation runs on a staged copy that replaces the live
//! graph only once the whole mutation succeeded, and is appended to the
//! mutation journal so it can be replayed on a restored snapshot.

use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::config::NamingRules;
use crate::core::flow::FlowActionType;
use crate::core::identity::{initial_name, JobId, ReadableName, TaskId};
use crate::core::snapshot::GraphMutation;
use crate::core::task::{TaskInstance, TaskOrder, TaskStatus};
use crate::core::template::{FlowBlock, TaskTemplate};
use crate::error::{Error, Result};
use crate::{zlog, zlog_debug};

/// Weight of a parent to dependent edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Logical parent this edge stands for. Replicas of one parent share it.
    pub group: TaskId,
    /// Satisfied edges of `group` needed before the dependent may run.
    pub required: u32,
    /// Set on edges leaving a branch bypassed by an IF action: a skipped
    /// parent then counts as satisfied.
    pub bypassed: bool,
}

impl Dependency {
    pub fn on(parent: &TaskId) -> Self {
        Self {
            group: parent.clone(),
            required: 1,
            bypassed: false,
        }
    }
}

/// Result of copying a block: where each member went.
struct BlockCopy {
    of: HashMap<NodeIndex, NodeIndex>,
    created: Vec<NodeIndex>,
}

/// The dependency graph of one job.
#[derive(Clone)]
pub struct JobGraph {
    pub(crate) job_id: JobId,
    pub(crate) naming: NamingRules,
    pub(crate) graph: DiGraph<TaskInstance, Dependency>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    pub(crate) task_index: HashMap<TaskId, NodeIndex>,
    pub(crate) next_sequence: u32,
    pub(crate) frozen: bool,
    /// LOOP end tasks whose loop has been closed.
    pub(crate) closed_loops: BTreeSet<TaskId>,
    pub(crate) journal: Vec<GraphMutation>,
}

impl JobGraph {
    pub fn new(job_id: JobId) -> Self {
        Self::with_naming(job_id, NamingRules::default())
    }

    pub fn with_naming(job_id: JobId, naming: NamingRules) -> Self {
        Self {
            job_id,
            naming,
            graph: DiGraph::new(),
            task_index: HashMap::new(),
            next_sequence: 0,
            frozen: false,
            closed_loops: BTreeSet::new(),
            journal: Vec::new(),
        }
    }

    /// Build an unsubmitted graph from templates whose dependencies are
    /// declared by name. Templates may come in any order.
    pub fn from_templates(
        job_id: JobId,
        templates: Vec<TaskTemplate>,
        naming: NamingRules,
    ) -> Result<Self> {
        let mut graph = Self::with_naming(job_id, naming);
        let mut declared = Vec::with_capacity(templates.len());
        for template in templates {
            let name = template.name.clone();
            let parents = template.dependencies.clone();
            let id = graph.add_task(template, &[])?;
            declared.push((name, id, parents));
        }

        let by_name: HashMap<&str, &TaskId> = declared
            .iter()
            .map(|(name, id, _)| (name.as_str(), id))
            .collect();
        for (_, child, parents) in &declared {
            for parent in parents {
                let parent_id = by_name.get(parent.as_str()).ok_or_else(|| {
                    Error::Validation(format!(
                        "task '{}' depends on unknown task '{}'",
                        child, parent
                    ))
                })?;
                graph.add_dependency(parent_id, child)?;
            }
        }
        Ok(graph)
    }

    /// Add a task before submission.
    ///
    /// The template is validated against the naming rules and gets the next
    /// sequence index of the job.
    ///
    /// # Errors
    /// Returns an error if:
    /// - The graph is already submitted
    /// - The template is invalid or its name is already used
    /// - A dependency is not part of this job
    pub fn add_task(&mut self, template: TaskTemplate, dependencies: &[TaskId]) -> Result<TaskId> {
        self.ensure_editable()?;
        let template = template.validated(&self.naming)?;
        if self.index_by_name(&template.name).is_some() {
            return Err(Error::Validation(format!(
                "task name '{}' is already used in job {}",
                template.name,
                self.job_id.short()
            )));
        }

        let mut parents = Vec::with_capacity(dependencies.len());
        for dependency in dependencies {
            let index = self.task_index.get(dependency).copied().ok_or_else(|| {
                Error::Validation(format!(
                    "dependency {} of task '{}' is not part of the job",
                    dependency, template.name
                ))
            })?;
            if !parents.contains(&index) {
                parents.push(index);
            }
        }

        let id = TaskId::allocate(self.job_id, self.next_sequence, &template.name);
        self.next_sequence += 1;
        let index = self.graph.add_node(TaskInstance::new(id.clone(), template));
        self.task_index.insert(id.clone(), index);
        for parent in parents {
            let dependency = Dependency::on(&self.graph[parent].id);
            self.graph.add_edge(parent, index, dependency);
        }

        zlog_debug!(
            "JobGraph::add_task job={} task={} seq={}",
            self.job_id.short(),
            id,
            id.sequence()
        );
        Ok(id)
    }

    /// Declare that `child` needs the result of `parent`.
    ///
    /// # Errors
    /// Returns an error if the graph is submitted, either task is unknown,
    /// or the edge would close a cycle.
    pub fn add_dependency(&mut self, parent: &TaskId, child: &TaskId) -> Result<()> {
        self.ensure_editable()?;
        let from = self.index_of(parent)?;
        let to = self.index_of(child)?;
        self.connect(from, to)
    }

    /// Submit the graph: match flow blocks, wire IF branches and check
    /// every flow script target. Nothing changes if any check fails.
    pub fn freeze(&mut self) -> Result<()> {
        if self.frozen {
            return Err(Error::IllegalState(format!(
                "job {} is already submitted",
                self.job_id.short()
            )));
        }
        self.staged(|graph| {
            graph.wire_branches()?;
            graph.match_blocks()?;
            graph.check_flow_targets()?;
            graph.frozen = true;
            Ok(())
        })?;
        zlog!(
            "Job {} submitted: {} tasks, {} dependencies",
            self.job_id.short(),
            self.task_count(),
            self.dependency_count()
        );
        Ok(())
    }

    // ========== Accessors ==========

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn naming(&self) -> &NamingRules {
        &self.naming
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&TaskInstance> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub(crate) fn task_mut(&mut self, id: &TaskId) -> Option<&mut TaskInstance> {
        let index = *self.task_index.get(id)?;
        self.graph.node_weight_mut(index)
    }

    pub(crate) fn instances_mut(&mut self) -> impl Iterator<Item = &mut TaskInstance> {
        self.graph.node_weights_mut()
    }

    /// Instance with this exact readable name.
    pub fn find_by_name(&self, name: &str) -> Option<&TaskInstance> {
        self.index_by_name(name).map(|index| &self.graph[index])
    }

    /// All instances in creation order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskInstance> + '_ {
        self.graph.node_weights()
    }

    pub fn sorted_tasks(&self, order: TaskOrder) -> Vec<&TaskInstance> {
        let mut tasks: Vec<&TaskInstance> = self.tasks().collect();
        order.sort(&mut tasks);
        tasks
    }

    pub fn get_dependencies(&self, id: &TaskId) -> Vec<&TaskInstance> {
        self.neighbors(id, Direction::Incoming)
    }

    pub fn get_dependents(&self, id: &TaskId) -> Vec<&TaskInstance> {
        self.neighbors(id, Direction::Outgoing)
    }

    pub fn dependency(&self, parent: &TaskId, child: &TaskId) -> Option<&Dependency> {
        let from = self.task_index.get(parent)?;
        let to = self.task_index.get(child)?;
        let edge = self.graph.find_edge(*from, *to)?;
        self.graph.edge_weight(edge)
    }

    /// Predecessor count a task waits for: the largest `required` among
    /// its incoming edges, 1 when it has none.
    pub fn required_dependency_count(&self, id: &TaskId) -> u32 {
        self.task_index
            .get(id)
            .and_then(|&index| {
                self.graph
                    .edges_directed(index, Direction::Incoming)
                    .map(|edge| edge.weight().required)
                    .max()
            })
            .unwrap_or(1)
    }

    pub fn closed_loops(&self) -> &BTreeSet<TaskId> {
        &self.closed_loops
    }

    /// Structural mutations applied since submission, in order.
    pub fn journal(&self) -> &[GraphMutation] {
        &self.journal
    }

    /// Tasks in dependency order.
    ///
    /// # Errors
    /// Returns an error if the graph contains a cycle, which add_dependency
    /// and the flow mutations never let happen.
    pub fn topological_order(&self) -> Result<Vec<&TaskInstance>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let at = self.graph[cycle.node_id()].id.to_string();
            Error::CyclicDependency {
                from: at.clone(),
                to: at,
            }
        })?;
        Ok(sorted.into_iter().map(|index| &self.graph[index]).collect())
    }

    // ========== Scheduling ==========

    /// PENDING tasks whose every dependency group is satisfied.
    ///
    /// The iterator is lazy and can be cloned to walk the same view twice.
    pub fn eligible_tasks(&self) -> impl Iterator<Item = &TaskInstance> + Clone + '_ {
        self.graph
            .node_indices()
            .filter(move |&index| self.is_eligible(index))
            .map(move |index| &self.graph[index])
    }

    fn is_eligible(&self, index: NodeIndex) -> bool {
        self.graph[index].status() == TaskStatus::Pending
            && self
                .group_tallies(index)
                .values()
                .all(|tally| tally.satisfied >= tally.required)
    }

    fn group_tallies(&self, index: NodeIndex) -> HashMap<&TaskId, GroupTally> {
        let mut tallies: HashMap<&TaskId, GroupTally> = HashMap::new();
        for edge in self.graph.edges_directed(index, Direction::Incoming) {
            let parent = &self.graph[edge.source()];
            let dependency = edge.weight();
            let tally = tallies.entry(&dependency.group).or_default();
            tally.required = tally.required.max(dependency.required);
            if satisfies(parent, dependency) {
                tally.satisfied += 1;
                tally.possible += 1;
            } else if parent.is_alive() {
                tally.possible += 1;
            }
        }
        tallies
    }

    /// Some group can no longer gather enough satisfied edges.
    fn is_blocked_forever(&self, index: NodeIndex) -> bool {
        self.group_tallies(index)
            .values()
            .any(|tally| tally.possible < tally.required)
    }

    /// Move every waiting task that can never run to NOT_STARTED, until no
    /// more change. Returns the tasks moved.
    pub(crate) fn mark_not_started(&mut self) -> Vec<TaskId> {
        let mut released = Vec::new();
        loop {
            let stuck: Vec<NodeIndex> = self
                .graph
                .node_indices()
                .filter(|&index| {
                    is_waiting(self.graph[index].status()) && self.is_blocked_forever(index)
                })
                .collect();
            if stuck.is_empty() {
                return released;
            }
            for index in stuck {
                let task = &mut self.graph[index];
                task.info.status = TaskStatus::NotStarted;
                released.push(task.id.clone());
            }
        }
    }

    /// Submitted tasks become PENDING when their job starts.
    pub(crate) fn mark_pending(&mut self) {
        for task in self.graph.node_weights_mut() {
            if task.info.status == TaskStatus::Submitted {
                task.info.status = TaskStatus::Pending;
            }
        }
    }

    // ========== Flow mutations ==========

    /// Replace the block opened by `start` with `runs` fresh copies.
    ///
    /// The block spans `start` to its matching END. A `start` that carries
    /// no block marker is replicated alone, as a block of one task; only an
    /// END marker fails with [`Error::FlowBlockMismatch`]. `runs` below 1 is
    /// treated as 1. The copies inherit the block's external parents;
    /// external dependents wait for every copy. Original members that have
    /// not started are SKIPPED.
    pub fn replicate_block(&mut self, start: &TaskId, runs: u32) -> Result<Vec<TaskId>> {
        self.replicate_blocks(std::slice::from_ref(start), runs)
    }

    /// Replicate several blocks as one atomic mutation.
    pub fn replicate_blocks(&mut self, starts: &[TaskId], runs: u32) -> Result<Vec<TaskId>> {
        self.ensure_submitted()?;
        let runs = runs.max(1);
        let created = self.staged(|graph| {
            let mut created = Vec::new();
            for start in starts {
                created.extend(graph.replicate_one(start, runs)?);
            }
            Ok(created)
        })?;
        self.journal.push(GraphMutation::Replicate {
            starts: starts.to_vec(),
            runs,
        });
        zlog_debug!(
            "JobGraph::replicate job={} blocks={} runs={} created={}",
            self.job_id.short(),
            starts.len(),
            runs,
            created.len()
        );
        Ok(created)
    }

    /// Run the block `target`..`end` once more, or close the loop.
    ///
    /// With `continue_looping` the block is copied with the next iteration
    /// index, the copy of `target` waits for `end`, and the dependents of
    /// `end` move to the copy of `end`. Otherwise the loop is closed and
    /// the graph is left as it is.
    pub fn loop_block(
        &mut self,
        end: &TaskId,
        target: &TaskId,
        continue_looping: bool,
    ) -> Result<Vec<TaskId>> {
        self.ensure_submitted()?;
        if self.closed_loops.contains(end) {
            return Err(Error::IllegalState(format!(
                "loop ending at {} is already closed",
                end
            )));
        }
        let end_index = self.index_of(end)?;
        let target_index = self.index_of(target)?;
        self.check_loop_scope(target_index, end_index)?;

        let created = if continue_looping {
            self.staged(|graph| graph.loop_once(end_index, target_index))?
        } else {
            self.closed_loops.insert(end.clone());
            Vec::new()
        };
        self.journal.push(GraphMutation::Loop {
            end: end.clone(),
            target: target.clone(),
            continue_looping,
        });
        zlog_debug!(
            "JobGraph::loop job={} end={} target={} continue={} created={}",
            self.job_id.short(),
            end,
            target,
            continue_looping,
            created.len()
        );
        Ok(created)
    }

    /// Keep the `chosen` branch of an IF task and skip the other one.
    ///
    /// Every task reachable from the bypassed branch start, and not from the
    /// chosen one, becomes SKIPPED. Edges from skipped tasks into the rest
    /// of the graph are marked bypassed, so the continuation only waits for
    /// the chosen branch. Returns the skipped tasks.
    pub fn apply_if_action(&mut self, if_task: &TaskId, chosen: &str) -> Result<Vec<TaskId>> {
        self.ensure_submitted()?;
        let if_index = self.index_of(if_task)?;
        let skipped = self.staged(|graph| graph.skip_branch(if_index, chosen))?;
        self.journal.push(GraphMutation::If {
            initiator: if_task.clone(),
            chosen: chosen.to_string(),
        });
        zlog_debug!(
            "JobGraph::if job={} task={} chosen={} skipped={}",
            self.job_id.short(),
            if_task,
            chosen,
            skipped.len()
        );
        Ok(skipped)
    }

    /// Resolve a flow script target name relative to its initiator.
    ///
    /// The nearest ancestor (or the initiator itself) with that base name
    /// wins. Otherwise an unfinished instance with the same replication
    /// index and the highest iteration is used.
    pub fn resolve_target(&self, initiator: &TaskId, name: &str) -> Option<TaskId> {
        let from = *self.task_index.get(initiator)?;
        let base = initial_name(name);

        let mut seen = HashSet::from([from]);
        let mut queue = VecDeque::from([from]);
        while let Some(index) = queue.pop_front() {
            if self.graph[index].base_name() == base {
                return Some(self.graph[index].id.clone());
            }
            for parent in self.graph.neighbors_directed(index, Direction::Incoming) {
                if seen.insert(parent) {
                    queue.push_back(parent);
                }
            }
        }
        self.resolve_in_scope(from, &base)
            .map(|index| self.graph[index].id.clone())
    }

    fn resolve_in_scope(&self, from: NodeIndex, base: &str) -> Option<NodeIndex> {
        let replication = self.graph[from].id.replication_index();
        self.graph
            .node_indices()
            .filter(|&index| {
                let task = &self.graph[index];
                task.base_name() == base
                    && task.id.replication_index() == replication
                    && !matches!(task.status(), TaskStatus::Finished | TaskStatus::Skipped)
            })
            .max_by_key(|&index| (self.graph[index].id.iteration_index(), index))
    }

    // ========== Internals ==========

    fn ensure_editable(&self) -> Result<()> {
        if self.frozen {
            return Err(Error::IllegalState(format!(
                "job {} is submitted, its graph only changes through flow actions",
                self.job_id.short()
            )));
        }
        Ok(())
    }

    fn ensure_submitted(&self) -> Result<()> {
        if !self.frozen {
            return Err(Error::IllegalState(format!(
                "job {} is not submitted yet",
                self.job_id.short()
            )));
        }
        Ok(())
    }

    /// Apply a mutation to a copy and keep it only if it succeeded.
    fn staged<T>(&mut self, mutation: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let mut staged = self.clone();
        let out = mutation(&mut staged)?;
        *self = staged;
        Ok(out)
    }

    pub(crate) fn index_of(&self, id: &TaskId) -> Result<NodeIndex> {
        self.task_index
            .get(id)
            .copied()
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    fn index_by_name(&self, name: &str) -> Option<NodeIndex> {
        self.graph
            .node_indices()
            .find(|&index| self.graph[index].id.readable_name() == name)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&TaskInstance> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .map(|neighbor| &self.graph[neighbor])
                .collect(),
            None => Vec::new(),
        }
    }

    fn connect(&mut self, parent: NodeIndex, child: NodeIndex) -> Result<()> {
        if self.graph.find_edge(parent, child).is_some() {
            return Ok(());
        }
        if parent == child || has_path_connecting(&self.graph, child, parent, None) {
            return Err(Error::CyclicDependency {
                from: self.graph[parent].id.to_string(),
                to: self.graph[child].id.to_string(),
            });
        }
        let dependency = Dependency::on(&self.graph[parent].id);
        self.graph.add_edge(parent, child, dependency);
        Ok(())
    }

    fn named(&self, name: Option<&str>, owner: &TaskId) -> Result<NodeIndex> {
        let name = name.ok_or_else(|| Error::mismatch(owner, "flow action has no target"))?;
        self.index_by_name(name).ok_or_else(|| {
            Error::Validation(format!(
                "flow target '{}' of task {} does not exist",
                name, owner
            ))
        })
    }

    fn script_type(&self, index: NodeIndex) -> Option<FlowActionType> {
        self.graph[index]
            .template
            .flow_script
            .as_ref()
            .map(|script| script.action_type)
    }

    /// END closing the block opened at `start`, found by tracking block
    /// depth along every path.
    fn block_end_of(&self, start: NodeIndex) -> Result<NodeIndex> {
        let mut stack: Vec<(NodeIndex, u32)> = self
            .graph
            .neighbors_directed(start, Direction::Outgoing)
            .map(|child| (child, 1))
            .collect();
        let mut seen = HashSet::new();
        let mut end = None;
        while let Some((index, depth)) = stack.pop() {
            if !seen.insert((index, depth)) {
                continue;
            }
            let depth = match self.graph[index].flow_block() {
                FlowBlock::Start => depth + 1,
                FlowBlock::End => depth - 1,
                FlowBlock::None => depth,
            };
            if depth == 0 {
                match end {
                    Some(found) if found != index => {
                        return Err(Error::mismatch(
                            &self.graph[start].id,
                            "start block has more than one end",
                        ))
                    }
                    _ => end = Some(index),
                }
                continue;
            }
            stack.extend(
                self.graph
                    .neighbors_directed(index, Direction::Outgoing)
                    .map(|child| (child, depth)),
            );
        }
        end.ok_or_else(|| Error::mismatch(&self.graph[start].id, "start block has no matching end"))
    }

    /// Last task of the block entered at `start`.
    fn block_bounds(&self, start: NodeIndex) -> Result<NodeIndex> {
        let task = &self.graph[start];
        match task.flow_block() {
            FlowBlock::None => Ok(start),
            FlowBlock::End => Err(Error::mismatch(
                &task.id,
                "a block cannot be entered through its end",
            )),
            FlowBlock::Start => {
                let end = task
                    .matching_block
                    .as_ref()
                    .ok_or_else(|| Error::mismatch(&task.id, "start block has no matching end"))?;
                self.index_of(end)
            }
        }
    }

    fn wire_branches(&mut self) -> Result<()> {
        let branching: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&index| self.script_type(index) == Some(FlowActionType::If))
            .collect();

        for if_index in branching {
            let Some(script) = self.graph[if_index].template.flow_script.clone() else {
                continue;
            };
            let if_id = self.graph[if_index].id.clone();
            let branches = [
                self.named(script.target.as_deref(), &if_id)?,
                self.named(script.target_else.as_deref(), &if_id)?,
            ];

            let mut ends = Vec::with_capacity(2);
            for branch in branches {
                let task = &self.graph[branch];
                if branch == if_index {
                    return Err(Error::mismatch(&if_id, "an IF action cannot target its own task"));
                }
                if let Some(owner) = &task.if_branch {
                    return Err(Error::mismatch(
                        &task.id,
                        format!("already a branch of IF task {}", owner),
                    ));
                }
                if self
                    .graph
                    .neighbors_directed(branch, Direction::Incoming)
                    .next()
                    .is_some()
                {
                    return Err(Error::mismatch(
                        &task.id,
                        "the target of an IF action cannot have dependencies",
                    ));
                }
                ends.push(match task.flow_block() {
                    FlowBlock::Start => self.block_end_of(branch)?,
                    FlowBlock::None => branch,
                    FlowBlock::End => {
                        return Err(Error::mismatch(
                            &task.id,
                            "the target of an IF action cannot be the end of a block",
                        ))
                    }
                });
            }

            for branch in branches {
                self.connect(if_index, branch)?;
                self.graph[branch].if_branch = Some(if_id.clone());
            }
            if let Some(name) = script.continuation.as_deref() {
                let join = self.named(Some(name), &if_id)?;
                for end in ends {
                    self.connect(end, join)?;
                }
            }
        }
        Ok(())
    }

    fn match_blocks(&mut self) -> Result<()> {
        let starts: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&index| self.graph[index].flow_block() == FlowBlock::Start)
            .collect();

        let mut closed = HashSet::new();
        for start in starts {
            let end = self.block_end_of(start)?;
            if !closed.insert(end) {
                return Err(Error::mismatch(
                    &self.graph[end].id,
                    "end block closes more than one start",
                ));
            }
            let end_id = self.graph[end].id.clone();
            self.graph[start].matching_block = Some(end_id);
        }

        if let Some(orphan) = self.graph.node_indices().find(|index| {
            self.graph[*index].flow_block() == FlowBlock::End && !closed.contains(index)
        }) {
            return Err(Error::mismatch(
                &self.graph[orphan].id,
                "end block without a matching start",
            ));
        }
        Ok(())
    }

    fn check_flow_targets(&self) -> Result<()> {
        for index in self.graph.node_indices() {
            let task = &self.graph[index];
            let Some(script) = &task.template.flow_script else {
                continue;
            };
            match script.action_type {
                FlowActionType::Loop => {
                    let target = self.named(script.target.as_deref(), &task.id)?;
                    self.check_loop_scope(target, index)?;
                }
                FlowActionType::Replicate => {
                    let mut children = self
                        .graph
                        .neighbors_directed(index, Direction::Outgoing)
                        .peekable();
                    if children.peek().is_none() {
                        return Err(Error::mismatch(&task.id, "REPLICATE action has no target"));
                    }
                    if let Some(end) =
                        children.find(|&child| self.graph[child].flow_block() == FlowBlock::End)
                    {
                        return Err(Error::mismatch(
                            &self.graph[end].id,
                            "the target of a REPLICATE action cannot be the end of a block",
                        ));
                    }
                }
                FlowActionType::If | FlowActionType::Continue => {}
            }
        }
        Ok(())
    }

    fn check_loop_scope(&self, target: NodeIndex, end: NodeIndex) -> Result<()> {
        if target == end {
            return Ok(());
        }
        let target_task = &self.graph[target];
        let end_id = &self.graph[end].id;
        if target_task.flow_block() == FlowBlock::Start
            && target_task.matching_block.as_ref() == Some(end_id)
        {
            Ok(())
        } else {
            Err(Error::mismatch(
                end_id,
                format!("LOOP target {} does not open the block ending here", target_task.id),
            ))
        }
    }

    /// Nodes reachable from `from` in `direction`, not expanding past `stop`.
    fn reach(&self, from: NodeIndex, direction: Direction, stop: Option<NodeIndex>) -> HashSet<NodeIndex> {
        let mut seen = HashSet::from([from]);
        let mut stack = vec![from];
        while let Some(index) = stack.pop() {
            if Some(index) == stop {
                continue;
            }
            for next in self.graph.neighbors_directed(index, direction) {
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        seen
    }

    /// Tasks on a path from `start` to `end`, in creation order.
    fn block_members(&self, start: NodeIndex, end: NodeIndex) -> Result<Vec<NodeIndex>> {
        let forward = self.reach(start, Direction::Outgoing, Some(end));
        if !forward.contains(&end) {
            return Err(Error::mismatch(
                &self.graph[start].id,
                format!("block end {} is not reachable", self.graph[end].id),
            ));
        }
        let backward = self.reach(end, Direction::Incoming, Some(start));
        let mut members: Vec<NodeIndex> = forward.intersection(&backward).copied().collect();
        members.sort();
        Ok(members)
    }

    /// Edges between a member and a non-member, seen from the members.
    fn crossing_edges(
        &self,
        members: &[NodeIndex],
        inside: &HashSet<NodeIndex>,
        direction: Direction,
    ) -> Vec<(NodeIndex, NodeIndex, Dependency)> {
        let mut edges: Vec<_> = members
            .iter()
            .flat_map(|&member| self.graph.edges_directed(member, direction))
            .filter(|edge| !inside.contains(&edge.source()) || !inside.contains(&edge.target()))
            .map(|edge| (edge.source(), edge.target(), edge.weight().clone()))
            .collect();
        edges.sort_by_key(|(source, target, _)| (*source, *target));
        edges
    }

    /// Copy a block with its internal edges.
    ///
    /// Members sharing a base name and replication index (iterations of an
    /// inner loop) collapse into one copy of the lowest iteration. With
    /// `fold_replicas` the replication index is ignored too, so the replicas
    /// of an inner REPLICATE collapse into one copy of the lowest iteration
    /// and then the lowest replication. `derive` proposes an identity for
    /// attempt 0, 1, ... until the name is unused.
    fn copy_members(
        &mut self,
        members: &[NodeIndex],
        fold_replicas: bool,
        derive: impl Fn(&TaskId, u32, u32) -> TaskId,
    ) -> Result<BlockCopy> {
        let key = |graph: &Self, index: NodeIndex| {
            let id = &graph.graph[index].id;
            (id.base_name(), (!fold_replicas).then(|| id.replication_index()))
        };
        let rank = |graph: &Self, index: NodeIndex| {
            let id = &graph.graph[index].id;
            (id.iteration_index(), id.replication_index())
        };
        let mut representative: HashMap<(String, Option<u32>), NodeIndex> = HashMap::new();
        for &member in members {
            let k = key(self, member);
            let lower = match representative.get(&k) {
                Some(&current) => rank(self, member) < rank(self, current),
                None => true,
            };
            if lower {
                representative.insert(k, member);
            }
        }

        let mut names: HashSet<String> = self
            .graph
            .node_weights()
            .map(|task| task.id.readable_name().to_string())
            .collect();
        let mut copy_by_key = HashMap::new();
        let mut created = Vec::new();
        for &member in members {
            let k = key(self, member);
            if representative.get(&k) != Some(&member) {
                continue;
            }
            let origin = self.graph[member].id.clone();
            let sequence = self.next_sequence;
            let id = (0u32..)
                .map(|attempt| derive(&origin, sequence, attempt))
                .find(|candidate| !names.contains(candidate.readable_name()))
                .ok_or_else(|| {
                    Error::IllegalState(format!("no free name left for a copy of {}", origin))
                })?;
            if id.readable_name().chars().count() > self.naming.max_name_length {
                return Err(Error::Validation(format!(
                    "copy name '{}' exceeds {} characters",
                    id, self.naming.max_name_length
                )));
            }
            names.insert(id.readable_name().to_string());
            self.next_sequence += 1;

            let copy = self.graph[member].replicate(id.clone());
            let index = self.graph.add_node(copy);
            self.task_index.insert(id, index);
            copy_by_key.insert(k, index);
            created.push(index);
        }

        let of: HashMap<NodeIndex, NodeIndex> = members
            .iter()
            .map(|&member| (member, copy_by_key[&key(self, member)]))
            .collect();
        let renamed: HashMap<TaskId, TaskId> = of
            .iter()
            .map(|(&member, &copy)| (self.graph[member].id.clone(), self.graph[copy].id.clone()))
            .collect();
        let remap = |id: &TaskId| renamed.get(id).cloned().unwrap_or_else(|| id.clone());

        for &copy in &created {
            let task = &mut self.graph[copy];
            task.matching_block = task.matching_block.as_ref().map(&remap);
            task.if_branch = task.if_branch.as_ref().map(&remap);
        }

        let inside: HashSet<NodeIndex> = members.iter().copied().collect();
        let mut internal: Vec<(NodeIndex, NodeIndex, Dependency)> = members
            .iter()
            .flat_map(|&member| self.graph.edges_directed(member, Direction::Outgoing))
            .filter(|edge| inside.contains(&edge.target()))
            .map(|edge| (edge.source(), edge.target(), edge.weight().clone()))
            .collect();
        internal.sort_by_key(|(source, target, _)| (*source, *target));
        for (source, target, dependency) in internal {
            let (from, to) = (of[&source], of[&target]);
            if from == to || self.graph.find_edge(from, to).is_some() {
                continue;
            }
            let group = remap(&dependency.group);
            self.graph.add_edge(
                from,
                to,
                Dependency {
                    group,
                    ..dependency
                },
            );
        }

        Ok(BlockCopy { of, created })
    }

    fn replicate_one(&mut self, start: &TaskId, runs: u32) -> Result<Vec<TaskId>> {
        let start_index = self.index_of(start)?;
        let end_index = self.block_bounds(start_index)?;
        let members = self.block_members(start_index, end_index)?;
        let inside: HashSet<NodeIndex> = members.iter().copied().collect();
        let inbound = self.crossing_edges(&members, &inside, Direction::Incoming);
        let outbound = self.crossing_edges(&members, &inside, Direction::Outgoing);

        let mut created = Vec::new();
        for _ in 0..runs {
            let copy = self.copy_members(&members, false, |origin, sequence, attempt| {
                origin.derive_replica(sequence, attempt)
            })?;
            for (source, target, dependency) in &inbound {
                self.graph
                    .add_edge(*source, copy.of[target], dependency.clone());
            }
            for (source, target, dependency) in &outbound {
                self.graph
                    .add_edge(copy.of[source], *target, dependency.clone());
            }
            for &index in &copy.created {
                self.recount_incoming(index);
            }
            created.extend(copy.created.iter().map(|&index| self.graph[index].id.clone()));
        }

        for (source, target, _) in &outbound {
            if let Some(edge) = self.graph.find_edge(*source, *target) {
                self.graph.remove_edge(edge);
            }
        }
        for (_, target, dependency) in &outbound {
            self.recount_group(*target, &dependency.group);
        }
        for &member in &members {
            let task = &mut self.graph[member];
            if is_waiting(task.info.status) {
                task.info.status = TaskStatus::Skipped;
            }
        }
        Ok(created)
    }

    fn recount_group(&mut self, child: NodeIndex, group: &TaskId) {
        let edges: Vec<EdgeIndex> = self
            .graph
            .edges_directed(child, Direction::Incoming)
            .filter(|edge| &edge.weight().group == group)
            .map(|edge| edge.id())
            .collect();
        let required = edges.len() as u32;
        for edge in edges {
            self.graph[edge].required = required;
        }
    }

    fn recount_incoming(&mut self, child: NodeIndex) {
        let groups: BTreeSet<TaskId> = self
            .graph
            .edges_directed(child, Direction::Incoming)
            .map(|edge| edge.weight().group.clone())
            .collect();
        for group in &groups {
            self.recount_group(child, group);
        }
    }

    fn loop_once(&mut self, end: NodeIndex, target: NodeIndex) -> Result<Vec<TaskId>> {
        let members = self.block_members(target, end)?;
        let inside: HashSet<NodeIndex> = members.iter().copied().collect();
        let inbound: Vec<_> = self
            .crossing_edges(&members, &inside, Direction::Incoming)
            .into_iter()
            .filter(|(_, to, _)| *to != target)
            .collect();
        let mut outbound: Vec<(NodeIndex, Dependency)> = self
            .graph
            .edges_directed(end, Direction::Outgoing)
            .filter(|edge| !inside.contains(&edge.target()))
            .map(|edge| (edge.target(), edge.weight().clone()))
            .collect();
        outbound.sort_by_key(|(dependent, _)| *dependent);

        let replication = ReadableName::parse(self.graph[target].id.readable_name()).replication;
        let copy = self.copy_members(&members, true, |origin, sequence, attempt| {
            origin.derive_loop_copy(
                sequence,
                origin.iteration_index() + 1 + attempt,
                replication,
            )
        })?;
        for (source, to, dependency) in inbound {
            let to = copy.of[&to];
            if self.graph.find_edge(source, to).is_none() {
                self.graph.add_edge(source, to, dependency);
            }
        }

        let next_target = copy.of[&target];
        let next_end = copy.of[&end];
        let loop_edge = Dependency::on(&self.graph[end].id);
        self.graph.add_edge(end, next_target, loop_edge);
        for (dependent, dependency) in outbound {
            if let Some(edge) = self.graph.find_edge(end, dependent) {
                self.graph.remove_edge(edge);
            }
            self.graph.add_edge(next_end, dependent, dependency);
        }
        for &index in &copy.created {
            self.recount_incoming(index);
        }

        Ok(copy
            .created
            .iter()
            .map(|&index| self.graph[index].id.clone())
            .collect())
    }

    fn branch_start(&self, if_index: NodeIndex, name: &str) -> Result<NodeIndex> {
        let if_id = &self.graph[if_index].id;
        self.graph
            .neighbors_directed(if_index, Direction::Outgoing)
            .filter(|&child| {
                let task = &self.graph[child];
                task.if_branch.as_ref() == Some(if_id) && task.base_name() == name
            })
            .min()
            .or_else(|| self.resolve_in_scope(if_index, name))
            .ok_or_else(|| Error::mismatch(if_id, format!("branch '{}' not found", name)))
    }

    fn skip_branch(&mut self, if_index: NodeIndex, chosen: &str) -> Result<Vec<TaskId>> {
        let if_task = &self.graph[if_index];
        let if_id = if_task.id.clone();
        let script = if_task
            .template
            .flow_script
            .as_ref()
            .filter(|script| script.action_type == FlowActionType::If)
            .cloned()
            .ok_or_else(|| Error::mismatch(&if_id, "task has no IF action"))?;
        let then_name = script.target.unwrap_or_default();
        let else_name = script.target_else.unwrap_or_default();

        let chosen = initial_name(chosen);
        let bypassed = if chosen == then_name {
            else_name
        } else if chosen == else_name {
            then_name
        } else {
            return Err(Error::mismatch(
                &if_id,
                format!("'{}' is not a branch of this IF action", chosen),
            ));
        };

        let kept = self.reach(self.branch_start(if_index, &chosen)?, Direction::Outgoing, None);
        let bypassed_start = self.branch_start(if_index, &bypassed)?;
        let mut subtree = BTreeSet::new();
        let mut stack = vec![bypassed_start];
        while let Some(index) = stack.pop() {
            if kept.contains(&index) || !subtree.insert(index) {
                continue;
            }
            stack.extend(self.graph.neighbors_directed(index, Direction::Outgoing));
        }

        if let Some(&started) = subtree
            .iter()
            .find(|&&index| !is_waiting(self.graph[index].status()))
        {
            return Err(Error::IllegalState(format!(
                "task {} of the bypassed branch is already {}",
                self.graph[started].id,
                self.graph[started].status()
            )));
        }

        let finished_at = self.graph[if_index].info.finished_at;
        let mut skipped = Vec::with_capacity(subtree.len());
        for &index in &subtree {
            let task = &mut self.graph[index];
            task.info.status = TaskStatus::Skipped;
            task.info.finished_at = finished_at;
            skipped.push(task.id.clone());
        }

        let leaving: Vec<EdgeIndex> = subtree
            .iter()
            .flat_map(|&index| self.graph.edges_directed(index, Direction::Outgoing))
            .filter(|edge| !subtree.contains(&edge.target()))
            .map(|edge| edge.id())
            .collect();
        for edge in leaving {
            self.graph[edge].bypassed = true;
        }
        Ok(skipped)
    }
}

#[derive(Debug, Default)]
struct GroupTally {
    required: u32,
    satisfied: u32,
    /// Satisfied edges plus edges whose parent is still alive.
    possible: u32,
}

fn satisfies(parent: &TaskInstance, dependency: &Dependency) -> bool {
    parent.provides_result() || (parent.status() == TaskStatus::Skipped && dependency.bypassed)
}

/// Not started yet, and not prevented from starting.
fn is_waiting(status: TaskStatus) -> bool {
    matches!(
        status,
        TaskStatus::Submitted | TaskStatus::Pending | TaskStatus::Paused
    )
}

impl Default for JobGraph {
    fn default() -> Self {
        Self::new(JobId::new())
    }
}

impl std::fmt::Debug for JobGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobGraph")
            .field("job", &self.job_id.short())
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .field("frozen", &self.frozen)
            .finish()
    }
}
