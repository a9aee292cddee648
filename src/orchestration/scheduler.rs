//! Scheduler service for submitted jobs.
//!
//! The Scheduler owns every live job, dispatches eligible tasks to hosts
//! picked by a [`NodeSelector`], applies execution reports through the
//! [`TaskLifecycle`] and restarts waiting tasks once their delay elapsed.
//! Each state change is emitted as a [`SchedulerEvent`].

use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::core::dag::JobGraph;
use crate::core::identity::{JobId, TaskId};
use crate::core::task::{TaskInstance, TaskStatus};
use crate::core::template::TaskTemplate;
use crate::error::{Error, Result};
use crate::job::{Job, JobSettings, JobStatus};
use crate::lifecycle::{ExecutionReport, TaskLifecycle, Transition};
use crate::orchestration::flow::ControlFlowProcessor;
use crate::{zlog, zlog_debug, zlog_warn};

/// Events emitted by the scheduler for job and task changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    JobSubmitted {
        job_id: JobId,
        tasks: usize,
    },
    /// A task was dispatched to `host`.
    TaskStarted {
        job_id: JobId,
        task_id: TaskId,
        host: String,
    },
    TaskStatusChanged {
        job_id: JobId,
        task_id: TaskId,
        status: TaskStatus,
    },
    /// A task errored and will be made pending again after `delay`.
    TaskRestarting {
        job_id: JobId,
        task_id: TaskId,
        delay: Duration,
    },
    /// LOOP or REPLICATE added instances.
    TasksCreated {
        job_id: JobId,
        tasks: Vec<TaskId>,
    },
    /// IF bypassed a branch, or REPLICATE superseded originals.
    TasksSkipped {
        job_id: JobId,
        tasks: Vec<TaskId>,
    },
    JobStatusChanged {
        job_id: JobId,
        status: JobStatus,
    },
    /// A report that could not apply was ignored.
    ReportDropped {
        job_id: JobId,
        task_id: TaskId,
        reason: String,
    },
}

/// Picks the host a task runs on.
pub trait NodeSelector: Send + Sync {
    /// A host for `task` outside `excluded`, or `None` when none is free.
    fn select(&self, task: &TaskInstance, excluded: &BTreeSet<String>) -> Option<String>;
}

/// Round robin over a fixed host list.
#[derive(Debug, Default)]
pub struct HostList {
    hosts: Vec<String>,
    next: AtomicUsize,
}

impl HostList {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hosts: hosts.into_iter().map(Into::into).collect(),
            next: AtomicUsize::new(0),
        }
    }
}

impl NodeSelector for HostList {
    fn select(&self, _task: &TaskInstance, excluded: &BTreeSet<String>) -> Option<String> {
        if self.hosts.is_empty() {
            return None;
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        (0..self.hosts.len())
            .map(|offset| &self.hosts[(start + offset) % self.hosts.len()])
            .find(|host| !excluded.contains(*host))
            .cloned()
    }
}

/// Scheduler for submitted jobs.
///
/// Cloning is cheap: clones share the same jobs and event channel.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use tokio::sync::mpsc;
/// use jobflow::config::SchedulerConfig;
/// use jobflow::orchestration::{HostList, Scheduler};
///
/// let (event_tx, mut event_rx) = mpsc::channel(100);
/// let scheduler = Scheduler::new(
///     SchedulerConfig::load()?,
///     Arc::new(HostList::new(["node-1", "node-2"])),
///     event_tx,
/// );
/// let job_id = scheduler.submit("nightly", templates).await?;
/// let started = scheduler.dispatch(job_id).await?;
/// ```
#[derive(Clone)]
pub struct Scheduler {
    config: SchedulerConfig,
    jobs: Arc<DashMap<JobId, Arc<RwLock<Job>>>>,
    flow: Arc<ControlFlowProcessor>,
    node_selector: Arc<dyn NodeSelector>,
    event_tx: mpsc::Sender<SchedulerEvent>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        node_selector: Arc<dyn NodeSelector>,
        event_tx: mpsc::Sender<SchedulerEvent>,
    ) -> Self {
        Self {
            config,
            jobs: Arc::new(DashMap::new()),
            flow: Arc::new(ControlFlowProcessor::default()),
            node_selector,
            event_tx,
        }
    }

    /// Use another flow processor, e.g. one with a scripting engine.
    pub fn with_flow(mut self, flow: ControlFlowProcessor) -> Self {
        self.flow = Arc::new(flow);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // ========== Jobs ==========

    /// Validate and submit a job. Its eligible tasks wait for [`dispatch`](Self::dispatch).
    pub async fn submit(&self, name: &str, templates: Vec<TaskTemplate>) -> Result<JobId> {
        let job = Job::submit(name, templates, &self.config)?;
        Ok(self.insert(job).await)
    }

    /// Resume a job from a graph snapshot taken with [`snapshot`](Self::snapshot).
    pub async fn restore(&self, name: &str, bytes: &[u8]) -> Result<JobId> {
        let graph = JobGraph::restore(bytes)?;
        if self.jobs.contains_key(&graph.job_id()) {
            return Err(Error::IllegalState(format!(
                "job {} is already scheduled",
                graph.job_id()
            )));
        }
        let mut job = Job::from_graph(name, graph, JobSettings::from(&self.config))?;
        job.refresh_status(Utc::now());
        Ok(self.insert(job).await)
    }

    /// Serialized graph of a job.
    pub async fn snapshot(&self, job_id: JobId) -> Result<Vec<u8>> {
        let handle = self.job(job_id)?;
        let job = handle.read().await;
        job.graph().serialize()
    }

    pub fn job(&self, job_id: JobId) -> Result<Arc<RwLock<Job>>> {
        self.jobs
            .get(&job_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(Error::JobNotFound(job_id))
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.jobs.iter().map(|entry| *entry.key()).collect()
    }

    pub async fn job_status(&self, job_id: JobId) -> Result<JobStatus> {
        Ok(self.job(job_id)?.read().await.status())
    }

    /// Forget a job that is over.
    pub async fn remove(&self, job_id: JobId) -> Result<()> {
        let status = self.job_status(job_id).await?;
        if status.is_alive() {
            return Err(Error::IllegalState(format!(
                "job {} is still {}",
                job_id, status
            )));
        }
        self.jobs.remove(&job_id);
        zlog_debug!("Job {} removed", job_id.short());
        Ok(())
    }

    // ========== Dispatch ==========

    /// Tasks of a job that may be dispatched now.
    pub async fn eligible(&self, job_id: JobId) -> Result<Vec<TaskId>> {
        let handle = self.job(job_id)?;
        let job = handle.read().await;
        Ok(job.eligible_tasks().map(|task| task.id.clone()).collect())
    }

    /// Dispatch every eligible task a host can be found for.
    ///
    /// Returns the started tasks with their hosts.
    pub async fn dispatch(&self, job_id: JobId) -> Result<Vec<(TaskId, String)>> {
        let handle = self.job(job_id)?;
        let (started, before, after) = {
            let mut job = handle.write().await;
            let before = job.status();
            let candidates: Vec<(TaskId, Option<String>)> = job
                .eligible_tasks()
                .map(|task| {
                    let host = self.node_selector.select(task, &task.info.excluded_hosts);
                    (task.id.clone(), host)
                })
                .collect();

            let now = Utc::now();
            let mut started = Vec::new();
            let mut lifecycle = TaskLifecycle::new(&mut job);
            for (task_id, host) in candidates {
                let Some(host) = host else {
                    zlog_debug!("No host available for task {}", task_id);
                    continue;
                };
                lifecycle.dispatch(&task_id, &host, now)?;
                started.push((task_id, host));
            }
            (started, before, job.status())
        };

        for (task_id, host) in &started {
            self.emit(SchedulerEvent::TaskStarted {
                job_id,
                task_id: task_id.clone(),
                host: host.clone(),
            })
            .await;
        }
        if before != after {
            self.emit(SchedulerEvent::JobStatusChanged {
                job_id,
                status: after,
            })
            .await;
        }
        Ok(started)
    }

    // ========== Reports ==========

    /// Apply an execution report.
    ///
    /// A report that cannot apply, like one for a task of a canceled or
    /// removed job, is logged and dropped: the call returns `Ok(None)`.
    pub async fn report(&self, job_id: JobId, report: ExecutionReport) -> Result<Option<Transition>> {
        let handle = match self.job(job_id) {
            Ok(handle) => handle,
            Err(err) => {
                zlog_warn!("Dropping report for task {}: {}", report.task_id, err);
                self.emit(SchedulerEvent::ReportDropped {
                    job_id,
                    task_id: report.task_id,
                    reason: err.to_string(),
                })
                .await;
                return Ok(None);
            }
        };
        let (recorded, token) = {
            let mut job = handle.write().await;
            let before = job.status();
            let recorded = TaskLifecycle::new(&mut job).record(&report, &self.flow);
            (recorded.map(|t| (before, t)), job.cancellation_token())
        };

        match recorded {
            Ok((before, transition)) => {
                self.settle(job_id, before, &transition, token).await;
                Ok(Some(transition))
            }
            Err(err) if err.is_recoverable() => {
                zlog_warn!("Dropping report for task {}: {}", report.task_id, err);
                self.emit(SchedulerEvent::ReportDropped {
                    job_id,
                    task_id: report.task_id,
                    reason: err.to_string(),
                })
                .await;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Make a task waiting for a restart pending again.
    pub async fn restart_task(&self, job_id: JobId, task_id: &TaskId) -> Result<Transition> {
        self.with_lifecycle(job_id, |lifecycle, now| lifecycle.restart_waiting(task_id, now))
            .await
    }

    /// Drain `reports` until `shutdown` fires or every sender is gone,
    /// dispatching after each report.
    pub async fn run(
        &self,
        reports: &mut mpsc::Receiver<(JobId, ExecutionReport)>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    zlog!("Scheduler shutting down");
                    break;
                }
                received = reports.recv() => {
                    let Some((job_id, report)) = received else {
                        break;
                    };
                    self.report(job_id, report).await?;
                    match self.job_status(job_id).await {
                        Ok(status) if status.is_alive() => {
                            self.dispatch(job_id).await?;
                        }
                        Ok(_) | Err(Error::JobNotFound(_)) => {}
                        Err(err) => return Err(err),
                    }
                }
            }
        }
        Ok(())
    }

    // ========== Operator actions ==========

    pub async fn kill_job(&self, job_id: JobId) -> Result<Vec<TaskId>> {
        let handle = self.job(job_id)?;
        let aborted = {
            let mut job = handle.write().await;
            TaskLifecycle::new(&mut job).kill_job(Utc::now())?
        };
        self.emit_statuses(job_id, &aborted, TaskStatus::Aborted).await;
        self.emit(SchedulerEvent::JobStatusChanged {
            job_id,
            status: JobStatus::Killed,
        })
        .await;
        Ok(aborted)
    }

    pub async fn pause_job(&self, job_id: JobId) -> Result<Vec<TaskId>> {
        let handle = self.job(job_id)?;
        let paused = {
            let mut job = handle.write().await;
            TaskLifecycle::new(&mut job).pause_job(Utc::now())?
        };
        self.emit_statuses(job_id, &paused, TaskStatus::Paused).await;
        self.emit(SchedulerEvent::JobStatusChanged {
            job_id,
            status: JobStatus::Paused,
        })
        .await;
        Ok(paused)
    }

    pub async fn resume_job(&self, job_id: JobId) -> Result<Vec<TaskId>> {
        let handle = self.job(job_id)?;
        let (resumed, status) = {
            let mut job = handle.write().await;
            let resumed = TaskLifecycle::new(&mut job).resume_job(Utc::now())?;
            (resumed, job.status())
        };
        self.emit_statuses(job_id, &resumed, TaskStatus::Pending).await;
        self.emit(SchedulerEvent::JobStatusChanged { job_id, status }).await;
        Ok(resumed)
    }

    pub async fn kill_task(&self, job_id: JobId, task_id: &TaskId) -> Result<Transition> {
        self.with_lifecycle(job_id, |lifecycle, now| lifecycle.kill_task(task_id, now))
            .await
    }

    pub async fn preempt_task(&self, job_id: JobId, task_id: &TaskId) -> Result<Transition> {
        self.with_lifecycle(job_id, |lifecycle, now| lifecycle.preempt_task(task_id, now))
            .await
    }

    pub async fn restart_in_error_task(&self, job_id: JobId, task_id: &TaskId) -> Result<Transition> {
        self.with_lifecycle(job_id, |lifecycle, now| {
            lifecycle.restart_in_error_task(task_id, now)
        })
        .await
    }

    pub async fn finish_in_error_task(&self, job_id: JobId, task_id: &TaskId) -> Result<Transition> {
        self.with_lifecycle(job_id, |lifecycle, now| {
            lifecycle.finish_in_error_task(task_id, now)
        })
        .await
    }

    // ========== Internals ==========

    async fn insert(&self, job: Job) -> JobId {
        let job_id = job.id();
        let tasks = job.graph().task_count();
        self.jobs.insert(job_id, Arc::new(RwLock::new(job)));
        self.emit(SchedulerEvent::JobSubmitted { job_id, tasks }).await;
        job_id
    }

    async fn with_lifecycle<F>(&self, job_id: JobId, apply: F) -> Result<Transition>
    where
        F: FnOnce(&mut TaskLifecycle<'_>, chrono::DateTime<Utc>) -> Result<Transition>,
    {
        let handle = self.job(job_id)?;
        let (before, transition, token) = {
            let mut job = handle.write().await;
            let before = job.status();
            let transition = apply(&mut TaskLifecycle::new(&mut job), Utc::now())?;
            (before, transition, job.cancellation_token())
        };
        self.settle(job_id, before, &transition, token).await;
        Ok(transition)
    }

    /// Emit the events of a transition and arm its restart timer.
    async fn settle(
        &self,
        job_id: JobId,
        before: JobStatus,
        transition: &Transition,
        token: CancellationToken,
    ) {
        for event in transition_events(job_id, before, transition) {
            self.emit(event).await;
        }
        if let Some(delay) = transition.restart_delay {
            self.schedule_restart(job_id, transition.task_id.clone(), delay, token);
        }
    }

    fn schedule_restart(
        &self,
        job_id: JobId,
        task_id: TaskId,
        delay: Duration,
        token: CancellationToken,
    ) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    zlog_debug!("Restart of task {} dropped, job {} is over", task_id, job_id.short());
                }
                _ = tokio::time::sleep(delay) => {
                    if let Err(err) = scheduler.restart_task(job_id, &task_id).await {
                        zlog_debug!("Restart of task {} skipped: {}", task_id, err);
                    }
                }
            }
        });
    }

    async fn emit_statuses(&self, job_id: JobId, tasks: &[TaskId], status: TaskStatus) {
        for task_id in tasks {
            self.emit(SchedulerEvent::TaskStatusChanged {
                job_id,
                task_id: task_id.clone(),
                status,
            })
            .await;
        }
    }

    async fn emit(&self, event: SchedulerEvent) {
        let _ = self.event_tx.send(event).await;
    }
}

fn transition_events(job_id: JobId, before: JobStatus, transition: &Transition) -> Vec<SchedulerEvent> {
    let mut events = Vec::new();
    if let Some(flow) = &transition.flow {
        if !flow.skipped.is_empty() {
            events.push(SchedulerEvent::TasksSkipped {
                job_id,
                tasks: flow.skipped.clone(),
            });
        }
        if !flow.created.is_empty() {
            events.push(SchedulerEvent::TasksCreated {
                job_id,
                tasks: flow.created.clone(),
            });
        }
    }
    events.push(SchedulerEvent::TaskStatusChanged {
        job_id,
        task_id: transition.task_id.clone(),
        status: transition.status,
    });
    if let Some(delay) = transition.restart_delay {
        events.push(SchedulerEvent::TaskRestarting {
            job_id,
            task_id: transition.task_id.clone(),
            delay,
        });
    }
    for (task_id, status) in &transition.affected {
        events.push(SchedulerEvent::TaskStatusChanged {
            job_id,
            task_id: task_id.clone(),
            status: *status,
        });
    }
    if transition.job_status != before {
        events.push(SchedulerEvent::JobStatusChanged {
            job_id,
            status: transition.job_status,
        });
    }
    events
}
