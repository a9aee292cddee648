//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scheduler wired to an event channel and a static host list
//! - A host selector stub that records the exclusions it was given
//! - Predefined workflows using each flow construct

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;

use jobflow::config::SchedulerConfig;
use jobflow::core::identity::{JobId, TaskId};
use jobflow::core::task::{TaskInstance, TaskStatus};
use jobflow::core::template::{FlowBlock, FlowScript, TaskTemplate};
use jobflow::orchestration::{HostList, NodeSelector, Scheduler, SchedulerEvent};
use jobflow::{ExecutionReport, JobStatus, Transition};

/// A scheduler with its event receiver.
pub struct TestScheduler {
    pub scheduler: Scheduler,
    pub events: mpsc::Receiver<SchedulerEvent>,
}

impl TestScheduler {
    /// Scheduler with default configuration over `hosts`.
    pub fn new(hosts: &[&str]) -> Self {
        Self::with_config(SchedulerConfig::default(), hosts)
    }

    pub fn with_config(config: SchedulerConfig, hosts: &[&str]) -> Self {
        Self::with_selector(config, Arc::new(HostList::new(hosts.iter().copied())))
    }

    pub fn with_selector(config: SchedulerConfig, selector: Arc<dyn NodeSelector>) -> Self {
        let (event_tx, events) = mpsc::channel(1000);
        Self {
            scheduler: Scheduler::new(config, selector, event_tx),
            events,
        }
    }

    pub async fn id(&self, job_id: JobId, name: &str) -> TaskId {
        let handle = self.scheduler.job(job_id).expect("job exists");
        let job = handle.read().await;
        job.graph()
            .find_by_name(name)
            .unwrap_or_else(|| panic!("no task named {}", name))
            .id
            .clone()
    }

    pub async fn status(&self, job_id: JobId, name: &str) -> TaskStatus {
        let id = self.id(job_id, name).await;
        let handle = self.scheduler.job(job_id).expect("job exists");
        let job = handle.read().await;
        job.task(&id).expect("task exists").status()
    }

    /// Readable names of the tasks in `status`, sorted.
    pub async fn names_with_status(&self, job_id: JobId, status: TaskStatus) -> Vec<String> {
        let handle = self.scheduler.job(job_id).expect("job exists");
        let job = handle.read().await;
        let mut names: Vec<String> = job
            .graph()
            .tasks()
            .filter(|t| t.status() == status)
            .map(|t| t.id.readable_name().to_string())
            .collect();
        names.sort();
        names
    }

    pub async fn finish(&self, job_id: JobId, name: &str, result: Option<Value>) -> Transition {
        let id = self.id(job_id, name).await;
        let mut report = ExecutionReport::finished(id, Utc::now());
        if let Some(result) = result {
            report = report.with_result(result);
        }
        self.scheduler
            .report(job_id, report)
            .await
            .expect("report accepted")
            .expect("report applied")
    }

    pub async fn fail(&self, job_id: JobId, name: &str) -> Transition {
        let id = self.id(job_id, name).await;
        self.scheduler
            .report(job_id, ExecutionReport::faulty(id, "exit code 1", Utc::now()))
            .await
            .expect("report accepted")
            .expect("report applied")
    }

    /// Dispatch and finish tasks until nothing is left to start, using
    /// `results` to produce each task's result from its readable name.
    pub async fn run_until_idle<F>(&self, job_id: JobId, results: F) -> JobStatus
    where
        F: Fn(&str) -> Option<Value>,
    {
        loop {
            let started = self.scheduler.dispatch(job_id).await.expect("dispatch");
            if started.is_empty() {
                break;
            }
            for (task_id, _host) in started {
                let mut report = ExecutionReport::finished(task_id.clone(), Utc::now());
                if let Some(result) = results(task_id.readable_name()) {
                    report = report.with_result(result);
                }
                self.scheduler
                    .report(job_id, report)
                    .await
                    .expect("report accepted");
            }
        }
        self.scheduler.job_status(job_id).await.expect("job exists")
    }

    pub fn drain(&mut self) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Host selector that records every exclusion set it is asked about.
pub struct RecordingSelector {
    hosts: Vec<String>,
    pub seen: Mutex<Vec<BTreeSet<String>>>,
}

impl RecordingSelector {
    pub fn new(hosts: &[&str]) -> Self {
        Self {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn last_excluded(&self) -> BTreeSet<String> {
        self.seen
            .lock()
            .expect("lock")
            .last()
            .cloned()
            .unwrap_or_default()
    }
}

impl NodeSelector for RecordingSelector {
    fn select(&self, _task: &TaskInstance, excluded: &BTreeSet<String>) -> Option<String> {
        self.seen.lock().expect("lock").push(excluded.clone());
        self.hosts.iter().find(|h| !excluded.contains(*h)).cloned()
    }
}

pub fn cmd(name: &str) -> TaskTemplate {
    TaskTemplate::command(name, &format!("run-{}", name))
}

/// split -> work -> merge, where split replicates work
pub fn fan_out_workflow() -> Vec<TaskTemplate> {
    vec![
        cmd("split").with_flow_script(FlowScript::replicate("runs = len(chunks)")),
        cmd("work").depends_on("split"),
        cmd("merge").depends_on("work"),
    ]
}

/// check branches to fast or slow, both joining into publish
pub fn branch_workflow() -> Vec<TaskTemplate> {
    vec![
        cmd("check").with_flow_script(FlowScript::branch(
            "branch = 'if' if cached else 'else'",
            "fast",
            "slow",
            Some("publish"),
        )),
        cmd("fast"),
        cmd("slow"),
        cmd("publish"),
        cmd("notify").depends_on("publish"),
    ]
}

/// start -> body -> end where end loops back to start, then report
pub fn loop_workflow() -> Vec<TaskTemplate> {
    vec![
        cmd("start").with_flow_block(FlowBlock::Start),
        cmd("body").depends_on("start"),
        cmd("end")
            .with_flow_block(FlowBlock::End)
            .with_flow_script(FlowScript::looping("loop = remaining > 0", "start"))
            .depends_on("body"),
        cmd("report").depends_on("end"),
    ]
}
