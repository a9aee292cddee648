//! Snapshot, replay and configuration tests.

use chrono::Utc;
use serde_json::json;
use tempfile::TempDir;

use jobflow::config::{FailureExhaustion, SchedulerConfig};
use jobflow::core::dag::JobGraph;
use jobflow::core::identity::{parse_iteration_index, TaskId};
use jobflow::core::task::TaskStatus;
use jobflow::core::template::OnTaskError;
use jobflow::{ExecutionReport, JobStatus};

use crate::fixtures::{cmd, fan_out_workflow, loop_workflow, TestScheduler};

fn task_ids(graph: &JobGraph) -> Vec<TaskId> {
    let mut ids: Vec<TaskId> = graph.tasks().map(|t| t.id.clone()).collect();
    ids.sort();
    ids
}

/// Test: Replay after restore
/// Given a job that replicated and looped while running
/// When its submitted snapshot is restored and the journal replayed
/// Then the replayed graph has the same tasks and edges, on every replay
#[tokio::test]
async fn test_replay_reproduces_mutations() {
    let ts = TestScheduler::new(&["h1", "h2"]);
    let mut templates = fan_out_workflow();
    templates.extend(loop_workflow());
    let job_id = ts.scheduler.submit("replay", templates).await.unwrap();
    let base = ts.scheduler.snapshot(job_id).await.unwrap();

    let status = ts
        .run_until_idle(job_id, |name| match name {
            "split" => Some(json!({ "runs": 2 })),
            _ if name.starts_with("end") => {
                Some(json!({ "loop": parse_iteration_index(name) < 1 }))
            }
            _ => None,
        })
        .await;
    assert_eq!(status, JobStatus::Finished);

    let live = JobGraph::restore(&ts.scheduler.snapshot(job_id).await.unwrap()).unwrap();
    assert_eq!(live.journal().len(), 3);

    let mut replayed = JobGraph::restore(&base).unwrap();
    replayed.replay(live.journal()).unwrap();
    assert_eq!(task_ids(&replayed), task_ids(&live));
    assert_eq!(replayed.dependency_count(), live.dependency_count());
    assert_eq!(replayed.journal(), live.journal());
    assert_eq!(replayed.closed_loops(), live.closed_loops());

    let mut again = JobGraph::restore(&base).unwrap();
    again.replay(live.journal()).unwrap();
    assert_eq!(again.serialize().unwrap(), replayed.serialize().unwrap());
}

/// Test: Resume a job in another scheduler
/// Given a half-finished job
/// When its snapshot is restored by a fresh scheduler
/// Then the remaining tasks run there
#[tokio::test]
async fn test_restore_resumes_job() {
    let ts = TestScheduler::new(&["h1"]);
    let job_id = ts
        .scheduler
        .submit("resume", vec![cmd("A"), cmd("B").depends_on("A")])
        .await
        .unwrap();
    ts.scheduler.dispatch(job_id).await.unwrap();
    ts.finish(job_id, "A", None).await;
    let bytes = ts.scheduler.snapshot(job_id).await.unwrap();

    let other = TestScheduler::new(&["h2"]);
    assert_eq!(other.scheduler.restore("resume", &bytes).await.unwrap(), job_id);
    assert_eq!(other.status(job_id, "A").await, TaskStatus::Finished);
    assert_eq!(other.run_until_idle(job_id, |_| None).await, JobStatus::Finished);
}

/// Test: Configuration file drives exhaustion
/// Given a config file choosing to apply task policies on node loss
/// When a PAUSE_TASK task loses its last node
/// Then the task pauses instead of failing the job
#[tokio::test]
async fn test_config_file_failure_exhaustion() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("jobflow.toml");
    let config = SchedulerConfig {
        failure_exhaustion: FailureExhaustion::ApplyOnTaskError,
        restart_delay_ms: 250,
        ..SchedulerConfig::default()
    };
    config.save_to(&path).unwrap();

    let loaded = SchedulerConfig::load_from(&path).unwrap();
    assert_eq!(loaded.failure_exhaustion, FailureExhaustion::ApplyOnTaskError);
    assert_eq!(loaded.restart_delay_ms, 250);

    let ts = TestScheduler::with_config(loaded, &["h1"]);
    let job_id = ts
        .scheduler
        .submit(
            "lost",
            vec![cmd("A")
                .with_max_executions_on_failure(1)
                .with_on_task_error(OnTaskError::PauseTask)],
        )
        .await
        .unwrap();
    ts.scheduler.dispatch(job_id).await.unwrap();
    let a = ts.id(job_id, "A").await;
    let transition = ts
        .scheduler
        .report(job_id, ExecutionReport::node_lost(a, "rack down", Utc::now()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(transition.policy, Some(OnTaskError::PauseTask));
    assert_eq!(transition.status, TaskStatus::InError);
    assert_eq!(transition.job_status, JobStatus::InError);
}
