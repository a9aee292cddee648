//! Error policy and recovery integration tests.
//!
//! These tests verify how exhausted tasks affect the rest of their job
//! under each on-task-error policy, and where failed tasks are restarted.

use std::sync::Arc;

use chrono::Utc;

use jobflow::config::SchedulerConfig;
use jobflow::core::task::TaskStatus;
use jobflow::core::template::{OnTaskError, RestartMode};
use jobflow::orchestration::SchedulerEvent;
use jobflow::{ExecutionReport, JobStatus};

use crate::fixtures::{cmd, RecordingSelector, TestScheduler};

/// Test: CANCEL_JOB aborts everything at once
/// Given a job with a CANCEL_JOB task and a running sibling
/// When the task exhausts its executions
/// Then every other alive task is aborted and a late report is a no-op
#[tokio::test]
async fn test_cancel_job_aborts_and_drops_stale_report() {
    let mut ts = TestScheduler::new(&["h1", "h2"]);
    let job_id = ts
        .scheduler
        .submit(
            "cancel",
            vec![
                cmd("A").with_on_task_error(OnTaskError::CancelJob),
                cmd("B"),
                cmd("C").depends_on("A"),
            ],
        )
        .await
        .unwrap();
    ts.scheduler.dispatch(job_id).await.unwrap();
    ts.drain();

    let transition = ts.fail(job_id, "A").await;
    assert_eq!(transition.policy, Some(OnTaskError::CancelJob));
    assert_eq!(transition.job_status, JobStatus::Canceled);
    assert_eq!(ts.status(job_id, "B").await, TaskStatus::Aborted);
    assert_eq!(ts.status(job_id, "C").await, TaskStatus::Aborted);

    let token = {
        let handle = ts.scheduler.job(job_id).unwrap();
        let job = handle.read().await;
        job.cancellation_token()
    };
    assert!(token.is_cancelled());

    let b = ts.id(job_id, "B").await;
    let late = ts
        .scheduler
        .report(job_id, ExecutionReport::finished(b.clone(), Utc::now()))
        .await
        .unwrap();
    assert!(late.is_none());
    assert_eq!(ts.status(job_id, "B").await, TaskStatus::Aborted);
    assert!(ts.drain().iter().any(|e| matches!(
        e,
        SchedulerEvent::ReportDropped { task_id, .. } if task_id == &b
    )));
}

/// Test: CONTINUE_JOB_EXECUTION keeps the job going
/// Given a failing task with a dependent and an unrelated sibling
/// When the task exhausts its executions
/// Then the sibling and the dependent still finish
#[tokio::test]
async fn test_continue_job_execution_keeps_siblings() {
    let ts = TestScheduler::new(&["h1"]);
    let job_id = ts
        .scheduler
        .submit(
            "continue",
            vec![
                cmd("flaky").with_on_task_error(OnTaskError::ContinueJobExecution),
                cmd("consumer").depends_on("flaky"),
                cmd("sibling"),
                cmd("sibling-next").depends_on("sibling"),
            ],
        )
        .await
        .unwrap();
    ts.scheduler.dispatch(job_id).await.unwrap();

    let transition = ts.fail(job_id, "flaky").await;
    assert_eq!(transition.status, TaskStatus::Faulty);
    assert_eq!(transition.job_status, JobStatus::Running);
    assert_eq!(ts.status(job_id, "consumer").await, TaskStatus::Pending);

    ts.finish(job_id, "sibling", None).await;
    let status = ts.run_until_idle(job_id, |_| None).await;
    assert_eq!(status, JobStatus::Finished);
    assert_eq!(
        ts.names_with_status(job_id, TaskStatus::Finished).await,
        vec!["consumer", "sibling", "sibling-next"]
    );

    let flaky = ts.id(job_id, "flaky").await;
    let handle = ts.scheduler.job(job_id).unwrap();
    let job = handle.read().await;
    let consumer = job.graph().find_by_name("consumer").unwrap();
    assert!(consumer.info.missing_results.contains(&flaky));
}

/// Test: Default policy fails the job
/// Given a job with default settings
/// When a task exhausts its executions while a sibling waits for a restart
/// Then the job fails and the waiting sibling is not restarted
#[tokio::test]
async fn test_none_policy_fails_job() {
    let ts = TestScheduler::new(&["h1"]);
    let job_id = ts
        .scheduler
        .submit(
            "fail",
            vec![cmd("A"), cmd("B").with_max_executions(3), cmd("C").depends_on("A")],
        )
        .await
        .unwrap();
    ts.scheduler.dispatch(job_id).await.unwrap();

    let transition = ts.fail(job_id, "B").await;
    assert_eq!(transition.status, TaskStatus::WaitingOnError);
    let transition = ts.fail(job_id, "A").await;
    assert_eq!(transition.job_status, JobStatus::Failed);
    assert_eq!(ts.status(job_id, "B").await, TaskStatus::NotRestarted);
    assert_eq!(ts.status(job_id, "C").await, TaskStatus::NotStarted);
}

/// Test: PAUSE_JOB holds the job for an operator
/// Given a PAUSE_JOB task
/// When it exhausts its executions
/// Then the job pauses, and restarting the task after resuming finishes the job
#[tokio::test]
async fn test_pause_job_then_operator_restart() {
    let ts = TestScheduler::new(&["h1"]);
    let job_id = ts
        .scheduler
        .submit(
            "pause",
            vec![cmd("A").with_on_task_error(OnTaskError::PauseJob), cmd("B")],
        )
        .await
        .unwrap();
    ts.scheduler.dispatch(job_id).await.unwrap();
    ts.finish(job_id, "B", None).await;

    let transition = ts.fail(job_id, "A").await;
    assert_eq!(transition.status, TaskStatus::InError);
    assert_eq!(transition.job_status, JobStatus::Paused);
    assert!(ts.scheduler.eligible(job_id).await.unwrap().is_empty());

    ts.scheduler.resume_job(job_id).await.unwrap();
    let a = ts.id(job_id, "A").await;
    ts.scheduler.restart_in_error_task(job_id, &a).await.unwrap();
    assert_eq!(ts.run_until_idle(job_id, |_| None).await, JobStatus::Finished);
}

/// Test: ELSEWHERE restarts avoid previous hosts
/// Given a task with three executions restarted elsewhere
/// When it fails on h1 and then on h2
/// Then the host selector is asked for a host outside {h1, h2}
#[tokio::test]
async fn test_restart_elsewhere_excludes_failed_hosts() {
    let selector = Arc::new(RecordingSelector::new(&["h1", "h2", "h3"]));
    let ts = TestScheduler::with_selector(SchedulerConfig::default(), selector.clone());
    let job_id = ts
        .scheduler
        .submit(
            "elsewhere",
            vec![cmd("A")
                .with_max_executions(3)
                .with_restart_mode(RestartMode::Elsewhere)],
        )
        .await
        .unwrap();
    let a = ts.id(job_id, "A").await;

    for expected in ["h1", "h2"] {
        let started = ts.scheduler.dispatch(job_id).await.unwrap();
        assert_eq!(started, vec![(a.clone(), expected.to_string())]);
        ts.fail(job_id, "A").await;
        ts.scheduler.restart_task(job_id, &a).await.unwrap();
    }

    let started = ts.scheduler.dispatch(job_id).await.unwrap();
    let excluded: Vec<String> = selector.last_excluded().into_iter().collect();
    assert_eq!(excluded, vec!["h1", "h2"]);
    assert_eq!(started, vec![(a, "h3".to_string())]);
}

/// Test: Node loss restarts without consuming executions
/// Given a task whose node disappears once
/// When the loss is reported
/// Then the task waits on failure and later finishes normally
#[tokio::test]
async fn test_node_loss_restart() {
    let ts = TestScheduler::new(&["h1"]);
    let job_id = ts.scheduler.submit("lost", vec![cmd("A")]).await.unwrap();
    ts.scheduler.dispatch(job_id).await.unwrap();
    let a = ts.id(job_id, "A").await;

    let transition = ts
        .scheduler
        .report(job_id, ExecutionReport::node_lost(a.clone(), "heartbeat timeout", Utc::now()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(transition.status, TaskStatus::WaitingOnFailure);
    assert!(transition.restart_delay.is_some());

    ts.scheduler.restart_task(job_id, &a).await.unwrap();
    assert_eq!(ts.run_until_idle(job_id, |_| None).await, JobStatus::Finished);
}
