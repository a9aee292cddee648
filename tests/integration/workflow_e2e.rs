//! End to end workflow tests.
//!
//! These tests drive jobs through the scheduler the way an execution
//! worker would, checking how each flow construct reshapes the graph.

use serde_json::json;

use jobflow::core::identity::parse_iteration_index;
use jobflow::core::task::TaskStatus;
use jobflow::core::{FlowAction, FlowBlock, FlowScript};
use jobflow::orchestration::SchedulerEvent;
use jobflow::JobStatus;

use crate::fixtures::{branch_workflow, cmd, fan_out_workflow, loop_workflow, TestScheduler};

/// Test: Linear job runs to completion
/// Given a three task chain
/// When every task succeeds
/// Then the job finishes and each task ran once
#[tokio::test]
async fn test_linear_job_finishes() {
    let ts = TestScheduler::new(&["h1"]);
    let job_id = ts
        .scheduler
        .submit(
            "chain",
            vec![cmd("A"), cmd("B").depends_on("A"), cmd("C").depends_on("B")],
        )
        .await
        .unwrap();

    let status = ts.run_until_idle(job_id, |_| None).await;
    assert_eq!(status, JobStatus::Finished);
    assert_eq!(
        ts.names_with_status(job_id, TaskStatus::Finished).await,
        vec!["A", "B", "C"]
    );
}

/// Test: REPLICATE fan-in
/// Given split -> work -> merge where split replicates work
/// When split asks for three runs
/// Then merge requires all three replicas and only starts after the last one
#[tokio::test]
async fn test_replicate_fan_in() {
    let mut ts = TestScheduler::new(&["h1", "h2"]);
    let job_id = ts.scheduler.submit("fan-out", fan_out_workflow()).await.unwrap();
    ts.scheduler.dispatch(job_id).await.unwrap();

    let transition = ts.finish(job_id, "split", Some(json!({ "runs": 3 }))).await;
    let flow = transition.flow.unwrap();
    assert_eq!(flow.action, FlowAction::Replicate { runs: 3 });
    assert_eq!(flow.created.len(), 3);
    assert_eq!(flow.skipped, vec![ts.id(job_id, "work").await]);
    assert!(ts.drain().iter().any(|e| matches!(
        e,
        SchedulerEvent::TasksCreated { tasks, .. } if tasks.len() == 3
    )));

    let merge = ts.id(job_id, "merge").await;
    {
        let handle = ts.scheduler.job(job_id).unwrap();
        let job = handle.read().await;
        assert_eq!(job.graph().required_dependency_count(&merge), 3);
    }

    let started = ts.scheduler.dispatch(job_id).await.unwrap();
    let names: Vec<&str> = started.iter().map(|(id, _)| id.readable_name()).collect();
    assert_eq!(names, vec!["work*0", "work*1", "work*2"]);

    ts.finish(job_id, "work*0", None).await;
    ts.finish(job_id, "work*1", None).await;
    assert!(ts.scheduler.eligible(job_id).await.unwrap().is_empty());

    ts.finish(job_id, "work*2", None).await;
    assert_eq!(ts.scheduler.eligible(job_id).await.unwrap(), vec![merge]);

    assert_eq!(ts.run_until_idle(job_id, |_| None).await, JobStatus::Finished);
    assert_eq!(ts.status(job_id, "work").await, TaskStatus::Skipped);
}

/// Test: IF selects one branch
/// Given check branching to fast or slow, joining into publish
/// When check selects the else branch
/// Then fast is skipped and the join still runs
#[tokio::test]
async fn test_if_runs_selected_branch() {
    let mut ts = TestScheduler::new(&["h1"]);
    let job_id = ts.scheduler.submit("branch", branch_workflow()).await.unwrap();

    let status = ts
        .run_until_idle(job_id, |name| {
            (name == "check").then(|| json!({ "branch": "else" }))
        })
        .await;
    assert_eq!(status, JobStatus::Finished);
    assert_eq!(ts.status(job_id, "fast").await, TaskStatus::Skipped);
    assert_eq!(
        ts.names_with_status(job_id, TaskStatus::Finished).await,
        vec!["check", "notify", "publish", "slow"]
    );

    let fast = ts.id(job_id, "fast").await;
    assert!(ts.drain().iter().any(|e| matches!(
        e,
        SchedulerEvent::TasksSkipped { tasks, .. } if tasks == &vec![fast.clone()]
    )));
}

/// Test: LOOP iterations
/// Given a start..end block whose end loops back to start
/// When the loop continues twice and then stops
/// Then each block task has three instances with iterations 0, 1 and 2
#[tokio::test]
async fn test_loop_runs_c_plus_one_iterations() {
    let ts = TestScheduler::new(&["h1"]);
    let job_id = ts.scheduler.submit("loop", loop_workflow()).await.unwrap();

    let status = ts
        .run_until_idle(job_id, |name| {
            name.starts_with("end")
                .then(|| json!({ "loop": parse_iteration_index(name) < 2 }))
        })
        .await;
    assert_eq!(status, JobStatus::Finished);

    let finished = ts.names_with_status(job_id, TaskStatus::Finished).await;
    let bodies: Vec<&String> = finished.iter().filter(|n| n.starts_with("body")).collect();
    assert_eq!(bodies, vec!["body", "body#1", "body#2"]);
    let iterations: Vec<u32> = bodies.iter().map(|n| parse_iteration_index(n)).collect();
    assert_eq!(iterations, vec![0, 1, 2]);
    assert!(finished.contains(&"report".to_string()));

    let handle = ts.scheduler.job(job_id).unwrap();
    let job = handle.read().await;
    assert_eq!(job.graph().closed_loops().len(), 1);
    assert!(job
        .graph()
        .closed_loops()
        .iter()
        .any(|id| id.readable_name() == "end#2"));
}

/// Test: LOOP around REPLICATE
/// Given a loop body that fans work out through split and back into merge
/// When split asks for two runs in each of two iterations
/// Then every iteration runs exactly two work replicas and one merge
#[tokio::test]
async fn test_loop_around_replicate_keeps_fan_out() {
    let ts = TestScheduler::new(&["h1", "h2"]);
    let job_id = ts
        .scheduler
        .submit(
            "nested",
            vec![
                cmd("start").with_flow_block(FlowBlock::Start),
                cmd("split")
                    .with_flow_script(FlowScript::replicate("runs = 2"))
                    .depends_on("start"),
                cmd("work").depends_on("split"),
                cmd("merge").depends_on("work"),
                cmd("end")
                    .with_flow_block(FlowBlock::End)
                    .with_flow_script(FlowScript::looping("loop = first", "start"))
                    .depends_on("merge"),
            ],
        )
        .await
        .unwrap();

    let status = ts
        .run_until_idle(job_id, |name| match name {
            _ if name.starts_with("split") => Some(json!({ "runs": 2 })),
            _ if name.starts_with("end") => {
                Some(json!({ "loop": parse_iteration_index(name) < 1 }))
            }
            _ => None,
        })
        .await;
    assert_eq!(status, JobStatus::Finished);

    let finished = ts.names_with_status(job_id, TaskStatus::Finished).await;
    let work: Vec<&String> = finished.iter().filter(|n| n.starts_with("work")).collect();
    assert_eq!(work, vec!["work#1*0", "work#1*1", "work*0", "work*1"]);
    let merges: Vec<&String> = finished.iter().filter(|n| n.starts_with("merge")).collect();
    assert_eq!(merges, vec!["merge", "merge#1"]);
}

/// Test: Worker-computed flow action
/// Given a split task whose worker already evaluated the flow script
/// When the report carries the action
/// Then the scheduler applies it without evaluating the result
#[tokio::test]
async fn test_reported_flow_action_wins() {
    let ts = TestScheduler::new(&["h1"]);
    let job_id = ts.scheduler.submit("fan-out", fan_out_workflow()).await.unwrap();
    ts.scheduler.dispatch(job_id).await.unwrap();
    let split = ts.id(job_id, "split").await;

    let transition = ts
        .scheduler
        .report(
            job_id,
            jobflow::ExecutionReport::finished(split, chrono::Utc::now())
                .with_flow_action(FlowAction::Replicate { runs: 2 }),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(transition.flow.unwrap().created.len(), 2);
    assert_eq!(ts.scheduler.eligible(job_id).await.unwrap().len(), 2);
}
