//! Tests for resuming processes after an engine restart.

mod common;

use std::time::Duration;

use chrono::Utc;

use jobflow::EngineError;
use jobflow::engine::Engine;
use jobflow::engine::process::ProcessOutcome;
use jobflow::engine::registry::{CallContext, Pid};
use jobflow::engine::state_machine::{Continuation, ProcessState, StateLabel, WaitCommand};
use jobflow::engine::types::{CalcState, JobState, Value};
use jobflow::records::RecordStore;
use jobflow::storage::{Checkpoint, CheckpointArea, CheckpointStore};

use common::{MockCluster, TestEnv, echo_inputs, eventually, inputs};

/// Wait until `pid` is checkpointed in `command` and the cluster has seen
/// at least `polls` scheduler queries.
async fn wait_for(env: &TestEnv, pid: Pid, command: WaitCommand, polls: usize) {
    let checkpoints = env.checkpoints.clone();
    let cluster = env.cluster.clone();
    let reached = eventually(Duration::from_secs(2), || {
        let checkpoints = checkpoints.clone();
        let cluster = cluster.clone();
        async move {
            let at_command = matches!(
                checkpoints.load(CheckpointArea::Running, pid).await.unwrap(),
                Some(Checkpoint { state: ProcessState::Waiting { command: c, .. }, .. }) if c == command
            );
            at_command && cluster.count("poll") >= polls
        }
    })
    .await;
    assert!(reached, "process {} never reached {}", pid, command);
}

/// Abort the handle and let any transport task it left behind settle.
async fn crash(handle: jobflow::engine::ProcessHandle) {
    handle.abort();
    let outcome = handle.wait().await;
    assert!(matches!(outcome, ProcessOutcome::Cancelled(Some(ref m)) if m == "aborted"));
    tokio::time::sleep(Duration::from_millis(30)).await;
}

async fn resume_one(engine: &Engine) -> ProcessOutcome {
    let mut handles = engine.resume_all().await.unwrap();
    assert_eq!(handles.len(), 1);
    handles.remove(0).wait().await
}

// ===== Resume from checkpoints =====

#[tokio::test]
async fn resume_mid_poll_does_not_resubmit() {
    let env = TestEnv::new(MockCluster::with_trajectory(vec![Some(JobState::Queued); 1000]));
    let handle = env.engine.submit("echo", echo_inputs(42)).await.unwrap();
    let pid = handle.pid();

    wait_for(&env, pid, WaitCommand::UpdateScheduler, 2).await;
    crash(handle).await;
    assert!(env.engine.registry().is_empty());

    let before = env.cluster.log().len();
    env.cluster.set_trajectory(vec![Some(JobState::Running)]);

    let engine = env.restart();
    let outcome = resume_one(&engine).await;
    assert_eq!(outcome.into_result().unwrap()["result"], Value::Int(42));

    assert_eq!(env.cluster.submits(), 1);
    let after: Vec<String> = env.cluster.log()[before..].to_vec();
    assert_eq!(after.first().map(String::as_str), Some("poll"));
    assert!(after.iter().all(|op| op != "submit"));

    let rec = env.records.get(pid.into()).await.unwrap();
    assert_eq!(rec.calc_state, CalcState::Finished);
    assert_eq!(rec.job_id.as_deref(), Some("1000"));
    assert!(env.checkpoints.load(CheckpointArea::Finished, pid).await.unwrap().is_some());
}

#[tokio::test]
async fn resumed_result_matches_uninterrupted_run() {
    let reference = TestEnv::new(MockCluster::new());
    let expected = reference
        .engine
        .run("echo", echo_inputs(11))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    let env = TestEnv::new(MockCluster::with_trajectory(vec![Some(JobState::Queued); 1000]));
    let handle = env.engine.submit("echo", echo_inputs(11)).await.unwrap();
    wait_for(&env, handle.pid(), WaitCommand::UpdateScheduler, 1).await;
    crash(handle).await;
    env.cluster.set_trajectory(vec![]);

    let resumed = resume_one(&env.restart()).await.into_result().unwrap();
    assert_eq!(resumed, expected);
}

#[tokio::test]
async fn resume_while_waiting_for_submission() {
    let cluster = MockCluster::new();
    cluster.set_open_delay(Duration::from_millis(500));
    let env = TestEnv::new(cluster);
    let handle = env.engine.submit("echo", echo_inputs(6)).await.unwrap();
    let pid = handle.pid();

    wait_for(&env, pid, WaitCommand::Submit, 0).await;
    crash(handle).await;
    assert_eq!(env.cluster.submits(), 0);

    env.cluster.set_open_delay(Duration::ZERO);
    let outcome = resume_one(&env.restart()).await;
    assert_eq!(outcome.label(), StateLabel::Finished);
    assert_eq!(env.cluster.submits(), 1);
}

#[tokio::test]
async fn recorded_job_id_prevents_second_submission() {
    let env = TestEnv::new(MockCluster::new());
    let process = env.engine.create("echo", echo_inputs(3)).await.unwrap();
    let pid = process.pid();
    let record = process.record();

    // Crashed after the scheduler accepted the job but before the
    // checkpoint moved past Submit.
    let mut checkpoint = process.checkpoint();
    checkpoint.state = ProcessState::waiting(WaitCommand::Submit, None);
    drop(process);
    env.checkpoints
        .save(CheckpointArea::Running, &checkpoint)
        .await
        .unwrap();
    env.records.set_job_id(record, "777").await.unwrap();
    env.records.set_state(record, CalcState::WithScheduler).await.unwrap();
    env.cluster
        .put_remote(&format!("/scratch/jobflow/{}/output.txt", record), "3");

    let outcome = resume_one(&env.restart()).await;
    assert_eq!(outcome.into_result().unwrap()["result"], Value::Int(3));
    assert_eq!(env.cluster.submits(), 0);
    assert_eq!(env.records.get(record).await.unwrap().job_id.as_deref(), Some("777"));
    assert!(env.checkpoints.load(CheckpointArea::Running, pid).await.unwrap().is_none());
}

#[tokio::test]
async fn resume_drops_children_and_files_terminal_checkpoints() {
    let env = TestEnv::new(MockCluster::new());
    let stamp = |pid: u64, parent: Option<u64>, state: ProcessState| Checkpoint {
        pid: Pid(pid),
        spec: "sum".to_string(),
        parent: parent.map(Pid),
        state,
        inputs: inputs(vec![("a", Value::Int(1)), ("b", Value::Int(2))]),
        ctx: Default::default(),
        outputs: Default::default(),
        calc_info: None,
        saved: Utc::now(),
    };
    let store = env.checkpoints.clone();
    store
        .save(CheckpointArea::Running, &stamp(50, Some(49), ProcessState::Created))
        .await
        .unwrap();
    store
        .save(CheckpointArea::Running, &stamp(51, None, ProcessState::Finished))
        .await
        .unwrap();

    let handles = env.restart().resume_all().await.unwrap();
    assert!(handles.is_empty());
    assert!(store.load_all(CheckpointArea::Running).await.unwrap().is_empty());
    assert!(store.load(CheckpointArea::Finished, Pid(51)).await.unwrap().is_some());
    assert!(store.load(CheckpointArea::Failed, Pid(50)).await.unwrap().is_none());
}

#[tokio::test]
async fn resume_files_checkpoints_of_sealed_records() {
    let env = TestEnv::new(MockCluster::new());
    let process = env
        .engine
        .create("sum", inputs(vec![("a", Value::Int(1)), ("b", Value::Int(2))]))
        .await
        .unwrap();
    let pid = process.pid();
    let record = process.record();

    // Crashed after the record was sealed but while the last checkpoint
    // still sat in the running area.
    let mut checkpoint = process.checkpoint();
    checkpoint.state = ProcessState::running(Continuation::Step { index: 0 });
    drop(process);
    env.checkpoints
        .save(CheckpointArea::Running, &checkpoint)
        .await
        .unwrap();
    env.records.set_state(record, CalcState::Finished).await.unwrap();
    env.records
        .set_process_state(record, StateLabel::Finished)
        .await
        .unwrap();
    env.records.seal(record).await.unwrap();

    let engine = env.restart();
    let handles = engine.resume_all().await.unwrap();
    assert!(handles.is_empty());
    assert!(engine.registry().is_empty());
    assert!(env.checkpoints.load(CheckpointArea::Running, pid).await.unwrap().is_none());
    let filed = env.checkpoints.load(CheckpointArea::Finished, pid).await.unwrap().unwrap();
    assert_eq!(filed.state, checkpoint.state);
}

#[tokio::test]
async fn finished_process_leaves_no_running_checkpoint() {
    let env = TestEnv::new(MockCluster::new());
    let process = env.engine.create("echo", echo_inputs(8)).await.unwrap();
    let pid = process.pid();
    let record = process.record();
    assert_eq!(process.run(CallContext::new()).await.label(), StateLabel::Finished);

    assert!(env.records.get(record).await.unwrap().sealed);
    assert!(env.checkpoints.load(CheckpointArea::Running, pid).await.unwrap().is_none());
    assert!(env.restart().resume_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn resume_skips_processes_still_running() {
    let env = TestEnv::new(MockCluster::with_trajectory(vec![Some(JobState::Queued); 1000]));
    let handle = env.engine.submit("echo", echo_inputs(1)).await.unwrap();
    wait_for(&env, handle.pid(), WaitCommand::UpdateScheduler, 1).await;

    // Same engine: the process is registered, so it is not started twice.
    let handles = env.engine.resume_all().await.unwrap();
    assert!(handles.is_empty());

    handle.cancel();
    assert_eq!(handle.wait().await.label(), StateLabel::Cancelled);
}

// ===== Continue from the durable record =====

#[tokio::test]
async fn continue_job_from_record_state() {
    let env = TestEnv::new(MockCluster::with_trajectory(vec![Some(JobState::Queued); 1000]));
    let handle = env.engine.submit("echo", echo_inputs(21)).await.unwrap();
    let pid = handle.pid();
    wait_for(&env, pid, WaitCommand::UpdateScheduler, 1).await;
    crash(handle).await;

    // The checkpoint is lost; only the record remains.
    env.checkpoints.delete(CheckpointArea::Running, pid).await.unwrap();
    env.cluster.set_trajectory(vec![]);

    let engine = env.restart();
    let handle = engine
        .continue_job("echo", pid.into(), echo_inputs(21))
        .await
        .unwrap();
    let outputs = handle.wait().await.into_result().unwrap();
    assert_eq!(outputs["result"], Value::Int(21));
    assert_eq!(env.cluster.submits(), 1);
}

#[tokio::test]
async fn continue_job_from_new_record_runs_everything() {
    let env = TestEnv::new(MockCluster::new());
    let process = env.engine.create("echo", echo_inputs(4)).await.unwrap();
    let record = process.record();
    drop(process);

    let handle = env
        .restart()
        .continue_job("echo", record, echo_inputs(4))
        .await
        .unwrap();
    assert_eq!(handle.wait().await.label(), StateLabel::Finished);
    assert_eq!(env.cluster.phases(), vec!["submit", "poll", "retrieve"]);
}

#[tokio::test]
async fn continue_job_rejects_sealed_record() {
    let env = TestEnv::new(MockCluster::new());
    let process = env.engine.create("echo", echo_inputs(4)).await.unwrap();
    let record = process.record();
    process.run(CallContext::new()).await;

    let err = env
        .engine
        .continue_job("echo", record, echo_inputs(4))
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::ModificationNotAllowed(_))
    ));

    let err = env
        .engine
        .continue_job("sum", record, inputs(vec![]))
        .await
        .err()
        .unwrap();
    assert!(err.to_string().contains("not a job"));
}

// ===== Shutdown =====

#[tokio::test]
async fn shutdown_waits_for_spawned_processes() {
    let env = TestEnv::new(MockCluster::new());
    let a = env.engine.submit("echo", echo_inputs(1)).await.unwrap();
    let b = env
        .engine
        .submit("sum", inputs(vec![("a", Value::Int(1)), ("b", Value::Int(2))]))
        .await
        .unwrap();

    env.engine.shutdown().await.unwrap();
    assert!(a.is_finished());
    assert!(b.is_finished());
    assert!(env.engine.registry().is_empty());
    assert!(!env.engine.queue().is_open(&jobflow::transport::AuthInfo::new(common::USER, common::COMPUTER)).await);
}

#[tokio::test]
async fn shutdown_reports_leftover_registrations() {
    let env = TestEnv::new(MockCluster::new());
    let _stuck = env
        .engine
        .registry()
        .enter(
            Pid(99),
            "sum",
            None,
            CallContext::new(),
            tokio_util::sync::CancellationToken::new(),
        )
        .unwrap();

    let err = env.engine.shutdown().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::NotDrained(1))
    ));
}
