//! Shared fixtures: an instrumented in-process cluster and engine helpers.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;

use jobflow::Engine;
use jobflow::EngineError;
use jobflow::engine::EngineConfig;
use jobflow::engine::job::{CalcInfo, InputFile, JobOptions, JobScript, JobSpec, RetrievedFolder};
use jobflow::engine::spec::ProcessSpec;
use jobflow::engine::types::{Inputs, JobInfo, JobState, Outputs, Value, ValueKind};
use jobflow::records::RecordStore;
use jobflow::records::memory::MemoryRecordStore;
use jobflow::storage::CheckpointStore;
use jobflow::storage::memory_store::MemoryCheckpointStore;
use jobflow::transport::{
    AuthInfo, CommandOutput, Computer, Scheduler, Transport, TransportSession,
};

pub const COMPUTER: &str = "mock";
pub const USER: &str = "tester";

// ===== Mock cluster =====

#[derive(Default)]
struct ClusterState {
    log: Mutex<Vec<String>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    trajectory: Mutex<VecDeque<Option<JobState>>>,
    open_delay: Mutex<Duration>,
    op_delay: Mutex<Duration>,
    fail_open: AtomicBool,
    no_detailed_info: AtomicBool,
    opens: AtomicUsize,
    closes: AtomicUsize,
    submits: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// A fake remote machine with a batch scheduler.
///
/// Every session operation is counted as in flight while it runs, so
/// overlapping use of sessions shows up in `max_in_flight`. Scheduler
/// listings follow a scripted trajectory: each poll pops one entry, `None`
/// meaning the job is absent from the listing. Once the script is exhausted
/// the job is reported done.
#[derive(Clone, Default)]
pub struct MockCluster {
    state: Arc<ClusterState>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trajectory(states: Vec<Option<JobState>>) -> Self {
        let cluster = Self::new();
        cluster.set_trajectory(states);
        cluster
    }

    pub fn set_trajectory(&self, states: Vec<Option<JobState>>) {
        *self.state.trajectory.lock().unwrap() = states.into();
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.state.open_delay.lock().unwrap() = delay;
    }

    pub fn set_op_delay(&self, delay: Duration) {
        *self.state.op_delay.lock().unwrap() = delay;
    }

    pub fn fail_open(&self, fail: bool) {
        self.state.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn without_detailed_info(&self) {
        self.state.no_detailed_info.store(true, Ordering::SeqCst);
    }

    pub fn put_remote(&self, path: &str, contents: &str) {
        self.state
            .files
            .lock()
            .unwrap()
            .insert(path.to_string(), contents.as_bytes().to_vec());
    }

    pub fn remote_file(&self, path: &str) -> Option<String> {
        self.state
            .files
            .lock()
            .unwrap()
            .get(path)
            .map(|b| String::from_utf8_lossy(b).to_string())
    }

    pub fn log(&self) -> Vec<String> {
        self.state.log.lock().unwrap().clone()
    }

    /// The operation log with consecutive repeats collapsed.
    pub fn phases(&self) -> Vec<String> {
        let mut phases = self.log();
        phases.dedup();
        phases
    }

    pub fn count(&self, op: &str) -> usize {
        self.log().iter().filter(|o| *o == op).count()
    }

    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn submits(&self) -> usize {
        self.state.submits.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, op: &str) {
        self.state.log.lock().unwrap().push(op.to_string());
    }

    async fn busy(&self) {
        let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.state.op_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn idle(&self) {
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Emulate `cat <in> > <out>` for the job in `work_dir`.
    fn run_job(&self, script: &JobScript) {
        let Some((cmd, out)) = script.command_line.split_once(" > ") else {
            return;
        };
        let Some(input) = cmd.split_whitespace().last() else {
            return;
        };
        let mut files = self.state.files.lock().unwrap();
        let data = files
            .get(&format!("{}/{}", script.work_dir, input))
            .cloned()
            .unwrap_or_default();
        files.insert(format!("{}/{}", script.work_dir, out.trim()), data);
    }
}

pub struct MockSession {
    cluster: MockCluster,
}

#[async_trait]
impl TransportSession for MockSession {
    async fn exec_command(&mut self, _command: &str) -> Result<CommandOutput> {
        self.cluster.busy().await;
        self.cluster.idle();
        Ok(CommandOutput::default())
    }

    async fn put_file(&mut self, contents: &[u8], remote_path: &str) -> Result<()> {
        self.cluster.busy().await;
        self.cluster
            .state
            .files
            .lock()
            .unwrap()
            .insert(remote_path.to_string(), contents.to_vec());
        self.cluster.idle();
        Ok(())
    }

    async fn get_file(&mut self, remote_path: &str) -> Result<Vec<u8>> {
        self.cluster.busy().await;
        self.cluster.record("retrieve");
        let data = self.cluster.state.files.lock().unwrap().get(remote_path).cloned();
        self.cluster.idle();
        data.ok_or_else(|| anyhow!("no such remote file: {}", remote_path))
    }

    async fn close(&mut self) -> Result<()> {
        self.cluster.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Transport for MockCluster {
    async fn open(&self, _auth: &AuthInfo) -> Result<Box<dyn TransportSession>> {
        let delay = *self.state.open_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.state.fail_open.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            cluster: self.clone(),
        }))
    }
}

#[async_trait]
impl Scheduler for MockCluster {
    fn can_query_by_user(&self) -> bool {
        true
    }

    async fn submit(&self, _session: &mut dyn TransportSession, script: &JobScript) -> Result<String> {
        self.busy().await;
        self.record("submit");
        let n = self.state.submits.fetch_add(1, Ordering::SeqCst);
        self.run_job(script);
        self.idle();
        Ok(format!("{}", 1000 + n))
    }

    async fn get_jobs(
        &self,
        _session: &mut dyn TransportSession,
        job_ids: &[String],
        _user: Option<&str>,
    ) -> Result<HashMap<String, JobInfo>> {
        self.busy().await;
        self.record("poll");
        let next = self
            .state
            .trajectory
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Some(JobState::Done));
        self.idle();

        let mut jobs = HashMap::new();
        if let Some(state) = next {
            for id in job_ids {
                jobs.insert(id.clone(), JobInfo::new(id.clone(), state));
            }
        }
        Ok(jobs)
    }

    async fn get_detailed_job_info(
        &self,
        _session: &mut dyn TransportSession,
        job_id: &str,
    ) -> Result<String> {
        if self.state.no_detailed_info.load(Ordering::SeqCst) {
            bail!(EngineError::Unsupported("detailed job info"));
        }
        Ok(format!("accounting for job {}", job_id))
    }
}

// ===== Engine helpers =====

pub fn test_config(work_dir: &Path) -> EngineConfig {
    EngineConfig {
        poll_interval: Duration::from_millis(5),
        transport_idle: Duration::from_millis(20),
        work_dir: work_dir.to_path_buf(),
        default_user: USER.to_string(),
        archive_checkpoints: true,
    }
}

pub struct TestEnv {
    pub engine: Engine,
    pub cluster: MockCluster,
    pub records: Arc<MemoryRecordStore>,
    pub checkpoints: Arc<MemoryCheckpointStore>,
    pub dir: tempfile::TempDir,
}

impl TestEnv {
    pub fn new(cluster: MockCluster) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let records = Arc::new(MemoryRecordStore::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let engine = build_engine(
            test_config(dir.path()),
            &cluster,
            records.clone(),
            checkpoints.clone(),
        );
        Self {
            engine,
            cluster,
            records,
            checkpoints,
            dir,
        }
    }

    /// A fresh engine over the same stores and cluster, as after a restart.
    pub fn restart(&self) -> Engine {
        build_engine(
            test_config(self.dir.path()),
            &self.cluster,
            self.records.clone(),
            self.checkpoints.clone(),
        )
    }
}

/// Engine with the mock computer, the test user and the standard specs.
pub fn build_engine(
    config: EngineConfig,
    cluster: &MockCluster,
    records: Arc<dyn RecordStore>,
    checkpoints: Arc<dyn CheckpointStore>,
) -> Engine {
    let engine = Engine::new(config, records, checkpoints);
    engine.add_computer(Computer::new(
        COMPUTER,
        "mock.example.org",
        "/scratch/jobflow",
        Arc::new(cluster.clone()),
        Arc::new(cluster.clone()),
    ));
    engine.authorize(USER, COMPUTER).unwrap();
    engine.register_spec(echo_spec());
    engine.register_spec(sum_spec());
    engine.register_spec(product_spec());
    engine
}

pub fn inputs(pairs: Vec<(&str, Value)>) -> Inputs {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

pub fn dict(pairs: Vec<(&str, Value)>) -> Value {
    Value::Dict(
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect::<BTreeMap<_, _>>(),
    )
}

pub fn job_options() -> Value {
    dict(vec![
        ("computer", Value::Str(COMPUTER.to_string())),
        ("max_wallclock_seconds", Value::Int(600)),
        ("resources", dict(vec![("num_machines", Value::Int(1))])),
    ])
}

pub fn echo_inputs(x: i64) -> Inputs {
    inputs(vec![("x", Value::Int(x)), ("options", job_options())])
}

// ===== Specs =====

/// Job that uploads `x`, runs `cat input.txt > output.txt` and parses the
/// number back as `result`.
pub fn echo_spec() -> ProcessSpec {
    ProcessSpec::new("echo")
        .input("x", ValueKind::Int)
        .output("result", ValueKind::Int)
        .job(JobSpec::new(echo_prepare, echo_parse))
}

pub fn echo_prepare(inputs: &Inputs, _options: &JobOptions) -> Result<CalcInfo> {
    let x = inputs
        .get("x")
        .and_then(Value::as_int)
        .ok_or_else(|| anyhow!("x must be an int"))?;
    Ok(CalcInfo {
        command: vec!["cat".to_string(), "input.txt".to_string()],
        files: vec![InputFile {
            name: "input.txt".to_string(),
            contents: x.to_string(),
        }],
        retrieve_list: vec!["output.txt".to_string()],
        stdout_name: Some("output.txt".to_string()),
    })
}

pub fn echo_parse(folder: &RetrievedFolder) -> Result<Outputs> {
    let text = folder.read_to_string("output.txt")?;
    let value: i64 = text.trim().parse()?;
    let mut outputs = Outputs::new();
    outputs.insert("result".to_string(), Value::Int(value));
    Ok(outputs)
}

pub fn sum_spec() -> ProcessSpec {
    ProcessSpec::new("sum")
        .input("a", ValueKind::Numeric)
        .input("b", ValueKind::Numeric)
        .output("sum", ValueKind::Numeric)
        .step_fn(|cx| {
            let sum = cx
                .input("a")?
                .checked_add(cx.input("b")?)
                .ok_or_else(|| anyhow!("sum overflowed"))?;
            cx.out("sum", sum)?;
            Ok(())
        })
}

pub fn product_spec() -> ProcessSpec {
    ProcessSpec::new("product")
        .input("a", ValueKind::Numeric)
        .input("b", ValueKind::Numeric)
        .output("product", ValueKind::Numeric)
        .step_fn(|cx| {
            let product = cx
                .input("a")?
                .checked_mul(cx.input("b")?)
                .ok_or_else(|| anyhow!("product overflowed"))?;
            cx.out("product", product)?;
            Ok(())
        })
}

/// Poll `check` every few milliseconds until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    check().await
}
