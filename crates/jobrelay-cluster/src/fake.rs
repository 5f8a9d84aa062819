//! Scriptable in-memory [`ClusterGateway`] used by the tests of the crates
//! built on top of the gateway.
//!
//! Output streams are snapshots: a stream opened on a running unit yields the
//! lines present at open time and then stays open without producing more,
//! so readers observe new lines only after reattaching.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::json;

use jobrelay_types::{ExecutionUnit, RunPhase, RunSnapshot, RunTemplate};

use crate::{
    ClusterError, ClusterGateway, DeletePropagation, OutputLine, OutputOptions, OutputStream,
};

/// When units appear for a freshly created run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitPolicy {
    Never,
    Immediately,
    /// After this many empty listings.
    AfterPolls(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    LoadTemplate,
    CreateRun,
    GetRun,
    ListRuns,
    DeleteRun,
    ListUnits,
    StreamOutput,
    ReadOutput,
}

struct FakeRun {
    snapshot: RunSnapshot,
    unit: Option<ExecutionUnit>,
    unit_polls: u32,
    output: Vec<OutputLine>,
    linger: Option<u32>,
}

struct FakeState {
    template: RunTemplate,
    runs: BTreeMap<String, FakeRun>,
    unit_policy: UnitPolicy,
    script: Vec<String>,
    finish_with: Option<RunPhase>,
    one_shot: VecDeque<(FakeOp, ClusterError)>,
    sticky: HashMap<FakeOp, ClusterError>,
    delete_linger: u32,
    create_delay: Option<Duration>,
    stalled_opens: u32,
    open_delay: Duration,
    calls: Vec<String>,
    epoch: DateTime<Utc>,
    seq: i64,
}

impl FakeState {
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        self.seq += 1;
        self.epoch + chrono::Duration::milliseconds(self.seq)
    }

    fn take_failure(&mut self, op: FakeOp) -> Option<ClusterError> {
        if let Some(pos) = self.one_shot.iter().position(|(o, _)| *o == op) {
            return self.one_shot.remove(pos).map(|(_, err)| err);
        }
        self.sticky.get(&op).cloned()
    }

    fn materialize_unit(&mut self, run_id: &str) {
        let script = self.script.clone();
        let finish = self.finish_with;
        let mut lines = Vec::with_capacity(script.len());
        for text in script {
            let ts = self.next_timestamp();
            lines.push(OutputLine::at(ts, text));
        }
        let now = self.next_timestamp();
        let Some(run) = self.runs.get_mut(run_id) else {
            return;
        };
        run.output = lines;
        let (run_phase, unit_phase) = match finish {
            Some(phase) => (phase, phase.as_str().to_string()),
            None => (RunPhase::Running, "Running".to_string()),
        };
        run.snapshot.phase = run_phase;
        if run_phase.is_terminal() {
            run.snapshot.completion_time = Some(now);
        }
        run.unit = Some(ExecutionUnit {
            name: format!("{run_id}-pod"),
            phase: unit_phase,
        });
    }

    fn run_by_unit(&self, unit: &str) -> Option<&FakeRun> {
        self.runs
            .values()
            .find(|r| r.unit.as_ref().map(|u| u.name.as_str()) == Some(unit))
    }
}

#[derive(Clone)]
pub struct FakeCluster {
    namespace: String,
    state: Arc<Mutex<FakeState>>,
}

impl FakeCluster {
    pub fn new(template_name: &str, namespace: &str) -> Self {
        let template = RunTemplate::new(
            template_name,
            namespace,
            json!({"template": {"spec": {"containers": [{"name": "main", "image": "busybox"}]}}}),
        );
        Self {
            namespace: namespace.to_string(),
            state: Arc::new(Mutex::new(FakeState {
                template,
                runs: BTreeMap::new(),
                unit_policy: UnitPolicy::Immediately,
                script: Vec::new(),
                finish_with: None,
                one_shot: VecDeque::new(),
                sticky: HashMap::new(),
                delete_linger: 0,
                create_delay: None,
                stalled_opens: 0,
                open_delay: Duration::ZERO,
                calls: Vec::new(),
                epoch: Utc::now(),
                seq: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn template(&self) -> RunTemplate {
        self.state().template.clone()
    }

    pub fn set_unit_policy(&self, policy: UnitPolicy) {
        self.state().unit_policy = policy;
    }

    /// Output the next materialized unit produces. With `finish` set, the run
    /// is already in that phase when its unit appears.
    pub fn script_output(&self, lines: &[&str], finish: Option<RunPhase>) {
        let mut state = self.state();
        state.script = lines.iter().map(|l| l.to_string()).collect();
        state.finish_with = finish;
    }

    pub fn push_output(&self, run_id: &str, text: &str) {
        let mut state = self.state();
        let ts = state.next_timestamp();
        if let Some(run) = state.runs.get_mut(run_id) {
            run.output.push(OutputLine::at(ts, text));
        }
    }

    pub fn finish_run(&self, run_id: &str, phase: RunPhase) {
        let mut state = self.state();
        let now = state.next_timestamp();
        if let Some(run) = state.runs.get_mut(run_id) {
            run.snapshot.phase = phase;
            run.snapshot.completion_time = Some(now);
            if let Some(unit) = run.unit.as_mut() {
                unit.phase = phase.as_str().to_string();
            }
        }
    }

    /// Changes the run's phase without completing it.
    pub fn set_run_phase(&self, run_id: &str, phase: RunPhase) {
        if let Some(run) = self.state().runs.get_mut(run_id) {
            run.snapshot.phase = phase;
        }
    }

    /// Removes a run as if something outside this process deleted it.
    pub fn vanish_run(&self, run_id: &str) {
        self.state().runs.remove(run_id);
    }

    pub fn insert_run(&self, snapshot: RunSnapshot) {
        self.state().runs.insert(
            snapshot.name.clone(),
            FakeRun {
                snapshot,
                unit: None,
                unit_polls: 0,
                output: Vec::new(),
                linger: None,
            },
        );
    }

    pub fn insert_run_with_unit(&self, snapshot: RunSnapshot, lines: &[&str]) {
        let run_id = snapshot.name.clone();
        self.insert_run(snapshot);
        let mut state = self.state();
        let mut output = Vec::with_capacity(lines.len());
        for text in lines {
            let ts = state.next_timestamp();
            output.push(OutputLine::at(ts, *text));
        }
        if let Some(run) = state.runs.get_mut(&run_id) {
            let phase = run.snapshot.phase;
            run.unit = Some(ExecutionUnit {
                name: format!("{run_id}-pod"),
                phase: phase.as_str().to_string(),
            });
            run.output = output;
        }
    }

    pub fn fail_once(&self, op: FakeOp, err: ClusterError) {
        self.state().one_shot.push_back((op, err));
    }

    pub fn fail_always(&self, op: FakeOp, err: ClusterError) {
        self.state().sticky.insert(op, err);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.one_shot.clear();
        state.sticky.clear();
    }

    /// Deleted runs stay visible as terminating for this many `get_run` calls.
    pub fn set_delete_linger(&self, polls: u32) {
        self.state().delete_linger = polls;
    }

    pub fn set_create_delay(&self, delay: Duration) {
        self.state().create_delay = Some(delay);
    }

    /// The next `times` output stream opens hang for `delay` before
    /// answering.
    pub fn stall_stream_opens(&self, times: u32, delay: Duration) {
        let mut state = self.state();
        state.stalled_opens = times;
        state.open_delay = delay;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn run_names(&self) -> Vec<String> {
        self.state().runs.keys().cloned().collect()
    }

    pub fn run(&self, run_id: &str) -> Option<RunSnapshot> {
        self.state().runs.get(run_id).map(|r| r.snapshot.clone())
    }

    fn record(&self, op: FakeOp, call: String) -> Result<(), ClusterError> {
        let mut state = self.state();
        state.calls.push(call);
        match state.take_failure(op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ClusterGateway for FakeCluster {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn load_template(&self, name: &str) -> Result<RunTemplate, ClusterError> {
        self.record(FakeOp::LoadTemplate, format!("load_template:{name}"))?;
        let template = self.template();
        if template.name != name {
            return Err(ClusterError::NotFound(format!("cronjob {name}")));
        }
        Ok(template)
    }

    async fn create_run(
        &self,
        _template: &RunTemplate,
        run_id: &str,
    ) -> Result<String, ClusterError> {
        let delay = self.state().create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.record(FakeOp::CreateRun, format!("create_run:{run_id}"))?;
        let mut state = self.state();
        if state.runs.contains_key(run_id) {
            return Err(ClusterError::AlreadyExists(format!("job {run_id}")));
        }
        let started = state.next_timestamp();
        state.runs.insert(
            run_id.to_string(),
            FakeRun {
                snapshot: RunSnapshot {
                    name: run_id.to_string(),
                    phase: RunPhase::Pending,
                    start_time: Some(started),
                    completion_time: None,
                    terminating: false,
                },
                unit: None,
                unit_polls: 0,
                output: Vec::new(),
                linger: None,
            },
        );
        Ok(run_id.to_string())
    }

    async fn get_run(&self, run_id: &str) -> Result<RunSnapshot, ClusterError> {
        self.record(FakeOp::GetRun, format!("get_run:{run_id}"))?;
        let mut state = self.state();
        let Some(run) = state.runs.get_mut(run_id) else {
            return Err(ClusterError::NotFound(format!("job {run_id}")));
        };
        match run.linger {
            Some(0) => {
                state.runs.remove(run_id);
                Err(ClusterError::NotFound(format!("job {run_id}")))
            }
            Some(left) => {
                run.linger = Some(left - 1);
                Ok(run.snapshot.clone())
            }
            None => Ok(run.snapshot.clone()),
        }
    }

    async fn list_runs(&self, prefix: &str) -> Result<Vec<RunSnapshot>, ClusterError> {
        self.record(FakeOp::ListRuns, format!("list_runs:{prefix}"))?;
        Ok(self
            .state()
            .runs
            .values()
            .filter(|r| r.snapshot.name.starts_with(prefix))
            .map(|r| r.snapshot.clone())
            .collect())
    }

    async fn delete_run(
        &self,
        run_id: &str,
        propagation: DeletePropagation,
    ) -> Result<(), ClusterError> {
        self.record(
            FakeOp::DeleteRun,
            format!("delete_run:{run_id}:{}", propagation.as_str()),
        )?;
        let mut state = self.state();
        let linger = state.delete_linger;
        if linger == 0 {
            state.runs.remove(run_id);
            return Ok(());
        }
        if let Some(run) = state.runs.get_mut(run_id) {
            run.snapshot.terminating = true;
            if !run.snapshot.phase.is_terminal() {
                run.snapshot.phase = RunPhase::Terminating;
            }
            if run.linger.is_none() {
                run.linger = Some(linger);
            }
        }
        Ok(())
    }

    async fn list_execution_units(
        &self,
        run_id: &str,
    ) -> Result<Vec<ExecutionUnit>, ClusterError> {
        self.record(FakeOp::ListUnits, format!("list_units:{run_id}"))?;
        let mut state = self.state();
        let policy = state.unit_policy;
        let should_materialize = match state.runs.get_mut(run_id) {
            None => return Ok(Vec::new()),
            Some(run) if run.unit.is_some() => false,
            Some(run) => match policy {
                UnitPolicy::Never => false,
                UnitPolicy::Immediately => true,
                UnitPolicy::AfterPolls(n) => {
                    run.unit_polls += 1;
                    run.unit_polls > n
                }
            },
        };
        if should_materialize {
            state.materialize_unit(run_id);
        }
        Ok(state
            .runs
            .get(run_id)
            .and_then(|r| r.unit.clone())
            .into_iter()
            .collect())
    }

    async fn stream_output(
        &self,
        unit: &str,
        options: OutputOptions,
    ) -> Result<OutputStream, ClusterError> {
        self.record(FakeOp::StreamOutput, format!("stream_output:{unit}"))?;
        let stall = {
            let mut state = self.state();
            if state.stalled_opens > 0 {
                state.stalled_opens -= 1;
                Some(state.open_delay)
            } else {
                None
            }
        };
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        let state = self.state();
        let Some(run) = state.run_by_unit(unit) else {
            return Err(ClusterError::NotFound(format!("pod {unit}")));
        };
        let mut lines: Vec<OutputLine> = run
            .output
            .iter()
            .filter(|l| match (options.since_time, l.timestamp) {
                (Some(since), Some(ts)) => ts >= since,
                _ => true,
            })
            .cloned()
            .collect();
        if let Some(tail) = options.tail_lines {
            let keep = tail.max(0) as usize;
            if lines.len() > keep {
                lines.drain(..lines.len() - keep);
            }
        }
        if !options.timestamps {
            for line in &mut lines {
                line.timestamp = None;
            }
        }
        let finished = run.snapshot.phase.is_terminal()
            || run.unit.as_ref().is_some_and(ExecutionUnit::is_finished);
        let items = futures::stream::iter(lines.into_iter().map(Ok));
        if finished || !options.follow {
            Ok(Box::pin(items))
        } else {
            Ok(Box::pin(items.chain(futures::stream::pending())))
        }
    }

    async fn read_output(
        &self,
        unit: &str,
        tail_lines: Option<i64>,
    ) -> Result<String, ClusterError> {
        self.record(FakeOp::ReadOutput, format!("read_output:{unit}"))?;
        let state = self.state();
        let Some(run) = state.run_by_unit(unit) else {
            return Err(ClusterError::NotFound(format!("pod {unit}")));
        };
        let skip = match tail_lines {
            Some(tail) => run.output.len().saturating_sub(tail.max(0) as usize),
            None => 0,
        };
        let mut out = String::new();
        for line in run.output.iter().skip(skip) {
            if let Some(ts) = line.timestamp {
                out.push_str(&ts.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true));
                out.push(' ');
            }
            out.push_str(&line.text);
            out.push('\n');
        }
        Ok(out)
    }
}
