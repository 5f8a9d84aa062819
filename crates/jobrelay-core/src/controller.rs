use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use jobrelay_cluster::{ClusterError, ClusterGateway, DeletePropagation};
use jobrelay_observability::{emit_event, ObservabilityEvent, ProcessKind};
use jobrelay_types::{
    ExecutionUnit, RelayEvent, RunPhase, RunRecord, RunSnapshot, RunTemplate, SlotState,
    StatusKind, WireJobList,
};

use crate::naming::{is_managed_name, next_run_id};
use crate::query::{QueryService, RunOutput};
use crate::{provisioning, relay, EngineConfig, EventBus, RunError};

/// Read-only copy of the slot for status endpoints and greetings.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotView {
    pub state: SlotState,
    pub busy: bool,
    pub run: Option<RunRecord>,
    pub last_run: Option<RunRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Stopping(String),
    AlreadyStopping(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The run occupied the slot; it is being stopped.
    StoppingActive,
    Deleted,
}

#[derive(Default)]
struct Slot {
    state: SlotState,
    busy: bool,
    run: Option<RunRecord>,
    last_run: Option<RunRecord>,
    /// Bumped on every start and stop. Background work carries the value it
    /// was spawned with and is ignored once it no longer matches.
    generation: u64,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl Slot {
    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
            && !matches!(self.state, SlotState::Idle | SlotState::Stopping)
    }

    /// Ends the current run and returns the slot to `Idle`. The caller has
    /// already broadcast the terminal status.
    fn clear(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        // Usually the handle of the task calling us; dropping it detaches.
        self.task = None;
        if let Some(run) = self.run.take() {
            self.last_run = Some(run);
        }
        self.state = SlotState::Idle;
        self.busy = false;
    }
}

/// Owner of the single active-run slot. Every mutation of the slot, and every
/// broadcast about the run occupying it, happens while holding `slot`.
#[derive(Clone)]
pub struct RunController {
    slot: Arc<Mutex<Slot>>,
    bus: EventBus,
    gateway: Arc<dyn ClusterGateway>,
    template: Arc<RunTemplate>,
    config: Arc<EngineConfig>,
}

impl RunController {
    pub fn new(
        gateway: Arc<dyn ClusterGateway>,
        template: RunTemplate,
        config: EngineConfig,
        bus: EventBus,
    ) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::default())),
            bus,
            gateway,
            template: Arc::new(template),
            config: Arc::new(config),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn template(&self) -> &RunTemplate {
        &self.template
    }

    pub(crate) fn gateway(&self) -> &dyn ClusterGateway {
        self.gateway.as_ref()
    }

    pub fn query(&self) -> QueryService {
        QueryService::new(self.gateway.clone(), self.template.clone())
    }

    async fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().await
    }

    fn publish(&self, status: StatusKind, message: impl Into<String>) {
        self.bus.publish(RelayEvent::status(status, message));
    }

    pub async fn view(&self) -> SlotView {
        let slot = self.lock().await;
        SlotView {
            state: slot.state,
            busy: slot.busy,
            run: slot.run.clone(),
            last_run: slot.last_run.clone(),
        }
    }

    /// Status sent to a newly connected observer only.
    pub async fn greeting(&self) -> RelayEvent {
        let slot = self.lock().await;
        let run_id = slot.run.as_ref().map(|r| r.id.as_str()).unwrap_or_default();
        match slot.state {
            SlotState::Idle => {
                let message = match &slot.last_run {
                    Some(last) => format!("No active run. Last run {} ended: {}", last.id, last.phase),
                    None => "No active run".to_string(),
                };
                RelayEvent::status(StatusKind::Stopped, message)
            }
            SlotState::Starting => {
                RelayEvent::status(StatusKind::Starting, format!("Run {run_id} is starting"))
            }
            SlotState::Attached => {
                let unit = slot
                    .run
                    .as_ref()
                    .and_then(|r| r.execution_unit.as_deref())
                    .unwrap_or("?");
                RelayEvent::status(
                    StatusKind::Running,
                    format!("Run {run_id} is running on pod {unit}"),
                )
            }
            SlotState::Stopping => {
                RelayEvent::status(StatusKind::Stopping, format!("Run {run_id} is stopping"))
            }
        }
    }

    /// Claims the slot and starts provisioning in the background. Returns the
    /// id of the requested run.
    pub async fn request_start(&self) -> Result<String, RunError> {
        let mut slot = self.lock().await;
        if slot.state != SlotState::Idle || slot.busy {
            let occupant = slot
                .run
                .as_ref()
                .map(|r| r.id.clone())
                .unwrap_or_else(|| slot.state.to_string());
            return Err(RunError::Conflict(occupant));
        }
        let previous = slot.last_run.as_ref().map(|r| r.id.as_str());
        let run_id = next_run_id(&self.template.name, Utc::now().timestamp(), previous);

        slot.generation += 1;
        let generation = slot.generation;
        slot.state = SlotState::Starting;
        slot.busy = true;
        slot.run = Some(RunRecord::new(run_id.clone()));
        let cancel = CancellationToken::new();
        slot.cancel = Some(cancel.clone());

        self.publish(StatusKind::Starting, format!("Starting run {run_id}"));
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "run.start.requested",
                component: "controller",
                run_id: Some(&run_id),
                ..Default::default()
            },
        );

        slot.task = Some(tokio::spawn(provisioning::provision(
            self.clone(),
            generation,
            run_id.clone(),
            cancel,
        )));
        Ok(run_id)
    }

    /// Cancels whatever background work the run has, deletes it and waits
    /// for the cluster to confirm before the slot returns to `Idle`.
    pub async fn request_stop(&self) -> Result<StopOutcome, RunError> {
        let mut slot = self.lock().await;
        let run_id = slot.run.as_ref().map(|r| r.id.clone()).unwrap_or_default();
        match slot.state {
            SlotState::Idle => return Err(RunError::NotFound("no active run".to_string())),
            SlotState::Stopping => return Ok(StopOutcome::AlreadyStopping(run_id)),
            SlotState::Starting | SlotState::Attached => {}
        }
        if let Some(cancel) = slot.cancel.take() {
            cancel.cancel();
        }
        let previous = slot.task.take();
        slot.generation += 1;
        let generation = slot.generation;
        slot.state = SlotState::Stopping;
        slot.busy = true;

        self.publish(StatusKind::Stopping, format!("Stopping run {run_id}"));
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "run.stop.requested",
                component: "controller",
                run_id: Some(&run_id),
                ..Default::default()
            },
        );

        slot.task = Some(tokio::spawn(self.clone().finish_stop(
            generation,
            run_id.clone(),
            previous,
        )));
        Ok(StopOutcome::Stopping(run_id))
    }

    async fn finish_stop(self, generation: u64, run_id: String, previous: Option<JoinHandle<()>>) {
        // The cancelled task may be mid-create; once it returns the run name
        // is final and safe to delete.
        if let Some(handle) = previous {
            let _ = handle.await;
        }
        let deadline = Instant::now() + self.config.stop_timeout;
        let result = self.delete_and_wait(&run_id, deadline).await;

        let mut slot = self.lock().await;
        if slot.generation != generation {
            return;
        }
        match &result {
            Ok(()) => {
                self.publish(StatusKind::Stopped, format!("Run {run_id} stopped"));
            }
            Err(err) => {
                tracing::warn!(run_id = %run_id, error = %err, "stop did not complete cleanly");
                self.publish(
                    StatusKind::Error,
                    format!("Stopping run {run_id} did not complete: {err}"),
                );
            }
        }
        emit_event(
            if result.is_ok() { Level::INFO } else { Level::WARN },
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "run.stopped",
                component: "controller",
                run_id: Some(&run_id),
                error_code: result.as_ref().err().map(RunError::code),
                ..Default::default()
            },
        );
        // A stopped run is discarded rather than kept for inspection, but its
        // id still seeds the next one.
        if let Some(mut run) = slot.run.take() {
            run.phase = RunPhase::Terminating;
            slot.last_run = Some(run);
        }
        slot.task = None;
        slot.cancel = None;
        slot.state = SlotState::Idle;
        slot.busy = false;
    }

    async fn delete_and_wait(&self, run_id: &str, deadline: Instant) -> Result<(), RunError> {
        match self.gateway.get_run(run_id).await {
            Err(err) if err.is_not_found() => return Ok(()),
            Ok(snapshot) if snapshot.is_complete() => {
                self.gateway
                    .delete_run(run_id, DeletePropagation::Background)
                    .await?;
                return Ok(());
            }
            Err(ClusterError::AuthRejected { message, .. }) => {
                return Err(RunError::AuthRejected(message))
            }
            _ => {}
        }
        self.gateway
            .delete_run(run_id, DeletePropagation::Foreground)
            .await?;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(RunError::UpstreamUnavailable(format!(
                    "run {run_id} still present after {}s",
                    self.config.stop_timeout.as_secs()
                )));
            }
            sleep_until((now + self.config.stop_poll_interval).min(deadline)).await;
            match self.gateway.get_run(run_id).await {
                Err(err) if err.is_not_found() => return Ok(()),
                Ok(snapshot) if snapshot.is_complete() => return Ok(()),
                Ok(snapshot) if !snapshot.terminating => {
                    tracing::debug!(run_id, "run not terminating yet; deleting again");
                    self.gateway
                        .delete_run(run_id, DeletePropagation::Foreground)
                        .await?;
                }
                Ok(_) => {}
                Err(ClusterError::AuthRejected { message, .. }) => {
                    return Err(RunError::AuthRejected(message))
                }
                Err(err) => tracing::debug!(run_id, error = %err, "polling deleted run failed"),
            }
        }
    }

    /// Applies an authoritative phase observed for the current run. A
    /// terminal phase broadcasts once and clears the slot. Returns false when
    /// the caller's work is no longer wanted.
    pub async fn report_transition(&self, generation: u64, snapshot: &RunSnapshot) -> bool {
        let mut slot = self.lock().await;
        if !slot.is_current(generation) {
            return false;
        }
        let Some(run) = slot.run.as_mut() else {
            return false;
        };
        let changed = run.phase != snapshot.phase;
        run.apply_snapshot(snapshot);
        let run_id = run.id.clone();
        let status = StatusKind::from(snapshot.phase);
        if snapshot.phase.is_terminal() {
            self.publish(status, format!("Run {run_id} finished: {}", snapshot.phase));
            emit_event(
                Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "run.finished",
                    component: "controller",
                    run_id: Some(&run_id),
                    status: Some(snapshot.phase.as_str()),
                    ..Default::default()
                },
            );
            slot.clear();
            return false;
        }
        if snapshot.phase == RunPhase::Unknown {
            tracing::warn!(run_id, "run status is unreadable; keeping the last known phase");
        } else if changed {
            self.publish(status, format!("Run {run_id} is {}", snapshot.phase));
        }
        true
    }

    /// Broadcasts a terminal status for the current run and clears the slot.
    pub(crate) async fn fail(&self, generation: u64, status: StatusKind, message: String) -> bool {
        let mut slot = self.lock().await;
        if !slot.is_current(generation) {
            return false;
        }
        let run_id = slot.run.as_ref().map(|r| r.id.clone()).unwrap_or_default();
        if status == StatusKind::Error {
            if let Some(run) = slot.run.as_mut() {
                if !run.phase.is_terminal() {
                    run.phase = RunPhase::Unknown;
                }
            }
        }
        self.publish(status, message.clone());
        emit_event(
            Level::WARN,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "run.failed",
                component: "controller",
                run_id: Some(&run_id),
                status: Some(status.as_str()),
                detail: Some(&message),
                ..Default::default()
            },
        );
        slot.clear();
        true
    }

    /// Replaces the requested run with an incomplete one found in the
    /// cluster.
    pub(crate) async fn adopt(&self, generation: u64, snapshot: &RunSnapshot) -> bool {
        let mut slot = self.lock().await;
        if !slot.is_current(generation) || slot.state != SlotState::Starting {
            return false;
        }
        let mut record = RunRecord::new(snapshot.name.clone());
        record.apply_snapshot(snapshot);
        slot.run = Some(record);
        self.publish(
            StatusKind::from(snapshot.phase),
            format!("Run {} is already active; attaching to it", snapshot.name),
        );
        true
    }

    pub(crate) async fn announce(&self, generation: u64, status: StatusKind, message: String) -> bool {
        let slot = self.lock().await;
        if !slot.is_current(generation) {
            return false;
        }
        self.publish(status, message);
        true
    }

    pub(crate) async fn mark_created(&self, generation: u64, run_id: &str) -> bool {
        let mut slot = self.lock().await;
        if !slot.is_current(generation) {
            return false;
        }
        if let Some(run) = slot.run.as_mut() {
            run.id = run_id.to_string();
            run.start_time.get_or_insert_with(Utc::now);
        }
        self.publish(
            StatusKind::Pending,
            format!("Run {run_id} created; waiting for its pod"),
        );
        true
    }

    /// Moves the slot to `Attached` and spawns the output relay for `unit`.
    pub(crate) async fn attach(&self, generation: u64, unit: ExecutionUnit) -> bool {
        let mut slot = self.lock().await;
        if !slot.is_current(generation) || slot.state != SlotState::Starting {
            return false;
        }
        let Some(run) = slot.run.as_mut() else {
            return false;
        };
        run.execution_unit = Some(unit.name.clone());
        if !run.phase.is_terminal() {
            run.phase = RunPhase::Running;
        }
        let run_id = run.id.clone();
        slot.state = SlotState::Attached;
        slot.busy = false;
        self.publish(StatusKind::Running, format!("Attached to pod {}", unit.name));
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "run.attached",
                component: "controller",
                run_id: Some(&run_id),
                unit: Some(&unit.name),
                ..Default::default()
            },
        );

        let cancel = CancellationToken::new();
        slot.cancel = Some(cancel.clone());
        slot.task = Some(tokio::spawn(relay::relay_output(
            self.clone(),
            generation,
            run_id,
            unit.name,
            cancel,
        )));
        true
    }

    /// Forwards one output line if the relay is still the current one.
    pub async fn emit_output(&self, generation: u64, line: String) -> bool {
        let slot = self.lock().await;
        if slot.generation != generation || slot.state != SlotState::Attached {
            return false;
        }
        self.bus.publish(RelayEvent::log(line));
        true
    }

    pub async fn list_runs(&self) -> Result<WireJobList, RunError> {
        let active = self.lock().await.run.clone();
        self.query().list_runs(active.as_ref()).await
    }

    pub async fn get_output(
        &self,
        run_id: &str,
        tail_lines: Option<i64>,
    ) -> Result<RunOutput, RunError> {
        self.query().get_output(run_id, tail_lines).await
    }

    /// Deletes a managed run. The slot occupant goes through the stop path.
    pub async fn delete_run(&self, run_id: &str) -> Result<DeleteOutcome, RunError> {
        if !is_managed_name(&self.template.name, run_id) {
            return Err(RunError::InvalidRunName(run_id.to_string()));
        }
        let occupied = {
            let slot = self.lock().await;
            slot.state != SlotState::Idle && slot.run.as_ref().is_some_and(|r| r.id == run_id)
        };
        if occupied {
            self.request_stop().await?;
            return Ok(DeleteOutcome::StoppingActive);
        }
        self.query().delete_run(run_id).await?;
        Ok(DeleteOutcome::Deleted)
    }

    /// Cancels background work without touching the cluster. Used on
    /// process shutdown.
    pub async fn shutdown(&self) {
        let mut slot = self.lock().await;
        if let Some(cancel) = slot.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = slot.task.take() {
            task.abort();
        }
    }
}
