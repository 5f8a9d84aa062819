use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Phase of a run as reported by the cluster.
///
/// `Unknown` is kept distinct so an ambiguous external status never
/// masquerades as one of the concrete phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Terminating,
    Unknown,
}

impl RunPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            RunPhase::Pending => "Pending",
            RunPhase::Running => "Running",
            RunPhase::Succeeded => "Succeeded",
            RunPhase::Failed => "Failed",
            RunPhase::Terminating => "Terminating",
            RunPhase::Unknown => "Unknown",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Succeeded | RunPhase::Failed)
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of the single active-run slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    #[default]
    Idle,
    Starting,
    Attached,
    Stopping,
}

impl SlotState {
    pub fn as_str(self) -> &'static str {
        match self {
            SlotState::Idle => "idle",
            SlotState::Starting => "starting",
            SlotState::Attached => "attached",
            SlotState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-memory record of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: String,
    pub phase: RunPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_unit: Option<String>,
}

impl RunRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            phase: RunPhase::Pending,
            start_time: None,
            completion_time: None,
            execution_unit: None,
        }
    }

    pub fn apply_snapshot(&mut self, snapshot: &RunSnapshot) {
        self.phase = snapshot.phase;
        if snapshot.start_time.is_some() {
            self.start_time = snapshot.start_time;
        }
        if snapshot.completion_time.is_some() {
            self.completion_time = snapshot.completion_time;
        }
    }
}

/// Point-in-time view of a run as listed by the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub name: String,
    pub phase: RunPhase,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub terminating: bool,
}

impl RunSnapshot {
    /// Completed runs are terminal regardless of a pending deletion.
    pub fn is_complete(&self) -> bool {
        self.phase.is_terminal()
    }
}

/// The runtime unit (pod) that executes a run's workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionUnit {
    pub name: String,
    pub phase: String,
}

impl ExecutionUnit {
    pub fn is_finished(&self) -> bool {
        matches!(self.phase.as_str(), "Succeeded" | "Failed")
    }
}
