use serde::{Deserialize, Serialize};

use crate::RunPhase;

/// Status vocabulary carried by `status_update` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusKind {
    Starting,
    Pending,
    Running,
    Stopping,
    Succeeded,
    Failed,
    Stopped,
    Error,
}

impl StatusKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusKind::Starting => "Starting",
            StatusKind::Pending => "Pending",
            StatusKind::Running => "Running",
            StatusKind::Stopping => "Stopping",
            StatusKind::Succeeded => "Succeeded",
            StatusKind::Failed => "Failed",
            StatusKind::Stopped => "Stopped",
            StatusKind::Error => "Error",
        }
    }

    /// Statuses after which no further event is produced for the same run.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StatusKind::Succeeded | StatusKind::Failed | StatusKind::Stopped | StatusKind::Error
        )
    }
}

impl From<RunPhase> for StatusKind {
    fn from(phase: RunPhase) -> Self {
        match phase {
            RunPhase::Pending => StatusKind::Pending,
            RunPhase::Running => StatusKind::Running,
            RunPhase::Succeeded => StatusKind::Succeeded,
            RunPhase::Failed => StatusKind::Failed,
            RunPhase::Terminating => StatusKind::Stopping,
            RunPhase::Unknown => StatusKind::Pending,
        }
    }
}

/// Event fanned out to every connected observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum RelayEvent {
    StatusUpdate { message: String, status: StatusKind },
    LogUpdate { message: String },
}

impl RelayEvent {
    pub fn status(status: StatusKind, message: impl Into<String>) -> Self {
        RelayEvent::StatusUpdate {
            message: message.into(),
            status,
        }
    }

    pub fn log(message: impl Into<String>) -> Self {
        RelayEvent::LogUpdate {
            message: message.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RelayEvent::StatusUpdate { .. } => "status_update",
            RelayEvent::LogUpdate { .. } => "log_update",
        }
    }

    pub fn status_kind(&self) -> Option<StatusKind> {
        match self {
            RelayEvent::StatusUpdate { status, .. } => Some(*status),
            RelayEvent::LogUpdate { .. } => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            RelayEvent::StatusUpdate { message, .. } | RelayEvent::LogUpdate { message } => message,
        }
    }
}

/// Command sent by an observer. The `*_job` aliases match older UI builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ObserverCommand {
    #[serde(alias = "start_job")]
    StartRun,
    #[serde(alias = "cancel_job")]
    CancelRun,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_update_serializes_with_event_envelope() {
        let event = RelayEvent::status(StatusKind::Running, "Attached to pod nightly-1-abc");
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(
            value,
            json!({
                "event": "status_update",
                "data": {"message": "Attached to pod nightly-1-abc", "status": "Running"}
            })
        );
    }

    #[test]
    fn commands_accept_legacy_job_names() {
        let start: ObserverCommand =
            serde_json::from_value(json!({"event": "start_job"})).expect("start");
        let cancel: ObserverCommand =
            serde_json::from_value(json!({"event": "cancel_run"})).expect("cancel");
        assert_eq!(start, ObserverCommand::StartRun);
        assert_eq!(cancel, ObserverCommand::CancelRun);
    }

    #[test]
    fn unknown_phase_maps_to_a_non_terminal_status() {
        assert_eq!(StatusKind::from(RunPhase::Unknown), StatusKind::Pending);
        assert!(!StatusKind::from(RunPhase::Unknown).is_terminal());
        assert!(StatusKind::from(RunPhase::Failed).is_terminal());
        assert!(!StatusKind::Starting.is_terminal());
    }
}
