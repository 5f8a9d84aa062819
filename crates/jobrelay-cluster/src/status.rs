use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use jobrelay_types::{ExecutionUnit, RunPhase, RunSnapshot};

use crate::ClusterError;

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    #[serde(default)]
    name: String,
    creation_timestamp: Option<DateTime<Utc>>,
    deletion_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct JobCondition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    active: Option<i64>,
    succeeded: Option<i64>,
    failed: Option<i64>,
    start_time: Option<DateTime<Utc>>,
    completion_time: Option<DateTime<Utc>>,
    #[serde(default)]
    conditions: Vec<JobCondition>,
}

#[derive(Debug, Deserialize)]
struct JobObject {
    #[serde(default)]
    metadata: ObjectMeta,
    status: Option<JobStatus>,
}

#[derive(Debug, Deserialize, Default)]
struct PodStatus {
    phase: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PodObject {
    #[serde(default)]
    metadata: ObjectMeta,
    status: Option<PodStatus>,
}

#[derive(Debug, Deserialize)]
struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

fn phase_of(status: Option<&JobStatus>, deleting: bool) -> RunPhase {
    let Some(status) = status else {
        return RunPhase::Unknown;
    };
    let condition = |kind: &str| {
        status
            .conditions
            .iter()
            .any(|c| c.kind == kind && c.status.eq_ignore_ascii_case("true"))
    };
    let phase = if condition("Failed") {
        RunPhase::Failed
    } else if condition("Complete") {
        RunPhase::Succeeded
    } else if status.active.unwrap_or(0) > 0 {
        RunPhase::Running
    } else if status.succeeded.unwrap_or(0) > 0 {
        RunPhase::Succeeded
    } else if status.failed.unwrap_or(0) > 0 {
        RunPhase::Failed
    } else {
        RunPhase::Pending
    };
    if deleting && !phase.is_terminal() {
        RunPhase::Terminating
    } else {
        phase
    }
}

fn snapshot_of(job: JobObject) -> RunSnapshot {
    let terminating = job.metadata.deletion_timestamp.is_some();
    let phase = phase_of(job.status.as_ref(), terminating);
    let (start_time, completion_time) = job
        .status
        .as_ref()
        .map(|s| (s.start_time, s.completion_time))
        .unwrap_or((None, None));
    RunSnapshot {
        name: job.metadata.name,
        phase,
        start_time,
        completion_time,
        terminating,
    }
}

/// Maps a Job object onto a [`RunSnapshot`].
pub fn job_snapshot(value: Value) -> Result<RunSnapshot, ClusterError> {
    let job: JobObject = serde_json::from_value(value)
        .map_err(|e| ClusterError::InvalidResponse(format!("job object: {e}")))?;
    Ok(snapshot_of(job))
}

pub(crate) fn job_list(value: Value) -> Result<Vec<RunSnapshot>, ClusterError> {
    let list: ObjectList<JobObject> = serde_json::from_value(value)
        .map_err(|e| ClusterError::InvalidResponse(format!("job list: {e}")))?;
    Ok(list.items.into_iter().map(snapshot_of).collect())
}

/// Maps a Pod object onto an [`ExecutionUnit`].
pub fn pod_unit(value: Value) -> Result<ExecutionUnit, ClusterError> {
    let pod: PodObject = serde_json::from_value(value)
        .map_err(|e| ClusterError::InvalidResponse(format!("pod object: {e}")))?;
    Ok(unit_of(pod))
}

fn unit_of(pod: PodObject) -> ExecutionUnit {
    ExecutionUnit {
        name: pod.metadata.name,
        phase: pod
            .status
            .and_then(|s| s.phase)
            .unwrap_or_else(|| "Unknown".to_string()),
    }
}

pub(crate) fn pod_list(value: Value) -> Result<Vec<ExecutionUnit>, ClusterError> {
    let list: ObjectList<PodObject> = serde_json::from_value(value)
        .map_err(|e| ClusterError::InvalidResponse(format!("pod list: {e}")))?;
    let mut pods = list.items;
    pods.sort_by(|a, b| {
        a.metadata
            .creation_timestamp
            .cmp(&b.metadata.creation_timestamp)
            .then_with(|| a.metadata.name.cmp(&b.metadata.name))
    });
    Ok(pods.into_iter().map(unit_of).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(status: Value) -> Value {
        json!({"metadata": {"name": "nightly-1"}, "status": status})
    }

    #[test]
    fn maps_status_counters() {
        let cases = [
            (json!({"active": 1}), RunPhase::Running),
            (json!({"succeeded": 1}), RunPhase::Succeeded),
            (json!({"failed": 2}), RunPhase::Failed),
            (json!({}), RunPhase::Pending),
            (json!({"active": 1, "failed": 1}), RunPhase::Running),
        ];
        for (status, expected) in cases {
            let snap = job_snapshot(job(status.clone())).expect("snapshot");
            assert_eq!(snap.phase, expected, "status {status}");
        }
    }

    #[test]
    fn missing_status_is_unknown() {
        let snap = job_snapshot(json!({"metadata": {"name": "nightly-1"}})).expect("snapshot");
        assert_eq!(snap.phase, RunPhase::Unknown);
    }

    #[test]
    fn failed_condition_wins_over_active_count() {
        let snap = job_snapshot(job(json!({
            "active": 1,
            "conditions": [{"type": "Failed", "status": "True"}]
        })))
        .expect("snapshot");
        assert_eq!(snap.phase, RunPhase::Failed);
    }

    #[test]
    fn deletion_timestamp_marks_incomplete_runs_terminating() {
        let snap = job_snapshot(json!({
            "metadata": {"name": "nightly-1", "deletionTimestamp": "2024-03-01T10:00:00Z"},
            "status": {"active": 1, "startTime": "2024-03-01T09:00:00Z"}
        }))
        .expect("snapshot");
        assert_eq!(snap.phase, RunPhase::Terminating);
        assert!(snap.terminating);
        assert!(snap.start_time.is_some());

        let done = job_snapshot(json!({
            "metadata": {"name": "nightly-2", "deletionTimestamp": "2024-03-01T10:00:00Z"},
            "status": {"succeeded": 1}
        }))
        .expect("snapshot");
        assert_eq!(done.phase, RunPhase::Succeeded);
        assert!(done.terminating);
    }

    #[test]
    fn pods_are_ordered_oldest_first() {
        let pods = pod_list(json!({"items": [
            {"metadata": {"name": "b", "creationTimestamp": "2024-03-01T10:00:05Z"}, "status": {"phase": "Running"}},
            {"metadata": {"name": "a", "creationTimestamp": "2024-03-01T10:00:01Z"}, "status": {"phase": "Failed"}},
            {"metadata": {"name": "c", "creationTimestamp": "2024-03-01T10:00:09Z"}}
        ]}))
        .expect("pods");
        let names: Vec<_> = pods.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(pods[2].phase, "Unknown");
    }
}
