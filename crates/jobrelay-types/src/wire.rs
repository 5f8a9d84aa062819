use serde::{Deserialize, Serialize};

use crate::RunSnapshot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireJob {
    pub name: String,
    pub status: String,
    pub start_time: Option<String>,
    pub completion_time: Option<String>,
    pub is_terminating: bool,
}

impl From<&RunSnapshot> for WireJob {
    fn from(run: &RunSnapshot) -> Self {
        Self {
            name: run.name.clone(),
            status: run.phase.as_str().to_string(),
            start_time: run.start_time.map(|t| t.to_rfc3339()),
            completion_time: run.completion_time.map(|t| t.to_rfc3339()),
            is_terminating: run.terminating,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireJobList {
    pub namespace: String,
    pub cronjob_name: String,
    pub active_job: Option<String>,
    pub active_job_status: String,
    pub active_job_terminating: bool,
    pub jobs: Vec<WireJob>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireJobLogs {
    pub job: String,
    pub pod: String,
    pub status: String,
    pub logs: String,
}
