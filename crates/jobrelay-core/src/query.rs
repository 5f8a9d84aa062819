use std::cmp::Reverse;
use std::sync::Arc;

use jobrelay_cluster::{ClusterGateway, DeletePropagation};
use jobrelay_types::{RunRecord, RunTemplate, WireJob, WireJobList, WireJobLogs};

use crate::naming::is_managed_name;
use crate::RunError;

/// Output of a run's first execution unit, read straight from the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutput {
    pub run_id: String,
    pub unit: String,
    pub unit_phase: String,
    pub text: String,
}

impl From<RunOutput> for WireJobLogs {
    fn from(output: RunOutput) -> Self {
        Self {
            job: output.run_id,
            pod: output.unit,
            status: output.unit_phase,
            logs: output.text,
        }
    }
}

/// Read path over the cluster. Holds no state of its own.
#[derive(Clone)]
pub struct QueryService {
    gateway: Arc<dyn ClusterGateway>,
    template: Arc<RunTemplate>,
}

impl QueryService {
    pub fn new(gateway: Arc<dyn ClusterGateway>, template: Arc<RunTemplate>) -> Self {
        Self { gateway, template }
    }

    /// Managed runs, newest first. `active` is the slot occupant, if any;
    /// without one the newest incomplete run in the cluster is reported.
    pub async fn list_runs(&self, active: Option<&RunRecord>) -> Result<WireJobList, RunError> {
        let mut runs: Vec<_> = self
            .gateway
            .list_runs(&self.template.run_prefix())
            .await?
            .into_iter()
            .filter(|run| is_managed_name(&self.template.name, &run.name))
            .collect();
        runs.sort_by_key(|run| Reverse((run.start_time, run.name.clone())));

        let (active_job, active_job_status, active_job_terminating) = match active {
            Some(record) => match runs.iter().find(|run| run.name == record.id) {
                Some(run) => (Some(run.name.clone()), run.phase.to_string(), run.terminating),
                None => (Some(record.id.clone()), record.phase.to_string(), false),
            },
            None => match runs.iter().find(|run| !run.is_complete()) {
                Some(run) => (Some(run.name.clone()), run.phase.to_string(), run.terminating),
                None => (None, "Idle".to_string(), false),
            },
        };

        Ok(WireJobList {
            namespace: self.gateway.namespace().to_string(),
            cronjob_name: self.template.name.clone(),
            active_job,
            active_job_status,
            active_job_terminating,
            jobs: runs.iter().map(WireJob::from).collect(),
        })
    }

    pub async fn get_output(
        &self,
        run_id: &str,
        tail_lines: Option<i64>,
    ) -> Result<RunOutput, RunError> {
        if !is_managed_name(&self.template.name, run_id) {
            return Err(RunError::InvalidRunName(run_id.to_string()));
        }
        let Some(unit) = self
            .gateway
            .list_execution_units(run_id)
            .await?
            .into_iter()
            .next()
        else {
            return Err(RunError::NotFound(format!("no pod found for run {run_id}")));
        };
        let text = self
            .gateway
            .read_output(&unit.name, tail_lines.filter(|n| *n >= 0))
            .await?;
        Ok(RunOutput {
            run_id: run_id.to_string(),
            unit: unit.name,
            unit_phase: unit.phase,
            text,
        })
    }

    /// Deletes a run that is not the slot occupant. Completed runs go with
    /// background propagation; deleting an absent run succeeds.
    pub async fn delete_run(&self, run_id: &str) -> Result<(), RunError> {
        if !is_managed_name(&self.template.name, run_id) {
            return Err(RunError::InvalidRunName(run_id.to_string()));
        }
        let propagation = match self.gateway.get_run(run_id).await {
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err.into()),
            Ok(run) if run.is_complete() => DeletePropagation::Background,
            Ok(_) => DeletePropagation::Foreground,
        };
        self.gateway.delete_run(run_id, propagation).await?;
        tracing::info!(run_id, propagation = propagation.as_str(), "run deleted");
        Ok(())
    }
}
