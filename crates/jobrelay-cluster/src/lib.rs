use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;

use jobrelay_types::{ExecutionUnit, RunSnapshot, RunTemplate};

mod credentials;
mod error;
pub mod fake;
mod kube;
mod log_line;
mod status;

pub use credentials::{KubeAuth, KubeCredentials};
pub use error::ClusterError;
pub use kube::KubeGateway;
pub use log_line::{parse_log_line, LineBuffer, OutputLine};
pub use status::{job_snapshot, pod_unit};

pub type OutputStream = Pin<Box<dyn Stream<Item = Result<OutputLine, ClusterError>> + Send>>;

/// How dependents of a deleted run are removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePropagation {
    /// Wait for pods to go before the run object disappears.
    Foreground,
    Background,
}

impl DeletePropagation {
    pub fn as_str(self) -> &'static str {
        match self {
            DeletePropagation::Foreground => "Foreground",
            DeletePropagation::Background => "Background",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputOptions {
    pub follow: bool,
    pub timestamps: bool,
    pub tail_lines: Option<i64>,
    pub since_time: Option<DateTime<Utc>>,
}

impl OutputOptions {
    pub fn follow() -> Self {
        Self {
            follow: true,
            timestamps: true,
            ..Self::default()
        }
    }

    pub fn since(mut self, since_time: Option<DateTime<Utc>>) -> Self {
        self.since_time = since_time;
        self
    }
}

/// Thin interface to the orchestration platform. One gateway serves one
/// namespace.
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    fn namespace(&self) -> &str;

    /// Reads the scheduled-job definition runs are created from.
    async fn load_template(&self, name: &str) -> Result<RunTemplate, ClusterError>;

    /// Creates a run named `run_id` and returns the name the cluster assigned.
    async fn create_run(&self, template: &RunTemplate, run_id: &str)
        -> Result<String, ClusterError>;

    async fn get_run(&self, run_id: &str) -> Result<RunSnapshot, ClusterError>;

    async fn list_runs(&self, prefix: &str) -> Result<Vec<RunSnapshot>, ClusterError>;

    /// Deleting a run that is already gone succeeds.
    async fn delete_run(
        &self,
        run_id: &str,
        propagation: DeletePropagation,
    ) -> Result<(), ClusterError>;

    /// Units carrying the run's selector label, oldest first.
    async fn list_execution_units(&self, run_id: &str)
        -> Result<Vec<ExecutionUnit>, ClusterError>;

    async fn stream_output(
        &self,
        unit: &str,
        options: OutputOptions,
    ) -> Result<OutputStream, ClusterError>;

    async fn read_output(&self, unit: &str, tail_lines: Option<i64>)
        -> Result<String, ClusterError>;
}
