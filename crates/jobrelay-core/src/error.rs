use std::time::Duration;

use jobrelay_cluster::ClusterError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RunError {
    #[error("a run is already active ({0})")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error("no execution unit appeared for run {run_id} within {}s", .timeout.as_secs())]
    ProvisioningTimeout { run_id: String, timeout: Duration },
    #[error("cluster unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("cluster rejected the request: {0}")]
    AuthRejected(String),
    #[error("`{0}` is not a run managed by this service")]
    InvalidRunName(String),
}

impl RunError {
    pub fn code(&self) -> &'static str {
        match self {
            RunError::Conflict(_) => "RUN_CONFLICT",
            RunError::NotFound(_) => "RUN_NOT_FOUND",
            RunError::ProvisioningTimeout { .. } => "PROVISIONING_TIMEOUT",
            RunError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            RunError::AuthRejected(_) => "AUTH_REJECTED",
            RunError::InvalidRunName(_) => "RUN_NOT_FOUND",
        }
    }
}

impl From<ClusterError> for RunError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::NotFound(what) => RunError::NotFound(format!("{what} not found")),
            ClusterError::AuthRejected { message, .. } => RunError::AuthRejected(message),
            other => RunError::UpstreamUnavailable(other.to_string()),
        }
    }
}
