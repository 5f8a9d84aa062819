//! Follows the output of the attached execution unit and forwards each line
//! through the controller.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use jobrelay_cluster::{ClusterError, OutputLine, OutputOptions, OutputStream};
use jobrelay_observability::{emit_event, ObservabilityEvent, ProcessKind};
use jobrelay_types::{RunSnapshot, StatusKind};

use crate::{RunController, RunError};

/// Resume point across reattaches. The cluster's `sinceTime` has second
/// precision, so a reattach replays lines at or after the truncated cursor.
#[derive(Debug, Default)]
struct Cursor {
    last: Option<DateTime<Utc>>,
    seen_at_last: usize,
    replay_skip: usize,
}

impl Cursor {
    fn since(&self) -> Option<DateTime<Utc>> {
        self.last
    }

    fn rewind(&mut self) {
        self.replay_skip = self.seen_at_last;
    }

    /// False for lines already delivered before a reattach.
    fn admit(&mut self, line: &OutputLine) -> bool {
        let Some(ts) = line.timestamp else {
            return true;
        };
        match self.last {
            Some(last) if ts < last => false,
            Some(last) if ts == last => {
                if self.replay_skip > 0 {
                    self.replay_skip -= 1;
                    false
                } else {
                    self.seen_at_last += 1;
                    true
                }
            }
            _ => {
                self.last = Some(ts);
                self.seen_at_last = 1;
                self.replay_skip = 0;
                true
            }
        }
    }
}

enum StreamEnd {
    Cancelled,
    /// The controller no longer accepts output from this relay.
    Detached,
    Closed,
    Stalled,
    Failed(ClusterError),
}

enum RunCheck {
    Terminal(RunSnapshot),
    Active(RunSnapshot),
    Vanished,
    Unreachable(ClusterError),
}

pub(crate) async fn relay_output(
    ctrl: RunController,
    generation: u64,
    run_id: String,
    unit: String,
    cancel: CancellationToken,
) {
    let config = ctrl.config().clone();
    let read_timeout = config.stream_read_timeout;
    let mut cursor = Cursor::default();
    let mut failures: u32 = 0;
    let mut attaches: u64 = 0;

    loop {
        attaches += 1;
        cursor.rewind();
        let options = OutputOptions::follow().since(cursor.since());
        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            opened = timeout(read_timeout, ctrl.gateway().stream_output(&unit, options)) => opened,
        };
        let end = match opened {
            Ok(Ok(stream)) => {
                failures = 0;
                pump(&ctrl, generation, stream, &mut cursor, &cancel, read_timeout).await
            }
            Ok(Err(err)) => StreamEnd::Failed(err),
            Err(_) => StreamEnd::Failed(ClusterError::Timeout(read_timeout)),
        };
        match end {
            StreamEnd::Cancelled | StreamEnd::Detached => return,
            StreamEnd::Closed => tracing::debug!(run_id, unit, "output stream closed"),
            StreamEnd::Stalled => tracing::debug!(run_id, unit, "output stream idle"),
            StreamEnd::Failed(ClusterError::AuthRejected { message, .. }) => {
                ctrl.fail(
                    generation,
                    StatusKind::Error,
                    RunError::AuthRejected(message).to_string(),
                )
                .await;
                return;
            }
            StreamEnd::Failed(err) if err.is_unit_starting() => {
                tracing::debug!(run_id, unit, error = %err, "pod not ready for output yet");
            }
            StreamEnd::Failed(err) => {
                failures += 1;
                tracing::warn!(run_id, unit, failures, error = %err, "output stream failed");
            }
        }

        match check_run(&ctrl, &run_id, read_timeout).await {
            RunCheck::Terminal(snapshot) => {
                ctrl.report_transition(generation, &snapshot).await;
                return;
            }
            RunCheck::Vanished => {
                ctrl.fail(
                    generation,
                    StatusKind::Error,
                    format!("Run {run_id} no longer exists in the cluster"),
                )
                .await;
                return;
            }
            RunCheck::Active(snapshot) => {
                if !ctrl.report_transition(generation, &snapshot).await {
                    return;
                }
            }
            RunCheck::Unreachable(ClusterError::AuthRejected { message, .. }) => {
                ctrl.fail(
                    generation,
                    StatusKind::Error,
                    RunError::AuthRejected(message).to_string(),
                )
                .await;
                return;
            }
            RunCheck::Unreachable(err) => {
                failures += 1;
                tracing::warn!(run_id, failures, error = %err, "run status check failed");
            }
        }

        if failures >= config.stream_max_failures {
            ctrl.fail(
                generation,
                StatusKind::Error,
                format!(
                    "Lost the output stream of run {run_id} after {failures} failed attempts"
                ),
            )
            .await;
            return;
        }
        emit_event(
            Level::DEBUG,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "relay.reattach",
                component: "relay",
                run_id: Some(&run_id),
                unit: Some(&unit),
                detail: Some(&format!("attach={attaches} failures={failures}")),
                ..Default::default()
            },
        );
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(config.stream_retry_delay) => {}
        }
    }
}

async fn pump(
    ctrl: &RunController,
    generation: u64,
    mut stream: OutputStream,
    cursor: &mut Cursor,
    cancel: &CancellationToken,
    read_timeout: Duration,
) -> StreamEnd {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return StreamEnd::Cancelled,
            next = timeout(read_timeout, stream.next()) => next,
        };
        match next {
            Err(_) => return StreamEnd::Stalled,
            Ok(None) => return StreamEnd::Closed,
            Ok(Some(Err(err))) => return StreamEnd::Failed(err),
            Ok(Some(Ok(line))) => {
                if !cursor.admit(&line) {
                    continue;
                }
                if !ctrl.emit_output(generation, line.text).await {
                    return StreamEnd::Detached;
                }
            }
        }
    }
}

async fn check_run(ctrl: &RunController, run_id: &str, read_timeout: Duration) -> RunCheck {
    match timeout(read_timeout, ctrl.gateway().get_run(run_id)).await {
        Ok(Ok(snapshot)) if snapshot.is_complete() => RunCheck::Terminal(snapshot),
        Ok(Ok(snapshot)) => RunCheck::Active(snapshot),
        Ok(Err(err)) if err.is_not_found() => RunCheck::Vanished,
        Ok(Err(err)) => RunCheck::Unreachable(err),
        Err(_) => RunCheck::Unreachable(ClusterError::Timeout(read_timeout)),
    }
}
