//! Create (or adopt) a run, then wait for its first execution unit.

use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use jobrelay_cluster::{ClusterError, DeletePropagation};
use jobrelay_observability::{emit_event, ObservabilityEvent, ProcessKind};
use jobrelay_types::{RunSnapshot, StatusKind};

use crate::naming::is_managed_name;
use crate::{RunController, RunError, TimeoutPolicy};

pub(crate) async fn provision(
    ctrl: RunController,
    generation: u64,
    requested_id: String,
    cancel: CancellationToken,
) {
    let deadline = Instant::now() + ctrl.config().start_timeout;
    let run_id = match acquire_run(&ctrl, generation, requested_id, deadline, &cancel).await {
        Ok(Some(run_id)) => run_id,
        Ok(None) => return,
        Err(err) => {
            tracing::warn!(generation, error = %err, "provisioning failed");
            ctrl.fail(generation, StatusKind::Error, err.to_string()).await;
            return;
        }
    };
    wait_for_unit(&ctrl, generation, &run_id, deadline, &cancel).await;
}

enum Existing {
    None,
    Active(RunSnapshot),
    Terminating(RunSnapshot),
}

async fn find_existing(ctrl: &RunController) -> Result<Existing, RunError> {
    let template = ctrl.template();
    let mut incomplete: Vec<RunSnapshot> = ctrl
        .gateway()
        .list_runs(&template.run_prefix())
        .await?
        .into_iter()
        .filter(|run| is_managed_name(&template.name, &run.name) && !run.is_complete())
        .collect();
    incomplete.sort_by(|a, b| b.start_time.cmp(&a.start_time));
    if let Some(pos) = incomplete.iter().position(|run| !run.terminating) {
        return Ok(Existing::Active(incomplete.swap_remove(pos)));
    }
    Ok(incomplete
        .into_iter()
        .next()
        .map(Existing::Terminating)
        .unwrap_or(Existing::None))
}

/// Resolves the run the slot will follow. `Ok(None)` when cancelled or
/// superseded.
async fn acquire_run(
    ctrl: &RunController,
    generation: u64,
    requested_id: String,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<Option<String>, RunError> {
    if ctrl.config().adopt_existing {
        match find_existing(ctrl).await? {
            Existing::Active(snapshot) => {
                let adopted = ctrl.adopt(generation, &snapshot).await;
                return Ok(adopted.then_some(snapshot.name));
            }
            Existing::Terminating(snapshot) => {
                let announced = ctrl
                    .announce(
                        generation,
                        StatusKind::Stopping,
                        format!(
                            "Run {} is still terminating; waiting for it to go away",
                            snapshot.name
                        ),
                    )
                    .await;
                if !announced || !wait_until_gone(ctrl, &snapshot.name, deadline, cancel).await? {
                    return Ok(None);
                }
            }
            Existing::None => {}
        }
    }
    if cancel.is_cancelled() {
        return Ok(None);
    }

    // Not raced against `cancel`: an abandoned create could still land after
    // the stop's delete.
    let created = ctrl
        .gateway()
        .create_run(ctrl.template(), &requested_id)
        .await?;
    if cancel.is_cancelled() || !ctrl.mark_created(generation, &created).await {
        return Ok(None);
    }
    emit_event(
        Level::INFO,
        ProcessKind::Engine,
        ObservabilityEvent {
            event: "run.created",
            component: "provisioning",
            run_id: Some(&created),
            ..Default::default()
        },
    );
    Ok(Some(created))
}

/// `Ok(false)` when cancelled.
async fn wait_until_gone(
    ctrl: &RunController,
    run_id: &str,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<bool, RunError> {
    loop {
        match ctrl.gateway().get_run(run_id).await {
            Err(err) if err.is_not_found() => return Ok(true),
            Ok(snapshot) if snapshot.is_complete() => return Ok(true),
            Ok(_) => {}
            Err(err) if err.is_transient() => {
                tracing::debug!(run_id, error = %err, "terminating run poll failed");
            }
            Err(err) => return Err(err.into()),
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(RunError::UpstreamUnavailable(format!(
                "run {run_id} did not finish terminating in time"
            )));
        }
        tokio::select! {
            _ = cancel.cancelled() => return Ok(false),
            _ = sleep_until((now + ctrl.config().start_poll_interval).min(deadline)) => {}
        }
    }
}

async fn wait_for_unit(
    ctrl: &RunController,
    generation: u64,
    run_id: &str,
    deadline: Instant,
    cancel: &CancellationToken,
) {
    let config = ctrl.config();
    let mut last_error: Option<ClusterError> = None;
    loop {
        let listed = tokio::select! {
            _ = cancel.cancelled() => return,
            listed = timeout_at(deadline, ctrl.gateway().list_execution_units(run_id)) => listed,
        };
        match listed {
            Ok(Ok(units)) => {
                if let Some(unit) = units.into_iter().next() {
                    ctrl.attach(generation, unit).await;
                    return;
                }
                last_error = None;
            }
            Ok(Err(err)) if err.is_transient() => {
                tracing::debug!(run_id, error = %err, "listing pods failed; retrying");
                last_error = Some(err);
            }
            Ok(Err(err)) => {
                ctrl.fail(generation, StatusKind::Error, RunError::from(err).to_string())
                    .await;
                return;
            }
            Err(_) => {}
        }

        let now = Instant::now();
        if now >= deadline {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep_until((now + config.start_poll_interval).min(deadline)) => {}
        }
    }

    // Deadline reached while the cluster was failing.
    if let Some(err) = last_error {
        let reason = RunError::UpstreamUnavailable(err.to_string());
        ctrl.fail(generation, StatusKind::Error, format!("{reason} (run {run_id})"))
            .await;
        return;
    }
    let reason = RunError::ProvisioningTimeout {
        run_id: run_id.to_string(),
        timeout: config.start_timeout,
    };
    let message = match config.timeout_policy {
        TimeoutPolicy::Retain => format!("{reason}; the run was left in place for inspection"),
        TimeoutPolicy::Delete => {
            match ctrl
                .gateway()
                .delete_run(run_id, DeletePropagation::Background)
                .await
            {
                Ok(()) => format!("{reason}; the run was deleted"),
                Err(err) => format!("{reason}; deleting it failed: {err}"),
            }
        }
    };
    ctrl.fail(generation, StatusKind::Failed, message).await;
}
