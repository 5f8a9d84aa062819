use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use jobrelay_cluster::{ClusterGateway, KubeCredentials, KubeGateway};
use jobrelay_core::{EngineConfig, EventBus, RunController, TimeoutPolicy};
use jobrelay_observability::{
    emit_event, init_process_logging, default_logs_dir, ObservabilityEvent, ProcessKind,
};
use jobrelay_server::{serve, AppState};
use jobrelay_types::{RelayEvent, WireJobList};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "jobrelay-engine")]
#[command(about = "Runs a Kubernetes CronJob on demand and relays its output")]
struct Cli {
    #[command(flatten)]
    cluster: ClusterArgs,
    #[command(subcommand)]
    command: Command,
}

/// Flags shared by every subcommand. A flag wins over its environment
/// variable.
#[derive(Args, Debug, Default)]
struct ClusterArgs {
    #[arg(long, global = true, env = "NAMESPACE")]
    namespace: Option<String>,
    #[arg(long = "cronjob", global = true, env = "CRONJOB_NAME")]
    cronjob: Option<String>,
    #[arg(long, global = true, env = "JOBRELAY_LOGS_DIR")]
    logs_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the observer channel and the HTTP API.
    Serve {
        #[arg(long, alias = "hostname", env = "HOST")]
        host: Option<String>,
        #[arg(long, env = "PORT")]
        port: Option<u16>,
        #[arg(long, value_parser = parse_timeout_policy)]
        timeout_policy: Option<TimeoutPolicy>,
        #[arg(long)]
        adopt_existing: Option<bool>,
    },
    /// Start one run, print its output, and exit when it ends.
    Run,
    /// List runs created from the CronJob.
    Jobs {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print the output of a run's pod.
    Logs {
        id: String,
        #[arg(long)]
        tail: Option<i64>,
    },
}

fn parse_timeout_policy(raw: &str) -> Result<TimeoutPolicy, String> {
    TimeoutPolicy::parse(raw).ok_or_else(|| format!("expected `retain` or `delete`, got `{raw}`"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = EngineConfig::from_env()?;
    apply_cluster_args(&mut config, &cli.cluster);

    let process = match cli.command {
        Command::Serve { .. } => ProcessKind::Engine,
        _ => ProcessKind::Cli,
    };
    let logs_dir = config
        .logs_dir
        .clone()
        .unwrap_or_else(|| default_logs_dir(&state_root()));
    let (_log_guard, log_info) =
        init_process_logging(process, &logs_dir, config.log_retention_days)?;
    emit_event(
        tracing::Level::INFO,
        process,
        ObservabilityEvent {
            event: "logging.initialized",
            component: "engine.main",
            status: Some("ok"),
            detail: Some("jsonl logging initialized"),
            ..Default::default()
        },
    );
    info!("logging initialized: {:?}", log_info);

    match cli.command {
        Command::Serve {
            host,
            port,
            timeout_policy,
            adopt_existing,
        } => {
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(policy) = timeout_policy {
                config.timeout_policy = policy;
            }
            if let Some(adopt) = adopt_existing {
                config.adopt_existing = adopt;
            }
            let addr: SocketAddr = config
                .bind_addr()
                .parse()
                .context("invalid host or port")?;
            info!("config: {:?}", config);
            let controller = connect(config).await?;
            emit_startup_phase(&controller, "ready");
            info!("starting jobrelay-engine on http://{addr}");
            serve(addr, AppState::new(controller)).await?;
        }
        Command::Run => {
            let controller = connect(config).await?;
            follow_one_run(&controller).await?;
        }
        Command::Jobs { json } => {
            let controller = connect(config).await?;
            let list = controller.list_runs().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&list)?);
            } else {
                print!("{}", render_job_list(&list));
            }
        }
        Command::Logs { id, tail } => {
            let controller = connect(config).await?;
            let output = controller.get_output(&id, tail).await?;
            print!("{}", output.text);
        }
    }
    Ok(())
}

fn apply_cluster_args(config: &mut EngineConfig, args: &ClusterArgs) {
    if let Some(namespace) = &args.namespace {
        config.namespace = namespace.clone();
    }
    if let Some(cronjob) = &args.cronjob {
        config.template_name = cronjob.clone();
    }
    if let Some(dir) = &args.logs_dir {
        config.logs_dir = Some(dir.clone());
    }
}

fn state_root() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("jobrelay"))
        .unwrap_or_else(|| PathBuf::from(".jobrelay"))
}

/// Discovers cluster credentials and loads the CronJob template. Fails
/// before anything is served when either is unavailable.
async fn connect(config: EngineConfig) -> anyhow::Result<RunController> {
    let credentials = KubeCredentials::discover().context("no usable cluster credentials")?;
    info!("cluster api server: {}", credentials.server);
    let gateway = KubeGateway::new(credentials, config.namespace.clone())?;
    let template = gateway.load_template(&config.template_name).await.with_context(|| {
        format!(
            "failed to load cronjob {}/{}",
            config.namespace, config.template_name
        )
    })?;
    Ok(RunController::new(
        Arc::new(gateway),
        template,
        config,
        EventBus::new(),
    ))
}

fn emit_startup_phase(controller: &RunController, phase: &str) {
    let config = controller.config();
    emit_event(
        tracing::Level::INFO,
        ProcessKind::Engine,
        ObservabilityEvent {
            event: "engine.startup.phase",
            component: "engine.main",
            status: Some("running"),
            detail: Some(&format!(
                "phase={} namespace={} cronjob={}",
                phase, config.namespace, config.template_name
            )),
            ..Default::default()
        },
    );
}

/// Prints log lines and status changes until the run reaches a terminal
/// status. Ctrl-C asks the controller to stop the run and keeps printing.
async fn follow_one_run(controller: &RunController) -> anyhow::Result<()> {
    let mut rx = controller.bus().subscribe();
    let run_id = controller.request_start().await?;
    eprintln!("started {run_id}");
    let mut interrupted = false;
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(event) => {
                    print_event(&event);
                    if event.status_kind().is_some_and(|kind| kind.is_terminal()) {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    eprintln!("[relay] {skipped} events dropped");
                }
                Err(RecvError::Closed) => break,
            },
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal?;
                interrupted = true;
                controller.request_stop().await?;
            }
        }
    }
    controller.shutdown().await;
    Ok(())
}

fn print_event(event: &RelayEvent) {
    match event.status_kind() {
        Some(kind) => eprintln!("[{}] {}", kind.as_str(), event.message()),
        None => println!("{}", event.message()),
    }
}

fn render_job_list(list: &WireJobList) -> String {
    let mut out = format!(
        "cronjob {}/{}  active: {} ({}{})\n",
        list.namespace,
        list.cronjob_name,
        list.active_job.as_deref().unwrap_or("-"),
        list.active_job_status,
        if list.active_job_terminating {
            ", terminating"
        } else {
            ""
        },
    );
    for job in &list.jobs {
        out.push_str(&format!(
            "{:<40} {:<10} {:<26} {}\n",
            job.name,
            job.status,
            job.start_time.as_deref().unwrap_or("-"),
            job.completion_time.as_deref().unwrap_or("-"),
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use jobrelay_types::WireJob;

    #[test]
    fn cluster_flags_override_environment() {
        let mut config = EngineConfig::from_lookup(|key| match key {
            "NAMESPACE" => Some("from-env".to_string()),
            "CRONJOB_NAME" => Some("env-job".to_string()),
            _ => None,
        })
        .expect("config");
        let args = ClusterArgs {
            namespace: Some("from-flag".to_string()),
            cronjob: None,
            logs_dir: None,
        };
        apply_cluster_args(&mut config, &args);
        assert_eq!(config.namespace, "from-flag");
        assert_eq!(config.template_name, "env-job");
    }

    #[test]
    fn cli_parses_logs_with_tail() {
        let cli = Cli::try_parse_from(["jobrelay-engine", "logs", "nightly-1", "--tail", "50"])
            .expect("parse");
        match cli.command {
            Command::Logs { id, tail } => {
                assert_eq!(id, "nightly-1");
                assert_eq!(tail, Some(50));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cluster_flags_name_their_environment_variables() {
        let command = Cli::command();
        let env_of = |id: &str| {
            command
                .get_arguments()
                .find(|arg| arg.get_id() == id)
                .and_then(|arg| arg.get_env())
                .and_then(|env| env.to_str())
                .map(str::to_string)
        };
        assert_eq!(env_of("namespace").as_deref(), Some("NAMESPACE"));
        assert_eq!(env_of("cronjob").as_deref(), Some("CRONJOB_NAME"));
        assert_eq!(env_of("logs_dir").as_deref(), Some("JOBRELAY_LOGS_DIR"));
    }

    #[test]
    fn cli_rejects_unknown_timeout_policy() {
        let parsed = Cli::try_parse_from(["jobrelay-engine", "serve", "--timeout-policy", "keep"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn job_list_renders_one_row_per_run() {
        let list = WireJobList {
            namespace: "qa".to_string(),
            cronjob_name: "nightly".to_string(),
            active_job: Some("nightly-2".to_string()),
            active_job_status: "Running".to_string(),
            active_job_terminating: true,
            jobs: vec![
                WireJob {
                    name: "nightly-2".to_string(),
                    status: "Running".to_string(),
                    start_time: Some("2026-01-01T00:00:00+00:00".to_string()),
                    completion_time: None,
                    is_terminating: true,
                },
                WireJob {
                    name: "nightly-1".to_string(),
                    status: "Succeeded".to_string(),
                    start_time: None,
                    completion_time: None,
                    is_terminating: false,
                },
            ],
        };
        let rendered = render_job_list(&list);
        let lines: Vec<_> = rendered.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("qa/nightly"));
        assert!(lines[0].contains("nightly-2 (Running, terminating)"));
        assert!(lines[2].starts_with("nightly-1"));
    }
}
