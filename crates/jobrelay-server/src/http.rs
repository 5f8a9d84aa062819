use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::header::{self, HeaderValue};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use uuid::Uuid;

use jobrelay_core::{lag_notice, AllowedOrigins, DeleteOutcome, RunError, StopOutcome};
use jobrelay_observability::{emit_event, ObservabilityEvent, ProcessKind};
use jobrelay_types::{ObserverCommand, RelayEvent, StatusKind, WireJobList, WireJobLogs};

use crate::AppState;

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorEnvelope>);

fn run_error_response(err: RunError) -> ApiError {
    let status = match &err {
        RunError::Conflict(_) => StatusCode::CONFLICT,
        RunError::NotFound(_) | RunError::InvalidRunName(_) => StatusCode::NOT_FOUND,
        RunError::ProvisioningTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        RunError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        RunError::AuthRejected(_) => StatusCode::BAD_GATEWAY,
    };
    (
        status,
        Json(ErrorEnvelope {
            error: err.to_string(),
            code: Some(err.code().to_string()),
        }),
    )
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let controller = state.controller.clone();
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "jobrelay listening");
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await;
    controller.shutdown().await;
    result?;
    Ok(())
}

fn cors_layer(origins: &AllowedOrigins) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT]);
    match origins {
        AllowedOrigins::Any => base.allow_origin(Any),
        AllowedOrigins::List(list) => {
            let values: Vec<HeaderValue> = list
                .iter()
                .filter_map(|origin| HeaderValue::from_str(origin).ok())
                .collect();
            base.allow_origin(AllowOrigin::list(values))
                .allow_credentials(true)
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config().allowed_origins);

    Router::new()
        .route("/global/health", get(global_health))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/{id}", delete(delete_job))
        .route("/api/jobs/{id}/logs", get(job_logs))
        .route("/api/commands", post(post_command))
        .route("/api/events", get(events))
        .route("/ws", get(observer_ws))
        .layer(cors)
        .layer(middleware::from_fn_with_state(state.clone(), auth_gate))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn auth_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS || request.uri().path() == "/global/health" {
        return next.run(request).await;
    }
    let Some(gate) = state.auth.as_ref() else {
        return next.run(request).await;
    };
    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if provided.is_some_and(|value| gate.accepts(value)) {
        return next.run(request).await;
    }

    let challenge = HeaderValue::from_str(&format!("Basic realm=\"{}\"", gate.realm()))
        .unwrap_or_else(|_| HeaderValue::from_static("Basic"));
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, challenge)],
        Json(ErrorEnvelope {
            error: "Unauthorized: missing or invalid credentials".to_string(),
            code: Some("AUTH_REQUIRED".to_string()),
        }),
    )
        .into_response()
}

async fn global_health(State(state): State<AppState>) -> impl IntoResponse {
    let view = state.controller.view().await;
    let config = state.config();
    Json(json!({
        "healthy": true,
        "version": env!("CARGO_PKG_VERSION"),
        "build_id": crate::build_id(),
        "namespace": config.namespace,
        "cronjobName": config.template_name,
        "slot": view.state.as_str(),
        "activeRun": view.run.map(|r| r.id),
        "observers": state.controller.bus().observer_count(),
        "uptimeMs": crate::now_ms().saturating_sub(state.started_at_ms),
    }))
}

async fn list_jobs(State(state): State<AppState>) -> Result<Json<WireJobList>, ApiError> {
    state
        .controller
        .list_runs()
        .await
        .map(Json)
        .map_err(|err| {
            tracing::warn!(error = %err, "listing runs failed");
            run_error_response(err)
        })
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct LogsQuery {
    tail_lines: Option<i64>,
    format: Option<String>,
}

/// Raw text unless the client asks for JSON.
fn wants_json(query: &LogsQuery, headers: &HeaderMap) -> bool {
    match query.format.as_deref() {
        Some("json") => return true,
        Some("raw") => return false,
        _ => {}
    }
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("application/json"))
}

async fn job_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
    headers: HeaderMap,
) -> Response {
    let json = wants_json(&query, &headers);
    match state.controller.get_output(&id, query.tail_lines).await {
        Ok(output) if json => Json(WireJobLogs::from(output)).into_response(),
        Ok(output) => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            output.text,
        )
            .into_response(),
        Err(err) => run_error_response(err).into_response(),
    }
}

async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.controller.delete_run(&id).await {
        Ok(DeleteOutcome::StoppingActive) => Ok(Json(json!({"deleted": true, "stopping": true}))),
        Ok(DeleteOutcome::Deleted) => Ok(Json(json!({"deleted": true}))),
        Err(err) => Err(run_error_response(err)),
    }
}

async fn post_command(
    State(state): State<AppState>,
    Json(command): Json<ObserverCommand>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    match command {
        ObserverCommand::StartRun => {
            let run_id = state
                .controller
                .request_start()
                .await
                .map_err(run_error_response)?;
            Ok((
                StatusCode::ACCEPTED,
                Json(json!({"runId": run_id, "status": StatusKind::Starting.as_str()})),
            ))
        }
        ObserverCommand::CancelRun => {
            let run_id = match state
                .controller
                .request_stop()
                .await
                .map_err(run_error_response)?
            {
                StopOutcome::Stopping(id) | StopOutcome::AlreadyStopping(id) => id,
            };
            Ok((
                StatusCode::ACCEPTED,
                Json(json!({"runId": run_id, "status": StatusKind::Stopping.as_str()})),
            ))
        }
    }
}

/// Runs an observer command. Returns a reply meant for the sender only when
/// the command was rejected.
async fn handle_observer_message(state: &AppState, raw: &str) -> Option<RelayEvent> {
    let command = match serde_json::from_str::<ObserverCommand>(raw) {
        Ok(command) => command,
        Err(err) => {
            return Some(RelayEvent::status(
                StatusKind::Error,
                format!("Unrecognized command: {err}"),
            ))
        }
    };
    match command {
        ObserverCommand::StartRun => match state.controller.request_start().await {
            Ok(_) => None,
            Err(err @ RunError::Conflict(_)) => {
                let current = state.controller.greeting().await;
                let status = current.status_kind().unwrap_or(StatusKind::Running);
                Some(RelayEvent::status(status, err.to_string()))
            }
            Err(err) => Some(RelayEvent::status(StatusKind::Error, err.to_string())),
        },
        ObserverCommand::CancelRun => match state.controller.request_stop().await {
            Ok(StopOutcome::Stopping(_)) => None,
            Ok(StopOutcome::AlreadyStopping(run_id)) => Some(RelayEvent::status(
                StatusKind::Stopping,
                format!("Run {run_id} is already stopping"),
            )),
            Err(RunError::NotFound(_)) => Some(RelayEvent::status(
                StatusKind::Stopped,
                "No active run to cancel",
            )),
            Err(err) => Some(RelayEvent::status(StatusKind::Error, err.to_string())),
        },
    }
}

fn encode_event(event: &RelayEvent) -> String {
    serde_json::to_string(event).unwrap_or_default()
}

async fn observer_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| observer_session(socket, state))
}

async fn observer_session(socket: WebSocket, state: AppState) {
    let observer_id = Uuid::new_v4().to_string();
    // Subscribe before building the greeting so no event falls in between.
    let mut rx = state.controller.bus().subscribe();
    let greeting = state.controller.greeting().await;
    let (mut sender, mut receiver) = socket.split();
    emit_event(
        Level::INFO,
        ProcessKind::Engine,
        ObservabilityEvent {
            event: "observer.connected",
            component: "ws",
            observer_id: Some(&observer_id),
            ..Default::default()
        },
    );

    if sender
        .send(WsMessage::Text(encode_event(&greeting).into()))
        .await
        .is_ok()
    {
        loop {
            tokio::select! {
                received = rx.recv() => {
                    let event = match received {
                        Ok(event) => event,
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(observer_id = %observer_id, skipped, "observer lagging; events dropped");
                            lag_notice(skipped)
                        }
                        Err(RecvError::Closed) => break,
                    };
                    if sender.send(WsMessage::Text(encode_event(&event).into())).await.is_err() {
                        break;
                    }
                }
                incoming = receiver.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Some(reply) = handle_observer_message(&state, text.as_str()).await {
                            if sender.send(WsMessage::Text(encode_event(&reply).into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    emit_event(
        Level::INFO,
        ProcessKind::Engine,
        ObservabilityEvent {
            event: "observer.disconnected",
            component: "ws",
            observer_id: Some(&observer_id),
            ..Default::default()
        },
    );
}

fn sse_event(event: &RelayEvent) -> Event {
    Event::default().event(event.name()).data(encode_event(event))
}

fn sse_stream(state: AppState) -> impl Stream<Item = Result<Event, Infallible>> {
    let rx = state.controller.bus().subscribe();
    let greeting = futures::stream::once(async move {
        Ok::<_, Infallible>(sse_event(&state.controller.greeting().await))
    });
    let live = BroadcastStream::new(rx).map(|received| {
        let event = match received {
            Ok(event) => event,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => lag_notice(skipped),
        };
        Ok::<_, Infallible>(sse_event(&event))
    });
    greeting.chain(live)
}

async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(sse_stream(state)).keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use base64::Engine as _;
    use chrono::Utc;
    use jobrelay_cluster::fake::{FakeCluster, UnitPolicy};
    use jobrelay_core::{EngineConfig, EventBus, RunController};
    use jobrelay_types::{RunPhase, RunSnapshot};
    use tokio::sync::broadcast;
    use tower::ServiceExt;

    fn test_config() -> EngineConfig {
        EngineConfig::default()
            .with_template_name("nightly")
            .with_namespace("qa")
            .with_start_timeout(Duration::from_secs(30))
            .with_start_poll_interval(Duration::from_millis(20))
    }

    fn test_state_with(fake: &FakeCluster, config: EngineConfig) -> AppState {
        let controller = RunController::new(
            Arc::new(fake.clone()),
            fake.template(),
            config,
            EventBus::new(),
        );
        AppState::new(controller)
    }

    fn test_state(fake: &FakeCluster) -> AppState {
        test_state_with(fake, test_config())
    }

    fn finished_run(name: &str) -> RunSnapshot {
        RunSnapshot {
            name: name.to_string(),
            phase: RunPhase::Succeeded,
            start_time: Some(Utc::now()),
            completion_time: Some(Utc::now()),
            terminating: false,
        }
    }

    async fn body_json(resp: Response) -> Value {
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&body).expect("json")
    }

    async fn next_status(
        rx: &mut broadcast::Receiver<RelayEvent>,
        expected: StatusKind,
    ) -> RelayEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.expect("event");
                if event.status_kind() == Some(expected) {
                    return event;
                }
            }
        })
        .await
        .expect("event timeout")
    }

    fn basic(user: &str, pass: &str) -> String {
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"))
        )
    }

    #[tokio::test]
    async fn list_route_returns_wire_shape() {
        let fake = FakeCluster::new("nightly", "qa");
        fake.insert_run(finished_run("nightly-1"));
        let app = app_router(test_state(&fake));
        let req = Request::builder()
            .uri("/api/jobs")
            .body(Body::empty())
            .expect("request");
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let payload = body_json(resp).await;
        assert_eq!(payload["namespace"], "qa");
        assert_eq!(payload["cronjobName"], "nightly");
        assert_eq!(payload["activeJob"], Value::Null);
        assert_eq!(payload["jobs"][0]["name"], "nightly-1");
        assert_eq!(payload["jobs"][0]["status"], "Succeeded");
        assert_eq!(payload["jobs"][0]["isTerminating"], false);
        assert!(payload["jobs"][0]["startTime"].is_string());
    }

    #[tokio::test]
    async fn basic_auth_guards_api_but_not_health() {
        let fake = FakeCluster::new("nightly", "qa");
        let state = test_state_with(&fake, test_config().with_basic_auth("ops", "pw"));
        let app = app_router(state);

        let health = Request::builder()
            .uri("/global/health")
            .body(Body::empty())
            .expect("request");
        let resp = app.clone().oneshot(health).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let payload = body_json(resp).await;
        assert_eq!(payload["healthy"], true);
        assert_eq!(payload["slot"], "idle");

        let anonymous = Request::builder()
            .uri("/api/jobs")
            .body(Body::empty())
            .expect("request");
        let resp = app.clone().oneshot(anonymous).await.expect("response");
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            resp.headers()
                .get(header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok()),
            Some("Basic realm=\"metadata-qa\"")
        );
        assert_eq!(body_json(resp).await["code"], "AUTH_REQUIRED");

        let authed = Request::builder()
            .uri("/api/jobs")
            .header(header::AUTHORIZATION, basic("ops", "pw"))
            .body(Body::empty())
            .expect("request");
        let resp = app.oneshot(authed).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn logs_route_defaults_to_raw_text_and_serves_json_on_request() {
        let fake = FakeCluster::new("nightly", "qa");
        fake.insert_run_with_unit(finished_run("nightly-1"), &["alpha", "beta", "gamma"]);
        let app = app_router(test_state(&fake));

        let req = Request::builder()
            .uri("/api/jobs/nightly-1/logs?tailLines=2")
            .header(header::ACCEPT, "application/json")
            .body(Body::empty())
            .expect("request");
        let resp = app.clone().oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let payload = body_json(resp).await;
        assert_eq!(payload["job"], "nightly-1");
        assert_eq!(payload["pod"], "nightly-1-pod");
        let logs = payload["logs"].as_str().expect("logs");
        assert!(!logs.contains("alpha"));
        assert!(logs.contains("beta") && logs.contains("gamma"));

        let req = Request::builder()
            .uri("/api/jobs/nightly-1/logs")
            .body(Body::empty())
            .expect("request");
        let resp = app.clone().oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/plain")));
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        let text = String::from_utf8(body.to_vec()).expect("utf8");
        assert_eq!(text.lines().count(), 3);

        let req = Request::builder()
            .uri("/api/jobs/nightly-1/logs?format=json")
            .body(Body::empty())
            .expect("request");
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(body_json(resp).await["pod"], "nightly-1-pod");
    }

    #[tokio::test]
    async fn logs_route_rejects_unmanaged_names() {
        let fake = FakeCluster::new("nightly", "qa");
        fake.set_unit_policy(UnitPolicy::Never);
        let app = app_router(test_state(&fake));
        let req = Request::builder()
            .uri("/api/jobs/kube-proxy/logs")
            .body(Body::empty())
            .expect("request");
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["code"], "RUN_NOT_FOUND");
        assert_eq!(fake.count_calls("list_units:"), 0);
    }

    #[tokio::test]
    async fn start_command_broadcasts_and_second_start_conflicts() {
        let fake = FakeCluster::new("nightly", "qa");
        fake.set_unit_policy(UnitPolicy::Never);
        let state = test_state(&fake);
        let mut rx = state.controller.bus().subscribe();
        let app = app_router(state.clone());

        let start = || {
            Request::builder()
                .method("POST")
                .uri("/api/commands")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"event":"start_run"}"#))
                .expect("request")
        };
        let resp = app.clone().oneshot(start()).await.expect("response");
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let payload = body_json(resp).await;
        let run_id = payload["runId"].as_str().expect("run id").to_string();
        let starting = next_status(&mut rx, StatusKind::Starting).await;
        assert!(starting.message().contains(&run_id));

        let resp = app.oneshot(start()).await.expect("response");
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(resp).await["code"], "RUN_CONFLICT");
        state.controller.shutdown().await;
    }

    #[tokio::test]
    async fn rejected_ws_commands_reply_to_sender_only() {
        let fake = FakeCluster::new("nightly", "qa");
        fake.set_unit_policy(UnitPolicy::Never);
        let state = test_state(&fake);
        let mut rx = state.controller.bus().subscribe();

        let cancel = handle_observer_message(&state, r#"{"event":"cancel_run"}"#)
            .await
            .expect("reply");
        assert_eq!(cancel.status_kind(), Some(StatusKind::Stopped));

        assert!(handle_observer_message(&state, r#"{"event":"start_job"}"#)
            .await
            .is_none());
        next_status(&mut rx, StatusKind::Starting).await;

        let conflict = handle_observer_message(&state, r#"{"event":"start_run"}"#)
            .await
            .expect("reply");
        assert_eq!(conflict.status_kind(), Some(StatusKind::Starting));
        assert!(conflict.message().contains("already active"));

        let garbage = handle_observer_message(&state, "not json")
            .await
            .expect("reply");
        assert_eq!(garbage.status_kind(), Some(StatusKind::Error));
        state.controller.shutdown().await;
    }

    #[tokio::test]
    async fn delete_route_handles_absent_and_unmanaged_runs() {
        let fake = FakeCluster::new("nightly", "qa");
        fake.insert_run(finished_run("nightly-1"));
        let app = app_router(test_state(&fake));

        let req = Request::builder()
            .method("DELETE")
            .uri("/api/jobs/nightly-1")
            .body(Body::empty())
            .expect("request");
        let resp = app.clone().oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["deleted"], true);
        assert!(fake.run("nightly-1").is_none());

        let req = Request::builder()
            .method("DELETE")
            .uri("/api/jobs/nightly-1")
            .body(Body::empty())
            .expect("request");
        let resp = app.clone().oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);

        let req = Request::builder()
            .method("DELETE")
            .uri("/api/jobs/coredns")
            .body(Body::empty())
            .expect("request");
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cors_preflight_echoes_allowed_origin() {
        let fake = FakeCluster::new("nightly", "qa");
        let config = test_config()
            .with_basic_auth("ops", "pw")
            .with_allowed_origins(AllowedOrigins::List(vec![
                "https://qa.example".to_string(),
            ]));
        let app = app_router(test_state_with(&fake, config));
        let req = Request::builder()
            .method("OPTIONS")
            .uri("/api/jobs")
            .header(header::ORIGIN, "https://qa.example")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
            .body(Body::empty())
            .expect("request");
        let resp = app.oneshot(req).await.expect("response");
        assert!(resp.status().is_success());
        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .and_then(|v| v.to_str().ok()),
            Some("https://qa.example")
        );
    }
}
