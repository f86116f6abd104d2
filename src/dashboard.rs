//! Browser dashboard: read-only status, log tailing, and manual control.
use axum::{
    Json, Router,
    body::Body,
    extract::{Query, Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::json;
use std::{
    collections::HashMap,
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    net::SocketAddr,
    path::Path,
    sync::{Arc, Mutex},
    thread,
};
use tracing::{info, warn};

use crate::{
    config::TaskConfig,
    error::DashboardError,
    sampler::ResourceSampler,
    supervisor::RunnerMap,
};

/// Static page served at `/`.
const INDEX_HTML: &str = include_str!("../assets/index.html");

/// Default byte count for log tail requests.
const DEFAULT_LOG_LIMIT: u64 = 51_200;

/// Listener and authentication settings for the dashboard.
#[derive(Debug, Clone)]
pub struct DashboardSettings {
    /// TCP port to listen on (all interfaces).
    pub port: u16,
    /// Basic-auth username; auth is enabled only when both are set.
    pub username: Option<String>,
    /// Basic-auth password.
    pub password: Option<String>,
}

struct AppState {
    runners: RunnerMap,
    credentials: Option<(String, String)>,
    // Samples the supervisor process itself for the global totals.
    self_sampler: Mutex<ResourceSampler>,
}

/// Handle to the background dashboard server.
pub struct Dashboard {
    addr: SocketAddr,
}

impl Dashboard {
    /// Binds the listener and serves the dashboard from a dedicated thread.
    ///
    /// Binding happens synchronously so a port clash surfaces to the caller;
    /// the server itself runs on its own runtime and never blocks the
    /// supervisor.
    pub fn spawn(
        runners: RunnerMap,
        settings: DashboardSettings,
    ) -> Result<Dashboard, DashboardError> {
        let credentials = match (settings.username, settings.password) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        };

        let state = Arc::new(AppState {
            runners,
            credentials,
            self_sampler: Mutex::new(ResourceSampler::new()),
        });

        let app = Router::new()
            .route("/", get(index))
            .route("/api/status", get(api_status))
            .route("/api/logs", get(api_logs))
            .route("/api/control", post(api_control))
            .layer(middleware::from_fn_with_state(
                Arc::clone(&state),
                basic_auth,
            ))
            .with_state(state);

        let listener = std::net::TcpListener::bind(("0.0.0.0", settings.port))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    warn!("Failed to start dashboard runtime: {err}");
                    return;
                }
            };

            runtime.block_on(async move {
                let listener = match tokio::net::TcpListener::from_std(listener) {
                    Ok(listener) => listener,
                    Err(err) => {
                        warn!("Failed to adopt dashboard listener: {err}");
                        return;
                    }
                };
                if let Err(err) = axum::serve(listener, app).await {
                    warn!("Dashboard server error: {err}");
                }
            });
        });

        info!("Dashboard listening on http://{addr}");
        Ok(Dashboard { addr })
    }

    /// The bound listen address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Challenges every request with Basic auth when credentials are configured.
async fn basic_auth(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some((user, pass)) = &state.credentials else {
        return next.run(request).await;
    };

    if let Some(value) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        && let Some(encoded) = value.strip_prefix("Basic ")
        && let Ok(decoded) = BASE64.decode(encoded.trim())
        && let Ok(text) = String::from_utf8(decoded)
        && let Some((got_user, got_pass)) = text.split_once(':')
        && got_user == user
        && got_pass == pass
    {
        return next.run(request).await;
    }

    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"Bansuri Dashboard\"")],
        "Unauthorized",
    )
        .into_response()
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn api_status(State(state): State<Arc<AppState>>) -> Response {
    let mut runners: Vec<_> = state
        .runners
        .read()
        .unwrap()
        .iter()
        .map(|(name, runner)| (name.clone(), Arc::clone(runner)))
        .collect();
    runners.sort_by(|(a, _), (b, _)| a.cmp(b));

    let own = state
        .self_sampler
        .lock()
        .unwrap()
        .sample(Some(std::process::id()));
    let mut global_cpu = own.cpu_percent;
    let mut global_memory = own.memory_bytes;

    let mut tasks = Vec::with_capacity(runners.len());
    for (_, runner) in runners {
        let resources = runner.sample_resources();
        global_cpu += resources.cpu_percent;
        global_memory += resources.memory_bytes;

        let snapshot = runner.snapshot();
        tasks.push(json!({
            "name": snapshot.name,
            "status": snapshot.status,
            "last_run": snapshot.last_run,
            "next_run": snapshot.next_run,
            "attempts": snapshot.attempts,
            "failed_attempts": snapshot.failed_attempts,
            "command": snapshot.command,
            "resources": resources,
        }));
    }

    Json(json!({
        "tasks": tasks,
        "global": {"cpu": global_cpu, "memory": global_memory},
    }))
    .into_response()
}

async fn api_logs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(task_name) = params.get("task") else {
        return (StatusCode::BAD_REQUEST, "Missing task name").into_response();
    };
    let log_type = params.get("type").map(String::as_str).unwrap_or("stdout");
    // Malformed numbers fall back to the defaults rather than erroring.
    let offset = params
        .get("offset")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    let limit = params
        .get("limit")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(DEFAULT_LOG_LIMIT);

    let runner = state.runners.read().unwrap().get(task_name).cloned();
    let body = match runner {
        None => "Task not found".to_string(),
        Some(runner) => task_log_tail(runner.config(), log_type, offset, limit),
    };

    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct ControlRequest {
    task: Option<String>,
    action: Option<String>,
}

async fn api_control(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ControlRequest>,
) -> Response {
    let runner = request
        .task
        .as_ref()
        .and_then(|name| state.runners.read().unwrap().get(name).cloned());

    if let (Some(task), Some(action)) = (&request.task, &request.action) {
        info!("Dashboard action '{action}' requested for '{task}'");
    }

    let success = match (runner, request.action.as_deref()) {
        (Some(runner), Some("start")) => {
            runner.start();
            true
        }
        (Some(runner), Some("stop")) => {
            tokio::task::spawn_blocking(move || runner.stop())
                .await
                .is_ok()
        }
        (Some(runner), Some("restart")) => {
            // Detached so the HTTP response is not held up by the stop.
            thread::spawn(move || {
                runner.stop();
                runner.start();
            });
            true
        }
        _ => false,
    };

    let status = if success {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(json!({"success": success}))).into_response()
}

/// Resolves the configured log file for a task and reads its tail window.
/// Every miss is reported as a plain-text diagnostic, not an error status.
fn task_log_tail(config: &TaskConfig, log_type: &str, offset: u64, limit: u64) -> String {
    let path = match log_type {
        "stdout" => config.stdout_path(),
        "stderr" => config.stderr_path(),
        _ => None,
    };

    let Some(path) = path else {
        return format!("No {log_type} log file configured.");
    };
    if !path.exists() {
        return format!("Log file not found: {}", path.display());
    }

    match read_tail(&path, offset, limit) {
        Ok(text) => text,
        Err(err) => format!("Error reading log: {err}"),
    }
}

/// Reads the byte window `[size - offset - limit, size - offset)`, i.e.
/// `offset` bytes back from the end, plus `limit` bytes before that point.
/// Invalid UTF-8 sequences are replaced.
fn read_tail(path: &Path, offset: u64, limit: u64) -> io::Result<String> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();

    let end = size.saturating_sub(offset);
    if end == 0 {
        return Ok(String::new());
    }
    let start = end.saturating_sub(limit);

    file.seek(SeekFrom::Start(start))?;
    let mut buffer = vec![0u8; (end - start) as usize];
    file.read_exact(&mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
