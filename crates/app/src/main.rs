use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use app::client::SandboxClient;
use app::launcher::build_launcher;
use app::supervisor::{SupervisorConfig, SupervisorHandle, spawn_supervisor};
use app::{SandboxLaunchConfig, SandboxRuntime, SandboxWorkerConfig};
use axum::Json;
use axum::Router;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bridge::logger::{LogConfig, init_logging};
use bridge::{BridgeConfig, BridgeError, CallbackHandlers, InitOptions, LifecycleState, PdpBridge};
use serde::Serialize;
use serde_json::{Value, json};
use tower::ServiceBuilder;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::compression::CompressionLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Clone)]
struct AppConfig {
    host: String,
    port: u16,
    wasm_path: Option<PathBuf>,
    engine_options_path: Option<PathBuf>,
    runtime: SandboxRuntime,
    static_effect: String,
    max_inflight: usize,
    max_restarts: usize,
    log_filter: String,
    bridge: BridgeConfig,
}

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_MAX_INFLIGHT: usize = 128;
const DEFAULT_MAX_RESTARTS: usize = 5;
const MAX_BODY_LIMIT_BYTES: usize = 2 * 1024 * 1024;
const INIT_RETRY_DELAY: Duration = Duration::from_secs(1);

impl AppConfig {
    fn from_env() -> anyhow::Result<Self> {
        let bridge = BridgeConfig::from_env()?;
        let runtime = match env::var("PDP_SANDBOX_RUNTIME") {
            Ok(value) => value.parse().map_err(anyhow::Error::msg)?,
            Err(_) => SandboxRuntime::Local,
        };
        Ok(Self {
            host: env::var("PDP_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_owned()),
            port: parse_env("PDP_PORT", DEFAULT_PORT)?,
            wasm_path: env::var_os("PDP_WASM_PATH").map(PathBuf::from),
            engine_options_path: env::var_os("PDP_ENGINE_OPTIONS").map(PathBuf::from),
            runtime,
            static_effect: env::var("PDP_STATIC_EFFECT").unwrap_or_else(|_| "allow".to_owned()),
            max_inflight: parse_env("PDP_MAX_INFLIGHT", DEFAULT_MAX_INFLIGHT)?,
            max_restarts: parse_env("PDP_MAX_RESTARTS", DEFAULT_MAX_RESTARTS)?,
            log_filter: env::var("PDP_LOG").unwrap_or_else(|_| "info".to_owned()),
            bridge,
        })
    }

    fn to_worker_config(&self) -> SandboxWorkerConfig {
        SandboxWorkerConfig {
            static_effect: self.static_effect.clone(),
            log_filter: self.log_filter.clone(),
            callback_timeout_ms: self.bridge.callback_timeout.as_millis() as u64,
        }
    }

    fn to_launch_config(&self) -> SandboxLaunchConfig {
        SandboxLaunchConfig {
            runtime: self.runtime,
            worker: self.to_worker_config(),
        }
    }

    fn request_timeout(&self) -> Duration {
        self.bridge.rpc_timeout + self.bridge.upload_timeout
    }
}

fn parse_env<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|err| anyhow::anyhow!("{key}={raw} is invalid: {err}")),
        Err(_) => Ok(default),
    }
}

#[derive(Clone)]
struct AppState {
    bridge: PdpBridge,
    supervisor: Arc<SupervisorHandle>,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    name: String,
    message: String,
}

async fn healthcheck(State(state): State<AppState>) -> Response {
    let status = if state.bridge.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "state": state.bridge.state().to_string(),
        "pending": state.bridge.pending_requests(),
    });
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

async fn log_request_response(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let request_id = Uuid::new_v4().simple().to_string();
    let start = Instant::now();
    debug!(%request_id, %method, %uri, "request");
    let mut response = next.run(request).await;
    info!(
        %request_id,
        %method,
        %uri,
        status = response.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        "response"
    );
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

async fn check_resource_handler(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    bridge_response(state.bridge.check_resource(payload).await)
}

async fn check_resources_handler(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    bridge_response(state.bridge.check_resources(payload).await)
}

async fn plan_resources_handler(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    bridge_response(state.bridge.plan_resources(payload).await)
}

async fn restart_handler(State(state): State<AppState>) -> Response {
    match state.supervisor.request_restart() {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({"restarting": true}))).into_response(),
        Err(message) => error_response(StatusCode::CONFLICT, "RestartRejected", &message),
    }
}

fn bridge_response(outcome: Result<Value, BridgeError>) -> Response {
    match outcome {
        Ok(result) => Json(result).into_response(),
        Err(err) => {
            let status = status_for(&err);
            if status.is_server_error() {
                warn!(error = %err, status = status.as_u16(), "bridge call failed");
            }
            let message = match &err {
                BridgeError::Upstream(wire) => wire.message.clone(),
                other => other.to_string(),
            };
            error_response(status, err.name(), &message)
        }
    }
}

fn status_for(err: &BridgeError) -> StatusCode {
    match err {
        BridgeError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        BridgeError::SandboxUnavailable(_) | BridgeError::Reloaded => StatusCode::SERVICE_UNAVAILABLE,
        BridgeError::Upstream(_) => StatusCode::UNPROCESSABLE_ENTITY,
        BridgeError::Protocol(_) | BridgeError::CallbackUnavailable(_) => StatusCode::BAD_GATEWAY,
        BridgeError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(status: StatusCode, name: &str, message: &str) -> Response {
    let mut response = Json(ErrorEnvelope {
        error: ErrorBody {
            name: name.to_owned(),
            message: message.to_owned(),
        },
    })
    .into_response();
    *response.status_mut() = status;
    response
}

fn native_handlers() -> CallbackHandlers {
    CallbackHandlers::new()
        .on_decision(|entry| {
            info!(target: "decision_log", %entry, "decision");
            Ok(())
        })
        .on_validation_error(|errors| {
            for error in errors {
                warn!(target: "validation", %error, "request failed schema validation");
            }
            Ok(())
        })
        .on_policy_update(|update| {
            info!(%update, "engine policies updated");
            Ok(())
        })
}

async fn load_engine_options(path: Option<&PathBuf>) -> anyhow::Result<Value> {
    let Some(path) = path else {
        return Ok(json!({}));
    };
    let raw = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&raw)?)
}

/// Runs `init` until it succeeds once; after that the bridge replays it on
/// every sandbox restart by itself.
async fn initialize_engine(bridge: PdpBridge, options: Value) {
    loop {
        match bridge
            .init(InitOptions::new(options.clone()).with_handlers(native_handlers()))
            .await
        {
            Ok(result) => {
                info!(%result, "engine initialized");
                return;
            }
            Err(BridgeError::SandboxUnavailable(message)) if bridge.state() == LifecycleState::TornDown => {
                error!(%message, "bridge torn down before init completed");
                return;
            }
            Err(err) => {
                warn!(error = %err, "engine init failed; retrying");
                tokio::time::sleep(INIT_RETRY_DELAY).await;
            }
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c");
    }
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_logging(&LogConfig::from_env())?;
    let config = AppConfig::from_env()?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()?;
    rt.block_on(async move {
        let client = Arc::new(SandboxClient::new());
        let bridge = PdpBridge::new(config.bridge.clone(), client.clone());
        if let Some(path) = &config.wasm_path {
            let image = tokio::fs::read(path).await?;
            info!(path = %path.display(), bytes = image.len(), "engine image loaded");
            bridge.set_engine_image(image);
        }
        let options = load_engine_options(config.engine_options_path.as_ref()).await?;

        let launcher = build_launcher(config.to_launch_config());
        let supervisor = Arc::new(spawn_supervisor(
            bridge.clone(),
            client,
            launcher,
            SupervisorConfig {
                max_restarts: config.max_restarts,
                ..SupervisorConfig::default()
            },
        ));
        tokio::spawn(initialize_engine(bridge.clone(), options));

        let state = AppState {
            bridge: bridge.clone(),
            supervisor: supervisor.clone(),
        };
        let api = ServiceBuilder::new()
            .layer(DefaultBodyLimit::max(MAX_BODY_LIMIT_BYTES))
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                config.request_timeout(),
            ));
        let app = Router::new()
            .route("/healthz", get(healthcheck))
            .route(
                "/v1/check-resource",
                post(check_resource_handler).layer(api.clone()),
            )
            .route(
                "/v1/check-resources",
                post(check_resources_handler).layer(api.clone()),
            )
            .route(
                "/v1/plan-resources",
                post(plan_resources_handler).layer(api),
            )
            .route("/v1/sandbox/restart", post(restart_handler))
            .layer(CompressionLayer::new())
            .layer(ConcurrencyLimitLayer::new(config.max_inflight))
            .layer(middleware::from_fn(log_request_response))
            .with_state(state);

        let addr = format!("{}:{}", config.host, config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(%addr, runtime = ?config.runtime, "listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        match Arc::try_unwrap(supervisor) {
            Ok(supervisor) => supervisor.shutdown().await,
            Err(_) => bridge.shutdown(),
        }
        Ok::<(), anyhow::Error>(())
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge::WireError;

    #[test]
    fn bridge_errors_map_to_statuses() {
        assert_eq!(
            status_for(&BridgeError::Timeout {
                method: "checkResource".to_owned(),
                elapsed_ms: 30_000
            }),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(status_for(&BridgeError::Reloaded), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status_for(&BridgeError::Upstream(WireError::new("TypeError", "bad"))),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&BridgeError::protocol("mismatch")),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn error_body_names_the_failure() {
        let response = bridge_response(Err(BridgeError::unavailable("no worker")));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
