#![forbid(unsafe_code)]

use std::{
    env,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use staffing_adapter::{
    http_status_for, AdapterConfig, AdapterHealthResponse, AdapterRuntime, ErrorBody,
    ErrorResponse, ReconcileResponse, ValidateAllocationsRequest, ValidatePositionsRequest,
    ENV_LOG,
};
use staffing_os::reconcile::ReconcileError;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

type SharedRuntime = Arc<Mutex<AdapterRuntime>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = env::var(ENV_LOG)
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = AdapterConfig::from_env();
    let addr: SocketAddr = config.http_bind.parse()?;
    let runtime: SharedRuntime = Arc::new(Mutex::new(AdapterRuntime::from_config(config)?));

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/allocations/validate-positions", post(validate_positions))
        .route("/positions/validate-allocations", post(validate_allocations))
        .with_state(runtime);

    info!(%addr, "staffing_adapter_http listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("staffing_adapter_http stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "ctrl-c handler failed, serving until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested, draining in-flight requests");
}

async fn healthz(
    State(runtime): State<SharedRuntime>,
) -> (StatusCode, Json<AdapterHealthResponse>) {
    let outcome = tokio::task::spawn_blocking(move || {
        let runtime = runtime
            .lock()
            .map_err(|_| "adapter runtime lock poisoned".to_string())?;
        runtime.health_report()
    })
    .await
    .unwrap_or_else(|err| Err(format!("health task failed: {err}")));
    match outcome {
        Ok(response) => (StatusCode::OK, Json(response)),
        Err(reason) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(AdapterHealthResponse {
                status: "error".to_string(),
                store: "unknown".to_string(),
                reason: Some(reason),
            }),
        ),
    }
}

async fn validate_positions(
    State(runtime): State<SharedRuntime>,
    Json(request): Json<ValidatePositionsRequest>,
) -> (StatusCode, Json<Value>) {
    run_blocking(runtime, move |rt| rt.validate_positions(request)).await
}

async fn validate_allocations(
    State(runtime): State<SharedRuntime>,
    Json(request): Json<ValidateAllocationsRequest>,
) -> (StatusCode, Json<Value>) {
    run_blocking(runtime, move |rt| rt.validate_allocations(request)).await
}

/// Runs one reconcile on the blocking pool; the store is synchronous and a
/// run may wait on the SQLite busy timeout.
async fn run_blocking<F>(runtime: SharedRuntime, f: F) -> (StatusCode, Json<Value>)
where
    F: FnOnce(&mut AdapterRuntime) -> Result<ReconcileResponse, ReconcileError> + Send + 'static,
{
    let joined = tokio::task::spawn_blocking(move || {
        let mut rt = runtime
            .lock()
            .map_err(|_| "adapter runtime lock poisoned".to_string())?;
        let outcome = f(&mut *rt);
        Ok::<_, String>(outcome)
    })
    .await;

    match joined {
        Ok(Ok(Ok(response))) => (StatusCode::OK, to_json(&response)),
        Ok(Ok(Err(err))) => {
            let status = StatusCode::from_u16(http_status_for(&err))
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, to_json(&ErrorResponse::from(&err)))
        }
        Ok(Err(reason)) => internal_error(reason),
        Err(err) => internal_error(format!("reconcile task failed: {err}")),
    }
}

fn internal_error(reason: String) -> (StatusCode, Json<Value>) {
    error!(%reason, "staffing_adapter_http internal error");
    let body = ErrorResponse {
        success: false,
        error: ErrorBody {
            kind: "internal".to_string(),
            message: reason,
            retryable: true,
        },
    };
    (StatusCode::INTERNAL_SERVER_ERROR, to_json(&body))
}

fn to_json<T: Serialize>(value: &T) -> Json<Value> {
    Json(serde_json::to_value(value).unwrap_or(Value::Null))
}
