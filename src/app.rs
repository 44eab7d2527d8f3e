use crate::config::{FaucetConfig, IngestConfig};
use crate::ingest::{DeliverySink, FileSink, SyntheticSource};
use crate::limiter::{AdmissionController, Keyspace};
use crate::metrics::Metrics;
use crate::retry::RetryPolicy;
use crate::worker::DeliveryWorker;
use anyhow::Result;
use axum::{
    body::Body,
    extract::{ConnectInfo, FromRef, MatchedPath, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use http_body_util::LengthLimitError;
use serde::Deserialize;
use serde_json::{json, Value};
use std::{net::SocketAddr, sync::Arc, time::Instant};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub limiter: Arc<AdmissionController>,
    pub metrics: Arc<Metrics>,
    #[from_ref(skip)]
    pub force_error_rate: f64,
}

impl AppState {
    pub fn new(limiter: Arc<AdmissionController>, metrics: Arc<Metrics>) -> Self {
        Self {
            limiter,
            metrics,
            force_error_rate: 0.0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FaucetRequest {
    #[serde(default)]
    address: String,
}

pub async fn run_server(config: FaucetConfig) -> Result<()> {
    let metrics = Arc::new(Metrics::new()?);
    let limiter = Arc::new(AdmissionController::with_defaults());
    if config.force_error_rate > 0.0 {
        warn!(
            "Fault injection enabled: {:.0}% of faucet requests will fail",
            config.force_error_rate * 100.0
        );
    }
    let state = AppState {
        limiter,
        metrics,
        force_error_rate: config.force_error_rate,
    };

    let app = build_router(state);

    let addr = config.addr();
    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

/// Runs the delivery worker plus its health/metrics endpoints until a
/// shutdown signal arrives.
pub async fn run_ingest(config: IngestConfig) -> Result<()> {
    let metrics = Arc::new(Metrics::new()?);
    let sink: Arc<dyn DeliverySink> = Arc::new(FileSink::open(&config.store_path)?);
    info!(
        "Ingesting chain {} every {:?} into {}",
        config.chain_id,
        config.interval,
        config.store_path.display()
    );

    let cancel = CancellationToken::new();
    let worker = DeliveryWorker::new(
        Box::new(SyntheticSource::new(config.chain_id.clone())),
        sink,
        RetryPolicy::DEFAULT,
        config.interval,
        metrics.clone(),
    );
    let worker_handle = tokio::spawn(worker.run(cancel.clone()));

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    let addr = config.addr();
    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_cancel = cancel.clone();
    let served = axum::serve(listener, ingest_router(metrics))
        .with_graceful_shutdown(async move { server_cancel.cancelled().await })
        .await;
    if let Err(e) = &served {
        error!("Server stopped: {}", e);
    }

    // A failed server also stops the worker so the process can exit.
    cancel.cancel();
    if let Err(e) = worker_handle.await {
        error!("Delivery worker panicked: {}", e);
    }
    served?;
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    let metrics = state.metrics.clone();
    Router::new()
        .route("/faucet", post(handle_faucet))
        .route("/healthz", get(health))
        .route("/metrics", get(render_metrics))
        .layer(middleware::from_fn_with_state(metrics, track_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn ingest_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(render_metrics))
        .layer(middleware::from_fn_with_state(metrics.clone(), track_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(metrics)
}

async fn health() -> &'static str {
    "ok"
}

async fn render_metrics(State(metrics): State<Arc<Metrics>>) -> Response {
    match metrics.gather() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to render metrics: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn track_metrics(State(metrics): State<Arc<Metrics>>, req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let res = next.run(req).await;
    metrics.record_request(
        &method,
        &path,
        res.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    res
}

fn reject(status: StatusCode, message: &str) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "error": message })))
}

async fn handle_faucet(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Body,
) -> (StatusCode, Json<Value>) {
    if state.force_error_rate > 0.0 && rand::random::<f64>() < state.force_error_rate {
        return reject(StatusCode::INTERNAL_SERVER_ERROR, "injected error (gameday)");
    }

    let ip = extract_ip(&headers, peer.map(|ConnectInfo(addr)| addr));
    let ip_allowed = state.limiter.allow(Keyspace::Ip, &ip);
    state.metrics.record_admission(Keyspace::Ip, ip_allowed);
    if !ip_allowed {
        warn!(ip = %ip, "Rate limit exceeded (ip)");
        return reject(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded (IP)");
    }

    // Read only after the IP check, so a limited client gets 429 whatever it sends.
    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            let cause = e.into_inner();
            if cause.is::<LengthLimitError>() {
                warn!("Rejecting request: body larger than {} bytes", MAX_BODY_BYTES);
                return reject(StatusCode::PAYLOAD_TOO_LARGE, "body too large");
            }
            warn!("Rejecting request: failed to read body: {}", cause);
            return reject(StatusCode::BAD_REQUEST, "failed to read body");
        }
    };

    let request: FaucetRequest = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            warn!("Rejecting request: invalid JSON body: {}", e);
            return reject(StatusCode::BAD_REQUEST, "invalid json");
        }
    };

    let address = request.address.trim();
    if address.is_empty() {
        return reject(StatusCode::BAD_REQUEST, "address required");
    }

    let address_allowed = state.limiter.allow(Keyspace::Address, address);
    state
        .metrics
        .record_admission(Keyspace::Address, address_allowed);
    if !address_allowed {
        warn!(address = %address, "Rate limit exceeded (address)");
        return reject(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded (address)");
    }

    info!(address = %address, ip = %ip, "Faucet request");
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "address": address,
            "tx_hash": "0xstub",
        })),
    )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        term.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Shutdown signal received (Ctrl+C)");
        }
        _ = terminate => {
            info!("Shutdown signal received (SIGTERM)");
        }
    }
}

/// Leftmost `X-Forwarded-For` entry when present, else the peer address.
fn extract_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(',').next().unwrap_or(s).trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}
