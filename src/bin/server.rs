//! evd-server: HTTP shell around the EVD service core.
//!
//! Routes raw binary bodies to the collection handlers. Input errors
//! come back as 400 with the offending parameter spelled out; protocol
//! errors close the connection; everything else is a generic internal
//! error with the detail kept in the server log.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, post};
use axum::Router;
use clap::Parser;
use eyre::{Context, Result};
use tokio::sync::Notify;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use evd::wire::Operation;
use evd::{ErrorKind, EvdService};

#[derive(Parser)]
#[command(name = "evd-server")]
#[command(about = "Encrypted vector database server")]
#[command(version)]
struct Args {
    /// Server bind address
    #[arg(long, default_value = "0.0.0.0:9000", env = "EVD_BIND")]
    bind: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", env = "EVD_LOG_LEVEL")]
    log_level: Level,
}

struct AppState {
    service: EvdService,
    shutdown: Notify,
}

fn dispatch(state: &AppState, op: Operation, body: &[u8]) -> axum::response::Response {
    match state.service.handle(op, body) {
        Ok(resp) => (StatusCode::OK, resp).into_response(),
        Err(err) => match err.kind() {
            ErrorKind::Input => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
            ErrorKind::Protocol => {
                error!(%err, ?op, "malformed request");
                (
                    StatusCode::BAD_REQUEST,
                    [(axum::http::header::CONNECTION, "close")],
                    "malformed request".to_string(),
                )
                    .into_response()
            }
            ErrorKind::Programming | ErrorKind::Crypto => {
                error!(%err, ?op, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string()).into_response()
            }
        },
    }
}

async fn handle_setup(State(state): State<Arc<AppState>>, body: Bytes) -> impl IntoResponse {
    dispatch(&state, Operation::Setup, &body)
}

async fn handle_insert(State(state): State<Arc<AppState>>, body: Bytes) -> impl IntoResponse {
    dispatch(&state, Operation::Insert, &body)
}

async fn handle_query(State(state): State<Arc<AppState>>, body: Bytes) -> impl IntoResponse {
    dispatch(&state, Operation::Query, &body)
}

async fn handle_query_ptxt(State(state): State<Arc<AppState>>, body: Bytes) -> impl IntoResponse {
    dispatch(&state, Operation::QueryPtxt, &body)
}

async fn handle_retrieve(State(state): State<Arc<AppState>>, body: Bytes) -> impl IntoResponse {
    dispatch(&state, Operation::Retrieve, &body)
}

async fn handle_pir_retrieve(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> impl IntoResponse {
    dispatch(&state, Operation::PirRetrieve, &body)
}

async fn handle_drop(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
) -> impl IntoResponse {
    match hash.parse::<u64>() {
        Ok(hash) => (StatusCode::OK, state.service.drop_collection(hash)).into_response(),
        Err(_) => (StatusCode::BAD_REQUEST, "invalid collection hash".to_string()).into_response(),
    }
}

async fn handle_terminate(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.shutdown.notify_one();
    (StatusCode::OK, "terminated")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install tracing subscriber")?;

    let state = Arc::new(AppState {
        service: EvdService::new(),
        shutdown: Notify::new(),
    });

    let app = Router::new()
        .route("/collections/setup", post(handle_setup))
        .route("/collections/insert", post(handle_insert))
        .route("/collections/query", post(handle_query))
        .route("/collections/query_ptxt", post(handle_query_ptxt))
        .route("/collections/retrieve", post(handle_retrieve))
        .route("/collections/pir_retrieve", post(handle_pir_retrieve))
        .route("/collections/:hash", delete(handle_drop))
        .route("/terminate", post(handle_terminate))
        // Key uploads run to hundreds of megabytes.
        .layer(axum::extract::DefaultBodyLimit::disable())
        .with_state(Arc::clone(&state));

    let addr: SocketAddr = args
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", args.bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "evd-server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = state.shutdown.notified() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
            info!("shutting down");
        })
        .await
        .context("server error")?;

    Ok(())
}
