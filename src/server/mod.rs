pub mod admission;
pub mod error;
pub mod metrics;
pub mod mutation;
pub mod oci;
pub mod settings;
pub mod state;
pub mod transform;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use axum_server::{tls_rustls::RustlsConfig, Handle};
use error::ServerError;
use state::AppState;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::task::JoinError;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

/// How long in-flight admission requests may take to finish on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Run the webhook, health and metrics servers until a shutdown signal arrives
pub async fn run_server(settings: settings::Settings) -> Result<()> {
    // Install default CryptoProvider for rustls before any TLS config is built
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let (state, refresher) = AppState::new_for_server(&settings)?;
    info!(
        transformer = state.transformer.transformer_type(),
        "Transformer initialized"
    );

    let webhook_addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port)
        .parse()
        .context("Invalid webhook listen address")?;
    let health_addr: SocketAddr = settings
        .server
        .health_addr
        .parse()
        .context("Invalid health listen address")?;
    let metrics_addr: SocketAddr = settings
        .server
        .metrics_addr
        .parse()
        .context("Invalid metrics listen address")?;

    let webhook_handle = Handle::new();
    let health_handle = Handle::new();
    let metrics_handle = Handle::new();

    let mut webhook_task = tokio::spawn(serve_webhook(
        webhook_addr,
        settings.server.clone(),
        webhook_router(state.clone()),
        webhook_handle.clone(),
    ));
    let mut health_task = tokio::spawn(serve_plain(
        "Health",
        health_addr,
        health_router(state.clone()),
        health_handle.clone(),
    ));
    let mut metrics_task = tokio::spawn(serve_plain(
        "Metrics",
        metrics_addr,
        metrics_router(state),
        metrics_handle.clone(),
    ));

    // Static transformers have no background work; park a task that never finishes
    let mut refresher =
        refresher.unwrap_or_else(|| tokio::spawn(std::future::pending::<Result<()>>()));

    let outcome = tokio::select! {
        _ = shutdown_signal() => Ok(()),
        res = &mut refresher => match flatten(res, "Proxy mapping refresher") {
            Ok(()) => Err(anyhow::anyhow!("Proxy mapping refresher stopped unexpectedly")),
            Err(e) => Err(e),
        },
        res = &mut webhook_task => flatten(res, "Webhook server"),
        res = &mut health_task => flatten(res, "Health server"),
        res = &mut metrics_task => flatten(res, "Metrics server"),
    };

    webhook_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
    health_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
    metrics_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
    refresher.abort();

    if !webhook_task.is_finished() {
        let _ = webhook_task.await;
    }
    if !health_task.is_finished() {
        let _ = health_task.await;
    }
    if !metrics_task.is_finished() {
        let _ = metrics_task.await;
    }

    info!("Webhook server shutdown complete");
    outcome
}

/// Routes called by the Kubernetes API server
pub fn webhook_router(state: AppState) -> Router {
    Router::new()
        .merge(admission::routes::routes())
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

/// Liveness and readiness endpoints for the kubelet
pub fn health_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/readyz", get(readiness_check))
        .with_state(state)
}

/// Prometheus scrape endpoint
pub fn metrics_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn serve_webhook(
    addr: SocketAddr,
    server: settings::ServerSettings,
    app: Router,
    handle: Handle,
) -> Result<()> {
    if server.tls {
        let cert_dir = Path::new(&server.cert_dir);
        let tls_config =
            RustlsConfig::from_pem_file(cert_dir.join("tls.crt"), cert_dir.join("tls.key"))
                .await
                .with_context(|| {
                    format!("Failed to load TLS certificate from {}", cert_dir.display())
                })?;

        info!("Webhook server listening on https://{}", addr);
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .context("Webhook server error")?;
    } else {
        info!("Webhook server listening on http://{}", addr);
        axum_server::bind(addr)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .context("Webhook server error")?;
    }
    Ok(())
}

async fn serve_plain(name: &str, addr: SocketAddr, app: Router, handle: Handle) -> Result<()> {
    info!("{} server listening on http://{}", name, addr);
    axum_server::bind(addr)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .with_context(|| format!("{} server error", name))?;
    Ok(())
}

fn flatten(res: Result<Result<()>, JoinError>, task: &str) -> Result<()> {
    res.with_context(|| format!("{} task panicked", task))?
        .with_context(|| format!("{} failed", task))
}

async fn health_check() -> &'static str {
    "ok"
}

async fn readiness_check(State(state): State<AppState>) -> Result<&'static str, ServerError> {
    state
        .transformer
        .ready()
        .map_err(|e| ServerError::unavailable(e.to_string()))?;
    Ok("ok")
}

async fn metrics_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ServerError> {
    let body = state
        .metrics
        .render()
        .map_err(|e| ServerError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)))?;
    Ok(([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body))
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
