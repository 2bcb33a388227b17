//! Admission webhook for EmqxCluster
//!
//! The mutating endpoint fills in generated bootstrap settings, management
//! labels and the replicant replica default. The validating endpoint enforces
//! `EmqxClusterSpec::validate` and the write-once bootstrap configuration.

pub mod defaults;
pub mod handlers;
pub mod validation;

use std::net::SocketAddr;
use std::path::Path;

use axum::{
    routing::{get, post},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use tracing::info;

/// Path of the mutating endpoint
pub const MUTATE_PATH: &str = "/mutate-apps-emqx-io-v2alpha1-emqxcluster";

/// Path of the validating endpoint
pub const VALIDATE_PATH: &str = "/validate-apps-emqx-io-v2alpha1-emqxcluster";

/// Create the webhook router with the admission and health endpoints
pub fn webhook_router() -> Router {
    Router::new()
        .route(MUTATE_PATH, post(handlers::mutate_handler))
        .route(VALIDATE_PATH, post(handlers::validate_handler))
        .route("/healthz", get(|| async { "ok" }))
}

/// Serve the webhook over TLS until the process stops
pub async fn serve_webhook(addr: SocketAddr, cert: &Path, key: &Path) -> anyhow::Result<()> {
    let tls_config = RustlsConfig::from_pem_file(cert, key)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load webhook TLS material: {e}"))?;

    info!(addr = %addr, "starting admission webhook");
    axum_server::bind_rustls(addr, tls_config)
        .serve(webhook_router().into_make_service())
        .await
        .map_err(|e| anyhow::anyhow!("webhook server error: {e}"))
}
