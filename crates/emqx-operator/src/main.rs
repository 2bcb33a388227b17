//! EMQX Operator - Kubernetes lifecycle management for EMQX broker clusters

use clap::Parser;

use emqx_common::kube_utils::create_client_with_timeout;
use emqx_common::telemetry::{init_telemetry, TelemetryConfig};
use emqx_operator::config::OperatorConfig;
use emqx_operator::controller_runner::build_cluster_controller;
use emqx_operator::startup::{crd_yaml, ensure_crds_installed, ensure_webhook_configs};
use emqx_operator::webhook::serve_webhook;

/// EMQX operator - reconciles EmqxCluster resources and serves their admission webhook
#[derive(Parser, Debug)]
#[command(name = "emqx-operator", version, about, long_about = None)]
struct Cli {
    /// Print the CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    config: OperatorConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // kube and axum-server both pull in rustls; pick the provider explicitly
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crd_yaml()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "emqx-operator".to_string(),
        format: cli.config.log_format,
    })?;

    run(cli.config).await
}

async fn run(config: OperatorConfig) -> anyhow::Result<()> {
    let client = create_client_with_timeout(None, config.api_timeout(), config.api_timeout()).await?;

    ensure_crds_installed(&client).await?;
    if config.register_webhook {
        ensure_webhook_configs(&client, &config).await?;
    }

    tracing::info!("Starting controllers:");
    let controller = build_cluster_controller(client, &config);

    if config.disable_webhook {
        controller.await;
        return Ok(());
    }

    let webhook = serve_webhook(config.webhook_addr, &config.tls_cert, &config.tls_key);
    tokio::select! {
        _ = controller => {
            tracing::info!("controller stopped");
            Ok(())
        }
        result = webhook => result,
    }
}
