//! Operator configuration from command-line flags and environment

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use emqx_cluster::controller::{ReconcileConfig, DEFAULT_ADMIN_API_VERSION};
use emqx_common::telemetry::LogFormat;

/// Runtime settings for the controller and the admission webhook
#[derive(Args, Debug, Clone)]
pub struct OperatorConfig {
    /// Address the admission webhook listens on
    #[arg(long, env = "EMQX_OPERATOR_WEBHOOK_ADDR", default_value = "0.0.0.0:9443")]
    pub webhook_addr: SocketAddr,

    /// PEM certificate served by the webhook
    #[arg(
        long,
        env = "EMQX_OPERATOR_TLS_CERT",
        default_value = "/tmp/k8s-webhook-server/serving-certs/tls.crt"
    )]
    pub tls_cert: PathBuf,

    /// PEM private key for the webhook certificate
    #[arg(
        long,
        env = "EMQX_OPERATOR_TLS_KEY",
        default_value = "/tmp/k8s-webhook-server/serving-certs/tls.key"
    )]
    pub tls_key: PathBuf,

    /// Do not serve the admission webhook
    #[arg(long, env = "EMQX_OPERATOR_DISABLE_WEBHOOK")]
    pub disable_webhook: bool,

    /// Register mutating and validating webhook configurations on startup
    #[arg(long, env = "EMQX_OPERATOR_REGISTER_WEBHOOK")]
    pub register_webhook: bool,

    /// Service fronting the webhook, referenced by the webhook configurations
    #[arg(long, env = "EMQX_OPERATOR_WEBHOOK_SERVICE", default_value = "emqx-operator-webhook")]
    pub webhook_service: String,

    /// Namespace of the webhook service
    #[arg(long, env = "EMQX_OPERATOR_NAMESPACE", default_value = "emqx-operator-system")]
    pub namespace: String,

    /// CA bundle the API server uses to verify the webhook certificate
    #[arg(long, env = "EMQX_OPERATOR_WEBHOOK_CA")]
    pub webhook_ca: Option<PathBuf>,

    /// Broker admin REST API version
    #[arg(long, env = "EMQX_OPERATOR_ADMIN_API_VERSION", default_value = DEFAULT_ADMIN_API_VERSION)]
    pub admin_api_version: String,

    /// Seconds allowed to open a tunnel and for each admin call
    #[arg(long, env = "EMQX_OPERATOR_TUNNEL_TIMEOUT", default_value_t = 10)]
    pub tunnel_timeout_secs: u64,

    /// Seconds allowed for each Kubernetes API call
    #[arg(long, env = "EMQX_OPERATOR_API_TIMEOUT", default_value_t = 30)]
    pub api_timeout_secs: u64,

    /// Seconds between periodic resyncs of a healthy cluster
    #[arg(long, env = "EMQX_OPERATOR_RESYNC_INTERVAL", default_value_t = 60)]
    pub resync_interval_secs: u64,

    /// Seconds before retrying while broker membership cannot be read
    #[arg(long, env = "EMQX_OPERATOR_MEMBERSHIP_REQUEUE", default_value_t = 10)]
    pub membership_requeue_secs: u64,

    /// Log output format: json or text
    #[arg(long, env = "EMQX_OPERATOR_LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,
}

impl OperatorConfig {
    /// Reconcile tunables derived from the flags
    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            admin_api_version: self.admin_api_version.clone(),
            requeue_interval: Duration::from_secs(self.resync_interval_secs),
            membership_requeue: Duration::from_secs(self.membership_requeue_secs),
        }
    }

    /// Bound on tunnel establishment and admin calls
    pub fn tunnel_timeout(&self) -> Duration {
        Duration::from_secs(self.tunnel_timeout_secs)
    }

    /// Bound on Kubernetes API calls
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }
}
