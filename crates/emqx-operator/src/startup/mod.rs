//! Startup tasks run before the controller starts

mod crds;
mod webhooks;

pub use crds::{crd_yaml, ensure_crds_installed};
pub use webhooks::{
    ensure_webhook_configs, mutating_configuration, validating_configuration,
    MUTATING_CONFIG_NAME, VALIDATING_CONFIG_NAME,
};
