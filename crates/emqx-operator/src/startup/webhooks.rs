//! Registration of the admission webhook configurations

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    ValidatingWebhook, ValidatingWebhookConfiguration, WebhookClientConfig,
};
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::Client;

use emqx_common::FIELD_MANAGER;

use crate::config::OperatorConfig;
use crate::webhook::{MUTATE_PATH, VALIDATE_PATH};

/// Name of the mutating webhook configuration
pub const MUTATING_CONFIG_NAME: &str = "emqx-operator-mutating";

/// Name of the validating webhook configuration
pub const VALIDATING_CONFIG_NAME: &str = "emqx-operator-validating";

fn rules() -> Vec<RuleWithOperations> {
    vec![RuleWithOperations {
        operations: Some(vec!["CREATE".to_string(), "UPDATE".to_string()]),
        api_groups: Some(vec!["apps.emqx.io".to_string()]),
        api_versions: Some(vec!["v2alpha1".to_string()]),
        resources: Some(vec!["emqxclusters".to_string()]),
        scope: Some("Namespaced".to_string()),
    }]
}

fn client_config(config: &OperatorConfig, path: &str, ca_bundle: Option<&[u8]>) -> WebhookClientConfig {
    WebhookClientConfig {
        service: Some(ServiceReference {
            name: config.webhook_service.clone(),
            namespace: config.namespace.clone(),
            path: Some(path.to_string()),
            port: Some(443),
        }),
        ca_bundle: ca_bundle.map(|ca| ByteString(ca.to_vec())),
        ..Default::default()
    }
}

/// Mutating configuration routing EmqxCluster writes to the defaulting endpoint
pub fn mutating_configuration(
    config: &OperatorConfig,
    ca_bundle: Option<&[u8]>,
) -> MutatingWebhookConfiguration {
    MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(MUTATING_CONFIG_NAME.to_string()),
            ..Default::default()
        },
        webhooks: Some(vec![MutatingWebhook {
            name: "mutating.apps.emqx.io".to_string(),
            admission_review_versions: vec!["v1".to_string()],
            side_effects: "None".to_string(),
            failure_policy: Some("Fail".to_string()),
            match_policy: Some("Equivalent".to_string()),
            rules: Some(rules()),
            client_config: client_config(config, MUTATE_PATH, ca_bundle),
            ..Default::default()
        }]),
    }
}

/// Validating configuration routing EmqxCluster writes to the validation endpoint
pub fn validating_configuration(
    config: &OperatorConfig,
    ca_bundle: Option<&[u8]>,
) -> ValidatingWebhookConfiguration {
    ValidatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(VALIDATING_CONFIG_NAME.to_string()),
            ..Default::default()
        },
        webhooks: Some(vec![ValidatingWebhook {
            name: "validator.apps.emqx.io".to_string(),
            admission_review_versions: vec!["v1".to_string()],
            side_effects: "None".to_string(),
            failure_policy: Some("Fail".to_string()),
            match_policy: Some("Equivalent".to_string()),
            rules: Some(rules()),
            client_config: client_config(config, VALIDATE_PATH, ca_bundle),
            ..Default::default()
        }]),
    }
}

/// Apply both webhook configurations
pub async fn ensure_webhook_configs(client: &Client, config: &OperatorConfig) -> anyhow::Result<()> {
    let ca_bundle = match &config.webhook_ca {
        Some(path) => Some(tokio::fs::read(path).await.map_err(|e| {
            anyhow::anyhow!("failed to read webhook CA bundle {}: {}", path.display(), e)
        })?),
        None => None,
    };
    let params = PatchParams::apply(FIELD_MANAGER).force();

    let mutating: Api<MutatingWebhookConfiguration> = Api::all(client.clone());
    mutating
        .patch(
            MUTATING_CONFIG_NAME,
            &params,
            &Patch::Apply(&mutating_configuration(config, ca_bundle.as_deref())),
        )
        .await
        .map_err(|e| anyhow::anyhow!("failed to apply MutatingWebhookConfiguration: {}", e))?;

    let validating: Api<ValidatingWebhookConfiguration> = Api::all(client.clone());
    validating
        .patch(
            VALIDATING_CONFIG_NAME,
            &params,
            &Patch::Apply(&validating_configuration(config, ca_bundle.as_deref())),
        )
        .await
        .map_err(|e| anyhow::anyhow!("failed to apply ValidatingWebhookConfiguration: {}", e))?;

    tracing::info!("Webhook configurations installed");
    Ok(())
}
