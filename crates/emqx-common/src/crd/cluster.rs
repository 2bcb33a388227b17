//! EmqxCluster Custom Resource Definition
//!
//! An EmqxCluster describes one broker cluster: a stateful group of core
//! members and a stateless group of replicants sharing one bootstrap
//! configuration.

use std::collections::{BTreeMap, HashMap};

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    Capabilities, ClusterPhase, Condition, ConfigBundle, Edition, EmqxNode, ListenerSlot,
    ListenerSpec, NodeTemplate, StorageSpec,
};
use crate::hocon::ConfigDocument;
use crate::{LABEL_DB_ROLE, LABEL_INSTANCE, LABEL_MANAGED_BY, MANAGED_BY_VALUE};

/// Core replica count used when the template leaves it unset
pub const DEFAULT_CORE_REPLICAS: i32 = 3;

/// Admin port used when neither the api nor the dashboard listener is enabled
pub const DEFAULT_ADMIN_PORT: u16 = 18083;

/// Specification for an EmqxCluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "apps.emqx.io",
    version = "v2alpha1",
    kind = "EmqxCluster",
    plural = "emqxclusters",
    shortname = "emqx",
    status = "EmqxClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Core","type":"integer","jsonPath":".status.coreReadyReplicas"}"#,
    printcolumn = r#"{"name":"Replicant","type":"integer","jsonPath":".status.replicantReadyReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EmqxClusterSpec {
    /// Broker container image
    pub image: String,

    /// Image pull policy for broker containers
    #[serde(default = "default_pull_policy")]
    pub image_pull_policy: String,

    /// Broker edition, which decides the available capabilities
    #[serde(default)]
    pub edition: Edition,

    /// Bootstrap configuration document (HOCON), write-once after creation
    #[serde(default)]
    pub bootstrap_config: String,

    /// Core node group
    #[serde(default)]
    pub core_template: NodeTemplate,

    /// Replicant node group
    #[serde(default)]
    pub replicant_template: NodeTemplate,

    /// Listener ports and service exposure
    #[serde(default)]
    pub listener: ListenerSpec,

    /// ACL rules bundle
    #[serde(default = "ConfigBundle::default_acl")]
    pub acl: ConfigBundle,

    /// Preloaded modules bundle
    #[serde(default = "ConfigBundle::default_modules")]
    pub modules: ConfigBundle,

    /// Preloaded plugins bundle
    #[serde(default = "ConfigBundle::default_plugins")]
    pub plugins: ConfigBundle,

    /// License payload, enterprise edition only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,

    /// Persistent storage for core members
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,

    /// Service account the broker pods run as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

fn default_pull_policy() -> String {
    "IfNotPresent".to_string()
}

impl EmqxClusterSpec {
    /// Config bundles in mount order
    pub fn bundles(&self) -> [&ConfigBundle; 3] {
        [&self.acl, &self.modules, &self.plugins]
    }

    /// License payload when present and non-empty
    pub fn license_payload(&self) -> Option<&str> {
        self.license.as_deref().filter(|l| !l.trim().is_empty())
    }

    /// Validate the cluster specification
    ///
    /// These checks hold for any spec accepted at admission, so everything
    /// downstream may assume them.
    pub fn validate(&self, cluster: &str) -> Result<(), crate::Error> {
        if self.image.trim().is_empty() {
            return Err(crate::Error::validation_for_field(
                cluster,
                "spec.image",
                "image cannot be empty",
            ));
        }

        ConfigDocument::parse(&self.bootstrap_config).map_err(|e| {
            crate::Error::validation_for_field(
                cluster,
                "spec.bootstrapConfig",
                format!("failed to parse bootstrap config: {e}"),
            )
        })?;

        if self.license_payload().is_some() && !self.edition.capabilities().license {
            return Err(crate::Error::validation_for_field(
                cluster,
                "spec.license",
                format!("edition {} does not accept a license", self.edition),
            ));
        }

        let mut seen: HashMap<u16, ListenerSlot> = HashMap::new();
        for (slot, port) in self.listener.ports.enabled() {
            if let Some(other) = seen.insert(port, slot) {
                return Err(crate::Error::validation_for_field(
                    cluster,
                    format!("spec.listener.ports.{}", slot.name()),
                    format!("port {port} is already used by listener {}", other.name()),
                ));
            }
        }

        for (field, replicas) in [
            ("spec.coreTemplate.replicas", self.core_template.replicas),
            ("spec.replicantTemplate.replicas", self.replicant_template.replicas),
        ] {
            if replicas.is_some_and(|r| r < 0) {
                return Err(crate::Error::validation_for_field(
                    cluster,
                    field,
                    "replicas cannot be negative",
                ));
            }
        }

        Ok(())
    }
}

/// Database role of a node group
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DbRole {
    /// Stateful voting member
    Core,
    /// Stateless scale-out member
    Replicant,
}

impl DbRole {
    /// Label value for [`LABEL_DB_ROLE`]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::Replicant => "replicant",
        }
    }
}

impl std::fmt::Display for DbRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EmqxCluster {
    /// Namespace of the cluster, `default` when unset
    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_else(|| "default".to_string())
    }

    /// Capabilities of this cluster's edition
    pub fn capabilities(&self) -> Capabilities {
        self.spec.edition.capabilities()
    }

    /// Headless service used for peer discovery
    pub fn headless_service_name(&self) -> String {
        format!("{}-headless", self.name_any())
    }

    /// Client-facing listener service
    pub fn listener_service_name(&self) -> String {
        self.name_any()
    }

    /// Workload name for a node group
    pub fn workload_name(&self, role: DbRole) -> String {
        format!("{}-{}", self.name_any(), role.as_str())
    }

    /// ConfigMap holding the bootstrap configuration
    pub fn bootstrap_config_name(&self) -> String {
        format!("{}-bootstrap-config", self.name_any())
    }

    /// ConfigMap holding one config bundle
    pub fn bundle_config_map_name(&self, bundle: &ConfigBundle) -> String {
        format!("{}-{}", self.name_any(), bundle.name)
    }

    /// Secret holding the license payload
    pub fn license_secret_name(&self) -> String {
        format!("{}-license", self.name_any())
    }

    /// Data volume (and claim template) name
    pub fn data_volume_name(&self) -> String {
        format!("{}-data", self.name_any())
    }

    /// Log volume (and claim template) name
    pub fn log_volume_name(&self) -> String {
        format!("{}-log", self.name_any())
    }

    /// Labels every pod of this cluster carries
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string()),
            (LABEL_INSTANCE.to_string(), self.name_any()),
        ])
    }

    /// Labels selecting the pods of one node group
    pub fn role_selector_labels(&self, role: DbRole) -> BTreeMap<String, String> {
        let mut labels = self.selector_labels();
        labels.insert(LABEL_DB_ROLE.to_string(), role.as_str().to_string());
        labels
    }

    /// Label selector string matching every pod of this cluster
    pub fn label_selector(&self) -> String {
        selector_string(&self.selector_labels())
    }

    /// Label selector string matching the pods of one node group
    pub fn role_label_selector(&self, role: DbRole) -> String {
        selector_string(&self.role_selector_labels(role))
    }

    /// Node template for a role
    pub fn template(&self, role: DbRole) -> &NodeTemplate {
        match role {
            DbRole::Core => &self.spec.core_template,
            DbRole::Replicant => &self.spec.replicant_template,
        }
    }

    /// Desired replica count for a role
    pub fn desired_replicas(&self, role: DbRole) -> i32 {
        match role {
            DbRole::Core => self
                .spec
                .core_template
                .replicas
                .unwrap_or(DEFAULT_CORE_REPLICAS),
            DbRole::Replicant => self.spec.replicant_template.replicas.unwrap_or(0),
        }
    }

    /// Port the broker's management API listens on inside each pod
    pub fn admin_port(&self) -> u16 {
        let ports = &self.spec.listener.ports;
        [ports.api, ports.dashboard]
            .into_iter()
            .find(|p| *p != 0)
            .unwrap_or(DEFAULT_ADMIN_PORT)
    }
}

fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Status for an EmqxCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmqxClusterStatus {
    /// Generation of the spec last reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Current phase
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Cluster-level conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Broker nodes as reported by the broker, the source of cluster membership
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emqx_nodes: Vec<EmqxNode>,

    /// Ready core replicas
    #[serde(default)]
    pub core_ready_replicas: i32,

    /// Ready replicant replicas
    #[serde(default)]
    pub replicant_ready_replicas: i32,
}
