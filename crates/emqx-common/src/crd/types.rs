//! Shared types for the EmqxCluster CRD

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    EnvVar, PersistentVolumeClaimSpec, ResourceRequirements, Toleration,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Broker distribution
///
/// The edition is a capability tag: callers ask [`Edition::capabilities`]
/// what the variant supports instead of branching on the variant itself.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum Edition {
    /// Open-source broker
    #[default]
    Open,
    /// License-bearing broker with rebalance support
    Enterprise,
}

impl Edition {
    /// Capabilities available for this edition
    pub fn capabilities(self) -> Capabilities {
        match self {
            Self::Open => Capabilities::default(),
            Self::Enterprise => Capabilities {
                rebalance_check: true,
                license: true,
            },
        }
    }
}

impl std::fmt::Display for Edition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "Open"),
            Self::Enterprise => write!(f, "Enterprise"),
        }
    }
}

/// Optional features a broker edition supports
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Broker exposes the load-rebalance availability check
    pub rebalance_check: bool,
    /// Broker accepts a license payload
    pub license: bool,
}

/// Named listener slots, iterated in a fixed order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ListenerSlot {
    /// Plaintext MQTT
    Mqtt,
    /// MQTT over TLS
    Mqtts,
    /// MQTT over websocket
    Ws,
    /// MQTT over secure websocket
    Wss,
    /// Dashboard HTTP listener
    Dashboard,
    /// Management REST API listener
    Api,
}

impl ListenerSlot {
    /// Every slot, in the order ports and environment are emitted
    pub const ALL: [ListenerSlot; 6] = [
        Self::Mqtt,
        Self::Mqtts,
        Self::Ws,
        Self::Wss,
        Self::Dashboard,
        Self::Api,
    ];

    /// Port name used on containers and services
    pub fn name(self) -> &'static str {
        match self {
            Self::Mqtt => "mqtt",
            Self::Mqtts => "mqtts",
            Self::Ws => "ws",
            Self::Wss => "wss",
            Self::Dashboard => "dashboard",
            Self::Api => "api",
        }
    }

    /// Environment override the broker reads the bind port from
    pub fn env_var(self) -> &'static str {
        match self {
            Self::Mqtt => "EMQX_LISTENER__TCP__EXTERNAL",
            Self::Mqtts => "EMQX_LISTENER__SSL__EXTERNAL",
            Self::Ws => "EMQX_LISTENER__WS__EXTERNAL",
            Self::Wss => "EMQX_LISTENER__WSS__EXTERNAL",
            Self::Dashboard => "EMQX_DASHBOARD__LISTENER__HTTP",
            Self::Api => "EMQX_MANAGEMENT__LISTENER__HTTP",
        }
    }
}

/// Port number per listener slot; zero disables the listener
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ListenerPorts {
    /// Plaintext MQTT port
    #[serde(default)]
    pub mqtt: u16,
    /// MQTT over TLS port
    #[serde(default)]
    pub mqtts: u16,
    /// Websocket port
    #[serde(default)]
    pub ws: u16,
    /// Secure websocket port
    #[serde(default)]
    pub wss: u16,
    /// Dashboard port
    #[serde(default)]
    pub dashboard: u16,
    /// Management API port
    #[serde(default)]
    pub api: u16,
}

impl ListenerPorts {
    /// Declared port for a slot, zero when disabled
    pub fn port(&self, slot: ListenerSlot) -> u16 {
        match slot {
            ListenerSlot::Mqtt => self.mqtt,
            ListenerSlot::Mqtts => self.mqtts,
            ListenerSlot::Ws => self.ws,
            ListenerSlot::Wss => self.wss,
            ListenerSlot::Dashboard => self.dashboard,
            ListenerSlot::Api => self.api,
        }
    }

    /// Enabled slots with their ports, in [`ListenerSlot::ALL`] order
    pub fn enabled(&self) -> impl Iterator<Item = (ListenerSlot, u16)> + '_ {
        ListenerSlot::ALL
            .into_iter()
            .map(|slot| (slot, self.port(slot)))
            .filter(|(_, port)| *port != 0)
    }
}

/// Service exposure for the listener endpoint
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListenerSpec {
    /// Service type (ClusterIP, NodePort, LoadBalancer)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    /// Requested load balancer IP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer_ip: Option<String>,
    /// Source ranges allowed through the load balancer
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub load_balancer_source_ranges: Vec<String>,
    /// External IPs routed to the service
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_ips: Vec<String>,
    /// Ports per listener slot
    #[serde(default)]
    pub ports: ListenerPorts,
}

/// Pod template for one node group
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeTemplate {
    /// Desired replica count; unset replicant replicas are defaulted at admission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Labels added to pods of this group
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations added to pods of this group
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Container resource requests and limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    /// Environment merged over the derived listener environment
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    /// Node selector for scheduling
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    /// Tolerations for scheduling
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
}

/// A named configuration file mounted into broker pods
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigBundle {
    /// Bundle name, also the key inside its ConfigMap
    pub name: String,
    /// File content
    #[serde(default)]
    pub content: String,
    /// Directory or file path the bundle is mounted at
    pub mount_path: String,
    /// File name inside the mount
    pub sub_path: String,
}

impl ConfigBundle {
    /// Default ACL rules bundle
    pub fn default_acl() -> Self {
        Self {
            name: "acl".to_string(),
            content: "{allow, all}.\n".to_string(),
            mount_path: "/opt/emqx/etc/acl.conf".to_string(),
            sub_path: "acl.conf".to_string(),
        }
    }

    /// Default preloaded modules bundle
    pub fn default_modules() -> Self {
        Self {
            name: "loaded-modules".to_string(),
            content: String::new(),
            mount_path: "/opt/emqx/data/loaded_modules".to_string(),
            sub_path: "loaded_modules".to_string(),
        }
    }

    /// Default preloaded plugins bundle
    pub fn default_plugins() -> Self {
        Self {
            name: "loaded-plugins".to_string(),
            content: String::new(),
            mount_path: "/opt/emqx/data/loaded_plugins".to_string(),
            sub_path: "loaded_plugins".to_string(),
        }
    }
}

/// Persistent storage for core members
///
/// Absent storage means data and log volumes are ephemeral.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Claim template applied to both the data and the log claim
    pub volume_claim_template: PersistentVolumeClaimSpec,
}

/// Broker node as reported by the broker's own membership view
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EmqxNode {
    /// Opaque node identity, e.g. `emqx@broker-core-0.broker-headless.default.svc.cluster.local`
    pub node: String,
    /// Broker-side node status (running, stopped)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_status: Option<String>,
    /// Database role (core, replicant)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Broker version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Cluster lifecycle phase
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ClusterPhase {
    /// Nothing has been applied yet
    #[default]
    Pending,
    /// Workloads exist but not every replica is ready
    Provisioning,
    /// Every desired replica is ready and joined
    Running,
    /// Ready core pods are missing from the broker's membership
    Degraded,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Provisioning => write!(f, "Provisioning"),
            Self::Running => write!(f, "Running"),
            Self::Degraded => write!(f, "Degraded"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl ConditionStatus {
    /// Wire representation used in core/v1 conditions
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kubernetes-style condition for cluster status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Keep the previous transition time when the status did not change
    pub fn preserving_transition(mut self, previous: Option<&Condition>) -> Self {
        if let Some(prev) = previous {
            if prev.status == self.status {
                self.last_transition_time = prev.last_transition_time;
            }
        }
        self
    }
}
