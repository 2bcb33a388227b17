//! Custom Resource Definitions for the EMQX operator

mod cluster;
mod types;

pub use cluster::{
    DbRole, EmqxCluster, EmqxClusterSpec, EmqxClusterStatus, DEFAULT_ADMIN_PORT,
    DEFAULT_CORE_REPLICAS,
};
pub use types::{
    Capabilities, ClusterPhase, Condition, ConditionStatus, ConfigBundle, Edition, EmqxNode,
    ListenerPorts, ListenerSlot, ListenerSpec, NodeTemplate, StorageSpec,
};
