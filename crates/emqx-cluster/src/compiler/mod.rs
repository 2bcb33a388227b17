//! Desired-state compiler
//!
//! Turns an [`EmqxCluster`] into the full set of objects that should exist
//! for it. Compilation is pure: no I/O, no clock, no randomness. Anything
//! random (the node cookie) was resolved at admission and lives in the spec,
//! so compiling the same resource twice yields identical objects.
//!
//! The compiler is total over every spec that passed admission validation;
//! conflicting ports and similar mistakes are rejected before they get here.

mod config;
mod ports;
mod services;
mod volumes;
mod workload;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;

use emqx_common::crd::{DbRole, EmqxCluster};

pub use config::{compile_config_maps, compile_license_secret, BOOTSTRAP_CONFIG_KEY, LICENSE_KEY};
pub use ports::{compile_ports, merge_env, ListenerPortSet};
pub use services::{compile_headless_service, compile_listener_service, EKKA_PORT};
pub use volumes::{
    compile_volumes, VolumeSet, BOOTSTRAP_CONFIG_MOUNT_PATH, DATA_MOUNT_PATH, LICENSE_MOUNT_PATH,
    LOG_MOUNT_PATH,
};
pub use workload::{compile_core, compile_replicant, BROKER_CONTAINER};

/// Every object managed for one cluster
#[derive(Clone, Debug, PartialEq)]
pub struct CompiledCluster {
    /// Peer discovery service
    pub headless_service: Service,
    /// Client-facing listener service
    pub listener_service: Service,
    /// Bootstrap document first, then the ACL, modules and plugins bundles
    pub config_maps: Vec<ConfigMap>,
    /// License secret, when a payload is declared
    pub license_secret: Option<Secret>,
    /// Core members
    pub core: StatefulSet,
    /// Replicant members
    pub replicant: Deployment,
}

impl CompiledCluster {
    /// Number of objects in the set
    pub fn object_count(&self) -> usize {
        4 + self.config_maps.len() + usize::from(self.license_secret.is_some())
    }
}

/// Compile the desired object set for a cluster
pub fn compile(cluster: &EmqxCluster) -> CompiledCluster {
    let ports = compile_ports(&cluster.spec.listener.ports);
    CompiledCluster {
        headless_service: compile_headless_service(cluster),
        listener_service: compile_listener_service(cluster, &ports),
        config_maps: compile_config_maps(cluster),
        license_secret: compile_license_secret(cluster),
        core: compile_core(cluster, &ports),
        replicant: compile_replicant(cluster, &ports),
    }
}

/// Controller owner reference back to the cluster
///
/// Blocks foreground deletion of the cluster until the owned object is gone.
/// `None` only for a resource that was never persisted (no uid yet).
pub(crate) fn owner_references(cluster: &EmqxCluster) -> Option<Vec<OwnerReference>> {
    cluster.controller_owner_ref(&()).map(|owner| {
        vec![OwnerReference {
            block_owner_deletion: Some(true),
            ..owner
        }]
    })
}

pub(crate) fn object_meta(
    cluster: &EmqxCluster,
    name: String,
    role: Option<DbRole>,
) -> ObjectMeta {
    let labels = match role {
        Some(role) => cluster.role_selector_labels(role),
        None => cluster.selector_labels(),
    };
    ObjectMeta {
        name: Some(name),
        namespace: Some(cluster.namespace_or_default()),
        labels: Some(labels),
        owner_references: owner_references(cluster),
        ..Default::default()
    }
}
