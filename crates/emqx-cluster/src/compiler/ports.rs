//! Listener port and environment derivation

use k8s_openapi::api::core::v1::{ContainerPort, EnvVar, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use emqx_common::crd::ListenerPorts;

/// Ports and environment derived from the enabled listener slots
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListenerPortSet {
    /// One container port per enabled slot
    pub container_ports: Vec<ContainerPort>,
    /// One TCP service port per enabled slot, targeting the container port
    pub service_ports: Vec<ServicePort>,
    /// One bind override per enabled slot
    pub env: Vec<EnvVar>,
}

/// Derive container ports, service ports and env for every non-zero slot
///
/// Slots are visited in [`emqx_common::crd::ListenerSlot::ALL`] order; a zero
/// port disables the slot and emits nothing.
pub fn compile_ports(ports: &ListenerPorts) -> ListenerPortSet {
    let mut set = ListenerPortSet::default();
    for (slot, port) in ports.enabled() {
        let port = i32::from(port);
        set.container_ports.push(ContainerPort {
            name: Some(slot.name().to_string()),
            container_port: port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });
        set.service_ports.push(ServicePort {
            name: Some(slot.name().to_string()),
            port,
            protocol: Some("TCP".to_string()),
            target_port: Some(IntOrString::Int(port)),
            ..Default::default()
        });
        set.env.push(env_var(slot.env_var(), port.to_string()));
    }
    set
}

/// Merge `overrides` over `base`
///
/// An override replaces the base entry with the same name in place; names
/// unknown to base are appended in override order.
pub fn merge_env(base: &[EnvVar], overrides: &[EnvVar]) -> Vec<EnvVar> {
    let mut merged = base.to_vec();
    for var in overrides {
        match merged.iter_mut().find(|existing| existing.name == var.name) {
            Some(existing) => *existing = var.clone(),
            None => merged.push(var.clone()),
        }
    }
    merged
}

pub(crate) fn env_var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}
