//! Discovery and listener services

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use emqx_common::crd::EmqxCluster;

use super::object_meta;
use super::ports::ListenerPortSet;

/// Port the broker's clustering protocol listens on
pub const EKKA_PORT: i32 = 4370;

const DEFAULT_SERVICE_TYPE: &str = "ClusterIP";

/// Headless service giving every broker pod a stable DNS name
///
/// Not-ready addresses are published so members can find each other before
/// they report ready.
pub fn compile_headless_service(cluster: &EmqxCluster) -> Service {
    Service {
        metadata: object_meta(cluster, cluster.headless_service_name(), None),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(cluster.selector_labels()),
            ports: Some(vec![ServicePort {
                name: Some("ekka".to_string()),
                port: EKKA_PORT,
                protocol: Some("TCP".to_string()),
                target_port: Some(IntOrString::Int(EKKA_PORT)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Client-facing service exposing every enabled listener
pub fn compile_listener_service(cluster: &EmqxCluster, ports: &ListenerPortSet) -> Service {
    let listener = &cluster.spec.listener;
    Service {
        metadata: object_meta(cluster, cluster.listener_service_name(), None),
        spec: Some(ServiceSpec {
            type_: Some(
                listener
                    .service_type
                    .clone()
                    .unwrap_or_else(|| DEFAULT_SERVICE_TYPE.to_string()),
            ),
            load_balancer_ip: listener.load_balancer_ip.clone(),
            load_balancer_source_ranges: non_empty(&listener.load_balancer_source_ranges),
            external_ips: non_empty(&listener.external_ips),
            selector: Some(cluster.selector_labels()),
            ports: Some(ports.service_ports.clone()),
            ..Default::default()
        }),
        status: None,
    }
}

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    (!values.is_empty()).then(|| values.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ports::compile_ports;
    use crate::compiler::tests::sample_cluster;

    #[test]
    fn headless_service_has_no_cluster_ip() {
        let cluster = sample_cluster("broker");
        let svc = compile_headless_service(&cluster);
        let spec = svc.spec.unwrap();
        assert_eq!(svc.metadata.name.as_deref(), Some("broker-headless"));
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.publish_not_ready_addresses, Some(true));
        assert_eq!(spec.selector, Some(cluster.selector_labels()));
    }

    #[test]
    fn listener_service_defaults_to_cluster_ip() {
        let cluster = sample_cluster("broker");
        let ports = compile_ports(&cluster.spec.listener.ports);
        let spec = compile_listener_service(&cluster, &ports).spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        assert!(spec.load_balancer_source_ranges.is_none());
        assert!(spec.external_ips.is_none());
        assert_eq!(spec.ports.unwrap(), ports.service_ports);
    }

    #[test]
    fn listener_service_honours_exposure_settings() {
        let mut cluster = sample_cluster("broker");
        cluster.spec.listener.service_type = Some("LoadBalancer".to_string());
        cluster.spec.listener.load_balancer_ip = Some("10.0.0.10".to_string());
        cluster.spec.listener.load_balancer_source_ranges = vec!["10.0.0.0/8".to_string()];
        cluster.spec.listener.external_ips = vec!["192.168.1.5".to_string()];

        let ports = compile_ports(&cluster.spec.listener.ports);
        let spec = compile_listener_service(&cluster, &ports).spec.unwrap();

        assert_eq!(spec.type_.as_deref(), Some("LoadBalancer"));
        assert_eq!(spec.load_balancer_ip.as_deref(), Some("10.0.0.10"));
        assert_eq!(
            spec.load_balancer_source_ranges,
            Some(vec!["10.0.0.0/8".to_string()])
        );
        assert_eq!(spec.external_ips, Some(vec!["192.168.1.5".to_string()]));
    }
}
