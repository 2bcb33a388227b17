//! Broker-reported cluster membership

use std::collections::HashSet;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde::Deserialize;
use tracing::{debug, warn};

use emqx_common::crd::{DbRole, EmqxCluster, EmqxNode};
use emqx_common::hocon::AdminCredentials;
use emqx_common::kube_utils::pod_containers_ready;
use emqx_common::{Error, LABEL_DB_ROLE};

use crate::tunnel::{AdminRequest, BrokerAdmin, PodTarget};

/// Pod name embedded in a broker node identity
///
/// Identities look like `emqx@broker-core-0.broker-headless.ns.svc.cluster.local`:
/// the pod name is the host part up to the first dot. Identities without
/// `@` are treated as a bare host. Every input maps to some name.
pub fn extract_pod_name(node: &str) -> &str {
    let host = node.split_once('@').map_or(node, |(_, host)| host);
    host.split('.').next().unwrap_or(host)
}

/// Names of the pods the broker reports as members
pub fn member_pod_names(nodes: &[EmqxNode]) -> HashSet<String> {
    nodes
        .iter()
        .map(|n| extract_pod_name(&n.node).to_string())
        .collect()
}

/// Outcome of asking the broker for its membership
#[derive(Clone, Debug, PartialEq)]
pub enum MembershipQuery {
    /// The broker answered with its node list
    Members(Vec<EmqxNode>),
    /// No ready core pod to ask yet
    NoReadyCore,
    /// The broker answered with a non-success status
    Unavailable(u16),
}

#[derive(Deserialize)]
struct NodeInfo {
    node: String,
    #[serde(default)]
    node_status: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NodesBody {
    List(Vec<NodeInfo>),
    Wrapped { data: Vec<NodeInfo> },
}

impl From<NodeInfo> for EmqxNode {
    fn from(info: NodeInfo) -> Self {
        EmqxNode {
            node: info.node,
            node_status: info.node_status,
            role: info.role,
            version: info.version,
        }
    }
}

/// Decode a `/nodes` response body into node descriptors
///
/// Accepts both a bare list and a `{"data": [...]}` envelope.
pub fn parse_nodes(body: &[u8]) -> Result<Vec<EmqxNode>, Error> {
    let parsed: NodesBody = serde_json::from_slice(body)
        .map_err(|e| Error::serialization_for_kind("nodes", e.to_string()))?;
    let nodes = match parsed {
        NodesBody::List(nodes) | NodesBody::Wrapped { data: nodes } => nodes,
    };
    let mut nodes: Vec<EmqxNode> = nodes.into_iter().map(EmqxNode::from).collect();
    nodes.sort_by(|a, b| a.node.cmp(&b.node));
    Ok(nodes)
}

/// First platform-ready core pod by name, the one membership is read from
pub fn pick_ready_core(pods: &[Pod]) -> Option<&Pod> {
    pods.iter()
        .filter(|p| {
            p.labels().get(LABEL_DB_ROLE).map(String::as_str) == Some(DbRole::Core.as_str())
        })
        .filter(|p| pod_containers_ready(p))
        .min_by_key(|p| p.name_any())
}

/// Ask a ready core pod for the broker's member list
pub async fn query_membership(
    cluster: &EmqxCluster,
    pods: &[Pod],
    admin: &dyn BrokerAdmin,
    api_version: &str,
    credentials: &AdminCredentials,
) -> Result<MembershipQuery, Error> {
    let Some(pod) = pick_ready_core(pods) else {
        debug!("no ready core pod, membership unknown");
        return Ok(MembershipQuery::NoReadyCore);
    };

    let target = PodTarget::new(
        cluster.namespace_or_default(),
        pod.name_any(),
        cluster.admin_port(),
    );
    let request = AdminRequest::get(format!("/api/{api_version}/nodes"), credentials.clone());
    let response = admin.request(&target, &request).await?;

    if !response.is_success() {
        warn!(
            pod = %target.pod,
            status = response.status.as_u16(),
            "broker refused membership query"
        );
        return Ok(MembershipQuery::Unavailable(response.status.as_u16()));
    }

    Ok(MembershipQuery::Members(parse_nodes(&response.body)?))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::compiler::tests::sample_cluster;
    use crate::tunnel::{AdminResponse, MockBrokerAdmin};
    use bytes::Bytes;
    use http::StatusCode;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use rstest::rstest;

    pub(crate) fn pod(name: &str, role: DbRole, ready: bool) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.labels = Some(
            [(LABEL_DB_ROLE.to_string(), role.as_str().to_string())].into(),
        );
        pod.status = Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "ContainersReady".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        pod
    }

    fn creds() -> AdminCredentials {
        AdminCredentials::default()
    }

    mod extraction {
        use super::*;

        #[rstest]
        #[case("emqx@broker-core-0.broker-headless.ns.svc.cluster.local", "broker-core-0")]
        #[case("emqx@broker-replicant-7d9f-abcde.broker-headless", "broker-replicant-7d9f-abcde")]
        #[case("emqx@broker-core-1", "broker-core-1")]
        #[case("broker-core-2.broker-headless", "broker-core-2")]
        #[case("emqx@10.0.0.12", "10")]
        #[case("emqx@", "")]
        #[case("", "")]
        #[case("a@b@c.d", "b@c")]
        fn extracts_pod_name(#[case] node: &str, #[case] expected: &str) {
            assert_eq!(extract_pod_name(node), expected);
        }

        #[test]
        fn member_names_deduplicate() {
            let nodes = vec![
                EmqxNode {
                    node: "emqx@broker-core-0.x".to_string(),
                    ..Default::default()
                },
                EmqxNode {
                    node: "emqx@broker-core-0.y".to_string(),
                    ..Default::default()
                },
            ];
            assert_eq!(member_pod_names(&nodes).len(), 1);
        }
    }

    mod parsing {
        use super::*;

        #[test]
        fn bare_list_is_parsed_and_sorted() {
            let body = br#"[
                {"node":"emqx@b.h","node_status":"running","role":"replicant","version":"5.1.0"},
                {"node":"emqx@a.h","node_status":"running","role":"core","version":"5.1.0","uptime":12}
            ]"#;
            let nodes = parse_nodes(body).unwrap();
            assert_eq!(nodes.len(), 2);
            assert_eq!(nodes[0].node, "emqx@a.h");
            assert_eq!(nodes[0].role.as_deref(), Some("core"));
        }

        #[test]
        fn data_envelope_is_parsed() {
            let body = br#"{"code":0,"data":[{"node":"emqx@a.h","node_status":"Running"}]}"#;
            let nodes = parse_nodes(body).unwrap();
            assert_eq!(nodes[0].node_status.as_deref(), Some("Running"));
        }

        #[test]
        fn garbage_is_a_serialization_error() {
            assert!(matches!(
                parse_nodes(b"<html>"),
                Err(Error::Serialization { .. })
            ));
        }
    }

    mod query {
        use super::*;

        #[test]
        fn picks_first_ready_core_by_name() {
            let pods = vec![
                pod("broker-core-2", DbRole::Core, true),
                pod("broker-core-0", DbRole::Core, false),
                pod("broker-core-1", DbRole::Core, true),
                pod("broker-replicant-a", DbRole::Replicant, true),
            ];
            assert_eq!(pick_ready_core(&pods).unwrap().name_any(), "broker-core-1");
        }

        #[tokio::test]
        async fn no_ready_core_skips_the_call() {
            let cluster = sample_cluster("broker");
            let admin = MockBrokerAdmin::new();
            let pods = vec![pod("broker-core-0", DbRole::Core, false)];

            let result = query_membership(&cluster, &pods, &admin, "v5", &creds())
                .await
                .unwrap();
            assert_eq!(result, MembershipQuery::NoReadyCore);
        }

        #[tokio::test]
        async fn asks_ready_core_on_admin_port() {
            let cluster = sample_cluster("broker");
            let mut admin = MockBrokerAdmin::new();
            admin
                .expect_request()
                .withf(|target, request| {
                    target.pod == "broker-core-0"
                        && target.namespace == "brokers"
                        && target.port == 18083
                        && request.path == "/api/v5/nodes"
                })
                .times(1)
                .returning(|_, _| {
                    Ok(AdminResponse {
                        status: StatusCode::OK,
                        body: Bytes::from_static(br#"[{"node":"emqx@broker-core-0.h"}]"#),
                    })
                });

            let pods = vec![pod("broker-core-0", DbRole::Core, true)];
            let result = query_membership(&cluster, &pods, &admin, "v5", &creds())
                .await
                .unwrap();

            match result {
                MembershipQuery::Members(nodes) => assert_eq!(nodes.len(), 1),
                other => panic!("expected members, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn refusal_is_unavailable_not_error() {
            let cluster = sample_cluster("broker");
            let mut admin = MockBrokerAdmin::new();
            admin.expect_request().returning(|_, _| {
                Ok(AdminResponse {
                    status: StatusCode::UNAUTHORIZED,
                    body: Bytes::new(),
                })
            });

            let pods = vec![pod("broker-core-0", DbRole::Core, true)];
            let result = query_membership(&cluster, &pods, &admin, "v5", &creds())
                .await
                .unwrap();
            assert_eq!(result, MembershipQuery::Unavailable(401));
        }

        #[tokio::test]
        async fn transport_failure_propagates() {
            let cluster = sample_cluster("broker");
            let mut admin = MockBrokerAdmin::new();
            admin
                .expect_request()
                .returning(|t, _| Err(Error::tunnel(&t.pod, t.port, "connection refused")));

            let pods = vec![pod("broker-core-0", DbRole::Core, true)];
            let err = query_membership(&cluster, &pods, &admin, "v5", &creds())
                .await
                .unwrap_err();
            assert!(err.is_transport());
        }
    }
}
