//! Template view model for the KubeOne manifest
//!
//! Flattens the cluster's node pools into the shape the manifest template
//! consumes. Strings that end up as label values are sanitized first.

use crate::model::{BuildId, K8sCluster, NodeType};
use serde::Serialize;
use std::collections::BTreeMap;

const REGION_LABEL: &str = "topology.kubernetes.io/region";
const ZONE_LABEL: &str = "topology.kubernetes.io/zone";
const NODEPOOL_LABEL: &str = "kube-eleven.io/nodepool";
const PROVIDER_LABEL: &str = "kube-eleven.io/provider";
const PROVIDER_INSTANCE_LABEL: &str = "kube-eleven.io/provider-instance";

/// Data handed to the manifest template
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningView {
    pub cluster_name: String,
    pub kubernetes_version: String,
    pub api_endpoint: String,
    pub nodepools: Vec<NodepoolView>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodepoolView {
    pub name: String,
    pub region: String,
    pub zone: String,
    pub cloud_provider_name: String,
    pub provider_name: String,
    pub nodes: Vec<NodeView>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    /// Name without the `<cluster-name>-<hash>-` prefix
    pub name: String,
    pub public: String,
    pub private: Option<String>,
    pub node_type: NodeType,
    pub control_plane: bool,
    /// Node labels set by the provisioning tool
    pub labels: BTreeMap<String, String>,
}

impl ProvisioningView {
    /// Build the view for `cluster` with an already resolved endpoint
    ///
    /// Pool and node order are preserved.
    pub fn assemble(cluster: &K8sCluster, api_endpoint: &str) -> Self {
        let prefix = cluster.build_id().node_name_prefix();

        let nodepools = cluster
            .info
            .node_pools
            .iter()
            .map(|pool| {
                let mut view = NodepoolView {
                    name: pool.name.clone(),
                    region: sanitise(&pool.region),
                    zone: sanitise(&pool.zone),
                    cloud_provider_name: sanitise(&pool.provider.cloud_provider_name),
                    provider_name: sanitise(&pool.provider.spec_name),
                    nodes: Vec::with_capacity(pool.nodes.len()),
                };
                let labels = view.labels();
                view.nodes = pool
                    .nodes
                    .iter()
                    .map(|node| NodeView {
                        name: strip_prefix(&node.name, &prefix).to_string(),
                        public: node.public.clone(),
                        private: node.private.clone(),
                        node_type: node.node_type,
                        control_plane: node.node_type.is_control_plane(),
                        labels: labels.clone(),
                    })
                    .collect();
                view
            })
            .collect();

        ProvisioningView {
            cluster_name: cluster.name().to_string(),
            kubernetes_version: cluster.kubernetes.clone(),
            api_endpoint: api_endpoint.to_string(),
            nodepools,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodepools.iter().map(|p| p.nodes.len()).sum()
    }
}

impl NodepoolView {
    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (REGION_LABEL.to_string(), self.region.clone()),
            (ZONE_LABEL.to_string(), self.zone.clone()),
            (NODEPOOL_LABEL.to_string(), sanitise(&self.name)),
            (PROVIDER_LABEL.to_string(), self.cloud_provider_name.clone()),
            (PROVIDER_INSTANCE_LABEL.to_string(), self.provider_name.clone()),
        ])
    }
}

/// Display name of a node: the full name without the cluster prefix
///
/// Names without the prefix are returned unchanged.
pub fn display_name<'a>(full_name: &'a str, build_id: &BuildId) -> &'a str {
    strip_prefix(full_name, &build_id.node_name_prefix())
}

fn strip_prefix<'a>(name: &'a str, prefix: &str) -> &'a str {
    name.strip_prefix(prefix).unwrap_or(name)
}

/// Normalize a string into a token usable as a label value
///
/// Lower-cases and replaces every character outside `[a-z0-9-]` with `-`.
pub fn sanitise(value: &str) -> String {
    value
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClusterInfo, Node, NodePool, Provider};

    fn test_cluster() -> K8sCluster {
        K8sCluster {
            info: ClusterInfo {
                name: "c1".to_string(),
                hash: "h1".to_string(),
                private_key: String::new(),
                node_pools: vec![
                    NodePool {
                        name: "control".to_string(),
                        region: "Europe West".to_string(),
                        zone: "europe-west1_b".to_string(),
                        provider: Provider {
                            cloud_provider_name: "GCP".to_string(),
                            spec_name: "gcp.Prod".to_string(),
                        },
                        nodes: vec![Node {
                            name: "c1-h1-control-1".to_string(),
                            public: "1.2.3.4".to_string(),
                            private: Some("192.168.2.1".to_string()),
                            node_type: NodeType::ApiEndpoint,
                        }],
                    },
                    NodePool {
                        name: "compute".to_string(),
                        region: "eu-central".to_string(),
                        zone: "nbg1".to_string(),
                        provider: Provider {
                            cloud_provider_name: "hetzner".to_string(),
                            spec_name: "hetzner-1".to_string(),
                        },
                        nodes: vec![
                            Node {
                                name: "c1-h1-compute-1".to_string(),
                                public: "5.6.7.8".to_string(),
                                private: None,
                                node_type: NodeType::Worker,
                            },
                            Node {
                                name: "legacy-worker".to_string(),
                                public: "5.6.7.9".to_string(),
                                private: None,
                                node_type: NodeType::Worker,
                            },
                        ],
                    },
                ],
            },
            kubernetes: "v1.30.2".to_string(),
            kubeconfig: String::new(),
        }
    }

    #[test]
    fn test_assemble_preserves_order_and_strips_names() {
        let view = ProvisioningView::assemble(&test_cluster(), "1.2.3.4");

        assert_eq!(view.cluster_name, "c1");
        assert_eq!(view.kubernetes_version, "v1.30.2");
        assert_eq!(view.api_endpoint, "1.2.3.4");
        assert_eq!(view.node_count(), 3);

        let names: Vec<_> = view
            .nodepools
            .iter()
            .flat_map(|p| p.nodes.iter().map(|n| n.name.as_str()))
            .collect();
        assert_eq!(names, vec!["control-1", "compute-1", "legacy-worker"]);

        assert!(view.nodepools[0].nodes[0].control_plane);
        assert!(!view.nodepools[1].nodes[0].control_plane);
    }

    #[test]
    fn test_assemble_sanitises_identifiers() {
        let view = ProvisioningView::assemble(&test_cluster(), "1.2.3.4");
        let control = &view.nodepools[0];

        assert_eq!(control.name, "control");
        assert_eq!(control.region, "europe-west");
        assert_eq!(control.zone, "europe-west1-b");
        assert_eq!(control.cloud_provider_name, "gcp");
        assert_eq!(control.provider_name, "gcp-prod");

        let labels = &control.nodes[0].labels;
        assert_eq!(labels[REGION_LABEL], "europe-west");
        assert_eq!(labels[ZONE_LABEL], "europe-west1-b");
        assert_eq!(labels[NODEPOOL_LABEL], "control");
        assert_eq!(labels[PROVIDER_LABEL], "gcp");
        assert_eq!(labels[PROVIDER_INSTANCE_LABEL], "gcp-prod");
    }

    #[test]
    fn test_display_name_is_idempotent() {
        let id = BuildId::new("c1", "h1");

        let once = display_name("c1-h1-control-1", &id);
        assert_eq!(once, "control-1");
        assert_eq!(display_name(once, &id), once);
        assert_eq!(display_name("other-h1-control-1", &id), "other-h1-control-1");
    }

    #[test]
    fn test_sanitise() {
        assert_eq!(sanitise("eu-central-1"), "eu-central-1");
        assert_eq!(sanitise("US East (Ohio)"), "us-east--ohio-");
        assert_eq!(sanitise(""), "");
    }
}
