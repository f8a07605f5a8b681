//! API endpoint resolution
//!
//! Decides which address the control plane of a cluster will be reachable at.
//! Resolution is pure: it never touches the cluster, and the node promotion it
//! decides on is applied separately with [`EndpointResolution::apply`].

use crate::model::{K8sCluster, LbCluster, NodeType};
use serde::Serialize;
use std::fmt;

/// Position of a node inside `cluster.info.node_pools`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct NodeRef {
    pub pool: usize,
    pub node: usize,
}

/// Outcome of endpoint resolution
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndpointResolution {
    /// An attached load balancer with the API server role fronts the cluster
    LoadBalancer {
        endpoint: String,
        load_balancer: String,
    },

    /// A control-plane node serves the API; it must carry the api-endpoint role
    Node { endpoint: String, node: NodeRef },

    /// Neither a load balancer nor a master node is available
    Unresolved(EndpointDiagnostic),
}

/// What the resolver looked at before giving up
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointDiagnostic {
    pub cluster: String,
    pub load_balancers_considered: usize,
    pub node_pools_scanned: usize,
    pub nodes_scanned: usize,
    /// Selected load balancer or node whose address is empty
    #[serde(skip_serializing_if = "Option::is_none")]
    pub empty_endpoint_source: Option<String>,
}

impl fmt::Display for EndpointDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.empty_endpoint_source {
            Some(source) => write!(f, "{} has an empty address", source),
            None => write!(
                f,
                "no load balancer with the API server role among {} and no master node among {} nodes in {} node pools",
                self.load_balancers_considered, self.nodes_scanned, self.node_pools_scanned
            ),
        }
    }
}

impl EndpointResolution {
    /// The resolved endpoint, empty when unresolved
    pub fn endpoint(&self) -> &str {
        match self {
            EndpointResolution::LoadBalancer { endpoint, .. } => endpoint,
            EndpointResolution::Node { endpoint, .. } => endpoint,
            EndpointResolution::Unresolved(_) => "",
        }
    }

    /// Node that has to be tagged as api-endpoint, if any
    pub fn promoted_node(&self) -> Option<NodeRef> {
        match self {
            EndpointResolution::Node { node, .. } => Some(*node),
            _ => None,
        }
    }

    /// Why this resolution cannot be used, if it cannot
    ///
    /// A selected load balancer without a DNS endpoint or a node without a
    /// public address is as unusable as no candidate at all.
    pub fn unusable(
        &self,
        cluster: &K8sCluster,
        load_balancers: &[LbCluster],
    ) -> Option<EndpointDiagnostic> {
        let source = match self {
            EndpointResolution::Unresolved(diagnostic) => return Some(diagnostic.clone()),
            _ if !self.endpoint().is_empty() => return None,
            EndpointResolution::LoadBalancer { load_balancer, .. } => {
                format!("load balancer {}", load_balancer)
            }
            EndpointResolution::Node { node, .. } => {
                let name = cluster
                    .info
                    .node_pools
                    .get(node.pool)
                    .and_then(|pool| pool.nodes.get(node.node))
                    .map_or("<unknown>", |n| n.name.as_str());
                format!("node {}", name)
            }
        };

        Some(EndpointDiagnostic {
            cluster: cluster.name().to_string(),
            load_balancers_considered: load_balancers.len(),
            node_pools_scanned: cluster.info.node_pools.len(),
            nodes_scanned: match self {
                EndpointResolution::Node { .. } => cluster
                    .info
                    .node_pools
                    .iter()
                    .map(|pool| pool.nodes.len())
                    .sum(),
                _ => 0,
            },
            empty_endpoint_source: Some(source),
        })
    }

    /// Tag the selected node as api-endpoint
    ///
    /// Idempotent. Returns `true` if a node role actually changed.
    pub fn apply(&self, cluster: &mut K8sCluster) -> bool {
        let Some(node_ref) = self.promoted_node() else {
            return false;
        };

        let Some(node) = cluster
            .info
            .node_pools
            .get_mut(node_ref.pool)
            .and_then(|pool| pool.nodes.get_mut(node_ref.node))
        else {
            return false;
        };

        if node.node_type == NodeType::ApiEndpoint {
            return false;
        }
        node.node_type = NodeType::ApiEndpoint;
        true
    }
}

/// Resolve the API endpoint of `cluster`
///
/// # Priority
/// 1. First load balancer (input order) targeting the cluster with an API server role
/// 2. A node already tagged api-endpoint
/// 3. The first master node in pool-then-node order
///
/// Load balancers are not checked for duplicates; the first match wins.
pub fn resolve_endpoint(cluster: &K8sCluster, load_balancers: &[LbCluster]) -> EndpointResolution {
    let cluster_name = cluster.name();

    if let Some(lb) = load_balancers
        .iter()
        .find(|lb| lb.target_k8s == cluster_name && lb.has_api_server_role())
    {
        return EndpointResolution::LoadBalancer {
            endpoint: lb.dns.endpoint.clone(),
            load_balancer: lb.name.clone(),
        };
    }

    let mut candidate: Option<(NodeRef, NodeType, &str)> = None;
    let mut nodes_scanned = 0;

    for (pool_index, pool) in cluster.info.node_pools.iter().enumerate() {
        for (node_index, node) in pool.nodes.iter().enumerate() {
            nodes_scanned += 1;
            let here = NodeRef {
                pool: pool_index,
                node: node_index,
            };
            match (node.node_type, candidate) {
                // An existing api-endpoint sticks for the rest of the scan
                (_, Some((_, NodeType::ApiEndpoint, _))) => {}
                (NodeType::ApiEndpoint, _) => {
                    candidate = Some((here, NodeType::ApiEndpoint, node.public.as_str()))
                }
                (NodeType::Master, None) => {
                    candidate = Some((here, NodeType::Master, node.public.as_str()))
                }
                _ => {}
            }
        }
    }

    match candidate {
        Some((node_ref, _, public)) => EndpointResolution::Node {
            endpoint: public.to_string(),
            node: node_ref,
        },
        None => EndpointResolution::Unresolved(EndpointDiagnostic {
            cluster: cluster_name.to_string(),
            load_balancers_considered: load_balancers.len(),
            node_pools_scanned: cluster.info.node_pools.len(),
            nodes_scanned,
            empty_endpoint_source: None,
        }),
    }
}

#[cfg(test)]
#[path = "endpoint_test.rs"]
mod tests;
