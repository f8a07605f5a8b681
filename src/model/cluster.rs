use serde::{Deserialize, Serialize};
use std::fmt;

/// Kubernetes cluster to be provisioned by KubeOne
///
/// `kubeconfig` is the only field a build writes back: it is replaced with the
/// credential produced by the provisioning tool.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct K8sCluster {
    /// Identity, key material and node pools
    pub info: ClusterInfo,

    /// Kubernetes version (e.g., "v1.30.2")
    pub kubernetes: String,

    /// Current kubeconfig of the cluster (empty before the first build)
    #[serde(default)]
    pub kubeconfig: String,
}

impl K8sCluster {
    /// Identifier of a build for this cluster: `<name>-<hash>`
    pub fn build_id(&self) -> BuildId {
        BuildId::new(&self.info.name, &self.info.hash)
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfo {
    pub name: String,

    /// Content hash disambiguating re-provisioned instances of the same name
    pub hash: String,

    /// SSH private key used by the provisioning tool to reach the nodes
    #[serde(default)]
    pub private_key: String,

    #[serde(default)]
    pub node_pools: Vec<NodePool>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePool {
    pub name: String,
    pub region: String,
    pub zone: String,
    pub provider: Provider,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    /// Cloud provider identifier (e.g., "hetzner", "gcp")
    pub cloud_provider_name: String,

    /// Name of the provider account as written in the user configuration
    pub spec_name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Full node name, prefixed with `<cluster-name>-<hash>-`
    pub name: String,

    /// Public address
    pub public: String,

    /// Private address inside the cluster network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<String>,

    #[serde(default)]
    pub node_type: NodeType,
}

/// Role tag of a node
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum NodeType {
    #[default]
    Worker,
    Master,
    /// Master that serves as the cluster API endpoint
    ApiEndpoint,
}

impl NodeType {
    /// Masters and the API endpoint node both run the control plane
    pub fn is_control_plane(self) -> bool {
        matches!(self, NodeType::Master | NodeType::ApiEndpoint)
    }
}

/// Load-balancer cluster that may front a Kubernetes cluster
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LbCluster {
    pub name: String,

    /// Name of the Kubernetes cluster this load balancer serves
    #[serde(rename = "targetedK8s")]
    pub target_k8s: String,

    pub dns: Dns,

    #[serde(default)]
    pub roles: Vec<Role>,
}

impl LbCluster {
    pub fn has_api_server_role(&self) -> bool {
        self.roles.iter().any(|r| r.role_type == RoleType::ApiServer)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Dns {
    pub endpoint: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    #[serde(default)]
    pub name: String,
    pub role_type: RoleType,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RoleType {
    ApiServer,
    Ingress,
}

/// Identifier of one provisioning attempt
///
/// Formats as `<cluster-name>-<hash>` and names the build's working directory.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BuildId {
    name: String,
    hash: String,
}

impl BuildId {
    pub fn new(name: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hash: hash.into(),
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.name
    }

    /// Prefix carried by every full node name of the cluster
    pub fn node_name_prefix(&self) -> String {
        format!("{}-{}-", self.name, self.hash)
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.hash)
    }
}

/// On-disk descriptor handed to the binary: a cluster and the load balancers
/// attached to it
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    pub cluster: K8sCluster,

    #[serde(default)]
    pub load_balancers: Vec<LbCluster>,
}

#[cfg(test)]
#[path = "cluster_test.rs"]
mod tests;
