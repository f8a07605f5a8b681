//! Declarative cluster model consumed by a build

pub mod cluster;

pub use cluster::{
    BuildId, BuildRequest, ClusterInfo, Dns, K8sCluster, LbCluster, Node, NodePool, NodeType,
    Provider, Role, RoleType,
};
