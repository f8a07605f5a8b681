//! Kubeconfig extraction
//!
//! The provisioning tool overwrites the seeded `<cluster>-kubeconfig` file in
//! the working directory. An empty file means the tool produced nothing new.

use crate::build::artifacts::kubeconfig_path;
use kube::config::{Kubeconfig, KubeconfigError};
use std::io;
use std::path::Path;

/// Read the kubeconfig the provisioning tool left behind
///
/// # Returns
/// * `Ok(content)` - raw file content, empty if the tool did not write one
/// * `Err(io::Error)` - the file is missing or unreadable
pub async fn extract_kubeconfig(working_dir: &Path, cluster_name: &str) -> io::Result<String> {
    tokio::fs::read_to_string(kubeconfig_path(working_dir, cluster_name)).await
}

/// What an extracted kubeconfig points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubeconfigSummary {
    pub current_context: Option<String>,
    pub servers: Vec<String>,
}

/// Parse a kubeconfig far enough to report where it points
pub fn describe_kubeconfig(content: &str) -> Result<KubeconfigSummary, KubeconfigError> {
    let kubeconfig = Kubeconfig::from_yaml(content)?;

    Ok(KubeconfigSummary {
        current_context: kubeconfig.current_context,
        servers: kubeconfig
            .clusters
            .into_iter()
            .filter_map(|named| named.cluster.and_then(|cluster| cluster.server))
            .collect(),
    })
}
