use anyhow::Context;
use clap::Parser;
use kube_eleven::build::RetentionPolicy;
use kube_eleven::config::{BuildConfig, DEFAULT_KUBEONE_BIN};
use kube_eleven::model::BuildRequest;
use kube_eleven::{BuildError, BuildOutcome, ClusterBuilder};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Provision a Kubernetes cluster with KubeOne and store its kubeconfig
#[derive(Debug, Parser)]
#[command(name = "kube-eleven", version)]
pub struct Args {
    /// Cluster descriptor (YAML or JSON) with the cluster and its load balancers
    #[arg(env = "KUBE_ELEVEN_DESCRIPTOR")]
    pub descriptor: PathBuf,

    /// Where to write the updated descriptor; defaults to the input file
    #[arg(long, short, env = "KUBE_ELEVEN_OUTPUT")]
    pub output: Option<PathBuf>,

    /// Directory holding the per-build working directories
    #[arg(long, env = "KUBE_ELEVEN_BASE_DIR", default_value = ".")]
    pub base_dir: PathBuf,

    #[arg(long, env = "KUBE_ELEVEN_KUBEONE_BIN", default_value = DEFAULT_KUBEONE_BIN)]
    pub kubeone_bin: PathBuf,

    /// Kill `kubeone apply` after this many seconds
    #[arg(long, env = "KUBE_ELEVEN_APPLY_TIMEOUT", value_name = "SECS")]
    pub apply_timeout: Option<u64>,

    /// Remove the working directory of failed builds too
    #[arg(long, env = "KUBE_ELEVEN_CLEANUP_ON_FAILURE")]
    pub cleanup_on_failure: bool,

    /// Handlebars template replacing the built-in KubeOne manifest
    #[arg(long, env = "KUBE_ELEVEN_MANIFEST_TEMPLATE")]
    pub manifest_template: Option<PathBuf>,

    /// Write build metrics in Prometheus text format to this file
    #[arg(long, env = "KUBE_ELEVEN_METRICS_FILE")]
    pub metrics_file: Option<PathBuf>,
}

impl Args {
    pub fn build_config(&self) -> BuildConfig {
        BuildConfig {
            base_dir: self.base_dir.clone(),
            kubeone_bin: self.kubeone_bin.clone(),
            apply_timeout: self.apply_timeout.map(Duration::from_secs),
            retention: if self.cleanup_on_failure {
                RetentionPolicy::RemoveAlways
            } else {
                RetentionPolicy::RetainOnFailure
            },
            manifest_template: self.manifest_template.clone(),
        }
    }

    pub fn output_path(&self) -> &Path {
        self.output.as_deref().unwrap_or(&self.descriptor)
    }
}

pub fn read_request(path: &Path) -> anyhow::Result<BuildRequest> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read descriptor {}", path.display()))?;
    // JSON descriptors parse as YAML too
    serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse descriptor {}", path.display()))
}

pub fn write_request(path: &Path, request: &BuildRequest) -> anyhow::Result<()> {
    let content = if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::to_string_pretty(request)?
    } else {
        serde_yaml::to_string(request)?
    };
    std::fs::write(path, content)
        .with_context(|| format!("failed to write descriptor {}", path.display()))
}

/// Persist `request` for a finished build and pass its result on
///
/// A build that failed only while cleaning up has already updated the
/// cluster, so the descriptor is written before the error is returned.
pub fn finish(
    output: &Path,
    request: &BuildRequest,
    result: Result<BuildOutcome, BuildError>,
) -> anyhow::Result<BuildOutcome> {
    match result {
        Ok(outcome) => {
            write_request(output, request)?;
            info!(
                cluster = %outcome.build_id,
                endpoint = %outcome.api_endpoint,
                output = %output.display(),
                "Descriptor updated"
            );
            Ok(outcome)
        }
        Err(err) if err.cluster_updated() => {
            write_request(output, request)?;
            warn!(
                cluster = %err.build_id,
                output = %output.display(),
                error = %err,
                "Descriptor updated, but the working directory was not cleaned up"
            );
            Err(err.into())
        }
        Err(err) => Err(err.into()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(descriptor = %args.descriptor.display(), "Starting kube-eleven");

    let mut request = read_request(&args.descriptor)?;
    let builder =
        ClusterBuilder::from_config(&args.build_config()).context("invalid configuration")?;

    // Ctrl-C cancels the running build; the provisioning tool is killed
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling build");
                cancel.cancel();
            }
        }
    });

    let result = builder
        .build(&mut request.cluster, &request.load_balancers, &cancel)
        .await;

    if let Some(path) = &args.metrics_file {
        match builder.metrics().encode() {
            Ok(metrics) => {
                if let Err(e) = std::fs::write(path, metrics) {
                    warn!(error = %e, path = %path.display(), "Failed to write metrics file");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode metrics"),
        }
    }

    finish(args.output_path(), &request, result)?;
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
