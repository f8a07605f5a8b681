//! Cluster build orchestration
//!
//! A build walks `Idle -> Preparing -> Rendering -> Provisioning ->
//! ExtractingCredential -> CleaningUp -> Done`. Any failure aborts the build
//! and is returned as a [`BuildError`] naming the stage it happened in; the
//! working directory is then left to its [`RetentionPolicy`].

use crate::build::artifacts::{kubeconfig_path, ArtifactError, RetentionPolicy, WorkingDir};
use crate::build::credentials::{describe_kubeconfig, extract_kubeconfig};
use crate::build::endpoint::{resolve_endpoint, EndpointDiagnostic};
use crate::build::events::{BuildEventKind, BuildEventSink};
use crate::build::metrics::BuildMetrics;
use crate::build::provisioner::{KubeOne, Provisioner, ProvisionerError};
use crate::build::template::{ManifestTemplate, TemplateError};
use crate::build::view::ProvisioningView;
use crate::config::{BuildConfig, ConfigError};
use crate::model::{BuildId, K8sCluster, LbCluster};
use serde_json::json;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Build lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum BuildStage {
    #[default]
    Idle,
    Preparing,
    Rendering,
    Provisioning,
    ExtractingCredential,
    CleaningUp,
    Done,
    Failed,
}

impl BuildStage {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildStage::Idle => "Idle",
            BuildStage::Preparing => "Preparing",
            BuildStage::Rendering => "Rendering",
            BuildStage::Provisioning => "Provisioning",
            BuildStage::ExtractingCredential => "ExtractingCredential",
            BuildStage::CleaningUp => "CleaningUp",
            BuildStage::Done => "Done",
            BuildStage::Failed => "Failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BuildStage::Done | BuildStage::Failed)
    }
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum BuildErrorKind {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("file operation on {path} failed: {source}")]
    FileIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    ExternalTool(#[from] ProvisionerError),

    #[error("no usable API endpoint for cluster {}: {}", .diagnostic.cluster, .diagnostic)]
    Configuration { diagnostic: EndpointDiagnostic },
}

impl From<ArtifactError> for BuildErrorKind {
    fn from(err: ArtifactError) -> Self {
        match err {
            ArtifactError::Io { path, source, .. } => BuildErrorKind::FileIo { path, source },
            ArtifactError::InUse { path } => BuildErrorKind::FileIo {
                path,
                source: io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "working directory is in use by a running build",
                ),
            },
            ArtifactError::Template(e) => BuildErrorKind::Template(e),
        }
    }
}

/// Failed build
#[derive(Debug, Error)]
#[error("build {build_id} failed during {stage}")]
pub struct BuildError {
    pub build_id: BuildId,
    /// Stage that was running when the build failed
    pub stage: BuildStage,
    /// Working directory, if one had been created
    pub working_dir: Option<PathBuf>,
    #[source]
    pub kind: BuildErrorKind,
}

impl BuildError {
    fn new(
        build_id: &BuildId,
        stage: BuildStage,
        working_dir: Option<&Path>,
        kind: impl Into<BuildErrorKind>,
    ) -> Self {
        Self {
            build_id: build_id.clone(),
            stage,
            working_dir: working_dir.map(Path::to_path_buf),
            kind: kind.into(),
        }
    }

    /// Resolver diagnostic of a configuration failure
    pub fn diagnostic(&self) -> Option<&EndpointDiagnostic> {
        match &self.kind {
            BuildErrorKind::Configuration { diagnostic } => Some(diagnostic),
            _ => None,
        }
    }

    /// The cluster was provisioned and already carries its new state
    ///
    /// Only cleanup failed: the node promotion and the extracted kubeconfig
    /// have been applied and must be persisted like on success.
    pub fn cluster_updated(&self) -> bool {
        self.stage == BuildStage::CleaningUp
    }

    /// Exit code of the provisioning tool, if it ran and failed
    pub fn exit_code(&self) -> Option<i32> {
        match &self.kind {
            BuildErrorKind::ExternalTool(e) => e.exit_code(),
            _ => None,
        }
    }
}

/// Result of a successful build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    pub build_id: BuildId,
    pub api_endpoint: String,
    /// A master node was tagged as api-endpoint by this build
    pub promoted_node: bool,
    /// The cluster's kubeconfig was replaced
    pub kubeconfig_updated: bool,
}

/// Runs cluster builds
///
/// One builder can run any number of builds; builds for distinct clusters may
/// run concurrently.
pub struct ClusterBuilder {
    provisioner: Arc<dyn Provisioner>,
    template: ManifestTemplate,
    base_dir: PathBuf,
    retention: RetentionPolicy,
    events: BuildEventSink,
    metrics: BuildMetrics,
}

impl ClusterBuilder {
    /// Builder running `kubeone` as configured
    ///
    /// The event sink is configured from the environment.
    pub fn from_config(config: &BuildConfig) -> Result<Self, ConfigError> {
        let kubeone = KubeOne::new(config.kubeone_bin.clone()).with_timeout(config.apply_timeout);
        Self::with_provisioner(config, Arc::new(kubeone))
    }

    /// Builder delegating provisioning to `provisioner`
    pub fn with_provisioner(
        config: &BuildConfig,
        provisioner: Arc<dyn Provisioner>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            provisioner,
            template: config.load_template()?,
            base_dir: config.base_dir.clone(),
            retention: config.retention,
            events: BuildEventSink::new(),
            metrics: BuildMetrics::new()?,
        })
    }

    pub fn with_event_sink(mut self, events: BuildEventSink) -> Self {
        self.events = events;
        self
    }

    pub fn metrics(&self) -> &BuildMetrics {
        &self.metrics
    }

    /// Provision `cluster` and store the resulting kubeconfig on it
    ///
    /// On success the cluster may have one master promoted to api-endpoint and
    /// carries the new kubeconfig, unless the tool produced an empty one.
    pub async fn build(
        &self,
        cluster: &mut K8sCluster,
        load_balancers: &[LbCluster],
        cancel: &CancellationToken,
    ) -> Result<BuildOutcome, BuildError> {
        let build_id = cluster.build_id();
        let started = Instant::now();

        info!(
            cluster = %build_id,
            node_pools = cluster.info.node_pools.len(),
            load_balancers = load_balancers.len(),
            "Starting cluster build"
        );
        self.emit(
            BuildEventKind::Started,
            &build_id,
            json!({
                "cluster": cluster.name(),
                "kubernetes": cluster.kubernetes,
                "nodePools": cluster.info.node_pools.len(),
                "loadBalancers": load_balancers.len(),
            }),
        )
        .await;

        self.metrics.builds_in_flight.inc();
        let result = self.run(&build_id, cluster, load_balancers, cancel).await;
        self.metrics.builds_in_flight.dec();

        let elapsed = started.elapsed().as_secs_f64();
        match &result {
            Ok(outcome) => {
                self.metrics.record_build_success(elapsed);
                info!(
                    cluster = %build_id,
                    endpoint = %outcome.api_endpoint,
                    kubeconfig_updated = outcome.kubeconfig_updated,
                    duration_secs = elapsed,
                    "Cluster build finished"
                );
                self.emit(
                    BuildEventKind::Succeeded,
                    &build_id,
                    json!({
                        "apiEndpoint": outcome.api_endpoint,
                        "promotedNode": outcome.promoted_node,
                        "kubeconfigUpdated": outcome.kubeconfig_updated,
                        "durationSeconds": elapsed,
                    }),
                )
                .await;
            }
            Err(err) => {
                self.metrics.record_build_failure(elapsed);
                error!(
                    cluster = %build_id,
                    stage = %err.stage,
                    error = %err.kind,
                    working_dir = ?err.working_dir,
                    "Cluster build failed"
                );
                self.emit(
                    BuildEventKind::Failed,
                    &build_id,
                    json!({
                        "stage": err.stage.as_str(),
                        "error": err.kind.to_string(),
                        "exitCode": err.exit_code(),
                        "workingDir": err.working_dir.as_ref().map(|p| p.display().to_string()),
                        "diagnostic": err.diagnostic(),
                        "durationSeconds": elapsed,
                    }),
                )
                .await;
            }
        }

        let terminal = if result.is_ok() {
            BuildStage::Done
        } else {
            BuildStage::Failed
        };
        debug!(cluster = %build_id, stage = %terminal, "Build reached terminal stage");

        result
    }

    async fn run(
        &self,
        build_id: &BuildId,
        cluster: &mut K8sCluster,
        load_balancers: &[LbCluster],
        cancel: &CancellationToken,
    ) -> Result<BuildOutcome, BuildError> {
        let working_dir = {
            let _stage = self.enter(build_id, BuildStage::Preparing);
            WorkingDir::prepare(&self.base_dir, build_id, self.retention)
                .await
                .map_err(|e| BuildError::new(build_id, BuildStage::Preparing, None, e))?
        };
        let dir = working_dir.path().to_path_buf();
        let fail = |stage: BuildStage, kind: BuildErrorKind| {
            BuildError::new(build_id, stage, Some(dir.as_path()), kind)
        };

        let (api_endpoint, promoted_node) = {
            let _stage = self.enter(build_id, BuildStage::Rendering);

            let resolution = resolve_endpoint(cluster, load_balancers);
            if let Some(diagnostic) = resolution.unusable(cluster, load_balancers) {
                warn!(
                    cluster = %build_id,
                    reason = %diagnostic,
                    "No usable address to serve the API"
                );
                return Err(fail(
                    BuildStage::Rendering,
                    BuildErrorKind::Configuration { diagnostic },
                ));
            }

            let promoted = resolution.apply(cluster);
            if promoted {
                let node = resolution.promoted_node().and_then(|r| {
                    cluster
                        .info
                        .node_pools
                        .get(r.pool)
                        .and_then(|pool| pool.nodes.get(r.node))
                });
                if let Some(node) = node {
                    info!(cluster = %build_id, node = %node.name, "Promoted master node to API endpoint");
                }
            }

            let view = ProvisioningView::assemble(cluster, resolution.endpoint());
            working_dir
                .materialize(
                    &self.template,
                    &view,
                    &cluster.info.private_key,
                    &cluster.kubeconfig,
                )
                .await
                .map_err(|e| fail(BuildStage::Rendering, e.into()))?;

            (resolution.endpoint().to_string(), promoted)
        };

        {
            let _stage = self.enter(build_id, BuildStage::Provisioning);
            info!(
                cluster = %build_id,
                tool = self.provisioner.name(),
                endpoint = %api_endpoint,
                "Provisioning cluster"
            );
            self.provisioner
                .apply(&dir, build_id, cancel)
                .await
                .map_err(|e| fail(BuildStage::Provisioning, e.into()))?;
        }

        let kubeconfig_updated = {
            let _stage = self.enter(build_id, BuildStage::ExtractingCredential);
            let content = extract_kubeconfig(&dir, cluster.name())
                .await
                .map_err(|source| {
                    fail(
                        BuildStage::ExtractingCredential,
                        BuildErrorKind::FileIo {
                            path: kubeconfig_path(&dir, cluster.name()),
                            source,
                        },
                    )
                })?;

            if content.is_empty() {
                info!(cluster = %build_id, "Tool produced no kubeconfig, keeping the existing one");
                false
            } else {
                match describe_kubeconfig(&content) {
                    Ok(summary) => info!(
                        cluster = %build_id,
                        context = ?summary.current_context,
                        servers = ?summary.servers,
                        "Kubeconfig extracted"
                    ),
                    Err(e) => warn!(
                        cluster = %build_id,
                        error = %e,
                        "Extracted kubeconfig could not be parsed, storing it as-is"
                    ),
                }
                cluster.kubeconfig = content;
                true
            }
        };

        {
            let _stage = self.enter(build_id, BuildStage::CleaningUp);
            working_dir
                .release()
                .await
                .map_err(|e| fail(BuildStage::CleaningUp, e.into()))?;
        }

        Ok(BuildOutcome {
            build_id: build_id.clone(),
            api_endpoint,
            promoted_node,
            kubeconfig_updated,
        })
    }

    fn enter(&self, build_id: &BuildId, stage: BuildStage) -> StageTimer<'_> {
        debug!(cluster = %build_id, stage = %stage, "Entering build stage");
        StageTimer {
            metrics: &self.metrics,
            stage,
            started: Instant::now(),
        }
    }

    /// Event delivery failures never fail a build
    async fn emit(&self, kind: BuildEventKind, build_id: &BuildId, data: serde_json::Value) {
        if let Err(e) = self.events.emit(kind, build_id, data).await {
            warn!(cluster = %build_id, error = %e, "Failed to emit build event");
        }
    }
}

/// Observes the duration of a stage when dropped, whether it succeeded or not
struct StageTimer<'a> {
    metrics: &'a BuildMetrics,
    stage: BuildStage,
    started: Instant,
}

impl Drop for StageTimer<'_> {
    fn drop(&mut self) {
        self.metrics
            .record_stage(self.stage.as_str(), self.started.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
#[path = "orchestrator_test.rs"]
mod tests;
