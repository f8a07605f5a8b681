//! Cluster build pipeline
//!
//! Leaves first: endpoint resolution, view assembly, manifest template,
//! working directory, provisioning tool, credential extraction. The
//! orchestrator sequences them into one build.

pub mod artifacts;
pub mod credentials;
pub mod endpoint;
pub mod events;
pub mod metrics;
pub mod orchestrator;
pub mod provisioner;
pub mod template;
pub mod view;

pub use artifacts::{RetentionPolicy, WorkingDir};
pub use endpoint::{resolve_endpoint, EndpointDiagnostic, EndpointResolution};
pub use events::BuildEventSink;
pub use metrics::BuildMetrics;
pub use orchestrator::{BuildError, BuildErrorKind, BuildOutcome, BuildStage, ClusterBuilder};
pub use provisioner::{KubeOne, Provisioner, ProvisionerError};
pub use template::ManifestTemplate;
pub use view::ProvisioningView;
