//! Build configuration
//!
//! The binary fills [`BuildConfig`] from CLI flags (each with a
//! `KUBE_ELEVEN_*` environment fallback). Library callers construct it
//! directly or start from `Default`.

use crate::build::artifacts::RetentionPolicy;
use crate::build::template::{ManifestTemplate, TemplateError};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Binary looked up on `PATH` when no explicit path is configured
pub const DEFAULT_KUBEONE_BIN: &str = "kubeone";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("apply timeout must be greater than zero")]
    ZeroApplyTimeout,

    #[error("base directory must not be empty")]
    EmptyBaseDir,

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
    /// Directory under which `clusters/<name>-<hash>` working directories live
    pub base_dir: PathBuf,
    pub kubeone_bin: PathBuf,
    /// Deadline for one `kubeone apply`; `None` waits indefinitely
    pub apply_timeout: Option<Duration>,
    pub retention: RetentionPolicy,
    /// Replacement for the built-in manifest template
    pub manifest_template: Option<PathBuf>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            kubeone_bin: PathBuf::from(DEFAULT_KUBEONE_BIN),
            apply_timeout: None,
            retention: RetentionPolicy::default(),
            manifest_template: None,
        }
    }
}

impl BuildConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyBaseDir);
        }
        if self.apply_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::ZeroApplyTimeout);
        }
        Ok(())
    }

    /// Compile the configured manifest template, or the built-in one
    pub fn load_template(&self) -> Result<ManifestTemplate, ConfigError> {
        let template = match &self.manifest_template {
            Some(path) => ManifestTemplate::from_file(path)?,
            None => ManifestTemplate::kubeone()?,
        };
        Ok(template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BuildConfig::default();

        assert_eq!(config.base_dir, PathBuf::from("."));
        assert_eq!(config.kubeone_bin, PathBuf::from("kubeone"));
        assert_eq!(config.retention, RetentionPolicy::RetainOnFailure);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let config = BuildConfig {
            apply_timeout: Some(Duration::ZERO),
            ..Default::default()
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroApplyTimeout)
        ));
    }

    #[test]
    fn test_empty_base_dir_is_rejected() {
        let config = BuildConfig {
            base_dir: PathBuf::new(),
            ..Default::default()
        };

        assert!(matches!(config.validate(), Err(ConfigError::EmptyBaseDir)));
    }

    #[test]
    fn test_load_template_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.hbs");
        std::fs::write(&path, "name: {{clusterName}}\n").unwrap();

        let config = BuildConfig {
            manifest_template: Some(path),
            ..Default::default()
        };

        assert!(config.load_template().is_ok());
    }

    #[test]
    fn test_load_missing_template_fails() {
        let config = BuildConfig {
            manifest_template: Some(PathBuf::from("/nonexistent/kubeone.hbs")),
            ..Default::default()
        };

        assert!(matches!(
            config.load_template(),
            Err(ConfigError::Template(TemplateError::Read { .. }))
        ));
    }
}
