//! KubeOne manifest template
//!
//! Rendering is a pure function of template source and view data. The default
//! template is compiled into the binary; a replacement can be loaded from disk.

use handlebars::{handlebars_helper, Handlebars};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

const KUBEONE_TEMPLATE: &str = include_str!("../../templates/kubeone.yaml.hbs");
const TEMPLATE_NAME: &str = "kubeone";

handlebars_helper!(yaml_quote: |value: str| format!("'{}'", value.replace('\'', "''")));

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to read manifest template {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest template: {0}")]
    Parse(#[from] Box<handlebars::TemplateError>),

    #[error("failed to render manifest: {0}")]
    Render(#[from] Box<handlebars::RenderError>),
}

/// Compiled manifest template
pub struct ManifestTemplate {
    registry: Handlebars<'static>,
}

impl ManifestTemplate {
    /// Template shipped with the crate
    pub fn kubeone() -> Result<Self, TemplateError> {
        Self::from_source(KUBEONE_TEMPLATE)
    }

    /// Load a template from a file on disk
    pub fn from_file(path: &Path) -> Result<Self, TemplateError> {
        let source = std::fs::read_to_string(path).map_err(|source| TemplateError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_source(&source)
    }

    pub fn from_source(source: &str) -> Result<Self, TemplateError> {
        let mut registry = Handlebars::new();
        // Missing view fields are template bugs, not empty strings
        registry.set_strict_mode(true);
        // Output is YAML, not HTML
        registry.register_escape_fn(handlebars::no_escape);
        // `{{yaml value}}` emits a single-quoted YAML scalar
        registry.register_helper("yaml", Box::new(yaml_quote));
        registry
            .register_template_string(TEMPLATE_NAME, source)
            .map_err(Box::new)?;

        Ok(Self { registry })
    }

    pub fn render<T: Serialize>(&self, data: &T) -> Result<String, TemplateError> {
        self.registry
            .render(TEMPLATE_NAME, data)
            .map_err(|e| TemplateError::Render(Box::new(e)))
    }
}
