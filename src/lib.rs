pub mod build;
pub mod config;
pub mod model;

pub use crate::build::{BuildError, BuildOutcome, ClusterBuilder};
pub use crate::config::BuildConfig;
