pub mod pack;
pub mod provision;
pub mod validate;

use std::path::Path;

use anyhow::Context;
use clap::ValueEnum;

use nodepack_core::{NodepackConfig, WorkloadUnit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Config from `path`, or the defaults.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<NodepackConfig> {
    match path {
        Some(path) => NodepackConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(NodepackConfig::default()),
    }
}

fn pod_keys(pods: &[WorkloadUnit]) -> String {
    pods.iter().map(WorkloadUnit::key).collect::<Vec<_>>().join(", ")
}
