use std::path::Path;

use nodepack_core::NodepackConfig;
use nodepack_provider::CloudProvider;

use super::load_config;
use super::provision::provider;
use crate::scenario::Scenario;

pub async fn validate(scenario: &Path, config: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let scenario = Scenario::load(scenario)?;
    check(&scenario, &config).await?;
    println!("✓ constraints for cluster {} are supported", scenario.cluster);
    Ok(())
}

pub async fn check(scenario: &Scenario, config: &NodepackConfig) -> anyhow::Result<()> {
    scenario.workload_units()?;
    provider(scenario, config)?.validate().await?;
    Ok(())
}
