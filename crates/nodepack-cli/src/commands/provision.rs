use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use nodepack_core::NodepackConfig;
use nodepack_provider::{
    CapacityRequest, CatalogProvider, CloudProvider, InMemoryCloud, NodePacking, ProvisionerSpec,
};

use super::{OutputFormat, load_config, pod_keys};
use crate::scenario::Scenario;

pub async fn provision(scenario: &Path, config: Option<&Path>, format: OutputFormat) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let scenario = Scenario::load(scenario)?;
    let nodes = launch(&scenario, &config).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&nodes)?),
        OutputFormat::Text => print!("{}", format_nodes(&nodes)),
    }
    Ok(())
}

/// Provider bound to the scenario's cluster, catalog and simulated cloud.
pub fn provider(
    scenario: &Scenario,
    config: &NodepackConfig,
) -> anyhow::Result<CatalogProvider<InMemoryCloud>> {
    let spec = ProvisionerSpec {
        cluster_name: scenario.cluster.clone(),
        constraints: scenario.constraints.clone(),
    };
    let provider = CatalogProvider::from_config(
        spec,
        scenario.instance_types.clone(),
        Arc::new(scenario.build_cloud()),
        config,
    )?;
    Ok(provider)
}

/// Launch nodes for every pod in the scenario.
pub async fn launch(scenario: &Scenario, config: &NodepackConfig) -> anyhow::Result<Vec<NodePacking>> {
    let provider = provider(scenario, config)?;
    let request = CapacityRequest {
        pods: scenario.workload_units()?,
        constraints: scenario.constraints.clone(),
    };

    let nodes = provider
        .create(&request)
        .await
        .with_context(|| format!("provisioning for cluster {}", scenario.cluster))?;

    let placed: usize = nodes.iter().map(|n| n.pods.len()).sum();
    info!(
        nodes = nodes.len(),
        placed,
        pending = request.pods.len() - placed,
        "provisioning finished"
    );
    Ok(nodes)
}

pub fn format_nodes(nodes: &[NodePacking]) -> String {
    let mut out = String::new();
    out.push_str(&format!("Launched {} node(s):\n", nodes.len()));
    for packing in nodes {
        let node = &packing.node;
        out.push_str(&format!("  ✓ {} {} in {}\n", node.name, node.instance_type, node.zone));
        out.push_str(&format!("    {}\n", pod_keys(&packing.pods)));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scenario(content: &str) -> Scenario {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        Scenario::load(file.path()).unwrap()
    }

    const SCENARIO: &str = r#"
cluster = "prod"

[[pods]]
name = "api-0"
requests = { cpu = "1", memory = "2Gi" }

[[pods]]
name = "api-1"
requests = { cpu = "1", memory = "2Gi" }

[[instance_types]]
name = "m5.large"
capacity = { cpu = "2", memory = "8Gi" }
zones = ["us-west-2a", "us-west-2b"]

[[instance_types]]
name = "m5.xlarge"
capacity = { cpu = "4", memory = "16Gi" }
zones = ["us-west-2a", "us-west-2b"]

[cloud]
zones = [
  { zone_name = "us-west-2a", zone_id = "usw2-az1" },
  { zone_name = "us-west-2b", zone_id = "usw2-az2" },
]
subnets = [
  { subnet_id = "subnet-a", availability_zone = "us-west-2a" },
  { subnet_id = "subnet-b", availability_zone = "us-west-2b" },
]
insufficient_capacity = [{ instance_type = "m5.xlarge", zone = "us-west-2a" }]
"#;

    #[tokio::test]
    async fn launches_with_capacity_fallback() {
        let nodes = launch(&scenario(SCENARIO), &NodepackConfig::default()).await.unwrap();

        // With kubelet overhead only m5.xlarge holds both pods.
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].pods.len(), 2);
        assert_eq!(nodes[0].node.instance_type, "m5.xlarge");
        assert_eq!(nodes[0].node.zone, "us-west-2b");
    }

    #[tokio::test]
    async fn missing_subnets_fail_with_context() {
        let content = SCENARIO.replace("cluster = \"prod\"", "cluster = \"prod\"\n[constraints]\nzones = [\"us-west-2c\"]");
        let err = launch(&scenario(&content), &NodepackConfig::default())
            .await
            .unwrap_err();

        let message = format!("{err:#}");
        assert!(message.contains("provisioning for cluster prod"));
        assert!(message.contains("failed to find viable zonal subnet pairing"));
    }

    #[tokio::test]
    async fn text_output_lists_nodes() {
        let nodes = launch(&scenario(SCENARIO), &NodepackConfig::default()).await.unwrap();

        let text = format_nodes(&nodes);

        assert!(text.starts_with("Launched 1 node(s):\n"));
        assert!(text.contains("m5.xlarge in us-west-2b"));
        assert!(text.contains("default/api-0, default/api-1"));
    }
}
