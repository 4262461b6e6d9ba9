use std::path::Path;

use nodepack_core::NodepackConfig;
use nodepack_packing::{FfdPacker, PackReport};

use super::{OutputFormat, load_config, pod_keys};
use crate::scenario::Scenario;

pub fn pack(scenario: &Path, config: Option<&Path>, format: OutputFormat) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let scenario = Scenario::load(scenario)?;
    let report = plan(&scenario, &config)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print!("{}", format_report(&report)),
    }
    Ok(())
}

/// Pack the scenario's pods onto the instance types its constraints admit.
pub fn plan(scenario: &Scenario, config: &NodepackConfig) -> anyhow::Result<PackReport> {
    let pods = scenario.workload_units()?;
    let constraints = scenario.resolved_constraints();
    let instances = constraints.filter_instances(&scenario.instance_types);
    let packer = FfdPacker::from_config(config);
    Ok(packer.plan(&pods, &instances, &constraints))
}

pub fn format_report(report: &PackReport) -> String {
    let mut out = String::new();

    out.push_str(&format!("Packings ({}):\n", report.packings.len()));
    for (i, packing) in report.packings.iter().enumerate() {
        let options: Vec<&str> = packing.instance_types.iter().map(|it| it.name.as_str()).collect();
        out.push_str(&format!(
            "  {}. {} pod(s) on {}\n",
            i + 1,
            packing.pods.len(),
            options.join(" | ")
        ));
        out.push_str(&format!("     {}\n", pod_keys(&packing.pods)));
    }

    if !report.unplaced.is_empty() {
        out.push_str(&format!("\nUnplaced ({}):\n", report.unplaced.len()));
        for pod in &report.unplaced {
            out.push_str(&format!("  {} (cpu {}, memory {})\n", pod.key(), pod.cpu(), pod.memory()));
        }
    }

    if !report.excluded.is_empty() {
        out.push_str(&format!("\nExcluded instance types: {}\n", report.excluded.join(", ")));
    }

    out
}
