//! Scenario files: pods, an instance catalog, constraints and an optional
//! simulated cloud, in TOML or JSON.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, bail};
use serde::Deserialize;

use nodepack_core::{Constraints, InstanceDescriptor, ResourceList, WorkloadUnit};
use nodepack_provider::{AvailabilityZone, InMemoryCloud, Subnet, cluster_tag_key};

#[derive(Debug, Deserialize)]
pub struct Scenario {
    #[serde(default = "default_cluster")]
    pub cluster: String,
    #[serde(default)]
    pub pods: Vec<PodSpec>,
    #[serde(default)]
    pub instance_types: Vec<InstanceDescriptor>,
    #[serde(default)]
    pub constraints: Constraints,
    #[serde(default)]
    pub cloud: Option<CloudSpec>,
}

/// A pod given either by its effective requests or by container requests.
#[derive(Debug, Deserialize)]
pub struct PodSpec {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub requests: ResourceList,
    #[serde(default)]
    pub containers: Vec<ResourceList>,
    #[serde(default)]
    pub init_containers: Vec<ResourceList>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CloudSpec {
    #[serde(default)]
    pub zones: Vec<AvailabilityZone>,
    /// Subnets without tags are tagged for the scenario's cluster.
    #[serde(default)]
    pub subnets: Vec<Subnet>,
    #[serde(default)]
    pub insufficient_capacity: Vec<Shortage>,
}

#[derive(Debug, Deserialize)]
pub struct Shortage {
    pub instance_type: String,
    pub zone: String,
}

fn default_cluster() -> String {
    "nodepack".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Scenario {
    /// Load a scenario; `.json` files are JSON, everything else TOML.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading scenario {}", path.display()))?;
        let scenario = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("parsing JSON scenario {}", path.display()))?,
            _ => toml::from_str(&content)
                .with_context(|| format!("parsing TOML scenario {}", path.display()))?,
        };
        Ok(scenario)
    }

    pub fn workload_units(&self) -> anyhow::Result<Vec<WorkloadUnit>> {
        self.pods.iter().map(PodSpec::to_workload_unit).collect()
    }

    /// Constraints with zone ids from the `cloud` section replaced by
    /// their zone names. Entries that match no id are kept as given.
    pub fn resolved_constraints(&self) -> Constraints {
        let mut constraints = self.constraints.clone();
        if let Some(cloud) = &self.cloud {
            for zone in &mut constraints.zones {
                if let Some(az) = cloud.zones.iter().find(|az| az.zone_id == *zone) {
                    *zone = az.zone_name.clone();
                }
            }
        }
        constraints
    }

    /// The simulated cloud. Without a `cloud` section every zone the
    /// catalog mentions gets one subnet tagged for the cluster.
    pub fn build_cloud(&self) -> InMemoryCloud {
        let tag = cluster_tag_key(&self.cluster);
        let Some(spec) = &self.cloud else {
            let zones: BTreeSet<&String> = self
                .instance_types
                .iter()
                .flat_map(|it| &it.zones)
                .collect();
            let azs = zones
                .iter()
                .map(|zone| AvailabilityZone {
                    zone_name: zone.to_string(),
                    zone_id: zone.to_string(),
                })
                .collect();
            let subnets = zones
                .iter()
                .map(|zone| Subnet {
                    subnet_id: format!("subnet-{zone}"),
                    availability_zone: zone.to_string(),
                    tags: [(tag.clone(), "owned".to_string())].into(),
                })
                .collect();
            return InMemoryCloud::new(azs, subnets);
        };

        let subnets = spec
            .subnets
            .iter()
            .cloned()
            .map(|mut subnet| {
                if subnet.tags.is_empty() {
                    subnet.tags.insert(tag.clone(), "owned".to_string());
                }
                subnet
            })
            .collect();
        spec.insufficient_capacity.iter().fold(
            InMemoryCloud::new(spec.zones.clone(), subnets),
            |cloud, shortage| {
                cloud.with_insufficient_capacity(&shortage.instance_type, &shortage.zone)
            },
        )
    }
}

impl PodSpec {
    fn to_workload_unit(&self) -> anyhow::Result<WorkloadUnit> {
        if self.containers.is_empty() && self.init_containers.is_empty() {
            return Ok(WorkloadUnit::new(&self.namespace, &self.name, self.requests.clone()));
        }
        if !self.requests.is_empty() {
            bail!(
                "pod {}/{} sets both requests and containers",
                self.namespace,
                self.name
            );
        }
        Ok(WorkloadUnit::from_containers(
            &self.namespace,
            &self.name,
            &self.containers,
            &self.init_containers,
        ))
    }
}
