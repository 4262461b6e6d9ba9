//! Shared types used across nodepack crates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::resources::{CPU, MEMORY, Quantity, ResourceList, quantity};

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// A pending pod: identity plus its effective resource requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadUnit {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub requests: ResourceList,
}

impl WorkloadUnit {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, requests: ResourceList) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            requests,
        }
    }

    /// Build a workload unit from container-level requests.
    ///
    /// Per dimension the effective request is the larger of the sum over
    /// regular containers and the largest single init container, since
    /// init containers run one at a time before the others start.
    pub fn from_containers(
        namespace: impl Into<String>,
        name: impl Into<String>,
        containers: &[ResourceList],
        init_containers: &[ResourceList],
    ) -> Self {
        let mut requests = ResourceList::new();
        for container in containers {
            for (dimension, value) in container {
                let entry = requests.entry(dimension.clone()).or_default();
                *entry = entry.saturating_add(*value);
            }
        }
        for init in init_containers {
            for (dimension, value) in init {
                let entry = requests.entry(dimension.clone()).or_default();
                *entry = (*entry).max(*value);
            }
        }
        Self::new(namespace, name, requests)
    }

    /// Namespace-qualified identity (`namespace/name`).
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn cpu(&self) -> Quantity {
        quantity(&self.requests, CPU)
    }

    pub fn memory(&self) -> Quantity {
        quantity(&self.requests, MEMORY)
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

/// A launchable instance type with its total capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    pub name: String,
    pub capacity: ResourceList,
    /// Zones the instance type is offered in.
    #[serde(default)]
    pub zones: Vec<String>,
    #[serde(default = "default_architecture")]
    pub architecture: String,
    #[serde(default = "default_operating_systems")]
    pub operating_systems: Vec<String>,
}

impl InstanceDescriptor {
    pub fn new(name: impl Into<String>, capacity: ResourceList) -> Self {
        Self {
            name: name.into(),
            capacity,
            zones: Vec::new(),
            architecture: default_architecture(),
            operating_systems: default_operating_systems(),
        }
    }

    pub fn with_zones<I, S>(mut self, zones: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.zones = zones.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_architecture(mut self, architecture: impl Into<String>) -> Self {
        self.architecture = architecture.into();
        self
    }

    /// Virtual CPUs as a float.
    pub fn vcpus(&self) -> f64 {
        quantity(&self.capacity, CPU).as_f64()
    }

    /// Memory in GiB as a float.
    pub fn memory_gib(&self) -> f64 {
        quantity(&self.capacity, MEMORY).as_f64() / BYTES_PER_GIB
    }

    pub fn offered_in(&self, zone: &str) -> bool {
        self.zones.iter().any(|z| z == zone)
    }
}

fn default_architecture() -> String {
    "amd64".to_string()
}

fn default_operating_systems() -> Vec<String> {
    vec!["linux".to_string()]
}

/// Caller-supplied constraints for one provisioning batch.
///
/// The packer only consumes `overhead`; the remaining fields are filters
/// applied to the instance catalog before packing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    /// Allowed zones (names or ids). Empty means unconstrained.
    #[serde(default)]
    pub zones: Vec<String>,
    /// Allowed instance type names. Empty means unconstrained.
    #[serde(default)]
    pub instance_types: Vec<String>,
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub operating_system: Option<String>,
    /// Labels applied to every launched node.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Per-node overhead from daemonsets.
    #[serde(default)]
    pub overhead: ResourceList,
}

impl Constraints {
    /// Whether an instance type passes every filter.
    ///
    /// Zones are matched by name against the instance's offerings; callers
    /// holding zone ids resolve them to names first.
    pub fn admits(&self, instance: &InstanceDescriptor) -> bool {
        if !self.instance_types.is_empty() && !self.instance_types.contains(&instance.name) {
            return false;
        }
        if let Some(arch) = &self.architecture
            && *arch != instance.architecture
        {
            return false;
        }
        if let Some(os) = &self.operating_system
            && !instance.operating_systems.contains(os)
        {
            return false;
        }
        self.zones.is_empty() || self.zones.iter().any(|z| instance.offered_in(z))
    }

    /// Keep the admitted instance types, preserving caller order.
    pub fn filter_instances(&self, instances: &[InstanceDescriptor]) -> Vec<InstanceDescriptor> {
        instances
            .iter()
            .filter(|it| self.admits(it))
            .cloned()
            .collect()
    }
}
