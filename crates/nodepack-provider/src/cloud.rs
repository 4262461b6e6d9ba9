//! Cloud API abstraction and an in-memory backend.
//!
//! [`CloudApi`] is the narrow slice of a compute API the provider needs:
//! zone and subnet discovery plus launching and terminating instances.
//! [`InMemoryCloud`] implements it over fixed zones and subnets, with
//! injectable capacity shortages and failures, for tests and the CLI.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ApiError;

/// An availability zone, addressable by name (`us-west-2a`) or id
/// (`usw2-az1`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityZone {
    pub zone_name: String,
    pub zone_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub subnet_id: String,
    pub availability_zone: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Parameters for launching one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub instance_type: String,
    pub zone: String,
    pub subnet_id: String,
    /// Architecture in the provider's naming (see [`normalize_architecture`]).
    pub architecture: String,
    pub tags: BTreeMap<String, String>,
}

/// A running instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instance {
    pub instance_id: String,
    pub instance_type: String,
    pub zone: String,
    pub subnet_id: String,
}

/// Compute API operations used by zone discovery and the node provider.
pub trait CloudApi: Send + Sync {
    fn describe_availability_zones(
        &self,
    ) -> impl Future<Output = Result<Vec<AvailabilityZone>, ApiError>> + Send;

    /// Subnets carrying a tag with key `tag_key`.
    fn describe_subnets(
        &self,
        tag_key: &str,
    ) -> impl Future<Output = Result<Vec<Subnet>, ApiError>> + Send;

    fn launch_instance(
        &self,
        request: &LaunchRequest,
    ) -> impl Future<Output = Result<Instance, ApiError>> + Send;

    fn terminate_instance(&self, instance_id: &str) -> impl Future<Output = Result<(), ApiError>> + Send;
}

/// Map Kubernetes architecture names to the provider's names.
pub fn normalize_architecture(architecture: &str) -> &str {
    match architecture {
        "amd64" => "x86_64",
        other => other,
    }
}

/// Operations of [`InMemoryCloud`], for failure injection and call counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloudOp {
    DescribeAvailabilityZones,
    DescribeSubnets,
    LaunchInstance,
    TerminateInstance,
}

#[derive(Default)]
struct CloudState {
    instances: BTreeMap<String, Instance>,
    next_id: u64,
    failures: HashMap<CloudOp, ApiError>,
    calls: HashMap<CloudOp, usize>,
}

/// In-memory [`CloudApi`] over a fixed set of zones and subnets.
#[derive(Default)]
pub struct InMemoryCloud {
    zones: Vec<AvailabilityZone>,
    subnets: Vec<Subnet>,
    /// `(instance type, zone)` pairs that report insufficient capacity.
    no_capacity: HashSet<(String, String)>,
    state: Mutex<CloudState>,
}

impl InMemoryCloud {
    pub fn new(zones: Vec<AvailabilityZone>, subnets: Vec<Subnet>) -> Self {
        Self {
            zones,
            subnets,
            ..Default::default()
        }
    }

    /// Reject launches of `instance_type` in `zone` with insufficient capacity.
    pub fn with_insufficient_capacity(
        mut self,
        instance_type: impl Into<String>,
        zone: impl Into<String>,
    ) -> Self {
        self.no_capacity.insert((instance_type.into(), zone.into()));
        self
    }

    fn lock(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail every subsequent `op` with `error` until cleared.
    pub fn fail(&self, op: CloudOp, error: ApiError) {
        self.lock().failures.insert(op, error);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Number of times `op` was called, including failed calls.
    pub fn calls(&self, op: CloudOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or_default()
    }

    /// Running instances, ordered by id.
    pub fn instances(&self) -> Vec<Instance> {
        self.lock().instances.values().cloned().collect()
    }

    /// Count the call and return the injected failure, if any.
    fn record(&self, op: CloudOp) -> Result<(), ApiError> {
        let mut state = self.lock();
        *state.calls.entry(op).or_default() += 1;
        match state.failures.get(&op) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

impl CloudApi for InMemoryCloud {
    async fn describe_availability_zones(&self) -> Result<Vec<AvailabilityZone>, ApiError> {
        self.record(CloudOp::DescribeAvailabilityZones)?;
        Ok(self.zones.clone())
    }

    async fn describe_subnets(&self, tag_key: &str) -> Result<Vec<Subnet>, ApiError> {
        self.record(CloudOp::DescribeSubnets)?;
        Ok(self
            .subnets
            .iter()
            .filter(|subnet| subnet.tags.contains_key(tag_key))
            .cloned()
            .collect())
    }

    async fn launch_instance(&self, request: &LaunchRequest) -> Result<Instance, ApiError> {
        self.record(CloudOp::LaunchInstance)?;

        if self
            .no_capacity
            .contains(&(request.instance_type.clone(), request.zone.clone()))
        {
            return Err(ApiError::InsufficientCapacity {
                instance_type: request.instance_type.clone(),
                zone: request.zone.clone(),
            });
        }
        if !self.subnets.iter().any(|s| s.subnet_id == request.subnet_id) {
            return Err(ApiError::Service(format!(
                "subnet {} does not exist",
                request.subnet_id
            )));
        }

        let mut state = self.lock();
        state.next_id += 1;
        let instance = Instance {
            instance_id: format!("i-{:017x}", state.next_id),
            instance_type: request.instance_type.clone(),
            zone: request.zone.clone(),
            subnet_id: request.subnet_id.clone(),
        };
        state
            .instances
            .insert(instance.instance_id.clone(), instance.clone());
        debug!(
            instance_id = %instance.instance_id,
            instance_type = %instance.instance_type,
            zone = %instance.zone,
            "launched instance"
        );
        Ok(instance)
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<(), ApiError> {
        self.record(CloudOp::TerminateInstance)?;
        match self.lock().instances.remove(instance_id) {
            Some(_) => Ok(()),
            None => Err(ApiError::InstanceNotFound(instance_id.to_string())),
        }
    }
}
