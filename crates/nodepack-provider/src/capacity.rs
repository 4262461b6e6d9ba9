//! Node-lifecycle capability and a catalog-backed implementation.
//!
//! [`CloudProvider`] is what a provisioning controller talks to: it turns a
//! batch of pending pods into launched nodes, deletes nodes, and reports
//! what the provider supports. [`CatalogProvider`] implements it from a
//! fixed instance catalog, the packing engine and a [`CloudApi`].

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use nodepack_core::{Constraints, InstanceDescriptor, NodepackConfig, ResourceList, WorkloadUnit};
use nodepack_packing::{FfdPacker, Packing};

use crate::cache::CacheSettings;
use crate::cloud::{CloudApi, LaunchRequest, normalize_architecture};
use crate::error::{ProviderError, ProviderResult};
use crate::vpc::{VpcProvider, ZonalSubnets, cluster_tag_key};

pub const ZONE_LABEL: &str = "topology.kubernetes.io/zone";
pub const INSTANCE_TYPE_LABEL: &str = "node.kubernetes.io/instance-type";
pub const ARCH_LABEL: &str = "kubernetes.io/arch";
pub const OS_LABEL: &str = "kubernetes.io/os";

/// A launched node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    pub name: String,
    pub instance_id: String,
    /// `aws:///<zone>/<instance id>`
    pub provider_id: String,
    pub instance_type: String,
    pub zone: String,
    pub labels: BTreeMap<String, String>,
    pub capacity: ResourceList,
}

/// A launched node and the pods meant to run on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodePacking {
    pub node: Node,
    pub pods: Vec<WorkloadUnit>,
}

/// Pods to provision capacity for, and the constraints they share.
#[derive(Debug, Clone, Default)]
pub struct CapacityRequest {
    pub pods: Vec<WorkloadUnit>,
    pub constraints: Constraints,
}

/// The provisioner a provider instance is bound to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionerSpec {
    pub cluster_name: String,
    pub constraints: Constraints,
}

/// Provisions and removes nodes for one provisioner.
pub trait CloudProvider: Send + Sync {
    /// Launch nodes for the request's pods.
    fn create(
        &self,
        request: &CapacityRequest,
    ) -> impl Future<Output = ProviderResult<Vec<NodePacking>>> + Send;

    fn delete(&self, nodes: &[Node]) -> impl Future<Output = ProviderResult<()>> + Send;

    fn instance_types(&self) -> impl Future<Output = ProviderResult<Vec<String>>> + Send;

    fn zones(&self) -> impl Future<Output = ProviderResult<Vec<String>>> + Send;

    fn architectures(&self) -> impl Future<Output = ProviderResult<Vec<String>>> + Send;

    fn operating_systems(&self) -> impl Future<Output = ProviderResult<Vec<String>>> + Send;

    /// Check the provisioner's constraints against what the provider supports.
    fn validate(&self) -> impl Future<Output = ProviderResult<()>> + Send;
}

/// [`CloudProvider`] over a static instance catalog.
pub struct CatalogProvider<A> {
    spec: ProvisionerSpec,
    catalog: Vec<InstanceDescriptor>,
    api: Arc<A>,
    vpc: VpcProvider<A>,
    packer: FfdPacker,
}

impl<A: CloudApi> CatalogProvider<A> {
    /// `catalog` order is the preference order handed to the packer.
    pub fn new(spec: ProvisionerSpec, catalog: Vec<InstanceDescriptor>, api: Arc<A>) -> Self {
        Self {
            vpc: VpcProvider::new(Arc::clone(&api), CacheSettings::default()),
            spec,
            catalog,
            api,
            packer: FfdPacker::new(),
        }
    }

    pub fn from_config(
        spec: ProvisionerSpec,
        catalog: Vec<InstanceDescriptor>,
        api: Arc<A>,
        config: &NodepackConfig,
    ) -> ProviderResult<Self> {
        let settings = CacheSettings::from_config(&config.cache)?;
        Ok(Self {
            vpc: VpcProvider::new(Arc::clone(&api), settings),
            spec,
            catalog,
            api,
            packer: FfdPacker::from_config(config),
        })
    }

    pub fn with_packer(mut self, packer: FfdPacker) -> Self {
        self.packer = packer;
        self
    }

    pub fn spec(&self) -> &ProvisionerSpec {
        &self.spec
    }

    /// Catalog entries the constraints admit, offered only in zones with a
    /// viable subnet.
    fn launchable(&self, constraints: &Constraints, zonal: &ZonalSubnets) -> Vec<InstanceDescriptor> {
        // Zones are already resolved into `zonal`, possibly from zone ids.
        let filter = Constraints {
            zones: Vec::new(),
            ..constraints.clone()
        };
        filter
            .filter_instances(&self.catalog)
            .into_iter()
            .filter_map(|mut instance| {
                instance.zones.retain(|zone| zonal.contains_key(zone));
                (!instance.zones.is_empty()).then_some(instance)
            })
            .collect()
    }

    /// Launch one node for `packing`, trying each candidate instance type
    /// and each of its zones in order.
    ///
    /// Returns `None` when every option is out of capacity.
    async fn launch(
        &self,
        packing: &Packing,
        constraints: &Constraints,
        zonal: &ZonalSubnets,
    ) -> ProviderResult<Option<Node>> {
        for instance in &packing.instance_types {
            for zone in &instance.zones {
                let Some(subnet) = zonal.get(zone).and_then(|subnets| subnets.first()) else {
                    continue;
                };
                let request = LaunchRequest {
                    instance_type: instance.name.clone(),
                    zone: zone.clone(),
                    subnet_id: subnet.subnet_id.clone(),
                    architecture: normalize_architecture(&instance.architecture).to_string(),
                    tags: BTreeMap::from([(
                        cluster_tag_key(&self.spec.cluster_name),
                        "owned".to_string(),
                    )]),
                };

                match self.api.launch_instance(&request).await {
                    Ok(launched) => {
                        return Ok(Some(node_for(
                            launched.instance_id,
                            instance,
                            zone,
                            constraints,
                        )));
                    }
                    Err(e) if e.is_insufficient_capacity() => {
                        debug!(
                            instance_type = %instance.name,
                            zone = %zone,
                            "insufficient capacity, trying next option"
                        );
                    }
                    Err(source) => {
                        return Err(ProviderError::Launching {
                            instance_type: instance.name.clone(),
                            zone: zone.clone(),
                            source,
                        });
                    }
                }
            }
        }
        Ok(None)
    }

    fn sorted_catalog_values<F, I>(&self, values: F) -> Vec<String>
    where
        F: Fn(&InstanceDescriptor) -> I,
        I: IntoIterator<Item = String>,
    {
        self.catalog
            .iter()
            .flat_map(values)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

fn node_for(instance_id: String, instance: &InstanceDescriptor, zone: &str, constraints: &Constraints) -> Node {
    let os = constraints
        .operating_system
        .clone()
        .or_else(|| instance.operating_systems.first().cloned())
        .unwrap_or_else(|| "linux".to_string());

    let mut labels = constraints.labels.clone();
    labels.insert(ZONE_LABEL.to_string(), zone.to_string());
    labels.insert(INSTANCE_TYPE_LABEL.to_string(), instance.name.clone());
    labels.insert(ARCH_LABEL.to_string(), instance.architecture.clone());
    labels.insert(OS_LABEL.to_string(), os);

    Node {
        name: instance_id.clone(),
        provider_id: format!("aws:///{zone}/{instance_id}"),
        instance_id,
        instance_type: instance.name.clone(),
        zone: zone.to_string(),
        labels,
        capacity: instance.capacity.clone(),
    }
}

impl<A: CloudApi> CloudProvider for CatalogProvider<A> {
    async fn create(&self, request: &CapacityRequest) -> ProviderResult<Vec<NodePacking>> {
        let constraints = &request.constraints;
        let zonal = self
            .vpc
            .get_zonal_subnets(constraints, &self.spec.cluster_name)
            .await?;

        let instances = self.launchable(constraints, &zonal);
        let report = self.packer.plan(&request.pods, &instances, constraints);
        if !report.unplaced.is_empty() {
            warn!(
                unplaced = report.unplaced.len(),
                pods = ?report.unplaced.iter().map(WorkloadUnit::key).collect::<Vec<_>>(),
                "pods do not fit any instance type"
            );
        }

        let mut launched = Vec::with_capacity(report.packings.len());
        for packing in &report.packings {
            match self.launch(packing, constraints, &zonal).await? {
                Some(node) => {
                    info!(
                        node = %node.name,
                        instance_type = %node.instance_type,
                        zone = %node.zone,
                        pods = packing.pods.len(),
                        "launched node"
                    );
                    launched.push(NodePacking {
                        node,
                        pods: packing.pods.clone(),
                    });
                }
                None => {
                    warn!(
                        pods = packing.pods.len(),
                        instance_types = ?packing.instance_types.iter().map(|it| it.name.as_str()).collect::<Vec<_>>(),
                        "every instance type option is out of capacity, skipping packing"
                    );
                }
            }
        }
        Ok(launched)
    }

    async fn delete(&self, nodes: &[Node]) -> ProviderResult<()> {
        for node in nodes {
            self.api
                .terminate_instance(&node.instance_id)
                .await
                .map_err(|source| ProviderError::Terminating {
                    node: node.name.clone(),
                    source,
                })?;
            info!(node = %node.name, "terminated node");
        }
        Ok(())
    }

    async fn instance_types(&self) -> ProviderResult<Vec<String>> {
        Ok(self.sorted_catalog_values(|it| [it.name.clone()]))
    }

    async fn zones(&self) -> ProviderResult<Vec<String>> {
        self.vpc.get_zones(&self.spec.cluster_name).await
    }

    async fn architectures(&self) -> ProviderResult<Vec<String>> {
        Ok(self.sorted_catalog_values(|it| [it.architecture.clone()]))
    }

    async fn operating_systems(&self) -> ProviderResult<Vec<String>> {
        Ok(self.sorted_catalog_values(|it| it.operating_systems.clone()))
    }

    async fn validate(&self) -> ProviderResult<()> {
        let constraints = &self.spec.constraints;

        let supported_zones = self.zones().await?;
        for zone in &constraints.zones {
            let names = self.vpc.normalize_zones(std::slice::from_ref(zone)).await?;
            if !names.iter().any(|name| supported_zones.contains(name)) {
                return Err(unsupported("zone", zone, &supported_zones));
            }
        }

        let supported_types = self.instance_types().await?;
        for instance_type in &constraints.instance_types {
            if !supported_types.contains(instance_type) {
                return Err(unsupported("instance type", instance_type, &supported_types));
            }
        }

        if let Some(arch) = &constraints.architecture {
            let supported = self.architectures().await?;
            if !supported.contains(arch) {
                return Err(unsupported("architecture", arch, &supported));
            }
        }

        if let Some(os) = &constraints.operating_system {
            let supported = self.operating_systems().await?;
            if !supported.contains(os) {
                return Err(unsupported("operating system", os, &supported));
            }
        }

        Ok(())
    }
}

fn unsupported(what: &str, value: &str, supported: &[String]) -> ProviderError {
    ProviderError::Validation(format!(
        "{what} {value} is not supported, expected one of [{}]",
        supported.join(", ")
    ))
}
