//! Zone and subnet discovery.
//!
//! A cluster can only launch nodes in zones where it has a subnet tagged
//! for it. [`SubnetProvider`] groups the cluster's tagged subnets by zone;
//! [`VpcProvider`] intersects those zones with the zones a provisioning
//! request allows. Both cache what they fetch.

use std::collections::BTreeMap;
use std::sync::Arc;

use nodepack_core::Constraints;
use tracing::debug;

use crate::cache::{CacheSettings, TtlCache};
use crate::cloud::{AvailabilityZone, CloudApi, Subnet};
use crate::error::{ProviderError, ProviderResult};

/// Tag key format marking a subnet as usable by a cluster.
pub const CLUSTER_TAG_KEY_PREFIX: &str = "kubernetes.io/cluster/";

/// Cache key for the full zone listing.
const ALL_ZONES_KEY: &str = "all";

/// Subnets by zone name.
pub type ZonalSubnets = BTreeMap<String, Vec<Subnet>>;

pub fn cluster_tag_key(cluster_name: &str) -> String {
    format!("{CLUSTER_TAG_KEY_PREFIX}{cluster_name}")
}

/// Discovers the subnets tagged for a cluster, cached per cluster.
pub struct SubnetProvider<A> {
    api: Arc<A>,
    cache: TtlCache<String, ZonalSubnets>,
}

impl<A: CloudApi> SubnetProvider<A> {
    pub fn new(api: Arc<A>, settings: CacheSettings) -> Self {
        Self {
            api,
            cache: TtlCache::new("subnets", settings),
        }
    }

    pub async fn get(&self, cluster_name: &str) -> ProviderResult<ZonalSubnets> {
        self.cache
            .get_or_try_fetch(cluster_name.to_string(), || self.zonal_subnets(cluster_name))
            .await
    }

    async fn zonal_subnets(&self, cluster_name: &str) -> ProviderResult<ZonalSubnets> {
        let subnets = self
            .api
            .describe_subnets(&cluster_tag_key(cluster_name))
            .await
            .map_err(ProviderError::DescribingSubnets)?;

        let mut zonal = ZonalSubnets::new();
        for subnet in subnets {
            zonal
                .entry(subnet.availability_zone.clone())
                .or_default()
                .push(subnet);
        }
        debug!(
            cluster = cluster_name,
            zones = zonal.len(),
            "discovered subnets"
        );
        Ok(zonal)
    }

    pub fn cache(&self) -> &TtlCache<String, ZonalSubnets> {
        &self.cache
    }
}

/// Resolves which zones and subnets a provisioning request may use.
pub struct VpcProvider<A> {
    api: Arc<A>,
    subnets: SubnetProvider<A>,
    zones: TtlCache<String, Vec<AvailabilityZone>>,
}

impl<A: CloudApi> VpcProvider<A> {
    pub fn new(api: Arc<A>, settings: CacheSettings) -> Self {
        Self {
            subnets: SubnetProvider::new(Arc::clone(&api), settings),
            zones: TtlCache::new("zones", settings),
            api,
        }
    }

    /// Every zone in the region.
    pub async fn get_all_zones(&self) -> ProviderResult<Vec<AvailabilityZone>> {
        self.zones
            .get_or_try_fetch(ALL_ZONES_KEY.to_string(), || async {
                self.api
                    .describe_availability_zones()
                    .await
                    .map_err(ProviderError::RetrievingZones)
            })
            .await
    }

    /// Zone names where the cluster has at least one subnet.
    pub async fn get_zones(&self, cluster_name: &str) -> ProviderResult<Vec<String>> {
        let zonal = self.subnets.get(cluster_name).await?;
        Ok(zonal.into_keys().collect())
    }

    /// Resolve zone names or ids to zone names. Unknown zones are dropped.
    pub async fn normalize_zones(&self, zones: &[String]) -> ProviderResult<Vec<String>> {
        let all = self.get_all_zones().await?;
        let mut names = Vec::new();
        for zone in zones {
            for az in &all {
                if *zone == az.zone_name || *zone == az.zone_id {
                    names.push(az.zone_name.clone());
                }
            }
        }
        Ok(names)
    }

    /// The cluster's subnets, limited to the zones `constraints` allow.
    ///
    /// No zone constraint means every zone with a subnet qualifies.
    pub async fn get_zonal_subnets(
        &self,
        constraints: &Constraints,
        cluster_name: &str,
    ) -> ProviderResult<ZonalSubnets> {
        let mut zonal = self
            .subnets
            .get(cluster_name)
            .await
            .map_err(|e| ProviderError::ZonalSubnets(Box::new(e)))?;

        if !constraints.zones.is_empty() {
            let allowed = self.normalize_zones(&constraints.zones).await?;
            zonal.retain(|zone, _| allowed.contains(zone));
        }

        if zonal.is_empty() {
            return Err(ProviderError::NoViableSubnets);
        }
        Ok(zonal)
    }

    /// Sweep both caches until `shutdown` changes.
    pub async fn run_cache_cleanup(&self, shutdown: tokio::sync::watch::Receiver<bool>) {
        tokio::join!(
            self.zones.run_cleanup(shutdown.clone()),
            self.subnets.cache().run_cleanup(shutdown),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{CloudOp, InMemoryCloud};
    use crate::error::ApiError;
    use std::time::Duration;

    fn zone(name: &str, id: &str) -> AvailabilityZone {
        AvailabilityZone {
            zone_name: name.to_string(),
            zone_id: id.to_string(),
        }
    }

    fn subnet(id: &str, zone: &str, cluster: &str) -> Subnet {
        Subnet {
            subnet_id: id.to_string(),
            availability_zone: zone.to_string(),
            tags: BTreeMap::from([(cluster_tag_key(cluster), "owned".to_string())]),
        }
    }

    fn cloud() -> Arc<InMemoryCloud> {
        Arc::new(InMemoryCloud::new(
            vec![
                zone("us-west-2a", "usw2-az1"),
                zone("us-west-2b", "usw2-az2"),
                zone("us-west-2c", "usw2-az3"),
            ],
            vec![
                subnet("subnet-a1", "us-west-2a", "prod"),
                subnet("subnet-a2", "us-west-2a", "prod"),
                subnet("subnet-b1", "us-west-2b", "prod"),
                subnet("subnet-c1", "us-west-2c", "staging"),
            ],
        ))
    }

    fn zones(names: &[&str]) -> Constraints {
        Constraints {
            zones: names.iter().map(|z| z.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn cluster_tag_format() {
        assert_eq!(cluster_tag_key("prod"), "kubernetes.io/cluster/prod");
    }

    #[tokio::test]
    async fn subnets_grouped_by_zone() {
        let subnets = SubnetProvider::new(cloud(), CacheSettings::default());

        let zonal = subnets.get("prod").await.unwrap();

        assert_eq!(zonal.len(), 2);
        assert_eq!(zonal["us-west-2a"].len(), 2);
        assert_eq!(zonal["us-west-2b"][0].subnet_id, "subnet-b1");
    }

    #[tokio::test]
    async fn subnet_lookups_are_cached_per_cluster() {
        let api = cloud();
        let subnets = SubnetProvider::new(Arc::clone(&api), CacheSettings::default());

        subnets.get("prod").await.unwrap();
        subnets.get("prod").await.unwrap();
        subnets.get("staging").await.unwrap();

        assert_eq!(api.calls(CloudOp::DescribeSubnets), 2);
    }

    #[tokio::test]
    async fn all_zones_cached() {
        let api = cloud();
        let vpc = VpcProvider::new(Arc::clone(&api), CacheSettings::default());

        assert_eq!(vpc.get_all_zones().await.unwrap().len(), 3);
        assert_eq!(vpc.get_all_zones().await.unwrap().len(), 3);

        assert_eq!(api.calls(CloudOp::DescribeAvailabilityZones), 1);
    }

    #[tokio::test]
    async fn zones_refetched_after_ttl() {
        let api = cloud();
        let settings = CacheSettings {
            ttl: Duration::from_millis(30),
            ..Default::default()
        };
        let vpc = VpcProvider::new(Arc::clone(&api), settings);

        vpc.get_all_zones().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        vpc.get_all_zones().await.unwrap();

        assert_eq!(api.calls(CloudOp::DescribeAvailabilityZones), 2);
    }

    #[tokio::test]
    async fn cluster_zones() {
        let vpc = VpcProvider::new(cloud(), CacheSettings::default());
        assert_eq!(vpc.get_zones("prod").await.unwrap(), vec!["us-west-2a", "us-west-2b"]);
    }

    #[tokio::test]
    async fn normalizes_ids_and_names() {
        let vpc = VpcProvider::new(cloud(), CacheSettings::default());

        let names = vpc
            .normalize_zones(&["usw2-az2".to_string(), "us-west-2a".to_string(), "mars-1a".to_string()])
            .await
            .unwrap();

        assert_eq!(names, vec!["us-west-2b", "us-west-2a"]);
    }

    #[tokio::test]
    async fn unconstrained_uses_every_cluster_zone() {
        let vpc = VpcProvider::new(cloud(), CacheSettings::default());

        let zonal = vpc.get_zonal_subnets(&Constraints::default(), "prod").await.unwrap();

        assert_eq!(zonal.keys().collect::<Vec<_>>(), vec!["us-west-2a", "us-west-2b"]);
    }

    #[tokio::test]
    async fn constrained_by_zone_id() {
        let vpc = VpcProvider::new(cloud(), CacheSettings::default());

        let zonal = vpc.get_zonal_subnets(&zones(&["usw2-az2"]), "prod").await.unwrap();

        assert_eq!(zonal.keys().collect::<Vec<_>>(), vec!["us-west-2b"]);
    }

    #[tokio::test]
    async fn no_overlap_is_an_error() {
        let vpc = VpcProvider::new(cloud(), CacheSettings::default());

        let err = vpc
            .get_zonal_subnets(&zones(&["us-west-2c"]), "prod")
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::NoViableSubnets));
        assert_eq!(err.to_string(), "failed to find viable zonal subnet pairing");
    }

    #[tokio::test]
    async fn cluster_without_subnets_is_an_error() {
        let vpc = VpcProvider::new(cloud(), CacheSettings::default());
        let err = vpc.get_zonal_subnets(&Constraints::default(), "dev").await.unwrap_err();
        assert!(matches!(err, ProviderError::NoViableSubnets));
    }

    #[tokio::test]
    async fn api_failures_carry_context() {
        let api = cloud();
        api.fail(CloudOp::DescribeSubnets, ApiError::Service("unavailable".into()));
        let vpc = VpcProvider::new(Arc::clone(&api), CacheSettings::default());

        let err = vpc
            .get_zonal_subnets(&Constraints::default(), "prod")
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "getting zonal subnets, describing subnets, service error: unavailable"
        );

        // Failures are not cached.
        api.clear_failures();
        assert!(vpc.get_zonal_subnets(&Constraints::default(), "prod").await.is_ok());
    }

    #[tokio::test]
    async fn zone_listing_failure() {
        let api = cloud();
        api.fail(CloudOp::DescribeAvailabilityZones, ApiError::Throttled("rate".into()));
        let vpc = VpcProvider::new(Arc::clone(&api), CacheSettings::default());

        let err = vpc.get_zonal_subnets(&zones(&["us-west-2a"]), "prod").await.unwrap_err();

        assert!(matches!(err, ProviderError::RetrievingZones(_)));
    }

    #[tokio::test]
    async fn cache_cleanup_stops_on_shutdown() {
        let settings = CacheSettings {
            ttl: Duration::from_millis(10),
            cleanup_interval: Duration::from_millis(10),
        };
        let vpc = Arc::new(VpcProvider::new(cloud(), settings));
        vpc.get_zones("prod").await.unwrap();

        let (tx, rx) = tokio::sync::watch::channel(false);
        let sweeper = Arc::clone(&vpc);
        let handle = tokio::spawn(async move { sweeper.run_cache_cleanup(rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(vpc.subnets.cache().is_empty());

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
