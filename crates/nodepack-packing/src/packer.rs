//! Packer — groups pending pods into node-sized packings.
//!
//! First-Fit-Decreasing across every candidate instance type:
//! 1. Pods are sorted largest first (CPU, then memory).
//! 2. Each instance type gets a ledger after its overhead is reserved;
//!    instance types that cannot hold their own overhead are excluded.
//! 3. Each round, every ledger greedily packs the remaining pods on a fresh
//!    copy. The instance type packing the most pods wins; instance types
//!    that pack exactly the same pods join it as alternatives.
//! 4. A round where nothing fits the largest remaining pod marks that pod
//!    unplaced and moves on.
//!
//! Alternatives in a packing are sorted ascending by size so a launcher
//! tries the smallest option first and falls back to larger ones when the
//! provider is out of capacity.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use nodepack_core::{Constraints, InstanceDescriptor, NodepackConfig, SizeMetric, WorkloadUnit, merge};

use crate::ledger::ResourceLedger;
use crate::ordering::{sort_by_size, sort_largest_first};
use crate::overhead::{KubeletOverhead, OverheadPolicy, policy_from_config};

/// Pods that share one node, and the instance types that can each host
/// all of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Packing {
    pub pods: Vec<WorkloadUnit>,
    /// Interchangeable instance types, smallest first.
    pub instance_types: Vec<InstanceDescriptor>,
}

/// Everything one packing computation decided.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PackReport {
    pub packings: Vec<Packing>,
    /// Pods no instance type can host on its own.
    pub unplaced: Vec<WorkloadUnit>,
    /// Instance types dropped because their overhead exceeds capacity.
    pub excluded: Vec<String>,
}

/// Computes node packings for a batch of pods.
///
/// The order of `instance_types` is a caller contract: when several
/// instance types pack the same number of pods, the first one seen decides
/// which pods form the packing, and later ones join as alternatives only if
/// they pack exactly the same pods.
pub trait Packer {
    fn pack(
        &self,
        pods: &[WorkloadUnit],
        instance_types: &[InstanceDescriptor],
        constraints: &Constraints,
    ) -> Vec<Packing>;
}

/// First-Fit-Decreasing packer with instance-type diversification.
///
/// Holds no per-call state; one packer can serve concurrent calls.
#[derive(Clone)]
pub struct FfdPacker {
    overhead: Arc<dyn OverheadPolicy>,
    size_metric: SizeMetric,
}

impl fmt::Debug for FfdPacker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FfdPacker")
            .field("size_metric", &self.size_metric)
            .finish_non_exhaustive()
    }
}

impl Default for FfdPacker {
    fn default() -> Self {
        Self::new()
    }
}

/// One instance type and its capacity after overhead.
struct Candidate<'a> {
    instance: &'a InstanceDescriptor,
    ledger: ResourceLedger,
}

/// Result of greedily filling one ledger.
#[derive(Default)]
struct Attempt<'a> {
    packed: Vec<&'a WorkloadUnit>,
    unpacked: Vec<&'a WorkloadUnit>,
}

/// Best attempt of one round and the instance types that produced it.
struct Round<'a> {
    packed: Vec<&'a WorkloadUnit>,
    remaining: Vec<&'a WorkloadUnit>,
    instances: Vec<&'a InstanceDescriptor>,
}

impl FfdPacker {
    /// Packer with kubelet overhead and the Euclidean size metric.
    pub fn new() -> Self {
        Self {
            overhead: Arc::new(KubeletOverhead::default()),
            size_metric: SizeMetric::default(),
        }
    }

    pub fn from_config(config: &NodepackConfig) -> Self {
        Self {
            overhead: Arc::from(policy_from_config(&config.overhead)),
            size_metric: config.packing.size_metric,
        }
    }

    pub fn with_overhead(mut self, policy: impl OverheadPolicy + 'static) -> Self {
        self.overhead = Arc::new(policy);
        self
    }

    pub fn with_size_metric(mut self, metric: SizeMetric) -> Self {
        self.size_metric = metric;
        self
    }

    pub fn size_metric(&self) -> SizeMetric {
        self.size_metric
    }

    /// Pack `pods` and report packings, unplaced pods and excluded
    /// instance types.
    pub fn plan(
        &self,
        pods: &[WorkloadUnit],
        instance_types: &[InstanceDescriptor],
        constraints: &Constraints,
    ) -> PackReport {
        let mut report = PackReport::default();

        let mut remaining: Vec<&WorkloadUnit> = pods.iter().collect();
        sort_largest_first(&mut remaining);

        let candidates = self.candidates(instance_types, constraints, &mut report.excluded);

        while !remaining.is_empty() {
            let round = pack_with_largest_pod(&remaining, &candidates);

            if round.packed.is_empty() {
                let pod = remaining.remove(0);
                warn!(
                    pod = %pod.key(),
                    cpu = %pod.cpu(),
                    memory = %pod.memory(),
                    "failed to find instance type for pod"
                );
                report.unplaced.push(pod.clone());
                continue;
            }

            let mut options: Vec<InstanceDescriptor> =
                round.instances.into_iter().cloned().collect();
            sort_by_size(self.size_metric, &mut options);

            debug!(
                options = options.len(),
                pods = round.packed.len(),
                instance_types = ?options.iter().map(|it| it.name.as_str()).collect::<Vec<_>>(),
                "selected instance type options"
            );

            report.packings.push(Packing {
                pods: round.packed.into_iter().cloned().collect(),
                instance_types: options,
            });
            remaining = round.remaining;
        }

        report
    }

    /// Ledgers for every instance type that can hold its overhead.
    fn candidates<'a>(
        &self,
        instance_types: &'a [InstanceDescriptor],
        constraints: &Constraints,
        excluded: &mut Vec<String>,
    ) -> Vec<Candidate<'a>> {
        let mut candidates = Vec::with_capacity(instance_types.len());
        for instance in instance_types {
            let overhead = merge(&constraints.overhead, &self.overhead.overhead(&instance.capacity));
            match ResourceLedger::derive_from(instance, &overhead) {
                Some(ledger) => candidates.push(Candidate { instance, ledger }),
                None => {
                    info!(
                        instance_type = %instance.name,
                        "excluding instance type, not enough resources for overhead"
                    );
                    excluded.push(instance.name.clone());
                }
            }
        }
        candidates
    }
}

impl Packer for FfdPacker {
    fn pack(
        &self,
        pods: &[WorkloadUnit],
        instance_types: &[InstanceDescriptor],
        constraints: &Constraints,
    ) -> Vec<Packing> {
        self.plan(pods, instance_types, constraints).packings
    }
}

/// Find the instance type(s) packing the most of `pods`, which must start
/// with the largest pod.
fn pack_with_largest_pod<'a>(pods: &[&'a WorkloadUnit], candidates: &[Candidate<'a>]) -> Round<'a> {
    let mut best = Round {
        packed: Vec::new(),
        remaining: pods.to_vec(),
        instances: Vec::new(),
    };

    for candidate in candidates {
        let attempt = pack_for_capacity(&candidate.ledger, pods);
        if attempt.packed.is_empty() {
            continue;
        }
        if same_pods(&best.packed, &attempt.packed) {
            // Same pods fit: an alternative if the first choice is out of capacity.
            best.instances.push(candidate.instance);
        } else if attempt.packed.len() > best.packed.len() {
            best = Round {
                packed: attempt.packed,
                remaining: attempt.unpacked,
                instances: vec![candidate.instance],
            };
        }
    }

    best
}

/// Greedily reserve `pods` in order on a copy of `ledger`.
///
/// If the first pod does not fit the attempt is abandoned; later misses
/// are set aside so smaller pods can still fill the gap.
fn pack_for_capacity<'a>(ledger: &ResourceLedger, pods: &[&'a WorkloadUnit]) -> Attempt<'a> {
    let mut ledger = ledger.clone();
    let mut attempt = Attempt::default();
    for &pod in pods {
        if ledger.reserve_for(pod) {
            attempt.packed.push(pod);
            continue;
        }
        if attempt.packed.is_empty() {
            return Attempt {
                packed: Vec::new(),
                unpacked: pods.to_vec(),
            };
        }
        attempt.unpacked.push(pod);
    }
    attempt
}

/// Whether two pod lists hold the same pod identities, ignoring order.
fn same_pods(first: &[&WorkloadUnit], second: &[&WorkloadUnit]) -> bool {
    if first.len() != second.len() {
        return false;
    }
    let mut seen: BTreeMap<(&str, &str), i64> = BTreeMap::new();
    for pod in first {
        *seen.entry((pod.namespace.as_str(), pod.name.as_str())).or_default() += 1;
    }
    for pod in second {
        *seen.entry((pod.namespace.as_str(), pod.name.as_str())).or_default() -= 1;
    }
    seen.values().all(|count| *count == 0)
}

/// Pods from `pods` that appear in none of `packings`.
///
/// Identity is the namespace-qualified name, counted as a multiset.
pub fn unplaced(pods: &[WorkloadUnit], packings: &[Packing]) -> Vec<WorkloadUnit> {
    let mut packed: HashMap<String, usize> = HashMap::new();
    for pod in packings.iter().flat_map(|p| &p.pods) {
        *packed.entry(pod.key()).or_default() += 1;
    }
    pods.iter()
        .filter(|pod| match packed.get_mut(&pod.key()) {
            Some(count) if *count > 0 => {
                *count -= 1;
                false
            }
            _ => true,
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overhead::NoOverhead;
    use nodepack_core::ResourceList;
    use nodepack_core::resources::parse_list;

    fn pod(name: &str, cpu: &str, mem: &str) -> WorkloadUnit {
        WorkloadUnit::new("default", name, parse_list([("cpu", cpu), ("memory", mem)]).unwrap())
    }

    fn instance(name: &str, cpu: &str, mem: &str) -> InstanceDescriptor {
        InstanceDescriptor::new(name, parse_list([("cpu", cpu), ("memory", mem)]).unwrap())
            .with_zones(["us-east-1a"])
    }

    fn packer() -> FfdPacker {
        FfdPacker::new().with_overhead(NoOverhead)
    }

    fn pod_names(packing: &Packing) -> Vec<&str> {
        packing.pods.iter().map(|p| p.name.as_str()).collect()
    }

    fn instance_names(packing: &Packing) -> Vec<&str> {
        packing.instance_types.iter().map(|i| i.name.as_str()).collect()
    }

    #[test]
    fn three_pods_two_packings_on_one_type() {
        let pods = vec![pod("a", "2", "4Gi"), pod("b", "2", "4Gi"), pod("c", "2", "4Gi")];
        let instances = vec![instance("m5.xlarge", "4", "8Gi")];

        let report = packer().plan(&pods, &instances, &Constraints::default());

        assert_eq!(report.packings.len(), 2);
        assert_eq!(pod_names(&report.packings[0]), vec!["a", "b"]);
        assert_eq!(pod_names(&report.packings[1]), vec!["c"]);
        for packing in &report.packings {
            assert_eq!(instance_names(packing), vec!["m5.xlarge"]);
        }
        assert!(report.unplaced.is_empty());
    }

    #[test]
    fn oversized_pod_is_unplaced() {
        let pods = vec![pod("huge", "100", "1Gi")];
        let instances = vec![instance("a", "8", "32Gi"), instance("b", "4", "16Gi")];

        let report = packer().plan(&pods, &instances, &Constraints::default());

        assert!(report.packings.is_empty());
        assert_eq!(report.unplaced, pods);
    }

    #[test]
    fn unplaced_pod_does_not_abort_the_run() {
        let pods = vec![pod("small", "1", "1Gi"), pod("huge", "100", "1Gi")];
        let instances = vec![instance("a", "8", "32Gi")];

        let report = packer().plan(&pods, &instances, &Constraints::default());

        assert_eq!(report.packings.len(), 1);
        assert_eq!(pod_names(&report.packings[0]), vec!["small"]);
        assert_eq!(report.unplaced.len(), 1);
        assert_eq!(report.unplaced[0].name, "huge");
    }

    #[test]
    fn identical_capacity_types_are_diversified() {
        let pods = vec![pod("a", "1", "2Gi"), pod("b", "1", "2Gi")];
        // Equal size keeps input order.
        let instances = vec![
            instance("m5.large", "2", "8Gi"),
            instance("m5a.large", "2", "8Gi"),
        ];

        let packings = packer().pack(&pods, &instances, &Constraints::default());

        assert_eq!(packings.len(), 1);
        assert_eq!(instance_names(&packings[0]), vec!["m5.large", "m5a.large"]);
    }

    #[test]
    fn alternatives_sorted_by_size() {
        let pods = vec![pod("a", "1", "1Gi")];
        let instances = vec![
            instance("xlarge", "4", "16Gi"),
            instance("large", "2", "8Gi"),
            instance("2xlarge", "8", "32Gi"),
        ];

        let packings = packer().pack(&pods, &instances, &Constraints::default());

        assert_eq!(packings.len(), 1);
        assert_eq!(instance_names(&packings[0]), vec!["large", "xlarge", "2xlarge"]);
    }

    #[test]
    fn larger_packing_replaces_best() {
        let pods = vec![pod("a", "2", "1Gi"), pod("b", "2", "1Gi"), pod("c", "2", "1Gi")];
        let instances = vec![instance("small", "2", "4Gi"), instance("big", "6", "4Gi")];

        let packings = packer().pack(&pods, &instances, &Constraints::default());

        assert_eq!(packings.len(), 1);
        assert_eq!(pod_names(&packings[0]), vec!["a", "b", "c"]);
        assert_eq!(instance_names(&packings[0]), vec!["big"]);
    }

    #[test]
    fn equal_count_different_pods_is_not_an_alternative() {
        // cpu-heavy fits {a, c}; mem-heavy fits {a, b}. Same count, different pods.
        let pods = vec![
            pod("a", "2", "2Gi"),
            pod("b", "1500m", "6Gi"),
            pod("c", "1", "1Gi"),
        ];
        let instances = vec![
            instance("cpu-heavy", "3", "4Gi"),
            instance("mem-heavy", "4", "8Gi"),
        ];

        let packings = packer().pack(&pods, &instances, &Constraints::default());

        assert_eq!(pod_names(&packings[0]), vec!["a", "c"]);
        assert_eq!(instance_names(&packings[0]), vec!["cpu-heavy"]);
    }

    #[test]
    fn smaller_pods_fill_gaps_after_a_miss() {
        let pods = vec![pod("a", "3", "1Gi"), pod("b", "2", "1Gi"), pod("c", "1", "1Gi")];
        let instances = vec![instance("m", "4", "8Gi")];

        let packings = packer().pack(&pods, &instances, &Constraints::default());

        assert_eq!(pod_names(&packings[0]), vec!["a", "c"]);
        assert_eq!(pod_names(&packings[1]), vec!["b"]);
    }

    #[test]
    fn instance_unable_to_fit_largest_pod_is_skipped() {
        // "tiny" could fit b and c but never a, so it is not a candidate
        // in the first round.
        let pods = vec![pod("a", "4", "1Gi"), pod("b", "1", "1Gi"), pod("c", "1", "1Gi")];
        let instances = vec![instance("tiny", "2", "8Gi"), instance("big", "4", "8Gi")];

        let packings = packer().pack(&pods, &instances, &Constraints::default());

        assert_eq!(pod_names(&packings[0]), vec!["a"]);
        assert_eq!(instance_names(&packings[0]), vec!["big"]);
        assert_eq!(pod_names(&packings[1]), vec!["b", "c"]);
        assert_eq!(instance_names(&packings[1]), vec!["tiny", "big"]);
    }

    #[test]
    fn overhead_excludes_instance_type() {
        let pods = vec![pod("a", "100m", "64Mi")];
        let instances = vec![instance("nano", "2", "512Mi"), instance("large", "2", "8Gi")];

        let report = FfdPacker::new().plan(&pods, &instances, &Constraints::default());

        assert_eq!(report.excluded, vec!["nano".to_string()]);
        assert_eq!(report.packings.len(), 1);
        assert_eq!(instance_names(&report.packings[0]), vec!["large"]);
    }

    #[test]
    fn constraint_overhead_is_added_to_policy_overhead() {
        let constraints = Constraints {
            overhead: parse_list([("cpu", "1")]).unwrap(),
            ..Default::default()
        };
        let fixed = |_: &ResourceList| parse_list([("cpu", "1")]).unwrap();
        let pods = vec![pod("a", "2", "1Gi")];

        let fits = FfdPacker::new()
            .with_overhead(fixed)
            .pack(&pods, &[instance("four", "4", "8Gi")], &constraints);
        assert_eq!(fits.len(), 1);

        let report = FfdPacker::new()
            .with_overhead(fixed)
            .plan(&pods, &[instance("three", "3", "8Gi")], &constraints);
        assert!(report.packings.is_empty());
        assert_eq!(report.unplaced.len(), 1);
    }

    #[test]
    fn extended_resources_constrain_packing() {
        let gpu_pod = WorkloadUnit::new(
            "ml",
            "train",
            parse_list([("cpu", "1"), ("memory", "1Gi"), ("nvidia.com/gpu", "1")]).unwrap(),
        );
        let cpu_only = instance("c5.xlarge", "4", "8Gi");
        let gpu = InstanceDescriptor::new(
            "p3.2xlarge",
            parse_list([("cpu", "8"), ("memory", "61Gi"), ("nvidia.com/gpu", "1")]).unwrap(),
        );

        let packings = packer().pack(&[gpu_pod], &[cpu_only, gpu], &Constraints::default());

        assert_eq!(instance_names(&packings[0]), vec!["p3.2xlarge"]);
    }

    #[test]
    fn empty_inputs() {
        let report = packer().plan(&[], &[instance("m", "1", "1Gi")], &Constraints::default());
        assert_eq!(report, PackReport::default());

        let pods = vec![pod("a", "1", "1Gi")];
        let report = packer().plan(&pods, &[], &Constraints::default());
        assert!(report.packings.is_empty());
        assert_eq!(report.unplaced, pods);
    }

    #[test]
    fn inputs_are_not_reordered() {
        let pods = vec![pod("small", "1", "1Gi"), pod("big", "2", "1Gi")];
        let instances = vec![instance("m", "4", "8Gi")];
        let pods_before = pods.clone();

        let _ = packer().pack(&pods, &instances, &Constraints::default());

        assert_eq!(pods, pods_before);
    }

    #[test]
    fn same_pods_is_order_independent() {
        let a = pod("a", "1", "1Gi");
        let b = pod("b", "1", "1Gi");
        let c = pod("c", "1", "1Gi");

        assert!(same_pods(&[&a, &b], &[&b, &a]));
        assert!(!same_pods(&[&a, &b], &[&a, &c]));
        assert!(!same_pods(&[&a], &[&a, &b]));
        assert!(same_pods(&[], &[]));
    }

    #[test]
    fn unplaced_is_the_set_difference() {
        let pods = vec![pod("a", "1", "1Gi"), pod("b", "100", "1Gi"), pod("c", "1", "1Gi")];
        let instances = vec![instance("m", "4", "8Gi")];

        let packings = packer().pack(&pods, &instances, &Constraints::default());
        let missing = unplaced(&pods, &packings);

        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].name, "b");
    }

    #[test]
    fn from_config_uses_metric_and_overhead() {
        let config = NodepackConfig::from_toml_str(
            "[packing]\nsize_metric = \"exponential\"\n[overhead]\nkubelet = false\n",
        )
        .unwrap();
        let packer = FfdPacker::from_config(&config);
        assert_eq!(packer.size_metric(), SizeMetric::Exponential);

        // Without kubelet overhead a pod can use the whole node.
        let pods = vec![pod("a", "2", "4Gi")];
        let packings = packer.pack(&pods, &[instance("exact", "2", "4Gi")], &Constraints::default());
        assert_eq!(packings.len(), 1);
    }

    #[test]
    fn packing_never_exceeds_pod_capacity() {
        let pods: Vec<WorkloadUnit> = (0..6).map(|i| pod(&format!("p{i}"), "100m", "64Mi")).collect();
        let instances = vec![
            InstanceDescriptor::new("t3.small", parse_list([("cpu", "2"), ("memory", "4Gi"), ("pods", "4")]).unwrap())
                .with_zones(["us-east-1a"]),
        ];

        let report = packer().plan(&pods, &instances, &Constraints::default());

        let sizes: Vec<usize> = report.packings.iter().map(|p| p.pods.len()).collect();
        assert_eq!(sizes, vec![4, 2]);
        assert!(report.unplaced.is_empty());
    }
}
