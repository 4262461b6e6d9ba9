//! Per-node overhead accounting.
//!
//! Before any workload is packed, a node gives up capacity to the kubelet,
//! the container runtime and the system daemons. The amount is a pure
//! function of the node's total capacity, expressed by [`OverheadPolicy`].

use nodepack_core::config::OverheadConfig;
use nodepack_core::resources::{CPU, MEMORY, PODS, Quantity, ResourceList, quantity};

/// Capacity a node reserves for itself, as a function of its total capacity.
pub trait OverheadPolicy: Send + Sync {
    fn overhead(&self, capacity: &ResourceList) -> ResourceList;
}

impl<F> OverheadPolicy for F
where
    F: Fn(&ResourceList) -> ResourceList + Send + Sync,
{
    fn overhead(&self, capacity: &ResourceList) -> ResourceList {
        self(capacity)
    }
}

/// Reserves nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOverhead;

impl OverheadPolicy for NoOverhead {
    fn overhead(&self, _capacity: &ResourceList) -> ResourceList {
        ResourceList::new()
    }
}

/// CPU reservation tiers: (upper bound in milli-CPU, rate in 1/10000).
///
/// 6% of the first core, 1% of the second, 0.5% of cores three and four,
/// 0.25% of everything above.
const CPU_TIERS: [(u64, u64); 4] = [(1_000, 600), (2_000, 100), (4_000, 50), (u64::MAX, 25)];

const BASE_MEMORY_MIB: u64 = 255;
const MEMORY_PER_POD_MIB: u64 = 11;

/// Kubelet and system reservation derived from node size.
#[derive(Debug, Clone)]
pub struct KubeletOverhead {
    /// Memory kept free for the kubelet's hard eviction threshold.
    pub eviction_threshold: Quantity,
    /// Pod density assumed when the capacity has no `pods` dimension.
    pub default_max_pods: u64,
}

impl Default for KubeletOverhead {
    fn default() -> Self {
        Self::from_config(&OverheadConfig::default())
    }
}

impl KubeletOverhead {
    pub fn from_config(config: &OverheadConfig) -> Self {
        Self {
            eviction_threshold: config.eviction_threshold,
            default_max_pods: config.default_max_pods,
        }
    }

    fn reserved_cpu(capacity: Quantity) -> Quantity {
        let total = capacity.milli();
        let mut lower = 0u64;
        let mut reserved = 0u128;
        for (upper, rate) in CPU_TIERS {
            if total <= lower {
                break;
            }
            let span = total.min(upper) - lower;
            reserved += u128::from(span) * u128::from(rate);
            lower = upper;
        }
        let milli = reserved.div_ceil(10_000);
        Quantity::from_milli(u64::try_from(milli).unwrap_or(u64::MAX))
    }

    fn reserved_memory(&self, capacity: &ResourceList) -> Quantity {
        let max_pods = match capacity.get(PODS) {
            Some(pods) => pods.units_ceil(),
            None => self.default_max_pods,
        };
        let mib = BASE_MEMORY_MIB.saturating_add(MEMORY_PER_POD_MIB.saturating_mul(max_pods));
        Quantity::from_mebibytes(mib).saturating_add(self.eviction_threshold)
    }
}

impl OverheadPolicy for KubeletOverhead {
    fn overhead(&self, capacity: &ResourceList) -> ResourceList {
        let mut reserved = ResourceList::new();
        reserved.insert(CPU.to_string(), Self::reserved_cpu(quantity(capacity, CPU)));
        reserved.insert(MEMORY.to_string(), self.reserved_memory(capacity));
        reserved
    }
}

/// Pick the policy a config asks for.
pub fn policy_from_config(config: &OverheadConfig) -> Box<dyn OverheadPolicy> {
    if config.kubelet {
        Box::new(KubeletOverhead::from_config(config))
    } else {
        Box::new(NoOverhead)
    }
}
