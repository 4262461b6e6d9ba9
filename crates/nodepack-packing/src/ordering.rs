//! Ordering helpers: largest-first pod order and instance size ranking.

use std::cmp::Ordering;

use nodepack_core::{InstanceDescriptor, SizeMetric, WorkloadUnit};

/// Compare two pods by CPU request, then memory request.
pub fn compare_by_requests(a: &WorkloadUnit, b: &WorkloadUnit) -> Ordering {
    a.cpu()
        .cmp(&b.cpu())
        .then_with(|| a.memory().cmp(&b.memory()))
}

/// Sort pods in decreasing request order. Stable, so equal pods keep
/// their input order.
pub fn sort_largest_first(pods: &mut [&WorkloadUnit]) {
    pods.sort_by(|a, b| compare_by_requests(b, a));
}

/// Size of an instance type under the given metric. Larger instances
/// always score higher on both dimensions.
pub fn instance_size(metric: SizeMetric, instance: &InstanceDescriptor) -> f64 {
    let vcpus = instance.vcpus();
    let memory = instance.memory_gib();
    match metric {
        SizeMetric::Euclidean => (vcpus * vcpus + memory * memory).sqrt(),
        // Saturates to infinity for very large instances; those then tie
        // and keep their relative order.
        SizeMetric::Exponential => (2f64.powf(vcpus) + 2f64.powf(memory)).sqrt(),
    }
}

/// Sort instance types ascending by size. Stable.
pub fn sort_by_size(metric: SizeMetric, instances: &mut [InstanceDescriptor]) {
    instances.sort_by(|a, b| instance_size(metric, a).total_cmp(&instance_size(metric, b)));
}
