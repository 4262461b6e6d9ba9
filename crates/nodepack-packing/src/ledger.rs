//! Per-instance-type capacity ledger.
//!
//! A [`ResourceLedger`] tracks how much of one instance type's capacity is
//! still free during a single packing computation. Reservations are
//! all-or-nothing across dimensions: every dimension is checked before any
//! is decremented, so a failed reservation leaves the ledger untouched.

use nodepack_core::resources::PODS;
use nodepack_core::{InstanceDescriptor, Quantity, ResourceList, WorkloadUnit};

/// Remaining capacity of one instance type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLedger {
    total: ResourceList,
    remaining: ResourceList,
}

impl ResourceLedger {
    /// A ledger with nothing reserved yet.
    pub fn new(total: ResourceList) -> Self {
        Self {
            remaining: total.clone(),
            total,
        }
    }

    /// Derive a ledger for an instance type after reserving `overhead`.
    ///
    /// Returns `None` when the instance cannot even hold its own overhead;
    /// such an instance type is not a packing candidate.
    pub fn derive_from(descriptor: &InstanceDescriptor, overhead: &ResourceList) -> Option<Self> {
        let mut ledger = Self::new(descriptor.capacity.clone());
        ledger.reserve(overhead).then_some(ledger)
    }

    pub fn total(&self) -> &ResourceList {
        &self.total
    }

    pub fn remaining(&self) -> &ResourceList {
        &self.remaining
    }

    /// Reserve `requested` on every dimension, or on none.
    ///
    /// A dimension the instance does not have counts as zero capacity, so
    /// only a zero request for it succeeds.
    pub fn reserve(&mut self, requested: &ResourceList) -> bool {
        let Some(updates) = self.updates(requested) else {
            return false;
        };
        for (dimension, value) in updates {
            self.remaining.insert(dimension.to_string(), value);
        }
        true
    }

    /// Reserve a pod's requests, plus one pod slot when the instance
    /// declares a `pods` capacity.
    pub fn reserve_for(&mut self, pod: &WorkloadUnit) -> bool {
        if !self.total.contains_key(PODS) {
            return self.reserve(&pod.requests);
        }
        let mut requested = pod.requests.clone();
        let slots = requested.entry(PODS.to_string()).or_insert(Quantity::ZERO);
        *slots = slots.saturating_add(Quantity::from_units(1));
        self.reserve(&requested)
    }

    /// New remaining values for every non-zero requested dimension, or
    /// `None` if any dimension is short.
    fn updates<'a>(&self, requested: &'a ResourceList) -> Option<Vec<(&'a str, Quantity)>> {
        let mut updates = Vec::with_capacity(requested.len());
        for (dimension, amount) in requested {
            if amount.is_zero() {
                continue;
            }
            let available = self.remaining.get(dimension).copied()?;
            updates.push((dimension.as_str(), available.checked_sub(*amount)?));
        }
        Some(updates)
    }
}
