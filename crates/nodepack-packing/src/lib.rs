//! nodepack packing engine — First-Fit-Decreasing bin packing of pending
//! pods onto new nodes.
//!
//! This crate decides which pods should share a newly launched node and
//! which instance types could host each group. It performs no I/O and
//! holds no state between calls; launching the nodes is the provider's job
//! (`nodepack-provider`).
//!
//! # Components
//!
//! - **`ledger`** — per-instance-type remaining capacity, all-or-nothing reservation
//! - **`overhead`** — capacity a node reserves for kubelet and system daemons
//! - **`ordering`** — largest-first pod order and instance size ranking
//! - **`packer`** — the packing loop and instance-type diversification

pub mod ledger;
pub mod ordering;
pub mod overhead;
pub mod packer;

pub use ledger::ResourceLedger;
pub use ordering::{instance_size, sort_by_size, sort_largest_first};
pub use overhead::{KubeletOverhead, NoOverhead, OverheadPolicy, policy_from_config};
pub use packer::{FfdPacker, PackReport, Packer, Packing, unplaced};
