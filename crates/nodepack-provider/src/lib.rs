//! nodepack provider — turns packings into launched nodes.
//!
//! # Components
//!
//! - **`cache`** — keyed TTL cache with single-flight refresh
//! - **`cloud`** — the compute API abstraction and an in-memory backend
//! - **`vpc`** — zone and subnet discovery for a cluster
//! - **`capacity`** — the node-lifecycle capability and its catalog-backed implementation
//! - **`error`** — API and provider errors

pub mod cache;
pub mod capacity;
pub mod cloud;
pub mod error;
pub mod vpc;

pub use cache::{CacheSettings, CacheStats, TtlCache};
pub use capacity::{CapacityRequest, CatalogProvider, CloudProvider, Node, NodePacking, ProvisionerSpec};
pub use cloud::{AvailabilityZone, CloudApi, CloudOp, InMemoryCloud, Instance, LaunchRequest, Subnet, normalize_architecture};
pub use error::{ApiError, ProviderError, ProviderResult};
pub use vpc::{SubnetProvider, VpcProvider, ZonalSubnets, cluster_tag_key};
