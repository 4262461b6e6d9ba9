//! nodepack-core — resource quantities, workload and instance types, and
//! configuration shared by every nodepack crate.

pub mod config;
pub mod resources;
pub mod types;

pub use config::{ConfigError, NodepackConfig, SizeMetric};
pub use resources::{Quantity, QuantityError, ResourceList, merge};
pub use types::*;
