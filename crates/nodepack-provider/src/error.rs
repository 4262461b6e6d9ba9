//! Provider error types.

use nodepack_core::ConfigError;
use thiserror::Error;

/// Errors returned by a cloud API backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("insufficient capacity for {instance_type} in {zone}")]
    InsufficientCapacity { instance_type: String, zone: String },

    #[error("request throttled: {0}")]
    Throttled(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("service error: {0}")]
    Service(String),
}

impl ApiError {
    /// Whether the rejection is about capacity for one instance type and
    /// zone, so another option may still succeed.
    pub fn is_insufficient_capacity(&self) -> bool {
        matches!(self, Self::InsufficientCapacity { .. })
    }
}

/// Errors that can occur while discovering zones or managing nodes.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("retrieving availability zones, {0}")]
    RetrievingZones(#[source] ApiError),

    #[error("describing subnets, {0}")]
    DescribingSubnets(#[source] ApiError),

    #[error("getting zonal subnets, {0}")]
    ZonalSubnets(#[source] Box<ProviderError>),

    #[error("failed to find viable zonal subnet pairing")]
    NoViableSubnets,

    #[error("launching {instance_type} in {zone}, {source}")]
    Launching {
        instance_type: String,
        zone: String,
        #[source]
        source: ApiError,
    },

    #[error("terminating node {node}, {source}")]
    Terminating {
        node: String,
        #[source]
        source: ApiError,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type ProviderResult<T> = Result<T, ProviderError>;
