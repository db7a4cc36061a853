//! Core identifier types for converge.
//!
//! Remote objects are addressed by integer ids issued by the control plane.
//! The value `0` is never issued remotely and is reserved for "not chosen
//! yet", which relationship maps use to request an automatically picked
//! member.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A remote resource identifier.
///
/// The same id space is used for instances, volumes, network endpoints,
/// load balancers and IP addresses.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(u64);

impl ResourceId {
    /// The reserved "unset" id.
    pub const UNSET: Self = Self(0);

    /// Create a new `ResourceId` from a raw integer.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Return the underlying integer.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns true if this is the reserved "unset" id.
    #[must_use]
    pub const fn is_unset(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceId({})", self.0)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ResourceId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<ResourceId> for u64 {
    fn from(id: ResourceId) -> Self {
        id.0
    }
}

impl FromStr for ResourceId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|_| IdError::InvalidNumber(s.to_string()))
    }
}

/// Identifier of a remote asynchronous operation (a "ticket").
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(u64);

impl OperationId {
    /// Create a new `OperationId` from a raw integer.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Return the underlying integer.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OperationId({})", self.0)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

impl FromStr for OperationId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().trim_start_matches("op-");
        digits
            .parse::<u64>()
            .map(Self)
            .map_err(|_| IdError::InvalidNumber(s.to_string()))
    }
}

/// The kinds of remote object managed by converge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// A compute instance.
    Instance,
    /// A block storage volume.
    Volume,
    /// A private network endpoint an instance can be connected to.
    NetworkEndpoint,
    /// A load balancer.
    LoadBalancer,
    /// A public IP address.
    IpAddress,
}

impl ResourceKind {
    /// Human-readable name used in messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Instance => "instance",
            Self::Volume => "volume",
            Self::NetworkEndpoint => "network endpoint",
            Self::LoadBalancer => "load balancer",
            Self::IpAddress => "IP address",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully described remote object: what it is, what the caller calls it,
/// and which remote id it maps to.
///
/// Every error raised by converge carries a `Target` (or its rendering) so
/// that a message alone is enough to find the object again.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// Kind of the object.
    pub kind: ResourceKind,
    /// Local name from the caller's configuration.
    pub name: String,
    /// Remote id, `UNSET` if the object does not exist yet.
    pub id: ResourceId,
}

impl Target {
    /// Create a target for an existing remote object.
    #[must_use]
    pub fn new(kind: ResourceKind, name: impl Into<String>, id: ResourceId) -> Self {
        Self {
            kind,
            name: name.into(),
            id,
        }
    }

    /// Create a target for an object that has not been created yet.
    #[must_use]
    pub fn pending(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self::new(kind, name, ResourceId::UNSET)
    }

    /// Return the remote id, failing if the object has none yet.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::MissingId` if the id is unset.
    pub fn require_id(&self) -> crate::Result<ResourceId> {
        if self.id.is_unset() {
            Err(crate::CoreError::MissingId(self.to_string()))
        } else {
            Ok(self.id)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id.is_unset() {
            write!(f, "{} \"{}\" (not yet created)", self.kind, self.name)
        } else {
            write!(f, "{} \"{}\" (id {})", self.kind, self.name, self.id)
        }
    }
}

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The input is not a non-negative integer.
    #[error("invalid numeric id: {0:?}")]
    InvalidNumber(String),
}
