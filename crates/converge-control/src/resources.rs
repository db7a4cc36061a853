//! Typed resource configuration and planners.
//!
//! Each configuration is validated once, before any remote call, and then
//! compared against the current remote state to produce a [`MutationPlan`].

use std::collections::{BTreeMap, BTreeSet};

use converge_core::{ResourceId, ResourceKind, Target};
use serde::{Deserialize, Serialize};

use crate::api::{DiskType, MutationAction, MutationRequest, Relation, ResourceState};
use crate::diff::MemberSlot;
use crate::error::{ControlError, Result};
use crate::plan::{DesiredMembers, MutationPlan};

// =============================================================================
// Volumes
// =============================================================================

/// Desired configuration of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Local name.
    pub name: String,
    /// Size in gigabytes.
    pub size_gb: u64,
    /// Storage class.
    #[serde(default = "VolumeConfig::default_disk_type")]
    pub disk_type: DiskType,
    /// Whether the volume may be connected to several instances.
    #[serde(default)]
    pub shared: bool,
    /// Subregion the volume lives in.
    pub subregion: String,
    /// Instances the volume is connected to.
    #[serde(default)]
    pub connections: BTreeSet<ResourceId>,
}

impl VolumeConfig {
    const fn default_disk_type() -> DiskType {
        DiskType::Standard
    }

    /// A volume with the default disk type and no connections.
    #[must_use]
    pub fn new(name: impl Into<String>, size_gb: u64, subregion: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size_gb,
            disk_type: Self::default_disk_type(),
            shared: false,
            subregion: subregion.into(),
            connections: BTreeSet::new(),
        }
    }

    /// Check the configuration against the remote preconditions.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Validation` for a zero size, a shared volume
    /// whose disk type is not `SharedSsd`, or a non-shared volume with more
    /// than one connection.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| ControlError::Validation {
            target: format!("volume \"{}\"", self.name),
            reason,
        };

        if self.size_gb == 0 {
            return Err(invalid("size must be at least 1 GB".to_string()));
        }
        if self.shared && self.disk_type != DiskType::SharedSsd {
            return Err(invalid(format!(
                "shared volumes require the shared_ssd disk type, got {:?}",
                self.disk_type
            )));
        }
        if !self.shared && self.connections.len() > 1 {
            return Err(invalid(format!(
                "a non-shared volume accepts at most one connection, {} given",
                self.connections.len()
            )));
        }
        Ok(())
    }

    fn payload(&self) -> serde_json::Value {
        serde_json::json!({
            "size_gb": self.size_gb,
            "disk_type": self.disk_type,
            "shared": self.shared,
            "subregion": self.subregion,
        })
    }
}

/// Plan the creation of a volume.
///
/// # Errors
///
/// Returns `ControlError::Validation` if the configuration is invalid.
pub fn plan_volume_create(config: &VolumeConfig) -> Result<MutationPlan> {
    config.validate()?;

    let target = Target::pending(ResourceKind::Volume, &config.name);
    let mut plan = MutationPlan::new(target).primary(MutationRequest::create(
        ResourceKind::Volume,
        &config.name,
        config.payload(),
    ));
    if !config.connections.is_empty() {
        plan = plan.relation(
            Relation::VolumeConnections,
            DesiredMembers::set(config.connections.iter().copied()),
        );
    }
    Ok(plan)
}

/// Plan the update of an existing volume.
///
/// `connected` lists the instances currently connected to the volume; the
/// running ones among them are power-cycled around a resize.
///
/// # Errors
///
/// - `ControlError::Validation` if the configuration is invalid or the
///   volume would shrink.
/// - `ControlError::Unsupported` for subregion, disk type or shared flag
///   changes.
pub fn plan_volume_update(
    current: &ResourceState,
    connected: &[ResourceId],
    desired: &VolumeConfig,
) -> Result<MutationPlan> {
    desired.validate()?;
    let target = Target::new(ResourceKind::Volume, &desired.name, current.id);

    if current.subregion != desired.subregion {
        return Err(unsupported(&target, "moving a volume between subregions"));
    }
    if current.disk_type.is_some_and(|d| d != desired.disk_type) {
        return Err(unsupported(&target, "changing the disk type of a volume"));
    }
    if current.shared != desired.shared {
        return Err(unsupported(&target, "changing the shared flag of a volume"));
    }

    let current_size = current.size_gb.unwrap_or_default();
    if desired.size_gb < current_size {
        return Err(ControlError::Validation {
            target: target.to_string(),
            reason: format!(
                "volumes cannot shrink (from {current_size} GB to {} GB)",
                desired.size_gb
            ),
        });
    }

    let mut plan = MutationPlan::new(target.clone());
    if desired.size_gb > current_size {
        plan = plan
            .power_cycle(connected.iter().copied())
            .primary(MutationRequest::existing(
                &target,
                MutationAction::Resize {
                    size_gb: desired.size_gb,
                },
                serde_json::json!({ "name": desired.name }),
            ));
    } else if current.name != desired.name {
        plan = plan.primary(rename(&target));
    }

    Ok(plan.relation(
        Relation::VolumeConnections,
        DesiredMembers::set(desired.connections.iter().copied()),
    ))
}

// =============================================================================
// Instances
// =============================================================================

/// Desired configuration of an instance's connectivity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Local name.
    pub name: String,
    /// Subregion the instance lives in.
    pub subregion: String,
    /// Network endpoints the instance is connected to.
    #[serde(default)]
    pub networks: BTreeSet<ResourceId>,
    /// Public address per network endpoint; `0` picks any available one.
    #[serde(default)]
    pub ips: BTreeMap<ResourceId, MemberSlot>,
}

impl InstanceConfig {
    /// An instance with no connectivity.
    #[must_use]
    pub fn new(name: impl Into<String>, subregion: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subregion: subregion.into(),
            networks: BTreeSet::new(),
            ips: BTreeMap::new(),
        }
    }

    /// Check the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Validation` if an address is requested on a
    /// network the instance is not connected to.
    pub fn validate(&self) -> Result<()> {
        if let Some(network) = self.ips.keys().find(|n| !self.networks.contains(n)) {
            return Err(ControlError::Validation {
                target: format!("instance \"{}\"", self.name),
                reason: format!(
                    "an IP address is requested on network endpoint {network}, \
                     which is not among the instance's networks"
                ),
            });
        }
        Ok(())
    }
}

/// Plan the update of an instance's name and connectivity.
///
/// # Errors
///
/// - `ControlError::Validation` if the configuration is invalid.
/// - `ControlError::Unsupported` for a subregion change.
pub fn plan_instance_update(current: &ResourceState, desired: &InstanceConfig) -> Result<MutationPlan> {
    desired.validate()?;
    let target = Target::new(ResourceKind::Instance, &desired.name, current.id);

    if current.subregion != desired.subregion {
        return Err(unsupported(&target, "moving an instance between subregions"));
    }

    let mut plan = MutationPlan::new(target.clone());
    if current.name != desired.name {
        plan = plan.primary(rename(&target));
    }

    Ok(plan
        .relation(
            Relation::InstanceNetworks,
            DesiredMembers::set(desired.networks.iter().copied()),
        )
        .relation(
            Relation::InstanceIps,
            DesiredMembers::keyed(desired.ips.iter().map(|(&k, &v)| (k, v))),
        ))
}

// =============================================================================
// Load balancers
// =============================================================================

/// Desired configuration of a load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    /// Local name.
    pub name: String,
    /// Instances serving behind the load balancer.
    #[serde(default)]
    pub members: BTreeSet<ResourceId>,
}

/// Plan the update of a load balancer.
///
/// # Errors
///
/// Currently infallible; returns `Result` for symmetry with other planners.
pub fn plan_load_balancer_update(
    current: &ResourceState,
    desired: &LoadBalancerConfig,
) -> Result<MutationPlan> {
    let target = Target::new(ResourceKind::LoadBalancer, &desired.name, current.id);

    let mut plan = MutationPlan::new(target.clone());
    if current.name != desired.name {
        plan = plan.primary(rename(&target));
    }
    Ok(plan.relation(
        Relation::LoadBalancerMembers,
        DesiredMembers::set(desired.members.iter().copied()),
    ))
}

fn rename(target: &Target) -> MutationRequest {
    MutationRequest::existing(
        target,
        MutationAction::Update,
        serde_json::json!({ "name": target.name }),
    )
}

fn unsupported(target: &Target, feature: &str) -> ControlError {
    ControlError::Unsupported {
        target: target.to_string(),
        feature: feature.to_string(),
    }
}
