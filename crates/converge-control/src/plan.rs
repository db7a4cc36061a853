//! Mutation plans and their execution reports.
//!
//! A [`MutationPlan`] is built fresh for each resource operation from the
//! current and desired configuration, handed to
//! [`execute`](crate::orchestrator::execute), and discarded afterwards.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use converge_core::{ResourceId, Target};

use crate::api::{MutationRequest, Relation};
use crate::diff::MemberSlot;
use crate::error::{ControlError, Result};
use crate::operation::OperationHandle;

/// A side effect that brackets the primary mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    /// Power off the listed instances that are running, then power exactly
    /// those back on once the rest of the plan has run.
    PowerCycle(Vec<ResourceId>),
}

/// Desired membership of one relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DesiredMembers {
    /// A plain set of member ids.
    Set(BTreeSet<ResourceId>),
    /// Key to member, where a slot may be left for automatic selection.
    Keyed(BTreeMap<ResourceId, MemberSlot>),
}

impl DesiredMembers {
    /// A plain set from any id iterator.
    pub fn set(ids: impl IntoIterator<Item = ResourceId>) -> Self {
        Self::Set(ids.into_iter().collect())
    }

    /// A keyed map from `(key, slot)` pairs.
    pub fn keyed(entries: impl IntoIterator<Item = (ResourceId, MemberSlot)>) -> Self {
        Self::Keyed(entries.into_iter().collect())
    }
}

/// The desired state of one relationship of one owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationChange {
    /// Which relationship.
    pub relation: Relation,
    /// The owning resource. An unset id is filled in from the primary
    /// create, if the plan has one.
    pub owner: Target,
    /// What the membership should become.
    pub desired: DesiredMembers,
}

/// An ordered set of steps converging one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationPlan {
    /// The resource the plan converges.
    pub target: Target,
    /// Side effects run before the primary mutation.
    pub pre: Vec<SideEffect>,
    /// The primary mutation, if any.
    pub primary: Option<MutationRequest>,
    /// Relationship changes applied after the primary mutation.
    pub relations: Vec<RelationChange>,
}

impl MutationPlan {
    /// An empty plan for `target`.
    #[must_use]
    pub fn new(target: Target) -> Self {
        Self {
            target,
            pre: Vec::new(),
            primary: None,
            relations: Vec::new(),
        }
    }

    /// Power-cycle `instances` around the primary mutation.
    #[must_use]
    pub fn power_cycle(mut self, instances: impl IntoIterator<Item = ResourceId>) -> Self {
        let ids: Vec<_> = instances.into_iter().collect();
        if !ids.is_empty() {
            self.pre.push(SideEffect::PowerCycle(ids));
        }
        self
    }

    /// Set the primary mutation.
    #[must_use]
    pub fn primary(mut self, request: MutationRequest) -> Self {
        self.primary = Some(request);
        self
    }

    /// Add a relationship change owned by the plan target.
    #[must_use]
    pub fn relation(self, relation: Relation, desired: DesiredMembers) -> Self {
        let owner = self.target.clone();
        self.relation_of(owner, relation, desired)
    }

    /// Add a relationship change owned by another resource.
    #[must_use]
    pub fn relation_of(mut self, owner: Target, relation: Relation, desired: DesiredMembers) -> Self {
        self.relations.push(RelationChange {
            relation,
            owner,
            desired,
        });
        self
    }

    /// Returns true if executing the plan would not touch the remote side.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.pre.is_empty() && self.primary.is_none() && self.relations.is_empty()
    }

    /// Check the plan's internal consistency.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Internal` if a relationship is attached to an
    /// owner of the wrong kind or a keyed desired state is given for a plain
    /// set relation (and vice versa).
    pub fn validate(&self) -> Result<()> {
        for change in &self.relations {
            if change.owner.kind != change.relation.owner_kind() {
                return Err(ControlError::Internal(format!(
                    "{} cannot own {} relationships",
                    change.owner, change.relation
                )));
            }
            let keyed = matches!(change.desired, DesiredMembers::Keyed(_));
            if keyed != change.relation.is_keyed() {
                return Err(ControlError::Internal(format!(
                    "{} relationship of {} given {} desired members",
                    change.relation,
                    change.owner,
                    if keyed { "keyed" } else { "plain" }
                )));
            }
        }
        Ok(())
    }
}

/// Attach or detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeAction {
    /// Add a member.
    Attach,
    /// Remove a member.
    Detach,
}

impl ChangeAction {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Attach => "attach",
            Self::Detach => "detach",
        }
    }
}

/// A single attach or detach applied (or attempted) on a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemberChange {
    /// Which relationship.
    pub relation: Relation,
    /// The member id.
    pub member: ResourceId,
    /// What was done.
    pub action: ChangeAction,
}

impl MemberChange {
    /// An attach of `member`.
    #[must_use]
    pub const fn attach(relation: Relation, member: ResourceId) -> Self {
        Self {
            relation,
            member,
            action: ChangeAction::Attach,
        }
    }

    /// A detach of `member`.
    #[must_use]
    pub const fn detach(relation: Relation, member: ResourceId) -> Self {
        Self {
            relation,
            member,
            action: ChangeAction::Detach,
        }
    }
}

impl fmt::Display for MemberChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} ({})",
            self.action.as_str(),
            self.relation.member_kind(),
            self.member,
            self.relation
        )
    }
}

/// A member change that failed.
#[derive(Debug)]
pub struct MemberFailure {
    /// The change that was attempted.
    pub change: MemberChange,
    /// Why it failed.
    pub error: Box<ControlError>,
}

impl MemberFailure {
    /// Pair a change with its error.
    #[must_use]
    pub fn new(change: MemberChange, error: ControlError) -> Self {
        Self {
            change,
            error: Box::new(error),
        }
    }
}

impl fmt::Display for MemberFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.change, self.error)
    }
}

/// What a successful plan execution did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanReport {
    /// The plan target, with its id filled in after a create.
    pub target: Target,
    /// The completed primary operation, if the plan had one.
    pub primary: Option<OperationHandle>,
    /// Relationship changes applied, detaches first.
    pub applied: Vec<MemberChange>,
    /// For keyed relations, the member each key ended up with.
    pub resolved: BTreeMap<Relation, BTreeMap<ResourceId, ResourceId>>,
    /// Instances powered off before the primary mutation.
    pub powered_off: Vec<ResourceId>,
    /// Instances powered back on afterwards.
    pub powered_on: Vec<ResourceId>,
}

impl PlanReport {
    pub(crate) fn new(target: Target) -> Self {
        Self {
            target,
            primary: None,
            applied: Vec::new(),
            resolved: BTreeMap::new(),
            powered_off: Vec::new(),
            powered_on: Vec::new(),
        }
    }

    /// Returns true if the remote side was not touched.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.primary.is_none() && self.applied.is_empty() && self.powered_off.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_core::ResourceKind;

    fn volume() -> Target {
        Target::new(ResourceKind::Volume, "data", ResourceId::new(7))
    }

    #[test]
    fn builder_collects_steps() {
        let plan = MutationPlan::new(volume())
            .power_cycle([ResourceId::new(1), ResourceId::new(2)])
            .relation(
                Relation::VolumeConnections,
                DesiredMembers::set([ResourceId::new(1)]),
            );

        assert_eq!(
            plan.pre,
            vec![SideEffect::PowerCycle(vec![
                ResourceId::new(1),
                ResourceId::new(2)
            ])]
        );
        assert_eq!(plan.relations[0].owner, volume());
        assert!(plan.primary.is_none());
        assert!(!plan.is_noop());
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn empty_power_cycle_is_dropped() {
        let plan = MutationPlan::new(volume()).power_cycle([]);
        assert!(plan.pre.is_empty());
        assert!(plan.is_noop());
    }

    #[test]
    fn validate_rejects_wrong_owner_kind() {
        let plan = MutationPlan::new(volume()).relation(
            Relation::LoadBalancerMembers,
            DesiredMembers::set([ResourceId::new(1)]),
        );
        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("load-balancer-members"));
    }

    #[test]
    fn validate_rejects_keyed_mismatch() {
        let instance = Target::new(ResourceKind::Instance, "web", ResourceId::new(3));
        let plan = MutationPlan::new(instance.clone()).relation(
            Relation::InstanceIps,
            DesiredMembers::set([ResourceId::new(1)]),
        );
        assert!(plan.validate().is_err());

        let plan = MutationPlan::new(instance).relation(
            Relation::InstanceIps,
            DesiredMembers::keyed([(ResourceId::new(50), MemberSlot::Unset)]),
        );
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn member_change_display() {
        let change = MemberChange::attach(Relation::InstanceIps, ResourceId::new(9));
        assert_eq!(change.to_string(), "attach IP address 9 (instance-ips)");

        let change = MemberChange::detach(Relation::VolumeConnections, ResourceId::new(4));
        assert_eq!(change.to_string(), "detach instance 4 (volume-connections)");
    }
}
