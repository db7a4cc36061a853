//! Relationship diff engine.
//!
//! Computes which members to detach and which to attach so that an observed
//! membership becomes the desired one. Plain set relations go through
//! [`diff`]; keyed relations, whose slots may be left for automatic
//! selection, go through [`diff_map`], or [`diff_members`] when starting
//! from a raw member listing.
//!
//! Outputs are sorted ascending, so the same inputs always produce the same
//! sequence of remote calls.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use converge_core::{ResourceId, Target};
use serde::{Deserialize, Serialize};

use crate::api::{CloudApi, Member, Relation};
use crate::error::{ControlError, Result};

/// Members to remove and to add.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    /// Members to attach, ascending.
    pub to_attach: Vec<ResourceId>,
    /// Members to detach, ascending.
    pub to_detach: Vec<ResourceId>,
}

impl Diff {
    /// Returns true if nothing needs to change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_attach.is_empty() && self.to_detach.is_empty()
    }

    /// Apply the diff to `observed`: detaches first, then attaches.
    pub fn apply(&self, observed: impl IntoIterator<Item = ResourceId>) -> BTreeSet<ResourceId> {
        let mut members: BTreeSet<_> = observed.into_iter().collect();
        for id in &self.to_detach {
            members.remove(id);
        }
        members.extend(self.to_attach.iter().copied());
        members
    }
}

/// Diff two membership sets. Duplicates in either input are ignored.
pub fn diff<D, O>(desired: D, observed: O) -> Diff
where
    D: IntoIterator<Item = ResourceId>,
    O: IntoIterator<Item = ResourceId>,
{
    let desired: BTreeSet<_> = desired.into_iter().collect();
    let observed: BTreeSet<_> = observed.into_iter().collect();

    Diff {
        to_attach: desired.difference(&observed).copied().collect(),
        to_detach: observed.difference(&desired).copied().collect(),
    }
}

/// The desired member of one key in a keyed relationship.
///
/// Serialized as a bare integer, with `0` meaning unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u64", into = "u64")]
pub enum MemberSlot {
    /// The caller did not choose; pick an available member at apply time.
    Unset,
    /// This exact member.
    Id(ResourceId),
}

impl From<u64> for MemberSlot {
    fn from(raw: u64) -> Self {
        ResourceId::new(raw).into()
    }
}

impl From<ResourceId> for MemberSlot {
    fn from(id: ResourceId) -> Self {
        if id.is_unset() {
            Self::Unset
        } else {
            Self::Id(id)
        }
    }
}

impl From<MemberSlot> for u64 {
    fn from(slot: MemberSlot) -> Self {
        match slot {
            MemberSlot::Unset => 0,
            MemberSlot::Id(id) => id.get(),
        }
    }
}

/// Chooses a member for an unset slot.
#[async_trait]
pub trait MemberPicker: Send + Sync {
    /// Pick an available member under `key`.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::NoneAvailable` if there is no candidate, or
    /// the classified API error if candidates cannot be listed.
    async fn pick_available(&self, key: ResourceId) -> Result<ResourceId>;
}

/// A [`MemberPicker`] that asks the API for available members and takes the
/// first one.
pub struct ApiPicker<'a, A: ?Sized> {
    api: &'a A,
    relation: Relation,
    owner: &'a Target,
}

impl<'a, A: CloudApi + ?Sized> ApiPicker<'a, A> {
    /// A picker for `relation` of `owner`.
    #[must_use]
    pub const fn new(api: &'a A, relation: Relation, owner: &'a Target) -> Self {
        Self {
            api,
            relation,
            owner,
        }
    }
}

#[async_trait]
impl<A: CloudApi + ?Sized> MemberPicker for ApiPicker<'_, A> {
    async fn pick_available(&self, key: ResourceId) -> Result<ResourceId> {
        let member_kind = self.relation.member_kind();
        let scope = match self.relation.key_kind() {
            Some(kind) => format!("{kind} {key} for {}", self.owner),
            None => self.owner.to_string(),
        };

        let candidates = self
            .api
            .list_available(self.relation, key)
            .await
            .map_err(|e| {
                ControlError::from_api(
                    self.owner,
                    &format!("listing available {member_kind} candidates under {key} for"),
                    e,
                )
            })?;

        let picked = candidates
            .first()
            .copied()
            .ok_or(ControlError::NoneAvailable {
                kind: member_kind,
                scope,
            })?;

        tracing::debug!(
            relation = %self.relation,
            owner = %self.owner,
            key = %key,
            member = %picked,
            "Picked available member"
        );
        Ok(picked)
    }
}

/// Result of diffing a keyed relationship.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapDiff {
    /// Members to detach and attach.
    pub diff: Diff,
    /// The member every desired key resolved to.
    pub resolved: BTreeMap<ResourceId, ResourceId>,
}

impl MapDiff {
    /// The members to attach, each filed under its key.
    #[must_use]
    pub fn attachments(&self) -> Vec<Member> {
        self.diff
            .to_attach
            .iter()
            .map(|&id| {
                self.resolved
                    .iter()
                    .find(|(_, member)| **member == id)
                    .map_or_else(|| Member::new(id), |(&key, _)| Member::grouped(id, key))
            })
            .collect()
    }
}

/// Diff a keyed relationship.
///
/// Unset slots are resolved before diffing. A slot whose key already holds
/// an observed member keeps that member; otherwise `picker` chooses one.
/// Members are compared by id, so a member filed under a different key is
/// left where it is.
///
/// # Errors
///
/// Propagates the picker's error, `ControlError::NoneAvailable` when a key
/// has no candidate at all.
pub async fn diff_map<P>(
    desired: &BTreeMap<ResourceId, MemberSlot>,
    observed: &BTreeMap<ResourceId, ResourceId>,
    picker: &P,
) -> Result<MapDiff>
where
    P: MemberPicker + ?Sized,
{
    let mut resolved = BTreeMap::new();
    for (&key, &slot) in desired {
        let member = match slot {
            MemberSlot::Id(id) => id,
            MemberSlot::Unset => match observed.get(&key) {
                Some(&id) => id,
                None => picker.pick_available(key).await?,
            },
        };
        resolved.insert(key, member);
    }

    Ok(MapDiff {
        diff: diff(resolved.values().copied(), observed.values().copied()),
        resolved,
    })
}

/// Diff a keyed relationship against the members the API listed.
///
/// The first member listed under a key is the one that key holds. Every
/// other listed member, unkeyed or second under a taken key, is detached
/// unless some slot resolves to it.
///
/// # Errors
///
/// Same as [`diff_map`].
pub async fn diff_members<P>(
    desired: &BTreeMap<ResourceId, MemberSlot>,
    listed: &[Member],
    picker: &P,
) -> Result<MapDiff>
where
    P: MemberPicker + ?Sized,
{
    let mut observed = BTreeMap::new();
    let mut extra = Vec::new();
    for member in listed {
        match member.group {
            Some(key) if !observed.contains_key(&key) => {
                observed.insert(key, member.id);
            }
            _ => extra.push(member.id),
        }
    }

    let mut map_diff = diff_map(desired, &observed, picker).await?;
    let wanted: BTreeSet<_> = map_diff.resolved.values().copied().collect();
    for id in extra {
        if wanted.contains(&id) {
            map_diff.diff.to_attach.retain(|&a| a != id);
        } else {
            map_diff.diff.to_detach.push(id);
        }
    }
    map_diff.diff.to_detach.sort_unstable();
    map_diff.diff.to_detach.dedup();
    Ok(map_diff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorClass;
    use crate::mock::MockCloud;
    use converge_core::ResourceKind;
    use proptest::prelude::*;

    fn ids(raw: &[u64]) -> Vec<ResourceId> {
        raw.iter().copied().map(ResourceId::new).collect()
    }

    struct ListPicker(Vec<u64>);

    #[async_trait]
    impl MemberPicker for ListPicker {
        async fn pick_available(&self, key: ResourceId) -> Result<ResourceId> {
            self.0
                .first()
                .map(|&id| ResourceId::new(id))
                .ok_or(ControlError::NoneAvailable {
                    kind: ResourceKind::IpAddress,
                    scope: format!("key {key}"),
                })
        }
    }

    #[test]
    fn swaps_one_member() {
        let d = diff(ids(&[2, 3, 4]), ids(&[1, 2, 3]));
        assert_eq!(d.to_attach, ids(&[4]));
        assert_eq!(d.to_detach, ids(&[1]));
    }

    #[test]
    fn output_is_sorted_regardless_of_input_order() {
        let d = diff(ids(&[9, 1, 5]), ids(&[8, 2]));
        assert_eq!(d.to_attach, ids(&[1, 5, 9]));
        assert_eq!(d.to_detach, ids(&[2, 8]));
    }

    #[test]
    fn empty_inputs() {
        assert!(diff(ids(&[]), ids(&[])).is_empty());
        assert_eq!(diff(ids(&[1]), ids(&[])).to_attach, ids(&[1]));
        assert_eq!(diff(ids(&[]), ids(&[1])).to_detach, ids(&[1]));
    }

    #[test]
    fn member_slot_serde() {
        let slots: BTreeMap<u64, MemberSlot> = serde_json::from_str(r#"{"50": 0, "51": 9}"#).unwrap();
        assert_eq!(slots[&50], MemberSlot::Unset);
        assert_eq!(slots[&51], MemberSlot::Id(ResourceId::new(9)));
        assert_eq!(serde_json::to_string(&MemberSlot::Unset).unwrap(), "0");
    }

    #[tokio::test]
    async fn unset_slot_takes_first_available() {
        let desired = BTreeMap::from([(ResourceId::new(50), MemberSlot::Unset)]);
        let result = diff_map(&desired, &BTreeMap::new(), &ListPicker(vec![7, 9]))
            .await
            .unwrap();

        assert_eq!(result.resolved[&ResourceId::new(50)], ResourceId::new(7));
        assert_eq!(result.diff.to_attach, ids(&[7]));
        assert_eq!(
            result.attachments(),
            vec![Member::grouped(ResourceId::new(7), ResourceId::new(50))]
        );
    }

    #[tokio::test]
    async fn unset_slot_without_candidates_is_not_found() {
        let desired = BTreeMap::from([(ResourceId::new(50), MemberSlot::Unset)]);
        let err = diff_map(&desired, &BTreeMap::new(), &ListPicker(vec![]))
            .await
            .unwrap_err();

        assert!(matches!(err, ControlError::NoneAvailable { .. }));
        assert_eq!(err.class(), ErrorClass::NotFound);
    }

    #[tokio::test]
    async fn unset_slot_keeps_observed_member() {
        let desired = BTreeMap::from([(ResourceId::new(50), MemberSlot::Unset)]);
        let observed = BTreeMap::from([(ResourceId::new(50), ResourceId::new(3))]);

        let result = diff_map(&desired, &observed, &ListPicker(vec![]))
            .await
            .unwrap();
        assert!(result.diff.is_empty());
        assert_eq!(result.resolved[&ResourceId::new(50)], ResourceId::new(3));
    }

    #[tokio::test]
    async fn explicit_slot_replaces_observed_member() {
        let desired = BTreeMap::from([
            (ResourceId::new(50), MemberSlot::Id(ResourceId::new(8))),
            (ResourceId::new(51), MemberSlot::Id(ResourceId::new(4))),
        ]);
        let observed = BTreeMap::from([
            (ResourceId::new(50), ResourceId::new(3)),
            (ResourceId::new(51), ResourceId::new(4)),
        ]);

        let result = diff_map(&desired, &observed, &ListPicker(vec![]))
            .await
            .unwrap();
        assert_eq!(result.diff.to_detach, ids(&[3]));
        assert_eq!(result.diff.to_attach, ids(&[8]));
    }

    fn crowded_listing() -> Vec<Member> {
        vec![
            Member::grouped(ResourceId::new(3), ResourceId::new(50)),
            Member::grouped(ResourceId::new(4), ResourceId::new(50)),
            Member::new(ResourceId::new(9)),
        ]
    }

    #[tokio::test]
    async fn surplus_members_are_detached() {
        let desired = BTreeMap::from([(ResourceId::new(50), MemberSlot::Unset)]);
        let result = diff_members(&desired, &crowded_listing(), &ListPicker(vec![]))
            .await
            .unwrap();

        assert!(result.diff.to_attach.is_empty());
        assert_eq!(result.diff.to_detach, ids(&[4, 9]));
        assert_eq!(result.resolved[&ResourceId::new(50)], ResourceId::new(3));
    }

    #[tokio::test]
    async fn surplus_member_chosen_by_slot_is_kept() {
        let desired = BTreeMap::from([(ResourceId::new(50), MemberSlot::Id(ResourceId::new(4)))]);
        let listed = crowded_listing();
        let result = diff_members(&desired, &listed, &ListPicker(vec![]))
            .await
            .unwrap();

        assert!(result.diff.to_attach.is_empty());
        assert_eq!(result.diff.to_detach, ids(&[3, 9]));
        assert_eq!(
            result.diff.apply(listed.iter().map(|m| m.id)),
            BTreeSet::from([ResourceId::new(4)])
        );
    }

    #[tokio::test]
    async fn api_picker_reads_available_pool() {
        let cloud = MockCloud::new();
        cloud.set_available(Relation::InstanceIps, 50, &[7, 9]);
        let owner = Target::new(ResourceKind::Instance, "web", ResourceId::new(3));
        let picker = ApiPicker::new(&cloud, Relation::InstanceIps, &owner);

        assert_eq!(
            picker.pick_available(ResourceId::new(50)).await.unwrap(),
            ResourceId::new(7)
        );

        let err = picker.pick_available(ResourceId::new(51)).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("no available IP address"));
        assert!(msg.contains("network endpoint 51"));
        assert!(msg.contains("instance \"web\" (id 3)"));
    }

    proptest! {
        #[test]
        fn diff_reaches_desired(
            desired in prop::collection::btree_set(0u64..64, 0..24),
            observed in prop::collection::btree_set(0u64..64, 0..24),
        ) {
            let desired: BTreeSet<_> = desired.into_iter().map(ResourceId::new).collect();
            let observed: BTreeSet<_> = observed.into_iter().map(ResourceId::new).collect();

            let d = diff(desired.iter().copied(), observed.iter().copied());

            let attach: BTreeSet<_> = d.to_attach.iter().copied().collect();
            let detach: BTreeSet<_> = d.to_detach.iter().copied().collect();
            prop_assert!(attach.is_disjoint(&detach));
            prop_assert_eq!(d.apply(observed.iter().copied()), desired);
        }

        #[test]
        fn diff_of_equal_sets_is_empty(
            set in prop::collection::vec(0u64..64, 0..24),
        ) {
            let set: Vec<_> = set.into_iter().map(ResourceId::new).collect();
            let mut shuffled = set.clone();
            shuffled.reverse();
            prop_assert!(diff(set, shuffled).is_empty());
        }
    }
}
