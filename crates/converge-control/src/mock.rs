//! In-memory `CloudApi` for tests.
//!
//! `MockCloud` keeps resources, relationships and operations in memory.
//! Mutations return pending operations whose effects are applied when a
//! refetch observes them completing, which mirrors how the real control
//! plane behaves. Failures can be injected per mutation kind or per member,
//! and every call is recorded for assertions.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::mem::Discriminant;

use async_trait::async_trait;
use converge_core::{OperationId, ResourceId, ResourceKind};
use parking_lot::Mutex;

use crate::api::{
    ApiError, ApiResult, CloudApi, DiskType, Member, MutationAction, MutationRequest, PowerState,
    Relation, ResourceState,
};
use crate::operation::{OperationHandle, STATUS_SUCCESS};

/// A call made against the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// `submit_mutation`.
    Submit {
        /// Kind of resource.
        kind: ResourceKind,
        /// Target id, if any.
        id: Option<ResourceId>,
        /// Requested action.
        action: MutationAction,
    },
    /// `refetch_operation`.
    Refetch(OperationId),
    /// `list_members`.
    ListMembers(Relation, ResourceId),
    /// `list_available`.
    ListAvailable(Relation, ResourceId),
    /// `attach_member` (relation, owner, member).
    Attach(Relation, ResourceId, ResourceId),
    /// `detach_member` (relation, owner, member).
    Detach(Relation, ResourceId, ResourceId),
    /// `get_resource_state`.
    GetState(ResourceId),
    /// `power_off`.
    PowerOff(ResourceId),
    /// `power_on`.
    PowerOn(ResourceId),
}

#[derive(Debug, Clone)]
enum Effect {
    Create(ResourceState),
    Update { id: ResourceId, name: String },
    Resize { id: ResourceId, size_gb: u64 },
    Delete(ResourceId),
    Attach { relation: Relation, owner: ResourceId, member: Member },
    Detach { relation: Relation, owner: ResourceId, member: ResourceId },
    Power { id: ResourceId, state: PowerState },
}

#[derive(Debug)]
struct MockOperation {
    handle: OperationHandle,
    polls_remaining: u32,
    final_code: i32,
    effect: Option<Effect>,
}

#[derive(Debug, Default)]
struct MockState {
    resources: BTreeMap<ResourceId, ResourceState>,
    members: BTreeMap<(Relation, ResourceId), Vec<Member>>,
    available: BTreeMap<(Relation, ResourceId), Vec<ResourceId>>,
    operations: HashMap<OperationId, MockOperation>,
    scripted: HashMap<OperationId, VecDeque<ApiResult<OperationHandle>>>,
    mutation_codes: HashMap<Discriminant<MutationAction>, i32>,
    mutation_errors: HashMap<Discriminant<MutationAction>, ApiError>,
    member_codes: HashMap<(Relation, ResourceId), i32>,
    attach_errors: HashMap<(Relation, ResourceId), ApiError>,
    detach_errors: HashMap<(Relation, ResourceId), ApiError>,
    state_errors: VecDeque<ApiError>,
    power_on_error: Option<ApiError>,
    ghosts: HashMap<ResourceId, u32>,
    delete_lag: u32,
    polls_to_complete: u32,
    next_operation: u64,
    next_resource: u64,
    calls: Vec<Call>,
}

/// An in-memory control plane.
#[derive(Debug)]
pub struct MockCloud {
    state: Mutex<MockState>,
}

impl Default for MockCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCloud {
    /// Create an empty mock. Operations complete on their first refetch.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                polls_to_complete: 1,
                next_operation: 1000,
                next_resource: 500,
                ..MockState::default()
            }),
        }
    }

    // =========================================================================
    // Fixtures
    // =========================================================================

    /// An instance in the given power state.
    #[must_use]
    pub fn instance(id: u64, name: &str, power: PowerState) -> ResourceState {
        ResourceState {
            id: ResourceId::new(id),
            kind: ResourceKind::Instance,
            name: name.to_string(),
            subregion: "zone-a".to_string(),
            power: Some(power),
            size_gb: None,
            disk_type: None,
            shared: false,
        }
    }

    /// A volume of the given size.
    #[must_use]
    pub fn volume(id: u64, name: &str, size_gb: u64, disk_type: DiskType) -> ResourceState {
        ResourceState {
            id: ResourceId::new(id),
            kind: ResourceKind::Volume,
            name: name.to_string(),
            subregion: "zone-a".to_string(),
            power: None,
            size_gb: Some(size_gb),
            disk_type: Some(disk_type),
            shared: disk_type == DiskType::SharedSsd,
        }
    }

    /// A resource without kind-specific attributes.
    #[must_use]
    pub fn plain(id: u64, kind: ResourceKind, name: &str) -> ResourceState {
        ResourceState {
            id: ResourceId::new(id),
            kind,
            name: name.to_string(),
            subregion: "zone-a".to_string(),
            power: None,
            size_gb: None,
            disk_type: None,
            shared: false,
        }
    }

    /// Add or replace a resource.
    pub fn insert_resource(&self, resource: ResourceState) {
        self.state.lock().resources.insert(resource.id, resource);
    }

    /// Current state of a resource.
    #[must_use]
    pub fn resource(&self, id: u64) -> Option<ResourceState> {
        self.state.lock().resources.get(&ResourceId::new(id)).cloned()
    }

    /// Replace the members of a relationship.
    pub fn set_members(&self, relation: Relation, owner: u64, members: Vec<Member>) {
        self.state
            .lock()
            .members
            .insert((relation, ResourceId::new(owner)), members);
    }

    /// Member ids of a relationship, in insertion order.
    #[must_use]
    pub fn member_ids(&self, relation: Relation, owner: u64) -> Vec<u64> {
        self.state
            .lock()
            .members
            .get(&(relation, ResourceId::new(owner)))
            .map(|m| m.iter().map(|m| m.id.get()).collect())
            .unwrap_or_default()
    }

    /// Replace the pool of available members under `group`.
    pub fn set_available(&self, relation: Relation, group: u64, ids: &[u64]) {
        self.state.lock().available.insert(
            (relation, ResourceId::new(group)),
            ids.iter().copied().map(ResourceId::new).collect(),
        );
    }

    /// Register an operation directly, bypassing `submit_mutation`.
    pub fn insert_operation(&self, handle: OperationHandle, polls_to_complete: u32, final_code: i32) {
        self.state.lock().operations.insert(
            handle.id,
            MockOperation {
                handle,
                polls_remaining: polls_to_complete,
                final_code,
                effect: None,
            },
        );
    }

    /// Queue responses returned by `refetch_operation` before the normal
    /// simulation takes over.
    pub fn script_refetch(&self, id: OperationId, responses: Vec<ApiResult<OperationHandle>>) {
        self.state
            .lock()
            .scripted
            .entry(id)
            .or_default()
            .extend(responses);
    }

    // =========================================================================
    // Behaviour knobs
    // =========================================================================

    /// Number of refetches an operation takes to complete (`u32::MAX` for never).
    pub fn set_polls_to_complete(&self, polls: u32) {
        self.state.lock().polls_to_complete = polls;
    }

    /// Make every mutation with the same action variant finish with `code`.
    pub fn set_mutation_status(&self, action: &MutationAction, code: i32) {
        self.state
            .lock()
            .mutation_codes
            .insert(std::mem::discriminant(action), code);
    }

    /// Make submitting mutations with this action variant fail outright.
    pub fn fail_mutation(&self, action: &MutationAction, error: ApiError) {
        self.state
            .lock()
            .mutation_errors
            .insert(std::mem::discriminant(action), error);
    }

    /// Make attach/detach operations on `member` finish with `code`.
    pub fn set_member_status(&self, relation: Relation, member: u64, code: i32) {
        self.state
            .lock()
            .member_codes
            .insert((relation, ResourceId::new(member)), code);
    }

    /// Make attaching `member` fail at submission.
    pub fn fail_attach(&self, relation: Relation, member: u64, error: ApiError) {
        self.state
            .lock()
            .attach_errors
            .insert((relation, ResourceId::new(member)), error);
    }

    /// Make detaching `member` fail at submission.
    pub fn fail_detach(&self, relation: Relation, member: u64, error: ApiError) {
        self.state
            .lock()
            .detach_errors
            .insert((relation, ResourceId::new(member)), error);
    }

    /// Queue errors returned by the next `get_resource_state` calls.
    pub fn fail_state_reads(&self, errors: Vec<ApiError>) {
        self.state.lock().state_errors.extend(errors);
    }

    /// Make every `power_on` call fail at submission.
    pub fn fail_power_on(&self, error: ApiError) {
        self.state.lock().power_on_error = Some(error);
    }

    /// Keep deleted resources visible for this many state reads.
    pub fn set_delete_lag(&self, reads: u32) {
        self.state.lock().delete_lag = reads;
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Every call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Number of calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c)).count()
    }

    /// Number of `refetch_operation` calls.
    #[must_use]
    pub fn refetch_count(&self) -> usize {
        self.count(|c| matches!(c, Call::Refetch(_)))
    }

    /// Instances that were powered on, in call order.
    #[must_use]
    pub fn powered_on(&self) -> Vec<u64> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::PowerOn(id) => Some(id.get()),
                _ => None,
            })
            .collect()
    }

    /// Instances that were powered off, in call order.
    #[must_use]
    pub fn powered_off(&self) -> Vec<u64> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::PowerOff(id) => Some(id.get()),
                _ => None,
            })
            .collect()
    }
}

fn not_found(what: impl std::fmt::Display) -> ApiError {
    ApiError::status(404, format!("{what} not found"))
}

impl MockState {
    fn issue(
        &mut self,
        target_id: ResourceId,
        target_name: &str,
        final_code: i32,
        effect: Effect,
    ) -> OperationHandle {
        self.next_operation += 1;
        let handle =
            OperationHandle::pending(OperationId::new(self.next_operation), target_id, target_name);
        self.operations.insert(
            handle.id,
            MockOperation {
                handle: handle.clone(),
                polls_remaining: self.polls_to_complete,
                final_code,
                effect: Some(effect),
            },
        );
        handle
    }

    fn name_of(&self, id: ResourceId) -> String {
        self.resources
            .get(&id)
            .map(|r| r.name.clone())
            .unwrap_or_default()
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::Create(resource) => {
                self.resources.insert(resource.id, resource);
            }
            Effect::Update { id, name } => {
                if let Some(r) = self.resources.get_mut(&id) {
                    r.name = name;
                }
            }
            Effect::Resize { id, size_gb } => {
                if let Some(r) = self.resources.get_mut(&id) {
                    r.size_gb = Some(size_gb);
                }
            }
            Effect::Delete(id) => {
                if let Some(r) = self.resources.remove(&id) {
                    if self.delete_lag > 0 {
                        self.ghosts.insert(id, self.delete_lag);
                        self.resources.insert(id, r);
                    }
                }
            }
            Effect::Attach {
                relation,
                owner,
                member,
            } => {
                if let Some(group) = member.group {
                    if let Some(pool) = self.available.get_mut(&(relation, group)) {
                        pool.retain(|id| *id != member.id);
                    }
                }
                self.members.entry((relation, owner)).or_default().push(member);
            }
            Effect::Detach {
                relation,
                owner,
                member,
            } => {
                let members = self.members.entry((relation, owner)).or_default();
                if let Some(pos) = members.iter().position(|m| m.id == member) {
                    let removed = members.remove(pos);
                    if let Some(group) = removed.group {
                        self.available
                            .entry((relation, group))
                            .or_default()
                            .push(removed.id);
                    }
                }
            }
            Effect::Power { id, state } => {
                if let Some(r) = self.resources.get_mut(&id) {
                    r.power = Some(state);
                }
            }
        }
    }

    fn member_code(&self, relation: Relation, member: ResourceId) -> i32 {
        self.member_codes
            .get(&(relation, member))
            .copied()
            .unwrap_or(STATUS_SUCCESS)
    }
}

#[async_trait]
impl CloudApi for MockCloud {
    async fn submit_mutation(&self, request: &MutationRequest) -> ApiResult<OperationHandle> {
        let mut state = self.state.lock();
        state.calls.push(Call::Submit {
            kind: request.kind,
            id: request.id,
            action: request.action.clone(),
        });

        let discriminant = std::mem::discriminant(&request.action);
        if let Some(err) = state.mutation_errors.get(&discriminant) {
            return Err(err.clone());
        }
        let code = state
            .mutation_codes
            .get(&discriminant)
            .copied()
            .unwrap_or(STATUS_SUCCESS);

        if let MutationAction::Create = request.action {
            state.next_resource += 1;
            let id = ResourceId::new(state.next_resource);
            let resource = ResourceState {
                id,
                kind: request.kind,
                name: request.name.clone(),
                subregion: "zone-a".to_string(),
                power: (request.kind == ResourceKind::Instance).then_some(PowerState::Running),
                size_gb: request.payload.get("size_gb").and_then(serde_json::Value::as_u64),
                disk_type: request
                    .payload
                    .get("disk_type")
                    .and_then(|v| serde_json::from_value(v.clone()).ok()),
                shared: request
                    .payload
                    .get("shared")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false),
            };
            return Ok(state.issue(id, &request.name, code, Effect::Create(resource)));
        }

        let id = request
            .id
            .ok_or_else(|| ApiError::status(400, "missing resource id"))?;
        if !state.resources.contains_key(&id) {
            return Err(not_found(format!("{} {id}", request.kind)));
        }

        let effect = match &request.action {
            MutationAction::Update => Effect::Update {
                id,
                name: request.name.clone(),
            },
            MutationAction::Resize { size_gb } => Effect::Resize {
                id,
                size_gb: *size_gb,
            },
            MutationAction::Delete => Effect::Delete(id),
            MutationAction::Create => unreachable!("handled above"),
        };
        let name = state.name_of(id);
        Ok(state.issue(id, &name, code, effect))
    }

    async fn refetch_operation(&self, id: OperationId) -> ApiResult<OperationHandle> {
        let mut state = self.state.lock();
        state.calls.push(Call::Refetch(id));

        if let Some(queue) = state.scripted.get_mut(&id) {
            if let Some(response) = queue.pop_front() {
                return response;
            }
        }

        let Some(op) = state.operations.get_mut(&id) else {
            return Err(not_found(id));
        };

        if op.handle.is_terminal() {
            return Ok(op.handle.clone());
        }

        op.polls_remaining = op.polls_remaining.saturating_sub(1);
        if op.polls_remaining > 0 {
            op.handle.progress = op.handle.progress.saturating_add(10).min(90);
            return Ok(op.handle.clone());
        }

        op.handle = op.handle.clone().completed(op.final_code);
        let handle = op.handle.clone();
        let effect = if op.final_code == STATUS_SUCCESS {
            op.effect.take()
        } else {
            None
        };
        if let Some(effect) = effect {
            state.apply(effect);
        }
        Ok(handle)
    }

    async fn list_members(&self, relation: Relation, owner: ResourceId) -> ApiResult<Vec<Member>> {
        let mut state = self.state.lock();
        state.calls.push(Call::ListMembers(relation, owner));

        if !state.resources.contains_key(&owner) {
            return Err(not_found(format!("{} {owner}", relation.owner_kind())));
        }
        Ok(state
            .members
            .get(&(relation, owner))
            .cloned()
            .unwrap_or_default())
    }

    async fn list_available(
        &self,
        relation: Relation,
        group: ResourceId,
    ) -> ApiResult<Vec<ResourceId>> {
        let mut state = self.state.lock();
        state.calls.push(Call::ListAvailable(relation, group));
        Ok(state
            .available
            .get(&(relation, group))
            .cloned()
            .unwrap_or_default())
    }

    async fn attach_member(
        &self,
        relation: Relation,
        owner: ResourceId,
        member: Member,
    ) -> ApiResult<OperationHandle> {
        let mut state = self.state.lock();
        state.calls.push(Call::Attach(relation, owner, member.id));

        if let Some(err) = state.attach_errors.get(&(relation, member.id)) {
            return Err(err.clone());
        }
        let Some(owner_state) = state.resources.get(&owner) else {
            return Err(not_found(format!("{} {owner}", relation.owner_kind())));
        };
        let exclusive = relation == Relation::VolumeConnections && !owner_state.shared;

        let current = state
            .members
            .get(&(relation, owner))
            .cloned()
            .unwrap_or_default();
        if current.iter().any(|m| m.id == member.id) {
            return Err(ApiError::status(409, format!("{} already attached", member.id)));
        }
        if exclusive && !current.is_empty() {
            return Err(ApiError::status(
                409,
                "non-shared volume accepts at most one connection",
            ));
        }

        let code = state.member_code(relation, member.id);
        let name = state.name_of(owner);
        Ok(state.issue(
            owner,
            &name,
            code,
            Effect::Attach {
                relation,
                owner,
                member,
            },
        ))
    }

    async fn detach_member(
        &self,
        relation: Relation,
        owner: ResourceId,
        member: ResourceId,
    ) -> ApiResult<OperationHandle> {
        let mut state = self.state.lock();
        state.calls.push(Call::Detach(relation, owner, member));

        if let Some(err) = state.detach_errors.get(&(relation, member)) {
            return Err(err.clone());
        }
        let attached = state
            .members
            .get(&(relation, owner))
            .is_some_and(|m| m.iter().any(|m| m.id == member));
        if !attached {
            return Err(not_found(format!("member {member} of {owner}")));
        }

        let code = state.member_code(relation, member);
        let name = state.name_of(owner);
        Ok(state.issue(
            owner,
            &name,
            code,
            Effect::Detach {
                relation,
                owner,
                member,
            },
        ))
    }

    async fn get_resource_state(
        &self,
        kind: ResourceKind,
        id: ResourceId,
    ) -> ApiResult<ResourceState> {
        let mut state = self.state.lock();
        state.calls.push(Call::GetState(id));

        if let Some(err) = state.state_errors.pop_front() {
            return Err(err);
        }

        match state.ghosts.get(&id).copied() {
            Some(0) => {
                state.ghosts.remove(&id);
                state.resources.remove(&id);
            }
            Some(remaining) => {
                state.ghosts.insert(id, remaining - 1);
            }
            None => {}
        }

        state
            .resources
            .get(&id)
            .filter(|r| r.kind == kind)
            .cloned()
            .ok_or_else(|| not_found(format!("{kind} {id}")))
    }

    async fn power_off(&self, id: ResourceId) -> ApiResult<OperationHandle> {
        let mut state = self.state.lock();
        state.calls.push(Call::PowerOff(id));
        if !state.resources.contains_key(&id) {
            return Err(not_found(format!("instance {id}")));
        }
        let name = state.name_of(id);
        Ok(state.issue(
            id,
            &name,
            STATUS_SUCCESS,
            Effect::Power {
                id,
                state: PowerState::Stopped,
            },
        ))
    }

    async fn power_on(&self, id: ResourceId) -> ApiResult<OperationHandle> {
        let mut state = self.state.lock();
        state.calls.push(Call::PowerOn(id));
        if let Some(err) = &state.power_on_error {
            return Err(err.clone());
        }
        if !state.resources.contains_key(&id) {
            return Err(not_found(format!("instance {id}")));
        }
        let name = state.name_of(id);
        Ok(state.issue(
            id,
            &name,
            STATUS_SUCCESS,
            Effect::Power {
                id,
                state: PowerState::Running,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::STATUS_ERROR;

    #[tokio::test]
    async fn mutation_effect_applies_on_completion() {
        let cloud = MockCloud::new();
        cloud.insert_resource(MockCloud::volume(7, "data", 20, DiskType::Ssd));

        let target =
            converge_core::Target::new(ResourceKind::Volume, "data", ResourceId::new(7));
        let request = MutationRequest::existing(
            &target,
            MutationAction::Resize { size_gb: 40 },
            serde_json::Value::Null,
        );
        let handle = cloud.submit_mutation(&request).await.unwrap();
        assert!(!handle.is_terminal());
        assert_eq!(cloud.resource(7).unwrap().size_gb, Some(20));

        let done = cloud.refetch_operation(handle.id).await.unwrap();
        assert!(done.is_terminal());
        assert_eq!(cloud.resource(7).unwrap().size_gb, Some(40));
    }

    #[tokio::test]
    async fn failed_mutation_has_no_effect() {
        let cloud = MockCloud::new();
        cloud.insert_resource(MockCloud::volume(7, "data", 20, DiskType::Ssd));
        cloud.set_mutation_status(&MutationAction::Resize { size_gb: 0 }, STATUS_ERROR);

        let target =
            converge_core::Target::new(ResourceKind::Volume, "data", ResourceId::new(7));
        let request = MutationRequest::existing(
            &target,
            MutationAction::Resize { size_gb: 40 },
            serde_json::Value::Null,
        );
        let handle = cloud.submit_mutation(&request).await.unwrap();
        let done = cloud.refetch_operation(handle.id).await.unwrap();

        assert_eq!(done.status_code, STATUS_ERROR);
        assert_eq!(cloud.resource(7).unwrap().size_gb, Some(20));
    }

    #[tokio::test]
    async fn exclusive_volume_rejects_second_connection() {
        let cloud = MockCloud::new();
        cloud.insert_resource(MockCloud::volume(7, "data", 20, DiskType::Ssd));
        cloud.set_members(
            Relation::VolumeConnections,
            7,
            vec![Member::new(ResourceId::new(1))],
        );

        let err = cloud
            .attach_member(
                Relation::VolumeConnections,
                ResourceId::new(7),
                Member::new(ResourceId::new(2)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), Some(409));
    }

    #[tokio::test]
    async fn keyed_attach_consumes_available_pool() {
        let cloud = MockCloud::new();
        cloud.insert_resource(MockCloud::instance(3, "web", PowerState::Running));
        cloud.set_available(Relation::InstanceIps, 50, &[7, 9]);

        let handle = cloud
            .attach_member(
                Relation::InstanceIps,
                ResourceId::new(3),
                Member::grouped(ResourceId::new(7), ResourceId::new(50)),
            )
            .await
            .unwrap();
        cloud.refetch_operation(handle.id).await.unwrap();

        assert_eq!(cloud.member_ids(Relation::InstanceIps, 3), vec![7]);
        let pool = cloud
            .list_available(Relation::InstanceIps, ResourceId::new(50))
            .await
            .unwrap();
        assert_eq!(pool, vec![ResourceId::new(9)]);
    }

    #[tokio::test]
    async fn delete_lag_keeps_resource_visible() {
        let cloud = MockCloud::new();
        cloud.insert_resource(MockCloud::plain(8, ResourceKind::IpAddress, "ip"));
        cloud.set_delete_lag(2);

        let target = converge_core::Target::new(ResourceKind::IpAddress, "ip", ResourceId::new(8));
        let request =
            MutationRequest::existing(&target, MutationAction::Delete, serde_json::Value::Null);
        let handle = cloud.submit_mutation(&request).await.unwrap();
        cloud.refetch_operation(handle.id).await.unwrap();

        let kind = ResourceKind::IpAddress;
        assert!(cloud.get_resource_state(kind, ResourceId::new(8)).await.is_ok());
        assert!(cloud.get_resource_state(kind, ResourceId::new(8)).await.is_ok());
        assert!(cloud.get_resource_state(kind, ResourceId::new(8)).await.is_err());
    }
}
