//! Resource manager service.
//!
//! This module provides the `ResourceManager` trait and the
//! `ConvergeService` implementation that turns typed configuration into
//! mutation plans and executes them against a `CloudApi`.

use std::sync::Arc;

use async_trait::async_trait;
use converge_core::{ResourceId, ResourceKind, Target};

use crate::api::{ApiError, CloudApi, MutationAction, MutationRequest, Relation, ResourceState};
use crate::cancel::Cancellation;
use crate::classify::{classify, ErrorClass};
use crate::error::{ControlError, Result};
use crate::operation::OperationHandle;
use crate::orchestrator;
use crate::plan::{DesiredMembers, MutationPlan, PlanReport};
use crate::resources::{self, InstanceConfig, LoadBalancerConfig, VolumeConfig};
use crate::tracker;
use crate::types::ControlConfig;

/// Operations a declarative resource manager needs.
///
/// Every call is bounded by the configured operation timeout. Calls against
/// the same resource must be serialized by the caller.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    // =========================================================================
    // Volumes
    // =========================================================================

    /// Create a volume and connect it to the configured instances.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Validation` before any remote call if the
    /// configuration is invalid.
    async fn create_volume(&self, config: &VolumeConfig) -> Result<PlanReport>;

    /// Converge an existing volume towards `config`.
    ///
    /// Growing the volume powers off its running connected instances for
    /// the resize and powers them back on afterwards.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::NotFound` if the volume no longer exists,
    /// `ControlError::Validation` for a shrink and
    /// `ControlError::Unsupported` for immutable attribute changes.
    async fn update_volume(&self, id: ResourceId, config: &VolumeConfig) -> Result<PlanReport>;

    // =========================================================================
    // Instances and load balancers
    // =========================================================================

    /// Converge an instance's name, networks and public addresses.
    async fn update_instance(&self, id: ResourceId, config: &InstanceConfig) -> Result<PlanReport>;

    /// Converge a load balancer's name and members.
    async fn update_load_balancer(
        &self,
        id: ResourceId,
        config: &LoadBalancerConfig,
    ) -> Result<PlanReport>;

    // =========================================================================
    // Generic
    // =========================================================================

    /// Read the remote state of a resource.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::NotFound` if the resource no longer exists;
    /// the caller should drop its local identity.
    async fn read(&self, target: &Target) -> Result<ResourceState>;

    /// Delete a resource and wait until it is gone.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::DeleteUnconfirmed` if the resource is still
    /// visible after the confirmation budget.
    async fn delete(&self, target: &Target) -> Result<()>;

    /// Track an operation obtained elsewhere to success.
    async fn track(&self, handle: OperationHandle) -> Result<OperationHandle>;

    /// Reconcile one relationship of `owner`.
    async fn reconcile_relation(
        &self,
        owner: &Target,
        relation: Relation,
        desired: DesiredMembers,
    ) -> Result<PlanReport>;
}

/// The main resource manager implementation.
pub struct ConvergeService<A: CloudApi> {
    api: Arc<A>,
    config: ControlConfig,
    cancel: Cancellation,
}

impl<A: CloudApi> ConvergeService<A> {
    /// Create a new service.
    #[must_use]
    pub fn new(api: Arc<A>, config: ControlConfig) -> Self {
        Self {
            api,
            config,
            cancel: Cancellation::none(),
        }
    }

    /// Create with default configuration.
    #[must_use]
    pub fn with_defaults(api: Arc<A>) -> Self {
        Self::new(api, ControlConfig::default())
    }

    /// Create with configuration read from the environment.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Config` if a `CONVERGE_*` variable is invalid.
    pub fn from_env(api: Arc<A>) -> Result<Self> {
        Ok(Self::new(api, ControlConfig::from_env()?))
    }

    /// Bound every call additionally by `cancel`.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    /// Get a reference to the API client.
    #[must_use]
    pub fn api(&self) -> &A {
        &self.api
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// A fresh token for one invocation.
    fn invocation(&self) -> Cancellation {
        self.cancel
            .clone()
            .with_timeout(self.config.operation_timeout())
    }

    async fn run(&self, plan: MutationPlan, cancel: &Cancellation) -> Result<PlanReport> {
        orchestrator::execute(self.api.as_ref(), plan, &self.config, cancel).await
    }

    async fn fetch(&self, target: &Target) -> Result<ResourceState> {
        let id = target.require_id()?;
        self.api
            .get_resource_state(target.kind, id)
            .await
            .map_err(|e| ControlError::from_api(target, "reading", e))
    }

    /// Poll until the deleted resource is no longer visible.
    async fn confirm_deleted(&self, target: &Target, cancel: &Cancellation) -> Result<()> {
        let policy = &self.config.delete_confirmation;
        let mut last_transient: Option<ApiError> = None;

        for attempt in 1..=policy.max_attempts {
            match self.api.get_resource_state(target.kind, target.id).await {
                Err(e) if classify(None, &e) == ErrorClass::NotFound => {
                    tracing::info!(target = %target, attempts = attempt, "Deletion confirmed");
                    return Ok(());
                }
                Err(e) if classify(None, &e) == ErrorClass::Transient => {
                    tracing::warn!(
                        target = %target,
                        attempt,
                        error = %e,
                        "Transient failure while confirming deletion"
                    );
                    last_transient = Some(e);
                }
                Err(e) => return Err(ControlError::from_api(target, "confirming deletion of", e)),
                Ok(_) => {
                    tracing::debug!(target = %target, attempt, "Resource still visible after delete");
                    last_transient = None;
                }
            }

            if attempt < policy.max_attempts {
                cancel
                    .sleep(policy.interval())
                    .await
                    .map_err(|reason| ControlError::Cancelled {
                        context: format!("confirming deletion of {target}"),
                        reason,
                    })?;
            }
        }

        Err(match last_transient {
            Some(source) => ControlError::Transient {
                context: format!("confirming deletion of {target}"),
                attempts: policy.max_attempts,
                source,
            },
            None => ControlError::DeleteUnconfirmed {
                target: target.to_string(),
                attempts: policy.max_attempts,
            },
        })
    }
}

#[async_trait]
impl<A: CloudApi> ResourceManager for ConvergeService<A> {
    async fn create_volume(&self, config: &VolumeConfig) -> Result<PlanReport> {
        let plan = resources::plan_volume_create(config)?;
        tracing::info!(name = %config.name, size_gb = config.size_gb, "Creating volume");
        self.run(plan, &self.invocation()).await
    }

    async fn update_volume(&self, id: ResourceId, config: &VolumeConfig) -> Result<PlanReport> {
        config.validate()?;
        let target = Target::new(ResourceKind::Volume, &config.name, id);
        let cancel = self.invocation();

        let current = self.fetch(&target).await?;
        let connected: Vec<ResourceId> = self
            .api
            .list_members(Relation::VolumeConnections, id)
            .await
            .map_err(|e| ControlError::from_api(&target, "listing connections of", e))?
            .into_iter()
            .map(|m| m.id)
            .collect();

        let plan = resources::plan_volume_update(&current, &connected, config)?;
        self.run(plan, &cancel).await
    }

    async fn update_instance(&self, id: ResourceId, config: &InstanceConfig) -> Result<PlanReport> {
        config.validate()?;
        let target = Target::new(ResourceKind::Instance, &config.name, id);
        let cancel = self.invocation();

        let current = self.fetch(&target).await?;
        let plan = resources::plan_instance_update(&current, config)?;
        self.run(plan, &cancel).await
    }

    async fn update_load_balancer(
        &self,
        id: ResourceId,
        config: &LoadBalancerConfig,
    ) -> Result<PlanReport> {
        let target = Target::new(ResourceKind::LoadBalancer, &config.name, id);
        let cancel = self.invocation();

        let current = self.fetch(&target).await?;
        let plan = resources::plan_load_balancer_update(&current, config)?;
        self.run(plan, &cancel).await
    }

    async fn read(&self, target: &Target) -> Result<ResourceState> {
        let state = self.fetch(target).await;
        if let Err(e) = &state {
            if e.is_stale_identity() {
                tracing::warn!(target = %target, "Resource vanished; local identity is stale");
            }
        }
        state
    }

    async fn delete(&self, target: &Target) -> Result<()> {
        target.require_id()?;
        let cancel = self.invocation();
        tracing::info!(target = %target, "Deleting resource");

        let request =
            MutationRequest::existing(target, MutationAction::Delete, serde_json::Value::Null);
        let handle = self
            .api
            .submit_mutation(&request)
            .await
            .map_err(|e| ControlError::from_api(target, "deleting", e))?;
        tracker::track_to_success(self.api.as_ref(), handle, &self.config.poll, &cancel).await?;

        self.confirm_deleted(target, &cancel).await
    }

    async fn track(&self, handle: OperationHandle) -> Result<OperationHandle> {
        tracker::track_to_success(
            self.api.as_ref(),
            handle,
            &self.config.poll,
            &self.invocation(),
        )
        .await
    }

    async fn reconcile_relation(
        &self,
        owner: &Target,
        relation: Relation,
        desired: DesiredMembers,
    ) -> Result<PlanReport> {
        let plan = MutationPlan::new(owner.clone()).relation(relation, desired);
        self.run(plan, &self.invocation()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{DiskType, Member, PowerState, TransportFault};
    use crate::mock::MockCloud;
    use crate::types::RetryPolicy;
    use std::time::Duration;

    fn service(cloud: MockCloud) -> ConvergeService<MockCloud> {
        ConvergeService::with_defaults(Arc::new(cloud))
    }

    fn volume_target() -> Target {
        Target::new(ResourceKind::Volume, "data", ResourceId::new(7))
    }

    #[tokio::test(start_paused = true)]
    async fn read_missing_resource_is_stale() {
        let svc = service(MockCloud::new());
        let err = svc.read(&volume_target()).await.unwrap_err();
        assert!(err.is_stale_identity());
        assert!(err.to_string().contains("volume \"data\" (id 7)"));
    }

    #[tokio::test(start_paused = true)]
    async fn read_requires_an_id() {
        let svc = service(MockCloud::new());
        let err = svc
            .read(&Target::pending(ResourceKind::Volume, "data"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Core(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn update_volume_resizes_and_cycles_power() {
        let cloud = MockCloud::new();
        cloud.insert_resource(MockCloud::volume(7, "data", 20, DiskType::Ssd));
        cloud.insert_resource(MockCloud::instance(1, "a", PowerState::Running));
        cloud.set_members(
            Relation::VolumeConnections,
            7,
            vec![Member::new(ResourceId::new(1))],
        );
        let svc = service(cloud);

        let mut config = VolumeConfig::new("data", 40, "zone-a");
        config.disk_type = DiskType::Ssd;
        config.connections.insert(ResourceId::new(1));

        let report = svc.update_volume(ResourceId::new(7), &config).await.unwrap();

        assert_eq!(report.powered_on, vec![ResourceId::new(1)]);
        assert!(report.applied.is_empty());
        assert_eq!(svc.api().resource(7).unwrap().size_gb, Some(40));
        assert_eq!(svc.api().powered_on(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_config_makes_no_remote_call() {
        let svc = service(MockCloud::new());
        let mut config = VolumeConfig::new("data", 40, "zone-a");
        config.shared = true;

        let err = svc.update_volume(ResourceId::new(7), &config).await.unwrap_err();
        assert!(matches!(err, ControlError::Validation { .. }));
        assert!(svc.api().calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delete_waits_for_resource_to_disappear() {
        let cloud = MockCloud::new();
        cloud.insert_resource(MockCloud::volume(7, "data", 20, DiskType::Ssd));
        cloud.set_delete_lag(3);
        let svc = service(cloud);

        svc.delete(&volume_target()).await.unwrap();
        assert!(svc.api().resource(7).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn delete_tolerates_transient_confirmation_failures() {
        let cloud = MockCloud::new();
        cloud.insert_resource(MockCloud::volume(7, "data", 20, DiskType::Ssd));
        cloud.fail_state_reads(vec![
            ApiError::transport(TransportFault::Eof, "unexpected EOF"),
            ApiError::transport(TransportFault::Eof, "unexpected EOF"),
        ]);
        let svc = service(cloud);

        svc.delete(&volume_target()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn delete_gives_up_after_budget() {
        let cloud = MockCloud::new();
        cloud.insert_resource(MockCloud::volume(7, "data", 20, DiskType::Ssd));
        cloud.set_delete_lag(100);
        let config = ControlConfig {
            delete_confirmation: RetryPolicy::new(5, 4),
            ..ControlConfig::default()
        };
        let svc = ConvergeService::new(Arc::new(cloud), config);

        let err = svc.delete(&volume_target()).await.unwrap_err();
        assert!(matches!(
            err,
            ControlError::DeleteUnconfirmed { attempts: 4, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn maximal_operation_timeout_does_not_overflow() {
        let cloud = MockCloud::new();
        cloud.insert_resource(MockCloud::volume(7, "data", 20, DiskType::Ssd));
        let config = ControlConfig::from_lookup(|key| {
            (key == "CONVERGE_OPERATION_TIMEOUT_SECONDS").then(|| u64::MAX.to_string())
        })
        .unwrap();
        let svc = ConvergeService::new(Arc::new(cloud), config);

        svc.delete(&volume_target()).await.unwrap();
        assert!(svc.api().resource(7).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn service_deadline_bounds_tracking() {
        let cloud = MockCloud::new();
        cloud.insert_resource(MockCloud::volume(7, "data", 20, DiskType::Ssd));
        cloud.set_polls_to_complete(u32::MAX);
        let config = ControlConfig {
            operation_timeout_seconds: 120,
            ..ControlConfig::default()
        };
        let svc = ConvergeService::new(Arc::new(cloud), config);

        let start = tokio::time::Instant::now();
        let err = svc.delete(&volume_target()).await.unwrap_err();

        assert!(matches!(err, ControlError::Cancelled { .. }));
        assert!(start.elapsed() <= Duration::from_secs(121));
    }
}
