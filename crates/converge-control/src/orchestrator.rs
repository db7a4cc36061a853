//! Mutation orchestrator.
//!
//! Executes a [`MutationPlan`] in a fixed order:
//!
//! 1. Pre effects: running instances are powered off and recorded.
//! 2. The primary mutation is submitted and tracked to success.
//! 3. Every relationship's detaches run, in reverse plan order, then every
//!    attach in plan order. A relationship that depends on another (an
//!    address on a network) is listed after it.
//! 4. Post effects: the recorded instances are powered back on, whether or
//!    not the earlier steps succeeded.
//!
//! Execution is best-effort, not transactional. Nothing is rolled back; a
//! failed plan leaves a state the next reconciliation pass can converge
//! from, and the error says precisely what was and was not applied.

use converge_core::{ResourceId, ResourceKind, Target};

use crate::api::{CloudApi, Member};
use crate::cancel::Cancellation;
use crate::diff::{diff, diff_members, ApiPicker, Diff};
use crate::error::{ControlError, Result};
use crate::lifecycle;
use crate::plan::{
    DesiredMembers, MemberChange, MemberFailure, MutationPlan, PlanReport, RelationChange,
    SideEffect,
};
use crate::tracker::track_to_success;
use crate::types::ControlConfig;

/// Execute `plan` against `api`.
///
/// # Errors
///
/// - Any error from a pre effect, after the instances already powered off
///   have been powered back on.
/// - Any error from submitting or tracking the primary mutation, including
///   `ControlError::OperationFailed`. Relationship changes are skipped.
/// - Errors reading current memberships or resolving unset slots.
/// - `ControlError::PartialFailure` if some attaches or detaches failed,
///   or if cancellation cut reconciliation short after any change was
///   attempted. The interrupted change is the last failure.
/// - `ControlError::Cancelled` if cancellation came before any change.
/// - The first post-effect error, if everything before it succeeded.
pub async fn execute<A>(
    api: &A,
    plan: MutationPlan,
    config: &ControlConfig,
    cancel: &Cancellation,
) -> Result<PlanReport>
where
    A: CloudApi + ?Sized,
{
    plan.validate()?;
    let MutationPlan {
        target,
        pre,
        primary,
        relations,
    } = plan;

    tracing::info!(
        target = %target,
        pre_steps = pre.len(),
        has_primary = primary.is_some(),
        relations = relations.len(),
        "Executing mutation plan"
    );

    let mut report = PlanReport::new(target);
    let mut stopped: Vec<Target> = Vec::new();

    for effect in &pre {
        let SideEffect::PowerCycle(ids) = effect;
        if let Err(e) = power_off_running(api, ids, config, cancel, &mut stopped).await {
            tracing::error!(target = %report.target, error = %e, "Pre-mutation step failed");
            report.powered_off = stopped.iter().map(|t| t.id).collect();
            restore_power(api, &stopped, config, cancel, &mut report).await;
            return Err(e);
        }
    }
    report.powered_off = stopped.iter().map(|t| t.id).collect();

    let outcome = run_body(api, primary, relations, config, cancel, &mut report).await;
    let post = restore_power(api, &stopped, config, cancel, &mut report).await;

    match (outcome, post) {
        (Err(e), post) => {
            if let Some(post_err) = post {
                tracing::warn!(
                    target = %report.target,
                    error = %post_err,
                    "Post-mutation step also failed"
                );
            }
            tracing::error!(target = %report.target, error = %e, "Mutation plan aborted");
            Err(e)
        }
        (Ok(()), Some(post_err)) => Err(post_err),
        (Ok(()), None) => {
            tracing::info!(
                target = %report.target,
                applied = report.applied.len(),
                "Mutation plan complete"
            );
            Ok(report)
        }
    }
}

async fn run_body<A>(
    api: &A,
    primary: Option<crate::api::MutationRequest>,
    mut relations: Vec<RelationChange>,
    config: &ControlConfig,
    cancel: &Cancellation,
    report: &mut PlanReport,
) -> Result<()>
where
    A: CloudApi + ?Sized,
{
    if let Some(request) = primary {
        let verb = request.action.verb();
        tracing::info!(target = %report.target, action = verb, "Submitting mutation");

        let handle = api
            .submit_mutation(&request)
            .await
            .map_err(|e| ControlError::from_api(&report.target, verb, e))?;
        let handle = track_to_success(api, handle, &config.poll, cancel).await?;

        if report.target.id.is_unset() {
            report.target.id = handle.target_id;
            tracing::info!(target = %report.target, "Adopted id of created resource");
        }
        for change in &mut relations {
            if change.owner.id.is_unset() {
                change.owner.id = handle.target_id;
            }
        }
        report.primary = Some(handle);
    }

    if relations.is_empty() {
        return Ok(());
    }
    reconcile(api, &relations, config, cancel, report).await
}

/// A computed relationship diff awaiting application.
struct PendingChange<'a> {
    change: &'a RelationChange,
    diff: Diff,
    attachments: Vec<Member>,
}

async fn reconcile<A>(
    api: &A,
    relations: &[RelationChange],
    config: &ControlConfig,
    cancel: &Cancellation,
    report: &mut PlanReport,
) -> Result<()>
where
    A: CloudApi + ?Sized,
{
    // Diffs are computed up front so a listing failure changes nothing.
    let mut pending = Vec::with_capacity(relations.len());
    for change in relations {
        let computed = compute(api, change, report).await?;
        tracing::debug!(
            owner = %change.owner,
            relation = %change.relation,
            to_detach = computed.diff.to_detach.len(),
            to_attach = computed.diff.to_attach.len(),
            "Computed relationship diff"
        );
        pending.push(computed);
    }

    let mut failures = Vec::new();

    for p in pending.iter().rev() {
        for &member in &p.diff.to_detach {
            let change = MemberChange::detach(p.change.relation, member);
            check_cancelled(cancel, &p.change.owner, change, report, &mut failures)?;
            match detach(api, p.change, member, config, cancel).await {
                Ok(()) => report.applied.push(change),
                Err(e) => failures.push(member_failed(&p.change.owner, change, e)),
            }
        }
    }

    for p in &pending {
        for &member in &p.attachments {
            let change = MemberChange::attach(p.change.relation, member.id);
            check_cancelled(cancel, &p.change.owner, change, report, &mut failures)?;
            match attach(api, p.change, member, config, cancel).await {
                Ok(()) => report.applied.push(change),
                Err(e) => failures.push(member_failed(&p.change.owner, change, e)),
            }
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(ControlError::PartialFailure {
            owner: report.target.clone(),
            applied: report.applied.clone(),
            failures,
        })
    }
}

async fn compute<'a, A>(
    api: &A,
    change: &'a RelationChange,
    report: &mut PlanReport,
) -> Result<PendingChange<'a>>
where
    A: CloudApi + ?Sized,
{
    let owner_id = change.owner.require_id()?;
    let members = api
        .list_members(change.relation, owner_id)
        .await
        .map_err(|e| {
            ControlError::from_api(
                &change.owner,
                &format!("listing {} of", change.relation),
                e,
            )
        })?;

    match &change.desired {
        DesiredMembers::Set(desired) => {
            let diff = diff(desired.iter().copied(), members.iter().map(|m| m.id));
            let attachments = diff.to_attach.iter().copied().map(Member::new).collect();
            Ok(PendingChange {
                change,
                diff,
                attachments,
            })
        }
        DesiredMembers::Keyed(desired) => {
            let picker = ApiPicker::new(api, change.relation, &change.owner);
            let map_diff = diff_members(desired, &members, &picker).await?;
            let attachments = map_diff.attachments();
            report
                .resolved
                .insert(change.relation, map_diff.resolved.clone());
            Ok(PendingChange {
                change,
                diff: map_diff.diff,
                attachments,
            })
        }
    }
}

async fn detach<A>(
    api: &A,
    change: &RelationChange,
    member: ResourceId,
    config: &ControlConfig,
    cancel: &Cancellation,
) -> Result<()>
where
    A: CloudApi + ?Sized,
{
    let action = format!(
        "detaching {} {member} ({}) from",
        change.relation.member_kind(),
        change.relation
    );
    tracing::info!(owner = %change.owner, relation = %change.relation, member = %member, "Detaching member");

    let handle = api
        .detach_member(change.relation, change.owner.id, member)
        .await
        .map_err(|e| ControlError::from_api(&change.owner, &action, e))?;
    track_to_success(api, handle, &config.poll, cancel).await?;
    Ok(())
}

async fn attach<A>(
    api: &A,
    change: &RelationChange,
    member: Member,
    config: &ControlConfig,
    cancel: &Cancellation,
) -> Result<()>
where
    A: CloudApi + ?Sized,
{
    let action = format!(
        "attaching {} {} ({}) to",
        change.relation.member_kind(),
        member.id,
        change.relation
    );
    tracing::info!(owner = %change.owner, relation = %change.relation, member = %member.id, "Attaching member");

    let handle = api
        .attach_member(change.relation, change.owner.id, member)
        .await
        .map_err(|e| ControlError::from_api(&change.owner, &action, e))?;
    track_to_success(api, handle, &config.poll, cancel).await?;
    Ok(())
}

fn check_cancelled(
    cancel: &Cancellation,
    owner: &Target,
    next: MemberChange,
    report: &PlanReport,
    failures: &mut Vec<MemberFailure>,
) -> Result<()> {
    let Some(reason) = cancel.check() else {
        return Ok(());
    };
    let cancelled = ControlError::Cancelled {
        context: format!("reconciling {owner} before {next}"),
        reason,
    };
    if report.applied.is_empty() && failures.is_empty() {
        return Err(cancelled);
    }

    tracing::warn!(owner = %owner, next = %next, reason = %reason, "Reconciliation interrupted");
    let mut failures = std::mem::take(failures);
    failures.push(MemberFailure::new(next, cancelled));
    Err(ControlError::PartialFailure {
        owner: report.target.clone(),
        applied: report.applied.clone(),
        failures,
    })
}

fn member_failed(owner: &Target, change: MemberChange, error: ControlError) -> MemberFailure {
    tracing::warn!(owner = %owner, change = %change, error = %error, "Relationship change failed");
    MemberFailure::new(change, error)
}

/// Power off every instance in `ids` that is running, appending each one
/// whose power-off was accepted to `stopped`.
async fn power_off_running<A>(
    api: &A,
    ids: &[ResourceId],
    config: &ControlConfig,
    cancel: &Cancellation,
    stopped: &mut Vec<Target>,
) -> Result<()>
where
    A: CloudApi + ?Sized,
{
    for &id in ids {
        if stopped.iter().any(|t| t.id == id) {
            continue;
        }

        let unnamed = Target::new(ResourceKind::Instance, id.to_string(), id);
        let state = api
            .get_resource_state(ResourceKind::Instance, id)
            .await
            .map_err(|e| ControlError::from_api(&unnamed, "reading power state of", e))?;
        let instance = Target::new(ResourceKind::Instance, state.name, id);
        let power = state.power.unwrap_or_default();

        if !lifecycle::should_power_off(power) {
            if lifecycle::is_stopped(power) {
                tracing::debug!(instance = %instance, "Instance already stopped, leaving it alone");
            } else {
                tracing::warn!(
                    instance = %instance,
                    power = ?power,
                    "Instance is neither running nor stopped, not powering it off"
                );
            }
            continue;
        }

        tracing::info!(instance = %instance, "Powering off instance");
        let handle = api
            .power_off(id)
            .await
            .map_err(|e| ControlError::from_api(&instance, "powering off", e))?;
        stopped.push(instance);
        track_to_success(api, handle, &config.poll, cancel).await?;
    }
    Ok(())
}

/// Power `stopped` back on, best-effort. Returns the first failure.
async fn restore_power<A>(
    api: &A,
    stopped: &[Target],
    config: &ControlConfig,
    cancel: &Cancellation,
    report: &mut PlanReport,
) -> Option<ControlError>
where
    A: CloudApi + ?Sized,
{
    let mut first_error = None;

    for instance in stopped {
        tracing::info!(instance = %instance, "Powering instance back on");
        let result = match api.power_on(instance.id).await {
            Ok(handle) => track_to_success(api, handle, &config.poll, cancel)
                .await
                .map(|_| ()),
            Err(e) => Err(ControlError::from_api(instance, "powering on", e)),
        };

        match result {
            Ok(()) => report.powered_on.push(instance.id),
            Err(e) => {
                tracing::warn!(instance = %instance, error = %e, "Failed to power instance back on");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    first_error
}
