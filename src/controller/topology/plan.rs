//! Topology planning
//!
//! [`plan`] compares the deployed instances with the cluster and decides which
//! instances to create, delete or promote. It never talks to the API server:
//! every decision is derived from the [`ClusterContext`] (including the status
//! written by earlier passes), the [`ResourcesState`] snapshot and the clock.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::controller::cluster_context::ClusterContext;
use crate::controller::events::ClusterEvent;
use crate::controller::resources_state::{DeployedInstance, ResourcesState};
use crate::crd::{BlockingOperation, BlockingOperationKind, TopologyState};
use crate::resources::common::InstanceRole;

use super::failover::select_failover_target;

/// First instance index of a cluster
pub const FIRST_INSTANCE_INDEX: u32 = 1;

/// One step the topology reconciler takes, in plan order
#[derive(Clone, Debug, PartialEq)]
pub enum TopologyAction {
    /// Create a new instance with the given role
    Create { index: u32, role: InstanceRole },
    /// Delete an instance StatefulSet; its volume claim is retained
    Delete { name: String, reason: &'static str },
    /// Persist an operation in status before acting on it
    BeginOperation(BlockingOperation),
    /// Re-template an instance as the primary and restart its pod
    Promote { name: String },
    /// The promoted instance is ready as primary
    CompleteOperation { kind: BlockingOperationKind, target: String },
    /// Give up on an operation whose target is gone
    AbortOperation { kind: BlockingOperationKind, target: String },
    /// Start the failover grace period
    MarkPrimaryUnavailable { since: String },
    /// The primary became ready again within the grace period
    ClearPrimaryUnavailable,
}

impl TopologyAction {
    /// Metric label for the action
    pub fn kind(&self) -> &'static str {
        match self {
            TopologyAction::Create { .. } => "create",
            TopologyAction::Delete { .. } => "delete",
            TopologyAction::BeginOperation(_) => "begin_operation",
            TopologyAction::Promote { .. } => "promote",
            TopologyAction::CompleteOperation { .. } => "complete_operation",
            TopologyAction::AbortOperation { .. } => "abort_operation",
            TopologyAction::MarkPrimaryUnavailable { .. } => "primary_unavailable",
            TopologyAction::ClearPrimaryUnavailable => "primary_recovered",
        }
    }

    /// Whether the action writes an instance StatefulSet
    pub fn mutates_instances(&self) -> bool {
        matches!(
            self,
            TopologyAction::Create { .. }
                | TopologyAction::Delete { .. }
                | TopologyAction::Promote { .. }
        )
    }

    /// Event recorded once the action was applied
    pub fn event(&self) -> ClusterEvent {
        let note = self.to_string();
        match self {
            TopologyAction::Create { .. } => ClusterEvent::normal("InstanceCreated", "Create", note),
            TopologyAction::Delete { .. } => ClusterEvent::normal("InstanceDeleted", "Delete", note),
            TopologyAction::BeginOperation(op) => {
                ClusterEvent::warning(format!("{}Started", op.kind), "Promote", note)
            }
            TopologyAction::Promote { .. } => ClusterEvent::normal("InstancePromoted", "Promote", note),
            TopologyAction::CompleteOperation { kind, .. } => {
                ClusterEvent::normal(format!("{kind}Completed"), "Promote", note)
            }
            TopologyAction::AbortOperation { kind, .. } => {
                ClusterEvent::warning(format!("{kind}Aborted"), "Promote", note)
            }
            TopologyAction::MarkPrimaryUnavailable { .. } => {
                ClusterEvent::warning("PrimaryUnavailable", "Observe", note)
            }
            TopologyAction::ClearPrimaryUnavailable => {
                ClusterEvent::normal("PrimaryRecovered", "Observe", note)
            }
        }
    }
}

impl fmt::Display for TopologyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyAction::Create { index, role } => {
                write!(f, "Creating instance {index} as {role}")
            }
            TopologyAction::Delete { name, reason } => write!(f, "Deleting instance {name}: {reason}"),
            TopologyAction::BeginOperation(op) => match &op.previous_primary {
                Some(previous) => write!(
                    f,
                    "{} started: promoting {} to replace {previous}",
                    op.kind, op.target_instance
                ),
                None => write!(f, "{} started: promoting {}", op.kind, op.target_instance),
            },
            TopologyAction::Promote { name } => write!(f, "Promoting instance {name} to primary"),
            TopologyAction::CompleteOperation { kind, target } => {
                write!(f, "{kind} completed: {target} is the ready primary")
            }
            TopologyAction::AbortOperation { kind, target } => {
                write!(f, "{kind} aborted: promotion target {target} no longer exists")
            }
            TopologyAction::MarkPrimaryUnavailable { since } => {
                write!(f, "Primary is not ready since {since}")
            }
            TopologyAction::ClearPrimaryUnavailable => write!(f, "Primary is ready again"),
        }
    }
}

/// A condition that blocks topology changes and needs a human
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopologyWarning {
    pub reason: &'static str,
    pub message: String,
}

/// Outcome of planning one pass
#[derive(Clone, Debug, PartialEq)]
pub struct TopologyPlan {
    pub state: TopologyState,
    pub actions: Vec<TopologyAction>,
    pub warnings: Vec<TopologyWarning>,
}

impl TopologyPlan {
    fn new(ctx: &ClusterContext, state: &ResourcesState) -> Self {
        Self {
            state: observed_state(ctx, state),
            actions: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn push(&mut self, action: TopologyAction) {
        self.actions.push(action);
    }

    fn warn(&mut self, reason: &'static str, message: impl Into<String>) {
        self.warnings.push(TopologyWarning {
            reason,
            message: message.into(),
        });
    }

    /// Record an operation, retire the primary it replaces, then promote.
    ///
    /// The operation is persisted before anything is deleted or promoted.
    fn begin_promotion(
        &mut self,
        kind: BlockingOperationKind,
        target: &DeployedInstance,
        previous_primary: Option<String>,
        replaced: Option<(&DeployedInstance, &'static str)>,
        now: DateTime<Utc>,
    ) {
        self.push(TopologyAction::BeginOperation(BlockingOperation {
            kind,
            target_instance: target.name.clone(),
            previous_primary,
            started_at: now.to_rfc3339(),
        }));
        if let Some((instance, reason)) = replaced {
            self.push(TopologyAction::Delete {
                name: instance.name.clone(),
                reason,
            });
        }
        self.push(TopologyAction::Promote {
            name: target.name.clone(),
        });
        self.state = TopologyState::FailoverInProgress;
    }
}

/// Topology state derived from instance counts and readiness alone
pub fn observed_state(ctx: &ClusterContext, state: &ResourcesState) -> TopologyState {
    let deployed = state.instances.len();
    let desired = ctx.desired_instances() as usize;
    if deployed == 0 {
        TopologyState::NoInstances
    } else if deployed < desired {
        TopologyState::ConvergingUp
    } else if deployed > desired {
        TopologyState::ConvergingDown
    } else if state.instances.iter().all(|i| i.ready) {
        TopologyState::Stable
    } else {
        TopologyState::ConvergingUp
    }
}

/// Index encoded in an instance name `<cluster>-<index>`
pub fn instance_index(ctx: &ClusterContext, instance_name: &str) -> Option<u32> {
    instance_name
        .strip_prefix(ctx.name())?
        .strip_prefix('-')?
        .parse()
        .ok()
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Decide the topology actions for one pass
pub fn plan(ctx: &ClusterContext, state: &ResourcesState, now: DateTime<Utc>) -> TopologyPlan {
    let mut plan = TopologyPlan::new(ctx, state);

    if let Some(op) = ctx.status().and_then(|s| s.blocking_operation.as_ref())
        && !resume_operation(state, op, &mut plan)
    {
        return plan;
    }

    let primaries: Vec<&DeployedInstance> = state.primaries().collect();
    if primaries.len() > 1 {
        let names: Vec<&str> = primaries.iter().map(|p| p.name.as_str()).collect();
        plan.warn(
            "MultiplePrimaries",
            format!(
                "Instances {} all carry the primary role; topology is frozen until only one remains",
                names.join(", ")
            ),
        );
        return plan;
    }

    if ctx.is_standby() {
        if let Some(primary) = primaries.first() {
            plan.warn(
                "PrimaryInStandbyMode",
                format!(
                    "Instance {} is a primary but the cluster is in standby mode; it is never demoted automatically",
                    primary.name
                ),
            );
            return plan;
        }
        plan_scaling(ctx, state, &mut plan);
        return plan;
    }

    let Some(primary) = primaries.first().copied() else {
        plan_missing_primary(ctx, state, now, &mut plan);
        return plan;
    };

    let unavailable_since = ctx
        .status()
        .and_then(|s| s.primary_unavailable_since.as_deref());

    if !primary.ready {
        match unavailable_since.and_then(parse_timestamp) {
            None => plan.push(TopologyAction::MarkPrimaryUnavailable {
                since: now.to_rfc3339(),
            }),
            Some(since)
                if (now - since).num_seconds() < ctx.spec().failover.grace_period_seconds => {}
            Some(_) => plan_failover(ctx, state, Some(primary), now, &mut plan),
        }
        return plan;
    }

    if unavailable_since.is_some() {
        plan.push(TopologyAction::ClearPrimaryUnavailable);
    }

    if let Some(requested) = ctx.spec().failover.promote_instance.as_deref()
        && requested != primary.name
    {
        match state.instance(requested) {
            Some(target) if target.ready => {
                plan.begin_promotion(
                    BlockingOperationKind::Switchover,
                    target,
                    Some(primary.name.clone()),
                    Some((primary, "replaced by switchover")),
                    now,
                );
                return plan;
            }
            Some(target) => plan.warn(
                "SwitchoverTargetNotReady",
                format!("Cannot promote {}: it is not ready", target.name),
            ),
            None => plan.warn(
                "SwitchoverTargetNotFound",
                format!("Cannot promote {requested}: no such instance"),
            ),
        }
    }

    plan_scaling(ctx, state, &mut plan);
    plan
}

/// Continue an operation persisted by an earlier pass.
///
/// Returns whether planning may go on to scaling decisions.
fn resume_operation(
    state: &ResourcesState,
    op: &BlockingOperation,
    plan: &mut TopologyPlan,
) -> bool {
    match state.instance(&op.target_instance) {
        Some(target) if target.role.is_primary() && target.ready => {
            plan.push(TopologyAction::CompleteOperation {
                kind: op.kind,
                target: target.name.clone(),
            });
            true
        }
        Some(target) if target.role.is_primary() => {
            plan.state = TopologyState::FailoverInProgress;
            false
        }
        Some(target) => {
            // Interrupted before the promotion was written
            if let Some(previous) = op
                .previous_primary
                .as_deref()
                .and_then(|name| state.instance(name))
                .filter(|p| p.role.is_primary())
            {
                plan.push(TopologyAction::Delete {
                    name: previous.name.clone(),
                    reason: "replaced by promotion",
                });
            }
            plan.push(TopologyAction::Promote {
                name: target.name.clone(),
            });
            plan.state = TopologyState::FailoverInProgress;
            false
        }
        None => {
            plan.push(TopologyAction::AbortOperation {
                kind: op.kind,
                target: op.target_instance.clone(),
            });
            true
        }
    }
}

/// No instance carries the primary role outside standby mode
fn plan_missing_primary(
    ctx: &ClusterContext,
    state: &ResourcesState,
    now: DateTime<Utc>,
    plan: &mut TopologyPlan,
) {
    if state.instances.is_empty() {
        plan.push(TopologyAction::Create {
            index: previous_primary_index(ctx, state).unwrap_or(FIRST_INSTANCE_INDEX),
            role: InstanceRole::Primary,
        });
        return;
    }

    // Standby mode was switched off: the standby leader takes over
    if let Some(leader) = state
        .instances
        .iter()
        .find(|i| i.role == InstanceRole::StandbyReplica)
    {
        plan.begin_promotion(BlockingOperationKind::StandbyPromotion, leader, None, None, now);
        return;
    }

    plan_failover(ctx, state, None, now, plan);
}

/// Index of the last known primary, when that index is free for reuse
fn previous_primary_index(ctx: &ClusterContext, state: &ResourcesState) -> Option<u32> {
    let index = instance_index(ctx, ctx.current_primary()?)?;
    state.instance_by_index(index).is_none().then_some(index)
}

/// Replace a lost or unready primary with the lowest-index ready replica
fn plan_failover(
    ctx: &ClusterContext,
    state: &ResourcesState,
    primary: Option<&DeployedInstance>,
    now: DateTime<Utc>,
    plan: &mut TopologyPlan,
) {
    let lost = primary
        .map(|p| p.name.clone())
        .or_else(|| ctx.current_primary().map(str::to_string));
    let lost_name = lost.as_deref().unwrap_or("primary");

    if ctx.spec().failover.is_disabled {
        plan.warn(
            "FailoverDisabled",
            format!("{lost_name} is unavailable and automatic failover is disabled"),
        );
        return;
    }

    let Some(target) = select_failover_target(state) else {
        // The lost primary's volume is retained; bring it back where it was
        if primary.is_none()
            && let Some(index) = previous_primary_index(ctx, state)
        {
            plan.push(TopologyAction::Create {
                index,
                role: InstanceRole::Primary,
            });
            return;
        }
        plan.warn(
            "NoFailoverCandidate",
            format!("{lost_name} is unavailable and no replica is ready to replace it"),
        );
        return;
    };

    plan.begin_promotion(
        BlockingOperationKind::Failover,
        target,
        lost,
        primary.map(|p| (p, "replaced by failover")),
        now,
    );
}

/// Lowest indexes not used by any deployed instance
fn free_indexes(state: &ResourcesState, count: usize) -> Vec<u32> {
    let used: BTreeSet<u32> = state.instances.iter().map(|i| i.index).collect();
    (FIRST_INSTANCE_INDEX..)
        .filter(|i| !used.contains(i))
        .take(count)
        .collect()
}

/// Add or remove replicas until the deployed count matches the cluster
fn plan_scaling(ctx: &ClusterContext, state: &ResourcesState, plan: &mut TopologyPlan) {
    let desired = ctx.desired_instances() as usize;
    let deployed = state.instances.len();

    if deployed < desired {
        // Replicas bootstrap from the primary, so they wait for it outside standby mode
        let source_ready = ctx.is_standby() || state.primary().is_some_and(|p| p.ready);
        if !source_ready {
            return;
        }
        let mut has_leader = state
            .instances
            .iter()
            .any(|i| i.role == InstanceRole::StandbyReplica);
        for index in free_indexes(state, desired - deployed) {
            let role = if ctx.is_standby() && !has_leader {
                has_leader = true;
                InstanceRole::StandbyReplica
            } else {
                InstanceRole::Replica
            };
            plan.push(TopologyAction::Create { index, role });
        }
    } else if deployed > desired {
        let removable = state
            .instances
            .iter()
            .rev()
            .filter(|i| i.role == InstanceRole::Replica)
            .take(deployed - desired);
        for instance in removable {
            plan.push(TopologyAction::Delete {
                name: instance.name.clone(),
                reason: "scale down",
            });
        }
    }
}
