//! Status and conditions management for PostgresCluster resources
//!
//! The status is recomputed from scratch at the end of every pass from the
//! re-listed instances and the topology outcome, then written only when it
//! differs from what the cluster already carries.

use chrono::Utc;
use tracing::debug;

use crate::controller::cluster_context::ClusterContext;
use crate::controller::error::Result;
use crate::controller::resources_state::ResourcesState;
use crate::controller::store::ClusterStore;
use crate::controller::topology::TopologyOutcome;
use crate::crd::{ClusterPhase, Condition, PostgresCluster, PostgresClusterStatus, TopologyState};

/// Standard condition types following Kubernetes conventions
pub mod condition_types {
    /// Cluster is ready to accept connections
    pub const READY: &str = "Ready";
    /// Cluster is progressing towards a goal state
    pub const PROGRESSING: &str = "Progressing";
    /// Cluster is in a degraded state but still functional
    pub const DEGRADED: &str = "Degraded";
    /// Cluster configuration is valid
    pub const CONFIG_VALID: &str = "ConfigurationValid";
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
}

fn bool_status(value: bool) -> &'static str {
    if value {
        condition_status::TRUE
    } else {
        condition_status::FALSE
    }
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionBuilder {
    /// Create a new condition builder
    pub fn new(generation: Option<i64>) -> Self {
        Self {
            conditions: Vec::new(),
            generation,
        }
    }

    /// Create from existing conditions
    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Set a condition; the transition time moves only when the status does
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = Utc::now().to_rfc3339();
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: Utc::now().to_rfc3339(),
                observed_generation: self.generation,
            });
        }
        self
    }

    /// Set the Ready condition
    pub fn ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        self.set_condition(condition_types::READY, bool_status(is_ready), reason, message)
    }

    /// Set the Progressing condition
    pub fn progressing(self, is_progressing: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::PROGRESSING,
            bool_status(is_progressing),
            reason,
            message,
        )
    }

    /// Set the Degraded condition
    pub fn degraded(self, is_degraded: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::DEGRADED,
            bool_status(is_degraded),
            reason,
            message,
        )
    }

    /// Set the ConfigurationValid condition
    pub fn config_valid(self, is_valid: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::CONFIG_VALID,
            bool_status(is_valid),
            reason,
            message,
        )
    }

    /// Build the conditions list
    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

fn existing_conditions(ctx: &ClusterContext) -> Vec<Condition> {
    ctx.status().map(|s| s.conditions.clone()).unwrap_or_default()
}

/// Phase of a cluster whose spec is valid
fn phase(
    ctx: &ClusterContext,
    state: &ResourcesState,
    topology: &TopologyOutcome,
) -> ClusterPhase {
    if topology.blocking_operation.is_some() {
        return ClusterPhase::FailingOver;
    }
    let desired = ctx.desired_instances() as usize;
    let ready = state.instances.iter().filter(|i| i.ready).count();
    let primary_ready = ctx.is_standby() || state.ready_primary_count() == 1;
    let was_created = ctx.status().is_some_and(|s| {
        !matches!(s.phase, ClusterPhase::Pending | ClusterPhase::Creating)
    });

    if state.instances.is_empty() || (!was_created && !primary_ready) {
        ClusterPhase::Creating
    } else if state.instances.len() != desired {
        ClusterPhase::Scaling
    } else if ready == desired && primary_ready {
        ClusterPhase::Running
    } else {
        ClusterPhase::Degraded
    }
}

/// Status after a completed pass
pub fn compute_status(
    ctx: &ClusterContext,
    state: &ResourcesState,
    topology: &TopologyOutcome,
) -> PostgresClusterStatus {
    let generation = ctx.generation();
    let phase = phase(ctx, state, topology);
    let ready_primaries = state.ready_primary_count();
    let ready_replicas = state.ready_replica_count();
    let current_primary = if ctx.is_standby() {
        None
    } else {
        state
            .primary()
            .map(|p| p.name.clone())
            .or_else(|| ctx.current_primary().map(str::to_string))
    };

    let summary = format!(
        "{} of {} instances deployed, {} ready primary, {} ready replicas",
        state.instances.len(),
        ctx.desired_instances(),
        ready_primaries,
        ready_replicas
    );
    let running = phase == ClusterPhase::Running;
    let progressing = matches!(
        phase,
        ClusterPhase::Creating | ClusterPhase::Scaling | ClusterPhase::FailingOver
    );
    let conditions = ConditionBuilder::from_existing(existing_conditions(ctx), generation)
        .config_valid(true, "Valid", "Spec passed validation")
        .ready(running, &phase.to_string(), &summary)
        .progressing(progressing, &phase.to_string(), &summary)
        .degraded(phase == ClusterPhase::Degraded, &phase.to_string(), &summary)
        .build();

    PostgresClusterStatus {
        phase,
        topology: topology.state,
        current_primary,
        ready_primary_count: ready_primaries as i32,
        ready_replica_count: ready_replicas as i32,
        instances: state.instances.len() as i32,
        blocking_operation: topology.blocking_operation.clone(),
        primary_unavailable_since: topology.primary_unavailable_since.clone(),
        observed_generation: generation,
        conditions,
    }
}

/// Status of a cluster whose spec failed validation; counts are kept as last seen
pub fn failed_status(ctx: &ClusterContext, reason: &str, message: &str) -> PostgresClusterStatus {
    let generation = ctx.generation();
    let existing = ctx.status().cloned().unwrap_or_default();
    let conditions = ConditionBuilder::from_existing(existing.conditions.clone(), generation)
        .config_valid(false, reason, message)
        .ready(false, reason, message)
        .progressing(false, "Failed", message)
        .degraded(true, reason, message)
        .build();

    PostgresClusterStatus {
        phase: ClusterPhase::Failed,
        observed_generation: generation,
        conditions,
        ..existing
    }
}

/// Writes the status subresource through the store
pub struct StatusManager<'a> {
    ctx: &'a ClusterContext,
    store: &'a dyn ClusterStore,
}

impl<'a> StatusManager<'a> {
    /// Create a new status manager
    pub fn new(ctx: &'a ClusterContext, store: &'a dyn ClusterStore) -> Self {
        Self { ctx, store }
    }

    /// Write the status unless the cluster already carries it.
    ///
    /// Returns whether a write happened.
    pub async fn update(&self, status: &PostgresClusterStatus) -> Result<bool> {
        if self.ctx.status() == Some(status) {
            debug!(cluster = %self.ctx.name(), "Status unchanged");
            return Ok(false);
        }
        self.store
            .patch_cluster_status(self.ctx.namespace(), self.ctx.name(), status)
            .await?;
        Ok(true)
    }

    /// Mark the cluster failed with a ConfigurationValid=False condition
    pub async fn set_failed(&self, reason: &str, message: &str) -> Result<bool> {
        self.update(&failed_status(self.ctx, reason, message)).await
    }
}

/// Whether the topology has settled
pub fn is_stable(status: &PostgresClusterStatus) -> bool {
    status.phase == ClusterPhase::Running && status.topology == TopologyState::Stable
}

/// Check if the cluster spec has changed by comparing observed generation
pub fn spec_changed(cluster: &PostgresCluster) -> bool {
    let current_generation = cluster.metadata.generation;
    let observed_generation = cluster.status.as_ref().and_then(|s| s.observed_generation);

    match (current_generation, observed_generation) {
        (Some(current), Some(observed)) => current != observed,
        (Some(_), None) => true, // Never observed, needs reconciliation
        _ => true,               // No generation, always reconcile
    }
}
