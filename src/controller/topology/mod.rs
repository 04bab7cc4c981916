//! Instance topology: how many instances exist and which one is primary
//!
//! Planning is pure ([`plan`]); [`TopologyReconciler`] applies a plan against
//! the store, one action at a time. A pass never waits for an instance to
//! become ready. Operations that span passes (failover, switchover, standby
//! promotion) are persisted in status before their first write, and later
//! passes resume or complete them from what they observe.

mod failover;
mod plan;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::controller::cluster_context::ClusterContext;
use crate::controller::error::{Error, Result};
use crate::controller::events::{ClusterEvent, EventSink};
use crate::controller::resources_state::ResourcesState;
use crate::controller::store::ClusterStore;
use crate::crd::{BlockingOperation, ClusterPhase, TopologyState};
use crate::resources::instance::generate_instance;

pub use failover::{promote, promoted_stateful_set, select_failover_target};
pub use plan::{
    FIRST_INSTANCE_INDEX, TopologyAction, TopologyPlan, TopologyWarning, instance_index,
    observed_state, plan,
};

/// What a topology pass did, and the status fields it leaves behind
#[derive(Clone, Debug, PartialEq)]
pub struct TopologyOutcome {
    pub state: TopologyState,
    /// Actions applied, in order
    pub applied: Vec<TopologyAction>,
    pub warnings: Vec<TopologyWarning>,
    pub blocking_operation: Option<BlockingOperation>,
    pub primary_unavailable_since: Option<String>,
}

impl TopologyOutcome {
    /// Whether any instance was created, deleted or promoted
    pub fn instances_changed(&self) -> bool {
        self.applied.iter().any(TopologyAction::mutates_instances)
    }
}

/// Applies topology plans for one cluster
pub struct TopologyReconciler<'a> {
    ctx: &'a ClusterContext,
    state: &'a ResourcesState,
    store: &'a dyn ClusterStore,
    events: &'a dyn EventSink,
}

impl<'a> TopologyReconciler<'a> {
    pub fn new(
        ctx: &'a ClusterContext,
        state: &'a ResourcesState,
        store: &'a dyn ClusterStore,
        events: &'a dyn EventSink,
    ) -> Self {
        Self {
            ctx,
            state,
            store,
            events,
        }
    }

    /// Plan and apply one topology pass.
    ///
    /// Stops at the first failing action; actions already applied stand and
    /// the next pass re-plans from what it observes.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<TopologyOutcome> {
        let plan = plan(self.ctx, self.state, now);
        let status = self.ctx.status();
        let mut outcome = TopologyOutcome {
            state: plan.state,
            applied: Vec::with_capacity(plan.actions.len()),
            warnings: plan.warnings.clone(),
            blocking_operation: status.and_then(|s| s.blocking_operation.clone()),
            primary_unavailable_since: status.and_then(|s| s.primary_unavailable_since.clone()),
        };

        for warning in &plan.warnings {
            warn!(reason = warning.reason, "{}", warning.message);
            self.events
                .emit(
                    self.ctx.cluster(),
                    ClusterEvent::warning(warning.reason, "Topology", warning.message.clone()),
                )
                .await;
        }

        for action in plan.actions {
            self.apply(&action, &mut outcome).await?;
            info!(action = action.kind(), "{action}");
            self.events.emit(self.ctx.cluster(), action.event()).await;
            outcome.applied.push(action);
        }
        Ok(outcome)
    }

    async fn apply(&self, action: &TopologyAction, outcome: &mut TopologyOutcome) -> Result<()> {
        let ns = self.ctx.namespace();
        match action {
            TopologyAction::Create { index, role } => {
                let sts = generate_instance(self.ctx, self.state, *index, *role);
                match self.store.create_instance(ns, &sts).await {
                    Ok(_) => {}
                    Err(Error::Conflict(name)) => debug!(instance = %name, "Instance already exists"),
                    Err(e) => return Err(e),
                }
            }
            TopologyAction::Delete { name, .. } => {
                self.store.delete_instance(ns, name).await?;
            }
            TopologyAction::BeginOperation(op) => {
                outcome.blocking_operation = Some(op.clone());
                self.persist_operation(outcome).await?;
            }
            TopologyAction::Promote { name } => {
                promote(self.ctx, self.state, self.store, name).await?;
            }
            TopologyAction::CompleteOperation { .. } | TopologyAction::AbortOperation { .. } => {
                outcome.blocking_operation = None;
            }
            TopologyAction::MarkPrimaryUnavailable { since } => {
                outcome.primary_unavailable_since = Some(since.clone());
            }
            TopologyAction::ClearPrimaryUnavailable => {
                outcome.primary_unavailable_since = None;
            }
        }
        Ok(())
    }

    /// Write the operation to status so that every later pass observes it
    async fn persist_operation(&self, outcome: &TopologyOutcome) -> Result<()> {
        let mut status = self.ctx.status().cloned().unwrap_or_default();
        status.blocking_operation = outcome.blocking_operation.clone();
        status.primary_unavailable_since = outcome.primary_unavailable_since.clone();
        status.topology = TopologyState::FailoverInProgress;
        status.phase = ClusterPhase::FailingOver;
        self.store
            .patch_cluster_status(self.ctx.namespace(), self.ctx.name(), &status)
            .await
    }
}
