//! Reconciliation logic for PostgresCluster resources
//!
//! One pass converges a cluster as far as it can without waiting: topology
//! first, then the services and backup job, then per-instance spec
//! enforcement, then status. Anything left undone is picked up by the next
//! pass, triggered by a watch event or the requeue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::cluster_context::ClusterContext;
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::events::{ClusterEvent, EventSink};
use crate::controller::resources_state::ResourcesState;
use crate::controller::status::{StatusManager, compute_status, is_stable, spec_changed};
use crate::controller::store::ClusterStore;
use crate::controller::topology::{TopologyOutcome, TopologyReconciler};
use crate::controller::validation::validate_spec;
use crate::crd::{PostgresCluster, PostgresClusterStatus};
use crate::enforcer::{EnforcementOutcome, SpecEnforcementRunner};
use crate::resources::backup::generate_backup_cron_job;
use crate::resources::base_config::generate_base_config_map;
use crate::resources::service::{generate_primary_service, generate_replica_service};

/// Requeue interval while instances are still converging
pub const CONVERGING_REQUEUE: Duration = Duration::from_secs(5);

/// Resync interval once the cluster is stable
pub const STABLE_REQUEUE: Duration = Duration::from_secs(30);

/// What one pass observed and did
#[derive(Clone, Debug, Default)]
pub struct PassReport {
    /// Validation failure that stopped the pass before any write
    pub invalid: Option<String>,
    pub topology: Option<TopologyOutcome>,
    pub enforcement: Vec<EnforcementOutcome>,
    pub status: Option<PostgresClusterStatus>,
    /// None waits for the next change instead of requeueing
    pub requeue_after: Option<Duration>,
}

impl PassReport {
    fn awaiting_change() -> Self {
        Self::default()
    }

    /// Whether the pass changed any instance
    pub fn changed(&self) -> bool {
        self.topology
            .as_ref()
            .is_some_and(|t| !t.applied.is_empty())
            || self.enforcement.iter().any(|e| e.changed)
    }

    pub fn action(&self) -> Action {
        match self.requeue_after {
            Some(delay) => Action::requeue(delay),
            None => Action::await_change(),
        }
    }
}

fn cluster_key(cluster: &PostgresCluster) -> String {
    format!(
        "{}/{}",
        cluster.namespace().unwrap_or_default(),
        cluster.name_any()
    )
}

/// Main reconciliation function
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace().unwrap_or_default()))]
pub async fn reconcile(cluster: Arc<PostgresCluster>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let ns = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();

    if spec_changed(&cluster) {
        info!(
            generation = cluster.metadata.generation,
            "PostgresCluster spec changed, reconciling"
        );
    } else {
        debug!("Reconciling PostgresCluster");
    }
    let report = reconcile_pass(
        &cluster,
        ctx.store.as_ref(),
        ctx.events.as_ref(),
        Utc::now(),
    )
    .await?;

    ctx.forget(&cluster_key(&cluster));
    if let Some(health) = &ctx.health_state {
        let metrics = &health.metrics;
        metrics.record_reconcile(&ns, &name, started.elapsed().as_secs_f64());
        if let Some(topology) = &report.topology {
            for action in &topology.applied {
                metrics.record_topology_action(&ns, &name, action.kind());
            }
        }
        for outcome in &report.enforcement {
            for difference in &outcome.differences {
                metrics.record_spec_drift(&ns, &name, difference.spec_name);
            }
        }
        if let Some(status) = &report.status {
            metrics.set_cluster_instances(
                &ns,
                &name,
                i64::from(cluster.spec.replicas),
                i64::from(status.ready_primary_count + status.ready_replica_count),
            );
        }
        health.touch_last_reconcile();
    }

    if report.changed() {
        info!("Reconcile pass applied changes");
    }
    Ok(report.action())
}

/// Error policy for the controller with exponential backoff
pub fn error_policy(cluster: Arc<PostgresCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = cluster_key(&cluster);
    let delay = ctx.record_failure(&key, error);
    let attempts = ctx.consecutive_failures(&key);

    if let Some(health) = &ctx.health_state {
        health.metrics.record_error(
            &cluster.namespace().unwrap_or_default(),
            &cluster.name_any(),
            error.kind(),
        );
    }

    if error.is_retryable() {
        warn!(cluster = %key, attempts, error = %error, "Retryable error, requeuing in {:?}", delay);
    } else {
        error!(cluster = %key, attempts, error = %error, "Non-retryable error, requeuing in {:?}", delay);
    }

    Action::requeue(delay)
}

/// Run one full pass over a cluster.
///
/// Writes already made stand when a step fails. A failed enforcement on one
/// instance does not stop the others; its error is returned after status is
/// written.
pub async fn reconcile_pass(
    cluster: &PostgresCluster,
    store: &dyn ClusterStore,
    events: &dyn EventSink,
    now: DateTime<Utc>,
) -> Result<PassReport> {
    if cluster.metadata.deletion_timestamp.is_some() {
        // Owner references garbage-collect instances, services and the backup job
        debug!("Cluster is being deleted");
        return Ok(PassReport::awaiting_change());
    }

    let ctx = ClusterContext::new(cluster)?;
    if let Err(e) = validate_spec(cluster) {
        return invalid_spec(&ctx, store, events, e).await;
    }

    ensure_base_config_map(&ctx, store, events).await?;

    let state = match ResourcesState::load(&ctx, store).await {
        Ok(state) => state,
        Err(e) => return invalid_spec(&ctx, store, events, e).await,
    };
    for reason in &state.unrecognized {
        warn!(%reason, "Unrecognized instance left untouched");
        events
            .emit(
                ctx.cluster(),
                ClusterEvent::warning("UnrecognizedInstance", "Observe", reason.clone()),
            )
            .await;
    }

    let topology = TopologyReconciler::new(&ctx, &state, store, events)
        .reconcile(now)
        .await?;

    apply_services(&ctx, store).await?;
    apply_backup(&ctx, store, events).await?;

    // Enforce against what topology left behind
    let state = ResourcesState::load(&ctx, store).await?;
    let (enforcement, enforcement_error) = enforce_instances(&ctx, &state, store, events).await;

    let status = compute_status(&ctx, &state, &topology);
    StatusManager::new(&ctx, store).update(&status).await?;

    if let Some(e) = enforcement_error {
        return Err(e);
    }

    let settled = is_stable(&status)
        && topology.applied.is_empty()
        && !enforcement.iter().any(|e| e.changed);
    let requeue_after = if settled {
        STABLE_REQUEUE
    } else {
        CONVERGING_REQUEUE
    };

    Ok(PassReport {
        invalid: None,
        topology: Some(topology),
        enforcement,
        status: Some(status),
        requeue_after: Some(requeue_after),
    })
}

/// Report an invalid spec and stop; only a spec edit re-triggers the cluster
async fn invalid_spec(
    ctx: &ClusterContext,
    store: &dyn ClusterStore,
    events: &dyn EventSink,
    error: Error,
) -> Result<PassReport> {
    let message = match error {
        Error::ValidationError(message) => message,
        other => return Err(other),
    };
    warn!(%message, "Spec validation failed");
    events
        .emit(
            ctx.cluster(),
            ClusterEvent::warning("InvalidSpec", "Validate", message.clone()),
        )
        .await;
    StatusManager::new(ctx, store)
        .set_failed("InvalidSpec", &message)
        .await?;
    Ok(PassReport {
        invalid: Some(message),
        ..PassReport::awaiting_change()
    })
}

async fn ensure_base_config_map(
    ctx: &ClusterContext,
    store: &dyn ClusterStore,
    events: &dyn EventSink,
) -> Result<()> {
    let ns = ctx.namespace();
    if store
        .get_config_map(ns, ctx.base_config_map_name())
        .await?
        .is_some()
    {
        return Ok(());
    }
    store
        .create_config_map(ns, &generate_base_config_map(ns))
        .await?;
    info!(config_map = ctx.base_config_map_name(), "Created base config map");
    events
        .emit(
            ctx.cluster(),
            ClusterEvent::normal(
                "BaseConfigCreated",
                "Create",
                format!("Created config map {}", ctx.base_config_map_name()),
            ),
        )
        .await;
    Ok(())
}

async fn apply_services(ctx: &ClusterContext, store: &dyn ClusterStore) -> Result<()> {
    let ns = ctx.namespace();
    if ctx.is_standby() {
        if store
            .delete_service(ns, &ctx.primary_service_name())
            .await?
        {
            info!(service = %ctx.primary_service_name(), "Deleted primary service in standby mode");
        }
    } else {
        store
            .apply_service(ns, &generate_primary_service(ctx))
            .await?;
    }
    store
        .apply_service(ns, &generate_replica_service(ctx))
        .await
}

async fn apply_backup(
    ctx: &ClusterContext,
    store: &dyn ClusterStore,
    events: &dyn EventSink,
) -> Result<()> {
    let ns = ctx.namespace();
    let has_replicas = ctx.desired_instances() > 1;
    match generate_backup_cron_job(ctx, has_replicas) {
        Some(job) => store.apply_cron_job(ns, &job).await,
        None => {
            if store
                .delete_cron_job(ns, &ctx.backup_cron_job_name())
                .await?
            {
                info!(cron_job = %ctx.backup_cron_job_name(), "Backup disabled");
                events
                    .emit(
                        ctx.cluster(),
                        ClusterEvent::normal(
                            "BackupDisabled",
                            "Delete",
                            format!("Deleted cron job {}", ctx.backup_cron_job_name()),
                        ),
                    )
                    .await;
            }
            Ok(())
        }
    }
}

/// Enforce the spec on every instance, replicas first and the primary last.
///
/// A structural failure skips its instance only. Any other failure is kept
/// and returned once the remaining instances have been tried.
async fn enforce_instances(
    ctx: &ClusterContext,
    state: &ResourcesState,
    store: &dyn ClusterStore,
    events: &dyn EventSink,
) -> (Vec<EnforcementOutcome>, Option<Error>) {
    let runner = SpecEnforcementRunner::new(ctx, state, store, events);
    let ordered = state.replicas().chain(state.primaries());

    let mut outcomes = Vec::with_capacity(state.instances.len());
    let mut first_error = None;
    for instance in ordered {
        match runner.run(instance.stateful_set.clone()).await {
            Ok(outcome) => outcomes.push(outcome),
            Err(e @ Error::EnforcementError { .. }) => {
                error!(instance = %instance.name, error = %e, "Spec enforcement aborted");
                events
                    .emit(
                        ctx.cluster(),
                        ClusterEvent::warning("SpecEnforcementFailed", "Enforce", e.to_string()),
                    )
                    .await;
            }
            Err(e) => {
                warn!(instance = %instance.name, error = %e, "Spec enforcement failed");
                first_error.get_or_insert(e);
            }
        }
    }
    (outcomes, first_error)
}
