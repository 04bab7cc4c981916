//! Primary promotion
//!
//! A replica is promoted by re-templating its StatefulSet as a primary: the
//! promotion init container removes the standby signal from its data directory
//! and the primary services start selecting it. The pod is then deleted so the
//! `OnDelete` strategy picks up the new template.

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;
use tracing::info;

use crate::controller::cluster_context::ClusterContext;
use crate::controller::error::{Error, Result};
use crate::controller::resources_state::{DeployedInstance, ResourcesState};
use crate::controller::store::ClusterStore;
use crate::resources::common::{InstanceRole, RESERVED_PREFIX};
use crate::resources::instance::generate_instance;

/// Replica to promote when the primary is lost: the ready replica with the
/// lowest index
pub fn select_failover_target(state: &ResourcesState) -> Option<&DeployedInstance> {
    state
        .replicas()
        .filter(|i| i.ready)
        .min_by_key(|i| i.index)
}

/// The primary template for an existing instance.
///
/// Fields the API server refuses to change (volume claim templates) are kept
/// from the live object, as are labels and annotations the operator does not own.
pub fn promoted_stateful_set(
    ctx: &ClusterContext,
    state: &ResourcesState,
    live: &StatefulSet,
    index: u32,
) -> StatefulSet {
    let mut promoted = generate_instance(ctx, state, index, InstanceRole::Primary);
    promoted.metadata.resource_version = live.metadata.resource_version.clone();

    if let (Some(spec), Some(live_spec)) = (promoted.spec.as_mut(), live.spec.as_ref()) {
        spec.volume_claim_templates = live_spec.volume_claim_templates.clone();
    }

    for (key, value) in live.labels() {
        if !key.starts_with(RESERVED_PREFIX) {
            promoted
                .labels_mut()
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
    for (key, value) in live.annotations() {
        if !key.starts_with(RESERVED_PREFIX) {
            promoted
                .annotations_mut()
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
    promoted
}

/// Promote an instance to primary and restart its pod.
///
/// The instance is re-read first so the write carries its latest
/// resourceVersion; a concurrent change surfaces as a conflict.
pub async fn promote(
    ctx: &ClusterContext,
    state: &ResourcesState,
    store: &dyn ClusterStore,
    name: &str,
) -> Result<()> {
    let ns = ctx.namespace();
    let live = store
        .get_instance(ns, name)
        .await?
        .ok_or_else(|| Error::NotFound(format!("instance {name}")))?;
    let index = DeployedInstance::from_stateful_set(live.clone())
        .map_err(Error::PermanentError)?
        .index;

    let promoted = promoted_stateful_set(ctx, state, &live, index);
    store.replace_instance(ns, &promoted).await?;
    info!(instance = %promoted.name_any(), "Instance re-templated as primary");

    let pod = ctx.pod_name(name);
    if store.delete_pod(ns, &pod).await? {
        info!(pod = %pod, "Restarted promoted instance pod");
    }
    Ok(())
}
