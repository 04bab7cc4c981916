pub mod config;
pub mod controller;
pub mod crd;
pub mod enforcer;
pub mod health;
pub mod resources;

pub use config::{LogFormat, OperatorConfig};
pub use controller::{Context, Error, Result, error_policy, reconcile, reconcile_pass};
pub use crd::PostgresCluster;
pub use health::{HealthState, Metrics};

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::runtime::Controller;
use kube::runtime::events::Reporter;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Run the operator controller (cluster-wide).
///
/// If health_state is provided, metrics will be recorded for reconciliations.
pub async fn run_controller(
    client: Client,
    reporter: Reporter,
    health_state: Option<Arc<HealthState>>,
) {
    run_controller_scoped(client, reporter, health_state, None).await
}

/// Run the operator controller with optional namespace scoping.
///
/// Watches PostgresCluster resources and the StatefulSets, Services,
/// ConfigMaps and CronJobs they own. The controller serialises reconciles of
/// the same cluster; different clusters reconcile concurrently.
pub async fn run_controller_scoped(
    client: Client,
    reporter: Reporter,
    health_state: Option<Arc<HealthState>>,
    namespace: Option<&str>,
) {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    tracing::info!(
        "Starting controller for PostgresCluster resources (scope: {})",
        scope_msg
    );

    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }

    let ctx = Arc::new(Context::new(client.clone(), reporter, health_state));

    let clusters: Api<PostgresCluster> = scoped_api(client.clone(), namespace);
    let statefulsets: Api<StatefulSet> = scoped_api(client.clone(), namespace);
    let services: Api<Service> = scoped_api(client.clone(), namespace);
    let configmaps: Api<ConfigMap> = scoped_api(client.clone(), namespace);
    let cronjobs: Api<CronJob> = scoped_api(client.clone(), namespace);

    let watcher_config = WatcherConfig::default().any_semantic();

    Controller::new(clusters, watcher_config.clone())
        .owns(statefulsets, watcher_config.clone())
        .owns(services, watcher_config.clone())
        .owns(configmaps, watcher_config.clone())
        .owns(cronjobs, watcher_config)
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!("Reconciled: {}", obj.name);
                }
                Err(e) => {
                    // Watch events for owned objects can outlive a deleted cluster
                    let is_not_found = matches!(
                        &e,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _) if err.is_not_found()
                    );
                    if is_not_found {
                        tracing::debug!("Object no longer exists (likely deleted): {:?}", e);
                    } else {
                        tracing::error!("Reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    tracing::error!("Controller stream ended unexpectedly");
}
