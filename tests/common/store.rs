//! In-memory [`ClusterStore`] and [`EventSink`] for driving reconcile passes
//! without an API server
//!
//! The store keeps one namespace worth of objects keyed by name. Writes bump a
//! resourceVersion and replaces are rejected with `Conflict` when the version
//! they carry is stale, like the API server does. Deleting an instance pod
//! marks its StatefulSet not ready until the test marks it ready again.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::ResourceExt;
use postgres_ha_operator::controller::{
    ClusterEvent, ClusterStore, Error, EventKind, EventSink, PassReport, Result, reconcile_pass,
};
use postgres_ha_operator::crd::{PostgresCluster, PostgresClusterStatus};

const CLUSTER_LABEL: &str = "postgres-operator.smoketurner.com/cluster";

/// Store operations that can be made to fail
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FakeOp {
    CreateInstance,
    ReplaceInstance,
    DeleteInstance,
    DeletePod,
    PatchStatus,
}

#[derive(Default)]
struct Inner {
    instances: BTreeMap<String, StatefulSet>,
    config_maps: BTreeMap<String, ConfigMap>,
    services: BTreeMap<String, Service>,
    cron_jobs: BTreeMap<String, CronJob>,
    next_version: u64,
    created: Vec<String>,
    replaced: Vec<String>,
    deleted: Vec<String>,
    deleted_pods: Vec<String>,
    status_patches: Vec<PostgresClusterStatus>,
    failures: BTreeMap<FakeOp, usize>,
}

impl Inner {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn fail(&mut self, op: FakeOp) -> Result<()> {
        match self.failures.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(Error::TransientError(format!("injected failure in {op:?}")))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct FakeStore {
    inner: Mutex<Inner>,
}

#[allow(dead_code)]
impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with instances
    pub fn with_instances(statefulsets: Vec<StatefulSet>) -> Self {
        let store = Self::new();
        for sts in statefulsets {
            store.insert_instance(sts);
        }
        store
    }

    pub fn insert_instance(&self, mut sts: StatefulSet) {
        let mut inner = self.inner.lock().unwrap();
        sts.metadata.resource_version = Some(inner.bump());
        inner.instances.insert(sts.name_any(), sts);
    }

    pub fn insert_config_map(&self, cm: ConfigMap) {
        let mut inner = self.inner.lock().unwrap();
        inner.config_maps.insert(cm.name_any(), cm);
    }

    pub fn remove_config_map(&self, name: &str) {
        self.inner.lock().unwrap().config_maps.remove(name);
    }

    /// Delete an instance behind the operator's back
    pub fn remove_instance(&self, name: &str) {
        self.inner.lock().unwrap().instances.remove(name);
    }

    /// Simulate a concurrent writer touching an instance
    pub fn touch_instance(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        let version = inner.bump();
        if let Some(sts) = inner.instances.get_mut(name) {
            sts.metadata.resource_version = Some(version);
        }
    }

    /// Fail the next `times` calls of `op` with a transient error
    pub fn fail(&self, op: FakeOp, times: usize) {
        self.inner.lock().unwrap().failures.insert(op, times);
    }

    pub fn set_ready(&self, name: &str, ready: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(sts) = inner.instances.get_mut(name) {
            sts.status = Some(StatefulSetStatus {
                replicas: 1,
                ready_replicas: Some(i32::from(ready)),
                ..Default::default()
            });
        }
    }

    pub fn mark_all_ready(&self) {
        for name in self.instance_names() {
            self.set_ready(&name, true);
        }
    }

    pub fn instance(&self, name: &str) -> Option<StatefulSet> {
        self.inner.lock().unwrap().instances.get(name).cloned()
    }

    pub fn instances(&self) -> Vec<StatefulSet> {
        self.inner.lock().unwrap().instances.values().cloned().collect()
    }

    pub fn instance_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().instances.keys().cloned().collect()
    }

    /// Role label of every instance, by name
    pub fn roles(&self) -> BTreeMap<String, String> {
        self.instances()
            .iter()
            .map(|sts| {
                let role = sts
                    .labels()
                    .get("postgres-operator.smoketurner.com/role")
                    .cloned()
                    .unwrap_or_default();
                (sts.name_any(), role)
            })
            .collect()
    }

    pub fn config_map(&self, name: &str) -> Option<ConfigMap> {
        self.inner.lock().unwrap().config_maps.get(name).cloned()
    }

    pub fn service(&self, name: &str) -> Option<Service> {
        self.inner.lock().unwrap().services.get(name).cloned()
    }

    pub fn cron_job(&self, name: &str) -> Option<CronJob> {
        self.inner.lock().unwrap().cron_jobs.get(name).cloned()
    }

    pub fn created(&self) -> Vec<String> {
        self.inner.lock().unwrap().created.clone()
    }

    pub fn replaced(&self) -> Vec<String> {
        self.inner.lock().unwrap().replaced.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.inner.lock().unwrap().deleted.clone()
    }

    pub fn deleted_pods(&self) -> Vec<String> {
        self.inner.lock().unwrap().deleted_pods.clone()
    }

    pub fn status_patches(&self) -> Vec<PostgresClusterStatus> {
        self.inner.lock().unwrap().status_patches.clone()
    }

    pub fn last_status(&self) -> Option<PostgresClusterStatus> {
        self.inner.lock().unwrap().status_patches.last().cloned()
    }

    /// Forget recorded writes, keeping the objects
    pub fn clear_history(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.created.clear();
        inner.replaced.clear();
        inner.deleted.clear();
        inner.deleted_pods.clear();
        inner.status_patches.clear();
    }
}

#[async_trait]
impl ClusterStore for FakeStore {
    async fn list_instances(&self, _ns: &str, cluster: &str) -> Result<Vec<StatefulSet>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .instances
            .values()
            .filter(|sts| sts.labels().get(CLUSTER_LABEL).map(String::as_str) == Some(cluster))
            .cloned()
            .collect())
    }

    async fn get_instance(&self, _ns: &str, name: &str) -> Result<Option<StatefulSet>> {
        Ok(self.instance(name))
    }

    async fn create_instance(&self, _ns: &str, sts: &StatefulSet) -> Result<StatefulSet> {
        let mut inner = self.inner.lock().unwrap();
        inner.fail(FakeOp::CreateInstance)?;
        let name = sts.name_any();
        if inner.instances.contains_key(&name) {
            return Err(Error::Conflict(name));
        }
        let mut created = sts.clone();
        created.metadata.resource_version = Some(inner.bump());
        created.status = None;
        inner.instances.insert(name.clone(), created.clone());
        inner.created.push(name);
        Ok(created)
    }

    async fn replace_instance(&self, _ns: &str, sts: &StatefulSet) -> Result<StatefulSet> {
        let mut inner = self.inner.lock().unwrap();
        inner.fail(FakeOp::ReplaceInstance)?;
        let name = sts.name_any();
        let Some(live) = inner.instances.get(&name) else {
            return Err(Error::NotFound(name));
        };
        if live.metadata.resource_version != sts.metadata.resource_version {
            return Err(Error::Conflict(name));
        }
        let status = live.status.clone();
        let mut replaced = sts.clone();
        replaced.metadata.resource_version = Some(inner.bump());
        replaced.status = status;
        inner.instances.insert(name.clone(), replaced.clone());
        inner.replaced.push(name);
        Ok(replaced)
    }

    async fn delete_instance(&self, _ns: &str, name: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.fail(FakeOp::DeleteInstance)?;
        let existed = inner.instances.remove(name).is_some();
        if existed {
            inner.deleted.push(name.to_string());
        }
        Ok(existed)
    }

    async fn delete_pod(&self, _ns: &str, name: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.fail(FakeOp::DeletePod)?;
        inner.deleted_pods.push(name.to_string());
        let owner = name.strip_suffix("-0").unwrap_or(name).to_string();
        match inner.instances.get_mut(&owner) {
            Some(sts) => {
                sts.status = Some(StatefulSetStatus {
                    replicas: 1,
                    ready_replicas: Some(0),
                    ..Default::default()
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_config_map(&self, _ns: &str, name: &str) -> Result<Option<ConfigMap>> {
        Ok(self.config_map(name))
    }

    async fn create_config_map(&self, _ns: &str, cm: &ConfigMap) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .config_maps
            .entry(cm.name_any())
            .or_insert_with(|| cm.clone());
        Ok(())
    }

    async fn apply_service(&self, _ns: &str, svc: &Service) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.services.insert(svc.name_any(), svc.clone());
        Ok(())
    }

    async fn delete_service(&self, _ns: &str, name: &str) -> Result<bool> {
        Ok(self.inner.lock().unwrap().services.remove(name).is_some())
    }

    async fn apply_cron_job(&self, _ns: &str, job: &CronJob) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.cron_jobs.insert(job.name_any(), job.clone());
        Ok(())
    }

    async fn delete_cron_job(&self, _ns: &str, name: &str) -> Result<bool> {
        Ok(self.inner.lock().unwrap().cron_jobs.remove(name).is_some())
    }

    async fn patch_cluster_status(
        &self,
        _ns: &str,
        _name: &str,
        status: &PostgresClusterStatus,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.fail(FakeOp::PatchStatus)?;
        inner.status_patches.push(status.clone());
        Ok(())
    }
}

/// [`EventSink`] keeping every event in memory
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<ClusterEvent>>,
}

#[allow(dead_code)]
impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ClusterEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }

    pub fn warnings(&self) -> Vec<ClusterEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.kind == EventKind::Warning)
            .collect()
    }

    pub fn count(&self, reason: &str) -> usize {
        self.events().iter().filter(|e| e.reason == reason).count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn emit(&self, _cluster: &PostgresCluster, event: ClusterEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Run one pass and carry the status it wrote back onto `cluster`, as the
/// next watch event would
#[allow(dead_code)]
pub async fn run_pass(
    cluster: &mut PostgresCluster,
    store: &FakeStore,
    events: &RecordingEventSink,
    now: DateTime<Utc>,
) -> Result<PassReport> {
    let result = reconcile_pass(cluster, store, events, now).await;
    if let Some(status) = store.last_status() {
        cluster.status = Some(status);
    }
    result
}

/// Run passes, marking every instance ready after each, until two passes in
/// a row change nothing or `max_passes` is reached. Returns the passes run.
#[allow(dead_code)]
pub async fn converge(
    cluster: &mut PostgresCluster,
    store: &FakeStore,
    events: &RecordingEventSink,
    now: DateTime<Utc>,
    max_passes: usize,
) -> usize {
    let mut quiet = 0;
    for pass in 1..=max_passes {
        let report = run_pass(cluster, store, events, now).await.unwrap();
        store.mark_all_ready();
        if report.changed() {
            quiet = 0;
        } else {
            quiet += 1;
            if quiet == 2 {
                return pass;
            }
        }
    }
    max_passes
}
