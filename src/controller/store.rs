//! Access to the Kubernetes objects a cluster owns
//!
//! The reconcile loop, topology and enforcement runner only talk to the API
//! server through [`ClusterStore`], so they can run against an in-memory store
//! in tests. [`KubeStore`] is the production implementation.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::debug;

use crate::controller::error::{Error, Result, is_conflict, is_not_found};
use crate::crd::{PostgresCluster, PostgresClusterStatus};
use crate::resources::common::{FIELD_MANAGER, cluster_selector};

/// Optional status fields that must be nulled out when unset
const CLEARABLE_STATUS_FIELDS: [&str; 3] =
    ["currentPrimary", "blockingOperation", "primaryUnavailableSince"];

/// Typed get/list/create/update/delete over the objects of one cluster
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// List the instance StatefulSets labelled with the cluster
    async fn list_instances(&self, ns: &str, cluster: &str) -> Result<Vec<StatefulSet>>;

    async fn get_instance(&self, ns: &str, name: &str) -> Result<Option<StatefulSet>>;

    /// Create an instance; an existing object of the same name is a `Conflict`
    async fn create_instance(&self, ns: &str, sts: &StatefulSet) -> Result<StatefulSet>;

    /// Replace an instance, guarded by the resourceVersion it carries
    async fn replace_instance(&self, ns: &str, sts: &StatefulSet) -> Result<StatefulSet>;

    /// Delete an instance; returns false when it was already gone
    async fn delete_instance(&self, ns: &str, name: &str) -> Result<bool>;

    /// Delete a pod so its StatefulSet recreates it from the current template
    async fn delete_pod(&self, ns: &str, name: &str) -> Result<bool>;

    async fn get_config_map(&self, ns: &str, name: &str) -> Result<Option<ConfigMap>>;

    /// Create a config map; an existing one is left untouched
    async fn create_config_map(&self, ns: &str, cm: &ConfigMap) -> Result<()>;

    async fn apply_service(&self, ns: &str, svc: &Service) -> Result<()>;

    async fn delete_service(&self, ns: &str, name: &str) -> Result<bool>;

    async fn apply_cron_job(&self, ns: &str, job: &CronJob) -> Result<()>;

    async fn delete_cron_job(&self, ns: &str, name: &str) -> Result<bool>;

    async fn patch_cluster_status(
        &self,
        ns: &str,
        name: &str,
        status: &PostgresClusterStatus,
    ) -> Result<()>;
}

/// [`ClusterStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, ns: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), ns)
    }

    async fn delete<K>(&self, ns: &str, name: &str) -> Result<bool>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        <K as kube::Resource>::DynamicType: Default,
    {
        match self.api::<K>(ns).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => {
                debug!(name, "Object already deleted");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn list_instances(&self, ns: &str, cluster: &str) -> Result<Vec<StatefulSet>> {
        let lp = ListParams::default().labels(&cluster_selector(cluster));
        let list = self.api::<StatefulSet>(ns).list(&lp).await?;
        Ok(list.items)
    }

    async fn get_instance(&self, ns: &str, name: &str) -> Result<Option<StatefulSet>> {
        Ok(self.api::<StatefulSet>(ns).get_opt(name).await?)
    }

    async fn create_instance(&self, ns: &str, sts: &StatefulSet) -> Result<StatefulSet> {
        match self
            .api::<StatefulSet>(ns)
            .create(&PostParams::default(), sts)
            .await
        {
            Ok(created) => Ok(created),
            Err(e) if is_conflict(&e) => Err(Error::Conflict(sts.name_any())),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace_instance(&self, ns: &str, sts: &StatefulSet) -> Result<StatefulSet> {
        let name = sts.name_any();
        match self
            .api::<StatefulSet>(ns)
            .replace(&name, &PostParams::default(), sts)
            .await
        {
            Ok(updated) => Ok(updated),
            Err(e) if is_conflict(&e) => Err(Error::Conflict(name)),
            Err(e) if is_not_found(&e) => Err(Error::NotFound(name)),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_instance(&self, ns: &str, name: &str) -> Result<bool> {
        self.delete::<StatefulSet>(ns, name).await
    }

    async fn delete_pod(&self, ns: &str, name: &str) -> Result<bool> {
        self.delete::<Pod>(ns, name).await
    }

    async fn get_config_map(&self, ns: &str, name: &str) -> Result<Option<ConfigMap>> {
        Ok(self.api::<ConfigMap>(ns).get_opt(name).await?)
    }

    async fn create_config_map(&self, ns: &str, cm: &ConfigMap) -> Result<()> {
        match self
            .api::<ConfigMap>(ns)
            .create(&PostParams::default(), cm)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_service(&self, ns: &str, svc: &Service) -> Result<()> {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.api::<Service>(ns)
            .patch(&svc.name_any(), &params, &Patch::Apply(svc))
            .await?;
        Ok(())
    }

    async fn delete_service(&self, ns: &str, name: &str) -> Result<bool> {
        self.delete::<Service>(ns, name).await
    }

    async fn apply_cron_job(&self, ns: &str, job: &CronJob) -> Result<()> {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.api::<CronJob>(ns)
            .patch(&job.name_any(), &params, &Patch::Apply(job))
            .await?;
        Ok(())
    }

    async fn delete_cron_job(&self, ns: &str, name: &str) -> Result<bool> {
        self.delete::<CronJob>(ns, name).await
    }

    async fn patch_cluster_status(
        &self,
        ns: &str,
        name: &str,
        status: &PostgresClusterStatus,
    ) -> Result<()> {
        let api: Api<PostgresCluster> = self.api(ns);
        let mut value = serde_json::to_value(status)?;
        // Merge patches only remove a field when it is explicitly null
        if let Some(fields) = value.as_object_mut() {
            for key in CLEARABLE_STATUS_FIELDS {
                fields
                    .entry(key)
                    .or_insert(serde_json::Value::Null);
            }
        }
        let patch = json!({ "status": value });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
