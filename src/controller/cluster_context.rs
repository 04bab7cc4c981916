//! Per-pass view of one PostgresCluster and the names derived from it

use std::collections::BTreeMap;
use std::fmt;

use kube::ResourceExt;

use crate::controller::error::{Error, Result};
use crate::crd::{PostgresCluster, PostgresClusterSpec, PostgresClusterStatus};
use crate::resources::common::reserved_subset;

/// Shared base config map, one per namespace
pub const BASE_CONFIG_MAP_NAME: &str = "base-postgres-config";

pub const DATA_VOLUME_NAME: &str = "postgres-db";
pub const BASE_CONFIG_VOLUME_NAME: &str = "base-config";
pub const CUSTOM_CONFIG_VOLUME_NAME: &str = "custom-config";

pub const POSTGRES_CONTAINER_NAME: &str = "postgres";
pub const REPLICA_INIT_CONTAINER_NAME: &str = "setup-replica-data-directory";
pub const PROMOTE_INIT_CONTAINER_NAME: &str = "promote-replica-to-primary";

/// First env var of the replica bootstrap init container
pub const PRIMARY_HOST_ENV: &str = "PRIMARY_HOST_NAME";

/// Reserved-prefix labels and annotations the cluster asks to propagate
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CustomMetadata {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl CustomMetadata {
    /// Extract the reserved-prefix subset of a label/annotation pair
    pub fn from_maps(
        labels: Option<&BTreeMap<String, String>>,
        annotations: Option<&BTreeMap<String, String>>,
    ) -> Self {
        Self {
            labels: labels.map(reserved_subset).unwrap_or_default(),
            annotations: annotations.map(reserved_subset).unwrap_or_default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.annotations.is_empty()
    }
}

impl fmt::Display for CustomMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |m: &BTreeMap<String, String>| {
            m.iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(
            f,
            "Labels: {} - Annotations: {}",
            join(&self.labels),
            join(&self.annotations)
        )
    }
}

/// Immutable view of the desired cluster for one reconcile pass
#[derive(Clone, Debug)]
pub struct ClusterContext {
    cluster: PostgresCluster,
    name: String,
    namespace: String,
}

impl ClusterContext {
    pub fn new(cluster: &PostgresCluster) -> Result<Self> {
        let namespace = cluster
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let name = cluster
            .metadata
            .name
            .clone()
            .ok_or(Error::MissingObjectKey(".metadata.name"))?;
        Ok(Self {
            cluster: cluster.clone(),
            name,
            namespace,
        })
    }

    pub fn cluster(&self) -> &PostgresCluster {
        &self.cluster
    }

    pub fn spec(&self) -> &PostgresClusterSpec {
        &self.cluster.spec
    }

    pub fn status(&self) -> Option<&PostgresClusterStatus> {
        self.cluster.status.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn generation(&self) -> Option<i64> {
        self.cluster.metadata.generation
    }

    pub fn desired_instances(&self) -> u32 {
        self.spec().replicas.max(0) as u32
    }

    pub fn instance_name(&self, index: u32) -> String {
        format!("{}-{}", self.name, index)
    }

    /// Pod backing an instance StatefulSet (always a single pod)
    pub fn pod_name(&self, instance_name: &str) -> String {
        format!("{instance_name}-0")
    }

    pub fn primary_service_name(&self) -> String {
        self.name.clone()
    }

    pub fn replica_service_name(&self) -> String {
        format!("{}-replica", self.name)
    }

    pub fn backup_cron_job_name(&self) -> String {
        format!("backup-{}", self.name)
    }

    pub fn base_config_map_name(&self) -> &'static str {
        BASE_CONFIG_MAP_NAME
    }

    /// Custom config map name, if one is set and is not the base config map
    pub fn custom_config_name(&self) -> Option<&str> {
        self.spec()
            .custom_config
            .as_deref()
            .filter(|n| !n.is_empty() && *n != BASE_CONFIG_MAP_NAME)
    }

    pub fn is_standby(&self) -> bool {
        self.spec().standby.enabled
    }

    /// Endpoint replicas stream from: the external primary in standby mode,
    /// else the primary service
    pub fn replication_source(&self) -> String {
        if self.is_standby() {
            self.spec()
                .standby
                .primary_endpoint
                .clone()
                .unwrap_or_default()
        } else {
            self.primary_service_name()
        }
    }

    /// Reserved-prefix metadata carried by the PostgresCluster itself
    pub fn custom_metadata(&self) -> CustomMetadata {
        CustomMetadata::from_maps(
            self.cluster.metadata.labels.as_ref(),
            self.cluster.metadata.annotations.as_ref(),
        )
    }

    pub fn current_primary(&self) -> Option<&str> {
        self.status().and_then(|s| s.current_primary.as_deref())
    }
}
