//! Snapshot of the deployed objects a reconcile pass works from
//!
//! Loaded once per pass: the config maps backing the PostgreSQL configuration,
//! where each configuration file comes from, and the deployed instances.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use tracing::debug;

use crate::controller::cluster_context::{
    BASE_CONFIG_VOLUME_NAME, CUSTOM_CONFIG_VOLUME_NAME, ClusterContext,
};
use crate::controller::error::{Error, Result};
use crate::controller::store::ClusterStore;
use crate::resources::common::{INSTANCE_INDEX_LABEL, InstanceRole, ROLE_LABEL};

/// Configuration file roles the instances mount from a config map
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConfigKey {
    PostgresConf,
    PrimaryInitScript,
    PgHbaConf,
    CopyPrimaryDataToReplica,
    PrimaryCreateReplicationRole,
    PromoteReplicaToPrimary,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 6] = [
        ConfigKey::PostgresConf,
        ConfigKey::PrimaryInitScript,
        ConfigKey::PgHbaConf,
        ConfigKey::CopyPrimaryDataToReplica,
        ConfigKey::PrimaryCreateReplicationRole,
        ConfigKey::PromoteReplicaToPrimary,
    ];

    /// Data key in the config map, also used as the mount's `subPath`
    pub fn data_key(&self) -> &'static str {
        match self {
            ConfigKey::PostgresConf => "postgres.conf",
            ConfigKey::PrimaryInitScript => "primary_init_script.sh",
            ConfigKey::PgHbaConf => "pg_hba.conf",
            ConfigKey::CopyPrimaryDataToReplica => "copy_primary_data_to_replica.sh",
            ConfigKey::PrimaryCreateReplicationRole => "primary_create_replication_role.sh",
            ConfigKey::PromoteReplicaToPrimary => "promote_replica_to_primary.sh",
        }
    }
}

/// Volume each configuration file is mounted from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigLocations {
    locations: BTreeMap<ConfigKey, &'static str>,
}

impl Default for ConfigLocations {
    fn default() -> Self {
        Self::resolve(None)
    }
}

impl ConfigLocations {
    /// Keys present in the custom config map come from it, the rest from the base
    pub fn resolve(custom: Option<&ConfigMap>) -> Self {
        let custom_keys = custom.and_then(|cm| cm.data.as_ref());
        let locations = ConfigKey::ALL
            .iter()
            .map(|key| {
                let volume = match custom_keys {
                    Some(data) if data.contains_key(key.data_key()) => CUSTOM_CONFIG_VOLUME_NAME,
                    _ => BASE_CONFIG_VOLUME_NAME,
                };
                (*key, volume)
            })
            .collect();
        Self { locations }
    }

    pub fn volume_for(&self, key: ConfigKey) -> &'static str {
        self.locations
            .get(&key)
            .copied()
            .unwrap_or(BASE_CONFIG_VOLUME_NAME)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConfigKey, &'static str)> + '_ {
        self.locations.iter().map(|(k, v)| (*k, *v))
    }

    pub fn uses_custom_config(&self) -> bool {
        self.locations
            .values()
            .any(|v| *v == CUSTOM_CONFIG_VOLUME_NAME)
    }
}

/// One deployed PostgreSQL instance
#[derive(Clone, Debug)]
pub struct DeployedInstance {
    pub name: String,
    pub index: u32,
    pub role: InstanceRole,
    pub ready: bool,
    pub stateful_set: StatefulSet,
}

impl DeployedInstance {
    /// Parse an instance from its labels; `Err` carries the reason it was skipped
    pub fn from_stateful_set(sts: StatefulSet) -> Result<Self, String> {
        let name = sts.name_any();
        let labels = sts.labels();
        let index = labels
            .get(INSTANCE_INDEX_LABEL)
            .ok_or_else(|| format!("{name} has no {INSTANCE_INDEX_LABEL} label"))?
            .parse::<u32>()
            .map_err(|e| format!("{name} has an invalid instance index: {e}"))?;
        let role = labels
            .get(ROLE_LABEL)
            .ok_or_else(|| format!("{name} has no {ROLE_LABEL} label"))?
            .parse::<InstanceRole>()
            .map_err(|e| format!("{name}: {e}"))?;
        let ready = sts
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0)
            >= 1;
        Ok(Self {
            name,
            index,
            role,
            ready,
            stateful_set: sts,
        })
    }
}

impl fmt::Display for DeployedInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ready = if self.ready { "ready" } else { "not ready" };
        write!(f, "{} ({}, {})", self.name, self.role, ready)
    }
}

/// Deployed state of one cluster
#[derive(Clone, Debug, Default)]
pub struct ResourcesState {
    pub base_config_map: Option<ConfigMap>,
    pub custom_config_map: Option<ConfigMap>,
    pub config_locations: ConfigLocations,
    /// A custom config map is named by the cluster and exists
    pub custom_config_deployed: bool,
    /// Parsed instances, ordered by index
    pub instances: Vec<DeployedInstance>,
    /// Instances whose labels could not be parsed, with the reason
    pub unrecognized: Vec<String>,
}

impl ResourcesState {
    pub async fn load(ctx: &ClusterContext, store: &dyn ClusterStore) -> Result<Self> {
        let ns = ctx.namespace();
        let base = store.get_config_map(ns, ctx.base_config_map_name()).await?;

        let custom = match ctx.custom_config_name() {
            Some(name) => match store.get_config_map(ns, name).await? {
                Some(cm) => Some(cm),
                None => {
                    return Err(Error::ValidationError(format!(
                        "customConfig '{name}' does not exist in namespace '{ns}'"
                    )));
                }
            },
            None => None,
        };

        let statefulsets = store.list_instances(ns, ctx.name()).await?;
        Ok(Self::from_parts(base, custom, statefulsets))
    }

    pub fn from_parts(
        base_config_map: Option<ConfigMap>,
        custom_config_map: Option<ConfigMap>,
        statefulsets: Vec<StatefulSet>,
    ) -> Self {
        let config_locations = ConfigLocations::resolve(custom_config_map.as_ref());
        let mut instances = Vec::with_capacity(statefulsets.len());
        let mut unrecognized = Vec::new();
        for sts in statefulsets {
            match DeployedInstance::from_stateful_set(sts) {
                Ok(instance) => instances.push(instance),
                Err(reason) => {
                    debug!(%reason, "Ignoring unrecognized instance");
                    unrecognized.push(reason);
                }
            }
        }
        instances.sort_by_key(|i| i.index);

        Self {
            custom_config_deployed: custom_config_map.is_some(),
            base_config_map,
            custom_config_map,
            config_locations,
            instances,
            unrecognized,
        }
    }

    /// The instance carrying the primary role, lowest index first
    pub fn primary(&self) -> Option<&DeployedInstance> {
        self.instances.iter().find(|i| i.role.is_primary())
    }

    pub fn primaries(&self) -> impl Iterator<Item = &DeployedInstance> {
        self.instances.iter().filter(|i| i.role.is_primary())
    }

    /// Replicas and standby replicas, ordered by index
    pub fn replicas(&self) -> impl Iterator<Item = &DeployedInstance> {
        self.instances.iter().filter(|i| !i.role.is_primary())
    }

    pub fn instance(&self, name: &str) -> Option<&DeployedInstance> {
        self.instances.iter().find(|i| i.name == name)
    }

    pub fn instance_by_index(&self, index: u32) -> Option<&DeployedInstance> {
        self.instances.iter().find(|i| i.index == index)
    }

    pub fn ready_primary_count(&self) -> usize {
        self.primaries().filter(|i| i.ready).count()
    }

    pub fn ready_replica_count(&self) -> usize {
        self.replicas().filter(|i| i.ready).count()
    }
}
