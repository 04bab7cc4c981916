//! Common utilities for Kubernetes resource generation
//!
//! Shared constants, label helpers and the instance role marker used by every
//! generator and by the enforcers that compare against generated values.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use crate::crd::PostgresCluster;

/// API version for PostgresCluster CRD
pub const API_VERSION: &str = "postgres-operator.smoketurner.com/v1alpha1";

/// Kind for PostgresCluster CRD
pub const KIND: &str = "PostgresCluster";

/// Operator field manager name for server-side apply
pub const FIELD_MANAGER: &str = "postgres-operator";

/// Prefix of the labels and annotations the operator owns on deployed instances
pub const RESERVED_PREFIX: &str = "postgres-operator.smoketurner.com/";

pub const CLUSTER_LABEL: &str = "postgres-operator.smoketurner.com/cluster";
pub const INSTANCE_INDEX_LABEL: &str = "postgres-operator.smoketurner.com/instance-index";
pub const ROLE_LABEL: &str = "postgres-operator.smoketurner.com/role";
/// Set on every non-primary instance; the replica service selects on it
pub const READ_ONLY_LABEL: &str = "postgres-operator.smoketurner.com/read-only";

/// Role of one deployed instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InstanceRole {
    Primary,
    Replica,
    /// Lowest-index instance of a standby cluster, replicating from the external primary
    StandbyReplica,
}

impl InstanceRole {
    pub fn label_value(&self) -> &'static str {
        match self {
            InstanceRole::Primary => "primary",
            InstanceRole::Replica => "replica",
            InstanceRole::StandbyReplica => "standby-replica",
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, InstanceRole::Primary)
    }
}

impl fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceRole::Primary => write!(f, "Primary"),
            InstanceRole::Replica => write!(f, "Replica"),
            InstanceRole::StandbyReplica => write!(f, "StandbyReplica"),
        }
    }
}

impl FromStr for InstanceRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(InstanceRole::Primary),
            "replica" => Ok(InstanceRole::Replica),
            "standby-replica" => Ok(InstanceRole::StandbyReplica),
            other => Err(format!("unknown instance role '{other}'")),
        }
    }
}

/// Generate an owner reference for a PostgresCluster
///
/// All child resources are owned by the cluster and garbage collected with it.
pub fn owner_reference(cluster: &PostgresCluster) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Generate standard labels for all resources belonging to a PostgresCluster
pub fn standard_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            cluster_name.to_string(),
        ),
        (
            "app.kubernetes.io/component".to_string(),
            "postgresql".to_string(),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
        (CLUSTER_LABEL.to_string(), cluster_name.to_string()),
    ])
}

/// Labels for one instance StatefulSet and its pod template
pub fn instance_labels(
    cluster_name: &str,
    index: u32,
    role: InstanceRole,
) -> BTreeMap<String, String> {
    let mut labels = standard_labels(cluster_name);
    labels.insert(INSTANCE_INDEX_LABEL.to_string(), index.to_string());
    labels.insert(ROLE_LABEL.to_string(), role.label_value().to_string());
    if !role.is_primary() {
        labels.insert(READ_ONLY_LABEL.to_string(), "true".to_string());
    }
    labels
}

/// Labels selecting one instance's pod; a subset of [`instance_labels`] that
/// does not change when the instance's role does
pub fn instance_selector_labels(cluster_name: &str, index: u32) -> BTreeMap<String, String> {
    BTreeMap::from([
        (CLUSTER_LABEL.to_string(), cluster_name.to_string()),
        (INSTANCE_INDEX_LABEL.to_string(), index.to_string()),
    ])
}

/// Label selector matching every instance of a cluster
pub fn cluster_selector(cluster_name: &str) -> String {
    format!("{CLUSTER_LABEL}={cluster_name}")
}

/// Labels the operator sets itself; never treated as custom metadata
pub const OPERATOR_LABELS: [&str; 4] = [
    CLUSTER_LABEL,
    INSTANCE_INDEX_LABEL,
    ROLE_LABEL,
    READ_ONLY_LABEL,
];

/// Whether a label/annotation key is custom metadata propagated from the cluster
pub fn is_custom_metadata_key(key: &str) -> bool {
    key.starts_with(RESERVED_PREFIX) && !OPERATOR_LABELS.contains(&key)
}

/// Keep only the custom metadata keys of a label or annotation map
pub fn reserved_subset(map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    map.iter()
        .filter(|(k, _)| is_custom_metadata_key(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
