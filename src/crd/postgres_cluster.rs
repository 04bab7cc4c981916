use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// PostgresCluster is the Schema for the postgresclusters API
///
/// One primary and `replicas - 1` streaming replicas, each deployed as its own
/// single-pod StatefulSet. In standby mode every instance replicates from an
/// external primary and no local primary exists.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "postgres-operator.smoketurner.com",
    version = "v1alpha1",
    kind = "PostgresCluster",
    plural = "postgresclusters",
    shortname = "pgc",
    namespaced,
    status = "PostgresClusterStatus",
    printcolumn = r#"{"name":"Image", "type":"string", "jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Primary", "type":"string", "jsonPath":".status.currentPrimary"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterSpec {
    /// PostgreSQL container image (e.g., "postgres:16.4")
    pub image: String,

    /// Total number of instances (primary + replicas)
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Port PostgreSQL listens on
    #[serde(default = "default_port")]
    pub port: i32,

    /// Storage for the data directory
    pub database: DatabaseSpec,

    /// Name of a ConfigMap overriding one or more keys of the base config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_config: Option<String>,

    /// Environment variables passed to every PostgreSQL container.
    /// Must define POSTGRES_PASSWORD and POSTGRES_REPLICATION_PASSWORD.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVarSpec>,

    /// Resource requirements for the PostgreSQL container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Replicate the whole cluster from an external primary
    #[serde(default)]
    pub standby: StandbySpec,

    /// Scheduled logical backups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupSpec>,

    /// Automatic failover and manual switchover settings
    #[serde(default)]
    pub failover: FailoverSpec,
}

fn default_replicas() -> i32 {
    1
}

fn default_port() -> i32 {
    5432
}

/// Data volume configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    /// Size of the persistent volume (e.g., "10Gi")
    pub size: String,

    /// Storage class name (uses default if not specified)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// Mount path of the data volume
    #[serde(default = "default_volume_mount")]
    pub volume_mount: String,
}

fn default_volume_mount() -> String {
    "/var/lib/postgresql/data".to_string()
}

/// Environment variable for the PostgreSQL containers
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarSpec {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<EnvVarSourceSpec>,
}

/// Source for an environment variable's value
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarSourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<SecretKeyRef>,
}

/// Reference to a key of a Secret in the cluster's namespace
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

/// Resource requirements for PostgreSQL pods
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    /// CPU and memory limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,

    /// CPU and memory requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
}

/// Resource quantities for CPU and memory
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct ResourceList {
    /// CPU quantity (e.g., "500m", "2")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory quantity (e.g., "512Mi", "2Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Standby configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StandbySpec {
    #[serde(default)]
    pub enabled: bool,

    /// Hostname of the external primary; replicas connect on `port`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_endpoint: Option<String>,
}

/// Backup configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Backup schedule in cron format
    pub schedule: String,

    /// Existing PersistentVolumeClaim receiving the dumps
    pub pvc_name: String,

    /// Path the backup volume is mounted at inside the backup job
    pub volume_mount: String,
}

/// Failover configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FailoverSpec {
    /// Never promote a replica automatically
    #[serde(default)]
    pub is_disabled: bool,

    /// Instance (StatefulSet name) to promote as the new primary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promote_instance: Option<String>,

    /// How long the primary may stay unready before a replica is promoted
    #[serde(default = "default_grace_period_seconds")]
    pub grace_period_seconds: i64,
}

impl Default for FailoverSpec {
    fn default() -> Self {
        Self {
            is_disabled: false,
            promote_instance: None,
            grace_period_seconds: default_grace_period_seconds(),
        }
    }
}

fn default_grace_period_seconds() -> i64 {
    30
}

/// Status of the PostgresCluster
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterStatus {
    /// Current phase of the cluster lifecycle
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Topology state observed during the last reconcile
    #[serde(default)]
    pub topology: TopologyState,

    /// Name of the instance currently holding the primary role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_primary: Option<String>,

    /// Number of ready primary instances (0 or 1 once settled)
    #[serde(default)]
    pub ready_primary_count: i32,

    /// Number of ready replica instances
    #[serde(default)]
    pub ready_replica_count: i32,

    /// Number of deployed instances
    #[serde(default)]
    pub instances: i32,

    /// Operation that freezes scaling until it completes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocking_operation: Option<BlockingOperation>,

    /// When the primary was first observed unready (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_unavailable_since: Option<String>,

    /// Observed generation of the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Kubernetes-style conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Cluster lifecycle phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum ClusterPhase {
    /// Cluster is waiting to be created
    #[default]
    Pending,
    /// First instances are being created
    Creating,
    /// All instances are deployed and ready
    Running,
    /// Instances are being added or removed
    Scaling,
    /// A replica is being promoted
    FailingOver,
    /// Instances are deployed but some are not ready
    Degraded,
    /// Spec is invalid or reconciliation keeps failing
    Failed,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterPhase::Pending => write!(f, "Pending"),
            ClusterPhase::Creating => write!(f, "Creating"),
            ClusterPhase::Running => write!(f, "Running"),
            ClusterPhase::Scaling => write!(f, "Scaling"),
            ClusterPhase::FailingOver => write!(f, "FailingOver"),
            ClusterPhase::Degraded => write!(f, "Degraded"),
            ClusterPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Topology of the deployed instances relative to the spec
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum TopologyState {
    #[default]
    NoInstances,
    ConvergingUp,
    Stable,
    ConvergingDown,
    FailoverInProgress,
}

impl std::fmt::Display for TopologyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopologyState::NoInstances => write!(f, "NoInstances"),
            TopologyState::ConvergingUp => write!(f, "ConvergingUp"),
            TopologyState::Stable => write!(f, "Stable"),
            TopologyState::ConvergingDown => write!(f, "ConvergingDown"),
            TopologyState::FailoverInProgress => write!(f, "FailoverInProgress"),
        }
    }
}

/// An in-flight promotion, persisted so that concurrent passes observe it
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlockingOperation {
    pub kind: BlockingOperationKind,

    /// Instance being promoted
    pub target_instance: String,

    /// Primary being replaced, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_primary: Option<String>,

    /// RFC 3339 timestamp
    pub started_at: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum BlockingOperationKind {
    /// Automatic promotion after primary loss
    Failover,
    /// Promotion requested through `failover.promoteInstance`
    Switchover,
    /// Standby mode was disabled and the standby leader becomes primary
    StandbyPromotion,
}

impl std::fmt::Display for BlockingOperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockingOperationKind::Failover => write!(f, "Failover"),
            BlockingOperationKind::Switchover => write!(f, "Switchover"),
            BlockingOperationKind::StandbyPromotion => write!(f, "StandbyPromotion"),
        }
    }
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False, or Unknown
    pub status: String,

    /// Reason for the condition's last transition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: String,

    /// Generation observed when condition was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
