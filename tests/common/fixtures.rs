//! Test fixtures and builders for PostgresCluster resources
//!
//! # Quick Start
//!
//! ```rust,ignore
//! let cluster = create_test_cluster("my-cluster", "default", 3);
//!
//! let standby = PostgresClusterBuilder::new("my-cluster", "default")
//!     .with_replicas(2)
//!     .with_standby("ext-pg")
//!     .build();
//! ```

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use kube::core::ObjectMeta;
use postgres_ha_operator::controller::{ClusterContext, ResourcesState};
use postgres_ha_operator::crd::{
    BackupSpec, DatabaseSpec, EnvVarSourceSpec, EnvVarSpec, FailoverSpec, PostgresCluster,
    PostgresClusterSpec, ResourceList, ResourceRequirements, SecretKeyRef, StandbySpec,
};
use postgres_ha_operator::resources::InstanceRole;
use postgres_ha_operator::resources::instance::generate_instance;

/// Reserved label prefix used by the custom metadata tests
pub const RESERVED: &str = "postgres-operator.smoketurner.com/";

// =============================================================================
// Convenience Functions for Simple Test Cases
// =============================================================================

/// Create a basic test cluster with minimal configuration
pub fn create_test_cluster(name: &str, namespace: &str, replicas: i32) -> PostgresCluster {
    PostgresClusterBuilder::new(name, namespace)
        .with_replicas(replicas)
        .build()
}

/// Env vars every valid cluster carries
pub fn required_env() -> Vec<EnvVarSpec> {
    vec![
        EnvVarSpec {
            name: "POSTGRES_PASSWORD".to_string(),
            value: None,
            value_from: Some(EnvVarSourceSpec {
                secret_key_ref: Some(SecretKeyRef {
                    name: "postgres-secret".to_string(),
                    key: "superUserPassword".to_string(),
                }),
            }),
        },
        EnvVarSpec {
            name: "POSTGRES_REPLICATION_PASSWORD".to_string(),
            value: None,
            value_from: Some(EnvVarSourceSpec {
                secret_key_ref: Some(SecretKeyRef {
                    name: "postgres-secret".to_string(),
                    key: "replicationUserPassword".to_string(),
                }),
            }),
        },
    ]
}

// =============================================================================
// PostgresCluster Builder
// =============================================================================

/// Builder for PostgresCluster test fixtures
#[allow(dead_code)]
pub struct PostgresClusterBuilder {
    name: String,
    namespace: String,
    uid: Option<String>,
    generation: Option<i64>,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    spec: PostgresClusterSpec,
}

#[allow(dead_code)]
impl PostgresClusterBuilder {
    /// Create a new builder: one instance of `postgres:16.4` with 1Gi of storage
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            uid: Some("test-uid-12345".to_string()),
            generation: Some(1),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            spec: PostgresClusterSpec {
                image: "postgres:16.4".to_string(),
                replicas: 1,
                port: 5432,
                database: DatabaseSpec {
                    size: "1Gi".to_string(),
                    storage_class_name: None,
                    volume_mount: "/var/lib/postgresql/data".to_string(),
                },
                custom_config: None,
                env: required_env(),
                resources: None,
                standby: StandbySpec::default(),
                backup: None,
                failover: FailoverSpec::default(),
            },
        }
    }

    /// Create a builder for a primary and two replicas
    pub fn ha(name: &str, namespace: &str) -> Self {
        Self::new(name, namespace).with_replicas(3)
    }

    pub fn with_generation(mut self, generation: i64) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn with_replicas(mut self, replicas: i32) -> Self {
        self.spec.replicas = replicas;
        self
    }

    pub fn with_image(mut self, image: &str) -> Self {
        self.spec.image = image.to_string();
        self
    }

    pub fn with_port(mut self, port: i32) -> Self {
        self.spec.port = port;
        self
    }

    pub fn with_storage(mut self, size: &str, class: Option<&str>) -> Self {
        self.spec.database.size = size.to_string();
        self.spec.database.storage_class_name = class.map(String::from);
        self
    }

    pub fn with_custom_config(mut self, config_map: &str) -> Self {
        self.spec.custom_config = Some(config_map.to_string());
        self
    }

    pub fn with_env(mut self, name: &str, value: &str) -> Self {
        self.spec.env.push(EnvVarSpec {
            name: name.to_string(),
            value: Some(value.to_string()),
            value_from: None,
        });
        self
    }

    pub fn without_env(mut self) -> Self {
        self.spec.env.clear();
        self
    }

    /// Set resource requirements (same for requests and limits)
    pub fn with_resources(mut self, cpu: &str, memory: &str) -> Self {
        let list = ResourceList {
            cpu: Some(cpu.to_string()),
            memory: Some(memory.to_string()),
        };
        self.spec.resources = Some(ResourceRequirements {
            limits: Some(list.clone()),
            requests: Some(list),
        });
        self
    }

    /// Replicate from an external primary
    pub fn with_standby(mut self, primary_endpoint: &str) -> Self {
        self.spec.standby = StandbySpec {
            enabled: true,
            primary_endpoint: Some(primary_endpoint.to_string()),
        };
        self
    }

    pub fn with_backup(mut self, schedule: &str, pvc_name: &str, volume_mount: &str) -> Self {
        self.spec.backup = Some(BackupSpec {
            schedule: schedule.to_string(),
            pvc_name: pvc_name.to_string(),
            volume_mount: volume_mount.to_string(),
        });
        self
    }

    pub fn with_failover_disabled(mut self) -> Self {
        self.spec.failover.is_disabled = true;
        self
    }

    pub fn with_grace_period(mut self, seconds: i64) -> Self {
        self.spec.failover.grace_period_seconds = seconds;
        self
    }

    pub fn with_promote_instance(mut self, instance: &str) -> Self {
        self.spec.failover.promote_instance = Some(instance.to_string());
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_annotation(mut self, key: &str, value: &str) -> Self {
        self.annotations.insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> PostgresCluster {
        PostgresCluster {
            metadata: ObjectMeta {
                name: Some(self.name),
                namespace: Some(self.namespace),
                uid: self.uid,
                generation: self.generation,
                labels: (!self.labels.is_empty()).then_some(self.labels),
                annotations: (!self.annotations.is_empty()).then_some(self.annotations),
                ..Default::default()
            },
            spec: self.spec,
            status: None,
        }
    }
}

// =============================================================================
// Deployed instances
// =============================================================================

/// An instance StatefulSet as the operator would generate it, with its
/// readiness reported in status and a resourceVersion set
pub fn deployed_instance(
    cluster: &PostgresCluster,
    index: u32,
    role: InstanceRole,
    ready: bool,
) -> StatefulSet {
    let ctx = ClusterContext::new(cluster).unwrap();
    let state = ResourcesState::default();
    let mut sts = generate_instance(&ctx, &state, index, role);
    sts.metadata.resource_version = Some("1".to_string());
    sts.status = Some(StatefulSetStatus {
        replicas: 1,
        ready_replicas: Some(i32::from(ready)),
        ..Default::default()
    });
    sts
}

/// Resources state for a cluster whose instances are `statefulsets`
pub fn state_with(statefulsets: Vec<StatefulSet>) -> ResourcesState {
    ResourcesState::from_parts(None, None, statefulsets)
}
