//! PostgreSQL instance StatefulSets
//!
//! Every instance is its own single-pod StatefulSet named `<cluster>-<index>`.
//! A primary runs the image's stock entrypoint with the base (or custom)
//! configuration files mounted in; a replica first runs an init container that
//! copies the data directory from its replication source with pg_basebackup.
//!
//! Instances use the `OnDelete` update strategy: template changes only reach
//! the pod once the operator deletes it, so each restart is deliberate.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    StatefulSet, StatefulSetPersistentVolumeClaimRetentionPolicy, StatefulSetSpec,
    StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    Affinity, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource, ExecAction,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PodAffinityTerm, PodAntiAffinity, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements as K8sResourceRequirements, SecretKeySelector,
    Volume, VolumeMount, VolumeResourceRequirements, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::ObjectMeta;

use crate::controller::cluster_context::{
    BASE_CONFIG_VOLUME_NAME, CUSTOM_CONFIG_VOLUME_NAME, ClusterContext, DATA_VOLUME_NAME,
    POSTGRES_CONTAINER_NAME, PRIMARY_HOST_ENV, PROMOTE_INIT_CONTAINER_NAME,
    REPLICA_INIT_CONTAINER_NAME,
};
use crate::controller::resources_state::{ConfigKey, ConfigLocations, ResourcesState};
use crate::crd::{EnvVarSpec, ResourceList, ResourceRequirements};
use crate::resources::common::{
    InstanceRole, instance_labels, instance_selector_labels, owner_reference,
};

/// Mode for config map volumes; the scripts must be executable
pub const CONFIG_VOLUME_DEFAULT_MODE: i32 = 0o777;

const POSTGRES_CONF_PATH: &str = "/etc/postgres.conf";
const PG_HBA_CONF_PATH: &str = "/etc/pg_hba.conf";
const INITDB_DIR: &str = "/docker-entrypoint-initdb.d";
const SCRIPTS_DIR: &str = "/tmp";

/// Generate the StatefulSet for one instance in the given role
pub fn generate_instance(
    ctx: &ClusterContext,
    state: &ResourcesState,
    index: u32,
    role: InstanceRole,
) -> StatefulSet {
    let name = ctx.instance_name(index);
    let spec = ctx.spec();
    let custom = ctx.custom_metadata();

    let mut labels = instance_labels(ctx.name(), index, role);
    labels.extend(custom.labels.clone());
    let annotations = (!custom.annotations.is_empty()).then(|| custom.annotations.clone());
    let selector = instance_selector_labels(ctx.name(), index);

    let locations = &state.config_locations;
    let init_containers = match role {
        InstanceRole::Primary => vec![promote_init_container(ctx, locations)],
        InstanceRole::Replica | InstanceRole::StandbyReplica => {
            vec![replica_init_container(ctx, locations)]
        }
    };

    let mut volumes = vec![config_map_volume(
        BASE_CONFIG_VOLUME_NAME,
        ctx.base_config_map_name(),
    )];
    if let Some(custom_config) = ctx.custom_config_name()
        && state.custom_config_deployed
    {
        volumes.push(custom_config_volume(custom_config));
    }

    let pvc_template = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(DATA_VOLUME_NAME.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: spec.database.storage_class_name.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(spec.database.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(ctx.namespace().to_string()),
            labels: Some(labels.clone()),
            annotations: annotations.clone(),
            owner_references: Some(vec![owner_reference(ctx.cluster())]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            // Immutable after creation, so independent of the instance's role
            service_name: Some(ctx.primary_service_name()),
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("OnDelete".to_string()),
                rolling_update: None,
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations,
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    init_containers: Some(init_containers),
                    containers: vec![postgres_container(ctx, locations, role)],
                    volumes: Some(volumes),
                    termination_grace_period_seconds: Some(30),
                    affinity: Some(generate_anti_affinity(ctx.name())),
                    security_context: Some(k8s_openapi::api::core::v1::PodSecurityContext {
                        fs_group: Some(999), // postgres group in the official image
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![pvc_template]),
            persistent_volume_claim_retention_policy: Some(
                StatefulSetPersistentVolumeClaimRetentionPolicy {
                    when_deleted: Some("Retain".to_string()),
                    when_scaled: Some("Retain".to_string()),
                },
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Volume for the custom config map
pub fn custom_config_volume(config_map_name: &str) -> Volume {
    config_map_volume(CUSTOM_CONFIG_VOLUME_NAME, config_map_name)
}

fn config_map_volume(volume_name: &str, config_map_name: &str) -> Volume {
    Volume {
        name: volume_name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map_name.to_string(),
            default_mode: Some(CONFIG_VOLUME_DEFAULT_MODE),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Container resource requirements for the cluster's resources spec
pub fn container_resources(resources: Option<&ResourceRequirements>) -> Option<K8sResourceRequirements> {
    fn to_map(list: &ResourceList) -> BTreeMap<String, Quantity> {
        let mut map = BTreeMap::new();
        if let Some(cpu) = &list.cpu {
            map.insert("cpu".to_string(), Quantity(cpu.clone()));
        }
        if let Some(memory) = &list.memory {
            map.insert("memory".to_string(), Quantity(memory.clone()));
        }
        map
    }

    resources.map(|r| K8sResourceRequirements {
        limits: r.limits.as_ref().map(to_map),
        requests: r.requests.as_ref().map(to_map),
        ..Default::default()
    })
}

/// Environment variables declared on the cluster
pub fn user_env_vars(env: &[EnvVarSpec]) -> Vec<EnvVar> {
    env.iter().map(to_env_var).collect()
}

fn to_env_var(spec: &EnvVarSpec) -> EnvVar {
    let value_from = spec
        .value_from
        .as_ref()
        .and_then(|vf| vf.secret_key_ref.as_ref())
        .map(|secret| EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.name.clone(),
                key: secret.key.clone(),
                optional: Some(false),
            }),
            ..Default::default()
        });
    EnvVar {
        name: spec.name.clone(),
        value: spec.value.clone(),
        value_from,
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn pgdata(ctx: &ClusterContext) -> String {
    format!("{}/pgdata", ctx.spec().database.volume_mount)
}

fn data_mount(ctx: &ClusterContext) -> VolumeMount {
    VolumeMount {
        name: DATA_VOLUME_NAME.to_string(),
        mount_path: ctx.spec().database.volume_mount.clone(),
        ..Default::default()
    }
}

fn config_mount(locations: &ConfigLocations, key: ConfigKey, mount_path: String) -> VolumeMount {
    VolumeMount {
        name: locations.volume_for(key).to_string(),
        mount_path,
        sub_path: Some(key.data_key().to_string()),
        ..Default::default()
    }
}

fn postgres_container(
    ctx: &ClusterContext,
    locations: &ConfigLocations,
    role: InstanceRole,
) -> Container {
    let spec = ctx.spec();

    let mut env_vars = user_env_vars(&spec.env);
    env_vars.push(env("PGDATA", pgdata(ctx)));
    env_vars.push(env("PGPORT", spec.port.to_string()));

    let mut volume_mounts = vec![
        data_mount(ctx),
        config_mount(locations, ConfigKey::PostgresConf, POSTGRES_CONF_PATH.to_string()),
        config_mount(locations, ConfigKey::PgHbaConf, PG_HBA_CONF_PATH.to_string()),
    ];
    if role.is_primary() {
        // Only run by the entrypoint when the data directory is empty
        volume_mounts.push(config_mount(
            locations,
            ConfigKey::PrimaryCreateReplicationRole,
            format!("{INITDB_DIR}/{}", ConfigKey::PrimaryCreateReplicationRole.data_key()),
        ));
        volume_mounts.push(config_mount(
            locations,
            ConfigKey::PrimaryInitScript,
            format!("{INITDB_DIR}/{}", ConfigKey::PrimaryInitScript.data_key()),
        ));
    }

    Container {
        name: POSTGRES_CONTAINER_NAME.to_string(),
        image: Some(spec.image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        args: Some(vec![
            "-c".to_string(),
            format!("config_file={POSTGRES_CONF_PATH}"),
            "-c".to_string(),
            format!("hba_file={PG_HBA_CONF_PATH}"),
        ]),
        ports: Some(vec![ContainerPort {
            container_port: spec.port,
            name: Some("postgresql".to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(env_vars),
        volume_mounts: Some(volume_mounts),
        resources: container_resources(spec.resources.as_ref()),
        readiness_probe: Some(pg_isready_probe(5, 10, 3)),
        liveness_probe: Some(pg_isready_probe(60, 20, 6)),
        ..Default::default()
    }
}

fn replica_init_container(ctx: &ClusterContext, locations: &ConfigLocations) -> Container {
    let spec = ctx.spec();
    let script = ConfigKey::CopyPrimaryDataToReplica.data_key();

    // PRIMARY_HOST_NAME must stay first; the standby endpoint enforcer reads it
    let mut env_vars = vec![
        env(PRIMARY_HOST_ENV, ctx.replication_source()),
        env("PRIMARY_PORT", spec.port.to_string()),
        env("PGDATA", pgdata(ctx)),
    ];
    env_vars.extend(user_env_vars(&spec.env));

    Container {
        name: REPLICA_INIT_CONTAINER_NAME.to_string(),
        image: Some(spec.image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("{SCRIPTS_DIR}/{script}"),
        ]),
        env: Some(env_vars),
        volume_mounts: Some(vec![
            data_mount(ctx),
            config_mount(
                locations,
                ConfigKey::CopyPrimaryDataToReplica,
                format!("{SCRIPTS_DIR}/{script}"),
            ),
        ]),
        ..Default::default()
    }
}

fn promote_init_container(ctx: &ClusterContext, locations: &ConfigLocations) -> Container {
    let script = ConfigKey::PromoteReplicaToPrimary.data_key();
    Container {
        name: PROMOTE_INIT_CONTAINER_NAME.to_string(),
        image: Some(ctx.spec().image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("{SCRIPTS_DIR}/{script}"),
        ]),
        env: Some(vec![env("PGDATA", pgdata(ctx))]),
        volume_mounts: Some(vec![
            data_mount(ctx),
            config_mount(
                locations,
                ConfigKey::PromoteReplicaToPrimary,
                format!("{SCRIPTS_DIR}/{script}"),
            ),
        ]),
        ..Default::default()
    }
}

fn pg_isready_probe(initial_delay: i32, period: i32, failure_threshold: i32) -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                "exec pg_isready -U postgres -h 127.0.0.1 -p \"$PGPORT\"".to_string(),
            ]),
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(period),
        timeout_seconds: Some(5),
        failure_threshold: Some(failure_threshold),
        ..Default::default()
    }
}

/// Prefer spreading a cluster's instances across nodes
fn generate_anti_affinity(cluster_name: &str) -> Affinity {
    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    weight: 100,
                    pod_affinity_term: PodAffinityTerm {
                        label_selector: Some(LabelSelector {
                            match_labels: Some(BTreeMap::from([(
                                crate::resources::common::CLUSTER_LABEL.to_string(),
                                cluster_name.to_string(),
                            )])),
                            ..Default::default()
                        }),
                        topology_key: "kubernetes.io/hostname".to_string(),
                        ..Default::default()
                    },
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Find a container by name in a StatefulSet's pod template
pub fn find_container<'a>(sts: &'a StatefulSet, name: &str) -> Option<&'a Container> {
    sts.spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == name)
}

/// Find an init container by name in a StatefulSet's pod template
pub fn find_init_container<'a>(sts: &'a StatefulSet, name: &str) -> Option<&'a Container> {
    sts.spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .init_containers
        .as_ref()?
        .iter()
        .find(|c| c.name == name)
}

/// Mutable access to the pod spec of a StatefulSet's template
pub fn pod_spec_mut(sts: &mut StatefulSet) -> Option<&mut PodSpec> {
    sts.spec.as_mut()?.template.spec.as_mut()
}
