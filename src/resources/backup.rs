//! Scheduled logical backups
//!
//! When a cluster declares `backup`, a CronJob named `backup-<cluster>` runs
//! `pg_dumpall` against the cluster on the configured schedule and writes a
//! gzipped dump into an existing PersistentVolumeClaim.
//!
//! Dumps are taken from the replica service when replicas exist so the primary
//! is not loaded; a standby cluster has no local primary, so it always dumps
//! from its replicas.

use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Volume,
    VolumeMount,
};
use kube::core::ObjectMeta;

use crate::controller::cluster_context::ClusterContext;
use crate::crd::BackupSpec;
use crate::resources::common::{owner_reference, standard_labels};
use crate::resources::instance::user_env_vars;

const BACKUP_VOLUME_NAME: &str = "backup-volume";

const BACKUP_SCRIPT: &str = r#"set -e
file="$BACKUP_DESTINATION_FOLDER/$CLUSTER_NAME-backup-$(date +%Y-%m-%d_%H-%M-%S).gz"
echo "Backing up $BACKUP_SOURCE_DB_HOST_NAME into $file"
pg_dumpall -h "$BACKUP_SOURCE_DB_HOST_NAME" -p "$PGPORT" -U postgres | gzip > "$file"
echo "Backup completed"
"#;

/// Host the backup job dumps from
pub fn backup_source_host(ctx: &ClusterContext, has_replicas: bool) -> String {
    if ctx.is_standby() || has_replicas {
        ctx.replica_service_name()
    } else {
        ctx.primary_service_name()
    }
}

/// Generate the backup CronJob, or `None` when backups are not configured
pub fn generate_backup_cron_job(ctx: &ClusterContext, has_replicas: bool) -> Option<CronJob> {
    let backup: &BackupSpec = ctx.spec().backup.as_ref()?;
    let spec = ctx.spec();

    let mut env_vars = vec![
        EnvVar {
            name: "CLUSTER_NAME".to_string(),
            value: Some(ctx.name().to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "BACKUP_SOURCE_DB_HOST_NAME".to_string(),
            value: Some(backup_source_host(ctx, has_replicas)),
            ..Default::default()
        },
        EnvVar {
            name: "BACKUP_DESTINATION_FOLDER".to_string(),
            value: Some(backup.volume_mount.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "PGPORT".to_string(),
            value: Some(spec.port.to_string()),
            ..Default::default()
        },
    ];
    let user_env = user_env_vars(&spec.env);
    // pg_dumpall authenticates as the superuser
    if let Some(password) = user_env.iter().find(|e| e.name == "POSTGRES_PASSWORD") {
        env_vars.push(EnvVar {
            name: "PGPASSWORD".to_string(),
            ..password.clone()
        });
    }
    env_vars.extend(user_env);

    let container = Container {
        name: format!("backup-{}", ctx.name()),
        image: Some(spec.image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            BACKUP_SCRIPT.to_string(),
        ]),
        env: Some(env_vars),
        volume_mounts: Some(vec![VolumeMount {
            name: BACKUP_VOLUME_NAME.to_string(),
            mount_path: backup.volume_mount.clone(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Some(CronJob {
        metadata: ObjectMeta {
            name: Some(ctx.backup_cron_job_name()),
            namespace: Some(ctx.namespace().to_string()),
            labels: Some(standard_labels(ctx.name())),
            owner_references: Some(vec![owner_reference(ctx.cluster())]),
            ..Default::default()
        },
        spec: Some(CronJobSpec {
            schedule: backup.schedule.clone(),
            concurrency_policy: Some("Forbid".to_string()),
            successful_jobs_history_limit: Some(3),
            failed_jobs_history_limit: Some(3),
            job_template: JobTemplateSpec {
                metadata: None,
                spec: Some(JobSpec {
                    backoff_limit: Some(0),
                    template: PodTemplateSpec {
                        metadata: Some(ObjectMeta {
                            labels: Some(standard_labels(ctx.name())),
                            ..Default::default()
                        }),
                        spec: Some(PodSpec {
                            restart_policy: Some("Never".to_string()),
                            containers: vec![container],
                            volumes: Some(vec![Volume {
                                name: BACKUP_VOLUME_NAME.to_string(),
                                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                                    claim_name: backup.pvc_name.clone(),
                                    read_only: Some(false),
                                }),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }),
                    },
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}
