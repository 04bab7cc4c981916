//! Validation of the PostgresCluster spec
//!
//! A cluster failing validation is reported and left untouched: no instance is
//! created, deleted or rewritten until the spec is edited.

use crate::controller::error::{Error, Result};
use crate::crd::{EnvVarSpec, PostgresCluster};

/// Minimum number of instances
pub const MIN_REPLICAS: i32 = 1;

/// Maximum number of instances (arbitrary limit for safety)
pub const MAX_REPLICAS: i32 = 100;

/// Env vars the postgres image needs to bootstrap a primary and its replicas
pub const REQUIRED_ENV: [&str; 2] = ["POSTGRES_PASSWORD", "POSTGRES_REPLICATION_PASSWORD"];

/// Validate the cluster spec
pub fn validate_spec(cluster: &PostgresCluster) -> Result<()> {
    validate_image(cluster)?;
    validate_replicas(cluster)?;
    validate_port(cluster)?;
    validate_storage(cluster)?;
    validate_env(cluster)?;
    validate_standby(cluster)?;
    validate_backup(cluster)?;
    validate_failover(cluster)?;
    Ok(())
}

fn validate_image(cluster: &PostgresCluster) -> Result<()> {
    if cluster.spec.image.trim().is_empty() {
        return Err(Error::ValidationError(
            "image must be set, e.g. 'postgres:16.4'".to_string(),
        ));
    }
    Ok(())
}

/// Validate replica count
fn validate_replicas(cluster: &PostgresCluster) -> Result<()> {
    let replicas = cluster.spec.replicas;

    if replicas < MIN_REPLICAS {
        return Err(Error::ValidationError(format!(
            "replica count {} is below minimum {}",
            replicas, MIN_REPLICAS
        )));
    }

    if replicas > MAX_REPLICAS {
        return Err(Error::ValidationError(format!(
            "replica count {} exceeds maximum {}",
            replicas, MAX_REPLICAS
        )));
    }

    Ok(())
}

fn validate_port(cluster: &PostgresCluster) -> Result<()> {
    let port = cluster.spec.port;
    if !(1..=65535).contains(&port) {
        return Err(Error::ValidationError(format!(
            "port {port} is outside 1-65535"
        )));
    }
    Ok(())
}

/// Validate the data volume size
fn validate_storage(cluster: &PostgresCluster) -> Result<()> {
    let size = &cluster.spec.database.size;

    // e.g. "10Gi", "500Mi"
    if !size.ends_with("Gi") && !size.ends_with("Mi") && !size.ends_with("Ti") {
        return Err(Error::ValidationError(format!(
            "database.size must end with Gi, Mi, or Ti: '{}'",
            size
        )));
    }

    let num_str = size.trim_end_matches(char::is_alphabetic);
    let num: u64 = num_str.parse().map_err(|_| {
        Error::ValidationError(format!("invalid database.size number: '{}'", size))
    })?;
    if num == 0 {
        return Err(Error::ValidationError(
            "database.size must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn has_value(var: &EnvVarSpec) -> bool {
    var.value.as_deref().is_some_and(|v| !v.is_empty())
        || var
            .value_from
            .as_ref()
            .and_then(|f| f.secret_key_ref.as_ref())
            .is_some()
}

fn validate_env(cluster: &PostgresCluster) -> Result<()> {
    for required in REQUIRED_ENV {
        match cluster.spec.env.iter().find(|e| e.name == required) {
            Some(var) if has_value(var) => {}
            Some(_) => {
                return Err(Error::ValidationError(format!(
                    "env var {required} has neither a value nor a secretKeyRef"
                )));
            }
            None => {
                return Err(Error::ValidationError(format!(
                    "env var {required} is required"
                )));
            }
        }
    }
    Ok(())
}

fn validate_standby(cluster: &PostgresCluster) -> Result<()> {
    let standby = &cluster.spec.standby;
    if standby.enabled
        && standby
            .primary_endpoint
            .as_deref()
            .is_none_or(|e| e.trim().is_empty())
    {
        return Err(Error::ValidationError(
            "standby.primaryEndpoint is required when standby is enabled".to_string(),
        ));
    }
    Ok(())
}

fn validate_backup(cluster: &PostgresCluster) -> Result<()> {
    let Some(backup) = &cluster.spec.backup else {
        return Ok(());
    };
    for (field, value) in [
        ("backup.schedule", &backup.schedule),
        ("backup.pvcName", &backup.pvc_name),
        ("backup.volumeMount", &backup.volume_mount),
    ] {
        if value.trim().is_empty() {
            return Err(Error::ValidationError(format!(
                "{field} is required when backup is enabled"
            )));
        }
    }
    if !backup.volume_mount.starts_with('/') {
        return Err(Error::ValidationError(format!(
            "backup.volumeMount must be an absolute path: '{}'",
            backup.volume_mount
        )));
    }
    Ok(())
}

fn validate_failover(cluster: &PostgresCluster) -> Result<()> {
    let failover = &cluster.spec.failover;
    if failover.grace_period_seconds < 0 {
        return Err(Error::ValidationError(format!(
            "failover.gracePeriodSeconds {} must not be negative",
            failover.grace_period_seconds
        )));
    }

    let Some(target) = failover.promote_instance.as_deref() else {
        return Ok(());
    };
    if cluster.spec.standby.enabled {
        return Err(Error::ValidationError(
            "failover.promoteInstance cannot be used while standby is enabled".to_string(),
        ));
    }
    let name = cluster.metadata.name.as_deref().unwrap_or_default();
    let index = target
        .strip_prefix(name)
        .and_then(|rest| rest.strip_prefix('-'))
        .and_then(|index| index.parse::<u32>().ok());
    if index.is_none_or(|i| i == 0) {
        return Err(Error::ValidationError(format!(
            "failover.promoteInstance '{target}' is not an instance of cluster '{name}'"
        )));
    }
    Ok(())
}
