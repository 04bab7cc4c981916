//! Base PostgreSQL configuration shared by every cluster in a namespace
//!
//! The config map is created once and never overwritten, so administrators may
//! edit it in place. Clusters override individual keys with a custom config map.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::core::ObjectMeta;

use crate::controller::cluster_context::BASE_CONFIG_MAP_NAME;
use crate::controller::resources_state::ConfigKey;
use crate::resources::common::FIELD_MANAGER;

const POSTGRES_CONF: &str = r#"# Replication
listen_addresses = '*'
wal_level = replica
max_wal_senders = 10
max_replication_slots = 10
wal_keep_size = 512MB
hot_standby = on

# Resources
max_connections = 100
shared_buffers = 128MB

# Logging
log_destination = 'stderr'
log_min_duration_statement = 5000
"#;

const PG_HBA_CONF: &str = r#"# TYPE  DATABASE        USER            ADDRESS                 METHOD
local   all             all                                     trust
host    all             all             127.0.0.1/32            trust
host    all             all             ::1/128                 trust
host    replication     replication     all                     scram-sha-256
host    all             all             all                     scram-sha-256
"#;

const PRIMARY_INIT_SCRIPT: &str = r#"#!/bin/bash
set -e
# Runs once, when the primary initialises an empty data directory.
# Override this key in a custom config map to create databases and users.
"#;

const PRIMARY_CREATE_REPLICATION_ROLE: &str = r#"#!/bin/bash
set -e
psql -v ON_ERROR_STOP=1 --username "${POSTGRES_USER:-postgres}" --dbname "${POSTGRES_DB:-postgres}" <<-EOSQL
CREATE ROLE replication WITH REPLICATION PASSWORD '$POSTGRES_REPLICATION_PASSWORD' LOGIN;
EOSQL
"#;

const COPY_PRIMARY_DATA_TO_REPLICA: &str = r#"#!/bin/bash
set -e

if [ -s "$PGDATA/PG_VERSION" ] && [ ! -f "$PGDATA/standby.signal" ]; then
  # Data left by a former primary diverged from the current one: keep it aside
  backup_dir="$PGDATA.former-primary.$(date +%s)"
  echo "Moving former primary data directory to $backup_dir"
  mv "$PGDATA" "$backup_dir"
fi

if [ -s "$PGDATA/PG_VERSION" ]; then
  echo "Pointing existing replica data directory at $PRIMARY_HOST_NAME"
  sed -i "s/host=[^ ']*/host=$PRIMARY_HOST_NAME/; s/port=[^ ']*/port=$PRIMARY_PORT/" "$PGDATA/postgresql.auto.conf"
  exit 0
fi

echo "Copying data from $PRIMARY_HOST_NAME:$PRIMARY_PORT"
export PGPASSWORD="$POSTGRES_REPLICATION_PASSWORD"
until pg_isready -h "$PRIMARY_HOST_NAME" -p "$PRIMARY_PORT"; do
  echo "Waiting for $PRIMARY_HOST_NAME to accept connections"
  sleep 2
done
pg_basebackup -R -h "$PRIMARY_HOST_NAME" -p "$PRIMARY_PORT" -D "$PGDATA" -U replication -v -P --wal-method=stream
chmod 0700 "$PGDATA"
"#;

const PROMOTE_REPLICA_TO_PRIMARY: &str = r#"#!/bin/bash
set -e
if [ -f "$PGDATA/standby.signal" ]; then
  echo "Promoting instance to primary"
  rm -f "$PGDATA/standby.signal"
fi
"#;

/// Default content for one configuration key
pub fn default_content(key: ConfigKey) -> &'static str {
    match key {
        ConfigKey::PostgresConf => POSTGRES_CONF,
        ConfigKey::PrimaryInitScript => PRIMARY_INIT_SCRIPT,
        ConfigKey::PgHbaConf => PG_HBA_CONF,
        ConfigKey::CopyPrimaryDataToReplica => COPY_PRIMARY_DATA_TO_REPLICA,
        ConfigKey::PrimaryCreateReplicationRole => PRIMARY_CREATE_REPLICATION_ROLE,
        ConfigKey::PromoteReplicaToPrimary => PROMOTE_REPLICA_TO_PRIMARY,
    }
}

/// Generate the base config map for a namespace
///
/// Not owned by any single cluster since every cluster in the namespace mounts it.
pub fn generate_base_config_map(namespace: &str) -> ConfigMap {
    let data = ConfigKey::ALL
        .iter()
        .map(|key| (key.data_key().to_string(), default_content(*key).to_string()))
        .collect();

    ConfigMap {
        metadata: ObjectMeta {
            name: Some(BASE_CONFIG_MAP_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                "app.kubernetes.io/managed-by".to_string(),
                FIELD_MANAGER.to_string(),
            )])),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}
