use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Container, EnvVar};
use kube::ResourceExt;

use crate::controller::cluster_context::{
    ClusterContext, POSTGRES_CONTAINER_NAME, REPLICA_INIT_CONTAINER_NAME,
};
use crate::controller::error::{Error, Result};
use crate::controller::store::ClusterStore;
use crate::enforcer::{SpecDifference, SpecEnforcer, restart_instance_pod};
use crate::resources::instance::{find_container, find_init_container, pod_spec_mut};

/// Keeps the port PostgreSQL listens on, and the port replicas stream from,
/// equal to `spec.port`
pub struct PortEnforcer<'a> {
    ctx: &'a ClusterContext,
}

impl<'a> PortEnforcer<'a> {
    pub fn new(ctx: &'a ClusterContext) -> Self {
        Self { ctx }
    }
}

fn env_value<'c>(container: &'c Container, name: &str) -> Option<&'c str> {
    container
        .env
        .as_ref()?
        .iter()
        .find(|e| e.name == name)?
        .value
        .as_deref()
}

/// Set an env var's literal value, appending it when missing
fn set_env(container: &mut Container, name: &str, value: &str) -> bool {
    let env = container.env.get_or_insert_with(Vec::new);
    match env.iter_mut().find(|e| e.name == name) {
        Some(var) if var.value.as_deref() == Some(value) && var.value_from.is_none() => false,
        Some(var) => {
            var.value = Some(value.to_string());
            var.value_from = None;
            true
        }
        None => {
            env.push(EnvVar {
                name: name.to_string(),
                value: Some(value.to_string()),
                ..Default::default()
            });
            true
        }
    }
}

fn describe(container_port: Option<i32>, pgport: Option<&str>, primary_port: Option<Option<&str>>) -> String {
    let mut out = format!(
        "containerPort={}, PGPORT={}",
        container_port.map(|p| p.to_string()).unwrap_or_default(),
        pgport.unwrap_or_default()
    );
    if let Some(primary_port) = primary_port {
        out.push_str(&format!(", PRIMARY_PORT={}", primary_port.unwrap_or_default()));
    }
    out
}

#[async_trait]
impl SpecEnforcer for PortEnforcer<'_> {
    fn spec_name(&self) -> &'static str {
        "Port"
    }

    fn check_for_spec_difference(&self, sts: &StatefulSet) -> Option<SpecDifference> {
        let postgres = find_container(sts, POSTGRES_CONTAINER_NAME)?;
        let port = self.ctx.spec().port;
        let port_str = port.to_string();
        let init = find_init_container(sts, REPLICA_INIT_CONTAINER_NAME);

        let container_port = postgres
            .ports
            .as_ref()
            .and_then(|ports| ports.first())
            .map(|p| p.container_port);
        let current = describe(
            container_port,
            env_value(postgres, "PGPORT"),
            init.map(|c| env_value(c, "PRIMARY_PORT")),
        );
        let expected = describe(
            Some(port),
            Some(&port_str),
            init.map(|_| Some(port_str.as_str())),
        );
        (current != expected).then(|| SpecDifference::new(self.spec_name(), current, expected))
    }

    fn enforce_spec(&self, sts: &mut StatefulSet) -> Result<bool> {
        let name = sts.name_any();
        let port = self.ctx.spec().port;
        let port_str = port.to_string();
        let spec_name = self.spec_name();
        let missing = |message: &str| Error::EnforcementError {
            instance: name.clone(),
            spec_name,
            message: message.to_string(),
        };

        let pod_spec = pod_spec_mut(sts).ok_or_else(|| missing("StatefulSet has no pod template"))?;
        let postgres = pod_spec
            .containers
            .iter_mut()
            .find(|c| c.name == POSTGRES_CONTAINER_NAME)
            .ok_or_else(|| missing("no postgres container"))?;

        let mut changed = false;
        let ports = postgres.ports.get_or_insert_with(Vec::new);
        match ports.first_mut() {
            Some(p) if p.container_port == port => {}
            Some(p) => {
                p.container_port = port;
                changed = true;
            }
            None => {
                ports.push(k8s_openapi::api::core::v1::ContainerPort {
                    container_port: port,
                    name: Some("postgresql".to_string()),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                });
                changed = true;
            }
        }
        changed |= set_env(postgres, "PGPORT", &port_str);

        if let Some(init) = pod_spec
            .init_containers
            .iter_mut()
            .flatten()
            .find(|c| c.name == REPLICA_INIT_CONTAINER_NAME)
        {
            changed |= set_env(init, "PRIMARY_PORT", &port_str);
        }
        Ok(changed)
    }

    async fn on_spec_enforced_successfully(
        &self,
        sts: &StatefulSet,
        store: &dyn ClusterStore,
    ) -> Result<()> {
        restart_instance_pod(self.ctx, sts, store, "port updated").await
    }
}
