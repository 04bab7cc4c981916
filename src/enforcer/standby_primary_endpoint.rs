use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Container, EnvVar};
use kube::ResourceExt;

use crate::controller::cluster_context::{
    ClusterContext, PRIMARY_HOST_ENV, REPLICA_INIT_CONTAINER_NAME,
};
use crate::controller::error::{Error, Result};
use crate::controller::store::ClusterStore;
use crate::enforcer::{SpecDifference, SpecEnforcer, restart_instance_pod};
use crate::resources::instance::{find_init_container, pod_spec_mut};

/// Points the replica bootstrap at the external primary in standby mode, and
/// at the primary service otherwise.
///
/// Instances without the bootstrap init container (primaries, or objects still
/// being created) have nothing to check.
pub struct StandbyPrimaryEndpointEnforcer<'a> {
    ctx: &'a ClusterContext,
}

impl<'a> StandbyPrimaryEndpointEnforcer<'a> {
    pub fn new(ctx: &'a ClusterContext) -> Self {
        Self { ctx }
    }
}

fn primary_host(init: &Container) -> Option<&str> {
    init.env
        .as_ref()?
        .iter()
        .find(|e| e.name == PRIMARY_HOST_ENV)?
        .value
        .as_deref()
}

#[async_trait]
impl SpecEnforcer for StandbyPrimaryEndpointEnforcer<'_> {
    fn spec_name(&self) -> &'static str {
        "StandbyPrimaryEndpoint"
    }

    fn check_for_spec_difference(&self, sts: &StatefulSet) -> Option<SpecDifference> {
        let init = find_init_container(sts, REPLICA_INIT_CONTAINER_NAME)?;
        let current = primary_host(init).unwrap_or_default();
        let expected = self.ctx.replication_source();
        (current != expected).then(|| SpecDifference::new(self.spec_name(), current, expected))
    }

    fn enforce_spec(&self, sts: &mut StatefulSet) -> Result<bool> {
        let name = sts.name_any();
        let expected = self.ctx.replication_source();
        let init = pod_spec_mut(sts)
            .and_then(|p| p.init_containers.as_mut())
            .and_then(|c| c.iter_mut().find(|c| c.name == REPLICA_INIT_CONTAINER_NAME))
            .ok_or_else(|| Error::EnforcementError {
                instance: name,
                spec_name: self.spec_name(),
                message: format!("no '{REPLICA_INIT_CONTAINER_NAME}' init container"),
            })?;

        let env = init.env.get_or_insert_with(Vec::new);
        match env.iter_mut().find(|e| e.name == PRIMARY_HOST_ENV) {
            Some(var) if var.value.as_deref() == Some(expected.as_str()) => Ok(false),
            Some(var) => {
                var.value = Some(expected);
                var.value_from = None;
                Ok(true)
            }
            None => {
                env.insert(
                    0,
                    EnvVar {
                        name: PRIMARY_HOST_ENV.to_string(),
                        value: Some(expected),
                        ..Default::default()
                    },
                );
                Ok(true)
            }
        }
    }

    async fn on_spec_enforced_successfully(
        &self,
        sts: &StatefulSet,
        store: &dyn ClusterStore,
    ) -> Result<()> {
        restart_instance_pod(self.ctx, sts, store, "replication source updated").await
    }
}
