use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;

use crate::controller::cluster_context::{ClusterContext, POSTGRES_CONTAINER_NAME};
use crate::controller::error::{Error, Result};
use crate::controller::store::ClusterStore;
use crate::enforcer::{SpecDifference, SpecEnforcer, restart_instance_pod};
use crate::resources::instance::{find_container, pod_spec_mut};

/// Keeps the postgres container and every init container on `spec.image`
pub struct ImageEnforcer<'a> {
    ctx: &'a ClusterContext,
}

impl<'a> ImageEnforcer<'a> {
    pub fn new(ctx: &'a ClusterContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl SpecEnforcer for ImageEnforcer<'_> {
    fn spec_name(&self) -> &'static str {
        "Image"
    }

    fn check_for_spec_difference(&self, sts: &StatefulSet) -> Option<SpecDifference> {
        let postgres = find_container(sts, POSTGRES_CONTAINER_NAME)?;
        let expected = self.ctx.spec().image.as_str();

        let current = postgres.image.as_deref().unwrap_or_default();
        if current != expected {
            return Some(SpecDifference::new(self.spec_name(), current, expected));
        }

        sts.spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.init_containers.as_ref())
            .into_iter()
            .flatten()
            .map(|c| c.image.as_deref().unwrap_or_default())
            .find(|image| *image != expected)
            .map(|image| SpecDifference::new(self.spec_name(), image, expected))
    }

    fn enforce_spec(&self, sts: &mut StatefulSet) -> Result<bool> {
        let name = sts.name_any();
        let expected = self.ctx.spec().image.clone();
        let pod_spec = pod_spec_mut(sts).ok_or_else(|| Error::EnforcementError {
            instance: name.clone(),
            spec_name: self.spec_name(),
            message: "StatefulSet has no pod template".to_string(),
        })?;
        if !pod_spec
            .containers
            .iter()
            .any(|c| c.name == POSTGRES_CONTAINER_NAME)
        {
            return Err(Error::EnforcementError {
                instance: name,
                spec_name: self.spec_name(),
                message: format!("no '{POSTGRES_CONTAINER_NAME}' container"),
            });
        }

        let mut changed = false;
        let containers = pod_spec
            .containers
            .iter_mut()
            .filter(|c| c.name == POSTGRES_CONTAINER_NAME)
            .chain(pod_spec.init_containers.iter_mut().flatten());
        for container in containers {
            if container.image.as_deref() != Some(expected.as_str()) {
                container.image = Some(expected.clone());
                changed = true;
            }
        }
        Ok(changed)
    }

    async fn on_spec_enforced_successfully(
        &self,
        sts: &StatefulSet,
        store: &dyn ClusterStore,
    ) -> Result<()> {
        restart_instance_pod(self.ctx, sts, store, "image updated").await
    }
}
