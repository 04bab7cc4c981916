use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;

use crate::controller::cluster_context::{ClusterContext, POSTGRES_CONTAINER_NAME};
use crate::controller::error::{Error, Result};
use crate::controller::store::ClusterStore;
use crate::enforcer::{SpecDifference, SpecEnforcer, restart_instance_pod};
use crate::resources::instance::{container_resources, find_container, pod_spec_mut};

/// Keeps the postgres container's requests and limits equal to `spec.resources`
pub struct ResourcesEnforcer<'a> {
    ctx: &'a ClusterContext,
}

impl<'a> ResourcesEnforcer<'a> {
    pub fn new(ctx: &'a ClusterContext) -> Self {
        Self { ctx }
    }

    fn expected(&self) -> Option<ResourceRequirements> {
        container_resources(self.ctx.spec().resources.as_ref())
    }
}

type Normalized = (BTreeMap<String, Quantity>, BTreeMap<String, Quantity>);

/// Unset and empty requirements are equivalent once stored
fn normalize(resources: Option<&ResourceRequirements>) -> Normalized {
    let limits = resources.and_then(|r| r.limits.clone()).unwrap_or_default();
    let requests = resources.and_then(|r| r.requests.clone()).unwrap_or_default();
    (limits, requests)
}

fn describe((limits, requests): &Normalized) -> String {
    let join = |m: &BTreeMap<String, Quantity>| {
        m.iter()
            .map(|(k, v)| format!("{k}={}", v.0))
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!("limits: [{}], requests: [{}]", join(limits), join(requests))
}

#[async_trait]
impl SpecEnforcer for ResourcesEnforcer<'_> {
    fn spec_name(&self) -> &'static str {
        "Resources"
    }

    fn check_for_spec_difference(&self, sts: &StatefulSet) -> Option<SpecDifference> {
        let postgres = find_container(sts, POSTGRES_CONTAINER_NAME)?;
        let current = normalize(postgres.resources.as_ref());
        let expected = normalize(self.expected().as_ref());
        (current != expected).then(|| {
            SpecDifference::new(self.spec_name(), describe(&current), describe(&expected))
        })
    }

    fn enforce_spec(&self, sts: &mut StatefulSet) -> Result<bool> {
        let name = sts.name_any();
        let expected = self.expected();
        let postgres = pod_spec_mut(sts)
            .and_then(|p| {
                p.containers
                    .iter_mut()
                    .find(|c| c.name == POSTGRES_CONTAINER_NAME)
            })
            .ok_or_else(|| Error::EnforcementError {
                instance: name,
                spec_name: self.spec_name(),
                message: "no postgres container".to_string(),
            })?;

        if normalize(postgres.resources.as_ref()) == normalize(expected.as_ref()) {
            return Ok(false);
        }
        postgres.resources = expected;
        Ok(true)
    }

    async fn on_spec_enforced_successfully(
        &self,
        sts: &StatefulSet,
        store: &dyn ClusterStore,
    ) -> Result<()> {
        restart_instance_pod(self.ctx, sts, store, "resources updated").await
    }
}
