use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Container, PodSpec, Volume};
use kube::ResourceExt;

use crate::controller::cluster_context::{
    CUSTOM_CONFIG_VOLUME_NAME, ClusterContext, POSTGRES_CONTAINER_NAME,
};
use crate::controller::error::{Error, Result};
use crate::controller::resources_state::{ConfigLocations, ResourcesState};
use crate::controller::store::ClusterStore;
use crate::enforcer::{SpecDifference, SpecEnforcer, restart_instance_pod};
use crate::resources::instance::{custom_config_volume, pod_spec_mut};

/// Wires the configuration files to the config map they currently come from.
///
/// A mount whose `subPath` is a known config key must use the volume the key
/// resolves to. The `custom-config` volume exists exactly when a custom config
/// map is deployed, and always points at it; a changed target is replaced with
/// a new volume, never renamed in place.
pub struct CustomConfigEnforcer<'a> {
    ctx: &'a ClusterContext,
    state: &'a ResourcesState,
}

impl<'a> CustomConfigEnforcer<'a> {
    pub fn new(ctx: &'a ClusterContext, state: &'a ResourcesState) -> Self {
        Self { ctx, state }
    }

    /// Config map the custom volume must reference, if it must exist
    fn expected_custom_config(&self) -> Option<&str> {
        if self.state.custom_config_deployed {
            self.ctx.custom_config_name()
        } else {
            None
        }
    }
}

/// Containers whose mounts are checked: postgres and every init container
fn config_containers(pod: &PodSpec) -> impl Iterator<Item = &Container> {
    pod.containers
        .iter()
        .filter(|c| c.name == POSTGRES_CONTAINER_NAME)
        .chain(pod.init_containers.iter().flatten())
}

/// Mounts whose volume differs from where their key is located:
/// (subPath, current volume, expected volume)
fn mount_mismatches(pod: &PodSpec, locations: &ConfigLocations) -> Vec<(String, String, String)> {
    let mut out = Vec::new();
    for container in config_containers(pod) {
        for mount in container.volume_mounts.iter().flatten() {
            let Some(sub_path) = mount.sub_path.as_deref() else {
                continue;
            };
            for (key, volume) in locations.iter() {
                if key.data_key() == sub_path && mount.name != volume {
                    out.push((sub_path.to_string(), mount.name.clone(), volume.to_string()));
                }
            }
        }
    }
    out
}

fn custom_volume(pod: &PodSpec) -> Option<&Volume> {
    pod.volumes
        .iter()
        .flatten()
        .find(|v| v.name == CUSTOM_CONFIG_VOLUME_NAME)
}

fn custom_volume_target(volume: &Volume) -> Option<&str> {
    volume.config_map.as_ref().map(|cm| cm.name.as_str())
}

#[async_trait]
impl SpecEnforcer for CustomConfigEnforcer<'_> {
    fn spec_name(&self) -> &'static str {
        "CustomConfig"
    }

    fn check_for_spec_difference(&self, sts: &StatefulSet) -> Option<SpecDifference> {
        let pod = sts.spec.as_ref()?.template.spec.as_ref()?;
        let mut current = Vec::new();
        let mut expected = Vec::new();

        for (sub_path, have, want) in mount_mismatches(pod, &self.state.config_locations) {
            current.push(format!("{sub_path} mounted from {have}"));
            expected.push(format!("{sub_path} mounted from {want}"));
        }

        let have = custom_volume(pod).map(|v| custom_volume_target(v).unwrap_or_default());
        let want = self.expected_custom_config();
        if have != want {
            let show = |v: Option<&str>| match v {
                Some(name) => format!("{CUSTOM_CONFIG_VOLUME_NAME} volume -> {name}"),
                None => format!("no {CUSTOM_CONFIG_VOLUME_NAME} volume"),
            };
            current.push(show(have));
            expected.push(show(want));
        }

        (!current.is_empty()).then(|| {
            SpecDifference::new(self.spec_name(), current.join("; "), expected.join("; "))
        })
    }

    fn enforce_spec(&self, sts: &mut StatefulSet) -> Result<bool> {
        let name = sts.name_any();
        let want = self.expected_custom_config().map(str::to_string);
        let pod = pod_spec_mut(sts).ok_or_else(|| Error::EnforcementError {
            instance: name,
            spec_name: self.spec_name(),
            message: "StatefulSet has no pod template".to_string(),
        })?;
        let mut changed = false;

        let locations = &self.state.config_locations;
        let containers = pod
            .containers
            .iter_mut()
            .filter(|c| c.name == POSTGRES_CONTAINER_NAME)
            .chain(pod.init_containers.iter_mut().flatten());
        for container in containers {
            for mount in container.volume_mounts.iter_mut().flatten() {
                let Some(sub_path) = mount.sub_path.as_deref() else {
                    continue;
                };
                let target = locations
                    .iter()
                    .find(|(key, _)| key.data_key() == sub_path)
                    .map(|(_, volume)| volume);
                if let Some(volume) = target
                    && mount.name != volume
                {
                    mount.name = volume.to_string();
                    changed = true;
                }
            }
        }

        let have = custom_volume(pod).and_then(custom_volume_target).map(str::to_string);
        let present = custom_volume(pod).is_some();
        match want {
            Some(target) if have.as_deref() != Some(target.as_str()) => {
                if present {
                    remove_custom_volume(pod);
                }
                pod.volumes
                    .get_or_insert_with(Vec::new)
                    .push(custom_config_volume(&target));
                changed = true;
            }
            Some(_) => {}
            None if present => {
                remove_custom_volume(pod);
                changed = true;
            }
            None => {}
        }
        Ok(changed)
    }

    async fn on_spec_enforced_successfully(
        &self,
        sts: &StatefulSet,
        store: &dyn ClusterStore,
    ) -> Result<()> {
        restart_instance_pod(self.ctx, sts, store, "configuration wiring updated").await
    }
}

fn remove_custom_volume(pod: &mut PodSpec) {
    if let Some(volumes) = pod.volumes.as_mut() {
        volumes.retain(|v| v.name != CUSTOM_CONFIG_VOLUME_NAME);
    }
}
