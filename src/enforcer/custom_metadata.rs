use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;

use crate::controller::cluster_context::{ClusterContext, CustomMetadata};
use crate::controller::error::Result;
use crate::enforcer::{SpecDifference, SpecEnforcer};
use crate::resources::common::is_custom_metadata_key;

/// Propagates the cluster's reserved-prefix labels and annotations to the
/// StatefulSet and its pod template. Keys outside the prefix are never touched.
pub struct CustomMetadataEnforcer<'a> {
    ctx: &'a ClusterContext,
}

impl<'a> CustomMetadataEnforcer<'a> {
    pub fn new(ctx: &'a ClusterContext) -> Self {
        Self { ctx }
    }
}

fn template_metadata(sts: &StatefulSet) -> CustomMetadata {
    let meta = sts.spec.as_ref().and_then(|s| s.template.metadata.as_ref());
    CustomMetadata::from_maps(
        meta.and_then(|m| m.labels.as_ref()),
        meta.and_then(|m| m.annotations.as_ref()),
    )
}

/// Make the custom subset of `map` equal `expected`; returns whether it changed
fn sync_custom_keys(
    map: &mut Option<BTreeMap<String, String>>,
    expected: &BTreeMap<String, String>,
) -> bool {
    if map.is_none() && expected.is_empty() {
        return false;
    }
    let map = map.get_or_insert_with(BTreeMap::new);
    let before = map.len();
    map.retain(|k, _| !is_custom_metadata_key(k) || expected.contains_key(k));
    let mut changed = map.len() != before;
    for (k, v) in expected {
        if map.get(k) != Some(v) {
            map.insert(k.clone(), v.clone());
            changed = true;
        }
    }
    changed
}

#[async_trait]
impl SpecEnforcer for CustomMetadataEnforcer<'_> {
    fn spec_name(&self) -> &'static str {
        "CustomMetadata"
    }

    fn check_for_spec_difference(&self, sts: &StatefulSet) -> Option<SpecDifference> {
        let expected = self.ctx.custom_metadata();
        let on_object =
            CustomMetadata::from_maps(sts.metadata.labels.as_ref(), sts.metadata.annotations.as_ref());
        let current = if on_object != expected {
            on_object
        } else {
            template_metadata(sts)
        };
        (current != expected).then(|| {
            SpecDifference::new(self.spec_name(), current.to_string(), expected.to_string())
        })
    }

    fn enforce_spec(&self, sts: &mut StatefulSet) -> Result<bool> {
        let expected = self.ctx.custom_metadata();
        let mut changed = sync_custom_keys(&mut sts.metadata.labels, &expected.labels);
        changed |= sync_custom_keys(&mut sts.metadata.annotations, &expected.annotations);

        if let Some(spec) = sts.spec.as_mut() {
            let meta = spec.template.metadata.get_or_insert_with(Default::default);
            changed |= sync_custom_keys(&mut meta.labels, &expected.labels);
            changed |= sync_custom_keys(&mut meta.annotations, &expected.annotations);
        }
        Ok(changed)
    }
}
