// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Property-based tests for spec enforcement and failover selection
//!
//! These exercise invariants that must hold for any cluster definition,
//! not just the hand-picked fixtures in the unit suite.

#[path = "../common/mod.rs"]
mod common;

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::core::ObjectMeta;
use proptest::prelude::*;

use postgres_ha_operator::controller::cluster_context::CUSTOM_CONFIG_VOLUME_NAME;
use postgres_ha_operator::controller::topology::{instance_index, select_failover_target};
use postgres_ha_operator::controller::{ClusterContext, ResourcesState};
use postgres_ha_operator::enforcer::{
    CustomConfigEnforcer, CustomMetadataEnforcer, SpecEnforcer, StatefulSetEnforcer,
};
use postgres_ha_operator::resources::InstanceRole;

use common::*;

// =============================================================================
// Strategy generators
// =============================================================================

fn image() -> impl Strategy<Value = String> {
    (12..=17u32, 0..=20u32).prop_map(|(major, minor)| format!("postgres:{major}.{minor}"))
}

fn port() -> impl Strategy<Value = i32> {
    prop_oneof![Just(5432), 1024..=65535i32]
}

fn cpu() -> impl Strategy<Value = String> {
    prop_oneof![
        (1..=8u32).prop_map(|n| n.to_string()),
        (100..=999u32).prop_map(|n| format!("{n}m")),
    ]
}

fn memory() -> impl Strategy<Value = String> {
    prop_oneof![
        (128..=1023u32).prop_map(|n| format!("{n}Mi")),
        (1..=64u32).prop_map(|n| format!("{n}Gi")),
    ]
}

/// Optional resources, as (cpu, memory)
fn resources() -> impl Strategy<Value = Option<(String, String)>> {
    proptest::option::of((cpu(), memory()))
}

/// Labels or annotations outside the operator's key prefix
fn foreign_metadata() -> impl Strategy<Value = BTreeMap<String, String>> {
    proptest::collection::btree_map("x-[a-z]{1,8}/[a-z]{1,8}", "[a-z0-9]{0,10}", 0..5)
}

/// Custom keys under the operator's prefix
fn reserved_metadata() -> impl Strategy<Value = BTreeMap<String, String>> {
    proptest::collection::btree_map(
        "[a-z]{1,8}".prop_map(|k| format!("{RESERVED}custom-{k}")),
        "[a-z0-9]{1,10}",
        0..4,
    )
}

/// Instance indices 2..=20 with their readiness; index 1 is the lost primary
fn replica_set() -> impl Strategy<Value = BTreeMap<u32, bool>> {
    proptest::collection::btree_map(2..=20u32, any::<bool>(), 0..8)
}

fn cluster_with(
    image: &str,
    port: i32,
    resources: &Option<(String, String)>,
    custom_config: Option<&str>,
) -> postgres_ha_operator::PostgresCluster {
    let mut builder = PostgresClusterBuilder::new("db", "default")
        .with_image(image)
        .with_port(port);
    if let Some((cpu, memory)) = resources {
        builder = builder.with_resources(cpu, memory);
    }
    if let Some(config_map) = custom_config {
        builder = builder.with_custom_config(config_map);
    }
    builder.build()
}

fn custom_map(name: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "postgres.conf".to_string(),
            "# custom".to_string(),
        )])),
        ..Default::default()
    }
}

/// Config map names referenced by `custom-config` volumes
fn custom_volume_targets(sts: &StatefulSet) -> Vec<String> {
    sts.spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.volumes.as_ref())
        .into_iter()
        .flatten()
        .filter(|v| v.name == CUSTOM_CONFIG_VOLUME_NAME)
        .filter_map(|v| v.config_map.as_ref().map(|c| c.name.clone()))
        .collect()
}

// =============================================================================
// Enforcement properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: one pass of every enforcer leaves nothing to correct
    #[test]
    fn prop_enforcement_converges_in_one_pass(
        from_image in image(),
        to_image in image(),
        from_port in port(),
        to_port in port(),
        from_resources in resources(),
        to_resources in resources(),
        replica in any::<bool>(),
    ) {
        let before = cluster_with(&from_image, from_port, &from_resources, None);
        let after = cluster_with(&to_image, to_port, &to_resources, None);
        let role = if replica { InstanceRole::Replica } else { InstanceRole::Primary };
        let mut sts = deployed_instance(&before, 2, role, true);

        let ctx = ClusterContext::new(&after).unwrap();
        let state = ResourcesState::default();
        let enforcers = StatefulSetEnforcer::ordered(&ctx, &state);
        let mut enforced = Vec::new();
        for enforcer in &enforcers {
            if enforcer.check_for_spec_difference(&sts).is_some() {
                prop_assert!(enforcer.enforce_spec(&mut sts).unwrap());
                enforced.push(enforcer);
            }
        }
        for enforcer in &enforcers {
            prop_assert_eq!(enforcer.check_for_spec_difference(&sts), None);
        }
        // Enforcing again is a no-op for every concern that was corrected
        for enforcer in enforced {
            prop_assert!(!enforcer.enforce_spec(&mut sts).unwrap());
        }
    }

    /// Property: an instance generated from the current definition has no drift
    #[test]
    fn prop_fresh_instance_has_no_drift(
        image in image(),
        port in port(),
        resources in resources(),
        index in 1..=9u32,
    ) {
        let cluster = cluster_with(&image, port, &resources, None);
        let role = if index == 1 { InstanceRole::Primary } else { InstanceRole::Replica };
        let sts = deployed_instance(&cluster, index, role, true);

        let ctx = ClusterContext::new(&cluster).unwrap();
        let state = ResourcesState::default();
        for enforcer in StatefulSetEnforcer::ordered(&ctx, &state) {
            prop_assert_eq!(enforcer.check_for_spec_difference(&sts), None);
        }
    }

    /// Property: custom metadata never touches keys outside the operator's prefix
    #[test]
    fn prop_custom_metadata_keeps_foreign_keys(
        foreign_labels in foreign_metadata(),
        foreign_annotations in foreign_metadata(),
        old_custom in reserved_metadata(),
        new_custom in reserved_metadata(),
    ) {
        let mut before = PostgresClusterBuilder::new("db", "default");
        for (k, v) in &old_custom {
            before = before.with_label(k, v);
        }
        let mut after = PostgresClusterBuilder::new("db", "default");
        for (k, v) in &new_custom {
            after = after.with_label(k, v).with_annotation(k, v);
        }
        let after = after.build();

        let mut sts = deployed_instance(&before.build(), 1, InstanceRole::Primary, true);
        sts.metadata.labels.get_or_insert_with(BTreeMap::new).extend(foreign_labels.clone());
        sts.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(foreign_annotations.clone());

        let ctx = ClusterContext::new(&after).unwrap();
        let enforcer = CustomMetadataEnforcer::new(&ctx);
        enforcer.enforce_spec(&mut sts).unwrap();
        prop_assert_eq!(enforcer.check_for_spec_difference(&sts), None);

        let labels = sts.metadata.labels.clone().unwrap_or_default();
        let annotations = sts.metadata.annotations.clone().unwrap_or_default();
        for (k, v) in &foreign_labels {
            prop_assert_eq!(labels.get(k), Some(v));
        }
        for (k, v) in &foreign_annotations {
            prop_assert_eq!(annotations.get(k), Some(v));
        }
        for (k, v) in &new_custom {
            prop_assert_eq!(labels.get(k), Some(v));
            prop_assert_eq!(annotations.get(k), Some(v));
        }
        for k in old_custom.keys().filter(|k| !new_custom.contains_key(*k)) {
            prop_assert!(!labels.contains_key(k));
        }
        prop_assert_eq!(labels.get(&format!("{RESERVED}role")).map(String::as_str), Some("primary"));
    }

    /// Property: exactly one custom config volume, naming the current config
    /// map, through any sequence of set, switched and cleared config maps
    #[test]
    fn prop_custom_config_volume_follows_cluster(
        steps in proptest::collection::vec(proptest::option::of("cfg-[a-z]{1,4}"), 1..6),
    ) {
        let plain = create_test_cluster("db", "default", 1);
        let mut sts = deployed_instance(&plain, 1, InstanceRole::Primary, true);

        for step in &steps {
            let cluster = PostgresClusterBuilder::new("db", "default");
            let cluster = match step {
                Some(name) => cluster.with_custom_config(name),
                None => cluster,
            }
            .build();
            let ctx = ClusterContext::new(&cluster).unwrap();
            let state = ResourcesState::from_parts(
                None,
                step.as_deref().map(custom_map),
                vec![],
            );
            let enforcer = CustomConfigEnforcer::new(&ctx, &state);
            if enforcer.check_for_spec_difference(&sts).is_some() {
                prop_assert!(enforcer.enforce_spec(&mut sts).unwrap());
            }

            prop_assert_eq!(enforcer.check_for_spec_difference(&sts), None);
            let expected: Vec<String> = step.iter().cloned().collect();
            prop_assert_eq!(custom_volume_targets(&sts), expected);
        }
    }
}

// =============================================================================
// Failover properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: the failover target is the ready replica with the lowest index
    #[test]
    fn prop_failover_picks_lowest_ready_index(replicas in replica_set()) {
        let cluster = PostgresClusterBuilder::ha("db", "default").build();
        let instances = replicas
            .iter()
            .map(|(&index, &ready)| deployed_instance(&cluster, index, InstanceRole::Replica, ready))
            .collect();
        let state = state_with(instances);

        let expected = replicas
            .iter()
            .filter(|(_, ready)| **ready)
            .map(|(index, _)| *index)
            .min();
        let chosen = select_failover_target(&state).map(|i| i.index);
        prop_assert_eq!(chosen, expected);
        if let Some(target) = select_failover_target(&state) {
            prop_assert!(target.ready);
            prop_assert_eq!(target.role, InstanceRole::Replica);
        }
    }

    /// Property: instance names parse back to their index
    #[test]
    fn prop_instance_index_round_trips(index in 1..=10_000u32) {
        let cluster = create_test_cluster("db", "default", 1);
        let ctx = ClusterContext::new(&cluster).unwrap();
        prop_assert_eq!(instance_index(&ctx, &format!("db-{index}")), Some(index));
        prop_assert_eq!(instance_index(&ctx, &format!("dbx-{index}")), None);
        prop_assert_eq!(instance_index(&ctx, &format!("db{index}")), None);
    }
}
