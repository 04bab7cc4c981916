//! Services routing to the primary and to the replicas
//!
//! Both services are headless: clients resolve straight to the pod IP of the
//! instance carrying the matching role label, so a promotion is visible as soon
//! as the promoted pod is relabelled and ready.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::ObjectMeta;

use crate::controller::cluster_context::ClusterContext;
use crate::resources::common::{
    CLUSTER_LABEL, InstanceRole, READ_ONLY_LABEL, ROLE_LABEL, owner_reference, standard_labels,
};

/// Generate the read-write service selecting the primary instance
///
/// Not deployed in standby mode, where no local primary exists.
pub fn generate_primary_service(ctx: &ClusterContext) -> Service {
    let selector = BTreeMap::from([
        (CLUSTER_LABEL.to_string(), ctx.name().to_string()),
        (
            ROLE_LABEL.to_string(),
            InstanceRole::Primary.label_value().to_string(),
        ),
    ]);
    headless_service(ctx, ctx.primary_service_name(), selector)
}

/// Generate the read-only service selecting replicas and standby replicas
pub fn generate_replica_service(ctx: &ClusterContext) -> Service {
    let selector = BTreeMap::from([
        (CLUSTER_LABEL.to_string(), ctx.name().to_string()),
        (READ_ONLY_LABEL.to_string(), "true".to_string()),
    ]);
    headless_service(ctx, ctx.replica_service_name(), selector)
}

fn headless_service(
    ctx: &ClusterContext,
    name: String,
    selector: BTreeMap<String, String>,
) -> Service {
    let port = ctx.spec().port;
    Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(ctx.namespace().to_string()),
            labels: Some(standard_labels(ctx.name())),
            owner_references: Some(vec![owner_reference(ctx.cluster())]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                port,
                target_port: Some(IntOrString::Int(port)),
                name: Some("postgresql".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
