//! Spec enforcement for deployed instances
//!
//! Each enforcer owns exactly one configuration concern of an instance
//! StatefulSet. It detects drift between the live object and what the cluster
//! asks for, corrects the object in memory, and optionally runs a side effect
//! once the corrected object has been persisted. [`SpecEnforcementRunner`]
//! drives the enforcers in the order declared by [`StatefulSetEnforcer::ordered`].

mod custom_config;
mod custom_metadata;
mod image;
mod port;
mod resources;
mod runner;
mod standby_primary_endpoint;

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;
use tracing::info;

use crate::controller::cluster_context::ClusterContext;
use crate::controller::error::Result;
use crate::controller::resources_state::ResourcesState;
use crate::controller::store::ClusterStore;

pub use custom_config::CustomConfigEnforcer;
pub use custom_metadata::CustomMetadataEnforcer;
pub use image::ImageEnforcer;
pub use port::PortEnforcer;
pub use resources::ResourcesEnforcer;
pub use runner::{EnforcementOutcome, SpecEnforcementRunner};
pub use standby_primary_endpoint::StandbyPrimaryEndpointEnforcer;

/// One detected drift, with display-ready current and expected values
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecDifference {
    pub spec_name: &'static str,
    pub current: String,
    pub expected: String,
}

impl SpecDifference {
    pub fn new(
        spec_name: &'static str,
        current: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self {
            spec_name,
            current: current.into(),
            expected: expected.into(),
        }
    }
}

impl fmt::Display for SpecDifference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: current '{}', expected '{}'",
            self.spec_name, self.current, self.expected
        )
    }
}

/// Single-concern drift detection and correction rule
#[async_trait]
pub trait SpecEnforcer: Send + Sync {
    /// Stable name of the concern, unique within the enforcer set
    fn spec_name(&self) -> &'static str;

    /// Compare the instance against the desired value without mutating it.
    ///
    /// Returns `None` when there is no drift or when the concern does not
    /// apply to the instance yet.
    fn check_for_spec_difference(&self, sts: &StatefulSet) -> Option<SpecDifference>;

    /// Correct the instance in place; returns whether anything changed.
    ///
    /// Fails without mutating when a structural precondition does not hold.
    fn enforce_spec(&self, sts: &mut StatefulSet) -> Result<bool>;

    /// Side effect run only after the corrected instance was persisted
    async fn on_spec_enforced_successfully(
        &self,
        _sts: &StatefulSet,
        _store: &dyn ClusterStore,
    ) -> Result<()> {
        Ok(())
    }
}

/// The closed set of instance enforcers
pub enum StatefulSetEnforcer<'a> {
    CustomMetadata(CustomMetadataEnforcer<'a>),
    Image(ImageEnforcer<'a>),
    Port(PortEnforcer<'a>),
    Resources(ResourcesEnforcer<'a>),
    CustomConfig(CustomConfigEnforcer<'a>),
    StandbyPrimaryEndpoint(StandbyPrimaryEndpointEnforcer<'a>),
}

impl<'a> StatefulSetEnforcer<'a> {
    /// Every enforcer, in the order they run
    ///
    /// CustomConfig corrects volume presence and mount names together, so
    /// nothing later in the list depends on a volume it has not yet seen.
    pub fn ordered(ctx: &'a ClusterContext, state: &'a ResourcesState) -> Vec<Self> {
        vec![
            Self::CustomMetadata(CustomMetadataEnforcer::new(ctx)),
            Self::Image(ImageEnforcer::new(ctx)),
            Self::Port(PortEnforcer::new(ctx)),
            Self::Resources(ResourcesEnforcer::new(ctx)),
            Self::CustomConfig(CustomConfigEnforcer::new(ctx, state)),
            Self::StandbyPrimaryEndpoint(StandbyPrimaryEndpointEnforcer::new(ctx)),
        ]
    }

    /// Whether the post-persist step restarts the instance pod
    pub fn restarts_pod(&self) -> bool {
        !matches!(self, Self::CustomMetadata(_))
    }
}

macro_rules! dispatch {
    ($self:ident, $e:ident => $call:expr) => {
        match $self {
            StatefulSetEnforcer::CustomMetadata($e) => $call,
            StatefulSetEnforcer::Image($e) => $call,
            StatefulSetEnforcer::Port($e) => $call,
            StatefulSetEnforcer::Resources($e) => $call,
            StatefulSetEnforcer::CustomConfig($e) => $call,
            StatefulSetEnforcer::StandbyPrimaryEndpoint($e) => $call,
        }
    };
}

#[async_trait]
impl SpecEnforcer for StatefulSetEnforcer<'_> {
    fn spec_name(&self) -> &'static str {
        dispatch!(self, e => e.spec_name())
    }

    fn check_for_spec_difference(&self, sts: &StatefulSet) -> Option<SpecDifference> {
        dispatch!(self, e => e.check_for_spec_difference(sts))
    }

    fn enforce_spec(&self, sts: &mut StatefulSet) -> Result<bool> {
        dispatch!(self, e => e.enforce_spec(sts))
    }

    async fn on_spec_enforced_successfully(
        &self,
        sts: &StatefulSet,
        store: &dyn ClusterStore,
    ) -> Result<()> {
        dispatch!(self, e => e.on_spec_enforced_successfully(sts, store).await)
    }
}

/// Delete the instance's pod so it restarts from the updated template.
///
/// Instances use the `OnDelete` update strategy, so template changes reach the
/// pod only this way. A pod that is already gone is fine.
pub(crate) async fn restart_instance_pod(
    ctx: &ClusterContext,
    sts: &StatefulSet,
    store: &dyn ClusterStore,
    reason: &str,
) -> Result<()> {
    let pod = ctx.pod_name(&sts.name_any());
    if store.delete_pod(ctx.namespace(), &pod).await? {
        info!(pod = %pod, reason, "Restarted instance pod to apply updated spec");
    }
    Ok(())
}
