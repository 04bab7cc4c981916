use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use crate::controller::cluster_context::ClusterContext;
use crate::controller::error::Result;
use crate::controller::events::{ClusterEvent, EventSink};
use crate::controller::resources_state::ResourcesState;
use crate::controller::store::ClusterStore;
use crate::enforcer::{SpecDifference, SpecEnforcer, StatefulSetEnforcer};

/// Result of enforcing the spec on one instance
#[derive(Clone, Debug, Default)]
pub struct EnforcementOutcome {
    pub instance: String,
    /// The instance was rewritten
    pub changed: bool,
    pub differences: Vec<SpecDifference>,
    /// Post-persist hooks that failed; the write itself stands
    pub hook_errors: Vec<String>,
}

impl EnforcementOutcome {
    /// One line per difference, empty when the instance was in sync
    pub fn summary(&self) -> String {
        self.differences
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Runs the enforcer set against instances, one combined write per instance
pub struct SpecEnforcementRunner<'a> {
    ctx: &'a ClusterContext,
    enforcers: Vec<StatefulSetEnforcer<'a>>,
    store: &'a dyn ClusterStore,
    events: &'a dyn EventSink,
}

impl<'a> SpecEnforcementRunner<'a> {
    pub fn new(
        ctx: &'a ClusterContext,
        state: &'a ResourcesState,
        store: &'a dyn ClusterStore,
        events: &'a dyn EventSink,
    ) -> Self {
        Self {
            ctx,
            enforcers: StatefulSetEnforcer::ordered(ctx, state),
            store,
            events,
        }
    }

    pub fn spec_names(&self) -> Vec<&'static str> {
        self.enforcers.iter().map(|e| e.spec_name()).collect()
    }

    /// Detect and correct drift on one instance.
    ///
    /// Every difference is logged and evented before the write is attempted.
    /// A version conflict on the write is returned as a retryable error; a
    /// failing enforcer aborts this instance without writing anything.
    pub async fn run(&self, sts: StatefulSet) -> Result<EnforcementOutcome> {
        let mut instance = sts;
        let name = instance.name_any();
        let mut outcome = EnforcementOutcome {
            instance: name.clone(),
            ..Default::default()
        };
        let mut enforced = Vec::new();

        for enforcer in &self.enforcers {
            let Some(difference) = enforcer.check_for_spec_difference(&instance) else {
                continue;
            };
            info!(
                instance = %name,
                spec = difference.spec_name,
                current = %difference.current,
                expected = %difference.expected,
                "Spec difference detected"
            );
            self.events
                .emit(
                    self.ctx.cluster(),
                    ClusterEvent::normal(
                        "SpecEnforcement",
                        "Enforce",
                        format!("Instance {name}: {difference}"),
                    ),
                )
                .await;
            outcome.differences.push(difference);

            if enforcer.enforce_spec(&mut instance)? {
                outcome.changed = true;
            }
            enforced.push(enforcer);
        }

        if !outcome.changed {
            return Ok(outcome);
        }

        let persisted = self
            .store
            .replace_instance(self.ctx.namespace(), &instance)
            .await?;
        info!(instance = %name, changes = outcome.differences.len(), "Instance spec enforced");

        // One restart picks up every template change of this write
        let mut restarted = false;
        for enforcer in enforced {
            if enforcer.restarts_pod() && restarted {
                debug!(instance = %name, spec = enforcer.spec_name(), "Pod already restarted in this pass");
                continue;
            }
            match enforcer
                .on_spec_enforced_successfully(&persisted, self.store)
                .await
            {
                Ok(()) => restarted |= enforcer.restarts_pod(),
                Err(e) => {
                    error!(instance = %name, spec = enforcer.spec_name(), error = %e, "Post-enforcement step failed");
                    self.events
                        .emit(
                            self.ctx.cluster(),
                            ClusterEvent::warning(
                                "SpecEnforcementHookFailed",
                                "Enforce",
                                format!("Instance {name}, {}: {e}", enforcer.spec_name()),
                            ),
                        )
                        .await;
                    outcome
                        .hook_errors
                        .push(format!("{}: {e}", enforcer.spec_name()));
                }
            }
        }

        if !outcome.hook_errors.is_empty() {
            warn!(instance = %name, failures = outcome.hook_errors.len(), "Spec enforced with failed follow-up steps");
        }
        Ok(outcome)
    }
}
