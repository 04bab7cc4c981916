pub mod cluster_context;
pub mod context;
pub mod error;
pub mod events;
pub mod reconciler;
pub mod resources_state;
pub mod status;
pub mod store;
pub mod topology;
pub mod validation;

pub use cluster_context::{ClusterContext, CustomMetadata};
pub use context::{CONTROLLER_NAME, Context};
pub use error::{BackoffConfig, Error, ErrorContext, Result};
pub use events::{ClusterEvent, EventKind, EventSink, KubeEventSink};
pub use reconciler::{PassReport, error_policy, reconcile, reconcile_pass};
pub use resources_state::{ConfigKey, ConfigLocations, DeployedInstance, ResourcesState};
pub use status::{ConditionBuilder, StatusManager, compute_status, spec_changed};
pub use store::{ClusterStore, KubeStore};
pub use topology::{TopologyAction, TopologyOutcome, TopologyReconciler};
pub use validation::{MAX_REPLICAS, MIN_REPLICAS, validate_spec};
