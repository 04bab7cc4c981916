use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kube::Client;
use kube::runtime::events::Reporter;

use crate::controller::error::{BackoffConfig, Error, ErrorContext};
use crate::controller::events::{EventSink, KubeEventSink};
use crate::controller::store::{ClusterStore, KubeStore};
use crate::health::HealthState;

/// Name the operator reports events under
pub const CONTROLLER_NAME: &str = "postgres-ha-operator";

/// Shared context for the controller
pub struct Context {
    /// Access to the objects clusters own
    pub store: Arc<dyn ClusterStore>,
    /// Destination of cluster events
    pub events: Arc<dyn EventSink>,
    /// Health state for metrics (optional)
    pub health_state: Option<Arc<HealthState>>,
    pub backoff: BackoffConfig,
    /// Consecutive failures per cluster (`namespace/name`)
    errors: Mutex<HashMap<String, ErrorContext>>,
}

impl Context {
    /// `reporter` names this operator replica on every event it publishes
    pub fn new(
        client: Client,
        reporter: Reporter,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self::with_store(
            Arc::new(KubeStore::new(client.clone())),
            Arc::new(KubeEventSink::new(client, reporter)),
            health_state,
        )
    }

    /// Build a context around any store and event sink
    pub fn with_store(
        store: Arc<dyn ClusterStore>,
        events: Arc<dyn EventSink>,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            store,
            events,
            health_state,
            backoff: BackoffConfig::default(),
            errors: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failed reconcile and return how long to wait before the next one.
    ///
    /// Entries of clusters that have not failed for twice the maximum backoff
    /// are dropped; a cluster still failing is retried well within that window.
    pub fn record_failure(&self, key: &str, error: &Error) -> Duration {
        let stale_after = self.backoff.max_delay * 2;
        let attempt = match self.errors.lock() {
            Ok(mut errors) => {
                errors.retain(|k, e| k == key || !e.is_stale(stale_after));
                let entry = errors.entry(key.to_string()).or_default();
                entry.record_error(error);
                entry.consecutive_errors
            }
            Err(_) => 1,
        };
        self.backoff
            .delay_for_error(error, attempt.saturating_sub(1))
    }

    /// Forget failures of a cluster after a successful reconcile or once it is gone
    pub fn forget(&self, key: &str) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.remove(key);
        }
    }

    /// Clusters with recorded failures
    pub fn tracked_clusters(&self) -> usize {
        self.errors.lock().map(|errors| errors.len()).unwrap_or(0)
    }

    /// Consecutive failures recorded for a cluster
    pub fn consecutive_failures(&self, key: &str) -> u32 {
        self.errors
            .lock()
            .ok()
            .and_then(|errors| errors.get(key).map(|e| e.consecutive_errors))
            .unwrap_or(0)
    }
}
