//! Health server for Kubernetes probes and Prometheus metrics
//!
//! Provides HTTP endpoints for:
//! - `/healthz` - Liveness probe (is the process alive?)
//! - `/readyz` - Readiness probe (is the operator ready to serve?)
//! - `/metrics` - Prometheus metrics

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpListener;
use tokio::sync::RwLock;

/// Labels identifying a cluster
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ReconcileLabels {
    pub namespace: String,
    pub name: String,
}

impl EncodeLabelSet for ReconcileLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for per-cluster counters broken down by one dimension
/// (enforcer name, topology action or error kind)
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct DetailLabels {
    pub namespace: String,
    pub name: String,
    pub detail: &'static str,
}

impl DetailLabels {
    fn encode_as(
        &self,
        key: &'static str,
        encoder: &mut LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        (key, self.detail).encode(encoder.encode_label())?;
        Ok(())
    }
}

macro_rules! detail_labels {
    ($ty:ident, $key:literal) => {
        #[derive(Clone, Debug, Hash, PartialEq, Eq)]
        pub struct $ty(pub DetailLabels);

        impl EncodeLabelSet for $ty {
            fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
                self.0.encode_as($key, &mut encoder)
            }
        }
    };
}

detail_labels!(SpecLabels, "spec");
detail_labels!(ActionLabels, "action");
detail_labels!(ErrorLabels, "kind");

fn cluster_labels(namespace: &str, name: &str) -> ReconcileLabels {
    ReconcileLabels {
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

fn detail(namespace: &str, name: &str, detail: &'static str) -> DetailLabels {
    DetailLabels {
        namespace: namespace.to_string(),
        name: name.to_string(),
        detail,
    }
}

/// Shared metrics state
pub struct Metrics {
    /// Total reconciliations counter
    pub reconciliations_total: Family<ReconcileLabels, Counter>,
    /// Failed reconciliations counter, by error kind
    pub reconciliation_errors_total: Family<ErrorLabels, Counter>,
    /// Reconciliation duration histogram
    pub reconcile_duration_seconds: Family<ReconcileLabels, Histogram>,
    /// Detected spec drifts, by enforcer
    pub spec_drifts_total: Family<SpecLabels, Counter>,
    /// Applied topology actions, by kind
    pub topology_actions_total: Family<ActionLabels, Counter>,
    /// Desired instances per cluster
    pub cluster_instances_desired: Family<ReconcileLabels, Gauge>,
    /// Ready instances per cluster
    pub cluster_instances_ready: Family<ReconcileLabels, Gauge>,

    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let reconciliations_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "postgres_operator_reconciliations",
            "Total number of reconciliations",
            reconciliations_total.clone(),
        );

        let reconciliation_errors_total = Family::<ErrorLabels, Counter>::default();
        registry.register(
            "postgres_operator_reconciliation_errors",
            "Total number of reconciliation errors",
            reconciliation_errors_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<ReconcileLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "postgres_operator_reconcile_duration_seconds",
            "Duration of reconciliation in seconds",
            reconcile_duration_seconds.clone(),
        );

        let spec_drifts_total = Family::<SpecLabels, Counter>::default();
        registry.register(
            "postgres_operator_spec_drifts",
            "Spec differences detected on instances, by enforcer",
            spec_drifts_total.clone(),
        );

        let topology_actions_total = Family::<ActionLabels, Counter>::default();
        registry.register(
            "postgres_operator_topology_actions",
            "Topology actions applied, by kind",
            topology_actions_total.clone(),
        );

        let cluster_instances_desired = Family::<ReconcileLabels, Gauge>::default();
        registry.register(
            "postgres_operator_cluster_instances_desired",
            "Desired number of instances for each cluster",
            cluster_instances_desired.clone(),
        );

        let cluster_instances_ready = Family::<ReconcileLabels, Gauge>::default();
        registry.register(
            "postgres_operator_cluster_instances_ready",
            "Number of ready instances for each cluster",
            cluster_instances_ready.clone(),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            reconcile_duration_seconds,
            spec_drifts_total,
            topology_actions_total,
            cluster_instances_desired,
            cluster_instances_ready,
            registry,
        }
    }

    /// Record a successful reconciliation
    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64) {
        let labels = cluster_labels(namespace, name);
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a failed reconciliation
    pub fn record_error(&self, namespace: &str, name: &str, kind: &'static str) {
        self.reconciliation_errors_total
            .get_or_create(&ErrorLabels(detail(namespace, name, kind)))
            .inc();
    }

    pub fn record_spec_drift(&self, namespace: &str, name: &str, spec_name: &'static str) {
        self.spec_drifts_total
            .get_or_create(&SpecLabels(detail(namespace, name, spec_name)))
            .inc();
    }

    pub fn record_topology_action(&self, namespace: &str, name: &str, action: &'static str) {
        self.topology_actions_total
            .get_or_create(&ActionLabels(detail(namespace, name, action)))
            .inc();
    }

    /// Update cluster instance metrics
    pub fn set_cluster_instances(&self, namespace: &str, name: &str, desired: i64, ready: i64) {
        let labels = cluster_labels(namespace, name);
        self.cluster_instances_desired
            .get_or_create(&labels)
            .set(desired);
        self.cluster_instances_ready.get_or_create(&labels).set(ready);
    }

    /// Encode metrics to Prometheus text format
    ///
    /// Returns an empty string if encoding fails (should never happen with valid metrics).
    fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the operator is ready (connected to K8s API)
    pub ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
    /// Last successful reconcile, seconds since the epoch
    pub last_reconcile: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
            last_reconcile: AtomicU64::new(0),
        }
    }

    /// Mark the operator as ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the operator is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    pub fn touch_last_reconcile(&self) {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        self.last_reconcile.store(now, Ordering::Relaxed);
    }
}

/// Liveness probe handler
///
/// Returns 200 OK if the process is alive.
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 503 Service Unavailable until the controller is running.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Run the health server on `0.0.0.0:<port>`
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Health server listening on {}", addr);

    axum::serve(listener, app).await
}
