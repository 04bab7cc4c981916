//! Kubernetes events attached to a PostgresCluster
//!
//! Drift, topology actions and validation failures are published as events so
//! an operator can audit what changed. Publishing is fire-and-forget: a failure
//! to record an event never fails a reconcile.

use async_trait::async_trait;
use kube::Client;
use kube::Resource;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::warn;

use crate::crd::PostgresCluster;

/// Severity of a cluster event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// Human-readable event attached to a cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterEvent {
    pub kind: EventKind,
    /// CamelCase machine reason, e.g. `SpecEnforcement`
    pub reason: String,
    /// Action the operator took or was taking
    pub action: String,
    pub note: String,
}

impl ClusterEvent {
    pub fn normal(reason: impl Into<String>, action: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Normal,
            reason: reason.into(),
            action: action.into(),
            note: note.into(),
        }
    }

    pub fn warning(reason: impl Into<String>, action: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Warning,
            reason: reason.into(),
            action: action.into(),
            note: note.into(),
        }
    }
}

/// Destination for cluster events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, cluster: &PostgresCluster, event: ClusterEvent);
}

/// [`EventSink`] publishing through the events.k8s.io API
#[derive(Clone)]
pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    pub fn new(client: Client, reporter: Reporter) -> Self {
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn emit(&self, cluster: &PostgresCluster, event: ClusterEvent) {
        let type_ = match event.kind {
            EventKind::Normal => EventType::Normal,
            EventKind::Warning => EventType::Warning,
        };
        let reference = cluster.object_ref(&());
        let result = self
            .recorder
            .publish(
                &Event {
                    type_,
                    reason: event.reason.clone(),
                    note: Some(event.note),
                    action: event.action,
                    secondary: None,
                },
                &reference,
            )
            .await;
        if let Err(e) = result {
            warn!(reason = %event.reason, error = %e, "Failed to publish event");
        }
    }
}
