//! Operator process configuration
//!
//! Every setting is a command-line flag that falls back to an environment
//! variable, so the operator Deployment can configure it through the downward
//! API and plain env entries.

use clap::{ArgAction, Parser, ValueEnum};
use kube::runtime::events::Reporter;

use crate::controller::CONTROLLER_NAME;

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "PostgreSQL primary/replica cluster operator", long_about = None)]
pub struct OperatorConfig {
    /// Identity used for leader election; defaults to the hostname
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,

    /// Namespace holding the leader election lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    pub pod_namespace: String,

    /// Only reconcile clusters in this namespace; all namespaces when unset
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Port of the health and metrics server
    #[arg(long, env = "HEALTH_PORT", default_value_t = 8080)]
    pub health_port: u16,

    /// Run only while holding the leader lease
    #[arg(long, env = "LEADER_ELECTION", default_value_t = true, action = ArgAction::Set)]
    pub leader_election: bool,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl OperatorConfig {
    /// Parse flags, falling back to the environment
    pub fn from_env() -> Self {
        Self::parse()
    }

    /// Namespace to watch; an empty value means all namespaces
    pub fn watch_namespace(&self) -> Option<&str> {
        self.watch_namespace.as_deref().filter(|ns| !ns.is_empty())
    }

    /// Leader election identity
    pub fn identity(&self) -> String {
        match self.pod_name.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
        }
    }

    /// Event reporter, under the same identity as leader election
    pub fn reporter(&self) -> Reporter {
        Reporter {
            controller: CONTROLLER_NAME.to_string(),
            instance: Some(self.identity()),
        }
    }
}
