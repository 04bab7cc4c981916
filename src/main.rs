use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use postgres_ha_operator::health::{HealthState, run_health_server};
use postgres_ha_operator::{LogFormat, OperatorConfig, run_controller_scoped};

/// Lease configuration
const LEASE_NAME: &str = "postgres-ha-operator-leader";
const LEASE_TTL_SECS: u64 = 15;
const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

/// Grace period for in-flight reconciliations to complete during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

fn init_tracing(format: LogFormat) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::from_default_env()
        .add_directive("postgres_ha_operator=info".parse()?)
        .add_directive("kube=info".parse()?)
        .add_directive("kube_leader_election=info".parse()?);

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
    Ok(())
}

fn lease_lock(client: &Client, namespace: &str, holder_id: &str) -> LeaseLock {
    LeaseLock::new(
        client.clone(),
        namespace,
        LeaseLockParams {
            holder_id: holder_id.to_string(),
            lease_name: LEASE_NAME.to_string(),
            lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
        },
    )
}

/// Block until this process holds the lease, then keep renewing it in the
/// background. Losing the lease exits the process so it re-enters election.
async fn acquire_leadership(client: &Client, namespace: &str, holder_id: &str) {
    info!(
        holder_id,
        namespace,
        lease_name = LEASE_NAME,
        "Waiting to acquire leadership..."
    );
    let lock = lease_lock(client, namespace, holder_id);
    loop {
        match lock.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!("Acquired leadership");
                break;
            }
            Ok(_) => info!("Another instance is leader, waiting..."),
            Err(e) => warn!("Failed to acquire lease: {}, retrying...", e),
        }
        tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
    }

    let lock = lease_lock(client, namespace, holder_id);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
            match lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {}
                Ok(_) => {
                    error!("Lost leadership! Shutting down...");
                    std::process::exit(1);
                }
                Err(e) => {
                    error!("Failed to renew lease: {}. Shutting down...", e);
                    std::process::exit(1);
                }
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = OperatorConfig::from_env();

    // Install the TLS crypto provider before any TLS operations
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err("Failed to install rustls crypto provider and no provider is available".into());
    }

    init_tracing(config.log_format)?;
    info!(?config, "Starting postgres-ha-operator");

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let health_state = Arc::new(HealthState::new());

    // Probes answer even while waiting for the lease
    let health_handle = {
        let health_state = health_state.clone();
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, port).await {
                error!("Health server error: {}", e);
            }
        })
    };

    if config.leader_election {
        acquire_leadership(&client, &config.pod_namespace, &config.identity()).await;
    } else {
        warn!("Leader election disabled, run a single operator replica");
    }

    let controller_handle = {
        let health_state = health_state.clone();
        let namespace = config.watch_namespace().map(str::to_string);
        let reporter = config.reporter();
        tokio::spawn(async move {
            run_controller_scoped(client, reporter, Some(health_state), namespace.as_deref())
                .await;
        })
    };

    tokio::select! {
        result = controller_handle => {
            if let Err(e) = result {
                error!("Controller task panicked: {}", e);
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");
            health_state.set_ready(false).await;
            info!(
                "Waiting {}s for in-flight reconciliations to complete...",
                SHUTDOWN_GRACE_PERIOD_SECS
            );
            tokio::time::sleep(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)).await;
        }
    }

    info!("Operator stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
