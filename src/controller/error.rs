//! Error types for the PostgresCluster controller

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// Error variants are named with the `Error` suffix for clarity (e.g., `KubeError`, `ValidationError`).
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency failure: the object changed since it was read
    #[error("Conflict writing {0}, object was modified concurrently")]
    Conflict(String),

    /// An enforcer's structural precondition does not hold on the instance
    #[error("Enforcement error on {instance} ({spec_name}): {message}")]
    EnforcementError {
        instance: String,
        spec_name: &'static str,
        message: String,
    },

    #[error("Transient error (will retry): {0}")]
    TransientError(String),

    #[error("Permanent error (will not retry): {0}")]
    PermanentError(String),
}

impl Error {
    /// Check if this error indicates a resource was not found
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::KubeError(e) => is_not_found(e),
            _ => false,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    // 4xx errors (except 409 Conflict, 429 TooManyRequests) are not retryable
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                // Network and other errors are retryable
                _ => true,
            },
            Error::Conflict(_) => true,
            Error::TransientError(_) => true,
            Error::NotFound(_) => true, // Resource might appear later
            Error::PermanentError(_) => false,
            Error::ValidationError(_) => false,
            Error::EnforcementError { .. } => false,
            Error::SerializationError(_) => false,
            Error::MissingObjectKey(_) => false,
        }
    }

    /// Short label for metrics and event reasons
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "KubeError",
            Error::SerializationError(_) => "SerializationError",
            Error::MissingObjectKey(_) => "MissingObjectKey",
            Error::ValidationError(_) => "ValidationError",
            Error::NotFound(_) => "NotFound",
            Error::Conflict(_) => "Conflict",
            Error::EnforcementError { .. } => "EnforcementError",
            Error::TransientError(_) => "TransientError",
            Error::PermanentError(_) => "PermanentError",
        }
    }
}

/// Check whether a kube error is an HTTP 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Check whether a kube error is an HTTP 409
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300), // 5 minutes
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(32) as i32;
        let base_delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped_delay)
    }

    /// Get the delay for an error, with different handling for retryable vs non-retryable
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        if error.is_retryable() {
            self.delay_for_attempt(attempt)
        } else {
            // Non-retryable errors wait for a spec edit, which triggers a new watch event anyway
            self.max_delay
        }
    }
}

/// Context for tracking error state during reconciliation
#[derive(Clone, Debug, Default)]
pub struct ErrorContext {
    /// Number of consecutive errors
    pub consecutive_errors: u32,
    /// Last error message
    pub last_error: Option<String>,
    pub last_failure: Option<Instant>,
}

impl ErrorContext {
    /// Record an error
    pub fn record_error(&mut self, error: &Error) {
        self.consecutive_errors += 1;
        self.last_error = Some(error.to_string());
        self.last_failure = Some(Instant::now());
    }

    /// No failure recorded within `window`
    pub fn is_stale(&self, window: Duration) -> bool {
        self.last_failure.is_none_or(|at| at.elapsed() >= window)
    }
}
