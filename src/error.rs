//! Error types for the sandbox fleet.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ports::PortService;

/// Errors raised by the container engine adapter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Container name already in use: {name}")]
    NameConflict { name: String },

    #[error("Container not found: {name}")]
    NotFound { name: String },

    #[error("Engine API error: {reason}")]
    Api { reason: String },

    #[error("Engine connection error: {reason}")]
    Connection { reason: String },

    #[error("Engine call timed out after {0:?}")]
    Timeout(Duration),
}

impl EngineError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Api { .. } | Self::Connection { .. } | Self::Timeout(_)
        )
    }
}

impl From<bollard::errors::Error> for EngineError {
    fn from(err: bollard::errors::Error) -> Self {
        use bollard::errors::Error as Bollard;

        match err {
            Bollard::DockerResponseServerError {
                status_code: 409,
                message,
            } => Self::NameConflict { name: message },
            Bollard::DockerResponseServerError {
                status_code: 404,
                message,
            } => Self::NotFound { name: message },
            Bollard::RequestTimeoutError => Self::Timeout(Duration::ZERO),
            e @ (Bollard::IOError { .. } | Bollard::HyperResponseError { .. }) => {
                Self::Connection {
                    reason: e.to_string(),
                }
            }
            other => Self::Api {
                reason: other.to_string(),
            },
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Caller-visible classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    CapacityExhausted,
    PortExhaustion,
    NotFound,
    NotReady,
    ReadinessTimeout,
    TransientInfraError,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "validation_error",
            Self::CapacityExhausted => "capacity_exhausted",
            Self::PortExhaustion => "port_exhaustion",
            Self::NotFound => "not_found",
            Self::NotReady => "not_ready",
            Self::ReadinessTimeout => "readiness_timeout",
            Self::TransientInfraError => "transient_infra_error",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the lifecycle manager and the service boundary.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("Unsupported OS type '{os_type}'")]
    UnsupportedOsType { os_type: String },

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Sandbox name '{name}' is already in use")]
    NameCollision { name: String },

    #[error("Capacity exhausted: all {capacity} sandbox slots are in use")]
    CapacityExhausted { capacity: usize },

    #[error("No free {service} port in range {start}..{end}")]
    PortExhaustion {
        service: PortService,
        start: u16,
        end: u16,
    },

    #[error("Sandbox '{name}' not found")]
    NotFound { name: String },

    #[error("Sandbox '{name}' is not ready")]
    NotReady { name: String },

    #[error("Sandbox '{name}' did not become ready after {attempts} probes: {last_error}")]
    ReadinessTimeout {
        name: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Launch of '{name}' timed out after {timeout:?}")]
    LaunchTimeout { name: String, timeout: Duration },

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Port scan failed: {reason}")]
    PortScan { reason: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Service is shutting down")]
    ShuttingDown,

    #[error("Start of '{name}' was abandoned by the caller")]
    Cancelled { name: String },

    #[error("Provisioning task failed: {reason}")]
    TaskFailed { reason: String },
}

impl FleetError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedOsType { .. }
            | Self::InvalidRequest { .. }
            | Self::NameCollision { .. } => ErrorKind::ValidationError,
            Self::CapacityExhausted { .. } => ErrorKind::CapacityExhausted,
            Self::PortExhaustion { .. } => ErrorKind::PortExhaustion,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::NotReady { .. } => ErrorKind::NotReady,
            Self::ReadinessTimeout { .. } => ErrorKind::ReadinessTimeout,
            Self::LaunchTimeout { .. } | Self::PortScan { .. } => ErrorKind::TransientInfraError,
            Self::Engine(e) if e.is_transient() => ErrorKind::TransientInfraError,
            Self::Engine(_)
            | Self::Config(_)
            | Self::ShuttingDown
            | Self::Cancelled { .. }
            | Self::TaskFailed { .. } => ErrorKind::Internal,
        }
    }

    /// Engine API errors, connection errors and timeouts.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientInfraError
    }
}

/// Result type for fleet operations.
pub type Result<T> = std::result::Result<T, FleetError>;
