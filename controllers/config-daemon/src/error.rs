//! Daemon error types.
//!
//! Errors raised by the config daemon itself. Host and device failures are
//! wrapped from `sriov_host::HostError`.

use kube::Error as KubeError;
use sriov_host::HostError;
use thiserror::Error;

/// Errors that can occur in the SR-IOV config daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Host inspection or device configuration failed
    #[error("Host error: {0}")]
    Host(#[from] HostError),

    /// A cluster object the daemon depends on does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Cordon or eviction did not succeed within the retry budget
    #[error("Drain failed: {0}")]
    DrainFailed(String),

    /// Machine config pool never became ready while waiting to pause it
    #[error("Timed out pausing machine config pool {0}")]
    McpPauseTimeout(String),

    /// Systemd mode file or unit error
    #[error("Systemd service error: {0}")]
    Systemd(String),

    /// Status writer task is gone
    #[error("Status writer stopped")]
    StatusWriterClosed,

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaemonError {
    /// Whether the error is an API 404.
    pub fn is_not_found(&self) -> bool {
        match self {
            DaemonError::NotFound(_) => true,
            DaemonError::Kube(KubeError::Api(response)) => response.code == 404,
            _ => false,
        }
    }
}
