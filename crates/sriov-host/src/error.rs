//! Host errors

use thiserror::Error;

/// Errors that can occur while inspecting or configuring the host
#[derive(Debug, Error)]
pub enum HostError {
    /// Filesystem access failed
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path being accessed
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// External command exited unsuccessfully or could not be spawned
    #[error("Command `{command}` failed: {stderr}")]
    Command {
        /// Command line that was run
        command: String,
        /// Captured stderr or spawn error
        stderr: String,
    },

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// More VFs requested than the device supports
    #[error("Cannot configure {requested} VFs on {pci_address}: device supports at most {total}")]
    VfCountExceedsCapacity {
        /// PF PCI address
        pci_address: String,
        /// Requested VF count
        requested: u32,
        /// Device capacity
        total: u32,
    },

    /// Change refused because the PF is externally managed
    #[error("Interface {pci_address} is externally managed: {reason}")]
    ExternallyManaged {
        /// PF PCI address
        pci_address: String,
        /// What was refused
        reason: String,
    },

    /// Kernel lockdown prevents configuring Mellanox devices
    #[error("Kernel lockdown mode is enabled, Mellanox devices cannot be configured")]
    LockdownMode,

    /// VF net device did not appear in time
    #[error("VF {0} is not ready")]
    VfNotReady(String),

    /// Device or file not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Background task failed to complete
    #[error("Task failed: {0}")]
    Task(String),

    /// Several per-device failures
    #[error("{}", join_errors(.0))]
    Multiple(Vec<HostError>),
}

impl HostError {
    /// Wraps an I/O error with the path it happened on.
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        HostError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Collapses a list of errors: none is `Ok`, one is returned as is.
    pub fn join(mut errors: Vec<HostError>) -> Result<(), HostError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(HostError::Multiple(errors)),
        }
    }
}

fn join_errors(errors: &[HostError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_errors() {
        assert!(HostError::join(vec![]).is_ok());

        let single = HostError::join(vec![HostError::LockdownMode]).unwrap_err();
        assert!(matches!(single, HostError::LockdownMode));

        let joined = HostError::join(vec![
            HostError::VfNotReady("0000:01:10.0".to_string()),
            HostError::NotFound("0000:02:00.0".to_string()),
        ])
        .unwrap_err();
        assert_eq!(
            joined.to_string(),
            "VF 0000:01:10.0 is not ready; Not found: 0000:02:00.0"
        );
    }
}
