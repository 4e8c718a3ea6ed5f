//! Logging setup.
//!
//! The filter sits behind a reload layer so the log level of the operator
//! config can be applied without restarting the daemon.

use crate::error::DaemonError;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Changes the daemon's log filter at runtime.
#[derive(Clone)]
pub struct LogLevelHandle {
    handle: Option<reload::Handle<EnvFilter, Registry>>,
    env_override: bool,
}

impl std::fmt::Debug for LogLevelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogLevelHandle")
            .field("env_override", &self.env_override)
            .finish()
    }
}

impl LogLevelHandle {
    /// Handle that ignores level changes, for tests.
    #[cfg(test)]
    pub fn disabled() -> Self {
        Self {
            handle: None,
            env_override: false,
        }
    }

    /// Applies an operator config log level. `RUST_LOG` takes precedence.
    pub fn set_level(&self, level: i32) -> Result<(), DaemonError> {
        if self.env_override {
            return Ok(());
        }
        let Some(handle) = &self.handle else {
            return Ok(());
        };
        handle
            .reload(EnvFilter::new(level_directive(level)))
            .map_err(|e| DaemonError::InvalidConfig(format!("Failed to change log level: {}", e)))?;
        info!("Log level set to {}", level_directive(level));
        Ok(())
    }
}

/// Installs the global subscriber.
pub fn init() -> LogLevelHandle {
    let env_override = std::env::var("RUST_LOG").is_ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_directive(0)));
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    LogLevelHandle {
        handle: Some(handle),
        env_override,
    }
}

/// Maps the operator log level to a filter directive.
pub fn level_directive(level: i32) -> &'static str {
    match level {
        i32::MIN..=0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_directive() {
        assert_eq!(level_directive(-1), "info");
        assert_eq!(level_directive(0), "info");
        assert_eq!(level_directive(1), "debug");
        assert_eq!(level_directive(2), "trace");
        assert_eq!(level_directive(10), "trace");
    }

    #[test]
    fn test_disabled_handle_accepts_changes() {
        assert!(LogLevelHandle::disabled().set_level(2).is_ok());
    }
}
