//! External command execution
//!
//! Runs host tools (`ip`, `devlink`, `modprobe`, `systemd-run`, ...) with
//! `tokio::process`, optionally inside a `chroot` of the host filesystem
//! when the daemon runs in a container.

use crate::error::HostError;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

/// Runs commands directly or chrooted into a host root.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    chroot: Option<PathBuf>,
}

impl CommandRunner {
    /// Runs commands in the daemon's own filesystem.
    pub fn direct() -> Self {
        Self { chroot: None }
    }

    /// Runs commands through `chroot <root>`. A root of `/` runs directly.
    pub fn chrooted(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        if root == PathBuf::from("/") {
            return Self::direct();
        }
        Self { chroot: Some(root) }
    }

    /// Runs `program args...` and returns its stdout.
    pub async fn run(&self, program: &str, args: &[&str]) -> Result<String, HostError> {
        let mut command = match &self.chroot {
            Some(root) => {
                let mut command = Command::new("chroot");
                command.arg(root).arg(program);
                command
            }
            None => Command::new(program),
        };
        command.args(args);

        let command_line = self.command_line(program, args);
        debug!("Running command: {}", command_line);

        let output = command.output().await.map_err(|e| HostError::Command {
            command: command_line.clone(),
            stderr: e.to_string(),
        })?;

        if !output.status.success() {
            return Err(HostError::Command {
                command: command_line,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn command_line(&self, program: &str, args: &[&str]) -> String {
        let mut parts = Vec::with_capacity(args.len() + 3);
        if let Some(root) = &self.chroot {
            parts.push("chroot".to_string());
            parts.push(root.display().to_string());
        }
        parts.push(program.to_string());
        parts.extend(args.iter().map(|a| a.to_string()));
        parts.join(" ")
    }
}
