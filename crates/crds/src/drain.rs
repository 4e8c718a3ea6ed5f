//! Node drain state annotation
//!
//! The config daemon records where a node is in the drain protocol in a
//! single string annotation on the Node object.

/// Annotation key holding the drain state.
pub const DRAIN_STATE_ANNOTATION: &str = "sriovnetwork.openshift.io/state";

/// Annotation carrying the MachineConfig a node is converging to.
pub const DESIRED_MACHINE_CONFIG_ANNOTATION: &str = "machineconfiguration.openshift.io/desiredConfig";

/// Drain protocol state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainState {
    /// Nothing in progress
    #[default]
    Idle,
    /// Daemon asked for permission to drain
    DrainRequired,
    /// Drain permitted or in progress
    Draining,
    /// Node's machine config pool paused by this daemon
    McpPaused,
}

impl DrainState {
    /// Annotation value for the state.
    pub fn as_annotation(&self) -> &'static str {
        match self {
            DrainState::Idle => "Idle",
            DrainState::DrainRequired => "Drain_Required",
            DrainState::Draining => "Draining",
            DrainState::McpPaused => "Draining_MCP_Paused",
        }
    }

    /// Parses an annotation value. Unknown values are treated as `Idle`.
    pub fn from_annotation(value: Option<&str>) -> Self {
        match value {
            Some("Drain_Required") => DrainState::DrainRequired,
            Some("Draining") => DrainState::Draining,
            Some("Draining_MCP_Paused") => DrainState::McpPaused,
            _ => DrainState::Idle,
        }
    }

    /// Draining proper or draining with the pool paused.
    pub fn is_draining(&self) -> bool {
        matches!(self, DrainState::Draining | DrainState::McpPaused)
    }
}

impl std::fmt::Display for DrainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_annotation())
    }
}
