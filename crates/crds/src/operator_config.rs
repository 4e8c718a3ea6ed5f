//! SriovOperatorConfig CRD
//!
//! Operator-wide settings. The config daemon only reads the `default`
//! object in its own namespace.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Name of the operator config object the daemon follows.
pub const OPERATOR_CONFIG_NAME: &str = "default";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "sriovnetwork.openshift.io",
    version = "v1",
    kind = "SriovOperatorConfig",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SriovOperatorConfigSpec {
    /// Skip cordon and drain before disruptive changes
    #[serde(default)]
    pub disable_drain: bool,

    /// Daemon log verbosity (0 = info, 1 = debug, 2 and above = trace)
    #[serde(default)]
    pub log_level: i32,
}
