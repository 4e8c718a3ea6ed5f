//! OpenShift machine config types
//!
//! Only the fields the config daemon reads or patches are modelled.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "machineconfiguration.openshift.io",
    version = "v1",
    kind = "MachineConfigPool",
    status = "MachineConfigPoolStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfigPoolSpec {
    /// Pool stops rolling out machine configs while paused
    #[serde(default)]
    pub paused: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfigPoolStatus {
    /// Pool conditions
    #[serde(default)]
    pub conditions: Vec<MachineConfigPoolCondition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfigPoolCondition {
    /// Condition type (Updated, Updating, Degraded, ...)
    #[serde(rename = "type")]
    pub type_: String,

    /// "True", "False" or "Unknown"
    pub status: String,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "machineconfiguration.openshift.io",
    version = "v1",
    kind = "MachineConfig"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfigSpec {
    /// Kernel arguments carried by the rendered config
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kernel_arguments: Vec<String>,
}

impl MachineConfigPool {
    fn condition_is(&self, type_: &str, status: &str) -> bool {
        self.status
            .as_ref()
            .map(|s| s.conditions.iter().any(|c| c.type_ == type_ && c.status == status))
            .unwrap_or(false)
    }

    /// Pool finished rolling out and is healthy.
    pub fn is_ready(&self) -> bool {
        self.condition_is("Degraded", "False")
            && self.condition_is("Updated", "True")
            && self.condition_is("Updating", "False")
    }

    /// Whether `spec.paused` is set.
    pub fn is_paused(&self) -> bool {
        self.spec.paused
    }
}

impl MachineConfig {
    /// Name of the pool that rendered this config, from its owner references.
    pub fn owning_pool(&self) -> Option<String> {
        self.metadata
            .owner_references
            .as_ref()?
            .iter()
            .find(|owner| owner.kind == "MachineConfigPool")
            .map(|owner| owner.name.clone())
    }
}
