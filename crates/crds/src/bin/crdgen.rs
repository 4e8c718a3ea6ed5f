//! Prints the CRD manifests owned by the SR-IOV operator as YAML.

use crds::{SriovNetworkNodeState, SriovOperatorConfig};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&SriovNetworkNodeState::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&SriovOperatorConfig::crd())?);
    Ok(())
}
