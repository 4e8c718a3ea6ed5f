//! SR-IOV CRD Definitions
//!
//! Kubernetes custom resources and shared data types used by the SR-IOV
//! config daemon and its host library.

pub mod drain;
pub mod error;
pub mod machine_config;
pub mod node_state;
pub mod operator_config;
pub mod sync;
pub mod vf_range;

pub use drain::*;
pub use error::CrdError;
pub use machine_config::*;
pub use node_state::*;
pub use operator_config::*;
pub use sync::*;
pub use vf_range::VfRange;
