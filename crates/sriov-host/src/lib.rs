//! SR-IOV Host Library
//!
//! Host-side building blocks for the SR-IOV config daemon: access to sysfs,
//! `ip`/`devlink` and kernel modules, the persisted per-PF store, device
//! discovery, and the engine that applies VF layouts to physical functions.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sriov_host::{DeviceEngine, EngineSettings, FileStore, Inventory, SupportedNics, SysfsHost};
//!
//! # async fn example() -> Result<(), sriov_host::HostError> {
//! let host = Arc::new(SysfsHost::new("/", "/host"));
//! let store = Arc::new(FileStore::new("/host"));
//! let inventory = Inventory::new(host.clone(), store.clone(), SupportedNics::default(), false);
//!
//! let observed = inventory.discover().await?;
//! let engine = DeviceEngine::new(host, store, &observed, EngineSettings::default());
//! engine.configure_all(&[], &observed).await?;
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod engine;
pub mod error;
#[path = "trait.rs"]
pub mod host_trait;
pub mod inventory;
pub mod kernel;
pub mod models;
pub mod store;
pub mod supported;
pub mod sysfs;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use command::CommandRunner;
pub use engine::{ConfigurationPlan, DeviceChange, DeviceEngine, EngineSettings};
pub use error::HostError;
pub use host_trait::HostInterface;
pub use inventory::Inventory;
pub use models::*;
pub use store::{FileStore, StoreManager};
pub use supported::{NicId, SupportedNics};
pub use sysfs::SysfsHost;
#[cfg(any(test, feature = "test-util"))]
pub use mock::{HostCall, MockDevice, MockHost, MockStore};
