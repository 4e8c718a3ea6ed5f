//! In-memory StoreManager

use crate::error::HostError;
use crate::models::PersistedPfStatus;
use crate::store::StoreManager;
use crds::InterfaceSpec;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Mock store for testing
#[derive(Clone, Default, Debug)]
pub struct MockStore {
    statuses: Arc<Mutex<HashMap<String, PersistedPfStatus>>>,
    clears: Arc<Mutex<u32>>,
}

impl MockStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn statuses(&self) -> MutexGuard<'_, HashMap<String, PersistedPfStatus>> {
        self.statuses.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records a PF as applied (for test setup)
    pub fn add_status(&self, spec: &InterfaceSpec) {
        self.statuses()
            .insert(spec.pci_address.clone(), PersistedPfStatus::from_spec(spec));
    }

    /// Persisted status of a PF
    pub fn status(&self, pci_address: &str) -> Option<PersistedPfStatus> {
        self.statuses().get(pci_address).cloned()
    }

    /// Number of times the folder was cleared
    pub fn clear_count(&self) -> u32 {
        *self.clears.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait::async_trait]
impl StoreManager for MockStore {
    async fn load_pf_status(&self, pci_address: &str) -> Result<Option<PersistedPfStatus>, HostError> {
        Ok(self.status(pci_address))
    }

    async fn save_last_pf_applied_status(&self, spec: &InterfaceSpec) -> Result<(), HostError> {
        self.add_status(spec);
        Ok(())
    }

    async fn clear_pci_address_folder(&self) -> Result<(), HostError> {
        self.statuses().clear();
        *self.clears.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) += 1;
        Ok(())
    }
}
