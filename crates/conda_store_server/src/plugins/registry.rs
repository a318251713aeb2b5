use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use conda_store_storage::Storage;

use crate::error::CondaStoreError;
use crate::plugins::config::ConfigDescription;
use crate::plugins::locker::Locker;

/// Registry of the three plugin families the core recognizes.
///
/// Lookup is case-insensitive; registering a name twice is an error. Storage
/// and config plugins are registered once at startup, lockers are registered
/// for the dynamic extent of a build task via [`ScopedLocker`].
#[derive(Default)]
pub struct PluginRegistry {
    lockers: RwLock<HashMap<String, Arc<dyn Locker>>>,
    storages: RwLock<HashMap<String, Arc<dyn Storage>>>,
    configs: RwLock<HashMap<String, ConfigDescription>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_locker(&self, locker: Arc<dyn Locker>) -> Result<(), CondaStoreError> {
        let name = locker.name().to_lowercase();
        let mut lockers = self.lockers.write();
        if lockers.contains_key(&name) {
            return Err(CondaStoreError::DuplicatePlugin { name });
        }
        tracing::debug!(name, "registering locker plugin");
        lockers.insert(name, locker);
        Ok(())
    }

    pub fn unregister_locker(&self, name: &str) {
        self.lockers.write().remove(&name.to_lowercase());
    }

    pub fn locker(&self, name: &str) -> Result<Arc<dyn Locker>, CondaStoreError> {
        let lockers = self.lockers.read();
        lockers
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| CondaStoreError::PluginNotFound {
                name: name.to_string(),
                available: sorted_names(&lockers),
            })
    }

    pub fn locker_names(&self) -> Vec<String> {
        sorted_names(&self.lockers.read())
    }

    pub fn register_storage(
        &self,
        name: &str,
        storage: Arc<dyn Storage>,
    ) -> Result<(), CondaStoreError> {
        let name = name.to_lowercase();
        let mut storages = self.storages.write();
        if storages.contains_key(&name) {
            return Err(CondaStoreError::DuplicatePlugin { name });
        }
        tracing::debug!(name, "registering storage plugin");
        storages.insert(name, storage);
        Ok(())
    }

    pub fn storage(&self, name: &str) -> Result<Arc<dyn Storage>, CondaStoreError> {
        let storages = self.storages.read();
        storages
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| CondaStoreError::PluginNotFound {
                name: name.to_string(),
                available: sorted_names(&storages),
            })
    }

    pub fn storage_names(&self) -> Vec<String> {
        sorted_names(&self.storages.read())
    }

    pub fn register_config(&self, description: ConfigDescription) -> Result<(), CondaStoreError> {
        let name = description.name.to_lowercase();
        let mut configs = self.configs.write();
        if configs.contains_key(&name) {
            return Err(CondaStoreError::DuplicatePlugin { name });
        }
        configs.insert(name, description);
        Ok(())
    }

    pub fn config(&self, name: &str) -> Result<ConfigDescription, CondaStoreError> {
        let configs = self.configs.read();
        configs
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| CondaStoreError::PluginNotFound {
                name: name.to_string(),
                available: sorted_names(&configs),
            })
    }

    pub fn config_descriptions(&self) -> Vec<ConfigDescription> {
        let mut descriptions: Vec<ConfigDescription> =
            self.configs.read().values().cloned().collect();
        descriptions.sort_by(|a, b| a.name.cmp(b.name));
        descriptions
    }
}

fn sorted_names<V>(map: &HashMap<String, V>) -> Vec<String> {
    let mut names: Vec<String> = map.keys().cloned().collect();
    names.sort();
    names
}

/// Registers a locker for the dynamic extent of a build task and guarantees
/// unregistration on every exit path, including panics and early returns.
pub struct ScopedLocker {
    registry: Arc<PluginRegistry>,
    name: String,
}

impl ScopedLocker {
    pub fn register(
        registry: Arc<PluginRegistry>,
        locker: Arc<dyn Locker>,
    ) -> Result<Self, CondaStoreError> {
        let name = locker.name().to_lowercase();
        registry.register_locker(locker)?;
        Ok(Self { registry, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ScopedLocker {
    fn drop(&mut self) {
        self.registry.unregister_locker(&self.name);
    }
}
