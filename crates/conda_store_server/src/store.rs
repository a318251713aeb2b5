use std::collections::BTreeMap;
use std::sync::Arc;

use conda_store_db::{api, DbPool};
use conda_store_storage::{LocalStorage, S3Storage, Storage};

use crate::error::CondaStoreError;
use crate::plugins::config::builtin_config_descriptions;
use crate::plugins::PluginRegistry;
use crate::settings::Settings;
use crate::worker::TaskInventory;

/// The handle threaded through the whole call graph: base settings, plugin
/// registry, the active storage backend and the broker view used by the
/// reaper. One per process, constructed by the CLI; no singletons.
pub struct CondaStore {
    pub settings: Settings,
    pub registry: Arc<PluginRegistry>,
    storage: Arc<dyn Storage>,
    broker: Arc<dyn TaskInventory>,
}

impl CondaStore {
    /// Builds the registry, registers the builtin plugins and selects the
    /// active storage backend. With the s3 backend selected, a missing
    /// bucket fails startup here.
    pub async fn new(
        settings: Settings,
        broker: Arc<dyn TaskInventory>,
    ) -> Result<Self, CondaStoreError> {
        let registry = Arc::new(PluginRegistry::new());
        for description in builtin_config_descriptions() {
            registry.register_config(description)?;
        }

        registry.register_storage(
            "local",
            Arc::new(LocalStorage::new(settings.local_storage.clone())),
        )?;
        if settings.storage_plugin_name.eq_ignore_ascii_case("s3") {
            let s3 = S3Storage::connect(settings.s3_storage.clone()).await?;
            registry.register_storage("s3", Arc::new(s3))?;
        }
        let storage = registry.storage(&settings.storage_plugin_name)?;

        Ok(Self {
            settings,
            registry,
            storage,
            broker,
        })
    }

    /// The storage backend active for this process.
    pub fn storage(&self) -> Arc<dyn Storage> {
        self.storage.clone()
    }

    /// The broker control interface used by the reaper.
    pub fn broker(&self) -> Arc<dyn TaskInventory> {
        self.broker.clone()
    }

    /// Resolves the effective settings snapshot for a namespace/environment
    /// scope: base settings, overridden by the key-value store layers
    /// `setting`, `setting/{namespace}` and
    /// `setting/{namespace}/{environment}`, in that order.
    pub async fn get_settings(
        &self,
        db: &DbPool,
        namespace: Option<&str>,
        environment: Option<&str>,
    ) -> Result<Settings, CondaStoreError> {
        let mut layers = Vec::new();
        for prefix in settings_prefixes(namespace, environment) {
            layers.push(api::get_kvstore_key_values(db, &prefix).await?);
        }
        self.settings.merged(&layers)
    }

    /// Validates and persists settings overrides at the given scope.
    pub async fn set_settings(
        &self,
        db: &DbPool,
        namespace: Option<&str>,
        environment: Option<&str>,
        values: &BTreeMap<String, String>,
    ) -> Result<(), CondaStoreError> {
        if environment.is_some() && namespace.is_none() {
            return Err(CondaStoreError::Config(
                "environment scoped settings require a namespace".to_string(),
            ));
        }
        let scoped = namespace.is_some();
        for (field, value) in values {
            Settings::validate_override(field, value, scoped)?;
        }
        let prefix = settings_prefixes(namespace, environment)
            .pop()
            .expect("at least the global prefix exists");
        api::set_kvstore_key_values(db, &prefix, values, true).await?;
        Ok(())
    }
}

fn settings_prefixes(namespace: Option<&str>, environment: Option<&str>) -> Vec<String> {
    let mut prefixes = vec!["setting".to_string()];
    if let Some(namespace) = namespace {
        prefixes.push(format!("setting/{namespace}"));
        if let Some(environment) = environment {
            prefixes.push(format!("setting/{namespace}/{environment}"));
        }
    }
    prefixes
}
