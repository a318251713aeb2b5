pub mod conda_lock;

use async_trait::async_trait;

use conda_store_types::CondaSpecification;

use crate::error::CondaStoreError;
use crate::plugins::context::PluginContext;

/// Solves a specification into a lockfile document.
///
/// The returned value is an opaque mapping in conda-lock format; the core
/// persists it verbatim as the LOCKFILE artifact and installs from it.
/// Exactly one locker is registered per build task, selected by the
/// `locker_plugin_name` setting.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Registry name of the plugin.
    fn name(&self) -> &str;

    /// One line description shown in plugin listings.
    fn synopsis(&self) -> &str;

    /// Solve `specification` for `platforms` and return the lockfile.
    async fn lock_environment(
        &self,
        context: &PluginContext,
        specification: &CondaSpecification,
        platforms: &[String],
    ) -> Result<serde_json::Value, CondaStoreError>;
}
