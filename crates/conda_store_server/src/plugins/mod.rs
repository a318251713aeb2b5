//! The plugin substrate: a typed registry of locker, storage and config
//! plugins, plus the execution context handed to plugin hooks.

pub mod config;
pub mod context;
pub mod locker;
mod registry;

pub use config::{ConfigDescription, ConfigField};
pub use context::{LogSink, MemorySink, NullSink, PluginContext};
pub use locker::{conda_lock::CondaLockLocker, Locker};
pub use registry::{PluginRegistry, ScopedLocker};
