//! The conda-store server core: plugin substrate, settings resolution, build
//! orchestration and the worker that drives builds through their lifecycle.
//!
//! A [`CondaStore`] is the handle threaded through the call graph: it owns
//! the plugin registry, the active storage backend, the base settings and the
//! task broker view. There are no process-wide singletons; the CLI constructs
//! one handle and passes it down.

pub mod error;
pub mod lockfile;
pub mod plugins;
pub mod settings;
pub mod store;
pub mod submission;
pub mod worker;

pub use error::CondaStoreError;
pub use settings::Settings;
pub use store::CondaStore;
