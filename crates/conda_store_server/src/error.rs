use std::path::PathBuf;

use thiserror::Error;

use conda_store_db::DbError;
use conda_store_storage::StorageError;
use conda_store_types::SpecificationError;

/// The error taxonomy of the server core.
///
/// Everything a build raises is caught at the task boundary: the build row
/// is transitioned to a terminal state before the error propagates further,
/// and the full message is appended to the build log. Only
/// [`CondaStoreError::BuildPath`] is considered safe to surface to users via
/// `status_info`.
#[derive(Debug, Error)]
pub enum CondaStoreError {
    #[error(transparent)]
    Specification(#[from] SpecificationError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("plugin '{name}' not found, available plugins: {available:?}")]
    PluginNotFound {
        name: String,
        available: Vec<String>,
    },

    #[error("plugin '{name}' is already registered")]
    DuplicatePlugin { name: String },

    /// The computed install prefix is unusable (too long, unprintable).
    #[error("build path '{}' is not usable: {reason}", path.display())]
    BuildPath { path: PathBuf, reason: String },

    /// An external solver/installer/packaging command returned non-zero. The
    /// full output lives in the build log, not in this message.
    #[error("command '{command}' failed with {status}")]
    ExternalCommandFailed { command: String, status: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{entity} not found")]
    NotFound { entity: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl CondaStoreError {
    pub(crate) fn not_found(entity: impl Into<String>) -> Self {
        CondaStoreError::NotFound {
            entity: entity.into(),
        }
    }

    /// The message exposed in the build's `status_info`, for the error kinds
    /// whose message does not leak anything sensitive. Everything else is
    /// only visible in the logs.
    pub fn user_facing_message(&self) -> Option<String> {
        match self {
            CondaStoreError::BuildPath { .. } => Some(self.to_string()),
            _ => None,
        }
    }
}
