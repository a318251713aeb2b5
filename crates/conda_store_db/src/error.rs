use thiserror::Error;

/// Errors surfaced by the persistence layer.
#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// A lookup that the caller required to succeed came back empty.
    #[error("{entity} not found")]
    NotFound { entity: String },

    #[error("name '{name}' is not valid, must match [{}]+", conda_store_types::ALLOWED_CHARACTERS)]
    InvalidName { name: String },

    #[error("invalid sort parameter '{name}'")]
    InvalidSortBy { name: String },

    #[error("invalid sort direction '{value}', expected 'asc' or 'desc'")]
    InvalidSortDirection { value: String },

    #[error("invalid cursor: {reason}")]
    InvalidCursor { reason: String },

    #[error("invalid role binding pattern '{pattern}'")]
    InvalidRoleBinding { pattern: String },

    #[error("unknown role '{role}', expected one of viewer, developer, admin")]
    InvalidRole { role: String },
}

impl DbError {
    pub(crate) fn not_found(entity: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
        }
    }
}
