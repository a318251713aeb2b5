//! Relational persistence for conda-store.
//!
//! Entities live in [`entities`], the query facade in [`api`]. The facade is
//! deliberately flat: free functions over a connection pool, one per
//! operation, mirroring the shape of the HTTP surface that consumes them.
//! Cursor based pagination lives in [`pagination`] and the role-binding
//! filter that scopes environment listings in [`authz`].

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

pub mod api;
pub mod authz;
pub mod entities;
mod error;
pub mod pagination;

pub use error::DbError;

/// The connection pool handed to every facade function.
pub type DbPool = sqlx::SqlitePool;

/// Embedded schema migrations, applied on connect.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Opens (creating if necessary) the database at `database_url` and brings
/// the schema up to date.
pub async fn connect(database_url: &str) -> Result<DbPool, DbError> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    tracing::debug!(database_url, "applying database migrations");
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}
