//! The query facade over the conda-store schema.
//!
//! Free functions over a [`DbPool`], one per operation. Writes commit as they
//! go so a crashed worker always leaves a consistent snapshot behind; the few
//! multi-statement updates (completing a build) run in a transaction.

use std::collections::BTreeMap;

use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite};

use conda_store_types as types;

use crate::authz::{self, RoleBindings};
use crate::entities::{
    Build, BuildArtifact, BuildArtifactType, BuildPackage, BuildStatus, CondaChannel,
    CondaPackage, CondaPackageBuild, Environment, Namespace, NamespaceMetrics, NamespaceRole,
    NamespaceRoleMapping, Solve, Specification,
};
use crate::pagination::{paginate, Page, SortColumn, SortDirection};
use crate::{DbError, DbPool};

// ---------------------------------------------------------------------------
// namespaces

pub async fn list_namespaces(
    pool: &DbPool,
    show_soft_deleted: bool,
) -> Result<Vec<Namespace>, DbError> {
    let mut query = QueryBuilder::new("SELECT id, name, metadata, deleted_on FROM namespace");
    if !show_soft_deleted {
        query.push(" WHERE deleted_on IS NULL");
    }
    query.push(" ORDER BY name");
    Ok(query.build_query_as().fetch_all(pool).await?)
}

pub async fn get_namespace(pool: &DbPool, name: &str) -> Result<Option<Namespace>, DbError> {
    Ok(sqlx::query_as(
        "SELECT id, name, metadata, deleted_on FROM namespace WHERE name = ?",
    )
    .bind(name)
    .fetch_optional(pool)
    .await?)
}

pub async fn create_namespace(pool: &DbPool, name: &str) -> Result<Namespace, DbError> {
    if !types::is_valid_name(name) {
        return Err(DbError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(sqlx::query_as(
        "INSERT INTO namespace (name) VALUES (?) RETURNING id, name, metadata, deleted_on",
    )
    .bind(name)
    .fetch_one(pool)
    .await?)
}

/// Creates the namespace if missing. Safe under concurrent submissions: the
/// unique constraint on `name` swallows the race and the row is re-read.
pub async fn ensure_namespace(pool: &DbPool, name: &str) -> Result<Namespace, DbError> {
    if !types::is_valid_name(name) {
        return Err(DbError::InvalidName {
            name: name.to_string(),
        });
    }
    sqlx::query("INSERT INTO namespace (name) VALUES (?) ON CONFLICT DO NOTHING")
        .bind(name)
        .execute(pool)
        .await?;
    get_namespace(pool, name)
        .await?
        .ok_or_else(|| DbError::not_found(format!("namespace '{name}'")))
}

pub async fn update_namespace_metadata(
    pool: &DbPool,
    name: &str,
    metadata: &serde_json::Value,
) -> Result<Namespace, DbError> {
    let updated = sqlx::query("UPDATE namespace SET metadata = ? WHERE name = ?")
        .bind(sqlx::types::Json(metadata))
        .bind(name)
        .execute(pool)
        .await?;
    if updated.rows_affected() == 0 {
        return Err(DbError::not_found(format!("namespace '{name}'")));
    }
    get_namespace(pool, name)
        .await?
        .ok_or_else(|| DbError::not_found(format!("namespace '{name}'")))
}

/// Soft delete: hides the namespace from default listings, keeps the row.
pub async fn mark_namespace_deleted(pool: &DbPool, name: &str) -> Result<(), DbError> {
    let updated =
        sqlx::query("UPDATE namespace SET deleted_on = ? WHERE name = ? AND deleted_on IS NULL")
            .bind(Utc::now())
            .bind(name)
            .execute(pool)
            .await?;
    if updated.rows_affected() == 0 {
        return Err(DbError::not_found(format!("namespace '{name}'")));
    }
    Ok(())
}

/// Hard delete; environments cascade.
pub async fn delete_namespace(pool: &DbPool, name: &str) -> Result<(), DbError> {
    sqlx::query("DELETE FROM namespace WHERE name = ?")
        .bind(name)
        .execute(pool)
        .await?;
    Ok(())
}

/// Replaces all v1 role mappings of a namespace in one transaction.
pub async fn update_namespace_role_mappings(
    pool: &DbPool,
    name: &str,
    role_mappings: &BTreeMap<String, Vec<String>>,
) -> Result<(), DbError> {
    let namespace = get_namespace(pool, name)
        .await?
        .ok_or_else(|| DbError::not_found(format!("namespace '{name}'")))?;

    // Validate before touching anything.
    for entity in role_mappings.keys() {
        authz::compile_arn_sql_like(entity)?;
    }

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM namespace_role_mapping WHERE namespace_id = ?")
        .bind(namespace.id)
        .execute(&mut *tx)
        .await?;
    for (entity, roles) in role_mappings {
        for role in roles {
            sqlx::query(
                "INSERT INTO namespace_role_mapping (namespace_id, entity, role) VALUES (?, ?, ?)",
            )
            .bind(namespace.id)
            .bind(entity)
            .bind(role)
            .execute(&mut *tx)
            .await?;
        }
    }
    tx.commit().await?;
    Ok(())
}

pub async fn list_namespace_role_mappings(
    pool: &DbPool,
    name: &str,
) -> Result<Vec<NamespaceRoleMapping>, DbError> {
    Ok(sqlx::query_as(
        "SELECT nrm.id, nrm.namespace_id, nrm.entity, nrm.role \
         FROM namespace_role_mapping nrm \
         JOIN namespace ON namespace.id = nrm.namespace_id \
         WHERE namespace.name = ?",
    )
    .bind(name)
    .fetch_all(pool)
    .await?)
}

// v2 role mappings: namespace -> namespace grants.

const NAMESPACE_ROLE_COLUMNS: &str = "nrm.id, this.name AS namespace, \
     other.name AS other_namespace, nrm.role";

/// Which namespaces can access namespace `name`?
pub async fn get_namespace_roles(pool: &DbPool, name: &str) -> Result<Vec<NamespaceRole>, DbError> {
    let mut query = QueryBuilder::new("SELECT ");
    query
        .push(NAMESPACE_ROLE_COLUMNS)
        .push(
            " FROM namespace_role_mapping_v2 nrm \
             JOIN namespace this ON this.id = nrm.namespace_id \
             JOIN namespace other ON other.id = nrm.other_namespace_id \
             WHERE this.name = ",
        )
        .push_bind(name);
    Ok(query.build_query_as().fetch_all(pool).await?)
}

/// To which namespaces does namespace `name` have access?
pub async fn get_other_namespace_roles(
    pool: &DbPool,
    name: &str,
) -> Result<Vec<NamespaceRole>, DbError> {
    let mut query = QueryBuilder::new("SELECT ");
    query
        .push(NAMESPACE_ROLE_COLUMNS)
        .push(
            " FROM namespace_role_mapping_v2 nrm \
             JOIN namespace this ON this.id = nrm.namespace_id \
             JOIN namespace other ON other.id = nrm.other_namespace_id \
             WHERE other.name = ",
        )
        .push_bind(name);
    Ok(query.build_query_as().fetch_all(pool).await?)
}

pub async fn get_namespace_role(
    pool: &DbPool,
    name: &str,
    other: &str,
) -> Result<Option<NamespaceRole>, DbError> {
    let mut query = QueryBuilder::new("SELECT ");
    query
        .push(NAMESPACE_ROLE_COLUMNS)
        .push(
            " FROM namespace_role_mapping_v2 nrm \
             JOIN namespace this ON this.id = nrm.namespace_id \
             JOIN namespace other ON other.id = nrm.other_namespace_id \
             WHERE this.name = ",
        )
        .push_bind(name)
        .push(" AND other.name = ")
        .push_bind(other);
    Ok(query.build_query_as().fetch_optional(pool).await?)
}

pub async fn create_namespace_role(
    pool: &DbPool,
    name: &str,
    other: &str,
    role: &str,
) -> Result<(), DbError> {
    let role = authz::normalize_role(role)?;
    let namespace = require_namespace(pool, name).await?;
    let other_namespace = require_namespace(pool, other).await?;
    sqlx::query(
        "INSERT INTO namespace_role_mapping_v2 (namespace_id, other_namespace_id, role) \
         VALUES (?, ?, ?)",
    )
    .bind(namespace.id)
    .bind(other_namespace.id)
    .bind(role)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn update_namespace_role(
    pool: &DbPool,
    name: &str,
    other: &str,
    role: &str,
) -> Result<(), DbError> {
    let role = authz::normalize_role(role)?;
    let namespace = require_namespace(pool, name).await?;
    let other_namespace = require_namespace(pool, other).await?;
    let updated = sqlx::query(
        "UPDATE namespace_role_mapping_v2 SET role = ? \
         WHERE namespace_id = ? AND other_namespace_id = ?",
    )
    .bind(role)
    .bind(namespace.id)
    .bind(other_namespace.id)
    .execute(pool)
    .await?;
    if updated.rows_affected() == 0 {
        return Err(DbError::not_found(format!(
            "role mapping '{name}' -> '{other}'"
        )));
    }
    Ok(())
}

pub async fn delete_namespace_role(pool: &DbPool, name: &str, other: &str) -> Result<(), DbError> {
    let namespace = require_namespace(pool, name).await?;
    let other_namespace = require_namespace(pool, other).await?;
    sqlx::query(
        "DELETE FROM namespace_role_mapping_v2 \
         WHERE namespace_id = ? AND other_namespace_id = ?",
    )
    .bind(namespace.id)
    .bind(other_namespace.id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_namespace_roles(pool: &DbPool, name: &str) -> Result<(), DbError> {
    let namespace = require_namespace(pool, name).await?;
    sqlx::query("DELETE FROM namespace_role_mapping_v2 WHERE namespace_id = ?")
        .bind(namespace.id)
        .execute(pool)
        .await?;
    Ok(())
}

async fn require_namespace(pool: &DbPool, name: &str) -> Result<Namespace, DbError> {
    get_namespace(pool, name)
        .await?
        .ok_or_else(|| DbError::not_found(format!("namespace '{name}'")))
}

// ---------------------------------------------------------------------------
// environments

const ENVIRONMENT_COLUMNS: &str = "environment.id, environment.namespace_id, \
     namespace.name AS namespace_name, environment.name, environment.description, \
     environment.current_build_id, environment.specification_id, environment.deleted_on";

/// Filters applied to environment listings.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentFilter {
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub status: Option<BuildStatus>,
    pub artifact: Option<BuildArtifactType>,
    pub packages: Vec<String>,
    pub search: Option<String>,
    pub show_soft_deleted: bool,
}

fn push_environment_from(
    query: &mut QueryBuilder<'_, Sqlite>,
    filter: &EnvironmentFilter,
    role_bindings: Option<&[(String, String)]>,
) {
    query.push(
        "FROM environment JOIN namespace ON namespace.id = environment.namespace_id WHERE 1 = 1",
    );
    if let Some(namespace) = &filter.namespace {
        query.push(" AND namespace.name = ").push_bind(namespace.clone());
    }
    if let Some(name) = &filter.name {
        query.push(" AND environment.name = ").push_bind(name.clone());
    }
    if let Some(search) = &filter.search {
        let pattern = like_contains(search);
        query
            .push(" AND (namespace.name LIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR environment.name LIKE ")
            .push_bind(pattern)
            .push(" ESCAPE '\\')");
    }
    if !filter.show_soft_deleted {
        query.push(" AND environment.deleted_on IS NULL");
    }
    if let Some(status) = filter.status {
        query
            .push(" AND environment.current_build_id IN (SELECT id FROM build WHERE status = ")
            .push_bind(status)
            .push(")");
    }
    if let Some(artifact) = filter.artifact {
        query
            .push(
                " AND environment.current_build_id IN \
                 (SELECT build_id FROM build_artifact WHERE artifact_type = ",
            )
            .push_bind(artifact)
            .push(")");
    }
    if !filter.packages.is_empty() {
        push_packages_subquery(query, " AND environment.current_build_id IN ", &filter.packages);
    }
    if let Some(compiled) = role_bindings {
        authz::push_role_binding_filter(query, compiled);
    }
}

/// Restricts to builds containing *all* of the given package names.
fn push_packages_subquery(
    query: &mut QueryBuilder<'_, Sqlite>,
    prelude: &str,
    packages: &[String],
) {
    query.push(prelude).push(
        "(SELECT bcpb.build_id FROM build_conda_package_build bcpb \
         JOIN conda_package_build cpb ON cpb.id = bcpb.conda_package_build_id \
         JOIN conda_package cp ON cp.id = cpb.package_id \
         WHERE cp.name IN (",
    );
    let mut separated = query.separated(", ");
    for package in packages {
        separated.push_bind(package.clone());
    }
    query
        .push(") GROUP BY bcpb.build_id HAVING COUNT(DISTINCT cp.name) = ")
        .push_bind(packages.len() as i64)
        .push(")");
}

fn like_contains(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

/// Retrieves all environments, unpaged, in namespace/name order.
pub async fn list_environments(
    pool: &DbPool,
    filter: &EnvironmentFilter,
    role_bindings: Option<&RoleBindings>,
) -> Result<Vec<Environment>, DbError> {
    let compiled = role_bindings
        .map(authz::compile_role_bindings)
        .transpose()?;
    let mut query = QueryBuilder::new("SELECT ");
    query.push(ENVIRONMENT_COLUMNS).push(" ");
    push_environment_from(&mut query, filter, compiled.as_deref());
    query.push(" ORDER BY namespace.name, environment.name, environment.id");
    Ok(query.build_query_as().fetch_all(pool).await?)
}

fn environment_namespace_value(environment: &Environment) -> serde_json::Value {
    serde_json::Value::String(environment.namespace_name.clone())
}

fn environment_name_value(environment: &Environment) -> serde_json::Value {
    serde_json::Value::String(environment.name.clone())
}

fn environment_id(environment: &Environment) -> i64 {
    environment.id
}

/// The orderable keys of an environment listing.
pub fn environment_sort_columns() -> Vec<SortColumn<Environment>> {
    vec![
        SortColumn {
            name: "namespace",
            expr: "namespace.name",
            value: environment_namespace_value,
        },
        SortColumn {
            name: "name",
            expr: "environment.name",
            value: environment_name_value,
        },
    ]
}

/// Cursor-paged environment listing.
#[allow(clippy::too_many_arguments)]
pub async fn paginate_environments(
    pool: &DbPool,
    filter: &EnvironmentFilter,
    role_bindings: Option<&RoleBindings>,
    sort_by: &[String],
    direction: SortDirection,
    limit: i64,
    cursor: Option<&str>,
) -> Result<Page<Environment>, DbError> {
    let compiled = role_bindings
        .map(authz::compile_role_bindings)
        .transpose()?;
    let columns = environment_sort_columns();
    paginate(
        pool,
        ENVIRONMENT_COLUMNS,
        |query: &mut QueryBuilder<'_, Sqlite>| {
            push_environment_from(query, filter, compiled.as_deref())
        },
        "environment.id",
        environment_id,
        &columns,
        sort_by,
        direction,
        limit,
        cursor,
    )
    .await
}

pub async fn get_environment(
    pool: &DbPool,
    namespace: &str,
    name: &str,
) -> Result<Option<Environment>, DbError> {
    let mut query = QueryBuilder::new("SELECT ");
    query
        .push(ENVIRONMENT_COLUMNS)
        .push(" FROM environment JOIN namespace ON namespace.id = environment.namespace_id")
        .push(" WHERE namespace.name = ")
        .push_bind(namespace)
        .push(" AND environment.name = ")
        .push_bind(name);
    Ok(query.build_query_as().fetch_optional(pool).await?)
}

pub async fn get_environment_by_id(
    pool: &DbPool,
    id: i64,
) -> Result<Option<Environment>, DbError> {
    let mut query = QueryBuilder::new("SELECT ");
    query
        .push(ENVIRONMENT_COLUMNS)
        .push(" FROM environment JOIN namespace ON namespace.id = environment.namespace_id")
        .push(" WHERE environment.id = ")
        .push_bind(id);
    Ok(query.build_query_as().fetch_optional(pool).await?)
}

pub async fn create_environment(
    pool: &DbPool,
    namespace_id: i64,
    name: &str,
    description: Option<&str>,
) -> Result<Environment, DbError> {
    if !types::is_valid_name(name) {
        return Err(DbError::InvalidName {
            name: name.to_string(),
        });
    }
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO environment (namespace_id, name, description) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(namespace_id)
    .bind(name)
    .bind(description)
    .fetch_one(pool)
    .await?;
    get_environment_by_id(pool, row.0)
        .await?
        .ok_or_else(|| DbError::not_found(format!("environment '{name}'")))
}

/// Creates the environment if missing, refreshes the description otherwise.
/// Safe under concurrent submissions via the `(namespace_id, name)` unique
/// constraint.
pub async fn ensure_environment(
    pool: &DbPool,
    namespace_id: i64,
    name: &str,
    description: Option<&str>,
) -> Result<Environment, DbError> {
    if !types::is_valid_name(name) {
        return Err(DbError::InvalidName {
            name: name.to_string(),
        });
    }
    sqlx::query(
        "INSERT INTO environment (namespace_id, name, description) VALUES (?, ?, ?) \
         ON CONFLICT (namespace_id, name) DO NOTHING",
    )
    .bind(namespace_id)
    .bind(name)
    .bind(description)
    .execute(pool)
    .await?;
    if let Some(description) = description {
        sqlx::query("UPDATE environment SET description = ? WHERE namespace_id = ? AND name = ?")
            .bind(description)
            .bind(namespace_id)
            .bind(name)
            .execute(pool)
            .await?;
    }

    let row: (i64,) =
        sqlx::query_as("SELECT id FROM environment WHERE namespace_id = ? AND name = ?")
            .bind(namespace_id)
            .bind(name)
            .fetch_one(pool)
            .await?;
    get_environment_by_id(pool, row.0)
        .await?
        .ok_or_else(|| DbError::not_found(format!("environment '{name}'")))
}

// ---------------------------------------------------------------------------
// specifications

/// Inserts a specification if its content hash is new, returns the existing
/// row otherwise. Safe under concurrent duplicate submissions: the unique
/// constraint on `sha256` swallows the race and the row is re-read.
pub async fn ensure_specification(
    pool: &DbPool,
    specification: &types::Specification,
) -> Result<Specification, DbError> {
    let sha256 = specification.sha256();
    if let Some(existing) = get_specification(pool, &sha256).await? {
        return Ok(existing);
    }

    let spec_value =
        serde_json::to_value(specification).expect("specification serializes to json");
    sqlx::query(
        "INSERT INTO specification (name, spec, sha256, is_lockfile, created_on) \
         VALUES (?, ?, ?, ?, ?) ON CONFLICT (sha256) DO NOTHING",
    )
    .bind(specification.name())
    .bind(sqlx::types::Json(spec_value))
    .bind(&sha256)
    .bind(specification.is_lockfile())
    .bind(Utc::now())
    .execute(pool)
    .await?;

    get_specification(pool, &sha256)
        .await?
        .ok_or_else(|| DbError::not_found(format!("specification '{sha256}'")))
}

const SPECIFICATION_COLUMNS: &str = "id, name, spec, sha256, is_lockfile, created_on";

pub async fn get_specification(
    pool: &DbPool,
    sha256: &str,
) -> Result<Option<Specification>, DbError> {
    let mut query = QueryBuilder::new("SELECT ");
    query
        .push(SPECIFICATION_COLUMNS)
        .push(" FROM specification WHERE sha256 = ")
        .push_bind(sha256);
    Ok(query.build_query_as().fetch_optional(pool).await?)
}

pub async fn get_specification_by_id(
    pool: &DbPool,
    id: i64,
) -> Result<Option<Specification>, DbError> {
    let mut query = QueryBuilder::new("SELECT ");
    query
        .push(SPECIFICATION_COLUMNS)
        .push(" FROM specification WHERE id = ")
        .push_bind(id);
    Ok(query.build_query_as().fetch_optional(pool).await?)
}

pub async fn list_specifications(
    pool: &DbPool,
    search: Option<&str>,
) -> Result<Vec<Specification>, DbError> {
    let mut query = QueryBuilder::new("SELECT ");
    query.push(SPECIFICATION_COLUMNS).push(" FROM specification WHERE 1 = 1");
    if let Some(search) = search {
        query
            .push(" AND name LIKE ")
            .push_bind(like_contains(search))
            .push(" ESCAPE '\\'");
    }
    query.push(" ORDER BY id");
    Ok(query.build_query_as().fetch_all(pool).await?)
}

// ---------------------------------------------------------------------------
// solves

pub async fn create_solve(pool: &DbPool, specification_id: i64) -> Result<Solve, DbError> {
    Ok(sqlx::query_as(
        "INSERT INTO solve (specification_id, scheduled_on) VALUES (?, ?) \
         RETURNING id, specification_id, scheduled_on, started_on, ended_on",
    )
    .bind(specification_id)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?)
}

pub async fn get_solve(pool: &DbPool, id: i64) -> Result<Option<Solve>, DbError> {
    Ok(sqlx::query_as(
        "SELECT id, specification_id, scheduled_on, started_on, ended_on FROM solve WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?)
}

pub async fn mark_solve_started(pool: &DbPool, id: i64) -> Result<(), DbError> {
    sqlx::query("UPDATE solve SET started_on = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_solve_ended(pool: &DbPool, id: i64) -> Result<(), DbError> {
    sqlx::query("UPDATE solve SET ended_on = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn add_solve_package_build(
    pool: &DbPool,
    solve_id: i64,
    conda_package_build_id: i64,
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO solve_conda_package_build (solve_id, conda_package_build_id) \
         VALUES (?, ?) ON CONFLICT DO NOTHING",
    )
    .bind(solve_id)
    .bind(conda_package_build_id)
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// builds

const BUILD_COLUMNS: &str = "build.id, build.environment_id, build.specification_id, \
     build.status, build.status_info, build.size, build.scheduled_on, build.started_on, \
     build.ended_on, build.deleted_on";

/// Filters applied to build listings.
#[derive(Debug, Clone, Default)]
pub struct BuildFilter {
    pub status: Option<BuildStatus>,
    pub environment_id: Option<i64>,
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub artifact: Option<BuildArtifactType>,
    pub packages: Vec<String>,
    pub show_soft_deleted: bool,
}

fn push_build_from(query: &mut QueryBuilder<'_, Sqlite>, filter: &BuildFilter) {
    query.push(
        "FROM build JOIN environment ON environment.id = build.environment_id \
         JOIN namespace ON namespace.id = environment.namespace_id WHERE 1 = 1",
    );
    if let Some(status) = filter.status {
        query.push(" AND build.status = ").push_bind(status);
    }
    if let Some(environment_id) = filter.environment_id {
        query.push(" AND build.environment_id = ").push_bind(environment_id);
    }
    if let Some(name) = &filter.name {
        query.push(" AND environment.name = ").push_bind(name.clone());
    }
    if let Some(namespace) = &filter.namespace {
        query.push(" AND namespace.name = ").push_bind(namespace.clone());
    }
    if !filter.show_soft_deleted {
        query.push(" AND build.deleted_on IS NULL");
    }
    if let Some(artifact) = filter.artifact {
        query
            .push(" AND build.id IN (SELECT build_id FROM build_artifact WHERE artifact_type = ")
            .push_bind(artifact)
            .push(")");
    }
    if !filter.packages.is_empty() {
        push_packages_subquery(query, " AND build.id IN ", &filter.packages);
    }
}

pub async fn list_builds(pool: &DbPool, filter: &BuildFilter) -> Result<Vec<Build>, DbError> {
    let mut query = QueryBuilder::new("SELECT ");
    query.push(BUILD_COLUMNS).push(" ");
    push_build_from(&mut query, filter);
    query.push(" ORDER BY build.id");
    Ok(query.build_query_as().fetch_all(pool).await?)
}

fn build_scheduled_value(build: &Build) -> serde_json::Value {
    serde_json::Value::String(build.scheduled_on.format("%Y-%m-%d %H:%M:%S").to_string())
}

fn build_status_value(build: &Build) -> serde_json::Value {
    serde_json::Value::String(build.status.to_string())
}

fn build_id(build: &Build) -> i64 {
    build.id
}

/// The orderable keys of a build listing. Timestamps order through
/// `datetime()` so the cursor value and the stored text compare in the same
/// normalized form.
pub fn build_sort_columns() -> Vec<SortColumn<Build>> {
    vec![
        SortColumn {
            name: "scheduled_on",
            expr: "datetime(build.scheduled_on)",
            value: build_scheduled_value,
        },
        SortColumn {
            name: "status",
            expr: "build.status",
            value: build_status_value,
        },
    ]
}

/// Cursor-paged build listing.
pub async fn paginate_builds(
    pool: &DbPool,
    filter: &BuildFilter,
    sort_by: &[String],
    direction: SortDirection,
    limit: i64,
    cursor: Option<&str>,
) -> Result<Page<Build>, DbError> {
    let columns = build_sort_columns();
    paginate(
        pool,
        BUILD_COLUMNS,
        |query: &mut QueryBuilder<'_, Sqlite>| push_build_from(query, filter),
        "build.id",
        build_id,
        &columns,
        sort_by,
        direction,
        limit,
        cursor,
    )
    .await
}

pub async fn create_build(
    pool: &DbPool,
    environment_id: i64,
    specification_id: i64,
) -> Result<Build, DbError> {
    let mut query = QueryBuilder::new(
        "INSERT INTO build (environment_id, specification_id, status, scheduled_on) VALUES (",
    );
    let mut separated = query.separated(", ");
    separated.push_bind(environment_id);
    separated.push_bind(specification_id);
    separated.push_bind(BuildStatus::Queued);
    separated.push_bind(Utc::now());
    query.push(") RETURNING ").push(BUILD_COLUMNS_UNQUALIFIED);
    Ok(query.build_query_as().fetch_one(pool).await?)
}

const BUILD_COLUMNS_UNQUALIFIED: &str = "id, environment_id, specification_id, status, \
     status_info, size, scheduled_on, started_on, ended_on, deleted_on";

pub async fn get_build(pool: &DbPool, id: i64) -> Result<Option<Build>, DbError> {
    let mut query = QueryBuilder::new("SELECT ");
    query
        .push(BUILD_COLUMNS_UNQUALIFIED)
        .push(" FROM build WHERE id = ")
        .push_bind(id);
    Ok(query.build_query_as().fetch_optional(pool).await?)
}

pub async fn mark_build_started(pool: &DbPool, id: i64) -> Result<(), DbError> {
    sqlx::query("UPDATE build SET status = ?, started_on = ? WHERE id = ?")
        .bind(BuildStatus::Building)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_build_failed(
    pool: &DbPool,
    id: i64,
    status_info: Option<&str>,
) -> Result<(), DbError> {
    sqlx::query("UPDATE build SET status = ?, status_info = ?, ended_on = ? WHERE id = ?")
        .bind(BuildStatus::Failed)
        .bind(status_info)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_build_canceled(
    pool: &DbPool,
    id: i64,
    status_info: Option<&str>,
) -> Result<(), DbError> {
    sqlx::query("UPDATE build SET status = ?, status_info = ?, ended_on = ? WHERE id = ?")
        .bind(BuildStatus::Canceled)
        .bind(status_info)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Completes a build: terminal status, the `DIRECTORY` artifact pointing at
/// the install prefix, and the environment advanced to this build. One
/// transaction so observers never see a half-completed build.
pub async fn mark_build_completed(
    pool: &DbPool,
    id: i64,
    directory_key: &str,
) -> Result<(), DbError> {
    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE build SET status = ?, ended_on = ? WHERE id = ?")
        .bind(BuildStatus::Completed)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "INSERT INTO build_artifact (build_id, artifact_type, key) VALUES (?, ?, ?) \
         ON CONFLICT DO NOTHING",
    )
    .bind(id)
    .bind(BuildArtifactType::Directory)
    .bind(directory_key)
    .execute(&mut *tx)
    .await?;
    let build: (i64, i64) =
        sqlx::query_as("SELECT environment_id, specification_id FROM build WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
    sqlx::query("UPDATE environment SET current_build_id = ?, specification_id = ? WHERE id = ?")
        .bind(id)
        .bind(build.1)
        .bind(build.0)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn set_build_size(pool: &DbPool, id: i64, size: i64) -> Result<(), DbError> {
    sqlx::query("UPDATE build SET size = ? WHERE id = ?")
        .bind(size)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_build_packages(
    pool: &DbPool,
    build_id: i64,
    search: Option<&str>,
) -> Result<Vec<BuildPackage>, DbError> {
    let mut query = QueryBuilder::new(
        "SELECT conda_channel.name AS channel_name, conda_package.name, \
         conda_package.version, conda_package_build.build, \
         conda_package_build.build_number, conda_package_build.subdir, \
         conda_package_build.md5, conda_package_build.size \
         FROM build_conda_package_build \
         JOIN conda_package_build \
             ON conda_package_build.id = build_conda_package_build.conda_package_build_id \
         JOIN conda_package ON conda_package.id = conda_package_build.package_id \
         JOIN conda_channel ON conda_channel.id = conda_package.channel_id \
         WHERE build_conda_package_build.build_id = ",
    );
    query.push_bind(build_id);
    if let Some(search) = search {
        query
            .push(" AND conda_package.name LIKE ")
            .push_bind(like_contains(search))
            .push(" ESCAPE '\\'");
    }
    query.push(" ORDER BY conda_package.name");
    Ok(query.build_query_as().fetch_all(pool).await?)
}

/// Renders the legacy `@EXPLICIT` lockfile for a build from its indexed
/// packages.
pub async fn get_build_lockfile_legacy(
    pool: &DbPool,
    build_id: i64,
    platform: &str,
) -> Result<String, DbError> {
    let packages = get_build_packages(pool, build_id, None).await?;
    let lines: Vec<String> = packages
        .iter()
        .map(|package| {
            format!(
                "{}/{}/{}-{}-{}.tar.bz2#{}",
                package.channel_name,
                package.subdir,
                package.name,
                package.version,
                package.build,
                package.md5.as_deref().unwrap_or_default(),
            )
        })
        .collect();
    Ok(format!(
        "#platform: {}\n@EXPLICIT\n{}\n",
        platform,
        lines.join("\n")
    ))
}

// ---------------------------------------------------------------------------
// build artifacts

/// Registers an artifact row; re-registration of the same
/// `(build, key, type)` triple is a no-op so log appends stay cheap.
pub async fn ensure_build_artifact(
    pool: &DbPool,
    build_id: i64,
    artifact_type: BuildArtifactType,
    key: &str,
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO build_artifact (build_id, artifact_type, key) VALUES (?, ?, ?) \
         ON CONFLICT DO NOTHING",
    )
    .bind(build_id)
    .bind(artifact_type)
    .bind(key)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_build_artifact(
    pool: &DbPool,
    build_id: i64,
    key: &str,
) -> Result<Option<BuildArtifact>, DbError> {
    Ok(sqlx::query_as(
        "SELECT id, build_id, artifact_type, key FROM build_artifact \
         WHERE build_id = ? AND key = ?",
    )
    .bind(build_id)
    .bind(key)
    .fetch_optional(pool)
    .await?)
}

/// Filters applied to artifact listings.
#[derive(Debug, Clone, Default)]
pub struct BuildArtifactFilter {
    pub build_id: Option<i64>,
    pub key: Option<String>,
    pub included_artifact_types: Vec<BuildArtifactType>,
    pub excluded_artifact_types: Vec<BuildArtifactType>,
}

pub async fn list_build_artifacts(
    pool: &DbPool,
    filter: &BuildArtifactFilter,
) -> Result<Vec<BuildArtifact>, DbError> {
    let mut query =
        QueryBuilder::new("SELECT id, build_id, artifact_type, key FROM build_artifact WHERE 1 = 1");
    if let Some(build_id) = filter.build_id {
        query.push(" AND build_id = ").push_bind(build_id);
    }
    if let Some(key) = &filter.key {
        query.push(" AND key = ").push_bind(key.clone());
    }
    if !filter.included_artifact_types.is_empty() {
        query.push(" AND artifact_type IN (");
        let mut separated = query.separated(", ");
        for artifact_type in &filter.included_artifact_types {
            separated.push_bind(*artifact_type);
        }
        query.push(")");
    }
    if !filter.excluded_artifact_types.is_empty() {
        query.push(" AND artifact_type NOT IN (");
        let mut separated = query.separated(", ");
        for artifact_type in &filter.excluded_artifact_types {
            separated.push_bind(*artifact_type);
        }
        query.push(")");
    }
    query.push(" ORDER BY id");
    Ok(query.build_query_as().fetch_all(pool).await?)
}

pub async fn get_build_artifact_types(
    pool: &DbPool,
    build_id: i64,
) -> Result<Vec<BuildArtifactType>, DbError> {
    let rows: Vec<(BuildArtifactType,)> = sqlx::query_as(
        "SELECT DISTINCT artifact_type FROM build_artifact WHERE build_id = ? ORDER BY artifact_type",
    )
    .bind(build_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|row| row.0).collect())
}

pub async fn delete_build_artifact(
    pool: &DbPool,
    build_id: i64,
    key: &str,
) -> Result<(), DbError> {
    sqlx::query("DELETE FROM build_artifact WHERE build_id = ? AND key = ?")
        .bind(build_id)
        .bind(key)
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// conda channels and packages

pub async fn get_conda_channel(
    pool: &DbPool,
    name: &str,
) -> Result<Option<CondaChannel>, DbError> {
    Ok(
        sqlx::query_as("SELECT id, name, last_update FROM conda_channel WHERE name = ?")
            .bind(name)
            .fetch_optional(pool)
            .await?,
    )
}

pub async fn ensure_conda_channel(pool: &DbPool, name: &str) -> Result<CondaChannel, DbError> {
    sqlx::query("INSERT INTO conda_channel (name) VALUES (?) ON CONFLICT DO NOTHING")
        .bind(name)
        .execute(pool)
        .await?;
    get_conda_channel(pool, name)
        .await?
        .ok_or_else(|| DbError::not_found(format!("conda channel '{name}'")))
}

pub async fn list_conda_channels(pool: &DbPool) -> Result<Vec<CondaChannel>, DbError> {
    Ok(
        sqlx::query_as("SELECT id, name, last_update FROM conda_channel ORDER BY name")
            .fetch_all(pool)
            .await?,
    )
}

/// One package entry out of a solved lockfile, ready for indexing.
#[derive(Debug, Clone)]
pub struct CondaPackageRecord {
    pub channel: String,
    pub name: String,
    pub version: String,
    pub license: Option<String>,
    pub license_family: Option<String>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub build: String,
    pub build_number: i64,
    pub subdir: String,
    pub sha256: Option<String>,
    pub md5: Option<String>,
    pub size: i64,
    pub depends: serde_json::Value,
    pub constrains: serde_json::Value,
    pub timestamp: Option<i64>,
}

const CONDA_PACKAGE_COLUMNS: &str =
    "id, channel_id, name, version, license, license_family, summary, description";

pub async fn get_conda_package(
    pool: &DbPool,
    channel_id: i64,
    name: &str,
    version: &str,
) -> Result<Option<CondaPackage>, DbError> {
    let mut query = QueryBuilder::new("SELECT ");
    query
        .push(CONDA_PACKAGE_COLUMNS)
        .push(" FROM conda_package WHERE channel_id = ")
        .push_bind(channel_id)
        .push(" AND name = ")
        .push_bind(name)
        .push(" AND version = ")
        .push_bind(version);
    Ok(query.build_query_as().fetch_optional(pool).await?)
}

const CONDA_PACKAGE_BUILD_COLUMNS: &str = "id, package_id, build, build_number, subdir, \
     sha256, md5, size, depends, constrains, timestamp";

pub async fn get_conda_package_build(
    pool: &DbPool,
    package_id: i64,
    subdir: &str,
    build: &str,
) -> Result<Option<CondaPackageBuild>, DbError> {
    let mut query = QueryBuilder::new("SELECT ");
    query
        .push(CONDA_PACKAGE_BUILD_COLUMNS)
        .push(" FROM conda_package_build WHERE package_id = ")
        .push_bind(package_id)
        .push(" AND subdir = ")
        .push_bind(subdir)
        .push(" AND build = ")
        .push_bind(build);
    Ok(query.build_query_as().fetch_optional(pool).await?)
}

/// Upserts the channel, package and package-build rows for one lockfile
/// entry. PyPI pseudo-channel entries are ignored.
pub async fn create_or_ignore_conda_package(
    pool: &DbPool,
    record: &CondaPackageRecord,
) -> Result<Option<CondaPackageBuild>, DbError> {
    if record.channel == "https://conda.anaconda.org/pypi" {
        return Ok(None);
    }

    let channel = ensure_conda_channel(pool, &record.channel).await?;

    let package = match get_conda_package(pool, channel.id, &record.name, &record.version).await? {
        Some(package) => package,
        None => {
            sqlx::query(
                "INSERT INTO conda_package \
                 (channel_id, name, version, license, license_family, summary, description) \
                 VALUES (?, ?, ?, ?, ?, ?, ?) ON CONFLICT DO NOTHING",
            )
            .bind(channel.id)
            .bind(&record.name)
            .bind(&record.version)
            .bind(&record.license)
            .bind(&record.license_family)
            .bind(&record.summary)
            .bind(&record.description)
            .execute(pool)
            .await?;
            get_conda_package(pool, channel.id, &record.name, &record.version)
                .await?
                .ok_or_else(|| DbError::not_found(format!("conda package '{}'", record.name)))?
        }
    };

    let package_build =
        match get_conda_package_build(pool, package.id, &record.subdir, &record.build).await? {
            Some(package_build) => package_build,
            None => {
                sqlx::query(
                    "INSERT INTO conda_package_build \
                     (package_id, build, build_number, subdir, sha256, md5, size, depends, \
                      constrains, timestamp) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT DO NOTHING",
                )
                .bind(package.id)
                .bind(&record.build)
                .bind(record.build_number)
                .bind(&record.subdir)
                .bind(&record.sha256)
                .bind(&record.md5)
                .bind(record.size)
                .bind(sqlx::types::Json(&record.depends))
                .bind(sqlx::types::Json(&record.constrains))
                .bind(record.timestamp)
                .execute(pool)
                .await?;
                get_conda_package_build(pool, package.id, &record.subdir, &record.build)
                    .await?
                    .ok_or_else(|| {
                        DbError::not_found(format!("conda package build '{}'", record.build))
                    })?
            }
        };

    Ok(Some(package_build))
}

/// Attaches an indexed package build to the build that installed it.
pub async fn add_build_package_build(
    pool: &DbPool,
    build_id: i64,
    conda_package_build_id: i64,
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO build_conda_package_build (build_id, conda_package_build_id) \
         VALUES (?, ?) ON CONFLICT DO NOTHING",
    )
    .bind(build_id)
    .bind(conda_package_build_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_conda_packages(
    pool: &DbPool,
    search: Option<&str>,
    exact: bool,
) -> Result<Vec<CondaPackage>, DbError> {
    let mut query = QueryBuilder::new("SELECT ");
    query.push(CONDA_PACKAGE_COLUMNS).push(" FROM conda_package WHERE 1 = 1");
    if let Some(search) = search {
        if exact {
            query.push(" AND name = ").push_bind(search);
        } else {
            query
                .push(" AND name LIKE ")
                .push_bind(like_contains(search))
                .push(" ESCAPE '\\'");
        }
    }
    query.push(" ORDER BY name, version");
    Ok(query.build_query_as().fetch_all(pool).await?)
}

// ---------------------------------------------------------------------------
// metrics and key-value settings

pub async fn get_namespace_metrics(pool: &DbPool) -> Result<Vec<NamespaceMetrics>, DbError> {
    Ok(sqlx::query_as(
        "SELECT namespace.name AS namespace, \
         COUNT(DISTINCT environment.id) AS environment_count, \
         COUNT(DISTINCT build.id) AS build_count, \
         COALESCE(SUM(build.size), 0) AS storage_used \
         FROM build \
         JOIN environment ON environment.id = build.environment_id \
         JOIN namespace ON namespace.id = environment.namespace_id \
         GROUP BY namespace.name ORDER BY namespace.name",
    )
    .fetch_all(pool)
    .await?)
}

/// Effective key/values stored under a settings prefix.
pub async fn get_kvstore_key_values(
    pool: &DbPool,
    prefix: &str,
) -> Result<BTreeMap<String, String>, DbError> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT key, value FROM keyvaluestore WHERE prefix = ?")
            .bind(prefix)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().collect())
}

/// Stores key/values under a prefix. With `update` false existing keys are
/// left alone.
pub async fn set_kvstore_key_values(
    pool: &DbPool,
    prefix: &str,
    values: &BTreeMap<String, String>,
    update: bool,
) -> Result<(), DbError> {
    for (key, value) in values {
        if update {
            sqlx::query(
                "INSERT INTO keyvaluestore (prefix, key, value) VALUES (?, ?, ?) \
                 ON CONFLICT (prefix, key) DO UPDATE SET value = excluded.value",
            )
        } else {
            sqlx::query(
                "INSERT INTO keyvaluestore (prefix, key, value) VALUES (?, ?, ?) \
                 ON CONFLICT (prefix, key) DO NOTHING",
            )
        }
        .bind(prefix)
        .bind(key)
        .bind(value)
        .execute(pool)
        .await?;
    }
    Ok(())
}
