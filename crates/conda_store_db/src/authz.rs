//! Compiles role bindings into database predicates.
//!
//! A role binding key is a glob pair `ns-glob/env-glob`. Any binding grants
//! visibility of the environments it matches; role *levels* are enforced by
//! the caller, not here. The globs translate to SQL `LIKE` patterns which are
//! OR-ed together and AND-ed onto the listing query.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::{QueryBuilder, Sqlite};

use crate::DbError;

/// Map of `"ns-glob/env-glob"` to the roles granted on matching objects.
pub type RoleBindings = BTreeMap<String, Vec<String>>;

/// The characters permitted in a role binding pattern: name characters plus
/// the `*` and `?` wildcards, one `/` separating the two globs.
pub static ARN_ALLOWED_REGEX: Lazy<Regex> = Lazy::new(|| {
    let allowed = conda_store_types::ALLOWED_CHARACTERS;
    Regex::new(&format!("^([{allowed}*?]+)/([{allowed}*?]+)$")).expect("valid regex")
});

/// Splits a role binding key into its namespace and environment globs and
/// translates each into a SQL `LIKE` pattern (`*` to `%`, `?` to `_`).
pub fn compile_arn_sql_like(arn: &str) -> Result<(String, String), DbError> {
    let captures = ARN_ALLOWED_REGEX
        .captures(arn)
        .ok_or_else(|| DbError::InvalidRoleBinding {
            pattern: arn.to_string(),
        })?;
    let translate = |glob: &str| glob.replace('*', "%").replace('?', "_");
    Ok((translate(&captures[1]), translate(&captures[2])))
}

/// Validates and translates every binding key up front, so that query
/// assembly itself cannot fail halfway through.
pub fn compile_role_bindings(
    role_bindings: &RoleBindings,
) -> Result<Vec<(String, String)>, DbError> {
    role_bindings.keys().map(|arn| compile_arn_sql_like(arn)).collect()
}

/// Appends the role-binding visibility predicate to an environment listing
/// query. Empty bindings match nothing.
pub fn push_role_binding_filter<'a>(
    query: &mut QueryBuilder<'a, Sqlite>,
    compiled: &[(String, String)],
) {
    if compiled.is_empty() {
        query.push(" AND 1 = 0");
        return;
    }

    query.push(" AND (");
    for (i, (namespace_like, environment_like)) in compiled.iter().enumerate() {
        if i > 0 {
            query.push(" OR ");
        }
        query.push("(namespace.name LIKE ");
        query.push_bind(namespace_like.clone());
        query.push(" AND environment.name LIKE ");
        query.push_bind(environment_like.clone());
        query.push(")");
    }
    query.push(")");
}

/// Normalizes a role name; `editor` is the legacy spelling of `developer`.
pub fn normalize_role(role: &str) -> Result<String, DbError> {
    match role.to_lowercase().as_str() {
        "editor" => Ok("developer".to_string()),
        normalized @ ("viewer" | "developer" | "admin") => Ok(normalized.to_string()),
        _ => Err(DbError::InvalidRole {
            role: role.to_string(),
        }),
    }
}
