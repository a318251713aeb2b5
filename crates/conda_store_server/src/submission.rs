//! The submission pipeline: a user supplied document becomes a validated,
//! policy-checked, deduplicated specification plus a queued build or solve.

use serde_json::Value;

use conda_store_db::{api, DbPool};
use conda_store_types as types;

use crate::error::CondaStoreError;
use crate::settings::Settings;
use crate::store::CondaStore;
use crate::worker::{Task, TaskQueue};

/// Parses, validates and policy-checks a submitted document against the
/// settings in scope. Lockfile specifications skip the policies; they are
/// installed as-is.
fn validate_specification(
    settings: &Settings,
    submitted: &Value,
) -> Result<types::Specification, CondaStoreError> {
    let specification = types::Specification::parse(submitted)?;
    match specification {
        types::Specification::Conda(mut spec) => {
            types::apply_channel_policy(&mut spec, &settings.channel_policy()?)?;
            types::apply_conda_package_policy(&mut spec, &settings.conda_package_policy())?;
            types::apply_pip_package_policy(&mut spec, &settings.pypi_package_policy())?;
            Ok(types::Specification::Conda(spec))
        }
        lockfile @ types::Specification::Lockfile(_) => Ok(lockfile),
    }
}

/// Registers an environment build: the specification is validated and
/// deduplicated by content hash, the namespace/environment rows are ensured
/// and a `QUEUED` build is created. Returns the build id.
///
/// Submitting the same document twice yields one specification row and two
/// distinct builds.
pub async fn register_environment(
    store: &CondaStore,
    db: &DbPool,
    namespace: &str,
    submitted: &Value,
    queue: Option<&TaskQueue>,
) -> Result<i64, CondaStoreError> {
    // Resolve scoped settings by the environment name carried in the
    // document itself; parsing happens before policy for exactly that.
    let name = submitted
        .get("name")
        .and_then(Value::as_str)
        .map(ToString::to_string);
    let settings = store
        .get_settings(db, Some(namespace), name.as_deref())
        .await?;

    let specification = validate_specification(&settings, submitted)?;

    let namespace_row = api::ensure_namespace(db, namespace).await?;
    let specification_row = api::ensure_specification(db, &specification).await?;
    let environment = api::ensure_environment(
        db,
        namespace_row.id,
        specification.name(),
        None,
    )
    .await?;
    let build = api::create_build(db, environment.id, specification_row.id).await?;

    if let Some(queue) = queue {
        queue.submit(Task::BuildEnvironment { build_id: build.id });
    }
    tracing::info!(
        build_id = build.id,
        namespace,
        environment = specification.name(),
        sha256 = %specification_row.sha256,
        "registered environment build"
    );
    Ok(build.id)
}

/// Registers a solve-only request and returns the solve id.
pub async fn register_solve(
    store: &CondaStore,
    db: &DbPool,
    submitted: &Value,
    queue: Option<&TaskQueue>,
) -> Result<i64, CondaStoreError> {
    let settings = store.get_settings(db, None, None).await?;
    let specification = validate_specification(&settings, submitted)?;
    let specification_row = api::ensure_specification(db, &specification).await?;
    let solve = api::create_solve(db, specification_row.id).await?;

    if let Some(queue) = queue {
        queue.submit(Task::SolveEnvironment { solve_id: solve.id });
    }
    Ok(solve.id)
}
