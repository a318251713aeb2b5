use std::collections::BTreeMap;

use assert_matches::assert_matches;
use similar_asserts::assert_eq;

use conda_store_db::api::{self, BuildFilter, EnvironmentFilter};
use conda_store_db::authz::RoleBindings;
use conda_store_db::entities::{BuildArtifactType, BuildStatus};
use conda_store_db::pagination::SortDirection;
use conda_store_db::{DbError, DbPool};
use conda_store_types::Specification;

async fn test_pool() -> (tempfile::TempDir, DbPool) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("conda-store.db").display());
    let pool = conda_store_db::connect(&url).await.unwrap();
    (dir, pool)
}

fn specification(name: &str, dependencies: &[&str]) -> Specification {
    Specification::parse(&serde_json::json!({
        "name": name,
        "channels": ["conda-forge"],
        "dependencies": dependencies,
    }))
    .unwrap()
}

#[tokio::test]
async fn namespace_lifecycle() {
    let (_dir, pool) = test_pool().await;

    let namespace = api::ensure_namespace(&pool, "analytics").await.unwrap();
    let again = api::ensure_namespace(&pool, "analytics").await.unwrap();
    assert_eq!(namespace.id, again.id);

    assert_matches!(
        api::create_namespace(&pool, "not/allowed").await,
        Err(DbError::InvalidName { .. })
    );

    api::update_namespace_metadata(&pool, "analytics", &serde_json::json!({"team": "ds"}))
        .await
        .unwrap();
    let namespace = api::get_namespace(&pool, "analytics").await.unwrap().unwrap();
    assert_eq!(namespace.metadata.0["team"], "ds");

    api::ensure_namespace(&pool, "scratch").await.unwrap();
    api::mark_namespace_deleted(&pool, "scratch").await.unwrap();
    let visible = api::list_namespaces(&pool, false).await.unwrap();
    assert_eq!(visible.len(), 1);
    let all = api::list_namespaces(&pool, true).await.unwrap();
    assert_eq!(all.len(), 2);

    api::delete_namespace(&pool, "analytics").await.unwrap();
    assert!(api::get_namespace(&pool, "analytics").await.unwrap().is_none());
}

#[tokio::test]
async fn specifications_deduplicate_by_content_hash() {
    let (_dir, pool) = test_pool().await;

    let first = api::ensure_specification(&pool, &specification("a", &["python=3.11"]))
        .await
        .unwrap();
    let second = api::ensure_specification(&pool, &specification("a", &["python=3.11"]))
        .await
        .unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(first.sha256, second.sha256);

    let listed = api::list_specifications(&pool, None).await.unwrap();
    assert_eq!(listed.len(), 1);

    let different = api::ensure_specification(&pool, &specification("a", &["python=3.12"]))
        .await
        .unwrap();
    assert_ne!(different.id, first.id);
}

#[tokio::test]
async fn build_lifecycle_updates_environment() {
    let (_dir, pool) = test_pool().await;

    let namespace = api::ensure_namespace(&pool, "default").await.unwrap();
    let environment = api::ensure_environment(&pool, namespace.id, "a", Some("env a"))
        .await
        .unwrap();
    let spec = api::ensure_specification(&pool, &specification("a", &["python=3.11"]))
        .await
        .unwrap();
    let build = api::create_build(&pool, environment.id, spec.id).await.unwrap();

    assert_eq!(build.status, BuildStatus::Queued);
    assert!(build.started_on.is_none() && build.ended_on.is_none());

    api::mark_build_started(&pool, build.id).await.unwrap();
    let building = api::get_build(&pool, build.id).await.unwrap().unwrap();
    assert_eq!(building.status, BuildStatus::Building);
    assert!(building.started_on.is_some());
    assert!(building.ended_on.is_none());

    api::ensure_build_artifact(&pool, build.id, BuildArtifactType::Logs, "logs/x.log")
        .await
        .unwrap();
    // Log artifacts re-register under the same key on every append.
    api::ensure_build_artifact(&pool, build.id, BuildArtifactType::Logs, "logs/x.log")
        .await
        .unwrap();

    api::mark_build_completed(&pool, build.id, "/opt/conda-store/prefix")
        .await
        .unwrap();
    let completed = api::get_build(&pool, build.id).await.unwrap().unwrap();
    assert_eq!(completed.status, BuildStatus::Completed);
    assert!(completed.ended_on.is_some());

    let environment = api::get_environment(&pool, "default", "a").await.unwrap().unwrap();
    assert_eq!(environment.current_build_id, Some(build.id));
    assert_eq!(environment.specification_id, Some(spec.id));

    let artifact_types = api::get_build_artifact_types(&pool, build.id).await.unwrap();
    assert!(artifact_types.contains(&BuildArtifactType::Directory));
    assert!(artifact_types.contains(&BuildArtifactType::Logs));
    assert_eq!(
        api::list_build_artifacts(
            &pool,
            &api::BuildArtifactFilter {
                build_id: Some(build.id),
                included_artifact_types: vec![BuildArtifactType::Logs],
                ..Default::default()
            }
        )
        .await
        .unwrap()
        .len(),
        1
    );
}

#[tokio::test]
async fn failed_builds_record_status_info() {
    let (_dir, pool) = test_pool().await;

    let namespace = api::ensure_namespace(&pool, "default").await.unwrap();
    let environment = api::ensure_environment(&pool, namespace.id, "a", None).await.unwrap();
    let spec = api::ensure_specification(&pool, &specification("a", &["python"]))
        .await
        .unwrap();
    let build = api::create_build(&pool, environment.id, spec.id).await.unwrap();

    api::mark_build_started(&pool, build.id).await.unwrap();
    api::mark_build_failed(&pool, build.id, Some("build path too long"))
        .await
        .unwrap();

    let failed = api::get_build(&pool, build.id).await.unwrap().unwrap();
    assert_eq!(failed.status, BuildStatus::Failed);
    assert_eq!(failed.status_info.as_deref(), Some("build path too long"));
    assert!(failed.ended_on.is_some());

    // A failed build never becomes the environment's current build.
    let environment = api::get_environment(&pool, "default", "a").await.unwrap().unwrap();
    assert_eq!(environment.current_build_id, None);

    let queued = api::list_builds(
        &pool,
        &BuildFilter {
            status: Some(BuildStatus::Failed),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(queued.len(), 1);
}

async fn seed_environments(pool: &DbPool, counts: &[(&str, usize)]) {
    for (namespace_name, count) in counts {
        let namespace = api::ensure_namespace(pool, namespace_name).await.unwrap();
        for i in 0..*count {
            api::ensure_environment(pool, namespace.id, &format!("env-{i:02}"), None)
                .await
                .unwrap();
        }
    }
}

#[tokio::test]
async fn pagination_visits_each_row_exactly_once() {
    let (_dir, pool) = test_pool().await;
    seed_environments(&pool, &[("alpha", 9), ("beta", 8), ("gamma", 8)]).await;

    let sort_by = vec!["namespace".to_string(), "name".to_string()];
    let mut cursor: Option<String> = None;
    let mut pages = Vec::new();
    let mut seen = Vec::new();

    loop {
        let page = api::paginate_environments(
            &pool,
            &EnvironmentFilter::default(),
            None,
            &sort_by,
            SortDirection::Ascending,
            10,
            cursor.as_deref(),
        )
        .await
        .unwrap();
        assert_eq!(page.count, 25);
        pages.push(page.rows.len());
        seen.extend(
            page.rows
                .iter()
                .map(|row| (row.namespace_name.clone(), row.name.clone(), row.id)),
        );
        match page.cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    assert_eq!(pages, vec![10, 10, 5]);

    let mut expected = seen.clone();
    expected.sort();
    assert_eq!(seen, expected, "rows arrived out of declared order");
    expected.dedup();
    assert_eq!(expected.len(), 25, "a row was skipped or duplicated");
}

#[tokio::test]
async fn pagination_breaks_ties_with_the_id_column() {
    let (_dir, pool) = test_pool().await;
    // Identical environment names across namespaces tie on the name column.
    for namespace_name in ["n1", "n2", "n3", "n4", "n5"] {
        let namespace = api::ensure_namespace(&pool, namespace_name).await.unwrap();
        api::ensure_environment(&pool, namespace.id, "web", None).await.unwrap();
    }

    let sort_by = vec!["name".to_string()];
    let mut ids = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = api::paginate_environments(
            &pool,
            &EnvironmentFilter::default(),
            None,
            &sort_by,
            SortDirection::Ascending,
            2,
            cursor.as_deref(),
        )
        .await
        .unwrap();
        ids.extend(page.rows.iter().map(|row| row.id));
        match page.cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    let mut expected = ids.clone();
    expected.sort_unstable();
    expected.dedup();
    assert_eq!(ids, expected);
    assert_eq!(ids.len(), 5);
}

#[tokio::test]
async fn pagination_descending_reverses_order() {
    let (_dir, pool) = test_pool().await;
    seed_environments(&pool, &[("alpha", 5)]).await;

    let page = api::paginate_environments(
        &pool,
        &EnvironmentFilter::default(),
        None,
        &["name".to_string()],
        SortDirection::Descending,
        3,
        None,
    )
    .await
    .unwrap();
    let names: Vec<&str> = page.rows.iter().map(|row| row.name.as_str()).collect();
    assert_eq!(names, vec!["env-04", "env-03", "env-02"]);

    let page = api::paginate_environments(
        &pool,
        &EnvironmentFilter::default(),
        None,
        &["name".to_string()],
        SortDirection::Descending,
        3,
        page.cursor.as_deref(),
    )
    .await
    .unwrap();
    let names: Vec<&str> = page.rows.iter().map(|row| row.name.as_str()).collect();
    assert_eq!(names, vec!["env-01", "env-00"]);
    assert!(page.cursor.is_none());
}

#[tokio::test]
async fn invalid_sort_name_is_rejected() {
    let (_dir, pool) = test_pool().await;
    assert_matches!(
        api::paginate_environments(
            &pool,
            &EnvironmentFilter::default(),
            None,
            &["nope".to_string()],
            SortDirection::Ascending,
            10,
            None,
        )
        .await,
        Err(DbError::InvalidSortBy { .. })
    );
}

#[tokio::test]
async fn role_bindings_scope_environment_listings() {
    let (_dir, pool) = test_pool().await;
    let prod = api::ensure_namespace(&pool, "prod").await.unwrap();
    let dev = api::ensure_namespace(&pool, "dev").await.unwrap();
    api::ensure_environment(&pool, prod.id, "api", None).await.unwrap();
    api::ensure_environment(&pool, prod.id, "web-site", None).await.unwrap();
    api::ensure_environment(&pool, dev.id, "web-site", None).await.unwrap();
    api::ensure_environment(&pool, dev.id, "scratch", None).await.unwrap();

    let mut bindings = RoleBindings::new();
    bindings.insert("prod/*".to_string(), vec!["viewer".to_string()]);
    bindings.insert("dev/web-*".to_string(), vec!["viewer".to_string()]);

    let visible =
        api::list_environments(&pool, &EnvironmentFilter::default(), Some(&bindings))
            .await
            .unwrap();
    let mut names: Vec<(String, String)> = visible
        .iter()
        .map(|environment| (environment.namespace_name.clone(), environment.name.clone()))
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec![
            ("dev".to_string(), "web-site".to_string()),
            ("prod".to_string(), "api".to_string()),
            ("prod".to_string(), "web-site".to_string()),
        ]
    );

    // Overlapping bindings must not duplicate rows.
    bindings.insert("*/*".to_string(), vec!["viewer".to_string()]);
    let visible =
        api::list_environments(&pool, &EnvironmentFilter::default(), Some(&bindings))
            .await
            .unwrap();
    assert_eq!(visible.len(), 4);

    // Empty bindings expose nothing; absent bindings expose everything.
    let nothing =
        api::list_environments(&pool, &EnvironmentFilter::default(), Some(&RoleBindings::new()))
            .await
            .unwrap();
    assert!(nothing.is_empty());
    let everything = api::list_environments(&pool, &EnvironmentFilter::default(), None)
        .await
        .unwrap();
    assert_eq!(everything.len(), 4);
}

#[tokio::test]
async fn namespace_role_names_normalize() {
    let (_dir, pool) = test_pool().await;
    api::ensure_namespace(&pool, "this").await.unwrap();
    api::ensure_namespace(&pool, "other").await.unwrap();

    api::create_namespace_role(&pool, "this", "other", "editor").await.unwrap();
    let roles = api::get_namespace_roles(&pool, "this").await.unwrap();
    assert_eq!(roles.len(), 1);
    assert_eq!(roles[0].role, "developer");
    assert_eq!(roles[0].other_namespace, "other");

    api::update_namespace_role(&pool, "this", "other", "admin").await.unwrap();
    let role = api::get_namespace_role(&pool, "this", "other").await.unwrap().unwrap();
    assert_eq!(role.role, "admin");

    let reverse = api::get_other_namespace_roles(&pool, "other").await.unwrap();
    assert_eq!(reverse.len(), 1);

    assert_matches!(
        api::create_namespace_role(&pool, "this", "other", "root").await,
        Err(DbError::InvalidRole { .. })
    );

    api::delete_namespace_role(&pool, "this", "other").await.unwrap();
    assert!(api::get_namespace_roles(&pool, "this").await.unwrap().is_empty());
}

fn package_record(name: &str, version: &str, build: &str) -> api::CondaPackageRecord {
    api::CondaPackageRecord {
        channel: "https://conda.anaconda.org/conda-forge".to_string(),
        name: name.to_string(),
        version: version.to_string(),
        license: Some("BSD-3-Clause".to_string()),
        license_family: None,
        summary: None,
        description: None,
        build: build.to_string(),
        build_number: 0,
        subdir: "linux-64".to_string(),
        sha256: Some("0".repeat(64)),
        md5: Some("d41d8cd98f00b204e9800998ecf8427e".to_string()),
        size: 1024,
        depends: serde_json::json!([]),
        constrains: serde_json::json!([]),
        timestamp: None,
    }
}

#[tokio::test]
async fn package_indexing_and_filters() {
    let (_dir, pool) = test_pool().await;
    let namespace = api::ensure_namespace(&pool, "default").await.unwrap();
    let environment = api::ensure_environment(&pool, namespace.id, "a", None).await.unwrap();
    let spec = api::ensure_specification(&pool, &specification("a", &["python"]))
        .await
        .unwrap();
    let build = api::create_build(&pool, environment.id, spec.id).await.unwrap();

    for (name, version, build_str) in [
        ("python", "3.11.4", "h06a4308_0"),
        ("numpy", "1.26.0", "py311_0"),
    ] {
        let package_build =
            api::create_or_ignore_conda_package(&pool, &package_record(name, version, build_str))
                .await
                .unwrap()
                .unwrap();
        api::add_build_package_build(&pool, build.id, package_build.id).await.unwrap();
    }

    // Upserting the same record twice does not duplicate.
    let duplicate = api::create_or_ignore_conda_package(
        &pool,
        &package_record("python", "3.11.4", "h06a4308_0"),
    )
    .await
    .unwrap()
    .unwrap();
    api::add_build_package_build(&pool, build.id, duplicate.id).await.unwrap();

    // PyPI pseudo-channel entries are skipped.
    let mut pypi = package_record("requests", "2.32.0", "pypi_0");
    pypi.channel = "https://conda.anaconda.org/pypi".to_string();
    assert!(api::create_or_ignore_conda_package(&pool, &pypi).await.unwrap().is_none());

    let packages = api::get_build_packages(&pool, build.id, None).await.unwrap();
    assert_eq!(packages.len(), 2);

    api::mark_build_completed(&pool, build.id, "/prefix").await.unwrap();

    let both = api::list_environments(
        &pool,
        &EnvironmentFilter {
            packages: vec!["python".to_string(), "numpy".to_string()],
            ..Default::default()
        },
        None,
    )
    .await
    .unwrap();
    assert_eq!(both.len(), 1);

    let missing = api::list_environments(
        &pool,
        &EnvironmentFilter {
            packages: vec!["python".to_string(), "pandas".to_string()],
            ..Default::default()
        },
        None,
    )
    .await
    .unwrap();
    assert!(missing.is_empty());

    let lockfile = api::get_build_lockfile_legacy(&pool, build.id, "linux-64")
        .await
        .unwrap();
    assert!(lockfile.starts_with("#platform: linux-64\n@EXPLICIT\n"));
    assert!(lockfile.contains(
        "https://conda.anaconda.org/conda-forge/linux-64/python-3.11.4-h06a4308_0.tar.bz2#"
    ));

    let metrics = api::get_namespace_metrics(&pool).await.unwrap();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].namespace, "default");
    assert_eq!(metrics[0].environment_count, 1);
    assert_eq!(metrics[0].build_count, 1);
}

#[tokio::test]
async fn kvstore_prefix_scoping() {
    let (_dir, pool) = test_pool().await;

    let mut values = BTreeMap::new();
    values.insert("conda_command".to_string(), "\"conda\"".to_string());
    api::set_kvstore_key_values(&pool, "setting", &values, true).await.unwrap();

    let mut scoped = BTreeMap::new();
    scoped.insert("conda_command".to_string(), "\"mamba\"".to_string());
    api::set_kvstore_key_values(&pool, "setting/analytics", &scoped, true)
        .await
        .unwrap();

    let global = api::get_kvstore_key_values(&pool, "setting").await.unwrap();
    assert_eq!(global["conda_command"], "\"conda\"");
    let scoped = api::get_kvstore_key_values(&pool, "setting/analytics").await.unwrap();
    assert_eq!(scoped["conda_command"], "\"mamba\"");

    // update = false leaves existing keys alone
    let mut values = BTreeMap::new();
    values.insert("conda_command".to_string(), "\"micromamba\"".to_string());
    api::set_kvstore_key_values(&pool, "setting", &values, false).await.unwrap();
    let global = api::get_kvstore_key_values(&pool, "setting").await.unwrap();
    assert_eq!(global["conda_command"], "\"conda\"");
}

#[tokio::test]
async fn solve_lifecycle() {
    let (_dir, pool) = test_pool().await;
    let spec = api::ensure_specification(&pool, &specification("a", &["python"]))
        .await
        .unwrap();
    let solve = api::create_solve(&pool, spec.id).await.unwrap();
    assert!(solve.started_on.is_none());

    api::mark_solve_started(&pool, solve.id).await.unwrap();
    let package_build =
        api::create_or_ignore_conda_package(&pool, &package_record("python", "3.11.4", "h0_0"))
            .await
            .unwrap()
            .unwrap();
    api::add_solve_package_build(&pool, solve.id, package_build.id).await.unwrap();
    api::mark_solve_ended(&pool, solve.id).await.unwrap();

    let solve = api::get_solve(&pool, solve.id).await.unwrap().unwrap();
    assert!(solve.started_on.is_some() && solve.ended_on.is_some());
}
