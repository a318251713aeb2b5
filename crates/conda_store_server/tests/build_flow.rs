//! End-to-end build pipeline tests against fake external tools.
//!
//! The conda / conda-lock / conda-pack / constructor executables are shell
//! scripts on a private PATH entry that emit canned output, so the whole
//! orchestrator runs for real: state machine, log append, storage, package
//! indexing and artifact production.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;

use conda_store_db::api::{self, BuildArtifactFilter};
use conda_store_db::entities::{BuildArtifactType, BuildStatus};
use conda_store_db::DbPool;
use conda_store_server::plugins::ScopedLocker;
use conda_store_server::submission::{register_environment, register_solve};
use conda_store_server::worker::build::{append_to_logs, build_conda_environment, BuildContext};
use conda_store_server::worker::reaper::build_cleanup;
use conda_store_server::worker::{ActiveTasks, TaskInventory, Worker};
use conda_store_server::{CondaStore, Settings};

/// Directory with the fake executables, prepended to PATH exactly once.
static TOOLS: Lazy<PathBuf> = Lazy::new(|| {
    let dir = std::env::temp_dir().join(format!("conda-store-fake-tools-{}", std::process::id()));
    fs_err::create_dir_all(&dir).unwrap();

    let platform = conda_store_types::current_platform();
    let lockfile = serde_json::json!({
        "version": 1,
        "metadata": {"platforms": [platform]},
        "package": [
            {
                "name": "python",
                "version": "3.11.4",
                "manager": "conda",
                "platform": platform,
                "dependencies": {},
                "url": format!(
                    "https://conda.anaconda.org/conda-forge/{platform}/python-3.11.4-h06a4308_1.conda"
                ),
                "hash": {
                    "md5": "a75683f8d9f5b58c19a8ec5d0b7f796e",
                    "sha256": "1fe3c3f4250e51886838e8e0287e39029d601b9f493ea05c37a2630a9fe5810f"
                },
                "category": "main",
                "optional": false
            },
            {
                "name": "numpy",
                "version": "1.26.0",
                "manager": "conda",
                "platform": platform,
                "dependencies": {"python": ">=3.11"},
                "url": format!(
                    "https://conda.anaconda.org/conda-forge/{platform}/numpy-1.26.0-py311_0.tar.bz2"
                ),
                "hash": {"md5": "b75683f8d9f5b58c19a8ec5d0b7f796e"},
                "category": "main",
                "optional": false
            }
        ]
    });
    fs_err::write(
        dir.join("fixture-lock.yaml"),
        serde_yaml::to_string(&lockfile).unwrap(),
    )
    .unwrap();

    let scripts: &[(&str, &str)] = &[
        (
            "conda",
            concat!(
                "#!/bin/sh\n",
                "case \"$1\" in\n",
                "  info) echo \"fake conda info\" ;;\n",
                "  create) exit 0 ;;\n",
                "  env) echo '{\"name\": \"fake\", \"channels\": [\"conda-forge\"], ",
                "\"dependencies\": [\"python=3.11.4\"]}' ;;\n",
                "  *) exit 0 ;;\n",
                "esac\n",
            ),
        ),
        (
            "conda-lock",
            concat!(
                "#!/bin/sh\n",
                "cmd=\"$1\"\n",
                "out=\"\"; file=\"\"; prefix=\"\"\n",
                "while [ $# -gt 0 ]; do\n",
                "  case \"$1\" in\n",
                "    --lockfile) out=\"$2\"; shift ;;\n",
                "    --file) file=\"$2\"; shift ;;\n",
                "    --prefix) prefix=\"$2\"; shift ;;\n",
                "  esac\n",
                "  shift\n",
                "done\n",
                "if [ \"$cmd\" = lock ]; then\n",
                "  if grep -q 'name: boom' \"$file\"; then\n",
                "    echo 'solver refused the specification' 1>&2\n",
                "    exit 2\n",
                "  fi\n",
                "  cp \"$(dirname \"$0\")/fixture-lock.yaml\" \"$out\"\n",
                "elif [ \"$cmd\" = install ]; then\n",
                "  mkdir -p \"$prefix/bin\"\n",
                "  echo 'fake python' > \"$prefix/bin/python\"\n",
                "else\n",
                "  exit 1\n",
                "fi\n",
            ),
        ),
        (
            "conda-pack",
            concat!(
                "#!/bin/sh\n",
                "out=\"\"\n",
                "while [ $# -gt 0 ]; do\n",
                "  case \"$1\" in --output) out=\"$2\"; shift ;; esac\n",
                "  shift\n",
                "done\n",
                "echo 'fake archive' > \"$out\"\n",
            ),
        ),
        (
            "constructor",
            "#!/bin/sh\necho 'fake installer' > \"$1/environment-installer.sh\"\n",
        ),
    ];
    for (name, contents) in scripts {
        let path = dir.join(name);
        fs_err::write(&path, contents).unwrap();
        fs_err::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let path = format!(
        "{}:{}",
        dir.display(),
        std::env::var("PATH").unwrap_or_default()
    );
    std::env::set_var("PATH", path);
    dir
});

struct Harness {
    _root: tempfile::TempDir,
    db: DbPool,
    store: Arc<CondaStore>,
    active: Arc<ActiveTasks>,
}

async fn harness_with(tweak: impl FnOnce(&mut Settings)) -> Harness {
    Lazy::force(&TOOLS);
    let root = tempfile::tempdir().unwrap();

    let mut settings = Settings::default();
    settings.database_url = format!(
        "sqlite://{}",
        root.path().join("conda-store.db").display()
    );
    settings.store_directory = root.path().join("state");
    settings.conda_command = "conda".to_string();
    settings.local_storage = conda_store_storage::LocalStorageConfig {
        storage_path: root.path().join("storage"),
        storage_url: "http://localhost:8080/storage".to_string(),
    };
    tweak(&mut settings);

    let db = conda_store_db::connect(&settings.database_url).await.unwrap();
    let active = Arc::new(ActiveTasks::default());
    let store = Arc::new(CondaStore::new(settings, active.clone()).await.unwrap());
    Harness {
        _root: root,
        db,
        store,
        active,
    }
}

async fn harness() -> Harness {
    harness_with(|_| {}).await
}

fn python_spec(name: &str) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "channels": ["conda-forge"],
        "dependencies": ["python=3.11"],
    })
}

async fn run_build(harness: &Harness, build_id: i64) -> Result<(), conda_store_server::CondaStoreError> {
    let (context, _locker): (BuildContext, ScopedLocker) = BuildContext::enter(
        harness.store.clone(),
        harness.db.clone(),
        None,
        None,
    )
    .await?;
    build_conda_environment(&context, build_id).await
}

#[tokio::test]
async fn build_flow_end_to_end() {
    let harness = harness().await;

    let build_id = register_environment(
        &harness.store,
        &harness.db,
        "default",
        &python_spec("a"),
        None,
    )
    .await
    .unwrap();

    let queued = api::get_build(&harness.db, build_id).await.unwrap().unwrap();
    assert_eq!(queued.status, BuildStatus::Queued);

    run_build(&harness, build_id).await.unwrap();

    let build = api::get_build(&harness.db, build_id).await.unwrap().unwrap();
    assert_eq!(build.status, BuildStatus::Completed);
    assert!(build.started_on.is_some() && build.ended_on.is_some());
    assert!(build.size > 0, "disk usage was not recorded");

    let artifact_types = api::get_build_artifact_types(&harness.db, build_id).await.unwrap();
    for expected in [
        BuildArtifactType::Lockfile,
        BuildArtifactType::Logs,
        BuildArtifactType::Directory,
    ] {
        assert!(artifact_types.contains(&expected), "missing {expected}");
    }

    let environment = api::get_environment(&harness.db, "default", "a").await.unwrap().unwrap();
    assert_eq!(environment.current_build_id, Some(build_id));
    assert_eq!(environment.specification_id, Some(build.specification_id));

    // the persisted lockfile parses and the installed packages were indexed
    let specification = api::get_specification_by_id(&harness.db, build.specification_id)
        .await
        .unwrap()
        .unwrap();
    let lock_bytes = harness
        .store
        .storage()
        .get(&build.conda_lock_key(&specification))
        .await
        .unwrap();
    let lock: serde_json::Value = serde_json::from_slice(&lock_bytes).unwrap();
    assert_eq!(lock["version"], 1);

    let packages = api::get_build_packages(&harness.db, build_id, None).await.unwrap();
    let names: Vec<&str> = packages.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["numpy", "python"]);

    let logs = harness
        .store
        .storage()
        .get(&build.log_key(&specification))
        .await
        .unwrap();
    let logs = String::from_utf8(logs).unwrap();
    assert!(logs.contains("starting build of conda environment"));
    assert!(logs.contains("hook-lock_environment: "));
    assert!(logs.contains("action_install_lockfile: "));

    // environment symlink points at the prefix
    let link = harness
        .store
        .settings
        .environment_path("default", "a")
        .unwrap();
    assert_eq!(
        fs_err::read_link(&link).unwrap(),
        build.build_path(&harness.store.settings.store_directory, &specification)
    );
}

#[tokio::test]
async fn artifact_producers_follow_a_completed_build() {
    let harness = harness().await;
    let build_id = register_environment(
        &harness.store,
        &harness.db,
        "default",
        &python_spec("artifacts"),
        None,
    )
    .await
    .unwrap();
    run_build(&harness, build_id).await.unwrap();

    let (context, _locker) =
        BuildContext::enter(harness.store.clone(), harness.db.clone(), None, None)
            .await
            .unwrap();
    conda_store_server::worker::build::build_conda_env_export(&context, build_id)
        .await
        .unwrap();
    conda_store_server::worker::build::build_conda_pack(&context, build_id)
        .await
        .unwrap();
    conda_store_server::worker::build::build_constructor_installer(&context, build_id)
        .await
        .unwrap();

    let build = api::get_build(&harness.db, build_id).await.unwrap().unwrap();
    let specification = api::get_specification_by_id(&harness.db, build.specification_id)
        .await
        .unwrap()
        .unwrap();

    let artifact_types = api::get_build_artifact_types(&harness.db, build_id).await.unwrap();
    for expected in [
        BuildArtifactType::Yaml,
        BuildArtifactType::CondaPack,
        BuildArtifactType::ConstructorInstaller,
    ] {
        assert!(artifact_types.contains(&expected), "missing {expected}");
    }

    let export = harness
        .store
        .storage()
        .get(&build.conda_env_export_key(&specification))
        .await
        .unwrap();
    let export: serde_json::Value =
        serde_yaml::from_str(&String::from_utf8(export).unwrap()).unwrap();
    assert_eq!(export["name"], "fake");

    let archive = harness
        .store
        .storage()
        .get(&build.conda_pack_key(&specification))
        .await
        .unwrap();
    assert_eq!(String::from_utf8(archive).unwrap().trim(), "fake archive");

    let installer = harness
        .store
        .storage()
        .get(&build.constructor_installer_key(&specification, "sh"))
        .await
        .unwrap();
    assert_eq!(String::from_utf8(installer).unwrap().trim(), "fake installer");
}

#[tokio::test]
async fn duplicate_submissions_share_one_specification() {
    let harness = harness().await;

    let (first, second) = tokio::join!(
        register_environment(&harness.store, &harness.db, "default", &python_spec("a"), None),
        register_environment(&harness.store, &harness.db, "default", &python_spec("a"), None),
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_ne!(first, second, "each submission gets its own build");

    let specifications = api::list_specifications(&harness.db, None).await.unwrap();
    assert_eq!(specifications.len(), 1);

    let build_a = api::get_build(&harness.db, first).await.unwrap().unwrap();
    let build_b = api::get_build(&harness.db, second).await.unwrap().unwrap();
    assert_eq!(build_a.specification_id, build_b.specification_id);
}

#[tokio::test]
async fn disallowed_channels_reject_before_any_insert() {
    let harness = harness_with(|settings| {
        settings.conda_allowed_channels = vec!["conda-forge".to_string()];
    })
    .await;

    let err = register_environment(
        &harness.store,
        &harness.db,
        "default",
        &serde_json::json!({
            "name": "a",
            "channels": ["nodefaults"],
            "dependencies": ["python"],
        }),
        None,
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("nodefaults"), "unexpected error {err}");

    assert!(api::list_specifications(&harness.db, None).await.unwrap().is_empty());
    assert!(api::get_namespace(&harness.db, "default").await.unwrap().is_none());
}

#[tokio::test]
async fn solver_failure_marks_the_build_failed() {
    let harness = harness().await;
    let build_id = register_environment(
        &harness.store,
        &harness.db,
        "default",
        &python_spec("boom"),
        None,
    )
    .await
    .unwrap();

    run_build(&harness, build_id).await.unwrap_err();

    let build = api::get_build(&harness.db, build_id).await.unwrap().unwrap();
    assert_eq!(build.status, BuildStatus::Failed);
    assert!(build.ended_on.is_some());
    // solver output is not safe to expose
    assert_eq!(build.status_info, None);

    let specification = api::get_specification_by_id(&harness.db, build.specification_id)
        .await
        .unwrap()
        .unwrap();
    let logs = harness
        .store
        .storage()
        .get(&build.log_key(&specification))
        .await
        .unwrap();
    let logs = String::from_utf8(logs).unwrap();
    assert!(logs.contains("solver refused the specification"));
}

#[tokio::test]
async fn oversized_build_paths_surface_in_status_info() {
    let harness = harness_with(|settings| {
        settings.store_directory = std::env::temp_dir().join("x".repeat(300));
    })
    .await;

    let build_id = register_environment(
        &harness.store,
        &harness.db,
        "default",
        &python_spec("a"),
        None,
    )
    .await
    .unwrap();
    run_build(&harness, build_id).await.unwrap_err();

    let build = api::get_build(&harness.db, build_id).await.unwrap().unwrap();
    assert_eq!(build.status, BuildStatus::Failed);
    let status_info = build.status_info.expect("build path errors are user facing");
    assert!(status_info.contains("build path"), "unexpected status_info {status_info}");
}

#[tokio::test]
async fn missing_locker_plugin_fails_the_build() {
    let harness = harness_with(|settings| {
        settings.locker_plugin_name = "mamba-lock".to_string();
    })
    .await;

    let build_id = register_environment(
        &harness.store,
        &harness.db,
        "default",
        &python_spec("a"),
        None,
    )
    .await
    .unwrap();
    let err = run_build(&harness, build_id).await.unwrap_err();
    assert!(err.to_string().contains("available plugins"));

    let build = api::get_build(&harness.db, build_id).await.unwrap().unwrap();
    assert_eq!(build.status, BuildStatus::Failed);
}

#[tokio::test]
async fn lockfile_specifications_skip_the_solver() {
    let harness = harness().await;
    let platform = conda_store_types::current_platform();
    let build_id = register_environment(
        &harness.store,
        &harness.db,
        "default",
        &serde_json::json!({
            "name": "pinned",
            "lockfile": {
                "version": 1,
                "package": [{
                    "name": "python",
                    "version": "3.11.4",
                    "manager": "conda",
                    "platform": platform,
                    "dependencies": {},
                    "url": format!(
                        "https://conda.anaconda.org/conda-forge/{platform}/python-3.11.4-h06a4308_1.conda"
                    ),
                    "hash": {"md5": "a75683f8d9f5b58c19a8ec5d0b7f796e"},
                    "category": "main",
                    "optional": false
                }]
            },
        }),
        None,
    )
    .await
    .unwrap();

    run_build(&harness, build_id).await.unwrap();

    let build = api::get_build(&harness.db, build_id).await.unwrap().unwrap();
    assert_eq!(build.status, BuildStatus::Completed);

    let specification = api::get_specification_by_id(&harness.db, build.specification_id)
        .await
        .unwrap()
        .unwrap();
    assert!(specification.is_lockfile);
    let logs = harness
        .store
        .storage()
        .get(&build.log_key(&specification))
        .await
        .unwrap();
    let logs = String::from_utf8(logs).unwrap();
    assert!(logs.contains("action_save_lockfile: "));
    assert!(!logs.contains("hook-lock_environment: "));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_log_appends_never_interleave() {
    let harness = harness().await;
    let build_id = register_environment(
        &harness.store,
        &harness.db,
        "default",
        &python_spec("logs"),
        None,
    )
    .await
    .unwrap();
    let build = api::get_build(&harness.db, build_id).await.unwrap().unwrap();
    let specification = api::get_specification_by_id(&harness.db, build.specification_id)
        .await
        .unwrap()
        .unwrap();

    const WRITERS: usize = 4;
    const LINES: usize = 25;
    let mut handles = Vec::new();
    for writer in 0..WRITERS {
        let db = harness.db.clone();
        let store = harness.store.clone();
        let build = build.clone();
        let specification = specification.clone();
        handles.push(tokio::spawn(async move {
            for line in 0..LINES {
                append_to_logs(
                    &db,
                    &store,
                    &build,
                    &specification,
                    &format!("writer-{writer} line {line}\n"),
                )
                .await
                .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let logs = harness
        .store
        .storage()
        .get(&build.log_key(&specification))
        .await
        .unwrap();
    let logs = String::from_utf8(logs).unwrap();
    let lines: Vec<&str> = logs.lines().collect();
    assert_eq!(lines.len(), WRITERS * LINES);

    for writer in 0..WRITERS {
        let of_writer: Vec<&str> = lines
            .iter()
            .copied()
            .filter(|line| line.starts_with(&format!("writer-{writer} ")))
            .collect();
        let expected: Vec<String> = (0..LINES)
            .map(|line| format!("writer-{writer} line {line}"))
            .collect();
        assert_eq!(of_writer, expected, "writer {writer} lines reordered");
    }
}

#[tokio::test]
async fn reaper_reconciles_stuck_builds() {
    let harness = harness().await;

    let stuck = register_environment(&harness.store, &harness.db, "default", &python_spec("s1"), None)
        .await
        .unwrap();
    let canceled =
        register_environment(&harness.store, &harness.db, "default", &python_spec("s2"), None)
            .await
            .unwrap();
    api::mark_build_started(&harness.db, stuck).await.unwrap();
    api::mark_build_started(&harness.db, canceled).await.unwrap();

    // a build that only just started is inside the settle window
    build_cleanup(&harness.db, &harness.store, Some(vec![stuck]), None, false)
        .await
        .unwrap();
    assert_eq!(
        api::get_build(&harness.db, stuck).await.unwrap().unwrap().status,
        BuildStatus::Building
    );

    tokio::time::sleep(Duration::from_secs(6)).await;

    // a build whose task is still in the inventory is left alone
    harness.active.insert(&format!("build-{stuck}-environment"));
    build_cleanup(&harness.db, &harness.store, Some(vec![stuck]), None, false)
        .await
        .unwrap();
    assert_eq!(
        api::get_build(&harness.db, stuck).await.unwrap().unwrap().status,
        BuildStatus::Building
    );
    harness.active.remove(&format!("build-{stuck}-environment"));

    build_cleanup(&harness.db, &harness.store, None, None, false).await.unwrap();
    let build = api::get_build(&harness.db, stuck).await.unwrap().unwrap();
    assert_eq!(build.status, BuildStatus::Failed);
    assert!(build.ended_on.is_some());

    // s2 was swept by the same pass; an admin cancel on an already terminal
    // build is a no-op, so re-queue a third one for the cancel path
    let build = api::get_build(&harness.db, canceled).await.unwrap().unwrap();
    assert_eq!(build.status, BuildStatus::Failed);

    let admin_cancel =
        register_environment(&harness.store, &harness.db, "default", &python_spec("s3"), None)
            .await
            .unwrap();
    api::mark_build_started(&harness.db, admin_cancel).await.unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;
    build_cleanup(&harness.db, &harness.store, Some(vec![admin_cancel]), None, true)
        .await
        .unwrap();
    let build = api::get_build(&harness.db, admin_cancel).await.unwrap().unwrap();
    assert_eq!(build.status, BuildStatus::Canceled);

    let specification = api::get_specification_by_id(&harness.db, build.specification_id)
        .await
        .unwrap()
        .unwrap();
    let logs = harness
        .store
        .storage()
        .get(&build.log_key(&specification))
        .await
        .unwrap();
    let logs = String::from_utf8(logs).unwrap();
    assert!(logs.contains("stuck in BUILDING state"));
}

#[tokio::test]
async fn reaper_noops_when_the_broker_cannot_inspect() {
    struct Uninspectable;

    #[async_trait::async_trait]
    impl TaskInventory for Uninspectable {
        async fn active_tasks(&self) -> Option<Vec<String>> {
            None
        }
    }

    let harness = harness().await;
    let store = Arc::new(
        CondaStore::new(harness.store.settings.clone(), Arc::new(Uninspectable))
            .await
            .unwrap(),
    );

    let build_id = register_environment(&store, &harness.db, "default", &python_spec("a"), None)
        .await
        .unwrap();
    api::mark_build_started(&harness.db, build_id).await.unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;

    build_cleanup(&harness.db, &store, None, None, false).await.unwrap();
    assert_eq!(
        api::get_build(&harness.db, build_id).await.unwrap().unwrap().status,
        BuildStatus::Building
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_processes_queued_builds_and_fans_out_artifacts() {
    let harness = harness().await;
    let (worker, queue) = Worker::new(
        harness.store.clone(),
        harness.db.clone(),
        harness.active.clone(),
    );
    let worker_task = tokio::spawn(worker.run());

    let build_id = register_environment(
        &harness.store,
        &harness.db,
        "default",
        &python_spec("a"),
        Some(&queue),
    )
    .await
    .unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(30);
    loop {
        let build = api::get_build(&harness.db, build_id).await.unwrap().unwrap();
        let artifact_types = api::get_build_artifact_types(&harness.db, build_id).await.unwrap();
        if build.status == BuildStatus::Completed
            && artifact_types.contains(&BuildArtifactType::Yaml)
            && artifact_types.contains(&BuildArtifactType::CondaPack)
            && artifact_types.contains(&BuildArtifactType::ConstructorInstaller)
        {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "worker did not finish the build, status {:?}, artifacts {artifact_types:?}",
            build.status
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    worker_task.abort();
}

#[tokio::test]
async fn solves_record_packages_without_installing() {
    let harness = harness().await;
    let (worker, queue) = Worker::new(
        harness.store.clone(),
        harness.db.clone(),
        harness.active.clone(),
    );
    let worker_task = tokio::spawn(worker.run());

    let solve_id = register_solve(&harness.store, &harness.db, &python_spec("a"), Some(&queue))
        .await
        .unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(30);
    loop {
        let solve = api::get_solve(&harness.db, solve_id).await.unwrap().unwrap();
        if solve.ended_on.is_some() {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "solve did not finish");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    worker_task.abort();

    // no build prefix was created for a solve
    assert!(api::list_builds(&harness.db, &Default::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn settings_overrides_scope_by_namespace() {
    let harness = harness().await;

    let mut overrides = std::collections::BTreeMap::new();
    overrides.insert("conda_command".to_string(), "\"micromamba\"".to_string());
    harness
        .store
        .set_settings(&harness.db, Some("analytics"), None, &overrides)
        .await
        .unwrap();

    let scoped = harness
        .store
        .get_settings(&harness.db, Some("analytics"), None)
        .await
        .unwrap();
    assert_eq!(scoped.conda_command, "micromamba");

    let global = harness.store.get_settings(&harness.db, None, None).await.unwrap();
    assert_eq!(global.conda_command, "conda");

    // global-only fields cannot be overridden at namespace scope
    let mut overrides = std::collections::BTreeMap::new();
    overrides.insert("storage_plugin_name".to_string(), "\"s3\"".to_string());
    harness
        .store
        .set_settings(&harness.db, Some("analytics"), None, &overrides)
        .await
        .unwrap_err();
}

#[tokio::test]
async fn log_artifacts_register_once_per_key() {
    let harness = harness().await;
    let build_id = register_environment(
        &harness.store,
        &harness.db,
        "default",
        &python_spec("logs2"),
        None,
    )
    .await
    .unwrap();
    let build = api::get_build(&harness.db, build_id).await.unwrap().unwrap();
    let specification = api::get_specification_by_id(&harness.db, build.specification_id)
        .await
        .unwrap()
        .unwrap();

    for i in 0..3 {
        append_to_logs(&harness.db, &harness.store, &build, &specification, &format!("line {i}\n"))
            .await
            .unwrap();
    }

    let artifacts = api::list_build_artifacts(
        &harness.db,
        &BuildArtifactFilter {
            build_id: Some(build_id),
            included_artifact_types: vec![BuildArtifactType::Logs],
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(artifacts.len(), 1, "log appends must reuse one artifact row");
}
