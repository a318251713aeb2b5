//! The build orchestrator: the state machine each build traverses and the
//! cross-worker log append path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use fs4::fs_std::FileExt;

use conda_store_db::api;
use conda_store_db::entities::{Build, BuildArtifactType, Specification};
use conda_store_db::DbPool;
use conda_store_types::{self as types, current_platform};

use crate::error::CondaStoreError;
use crate::plugins::{CondaLockLocker, LogSink, NullSink, PluginContext, ScopedLocker};
use crate::settings::Settings;
use crate::store::CondaStore;
use crate::lockfile;
use crate::worker::actions;

/// Longest usable install prefix. Beyond this, shebangs and prefix
/// replacement inside the environment start failing.
const MAX_BUILD_PATH_BYTES: usize = 255;

/// Everything a build task operates on: database, store handle, the
/// namespace/environment scope and the resolved settings snapshot.
pub struct BuildContext {
    pub db: DbPool,
    pub store: Arc<CondaStore>,
    pub namespace: Option<String>,
    pub environment_name: Option<String>,
    pub settings: Settings,
}

impl BuildContext {
    /// Materializes the context and registers the build-time plugins. The
    /// returned guard unregisters them when it drops, on every exit path.
    pub async fn enter(
        store: Arc<CondaStore>,
        db: DbPool,
        namespace: Option<String>,
        environment_name: Option<String>,
    ) -> Result<(Self, ScopedLocker), CondaStoreError> {
        let settings = store
            .get_settings(&db, namespace.as_deref(), environment_name.as_deref())
            .await?;
        let locker = Arc::new(CondaLockLocker::new(
            settings.conda_command.clone(),
            settings.conda_flags.clone(),
        ));
        let guard = ScopedLocker::register(store.registry.clone(), locker)?;
        Ok((
            Self {
                db,
                store,
                namespace,
                environment_name,
                settings,
            },
            guard,
        ))
    }
}

/// Appends to the build's LOGS artifact.
///
/// The read-concatenate-write round trip is guarded by an exclusive
/// cross-process file lock on `<build_path>.log.lock`, so concurrent tasks
/// of the same build interleave whole appends, never halves.
pub async fn append_to_logs(
    db: &DbPool,
    store: &CondaStore,
    build: &Build,
    specification: &Specification,
    logs: &str,
) -> Result<(), CondaStoreError> {
    let log_key = build.log_key(specification);
    let build_path = build.build_path(&store.settings.store_directory, specification);
    let lock_path = PathBuf::from(format!("{}.log.lock", build_path.display()));
    if let Some(parent) = lock_path.parent() {
        fs_err::tokio::create_dir_all(parent).await?;
    }

    let lock_file = tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        file.lock_exclusive()?;
        Ok(file)
    })
    .await
    .map_err(std::io::Error::other)??;

    let result = locked_append(db, store, build, &log_key, logs).await;
    let _ = lock_file.unlock();
    result
}

async fn locked_append(
    db: &DbPool,
    store: &CondaStore,
    build: &Build,
    log_key: &str,
    logs: &str,
) -> Result<(), CondaStoreError> {
    let storage = store.storage();
    let mut current = match storage.get(log_key).await {
        Ok(current) => current,
        // Missing or unreadable current logs read as empty.
        Err(_) => Vec::new(),
    };
    current.extend_from_slice(logs.as_bytes());
    storage.set(log_key, current, "text/plain").await?;
    api::ensure_build_artifact(db, build.id, BuildArtifactType::Logs, log_key).await?;
    Ok(())
}

/// Routes plugin/action output lines into the build's LOGS artifact.
pub struct BuildLogSink {
    db: DbPool,
    store: Arc<CondaStore>,
    build: Build,
    specification: Specification,
}

impl BuildLogSink {
    pub fn new(
        db: DbPool,
        store: Arc<CondaStore>,
        build: Build,
        specification: Specification,
    ) -> Self {
        Self {
            db,
            store,
            build,
            specification,
        }
    }
}

#[async_trait]
impl LogSink for BuildLogSink {
    async fn append(&self, line: &str) {
        let line = format!("{line}\n");
        if let Err(err) = append_to_logs(
            &self.db,
            &self.store,
            &self.build,
            &self.specification,
            &line,
        )
        .await
        {
            tracing::warn!(build_id = self.build.id, error = %err, "failed to append build log");
        }
    }
}

/// Rejects install prefixes the filesystem or the installed environment
/// cannot cope with. The message is safe to show to users.
pub fn validate_build_path(path: &Path) -> Result<(), CondaStoreError> {
    let rendered = path.to_string_lossy();
    if rendered.len() > MAX_BUILD_PATH_BYTES {
        return Err(CondaStoreError::BuildPath {
            path: path.to_path_buf(),
            reason: format!(
                "build path exceeds {MAX_BUILD_PATH_BYTES} bytes ({} bytes)",
                rendered.len()
            ),
        });
    }
    if rendered
        .chars()
        .any(|c| c.is_control() || !c.is_ascii())
    {
        return Err(CondaStoreError::BuildPath {
            path: path.to_path_buf(),
            reason: "build path must be printable ascii".to_string(),
        });
    }
    Ok(())
}

async fn load_build(
    db: &DbPool,
    build_id: i64,
) -> Result<(Build, Specification), CondaStoreError> {
    let build = api::get_build(db, build_id)
        .await?
        .ok_or_else(|| CondaStoreError::not_found(format!("build {build_id}")))?;
    let specification = api::get_specification_by_id(db, build.specification_id)
        .await?
        .ok_or_else(|| {
            CondaStoreError::not_found(format!("specification {}", build.specification_id))
        })?;
    Ok((build, specification))
}

fn typed_specification(
    specification: &Specification,
) -> Result<types::Specification, CondaStoreError> {
    Ok(types::Specification::parse(&specification.spec.0)?)
}

/// Builds a conda environment: lock, fetch, install, symlink, permissions,
/// package indexing, size accounting, completion. Any error transitions the
/// build to `FAILED` *before* it propagates, so the database stays
/// consistent even if the task runner dies afterwards.
pub async fn build_conda_environment(
    context: &BuildContext,
    build_id: i64,
) -> Result<(), CondaStoreError> {
    let (build, specification) = load_build(&context.db, build_id).await?;
    match run_build(context, &build, &specification).await {
        Ok(()) => Ok(()),
        Err(err) => {
            if let Some(fresh) = api::get_build(&context.db, build.id).await? {
                if !fresh.status.is_terminal() {
                    api::mark_build_failed(
                        &context.db,
                        build.id,
                        err.user_facing_message().as_deref(),
                    )
                    .await?;
                }
            }
            tracing::error!(build_id, error = %err, "conda environment build failed");
            let _ = append_to_logs(
                &context.db,
                &context.store,
                &build,
                &specification,
                &format!("{err}\n"),
            )
            .await;
            Err(err)
        }
    }
}

async fn run_build(
    context: &BuildContext,
    build: &Build,
    specification: &Specification,
) -> Result<(), CondaStoreError> {
    let settings = &context.settings;
    api::mark_build_started(&context.db, build.id).await?;

    // Even appending to the logs needs a usable build path for the log
    // lock, so this check comes before the first log line.
    let conda_prefix = build.build_path(&settings.store_directory, specification);
    validate_build_path(&conda_prefix)?;

    let sink: Arc<dyn LogSink> = Arc::new(BuildLogSink::new(
        context.db.clone(),
        context.store.clone(),
        build.clone(),
        specification.clone(),
    ));
    let log = PluginContext::new(sink.clone(), "");
    log.log(&format!(
        "starting build of conda environment {} UTC",
        Utc::now().format("%Y-%m-%d %H:%M:%S%.6f")
    ))
    .await;

    if let Some(parent) = conda_prefix.parent() {
        fs_err::tokio::create_dir_all(parent).await?;
    }

    let environment = api::get_environment_by_id(&context.db, build.environment_id)
        .await?
        .ok_or_else(|| {
            CondaStoreError::not_found(format!("environment {}", build.environment_id))
        })?;
    let environment_prefix =
        settings.environment_path(&environment.namespace_name, &environment.name);
    if let Some(environment_prefix) = &environment_prefix {
        if let Some(parent) = environment_prefix.parent() {
            fs_err::tokio::create_dir_all(parent).await?;
        }
    }

    let typed = typed_specification(specification)?;
    let lockfile_doc = match &typed {
        types::Specification::Lockfile(lockfile_spec) => {
            let save_log = log.with_prefix("action_save_lockfile: ");
            save_log
                .log("specification carries a lockfile, skipping solve")
                .await;
            lockfile_spec.lockfile.clone()
        }
        types::Specification::Conda(conda_spec) => {
            let locker = context
                .store
                .registry
                .locker(&settings.locker_plugin_name)?;
            locker
                .lock_environment(
                    &PluginContext::new(sink.clone(), "hook-lock_environment: "),
                    conda_spec,
                    &settings.conda_solve_platforms,
                )
                .await?
        }
    };

    let storage = context.store.storage();
    storage
        .set(
            &build.conda_lock_key(specification),
            serde_json::to_vec_pretty(&lockfile_doc)?,
            "application/json",
        )
        .await?;
    api::ensure_build_artifact(
        &context.db,
        build.id,
        BuildArtifactType::Lockfile,
        &build.conda_lock_key(specification),
    )
    .await?;

    let platform = current_platform();
    actions::fetch_and_extract_conda_packages(
        &log.with_prefix("action_fetch_and_extract_conda_packages: "),
        &lockfile_doc,
        &settings.package_cache(),
        &settings.conda_command,
        &platform,
    )
    .await?;

    actions::install_lockfile(
        &log.with_prefix("action_install_lockfile: "),
        &lockfile_doc,
        &conda_prefix,
        &settings.conda_command,
        &settings.package_cache(),
    )
    .await?;

    if let Some(environment_prefix) = &environment_prefix {
        actions::symlink_environment(&conda_prefix, environment_prefix).await?;
    }

    actions::set_conda_prefix_permissions(
        &log.with_prefix("action_set_conda_prefix_permissions: "),
        &conda_prefix,
        settings.default_permissions.clone(),
        settings.default_uid,
        settings.default_gid,
    )
    .await?;

    let index_log = log.with_prefix("action_add_conda_prefix_packages: ");
    let mut indexed = 0usize;
    for entry in lockfile::conda_packages_for_platform(&lockfile_doc, &platform) {
        let Some(record) = lockfile::package_record(entry) else {
            continue;
        };
        if let Some(package_build) =
            api::create_or_ignore_conda_package(&context.db, &record).await?
        {
            api::add_build_package_build(&context.db, build.id, package_build.id).await?;
            indexed += 1;
        }
    }
    index_log.log(&format!("indexed {indexed} installed packages")).await;

    let size = actions::disk_usage(&conda_prefix).await?;
    api::set_build_size(&context.db, build.id, size as i64).await?;

    // A build that went terminal under us (canceled by the reaper) keeps
    // its state; the produced result is discarded.
    let fresh = api::get_build(&context.db, build.id)
        .await?
        .ok_or_else(|| CondaStoreError::not_found(format!("build {}", build.id)))?;
    if fresh.status.is_terminal() {
        tracing::warn!(
            build_id = build.id,
            status = %fresh.status,
            "build went terminal mid-run, discarding result"
        );
        return Ok(());
    }
    api::mark_build_completed(
        &context.db,
        build.id,
        &conda_prefix.to_string_lossy(),
    )
    .await?;
    log.log("build completed").await;
    Ok(())
}

/// Exports the installed prefix as an `environment.yaml` artifact.
pub async fn build_conda_env_export(
    context: &BuildContext,
    build_id: i64,
) -> Result<(), CondaStoreError> {
    let (build, specification) = load_build(&context.db, build_id).await?;
    let conda_prefix = build.build_path(&context.settings.store_directory, &specification);
    let sink: Arc<dyn LogSink> = Arc::new(BuildLogSink::new(
        context.db.clone(),
        context.store.clone(),
        build.clone(),
        specification.clone(),
    ));
    let log = PluginContext::new(sink, "action_generate_conda_export: ");

    let export =
        actions::generate_conda_export(&log, &context.settings.conda_command, &conda_prefix)
            .await?;
    let rendered = serde_yaml::to_string(&export)?;

    context
        .store
        .storage()
        .set(
            &build.conda_env_export_key(&specification),
            rendered.into_bytes(),
            "text/yaml",
        )
        .await?;
    api::ensure_build_artifact(
        &context.db,
        build.id,
        BuildArtifactType::Yaml,
        &build.conda_env_export_key(&specification),
    )
    .await?;
    Ok(())
}

/// Packages the installed prefix into `environment.tar.gz`.
pub async fn build_conda_pack(
    context: &BuildContext,
    build_id: i64,
) -> Result<(), CondaStoreError> {
    let (build, specification) = load_build(&context.db, build_id).await?;
    let conda_prefix = build.build_path(&context.settings.store_directory, &specification);
    let sink: Arc<dyn LogSink> = Arc::new(BuildLogSink::new(
        context.db.clone(),
        context.store.clone(),
        build.clone(),
        specification.clone(),
    ));
    let log = PluginContext::new(sink, "action_generate_conda_pack: ");

    let scratch = tempfile::tempdir()?;
    let output_filename = scratch.path().join("environment.tar.gz");
    actions::generate_conda_pack(&log, &conda_prefix, &output_filename).await?;

    context
        .store
        .storage()
        .fset(
            &build.conda_pack_key(&specification),
            &output_filename,
            "application/gzip",
        )
        .await?;
    api::ensure_build_artifact(
        &context.db,
        build.id,
        BuildArtifactType::CondaPack,
        &build.conda_pack_key(&specification),
    )
    .await?;
    Ok(())
}

/// Produces a standalone installer for the build. Prefers the persisted
/// lockfile (pinned dependencies) and falls back to the raw specification
/// when the lockfile is unavailable.
pub async fn build_constructor_installer(
    context: &BuildContext,
    build_id: i64,
) -> Result<(), CondaStoreError> {
    let (build, specification) = load_build(&context.db, build_id).await?;
    let typed = typed_specification(&specification)?;
    let sink: Arc<dyn LogSink> = Arc::new(BuildLogSink::new(
        context.db.clone(),
        context.store.clone(),
        build.clone(),
        specification.clone(),
    ));
    let log = PluginContext::new(sink, "action_generate_constructor_installer: ");

    let platform = current_platform();
    let persisted_lockfile = match context
        .store
        .storage()
        .get(&build.conda_lock_key(&specification))
        .await
    {
        Ok(bytes) => serde_json::from_slice::<serde_json::Value>(&bytes).ok(),
        Err(err) => {
            log.log(&format!(
                "could not load persisted lockfile, falling back to specification: {err}"
            ))
            .await;
            None
        }
    };

    let (channels, specs) = constructor_inputs(
        &typed,
        persisted_lockfile.as_ref(),
        &context.settings,
        &platform,
    );
    if specs.is_empty() {
        log.log("nothing to install, skipping installer generation").await;
        return Ok(());
    }

    let scratch = tempfile::tempdir()?;
    let installer = actions::generate_constructor_installer(
        &log,
        scratch.path(),
        &specification.name,
        &build.key(&specification),
        &channels,
        &specs,
    )
    .await?;

    let Some(installer) = installer else {
        tracing::warn!(build_id, "constructor did not produce an installer");
        return Ok(());
    };
    let extension = installer
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("sh");
    let key = build.constructor_installer_key(&specification, extension);
    context
        .store
        .storage()
        .fset(&key, &installer, "application/octet-stream")
        .await?;
    api::ensure_build_artifact(
        &context.db,
        build.id,
        BuildArtifactType::ConstructorInstaller,
        &key,
    )
    .await?;
    Ok(())
}

/// The channels and specs handed to constructor, pinned when possible.
fn constructor_inputs(
    typed: &types::Specification,
    persisted_lockfile: Option<&serde_json::Value>,
    settings: &Settings,
    platform: &str,
) -> (Vec<String>, Vec<String>) {
    let channels = match typed {
        types::Specification::Conda(spec) if !spec.channels.is_empty() => spec.channels.clone(),
        _ => settings.conda_default_channels.clone(),
    };

    let lockfile_doc = persisted_lockfile.or(match typed {
        types::Specification::Lockfile(spec) => Some(&spec.lockfile),
        types::Specification::Conda(_) => None,
    });
    if let Some(lockfile_doc) = lockfile_doc {
        let pinned = lockfile::pinned_specs(lockfile_doc, platform);
        if !pinned.is_empty() {
            return (channels, pinned);
        }
    }

    let specs = match typed {
        types::Specification::Conda(spec) => {
            spec.match_specs().map(ToString::to_string).collect()
        }
        types::Specification::Lockfile(_) => Vec::new(),
    };
    (channels, specs)
}

/// Docker image generation is currently not supported; kept as a task so
/// configured artifact lists keep working.
pub async fn build_conda_docker(
    _context: &BuildContext,
    build_id: i64,
) -> Result<(), CondaStoreError> {
    tracing::warn!(
        build_id,
        "generating docker images is currently not supported"
    );
    Ok(())
}

/// Locks a specification without installing it, recording the solved
/// packages against the solve row.
pub async fn solve_conda_environment(
    context: &BuildContext,
    solve_id: i64,
) -> Result<(), CondaStoreError> {
    let solve = api::get_solve(&context.db, solve_id)
        .await?
        .ok_or_else(|| CondaStoreError::not_found(format!("solve {solve_id}")))?;
    let specification = api::get_specification_by_id(&context.db, solve.specification_id)
        .await?
        .ok_or_else(|| {
            CondaStoreError::not_found(format!("specification {}", solve.specification_id))
        })?;
    let types::Specification::Conda(conda_spec) = typed_specification(&specification)? else {
        return Err(CondaStoreError::Specification(
            types::SpecificationError::InvalidSpecification {
                reason: "solves require a regular specification, not a lockfile".to_string(),
            },
        ));
    };

    api::mark_solve_started(&context.db, solve_id).await?;

    let platform = current_platform();
    let locker = context
        .store
        .registry
        .locker(&context.settings.locker_plugin_name)?;
    let lockfile_doc = locker
        .lock_environment(
            &PluginContext::new(Arc::new(NullSink), ""),
            &conda_spec,
            &[platform.clone()],
        )
        .await?;

    for entry in lockfile::conda_packages_for_platform(&lockfile_doc, &platform) {
        let Some(record) = lockfile::package_record(entry) else {
            continue;
        };
        if let Some(package_build) =
            api::create_or_ignore_conda_package(&context.db, &record).await?
        {
            api::add_solve_package_build(&context.db, solve_id, package_build.id).await?;
        }
    }

    api::mark_solve_ended(&context.db, solve_id).await?;
    Ok(())
}
