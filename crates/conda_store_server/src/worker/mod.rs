//! Worker task dispatch.
//!
//! One worker processes one task at a time; the active-task inventory names
//! tasks `build-<id>-<stage>` so the reaper can reconcile database state
//! against what is actually running. The [`TaskInventory`] trait is the
//! broker control interface: the in-process [`ActiveTasks`] implements it
//! for a single worker, an external broker can implement it instead.

pub mod actions;
pub mod build;
pub mod reaper;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use conda_store_db::api::{self, BuildFilter};
use conda_store_db::entities::{BuildArtifactType, BuildStatus};
use conda_store_db::DbPool;

use crate::error::CondaStoreError;
use crate::store::CondaStore;
use crate::worker::build::BuildContext;

/// How often the dispatcher polls for queued builds.
const DISPATCH_INTERVAL: Duration = Duration::from_secs(5);

/// The broker control interface: which tasks are live right now. `None`
/// means the broker cannot enumerate active tasks at all, in which case the
/// reaper must not reap anything.
#[async_trait]
pub trait TaskInventory: Send + Sync {
    async fn active_tasks(&self) -> Option<Vec<String>>;
}

/// Task inventory of a single in-process worker.
#[derive(Default)]
pub struct ActiveTasks {
    tasks: Mutex<HashSet<String>>,
}

impl ActiveTasks {
    pub fn insert(&self, name: &str) {
        self.tasks.lock().insert(name.to_string());
    }

    pub fn remove(&self, name: &str) {
        self.tasks.lock().remove(name);
    }
}

#[async_trait]
impl TaskInventory for ActiveTasks {
    async fn active_tasks(&self) -> Option<Vec<String>> {
        Some(self.tasks.lock().iter().cloned().collect())
    }
}

/// A unit of work dispatched to the worker, keyed by the build or solve it
/// operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    BuildEnvironment { build_id: i64 },
    BuildCondaEnvExport { build_id: i64 },
    BuildCondaPack { build_id: i64 },
    BuildConstructorInstaller { build_id: i64 },
    BuildCondaDocker { build_id: i64 },
    SolveEnvironment { solve_id: i64 },
}

impl Task {
    /// The task name as it appears in the broker's active-task inventory.
    pub fn name(&self) -> String {
        match self {
            Task::BuildEnvironment { build_id } => format!("build-{build_id}-environment"),
            Task::BuildCondaEnvExport { build_id } => {
                format!("build-{build_id}-conda-env-export")
            }
            Task::BuildCondaPack { build_id } => format!("build-{build_id}-conda-pack"),
            Task::BuildConstructorInstaller { build_id } => {
                format!("build-{build_id}-constructor-installer")
            }
            Task::BuildCondaDocker { build_id } => format!("build-{build_id}-docker"),
            Task::SolveEnvironment { solve_id } => format!("solve-{solve_id}-environment"),
        }
    }
}

/// Cloneable handle used to enqueue tasks on a worker.
#[derive(Clone)]
pub struct TaskQueue {
    sender: mpsc::UnboundedSender<Task>,
}

impl TaskQueue {
    pub fn submit(&self, task: Task) {
        if self.sender.send(task).is_err() {
            tracing::error!(task = %task.name(), "worker is gone, dropping task");
        }
    }
}

/// Consumes tasks one at a time, tracking each in the active inventory for
/// the duration of its run.
pub struct Worker {
    store: Arc<CondaStore>,
    db: DbPool,
    receiver: mpsc::UnboundedReceiver<Task>,
    queue: TaskQueue,
    active: Arc<ActiveTasks>,
}

impl Worker {
    /// `active` must be the same inventory the store's broker view reports,
    /// otherwise the reaper cannot see this worker's tasks.
    pub fn new(
        store: Arc<CondaStore>,
        db: DbPool,
        active: Arc<ActiveTasks>,
    ) -> (Self, TaskQueue) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = TaskQueue { sender };
        (
            Self {
                store,
                db,
                receiver,
                queue: queue.clone(),
                active,
            },
            queue,
        )
    }

    pub async fn run(mut self) {
        while let Some(task) = self.receiver.recv().await {
            let name = task.name();
            self.active.insert(&name);
            let result = self.dispatch(task).await;
            self.active.remove(&name);
            if let Err(err) = result {
                tracing::error!(task = %name, error = %err, "task failed");
            }
        }
    }

    /// The namespace/environment scope of a build, for settings resolution.
    async fn build_scope(
        &self,
        build_id: i64,
    ) -> Result<(Option<String>, Option<String>), CondaStoreError> {
        let build = api::get_build(&self.db, build_id)
            .await?
            .ok_or_else(|| CondaStoreError::not_found(format!("build {build_id}")))?;
        let environment = api::get_environment_by_id(&self.db, build.environment_id)
            .await?
            .ok_or_else(|| {
                CondaStoreError::not_found(format!("environment {}", build.environment_id))
            })?;
        Ok((
            Some(environment.namespace_name),
            Some(environment.name),
        ))
    }

    async fn enter(
        &self,
        build_id: i64,
    ) -> Result<(BuildContext, crate::plugins::ScopedLocker), CondaStoreError> {
        let (namespace, environment) = self.build_scope(build_id).await?;
        BuildContext::enter(self.store.clone(), self.db.clone(), namespace, environment).await
    }

    async fn dispatch(&self, task: Task) -> Result<(), CondaStoreError> {
        match task {
            Task::BuildEnvironment { build_id } => {
                let (context, _locker) = self.enter(build_id).await?;
                build::build_conda_environment(&context, build_id).await?;

                // A finished environment fans out into its artifact tasks.
                for artifact in &context.settings.build_artifacts {
                    match artifact {
                        BuildArtifactType::Yaml => {
                            self.queue.submit(Task::BuildCondaEnvExport { build_id });
                        }
                        BuildArtifactType::CondaPack => {
                            self.queue.submit(Task::BuildCondaPack { build_id });
                        }
                        BuildArtifactType::ConstructorInstaller => {
                            self.queue
                                .submit(Task::BuildConstructorInstaller { build_id });
                        }
                        BuildArtifactType::DockerManifest
                        | BuildArtifactType::ContainerRegistry => {
                            self.queue.submit(Task::BuildCondaDocker { build_id });
                        }
                        _ => {}
                    }
                }
                Ok(())
            }
            Task::BuildCondaEnvExport { build_id } => {
                let (context, _locker) = self.enter(build_id).await?;
                build::build_conda_env_export(&context, build_id).await
            }
            Task::BuildCondaPack { build_id } => {
                let (context, _locker) = self.enter(build_id).await?;
                build::build_conda_pack(&context, build_id).await
            }
            Task::BuildConstructorInstaller { build_id } => {
                let (context, _locker) = self.enter(build_id).await?;
                build::build_constructor_installer(&context, build_id).await
            }
            Task::BuildCondaDocker { build_id } => {
                let (context, _locker) = self.enter(build_id).await?;
                build::build_conda_docker(&context, build_id).await
            }
            Task::SolveEnvironment { solve_id } => {
                let (context, _locker) = BuildContext::enter(
                    self.store.clone(),
                    self.db.clone(),
                    None,
                    None,
                )
                .await?;
                build::solve_conda_environment(&context, solve_id).await
            }
        }
    }
}

/// Polls the database for queued builds and feeds them to the worker. The
/// pending set keeps a build from being enqueued twice while it waits for a
/// worker slot; entries fall out once the build leaves `QUEUED`.
pub async fn run_dispatcher(db: DbPool, queue: TaskQueue) {
    let mut pending: HashSet<i64> = HashSet::new();
    let mut interval = tokio::time::interval(DISPATCH_INTERVAL);
    loop {
        interval.tick().await;
        let queued = match api::list_builds(
            &db,
            &BuildFilter {
                status: Some(BuildStatus::Queued),
                ..Default::default()
            },
        )
        .await
        {
            Ok(builds) => builds,
            Err(err) => {
                tracing::warn!(error = %err, "failed to poll for queued builds");
                continue;
            }
        };

        let queued_ids: HashSet<i64> = queued.iter().map(|build| build.id).collect();
        pending.retain(|id| queued_ids.contains(id));
        for build in queued {
            if pending.insert(build.id) {
                tracing::info!(build_id = build.id, "dispatching queued build");
                queue.submit(Task::BuildEnvironment { build_id: build.id });
            }
        }
    }
}

/// Periodically reconciles `BUILDING` rows against the live task inventory.
pub async fn run_reaper(db: DbPool, store: Arc<CondaStore>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if let Err(err) = reaper::build_cleanup(&db, &store, None, None, false).await {
            tracing::warn!(error = %err, "build cleanup sweep failed");
        }
    }
}
