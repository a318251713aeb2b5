use async_trait::async_trait;
use tokio::process::Command;

use conda_store_types::CondaSpecification;

use crate::error::CondaStoreError;
use crate::plugins::context::PluginContext;
use crate::plugins::locker::Locker;

/// Locker backed by the external `conda-lock` tool.
///
/// The specification is written to a scratch `environment.yaml`, solved by
/// `conda-lock lock` for every requested platform, and the produced
/// `conda-lock.yaml` is read back. Channel priority flags reach the solver
/// through the `CONDA_FLAGS` environment variable, which the solver library
/// honors from the child environment.
pub struct CondaLockLocker {
    conda_command: String,
    conda_flags: String,
    lock_command: String,
}

impl CondaLockLocker {
    pub fn new(conda_command: impl Into<String>, conda_flags: impl Into<String>) -> Self {
        Self {
            conda_command: conda_command.into(),
            conda_flags: conda_flags.into(),
            lock_command: "conda-lock".to_string(),
        }
    }

    /// Overrides the `conda-lock` executable, e.g. an absolute path.
    pub fn with_lock_command(mut self, lock_command: impl Into<String>) -> Self {
        self.lock_command = lock_command.into();
        self
    }
}

#[async_trait]
impl Locker for CondaLockLocker {
    fn name(&self) -> &str {
        "conda-lock"
    }

    fn synopsis(&self) -> &str {
        "Solve an environment with conda-lock and produce a lockfile"
    }

    async fn lock_environment(
        &self,
        context: &PluginContext,
        specification: &CondaSpecification,
        platforms: &[String],
    ) -> Result<serde_json::Value, CondaStoreError> {
        context.log("lock_environment entrypoint for conda-lock").await;

        let workdir = tempfile::tempdir()?;
        let environment_filename = workdir.path().join("environment.yaml");
        let lockfile_filename = workdir.path().join("conda-lock.yaml");
        fs_err::tokio::write(
            &environment_filename,
            serde_yaml::to_string(specification)?,
        )
        .await?;

        // `info` works with both conda and mamba; its output makes solver
        // failures much easier to diagnose after the fact.
        let mut info = Command::new(&self.conda_command);
        info.arg("info");
        context.run_command(&mut info).await?;

        context
            .log(&format!(
                "overriding solver channel priority: CONDA_FLAGS={}",
                self.conda_flags
            ))
            .await;

        let mut lock = Command::new(&self.lock_command);
        lock.arg("lock")
            .arg("--file")
            .arg(&environment_filename)
            .arg("--lockfile")
            .arg(&lockfile_filename)
            .arg("--conda")
            .arg(&self.conda_command);
        for platform in platforms {
            lock.arg("--platform").arg(platform);
        }
        lock.env("CONDA_FLAGS", &self.conda_flags);
        // The solver only sees virtual cuda packages when this variable is
        // set; forward it from the specification.
        if let Some(cuda_version) = specification.variables.get("CONDA_OVERRIDE_CUDA") {
            lock.env("CONDA_OVERRIDE_CUDA", cuda_version);
        }
        context.run_command(&mut lock).await?;

        let contents = fs_err::tokio::read_to_string(&lockfile_filename).await?;
        Ok(serde_yaml::from_str(&contents)?)
    }
}
