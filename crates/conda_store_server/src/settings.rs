use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use conda_store_db::entities::BuildArtifactType;
use conda_store_storage::{LocalStorageConfig, S3StorageConfig};
use conda_store_types::{current_platform, ChannelPolicy, PackagePolicy};

use crate::error::CondaStoreError;

/// All tunables of the service.
///
/// The base settings come from the TOML config file; per-namespace and
/// per-environment overrides are merged on top from the key-value store (see
/// [`Settings::merged`]). Builds operate on a resolved snapshot, never on
/// live settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Connection string of the metadata database.
    pub database_url: String,

    /// Directory below which build prefixes are installed.
    pub store_directory: PathBuf,

    /// Template for the stable symlink pointing at the current build of an
    /// environment. `{store_directory}`, `{namespace}` and `{name}` are
    /// substituted. Empty disables the symlink.
    pub environment_directory: String,

    /// Conda compatible executable used for solves and exports.
    pub conda_command: String,

    /// Channel priority flags passed to the solver via `CONDA_FLAGS`.
    pub conda_flags: String,

    /// Alias used to fully qualify bare channel names.
    pub conda_channel_alias: String,

    /// Channels substituted when a specification requests none.
    pub conda_default_channels: Vec<String>,

    /// When non-empty, the only channels a specification may request.
    pub conda_allowed_channels: Vec<String>,

    /// Conda packages substituted when a specification has no dependencies.
    pub conda_default_packages: Vec<String>,

    /// Conda packages appended to every specification.
    pub conda_included_packages: Vec<String>,

    /// Conda packages every specification must contain.
    pub conda_required_packages: Vec<String>,

    pub pypi_default_packages: Vec<String>,
    pub pypi_included_packages: Vec<String>,
    pub pypi_required_packages: Vec<String>,

    /// Platforms the locker solves for.
    pub conda_solve_platforms: Vec<String>,

    /// Shared package cache; defaults to `pkgs` below the store directory.
    pub conda_package_cache: Option<PathBuf>,

    /// Ownership applied to finished build prefixes.
    pub default_uid: Option<u32>,
    pub default_gid: Option<u32>,

    /// Octal permission string (e.g. `775`) applied to finished prefixes.
    pub default_permissions: Option<String>,

    /// Name of the locker plugin registered for builds.
    pub locker_plugin_name: String,

    /// Name of the storage plugin active for the process.
    pub storage_plugin_name: String,

    /// Artifacts produced after a completed build.
    pub build_artifacts: Vec<BuildArtifactType>,

    pub local_storage: LocalStorageConfig,
    pub s3_storage: S3StorageConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://conda-store.db".to_string(),
            store_directory: PathBuf::from("conda-store-state"),
            environment_directory: "{store_directory}/{namespace}/envs/{name}".to_string(),
            conda_command: "mamba".to_string(),
            conda_flags: "--strict-channel-priority".to_string(),
            conda_channel_alias: "https://conda.anaconda.org".to_string(),
            conda_default_channels: vec!["conda-forge".to_string()],
            conda_allowed_channels: Vec::new(),
            conda_default_packages: Vec::new(),
            conda_included_packages: Vec::new(),
            conda_required_packages: Vec::new(),
            pypi_default_packages: Vec::new(),
            pypi_included_packages: Vec::new(),
            pypi_required_packages: Vec::new(),
            conda_solve_platforms: vec![current_platform()],
            conda_package_cache: None,
            default_uid: None,
            default_gid: None,
            default_permissions: None,
            locker_plugin_name: "conda-lock".to_string(),
            storage_plugin_name: "local".to_string(),
            build_artifacts: vec![
                BuildArtifactType::Yaml,
                BuildArtifactType::CondaPack,
                BuildArtifactType::ConstructorInstaller,
            ],
            local_storage: LocalStorageConfig::default(),
            s3_storage: S3StorageConfig::default(),
        }
    }
}

/// Fields that only make sense process-wide; rejecting them at namespace or
/// environment scope keeps a scoped override from, say, swapping the
/// database out from under a build.
pub const GLOBAL_ONLY_FIELDS: &[&str] = &[
    "database_url",
    "store_directory",
    "locker_plugin_name",
    "storage_plugin_name",
    "local_storage",
    "s3_storage",
];

impl Settings {
    /// Reads base settings from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, CondaStoreError> {
        let contents = fs_err::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|err| CondaStoreError::Config(format!("{}: {err}", path.display())))
    }

    /// Applies key-value overrides in order; later maps win field-wise.
    /// Values are JSON encoded. Unknown fields are skipped with a warning so
    /// stale rows cannot brick settings resolution.
    pub fn merged(
        &self,
        overrides: &[BTreeMap<String, String>],
    ) -> Result<Settings, CondaStoreError> {
        let mut value = serde_json::to_value(self)?;
        let fields = value
            .as_object()
            .map(|object| object.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();

        for layer in overrides {
            for (field, raw) in layer {
                if !fields.iter().any(|known| known == field) {
                    tracing::warn!(field, "ignoring unknown settings override");
                    continue;
                }
                let parsed: serde_json::Value = serde_json::from_str(raw).map_err(|err| {
                    CondaStoreError::Config(format!("override '{field}' is not valid json: {err}"))
                })?;
                value[field.as_str()] = parsed;
            }
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Validates a single override before it is written to the key-value
    /// store.
    pub fn validate_override(field: &str, value: &str, scoped: bool) -> Result<(), CondaStoreError> {
        let defaults =
            serde_json::to_value(Settings::default()).expect("settings serialize to json");
        if defaults.get(field).is_none() {
            return Err(CondaStoreError::Config(format!(
                "unknown settings field '{field}'"
            )));
        }
        if scoped && GLOBAL_ONLY_FIELDS.contains(&field) {
            return Err(CondaStoreError::Config(format!(
                "settings field '{field}' can only be set globally"
            )));
        }
        serde_json::from_str::<serde_json::Value>(value).map_err(|err| {
            CondaStoreError::Config(format!("override '{field}' is not valid json: {err}"))
        })?;
        Ok(())
    }

    pub fn channel_policy(&self) -> Result<ChannelPolicy, CondaStoreError> {
        let channel_alias = Url::parse(&self.conda_channel_alias).map_err(|err| {
            CondaStoreError::Config(format!(
                "conda_channel_alias '{}' is not a valid url: {err}",
                self.conda_channel_alias
            ))
        })?;
        Ok(ChannelPolicy {
            channel_alias,
            default_channels: self.conda_default_channels.clone(),
            allowed_channels: self.conda_allowed_channels.clone(),
        })
    }

    pub fn conda_package_policy(&self) -> PackagePolicy {
        PackagePolicy {
            default_packages: self.conda_default_packages.clone(),
            included_packages: self.conda_included_packages.clone(),
            required_packages: self.conda_required_packages.clone(),
        }
    }

    pub fn pypi_package_policy(&self) -> PackagePolicy {
        PackagePolicy {
            default_packages: self.pypi_default_packages.clone(),
            included_packages: self.pypi_included_packages.clone(),
            required_packages: self.pypi_required_packages.clone(),
        }
    }

    /// The shared package cache directory.
    pub fn package_cache(&self) -> PathBuf {
        self.conda_package_cache
            .clone()
            .unwrap_or_else(|| self.store_directory.join("pkgs"))
    }

    /// Renders the environment symlink path for an environment, or `None`
    /// when symlinking is disabled.
    pub fn environment_path(&self, namespace: &str, name: &str) -> Option<PathBuf> {
        if self.environment_directory.is_empty() {
            return None;
        }
        let rendered = self
            .environment_directory
            .replace("{store_directory}", &self.store_directory.to_string_lossy())
            .replace("{namespace}", namespace)
            .replace("{name}", name);
        Some(PathBuf::from(rendered))
    }
}
