use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a build. Terminal states are never left again; only
/// the reaper may move a build out of `Building` on the build's behalf.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    sqlx::Type,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum BuildStatus {
    Queued,
    Building,
    Completed,
    Failed,
    Canceled,
}

impl BuildStatus {
    /// Terminal states set `ended_on` and are never left again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildStatus::Completed | BuildStatus::Failed | BuildStatus::Canceled
        )
    }
}

/// The kinds of byte blobs a build can produce.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    sqlx::Type,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildArtifactType {
    Directory,
    Lockfile,
    Logs,
    Yaml,
    CondaPack,
    ConstructorInstaller,
    DockerManifest,
    ContainerRegistry,
}

/// A namespace groups environments and is the unit of authorization.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Namespace {
    pub id: i64,
    pub name: String,
    pub metadata: sqlx::types::Json<serde_json::Value>,
    pub deleted_on: Option<DateTime<Utc>>,
}

/// An environment is a named pointer within a namespace tracking the latest
/// completed build. Rows are always fetched joined with their namespace.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Environment {
    pub id: i64,
    pub namespace_id: i64,
    pub namespace_name: String,
    pub name: String,
    pub description: Option<String>,
    pub current_build_id: Option<i64>,
    pub specification_id: Option<i64>,
    pub deleted_on: Option<DateTime<Utc>>,
}

/// A validated, canonicalized environment description. Immutable after
/// insert; shared by every build whose submission hashed to `sha256`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Specification {
    pub id: i64,
    pub name: String,
    pub spec: sqlx::types::Json<serde_json::Value>,
    pub sha256: String,
    pub is_lockfile: bool,
    pub created_on: DateTime<Utc>,
}

/// One attempt to realize a specification on disk.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Build {
    pub id: i64,
    pub environment_id: i64,
    pub specification_id: i64,
    pub status: BuildStatus,
    pub status_info: Option<String>,
    pub size: i64,
    pub scheduled_on: DateTime<Utc>,
    pub started_on: Option<DateTime<Utc>>,
    pub ended_on: Option<DateTime<Utc>>,
    pub deleted_on: Option<DateTime<Utc>>,
}

impl Build {
    /// The deterministic identity used to derive artifact keys and the
    /// install prefix for this build.
    pub fn key(&self, specification: &Specification) -> String {
        let short_sha = &specification.sha256[..specification.sha256.len().min(8)];
        format!("{}-{}-{}", short_sha, self.id, specification.name)
    }

    pub fn log_key(&self, specification: &Specification) -> String {
        format!("logs/{}.log", self.key(specification))
    }

    pub fn conda_lock_key(&self, specification: &Specification) -> String {
        format!("lockfile/{}.json", self.key(specification))
    }

    pub fn conda_env_export_key(&self, specification: &Specification) -> String {
        format!("yaml/{}.yaml", self.key(specification))
    }

    pub fn conda_pack_key(&self, specification: &Specification) -> String {
        format!("archive/{}.tar.gz", self.key(specification))
    }

    pub fn constructor_installer_key(&self, specification: &Specification, ext: &str) -> String {
        format!("installer/{}.{}", self.key(specification), ext)
    }

    /// The install prefix of this build below the store directory.
    pub fn build_path(&self, store_directory: &Path, specification: &Specification) -> PathBuf {
        store_directory.join(self.key(specification))
    }
}

/// A byte blob produced by a build, addressed by an opaque storage key.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BuildArtifact {
    pub id: i64,
    pub build_id: i64,
    pub artifact_type: BuildArtifactType,
    pub key: String,
}

/// A solve-only request: lock a specification without installing it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Solve {
    pub id: i64,
    pub specification_id: i64,
    pub scheduled_on: DateTime<Utc>,
    pub started_on: Option<DateTime<Utc>>,
    pub ended_on: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CondaChannel {
    pub id: i64,
    pub name: String,
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CondaPackage {
    pub id: i64,
    pub channel_id: i64,
    pub name: String,
    pub version: String,
    pub license: Option<String>,
    pub license_family: Option<String>,
    pub summary: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CondaPackageBuild {
    pub id: i64,
    pub package_id: i64,
    pub build: String,
    pub build_number: i64,
    pub subdir: String,
    pub sha256: Option<String>,
    pub md5: Option<String>,
    pub size: i64,
    pub depends: sqlx::types::Json<serde_json::Value>,
    pub constrains: sqlx::types::Json<serde_json::Value>,
    pub timestamp: Option<i64>,
}

/// Flattened view of a package installed into a build, as needed by package
/// listings and the legacy explicit lockfile rendering.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BuildPackage {
    pub channel_name: String,
    pub name: String,
    pub version: String,
    pub build: String,
    pub build_number: i64,
    pub subdir: String,
    pub md5: Option<String>,
    pub size: i64,
}

/// Grants `role` on objects inside `namespace_id` to entities matching the
/// `entity` glob (`ns-glob/env-glob`).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NamespaceRoleMapping {
    pub id: i64,
    pub namespace_id: i64,
    pub entity: String,
    pub role: String,
}

/// Grants `role` on `namespace` to every member of `other_namespace`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NamespaceRole {
    pub id: i64,
    pub namespace: String,
    pub other_namespace: String,
    pub role: String,
}

/// Per-namespace aggregate counters for the metrics endpoint.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NamespaceMetrics {
    pub namespace: String,
    pub environment_count: i64,
    pub build_count: i64,
    pub storage_used: i64,
}
