//! The externally visible steps of a build, each a blocking subprocess or
//! filesystem operation streaming its output into the build log under a
//! stage prefix.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::error::CondaStoreError;
use crate::lockfile;
use crate::plugins::context::PluginContext;

/// Fetches and extracts the lockfile's packages into the shared package
/// cache without linking them, so the install step hits a warm cache. The
/// cache is content addressed; concurrent writers of the same package write
/// identical bytes.
pub async fn fetch_and_extract_conda_packages(
    context: &PluginContext,
    lockfile_doc: &serde_json::Value,
    pkgs_dir: &Path,
    conda_command: &str,
    platform: &str,
) -> Result<(), CondaStoreError> {
    let Some(explicit) = lockfile::explicit_install_file(lockfile_doc, platform) else {
        context
            .log("lockfile has no conda packages for this platform, nothing to fetch")
            .await;
        return Ok(());
    };

    fs_err::tokio::create_dir_all(pkgs_dir).await?;
    let workdir = tempfile::tempdir()?;
    let explicit_filename = workdir.path().join("explicit.txt");
    fs_err::tokio::write(&explicit_filename, explicit).await?;
    let staging_prefix = workdir.path().join("staging");

    let mut command = Command::new(conda_command);
    command
        .arg("create")
        .arg("--prefix")
        .arg(&staging_prefix)
        .arg("--file")
        .arg(&explicit_filename)
        .arg("--download-only")
        .arg("--yes")
        .env("CONDA_PKGS_DIRS", pkgs_dir);
    context.run_command(&mut command).await
}

/// Installs the lockfile into the build prefix with `conda-lock install`.
pub async fn install_lockfile(
    context: &PluginContext,
    lockfile_doc: &serde_json::Value,
    conda_prefix: &Path,
    conda_command: &str,
    pkgs_dir: &Path,
) -> Result<(), CondaStoreError> {
    let workdir = tempfile::tempdir()?;
    let lockfile_filename = workdir.path().join("conda-lock.yaml");
    fs_err::tokio::write(&lockfile_filename, serde_yaml::to_string(lockfile_doc)?).await?;

    let mut command = Command::new("conda-lock");
    command
        .arg("install")
        .arg("--conda")
        .arg(conda_command)
        .arg("--prefix")
        .arg(conda_prefix)
        .arg(&lockfile_filename)
        .env("CONDA_PKGS_DIRS", pkgs_dir);
    context.run_command(&mut command).await
}

/// Repoints the stable environment path at a freshly installed prefix. The
/// swap goes through a temporary link plus rename, readers never observe a
/// missing link.
pub async fn symlink_environment(
    conda_prefix: &Path,
    environment_prefix: &Path,
) -> Result<(), CondaStoreError> {
    if let Some(parent) = environment_prefix.parent() {
        fs_err::tokio::create_dir_all(parent).await?;
    }

    let staging = environment_prefix.with_extension("link-staging");
    match fs_err::tokio::remove_file(&staging).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }

    #[cfg(unix)]
    tokio::fs::symlink(conda_prefix, &staging).await?;
    #[cfg(windows)]
    tokio::fs::symlink_dir(conda_prefix, &staging).await?;

    fs_err::tokio::rename(&staging, environment_prefix).await?;
    Ok(())
}

/// Applies the configured ownership and permissions to the finished prefix.
#[cfg(unix)]
pub async fn set_conda_prefix_permissions(
    context: &PluginContext,
    conda_prefix: &Path,
    permissions: Option<String>,
    uid: Option<u32>,
    gid: Option<u32>,
) -> Result<(), CondaStoreError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = match permissions.as_deref() {
        Some(permissions) => Some(u32::from_str_radix(permissions, 8).map_err(|_| {
            CondaStoreError::Config(format!(
                "default_permissions '{permissions}' is not an octal mode"
            ))
        })?),
        None => None,
    };

    if mode.is_none() && uid.is_none() && gid.is_none() {
        context.log("no permissions or ownership configured, skipping").await;
        return Ok(());
    }

    let prefix = conda_prefix.to_path_buf();
    let entries = tokio::task::spawn_blocking(move || -> std::io::Result<usize> {
        let mut count = 0usize;
        for entry in walkdir::WalkDir::new(&prefix) {
            let entry = entry.map_err(std::io::Error::other)?;
            if let Some(mode) = mode {
                std::fs::set_permissions(entry.path(), std::fs::Permissions::from_mode(mode))?;
            }
            if uid.is_some() || gid.is_some() {
                std::os::unix::fs::chown(entry.path(), uid, gid)?;
            }
            count += 1;
        }
        Ok(count)
    })
    .await
    .map_err(std::io::Error::other)??;

    context
        .log(&format!("updated permissions/ownership of {entries} paths"))
        .await;
    Ok(())
}

#[cfg(not(unix))]
pub async fn set_conda_prefix_permissions(
    context: &PluginContext,
    _conda_prefix: &Path,
    _permissions: Option<String>,
    _uid: Option<u32>,
    _gid: Option<u32>,
) -> Result<(), CondaStoreError> {
    context
        .log("prefix permissions are not supported on this platform, skipping")
        .await;
    Ok(())
}

/// Total on-disk size of the prefix in bytes.
pub async fn disk_usage(conda_prefix: &Path) -> Result<u64, CondaStoreError> {
    let prefix = conda_prefix.to_path_buf();
    let bytes = tokio::task::spawn_blocking(move || -> std::io::Result<u64> {
        let mut total = 0u64;
        for entry in walkdir::WalkDir::new(&prefix) {
            let entry = entry.map_err(std::io::Error::other)?;
            if entry.file_type().is_file() {
                total += entry.metadata().map_err(std::io::Error::other)?.len();
            }
        }
        Ok(total)
    })
    .await
    .map_err(std::io::Error::other)??;
    Ok(bytes)
}

/// Runs `conda env export` against the prefix and returns the parsed
/// document.
pub async fn generate_conda_export(
    context: &PluginContext,
    conda_command: &str,
    conda_prefix: &Path,
) -> Result<serde_json::Value, CondaStoreError> {
    let mut command = Command::new(conda_command);
    command
        .arg("env")
        .arg("export")
        .arg("--prefix")
        .arg(conda_prefix)
        .arg("--json");
    let output = context.run_command_output(&mut command).await?;
    Ok(serde_json::from_str(&output)?)
}

/// Produces `environment.tar.gz` from the prefix with conda-pack.
pub async fn generate_conda_pack(
    context: &PluginContext,
    conda_prefix: &Path,
    output_filename: &Path,
) -> Result<(), CondaStoreError> {
    let mut command = Command::new("conda-pack");
    command
        .arg("--prefix")
        .arg(conda_prefix)
        .arg("--output")
        .arg(output_filename);
    context.run_command(&mut command).await
}

/// Drives `constructor` over a rendered `construct.yaml` and returns the
/// produced installer, or `None` when constructor yielded nothing.
pub async fn generate_constructor_installer(
    context: &PluginContext,
    installer_dir: &Path,
    name: &str,
    version: &str,
    channels: &[String],
    specs: &[String],
) -> Result<Option<PathBuf>, CondaStoreError> {
    let construct = ConstructFile {
        name,
        version,
        channels,
        specs,
    };
    let construct_filename = installer_dir.join("construct.yaml");
    fs_err::tokio::write(&construct_filename, construct.render()).await?;

    let mut command = Command::new("constructor");
    command
        .arg(installer_dir)
        .arg("--output-dir")
        .arg(installer_dir);
    context.run_command(&mut command).await?;

    // constructor names its output after platform and installer type; take
    // whatever binary appeared next to construct.yaml.
    let mut entries = fs_err::tokio::read_dir(installer_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("sh") | Some("exe") | Some("pkg") => return Ok(Some(path)),
            _ => {}
        }
    }
    Ok(None)
}

struct ConstructFile<'a> {
    name: &'a str,
    version: &'a str,
    channels: &'a [String],
    specs: &'a [String],
}

impl ConstructFile<'_> {
    fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("name: {}\n", self.name));
        out.push_str(&format!("version: '{}'\n", self.version));
        out.push_str("installer_type: sh\n");
        out.push_str("channels:\n");
        for channel in self.channels {
            out.push_str(&format!("  - {channel}\n"));
        }
        out.push_str("specs:\n");
        for spec in self.specs {
            out.push_str(&format!("  - '{spec}'\n"));
        }
        out
    }
}
