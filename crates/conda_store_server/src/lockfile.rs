//! Read helpers over conda-lock documents.
//!
//! Lockfiles are carried as opaque JSON mappings; the core only ever reads
//! the `package` list to index installed packages, render explicit install
//! files and pin constructor specs.

use conda_store_db::api::CondaPackageRecord;

/// All conda managed package entries of the lockfile.
pub fn conda_packages(lockfile: &serde_json::Value) -> impl Iterator<Item = &serde_json::Value> {
    lockfile["package"]
        .as_array()
        .map(|packages| packages.as_slice())
        .unwrap_or_default()
        .iter()
        .filter(|package| package["manager"].as_str() == Some("conda"))
}

/// The conda package entries solved for one platform.
pub fn conda_packages_for_platform<'l>(
    lockfile: &'l serde_json::Value,
    platform: &'l str,
) -> impl Iterator<Item = &'l serde_json::Value> {
    conda_packages(lockfile).filter(move |package| package["platform"].as_str() == Some(platform))
}

/// Converts one lockfile entry into an indexable package record. Entries
/// whose URL does not follow the `<channel>/<subdir>/<filename>` convention
/// are skipped.
pub fn package_record(entry: &serde_json::Value) -> Option<CondaPackageRecord> {
    let name = entry["name"].as_str()?;
    let version = entry["version"].as_str()?;
    let url = entry["url"].as_str()?;

    let (channel, url_subdir, filename) = split_package_url(url)?;
    let subdir = entry["platform"]
        .as_str()
        .unwrap_or(url_subdir)
        .to_string();
    let build = build_string(filename, name, version)?;
    let build_number = build
        .rsplit('_')
        .next()
        .and_then(|suffix| suffix.parse::<i64>().ok())
        .unwrap_or(0);

    Some(CondaPackageRecord {
        channel: channel.to_string(),
        name: name.to_string(),
        version: version.to_string(),
        license: None,
        license_family: None,
        summary: None,
        description: None,
        build,
        build_number,
        subdir,
        sha256: entry["hash"]["sha256"].as_str().map(ToString::to_string),
        md5: entry["hash"]["md5"].as_str().map(ToString::to_string),
        size: 0,
        depends: entry
            .get("dependencies")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({})),
        constrains: serde_json::json!([]),
        timestamp: None,
    })
}

/// Renders the `@EXPLICIT` install file for one platform of the lockfile.
/// Returns `None` when the lockfile has no conda packages for the platform.
pub fn explicit_install_file(lockfile: &serde_json::Value, platform: &str) -> Option<String> {
    let lines: Vec<String> = conda_packages_for_platform(lockfile, platform)
        .filter_map(|package| {
            let url = package["url"].as_str()?;
            match package["hash"]["md5"].as_str() {
                Some(md5) => Some(format!("{url}#{md5}")),
                None => Some(url.to_string()),
            }
        })
        .collect();
    if lines.is_empty() {
        return None;
    }
    Some(format!("@EXPLICIT\n{}\n", lines.join("\n")))
}

/// Pinned `name=version=build` specs for one platform, as consumed by
/// constructor.
pub fn pinned_specs(lockfile: &serde_json::Value, platform: &str) -> Vec<String> {
    conda_packages_for_platform(lockfile, platform)
        .filter_map(|entry| {
            let record = package_record(entry)?;
            Some(format!(
                "{}={}={}",
                record.name, record.version, record.build
            ))
        })
        .collect()
}

fn split_package_url(url: &str) -> Option<(&str, &str, &str)> {
    let mut parts = url.rsplitn(3, '/');
    let filename = parts.next()?;
    let subdir = parts.next()?;
    let channel = parts.next()?;
    if channel.is_empty() || subdir.is_empty() || filename.is_empty() {
        return None;
    }
    Some((channel, subdir, filename))
}

fn build_string(filename: &str, name: &str, version: &str) -> Option<String> {
    let stem = filename
        .strip_suffix(".conda")
        .or_else(|| filename.strip_suffix(".tar.bz2"))?;
    stem.strip_prefix(&format!("{name}-{version}-"))
        .map(ToString::to_string)
}

#[cfg(test)]
pub(crate) fn sample_lockfile() -> serde_json::Value {
    serde_json::json!({
        "version": 1,
        "metadata": {"platforms": ["linux-64"]},
        "package": [
            {
                "name": "python",
                "version": "3.11.4",
                "manager": "conda",
                "platform": "linux-64",
                "dependencies": {"openssl": ">=3.0"},
                "url": "https://conda.anaconda.org/conda-forge/linux-64/python-3.11.4-h06a4308_1.conda",
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
                "platform": "linux-64",
                "dependencies": {"python": ">=3.11"},
                "url": "https://conda.anaconda.org/conda-forge/linux-64/numpy-1.26.0-py311_0.tar.bz2",
                "hash": {"md5": "b75683f8d9f5b58c19a8ec5d0b7f796e"},
                "category": "main",
                "optional": false
            },
            {
                "name": "requests",
                "version": "2.32.0",
                "manager": "pip",
                "platform": "linux-64",
                "dependencies": {},
                "url": "https://pypi.org/packages/requests-2.32.0.tar.gz",
                "hash": {},
                "category": "main",
                "optional": false
            },
            {
                "name": "python",
                "version": "3.11.4",
                "manager": "conda",
                "platform": "osx-arm64",
                "dependencies": {},
                "url": "https://conda.anaconda.org/conda-forge/osx-arm64/python-3.11.4-h0dc2134_1.conda",
                "hash": {"md5": "c75683f8d9f5b58c19a8ec5d0b7f796e"},
                "category": "main",
                "optional": false
            }
        ]
    })
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn filters_conda_packages_by_platform() {
        let lockfile = sample_lockfile();
        assert_eq!(conda_packages(&lockfile).count(), 3);
        assert_eq!(conda_packages_for_platform(&lockfile, "linux-64").count(), 2);
        assert_eq!(conda_packages_for_platform(&lockfile, "osx-arm64").count(), 1);
    }

    #[test]
    fn records_derive_channel_subdir_and_build() {
        let lockfile = sample_lockfile();
        let entry = conda_packages_for_platform(&lockfile, "linux-64").next().unwrap();
        let record = package_record(entry).unwrap();
        assert_eq!(record.channel, "https://conda.anaconda.org/conda-forge");
        assert_eq!(record.subdir, "linux-64");
        assert_eq!(record.name, "python");
        assert_eq!(record.version, "3.11.4");
        assert_eq!(record.build, "h06a4308_1");
        assert_eq!(record.build_number, 1);
        assert_eq!(
            record.md5.as_deref(),
            Some("a75683f8d9f5b58c19a8ec5d0b7f796e")
        );
    }

    #[test]
    fn explicit_file_lists_urls_with_hashes() {
        let lockfile = sample_lockfile();
        let explicit = explicit_install_file(&lockfile, "linux-64").unwrap();
        assert!(explicit.starts_with("@EXPLICIT\n"));
        assert!(explicit.contains(
            "python-3.11.4-h06a4308_1.conda#a75683f8d9f5b58c19a8ec5d0b7f796e"
        ));
        assert!(!explicit.contains("requests"), "pip packages are not explicit urls");
        assert!(explicit_install_file(&lockfile, "win-64").is_none());
    }

    #[test]
    fn pinned_specs_for_constructor() {
        let lockfile = sample_lockfile();
        assert_eq!(
            pinned_specs(&lockfile, "linux-64"),
            vec!["python=3.11.4=h06a4308_1", "numpy=1.26.0=py311_0"]
        );
    }
}
