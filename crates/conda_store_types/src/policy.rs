use std::collections::BTreeSet;

use url::Url;

use crate::channel::normalize_channel_name;
use crate::error::SpecificationError;
use crate::specification::{CondaSpecification, Dependency, PipDependencies};

/// Channel rules applied to every submitted specification.
#[derive(Debug, Clone)]
pub struct ChannelPolicy {
    /// Alias used to qualify bare channel names.
    pub channel_alias: Url,
    /// Channels substituted when a specification requests none.
    pub default_channels: Vec<String>,
    /// When non-empty, the only channels a specification may request.
    pub allowed_channels: Vec<String>,
}

/// Package rules applied to the conda or pip dependency list.
#[derive(Debug, Clone, Default)]
pub struct PackagePolicy {
    /// Packages substituted when the dependency list is empty.
    pub default_packages: Vec<String>,
    /// Packages appended when not already present.
    pub included_packages: Vec<String>,
    /// Packages that must be present, on pain of rejection.
    pub required_packages: Vec<String>,
}

/// Substitutes default channels and enforces the allowed channel set.
///
/// Channels are compared in normalized form so `conda-forge` and
/// `https://conda.anaconda.org/conda-forge` are the same channel. The
/// specification itself keeps the channels the user wrote.
pub fn apply_channel_policy(
    specification: &mut CondaSpecification,
    policy: &ChannelPolicy,
) -> Result<(), SpecificationError> {
    if specification.channels.is_empty() {
        specification.channels = policy.default_channels.clone();
    }

    if policy.allowed_channels.is_empty() {
        return Ok(());
    }

    let allowed: BTreeSet<String> = policy
        .allowed_channels
        .iter()
        .map(|channel| normalize_channel_name(&policy.channel_alias, channel))
        .collect();

    let denied: Vec<String> = specification
        .channels
        .iter()
        .map(|channel| normalize_channel_name(&policy.channel_alias, channel))
        .filter(|channel| !allowed.contains(channel))
        .collect();

    if !denied.is_empty() {
        return Err(SpecificationError::ChannelNotAllowed { channels: denied });
    }
    Ok(())
}

/// Substitutes default packages, appends included packages and checks that
/// every required package is present in the conda dependency list.
pub fn apply_conda_package_policy(
    specification: &mut CondaSpecification,
    policy: &PackagePolicy,
) -> Result<(), SpecificationError> {
    if specification.dependencies.is_empty() {
        specification.dependencies = policy
            .default_packages
            .iter()
            .cloned()
            .map(Dependency::MatchSpec)
            .collect();
    }

    let present: BTreeSet<String> = specification
        .match_specs()
        .map(conda_package_name)
        .collect();

    for spec in &policy.included_packages {
        if !present.contains(&conda_package_name(spec)) {
            specification
                .dependencies
                .push(Dependency::MatchSpec(spec.clone()));
        }
    }

    let present: BTreeSet<String> = specification
        .match_specs()
        .map(conda_package_name)
        .collect();
    let missing: Vec<String> = policy
        .required_packages
        .iter()
        .filter(|spec| !present.contains(&conda_package_name(spec)))
        .cloned()
        .collect();

    if !missing.is_empty() {
        return Err(SpecificationError::PackageRequired { packages: missing });
    }
    Ok(())
}

/// The pip analog of [`apply_conda_package_policy`], operating on the nested
/// pip block. Pip flags (tokens starting with `--`) are never parsed as
/// requirements and pass through untouched.
pub fn apply_pip_package_policy(
    specification: &mut CondaSpecification,
    policy: &PackagePolicy,
) -> Result<(), SpecificationError> {
    if specification.pip_specs().map_or(true, <[String]>::is_empty)
        && !policy.default_packages.is_empty()
    {
        append_pip_packages(specification, policy.default_packages.clone());
    }

    let present = pip_package_names(specification);
    let included: Vec<String> = policy
        .included_packages
        .iter()
        .filter(|spec| !present.contains(&pip_key(spec)))
        .cloned()
        .collect();
    if !included.is_empty() {
        append_pip_packages(specification, included);
    }

    let present = pip_package_names(specification);
    let missing: Vec<String> = policy
        .required_packages
        .iter()
        .filter(|spec| !present.contains(&pip_key(spec)))
        .cloned()
        .collect();

    if !missing.is_empty() {
        return Err(SpecificationError::PackageRequired { packages: missing });
    }
    Ok(())
}

fn pip_package_names(specification: &CondaSpecification) -> BTreeSet<String> {
    specification
        .pip_specs()
        .unwrap_or_default()
        .iter()
        .map(|spec| pip_key(spec))
        .collect()
}

/// Flags index under their full text, requirements under their name.
fn pip_key(spec: &str) -> String {
    pip_package_name(spec).unwrap_or_else(|| spec.to_string())
}

fn append_pip_packages(specification: &mut CondaSpecification, packages: Vec<String>) {
    for dependency in &mut specification.dependencies {
        if let Dependency::Pip(block) = dependency {
            block.pip.extend(packages);
            return;
        }
    }
    specification
        .dependencies
        .push(Dependency::Pip(PipDependencies { pip: packages }));
}

/// Extracts the package name from a conda match spec, i.e. the part before
/// any version or build constraint, lowercased. A `channel::name` prefix is
/// stripped.
pub fn conda_package_name(spec: &str) -> String {
    let name = spec
        .split(|c| matches!(c, '=' | '<' | '>' | '!' | '~' | ' ' | '['))
        .next()
        .unwrap_or(spec);
    let name = name.rsplit("::").next().unwrap_or(name);
    name.to_lowercase()
}

/// Extracts the distribution name from a pip requirement. Returns `None` for
/// pip flags, which have no name to extract.
pub fn pip_package_name(spec: &str) -> Option<String> {
    if spec.starts_with("--") {
        return None;
    }
    let name = spec
        .split(|c| matches!(c, '=' | '<' | '>' | '!' | '~' | ';' | ' ' | '[' | '('))
        .next()
        .unwrap_or(spec);
    Some(name.to_lowercase().replace('_', "-"))
}
