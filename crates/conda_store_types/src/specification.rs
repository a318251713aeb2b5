use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SpecificationError;

/// A user supplied description of a conda environment.
///
/// This mirrors the `environment.yaml` format understood by conda: a name, a
/// list of channels, a heterogeneous dependency list and optional environment
/// variables. The `dependencies` list contains conda match specs and at most
/// one nested `pip` block.
#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CondaSpecification {
    /// The name of the environment.
    pub name: String,

    /// Channels used to resolve dependencies. When empty the configured
    /// default channels are substituted by the channel policy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<String>,

    /// Conda match specs, plus at most one nested pip block.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,

    /// Variables dumped into the state of the target environment.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub variables: IndexMap<String, String>,

    /// The preferred path to the environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<PathBuf>,
}

/// A single element of the `dependencies` section: either a conda match spec
/// or the nested pip block.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Dependency {
    /// A conda match spec such as `numpy=1.26`.
    MatchSpec(String),
    /// A list of pip requirements and pip flags.
    Pip(PipDependencies),
}

impl Dependency {
    /// Returns the match spec if this is a conda dependency.
    pub fn as_match_spec(&self) -> Option<&str> {
        match self {
            Dependency::MatchSpec(spec) => Some(spec),
            Dependency::Pip(_) => None,
        }
    }

    /// Returns the pip block if this is one.
    pub fn as_pip(&self) -> Option<&PipDependencies> {
        match self {
            Dependency::MatchSpec(_) => None,
            Dependency::Pip(pip) => Some(pip),
        }
    }
}

/// The nested `{"pip": [...]}` block of a dependency list. Entries are either
/// PEP 508 requirements or pip flags (tokens starting with `--`), the latter
/// are passed through untouched.
#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PipDependencies {
    pub pip: Vec<String>,
}

impl CondaSpecification {
    /// Parses and structurally validates a user submitted document.
    pub fn parse(value: &serde_json::Value) -> Result<Self, SpecificationError> {
        let specification: CondaSpecification = serde_json::from_value(value.clone())
            .map_err(|err| SpecificationError::InvalidSpecification {
                reason: err.to_string(),
            })?;
        specification.validate()?;
        Ok(specification)
    }

    /// Structural checks that serde cannot express.
    pub fn validate(&self) -> Result<(), SpecificationError> {
        if !crate::is_valid_name(&self.name) {
            return Err(SpecificationError::InvalidName {
                name: self.name.clone(),
            });
        }

        let pip_blocks = self.dependencies.iter().filter(|d| d.as_pip().is_some()).count();
        if pip_blocks > 1 {
            return Err(SpecificationError::InvalidSpecification {
                reason: format!("expected at most one pip block, found {pip_blocks}"),
            });
        }
        Ok(())
    }

    /// All conda match specs in the dependency list.
    pub fn match_specs(&self) -> impl Iterator<Item = &'_ str> + '_ {
        self.dependencies.iter().filter_map(Dependency::as_match_spec)
    }

    /// The pip requirement list, if a pip block is present.
    pub fn pip_specs(&self) -> Option<&[String]> {
        self.dependencies
            .iter()
            .find_map(Dependency::as_pip)
            .map(|pip| pip.pip.as_slice())
    }
}

/// A specification that carries an already solved lockfile. Builds for these
/// skip the solve step and install the lockfile directly.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LockfileSpecification {
    /// The name of the environment.
    pub name: String,

    /// The opaque lockfile document produced by a locker.
    pub lockfile: serde_json::Value,
}

impl LockfileSpecification {
    pub fn validate(&self) -> Result<(), SpecificationError> {
        if !crate::is_valid_name(&self.name) {
            return Err(SpecificationError::InvalidName {
                name: self.name.clone(),
            });
        }
        Ok(())
    }
}

/// Either kind of specification the service accepts.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Specification {
    /// A lockfile shaped document `{"name": ..., "lockfile": {...}}`.
    Lockfile(LockfileSpecification),
    /// A regular environment description.
    Conda(CondaSpecification),
}

impl Specification {
    /// Parses a user submitted document into either specification kind.
    pub fn parse(value: &serde_json::Value) -> Result<Self, SpecificationError> {
        let specification: Specification = serde_json::from_value(value.clone()).map_err(|err| {
            SpecificationError::InvalidSpecification {
                reason: err.to_string(),
            }
        })?;
        match &specification {
            Specification::Conda(spec) => spec.validate()?,
            Specification::Lockfile(spec) => spec.validate()?,
        }
        Ok(specification)
    }

    pub fn name(&self) -> &str {
        match self {
            Specification::Conda(spec) => &spec.name,
            Specification::Lockfile(spec) => &spec.name,
        }
    }

    pub fn is_lockfile(&self) -> bool {
        matches!(self, Specification::Lockfile(_))
    }

    /// The canonical JSON form of this specification. Key order is
    /// normalized so that semantically equivalent documents serialize to the
    /// same bytes.
    pub fn canonical(&self) -> String {
        let value = serde_json::to_value(self).expect("specification serializes to json");
        canonical_json(&value)
    }

    /// The content hash that identifies this specification.
    pub fn sha256(&self) -> String {
        hex::encode(Sha256::digest(self.canonical().as_bytes()))
    }
}

/// Serializes a JSON value deterministically: object keys sorted, compact
/// separators, UTF-8. Used to derive the content hash of a specification.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string serializes"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&serde_json::to_string(other).expect("scalar serializes")),
    }
}

/// Returns `true` when `path` points at a `.yaml`/`.yml` file whose contents
/// parse as a valid environment specification.
pub fn is_environment_file(path: &Path) -> bool {
    let Some(extension) = path.extension().and_then(|ext| ext.to_str()) else {
        return false;
    };
    if extension != "yaml" && extension != "yml" {
        return false;
    }
    let Ok(contents) = std::fs::read_to_string(path) else {
        return false;
    };
    let Ok(value) = serde_yaml::from_str::<serde_json::Value>(&contents) else {
        return false;
    };
    CondaSpecification::parse(&value).is_ok()
}

/// Yields each given path that points at a valid environment file. For
/// directories the immediate children are considered, without recursing.
pub fn discover_environments(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut environments = Vec::new();
    for path in paths {
        if path.is_file() && is_environment_file(path) {
            environments.push(path.clone());
        } else if path.is_dir() {
            let Ok(entries) = std::fs::read_dir(path) else {
                continue;
            };
            let mut children: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|child| is_environment_file(child))
                .collect();
            children.sort();
            environments.extend(children);
        }
    }
    environments
}
