//! Config plugins: self-describing settings structures per backend.
//!
//! Each pluggable backend exposes the fields it understands together with a
//! help string and the default value, so operators can discover tunables
//! without reading the source.

use conda_store_storage::{LocalStorageConfig, S3StorageConfig};

/// One configurable field of a plugin.
#[derive(Debug, Clone)]
pub struct ConfigField {
    pub name: &'static str,
    pub help: &'static str,
    /// JSON rendering of the default value.
    pub default: String,
}

/// The configuration surface of one plugin.
#[derive(Debug, Clone)]
pub struct ConfigDescription {
    pub name: &'static str,
    pub synopsis: &'static str,
    pub fields: Vec<ConfigField>,
}

fn json_default<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).expect("config defaults serialize to json")
}

/// The config descriptions of the builtin plugins.
pub fn builtin_config_descriptions() -> Vec<ConfigDescription> {
    let local = LocalStorageConfig::default();
    let s3 = S3StorageConfig::default();
    vec![
        ConfigDescription {
            name: "local-storage",
            synopsis: "Config for the local storage plugin",
            fields: vec![
                ConfigField {
                    name: "storage_path",
                    help: "directory to store binary blobs of conda-store artifacts",
                    default: json_default(&local.storage_path),
                },
                ConfigField {
                    name: "storage_url",
                    help: "unauthenticated url where artifacts in storage path are being served from",
                    default: json_default(&local.storage_url),
                },
            ],
        },
        ConfigDescription {
            name: "s3-storage",
            synopsis: "Config for the s3 storage plugin",
            fields: vec![
                ConfigField {
                    name: "internal_endpoint",
                    help: "internal endpoint to reach s3 bucket e.g. 'minio:9000', used by conda-store for get/set of blobs",
                    default: json_default(&s3.internal_endpoint),
                },
                ConfigField {
                    name: "external_endpoint",
                    help: "external endpoint to reach s3 bucket e.g. 'localhost:9000', used by users for fetching blobs",
                    default: json_default(&s3.external_endpoint),
                },
                ConfigField {
                    name: "access_key",
                    help: "access key for the s3 bucket",
                    default: json_default(&s3.access_key),
                },
                ConfigField {
                    name: "secret_key",
                    help: "secret key for the s3 bucket",
                    default: json_default(&s3.secret_key),
                },
                ConfigField {
                    name: "region",
                    help: "region of the s3 bucket",
                    default: json_default(&s3.region),
                },
                ConfigField {
                    name: "bucket_name",
                    help: "name of the s3 bucket",
                    default: json_default(&s3.bucket_name),
                },
                ConfigField {
                    name: "internal_secure",
                    help: "use a tls connection towards the internal endpoint",
                    default: json_default(&s3.internal_secure),
                },
                ConfigField {
                    name: "external_secure",
                    help: "use a tls connection towards the external endpoint",
                    default: json_default(&s3.external_secure),
                },
            ],
        },
        ConfigDescription {
            name: "conda-lock",
            synopsis: "Config for the conda-lock locker plugin",
            fields: vec![
                ConfigField {
                    name: "conda_command",
                    help: "conda compatible executable used by the solver",
                    default: "\"mamba\"".to_string(),
                },
                ConfigField {
                    name: "conda_flags",
                    help: "channel priority flags passed to the solver via CONDA_FLAGS",
                    default: "\"--strict-channel-priority\"".to_string(),
                },
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_descriptions_are_complete() {
        let descriptions = builtin_config_descriptions();
        let names: Vec<&str> = descriptions.iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["local-storage", "s3-storage", "conda-lock"]);
        for description in &descriptions {
            assert!(!description.fields.is_empty());
            for field in &description.fields {
                assert!(!field.help.is_empty(), "{} lacks help", field.name);
                serde_json::from_str::<serde_json::Value>(&field.default)
                    .expect("default is valid json");
            }
        }
    }
}
