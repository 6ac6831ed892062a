// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Datalake Developers. All Rights Reserved.

//! Explicit configuration for the datalake client.
//!
//! Nothing in the library reads the process environment on its own. Callers
//! build a [`Settings`] value, either directly or with [`Settings::load`], and
//! pass the relevant section to each constructor.
//!
//! [`Settings::load`] layers three sources, later ones winning:
//!
//! 1. Built-in defaults ([`Settings::default`])
//! 2. A TOML file: the explicit path if given, otherwise `datalake.toml` in
//!    the platform config directory (optional)
//! 3. Environment variables prefixed with `DATALAKE__`, using `__` between
//!    nested keys, e.g. `DATALAKE__STORAGE__ENDPOINT=http://localhost:9000`
//!    or `DATALAKE__DATASET__WEIGHTS=0.8,0.1,0.1`

use crate::Error;
use config::{Config, Environment, File};
use directories::ProjectDirs;
use log::debug;
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

const ENV_PREFIX: &str = "DATALAKE";

/// Complete client configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Object storage connection.
    pub storage: StoreConfig,
    /// External dataset registry connection.
    pub registry: RegistryConfig,
    /// Bucket names used by the pipeline.
    pub buckets: BucketConfig,
    /// Bulk upload tuning.
    pub upload: UploadConfig,
    /// Defaults for newly created datasets.
    pub dataset: DatasetConfig,
}

impl Settings {
    /// Load settings from defaults, an optional TOML file and `DATALAKE__*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let file = match path {
            Some(path) => Some((path.to_path_buf(), true)),
            None => default_config_path().map(|path| (path, false)),
        };

        let mut builder = Config::builder().add_source(Config::try_from(&Settings::default())?);

        if let Some((path, required)) = file {
            debug!("Loading configuration file {:?} (required={})", path, required);
            builder = builder.add_source(File::from(path).required(required));
        }

        let settings: Settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("dataset.weights")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), Error> {
        if self.upload.max_workers == 0 {
            return Err(Error::InvalidParameters(
                "upload.max_workers must be at least 1".to_owned(),
            ));
        }
        if self.dataset.weights.len() != 3 {
            return Err(Error::InvalidParameters(format!(
                "dataset.weights must have 3 entries, got {}",
                self.dataset.weights.len()
            )));
        }
        Ok(())
    }
}

/// Default location of the configuration file, if the platform has one.
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("dev", "Datalake", "Datalake")
        .map(|dirs| dirs.config_dir().join("datalake.toml"))
}

/// Connection parameters for an S3 compatible object store (MinIO, AWS).
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Endpoint URL or `host:port`; `None` uses the AWS default resolver.
    pub endpoint: Option<String>,
    /// Signing region.
    pub region: String,
    /// Access key; falls back to the default credential chain when unset.
    pub access_key: Option<String>,
    /// Secret key; falls back to the default credential chain when unset.
    pub secret_key: Option<String>,
    /// Use HTTPS when the endpoint is given without a scheme.
    pub secure: bool,
    /// Per-operation timeout in seconds.
    pub timeout: u64,
}

impl StoreConfig {
    /// Per-operation timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Endpoint URL with a scheme, honoring [`StoreConfig::secure`].
    pub fn endpoint_url(&self) -> Option<String> {
        self.endpoint.as_ref().map(|endpoint| {
            if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
                endpoint.clone()
            } else if self.secure {
                format!("https://{}", endpoint)
            } else {
                format!("http://{}", endpoint)
            }
        })
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: "us-east-1".to_owned(),
            access_key: None,
            secret_key: None,
            secure: false,
            timeout: 30,
        }
    }
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "***"))
            .field("secure", &self.secure)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Connection parameters for the external dataset registry.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Base URL of the datasets server API.
    pub base_url: String,
    /// Default bearer token for gated datasets.
    pub token: Option<String>,
    /// Request timeout in seconds.
    pub timeout: u64,
    /// Maximum retries for transient HTTP failures.
    pub max_retries: u32,
}

impl RegistryConfig {
    /// Request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: "https://datasets-server.huggingface.co".to_owned(),
            token: None,
            timeout: 30,
            max_retries: 3,
        }
    }
}

impl std::fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

/// Buckets the pipeline reads from and writes to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    /// Raw data sources awaiting preparation.
    pub data_sources: String,
    /// Prepared datasets.
    pub datasets: String,
    /// Enable versioning when buckets are created.
    pub versioning: bool,
}

impl BucketConfig {
    /// Every bucket the pipeline needs, in setup order.
    pub fn all(&self) -> Vec<String> {
        vec![self.data_sources.clone(), self.datasets.clone()]
    }
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            data_sources: "data-sources".to_owned(),
            datasets: "datasets".to_owned(),
            versioning: true,
        }
    }
}

/// Bulk upload tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Maximum number of concurrent upload tasks.
    pub max_workers: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self { max_workers: 10 }
    }
}

/// Defaults applied to newly created datasets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Seed for the split generator.
    pub seed: String,
    /// Train, test and validation weights.
    pub weights: Vec<f64>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            seed: "e2e".to_owned(),
            weights: vec![0.6, 0.2, 0.2],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write as _;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.storage.region, "us-east-1");
        assert_eq!(settings.storage.timeout(), Duration::from_secs(30));
        assert_eq!(settings.upload.max_workers, 10);
        assert_eq!(settings.dataset.seed, "e2e");
        assert_eq!(settings.dataset.weights, vec![0.6, 0.2, 0.2]);
        assert_eq!(settings.buckets.all(), vec!["data-sources", "datasets"]);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_endpoint_url_scheme() {
        let mut store = StoreConfig {
            endpoint: Some("localhost:9000".to_owned()),
            ..Default::default()
        };
        assert_eq!(store.endpoint_url().as_deref(), Some("http://localhost:9000"));

        store.secure = true;
        assert_eq!(store.endpoint_url().as_deref(), Some("https://localhost:9000"));

        store.endpoint = Some("http://minio:9000".to_owned());
        assert_eq!(store.endpoint_url().as_deref(), Some("http://minio:9000"));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let store = StoreConfig {
            secret_key: Some("hunter2".to_owned()),
            ..Default::default()
        };
        assert!(!format!("{:?}", store).contains("hunter2"));

        let registry = RegistryConfig {
            token: Some("hf_secret".to_owned()),
            ..Default::default()
        };
        assert!(!format!("{:?}", registry).contains("hf_secret"));
    }

    #[test]
    #[serial]
    fn test_load_file_and_environment() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[storage]\nendpoint = \"minio:9000\"\ntimeout = 5\n\n[buckets]\ndatasets = \"prepared\"\n"
        )
        .unwrap();

        // SAFETY: serialized with the other environment tests.
        unsafe {
            std::env::set_var("DATALAKE__UPLOAD__MAX_WORKERS", "4");
            std::env::set_var("DATALAKE__DATASET__WEIGHTS", "0.8,0.1,0.1");
        }
        let settings = Settings::load(Some(file.path()));
        unsafe {
            std::env::remove_var("DATALAKE__UPLOAD__MAX_WORKERS");
            std::env::remove_var("DATALAKE__DATASET__WEIGHTS");
        }

        let settings = settings.unwrap();
        assert_eq!(settings.storage.endpoint.as_deref(), Some("minio:9000"));
        assert_eq!(settings.storage.timeout, 5);
        assert_eq!(settings.buckets.datasets, "prepared");
        assert_eq!(settings.buckets.data_sources, "data-sources");
        assert_eq!(settings.upload.max_workers, 4);
        assert_eq!(settings.dataset.weights, vec![0.8, 0.1, 0.1]);
    }

    #[test]
    #[serial]
    fn test_load_requires_explicit_file() {
        let result = Settings::load(Some(Path::new("/nonexistent/datalake.toml")));
        assert!(matches!(result, Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut settings = Settings::default();
        settings.upload.max_workers = 0;
        assert!(matches!(
            settings.validate(),
            Err(Error::InvalidParameters(_))
        ));
    }
}
