//! Run configuration, built once at startup and handed to the orchestrator.

use std::path::{Path, PathBuf};
use std::time::Duration;

use backon::ExponentialBuilder;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEDUP_STORE_ENV: &str = "CCHARVEST_DEDUP_STORE";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarvestConfig {
    pub snapshot: String,
    pub base_url: String,
    pub target_language: String,
    pub min_document_length: usize,
    pub managers: usize,
    pub workers_per_manager: usize,
    pub start_index: usize,
    pub index_dir: Option<PathBuf>,
    pub warc_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub reuse_dirs: bool,
    pub dedup_store: Option<String>,
    pub dedup_mode: DedupMode,
    pub max_open_output_files: usize,
    pub retry: RetryConfig,
    pub log: LogConfig,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            snapshot: "CC-MAIN-2023-23".to_owned(),
            base_url: "https://data.commoncrawl.org".to_owned(),
            target_language: "fas".to_owned(),
            min_document_length: 500,
            managers: 2,
            workers_per_manager: 2,
            start_index: 0,
            index_dir: None,
            warc_dir: None,
            output_dir: None,
            reuse_dirs: false,
            dedup_store: None,
            dedup_mode: DedupMode::Claim,
            max_open_output_files: 256,
            retry: RetryConfig::default(),
            log: LogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DedupMode {
    /// Insert the digest first and write output only if the insert won.
    Claim,
    /// Check for the digest, write output, then insert it.
    CheckThenInsert,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub connect: u32,
    pub read: u32,
    pub redirects: usize,
    pub status: u32,
    pub status_forcelist: Vec<u16>,
    pub backoff_factor: f64,
    pub backoff_max_secs: f64,
    pub chunk_size: usize,
    pub connect_timeout_secs: u64,
    pub timeout_secs: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            connect: 5,
            read: 2,
            redirects: 5,
            status: 5,
            status_forcelist: vec![500, 502, 503, 504],
            backoff_factor: 0.1,
            backoff_max_secs: 120.0,
            chunk_size: 8192,
            connect_timeout_secs: 30,
            timeout_secs: None,
        }
    }
}

impl RetryConfig {
    /// Delay schedule for one failure kind: `backoff_factor` seconds, doubling
    /// per retry up to `backoff_max_secs`, yielding at most `budget` delays.
    pub fn backoff(&self, budget: u32) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(seconds(self.backoff_factor))
            .with_max_delay(seconds(self.backoff_max_secs))
            .with_factor(2.0)
            .with_max_times(budget as usize)
    }
}

fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    pub file: Option<PathBuf>,
    pub max_bytes: u64,
    pub file_filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file: Some(PathBuf::from("harvest.log")),
            max_bytes: 30_000_000,
            file_filter: "debug".to_owned(),
        }
    }
}

impl HarvestConfig {
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&yaml).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.snapshot.trim().is_empty() {
            return Err(ConfigError::Invalid("snapshot must not be empty".to_owned()));
        }
        if self.target_language.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "target_language must not be empty".to_owned(),
            ));
        }
        if self.managers == 0 || self.workers_per_manager == 0 {
            return Err(ConfigError::Invalid(
                "managers and workers_per_manager must be at least 1".to_owned(),
            ));
        }
        if self.max_open_output_files == 0 {
            return Err(ConfigError::Invalid(
                "max_open_output_files must be at least 1".to_owned(),
            ));
        }
        let base = url::Url::parse(&self.base_url)
            .map_err(|err| ConfigError::Invalid(format!("base_url {:?}: {err}", self.base_url)))?;
        if base.scheme() != "http" && base.scheme() != "https" {
            return Err(ConfigError::Invalid(format!(
                "base_url must be http/https: {}",
                self.base_url
            )));
        }
        Ok(())
    }

    pub fn base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    pub fn catalog_url(&self) -> String {
        format!(
            "{}/crawl-data/{}/cc-index.paths.gz",
            self.base_url(),
            self.snapshot
        )
    }

    /// Dedup connection string: explicit setting, then the environment, then
    /// a store directory named after the snapshot.
    pub fn dedup_store_url(&self) -> String {
        if let Some(url) = &self.dedup_store {
            return url.clone();
        }
        match std::env::var(DEDUP_STORE_ENV) {
            Ok(url) if !url.trim().is_empty() => url.trim().to_owned(),
            _ => format!("file:DEDUP-{}", self.snapshot),
        }
    }

    pub fn layout(&self) -> Layout {
        let derived = |prefix: &str| PathBuf::from(format!("{prefix}-{}", self.snapshot));
        Layout {
            index_dir: self.index_dir.clone().unwrap_or_else(|| derived("INDEX")),
            warc_dir: self.warc_dir.clone().unwrap_or_else(|| derived("WARC")),
            output_dir: self.output_dir.clone().unwrap_or_else(|| derived("OUTPUT")),
        }
    }
}

/// Process-wide working directories.
#[derive(Debug, Clone)]
pub struct Layout {
    pub index_dir: PathBuf,
    pub warc_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Layout {
    /// Creates every directory. An existing directory is an error unless
    /// `reuse` confirms it may be reused.
    pub fn prepare(&self, reuse: bool) -> Result<(), ConfigError> {
        for dir in [&self.index_dir, &self.warc_dir, &self.output_dir] {
            if dir.exists() {
                if !reuse {
                    return Err(ConfigError::Invalid(format!(
                        "directory already exists: {} (pass --reuse-dirs to continue in it)",
                        dir.display()
                    )));
                }
                tracing::warn!(dir = %dir.display(), "reusing existing directory");
                continue;
            }
            std::fs::create_dir_all(dir).map_err(|err| {
                ConfigError::Invalid(format!("create directory {}: {err}", dir.display()))
            })?;
        }
        Ok(())
    }
}
