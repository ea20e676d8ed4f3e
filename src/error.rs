//! Error types for each unit of work in the harvesting pipeline.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("build http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("GET {url}: connection failed after {retries} retries")]
    Connect {
        url: String,
        retries: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("GET {url}: reading body failed after {retries} retries")]
    Read {
        url: String,
        retries: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("GET {url}: server kept answering {status} after {retries} retries")]
    RetryableStatus {
        url: String,
        status: u16,
        retries: u32,
    },
    #[error("GET {url}: unexpected status {status}")]
    Status { url: String, status: u16 },
    #[error("GET {url}: too many redirects")]
    Redirects {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("GET {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}:{line}: expected `<key> <timestamp> <json>`", path.display())]
    MissingJson { path: PathBuf, line: usize },
    #[error("{}:{line}: {source}", path.display())]
    Json {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("read archive {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse archive record: {0}")]
    Archive(String),
    #[error("archive {} holds no records", path.display())]
    EmptyArchive { path: PathBuf },
    #[error("text extraction for {url}: {message}")]
    Text { url: String, message: String },
}

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("digest {0} is already recorded")]
    Duplicate(String),
    #[error("digest {0:?} is not usable as a store key")]
    InvalidDigest(String),
    #[error("dedup store io at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialize dedup record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("unsupported dedup store {0:?}; expected `memory:` or `file:<dir>`")]
    UnsupportedStore(String),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("open output {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("append output {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialize record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("output key {0:?} is not a plain file name")]
    InvalidKey(String),
}

/// Terminal failure of a single entry.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Dedup(#[from] DedupError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("create scratch file in {}: {source}", path.display())]
    Scratch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// `err` followed by each of its sources, joined with `: `.
pub fn display_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !out.ends_with(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = cause.source();
    }
    out
}
