use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};

use crate::config::{DedupMode, HarvestConfig};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Harvest every index segment of a snapshot.
    Crawl(CrawlArgs),
    /// Print the filtered catalog with each segment's index.
    Catalog(CatalogArgs),
    /// Print the entries of a local index segment that match a language.
    Entries(EntriesArgs),
}

#[derive(Debug, Args)]
pub struct SourceArgs {
    /// YAML config file; flags given on the command line win over it.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Crawl snapshot, e.g. CC-MAIN-2023-23.
    #[arg(long)]
    pub snapshot: Option<String>,

    /// Data endpoint (must be http/https).
    #[arg(long)]
    pub base_url: Option<String>,
}

impl SourceArgs {
    fn load(&self) -> anyhow::Result<HarvestConfig> {
        let mut config = match &self.config {
            Some(path) => HarvestConfig::from_yaml_file(path).context("load config")?,
            None => HarvestConfig::default(),
        };
        if let Some(snapshot) = &self.snapshot {
            config.snapshot = snapshot.clone();
        }
        if let Some(base_url) = &self.base_url {
            config.base_url = base_url.clone();
        }
        Ok(config)
    }
}

#[derive(Debug, Args)]
pub struct CrawlArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Language code an entry must carry to be harvested.
    #[arg(long)]
    pub language: Option<String>,

    /// Documents whose text is not longer than this are skipped.
    #[arg(long)]
    pub min_length: Option<usize>,

    /// Segment managers running in parallel (OS threads).
    #[arg(long)]
    pub managers: Option<usize>,

    /// Concurrent entry harvesters per manager.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Skip this many leading catalog segments (resume a previous run).
    #[arg(long)]
    pub start_index: Option<usize>,

    #[arg(long)]
    pub index_dir: Option<PathBuf>,

    #[arg(long)]
    pub warc_dir: Option<PathBuf>,

    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Continue in working directories that already exist.
    #[arg(long)]
    pub reuse_dirs: bool,

    /// Dedup store: `memory:` or `file:<dir>`.
    #[arg(long)]
    pub dedup_store: Option<String>,

    #[arg(long, value_enum)]
    pub dedup_mode: Option<DedupMode>,

    /// Rotating log file.
    #[arg(long, conflicts_with = "no_log_file")]
    pub log_file: Option<PathBuf>,

    /// Log to the console only.
    #[arg(long)]
    pub no_log_file: bool,
}

impl CrawlArgs {
    /// Defaults, then the config file, then flags.
    pub fn resolve(&self) -> anyhow::Result<HarvestConfig> {
        let mut config = self.source.load()?;

        if let Some(language) = &self.language {
            config.target_language = language.clone();
        }
        if let Some(min_length) = self.min_length {
            config.min_document_length = min_length;
        }
        if let Some(managers) = self.managers {
            config.managers = managers;
        }
        if let Some(workers) = self.workers {
            config.workers_per_manager = workers;
        }
        if let Some(start_index) = self.start_index {
            config.start_index = start_index;
        }
        if let Some(dir) = &self.index_dir {
            config.index_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.warc_dir {
            config.warc_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = Some(dir.clone());
        }
        if self.reuse_dirs {
            config.reuse_dirs = true;
        }
        if let Some(store) = &self.dedup_store {
            config.dedup_store = Some(store.clone());
        }
        if let Some(mode) = self.dedup_mode {
            config.dedup_mode = mode;
        }
        if let Some(file) = &self.log_file {
            config.log.file = Some(file.clone());
        }
        if self.no_log_file {
            config.log.file = None;
        }

        Ok(config)
    }
}

#[derive(Debug, Args)]
pub struct CatalogArgs {
    #[command(flatten)]
    pub source: SourceArgs,
}

impl CatalogArgs {
    pub fn resolve(&self) -> anyhow::Result<HarvestConfig> {
        self.source.load()
    }
}

#[derive(Debug, Args)]
pub struct EntriesArgs {
    /// Local gzip-compressed index segment.
    #[arg(long)]
    pub segment: PathBuf,

    /// Language code to keep.
    #[arg(long, default_value = "fas")]
    pub language: String,
}
