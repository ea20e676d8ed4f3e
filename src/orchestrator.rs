//! Crawl Orchestrator: catalog once, then one Segment Manager per segment on
//! a pool of OS threads.

use std::sync::Arc;

use anyhow::Context as _;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::archive::{ArchiveParser, WarcArchiveParser};
use crate::catalog;
use crate::config::HarvestConfig;
use crate::dedup::{DedupGate, DedupStore, open_store};
use crate::extract::{ReadabilityExtractor, TextExtractor};
use crate::fetch::RetrievalClient;
use crate::formats::CatalogPath;
use crate::harvest::HarvestContext;
use crate::manager::{ManagerState, SegmentJob, SegmentManager, SegmentReport, Tally};
use crate::pool::{Completion, ManagerPool};
use crate::sink::OutputSink;

/// The external pieces a run talks to, swappable for tests.
#[derive(Clone)]
pub struct Collaborators {
    pub dedup: Arc<dyn DedupStore>,
    pub archive: Arc<dyn ArchiveParser>,
    pub extractor: Arc<dyn TextExtractor>,
}

impl Collaborators {
    pub fn from_config(config: &HarvestConfig) -> anyhow::Result<Self> {
        let url = config.dedup_store_url();
        let dedup = open_store(&url).with_context(|| format!("open dedup store: {url}"))?;
        Ok(Self {
            dedup,
            archive: Arc::new(WarcArchiveParser),
            extractor: Arc::new(ReadabilityExtractor),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Segments listed by the catalog.
    pub catalog_segments: usize,
    /// Leading segments skipped by `start_index`.
    pub skipped_segments: usize,
    pub segments_done: usize,
    pub segments_failed: usize,
    /// Segments no manager thread ever picked up.
    pub segments_not_started: usize,
    pub entries: Tally,
}

impl RunSummary {
    fn record(&mut self, completion: Completion<CatalogPath, SegmentReport>) {
        match completion.result {
            Ok(report) => {
                if !report.state.is_terminal() {
                    tracing::warn!(
                        segment = %report.segment,
                        state = ?report.state,
                        "segment manager returned before finishing"
                    );
                }
                if report.state == ManagerState::Done {
                    self.segments_done += 1;
                } else {
                    self.segments_failed += 1;
                }
                self.entries.merge(&report.tally);
            }
            Err(panic) => {
                tracing::error!(segment = %completion.label, %panic, "segment manager panicked");
                self.segments_failed += 1;
            }
        }
    }
}

pub struct Orchestrator {
    config: Arc<HarvestConfig>,
    collaborators: Collaborators,
}

impl Orchestrator {
    pub fn new(config: HarvestConfig, collaborators: Collaborators) -> Self {
        Self {
            config: Arc::new(config),
            collaborators,
        }
    }

    pub async fn run(self) -> anyhow::Result<RunSummary> {
        let config = self.config;
        config.validate().context("validate config")?;

        let layout = config.layout();
        layout.prepare(config.reuse_dirs).context("prepare directories")?;

        let client = RetrievalClient::new(&config.retry).context("build http client")?;
        let segments = catalog::list_index_segments(&client, &config, &layout.index_dir)
            .await
            .context("list index segments")?;

        let mut summary = RunSummary {
            catalog_segments: segments.len(),
            skipped_segments: config.start_index.min(segments.len()),
            ..RunSummary::default()
        };
        if summary.skipped_segments > 0 {
            tracing::info!(skipped = summary.skipped_segments, "resuming past leading segments");
        }

        let jobs: Vec<(CatalogPath, SegmentJob)> = segments
            .into_iter()
            .enumerate()
            .skip(config.start_index)
            .map(|(index, segment)| {
                (
                    segment.clone(),
                    SegmentJob { index, segment },
                )
            })
            .collect();

        let context = Arc::new(HarvestContext {
            config: Arc::clone(&config),
            sink: Arc::new(OutputSink::new(
                layout.output_dir.clone(),
                config.max_open_output_files,
            )),
            layout,
            dedup: DedupGate::new(self.collaborators.dedup, config.dedup_mode),
            archive: self.collaborators.archive,
            extractor: self.collaborators.extractor,
        });

        let progress = ProgressBar::new(jobs.len() as u64);
        progress.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} segments {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
        );

        tracing::info!(
            segments = jobs.len(),
            managers = config.managers,
            workers_per_manager = config.workers_per_manager,
            "dispatching segment managers"
        );

        let retry = config.retry.clone();
        let not_started = ManagerPool::new(config.managers)
            .run::<SegmentManager, CatalogPath>(
                jobs,
                move |_slot| {
                    let client = RetrievalClient::new(&retry)?;
                    Ok(SegmentManager::new(client, Arc::clone(&context)))
                },
                |completion| {
                    progress.set_message(completion.label.file_name().to_owned());
                    summary.record(completion);
                    progress.inc(1);
                },
            )
            .await;
        progress.finish_and_clear();

        for (_, segment) in &not_started {
            tracing::error!(%segment, "segment was never started");
        }
        summary.segments_not_started = not_started.len();

        tracing::info!(
            catalog_segments = summary.catalog_segments,
            skipped = summary.skipped_segments,
            done = summary.segments_done,
            failed = summary.segments_failed,
            not_started = summary.segments_not_started,
            harvested = summary.entries.total(),
            saved = summary.entries.saved,
            too_short = summary.entries.too_short,
            duplicate = summary.entries.duplicate,
            entries_failed = summary.entries.failed,
            "run finished"
        );
        Ok(summary)
    }
}

/// Entry point for `ccharvest crawl`: production collaborators, then run.
pub async fn crawl(config: HarvestConfig) -> anyhow::Result<RunSummary> {
    let collaborators = Collaborators::from_config(&config)?;
    Orchestrator::new(config, collaborators).run().await
}
