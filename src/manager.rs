//! Segment Manager: one index segment from download to cleanup.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use serde::Serialize;

use crate::fetch::RetrievalClient;
use crate::formats::CatalogPath;
use crate::harvest::{EntryHarvester, HarvestContext, HarvestReport, Outcome, SkipReason};
use crate::pool::{Completion, IsolatedUnit, WorkerPool};
use crate::segment::parse_segment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    Starting,
    IndexDownloaded,
    EntriesExtracted,
    WorkersDispatched,
    Draining,
    Cleaned,
    Done,
    Failed,
}

impl ManagerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Per-outcome counts over harvested entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub saved: usize,
    pub too_short: usize,
    pub duplicate: usize,
    pub failed: usize,
}

impl Tally {
    pub fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Saved { .. } => self.saved += 1,
            Outcome::Skipped(SkipReason::TooShort) => self.too_short += 1,
            Outcome::Skipped(SkipReason::Duplicate) => self.duplicate += 1,
            Outcome::Failed(_) => self.failed += 1,
        }
    }

    pub fn merge(&mut self, other: &Tally) {
        self.saved += other.saved;
        self.too_short += other.too_short;
        self.duplicate += other.duplicate;
        self.failed += other.failed;
    }

    pub fn total(&self) -> usize {
        self.saved + self.too_short + self.duplicate + self.failed
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentReport {
    pub manager_id: usize,
    pub segment: CatalogPath,
    pub state: ManagerState,
    /// Entries retained by the language filter.
    pub entries: usize,
    pub tally: Tally,
    pub error: Option<String>,
}

/// Job handed to a manager thread: the segment and its position in the
/// catalog, which doubles as the manager id in logs.
#[derive(Debug, Clone)]
pub struct SegmentJob {
    pub index: usize,
    pub segment: CatalogPath,
}

pub struct SegmentManager {
    client: RetrievalClient,
    context: Arc<HarvestContext>,
}

impl SegmentManager {
    pub fn new(client: RetrievalClient, context: Arc<HarvestContext>) -> Self {
        Self { client, context }
    }

    pub async fn process(&self, manager_id: usize, segment: CatalogPath) -> SegmentReport {
        let mut report = SegmentReport {
            manager_id,
            segment: segment.clone(),
            state: ManagerState::Starting,
            entries: 0,
            tally: Tally::default(),
            error: None,
        };
        tracing::info!(manager_id, %segment, "segment started");

        match self.drive(&mut report).await {
            Ok(()) => {
                advance(&mut report, ManagerState::Done);
                tracing::info!(
                    manager_id,
                    %segment,
                    entries = report.entries,
                    harvested = report.tally.total(),
                    saved = report.tally.saved,
                    too_short = report.tally.too_short,
                    duplicate = report.tally.duplicate,
                    failed = report.tally.failed,
                    "segment done"
                );
            }
            Err(err) => {
                tracing::error!(
                    manager_id,
                    %segment,
                    state = ?report.state,
                    err = format!("{err:#}"),
                    "segment failed"
                );
                report.error = Some(format!("{err:#}"));
                report.state = ManagerState::Failed;
            }
        }
        report
    }

    async fn drive(&self, report: &mut SegmentReport) -> anyhow::Result<()> {
        let manager_id = report.manager_id;
        let segment = report.segment.clone();
        let config = &self.context.config;

        let index_path = self.context.layout.index_dir.join(segment.file_name());
        let url = format!("{}/{}", config.base_url(), segment);
        self.client
            .fetch(&url, &index_path, None)
            .await
            .with_context(|| format!("download index segment: {segment}"))?;
        advance(report, ManagerState::IndexDownloaded);

        let entries = {
            let path = index_path.clone();
            let language = config.target_language.clone();
            tokio::task::spawn_blocking(move || parse_segment(&path, &language))
                .await
                .context("join index parser")?
                .with_context(|| format!("parse index segment: {segment}"))?
        };
        report.entries = entries.len();
        advance(report, ManagerState::EntriesExtracted);

        let harvester = EntryHarvester::new(self.client.clone(), Arc::clone(&self.context));
        let mut pool = WorkerPool::new(config.workers_per_manager);
        for entry in entries {
            let harvester = harvester.clone();
            let reaped = pool
                .submit(entry.digest.clone(), move |worker_id| async move {
                    harvester.harvest(manager_id, worker_id, entry).await
                })
                .await;
            if let Some(done) = reaped {
                tally_completion(manager_id, &mut report.tally, done);
            }
        }
        advance(report, ManagerState::WorkersDispatched);

        advance(report, ManagerState::Draining);
        while let Some(done) = pool.next_completion().await {
            tally_completion(manager_id, &mut report.tally, done);
        }

        remove_index(&index_path).await;
        advance(report, ManagerState::Cleaned);
        Ok(())
    }
}

impl IsolatedUnit for SegmentManager {
    type Job = SegmentJob;
    type Output = SegmentReport;

    async fn run(&self, _id: usize, job: SegmentJob) -> SegmentReport {
        self.process(job.index, job.segment).await
    }
}

fn advance(report: &mut SegmentReport, state: ManagerState) {
    tracing::debug!(
        manager_id = report.manager_id,
        from = ?report.state,
        to = ?state,
        "segment state"
    );
    report.state = state;
}

fn tally_completion(
    manager_id: usize,
    tally: &mut Tally,
    done: Completion<String, HarvestReport>,
) {
    match done.result {
        Ok(report) => tally.record(&report.outcome),
        Err(panic) => {
            tracing::error!(
                manager_id,
                worker_id = done.id,
                digest = %done.label,
                %panic,
                "harvester panicked"
            );
            tally.failed += 1;
        }
    }
}

async fn remove_index(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        tracing::warn!(path = %path.display(), ?err, "failed to remove index segment");
    }
}
