//! One filtered index entry, end to end: ranged fetch, archive payload,
//! article text, length gate, dedup, append.

use std::sync::Arc;

use tracing::Instrument as _;

use crate::archive::{ArchiveParser, ScratchFile};
use crate::config::{HarvestConfig, Layout};
use crate::dedup::{Admission, DedupGate};
use crate::error::{HarvestError, display_chain};
use crate::extract::{TextExtractor, passes_length_gate};
use crate::fetch::RetrievalClient;
use crate::formats::{HarvestedRecord, IndexEntry};
use crate::sink::OutputSink;

/// Everything shared by the harvesters of one run. Never mutated after the
/// run starts.
pub struct HarvestContext {
    pub config: Arc<HarvestConfig>,
    pub layout: Layout,
    pub dedup: DedupGate,
    pub sink: Arc<OutputSink>,
    pub archive: Arc<dyn ArchiveParser>,
    pub extractor: Arc<dyn TextExtractor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    TooShort,
    Duplicate,
}

#[derive(Debug)]
pub enum Outcome {
    /// `record_id` is the dedup store's id for the digest when it reported one.
    Saved { record_id: Option<String> },
    Skipped(SkipReason),
    Failed(HarvestError),
}

#[derive(Debug)]
pub struct HarvestReport {
    pub digest: String,
    pub outcome: Outcome,
}

#[derive(Clone)]
pub struct EntryHarvester {
    client: RetrievalClient,
    context: Arc<HarvestContext>,
}

impl EntryHarvester {
    pub fn new(client: RetrievalClient, context: Arc<HarvestContext>) -> Self {
        Self { client, context }
    }

    /// Runs one entry to its terminal outcome. Errors end up in
    /// [`Outcome::Failed`] and are logged here; nothing propagates upward.
    pub async fn harvest(
        &self,
        manager_id: usize,
        worker_id: usize,
        entry: IndexEntry,
    ) -> HarvestReport {
        let span = tracing::debug_span!("harvest", manager_id, worker_id, digest = %entry.digest);
        let digest = entry.digest.clone();

        let outcome = match self.try_harvest(entry).instrument(span).await {
            Ok(outcome) => outcome,
            Err(err) => Outcome::Failed(err),
        };

        match &outcome {
            Outcome::Saved { record_id } => {
                tracing::info!(manager_id, worker_id, %digest, ?record_id, "saved");
            }
            Outcome::Skipped(reason) => {
                tracing::info!(manager_id, worker_id, %digest, ?reason, "skipped");
            }
            Outcome::Failed(err) => {
                tracing::error!(
                    manager_id,
                    worker_id,
                    %digest,
                    err = %display_chain(err),
                    "harvest failed"
                );
            }
        }

        HarvestReport { digest, outcome }
    }

    async fn try_harvest(&self, entry: IndexEntry) -> Result<Outcome, HarvestError> {
        let context = &self.context;
        let config = &context.config;

        let dir = context.layout.warc_dir.join(entry.archive_stem());
        let scratch_err = |source| HarvestError::Scratch {
            path: dir.clone(),
            source,
        };
        tokio::fs::create_dir_all(&dir).await.map_err(scratch_err)?;
        let scratch = ScratchFile::create(&dir, &entry.digest).map_err(scratch_err)?;

        let url = format!("{}/{}", config.base_url(), entry.filename);
        let report = self
            .client
            .fetch(&url, scratch.path(), Some(entry.byte_range()))
            .await?;
        tracing::debug!(bytes = report.bytes, retries = report.retries.total(), "range fetched");

        let content = {
            let archive = Arc::clone(&context.archive);
            let extractor = Arc::clone(&context.extractor);
            let page_url = entry.url.clone();
            let span = tracing::Span::current();
            tokio::task::spawn_blocking(move || {
                let _entered = span.enter();
                let payload = archive.read_payload(scratch.path());
                drop(scratch);
                let payload = payload?;
                if !payload.is_single_response() {
                    tracing::warn!(
                        record_type = %payload.record_type,
                        records = payload.record_count,
                        "expected a single response record; using the first"
                    );
                }
                let html = String::from_utf8_lossy(&payload.body);
                extractor.extract(&html, &page_url)
            })
            .await??
        };

        if !passes_length_gate(&content, config.min_document_length) {
            return Ok(Outcome::Skipped(SkipReason::TooShort));
        }

        let digest = entry.digest.clone();
        let (admission, claim_id) = context.dedup.admit(&digest).await?;
        if admission == Admission::Duplicate {
            return Ok(Outcome::Skipped(SkipReason::Duplicate));
        }

        let key = entry.output_key();
        let record = HarvestedRecord { entry, content };
        let sink = Arc::clone(&context.sink);
        let written = tokio::task::spawn_blocking(move || sink.append(&key, &record)).await?;
        if let Err(err) = written {
            if claim_id.is_some() {
                tracing::error!(%digest, "digest is recorded but its output line was not written");
            }
            return Err(err.into());
        }

        let commit_id = context.dedup.commit(&digest).await?;
        Ok(Outcome::Saved {
            record_id: claim_id.or(commit_id),
        })
    }
}
