mod cc_stub;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use ccharvest::archive::WarcArchiveParser;
use ccharvest::config::{DedupMode, HarvestConfig, LogConfig, RetryConfig};
use ccharvest::dedup::{DedupStore, LocalFsDedupStore, MemoryDedupStore};
use ccharvest::error::{DedupError, ExtractionError};
use ccharvest::extract::TextExtractor;
use ccharvest::formats::HarvestedRecord;
use ccharvest::orchestrator::{Collaborators, Orchestrator, RunSummary};
use cc_stub::{ArchiveBuilder, CcStub, Routes, files_under, gzip_lines, index_line};

const SNAPSHOT: &str = "CC-TEST-2023-23";
const ARCHIVE_A: &str = "crawl-data/CC-TEST-2023-23/segments/1/warc/CC-MAIN-A-00000.warc.gz";
const ARCHIVE_B: &str = "crawl-data/CC-TEST-2023-23/segments/1/warc/CC-MAIN-B-00001.warc.gz";
const SEGMENT_0: &str = "cc-index/collections/CC-TEST-2023-23/indexes/cdx-00000.gz";
const SEGMENT_1: &str = "cc-index/collections/CC-TEST-2023-23/indexes/cdx-00001.gz";
const METADATA: &str = "cc-index/collections/CC-TEST-2023-23/metadata.yaml";

fn catalog_path() -> String {
    format!("crawl-data/{SNAPSHOT}/cc-index.paths.gz")
}

fn long_text(tag: &str) -> String {
    format!("{tag}: {}", "این یک متن فارسی است.\n\n".repeat(10))
}

/// Returns the payload unchanged; panics on documents that ask for it.
struct EchoExtractor;

impl TextExtractor for EchoExtractor {
    fn extract(&self, html: &str, _url: &str) -> Result<String, ExtractionError> {
        if html.contains("PANIC") {
            panic!("extractor blew up");
        }
        Ok(html.to_owned())
    }
}

#[derive(Default)]
struct CountingStore {
    inner: MemoryDedupStore,
    exists_calls: AtomicUsize,
    insert_calls: AtomicUsize,
}

#[async_trait]
impl DedupStore for CountingStore {
    async fn exists(&self, digest: &str) -> Result<bool, DedupError> {
        self.exists_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.exists(digest).await
    }

    async fn insert(&self, digest: &str) -> Result<String, DedupError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.insert(digest).await
    }
}

/// Holds every `exists` call until two are waiting, so both checks of a
/// racing pair see the digest as absent.
struct RacingStore {
    inner: MemoryDedupStore,
    barrier: tokio::sync::Barrier,
}

#[async_trait]
impl DedupStore for RacingStore {
    async fn exists(&self, digest: &str) -> Result<bool, DedupError> {
        self.barrier.wait().await;
        self.inner.exists(digest).await
    }

    async fn insert(&self, digest: &str) -> Result<String, DedupError> {
        self.inner.insert(digest).await
    }
}

fn config(stub: &CcStub, root: &Path) -> HarvestConfig {
    HarvestConfig {
        snapshot: SNAPSHOT.to_owned(),
        base_url: stub.base_url.clone(),
        target_language: "fas".to_owned(),
        min_document_length: 50,
        managers: 2,
        workers_per_manager: 2,
        index_dir: Some(root.join("index")),
        warc_dir: Some(root.join("warc")),
        output_dir: Some(root.join("out")),
        retry: RetryConfig {
            connect: 1,
            read: 1,
            status: 2,
            backoff_factor: 0.0,
            ..RetryConfig::default()
        },
        log: LogConfig {
            file: None,
            ..LogConfig::default()
        },
        ..HarvestConfig::default()
    }
}

fn collaborators(dedup: Arc<dyn DedupStore>) -> Collaborators {
    Collaborators {
        dedup,
        archive: Arc::new(WarcArchiveParser),
        extractor: Arc::new(EchoExtractor),
    }
}

async fn run(config: HarvestConfig, dedup: Arc<dyn DedupStore>) -> anyhow::Result<RunSummary> {
    Orchestrator::new(config, collaborators(dedup)).run().await
}

fn read_output(path: &Path) -> Vec<HarvestedRecord> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|line| serde_json::from_str(line).expect("parse output line"))
        .collect()
}

/// Two segments over two archives; a metadata line in the catalog.
/// Segment 0: `a` (fas, long), `b` (eng), `c` (fas, too short).
/// Segment 1: `d` (fas, long).
struct World {
    routes: Routes,
    ranges: Vec<(String, u64, u64)>,
}

fn world() -> World {
    let mut archive_a = ArchiveBuilder::new(ARCHIVE_A);
    let a = archive_a.add("https://example.ir/a", &long_text("a"));
    let b = archive_a.add("https://example.com/b", &long_text("b"));
    let c = archive_a.add("https://example.ir/c", "کوتاه");
    let mut archive_b = ArchiveBuilder::new(ARCHIVE_B);
    let d = archive_b.add("https://example.ir/d", &long_text("d"));

    let segment_0 = gzip_lines(&[
        index_line("https://example.ir/a", "AAAA", "fas,ara", ARCHIVE_A, a),
        index_line("https://example.com/b", "BBBB", "eng", ARCHIVE_A, b),
        index_line("https://example.ir/c", "CCCC", "fas", ARCHIVE_A, c),
    ]);
    let segment_1 = gzip_lines(&[index_line(
        "https://example.ir/d",
        "DDDD",
        "fas",
        ARCHIVE_B,
        d,
    )]);
    let catalog = cc_stub::gzip(format!("{SEGMENT_0}\n{METADATA}\n{SEGMENT_1}\n").as_bytes());

    World {
        routes: Routes::default()
            .file(&catalog_path(), catalog)
            .file(SEGMENT_0, segment_0)
            .file(SEGMENT_1, segment_1)
            .file(ARCHIVE_A, archive_a.bytes())
            .file(ARCHIVE_B, archive_b.bytes()),
        ranges: vec![("a".to_owned(), a.0, a.1), ("d".to_owned(), d.0, d.1)],
    }
}

#[tokio::test]
async fn harvests_target_language_documents_end_to_end() -> anyhow::Result<()> {
    let World { routes, ranges } = world();
    let stub = CcStub::spawn(routes);
    let temp = tempfile::TempDir::new()?;
    let store = Arc::new(CountingStore::default());

    let summary = run(config(&stub, temp.path()), store.clone()).await?;

    assert_eq!(summary.catalog_segments, 2);
    assert_eq!(summary.segments_done, 2);
    assert_eq!(summary.segments_failed, 0);
    assert_eq!(summary.entries.saved, 2);
    assert_eq!(summary.entries.too_short, 1);
    assert_eq!(summary.entries.duplicate, 0);
    assert_eq!(summary.entries.failed, 0);

    // Claim mode: one insert per saved digest, nothing for the short one.
    assert_eq!(store.insert_calls.load(Ordering::SeqCst), 2);
    assert_eq!(store.exists_calls.load(Ordering::SeqCst), 0);

    let out = temp.path().join("out");
    let saved_a = read_output(&out.join("CC-MAIN-A-00000.jsonl"));
    assert_eq!(saved_a.len(), 1);
    assert_eq!(saved_a[0].entry.digest, "AAAA");
    assert_eq!(saved_a[0].entry.languages, vec!["fas", "ara"]);
    assert_eq!(saved_a[0].content, long_text("a"));
    let saved_d = read_output(&out.join("CC-MAIN-B-00001.jsonl"));
    assert_eq!(saved_d.len(), 1);
    assert_eq!(saved_d[0].entry.digest, "DDDD");

    let line = std::fs::read_to_string(out.join("CC-MAIN-A-00000.jsonl"))?;
    let value: serde_json::Value = serde_json::from_str(line.trim_end())?;
    let mut keys: Vec<&str> = value
        .as_object()
        .map(|object| object.keys().map(String::as_str).collect())
        .unwrap_or_default();
    keys.sort_unstable();
    assert_eq!(
        keys,
        vec!["content", "digest", "filename", "languages", "length", "offset", "status", "url"]
    );
    assert!(line.contains("این یک متن فارسی است"));

    assert!(stub.requests_for(METADATA).is_empty());
    let archive_a_requests = stub.requests_for(ARCHIVE_A);
    assert_eq!(archive_a_requests.len(), 2, "the eng entry is never fetched");
    let (_, offset, length) = &ranges[0];
    assert!(
        archive_a_requests
            .iter()
            .any(|request| request.range.as_deref()
                == Some(format!("bytes={offset}-{}", offset + length).as_str()))
    );
    let (_, offset, length) = &ranges[1];
    assert_eq!(
        stub.requests_for(ARCHIVE_B)[0].range.as_deref(),
        Some(format!("bytes={offset}-{}", offset + length).as_str())
    );

    assert!(files_under(&temp.path().join("warc")).is_empty());
    assert!(files_under(&temp.path().join("index")).is_empty());
    Ok(())
}

#[tokio::test]
async fn rerun_with_retained_store_skips_duplicates() -> anyhow::Result<()> {
    let World { routes, .. } = world();
    let stub = CcStub::spawn(routes);
    let temp = tempfile::TempDir::new()?;
    let store = Arc::new(LocalFsDedupStore::open(temp.path().join("dedup"))?);

    let first = run(config(&stub, temp.path()), store.clone()).await?;
    assert_eq!(first.entries.saved, 2);

    let mut again = config(&stub, temp.path());
    again.reuse_dirs = true;
    let reopened = Arc::new(LocalFsDedupStore::open(temp.path().join("dedup"))?);
    let second = run(again, reopened).await?;

    assert_eq!(second.entries.saved, 0);
    assert_eq!(second.entries.duplicate, 2);
    assert_eq!(second.entries.too_short, 1);

    let out = temp.path().join("out");
    assert_eq!(read_output(&out.join("CC-MAIN-A-00000.jsonl")).len(), 1);
    assert_eq!(read_output(&out.join("CC-MAIN-B-00001.jsonl")).len(), 1);
    Ok(())
}

#[tokio::test]
async fn existing_dirs_need_explicit_reuse() -> anyhow::Result<()> {
    let World { routes, .. } = world();
    let stub = CcStub::spawn(routes);
    let temp = tempfile::TempDir::new()?;
    std::fs::create_dir_all(temp.path().join("out"))?;

    let err = run(config(&stub, temp.path()), Arc::new(MemoryDedupStore::default()))
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("directory already exists"));
    assert!(stub.requests().is_empty());
    Ok(())
}

fn same_digest_world(copies: usize) -> Routes {
    let mut archive = ArchiveBuilder::new(ARCHIVE_A);
    let mut lines = Vec::new();
    for n in 0..copies {
        let url = format!("https://mirror{n}.example.ir/");
        let range = archive.add(&url, &long_text("same"));
        lines.push(index_line(&url, "SAME", "fas", ARCHIVE_A, range));
    }
    Routes::default()
        .file(&catalog_path(), cc_stub::gzip(format!("{SEGMENT_0}\n").as_bytes()))
        .file(SEGMENT_0, gzip_lines(&lines))
        .file(ARCHIVE_A, archive.bytes())
}

#[tokio::test]
async fn claim_mode_writes_a_shared_digest_once() -> anyhow::Result<()> {
    let stub = CcStub::spawn(same_digest_world(4));
    let temp = tempfile::TempDir::new()?;
    let mut config = config(&stub, temp.path());
    config.workers_per_manager = 4;

    let summary = run(config, Arc::new(MemoryDedupStore::default())).await?;

    assert_eq!(summary.entries.saved, 1);
    assert_eq!(summary.entries.duplicate, 3);
    let lines = read_output(&temp.path().join("out").join("CC-MAIN-A-00000.jsonl"));
    assert_eq!(lines.len(), 1);
    Ok(())
}

#[tokio::test]
async fn check_then_insert_lets_racing_checks_both_write() -> anyhow::Result<()> {
    let stub = CcStub::spawn(same_digest_world(2));
    let temp = tempfile::TempDir::new()?;
    let mut config = config(&stub, temp.path());
    config.workers_per_manager = 2;
    config.dedup_mode = DedupMode::CheckThenInsert;
    let store = Arc::new(RacingStore {
        inner: MemoryDedupStore::default(),
        barrier: tokio::sync::Barrier::new(2),
    });

    let summary = run(config, store.clone()).await?;

    // Both checks ran before either insert, so both entries wrote output;
    // the second commit found the digest already recorded.
    assert_eq!(summary.entries.saved, 2);
    let lines = read_output(&temp.path().join("out").join("CC-MAIN-A-00000.jsonl"));
    assert_eq!(lines.len(), 2);
    assert!(store.inner.exists("SAME").await?);
    assert!(matches!(
        store.inner.insert("SAME").await,
        Err(DedupError::Duplicate(_))
    ));
    Ok(())
}

#[tokio::test]
async fn concurrent_same_digest_entries_are_skipped_not_failed() -> anyhow::Result<()> {
    let stub = CcStub::spawn(same_digest_world(8));

    for round in 0..5 {
        let temp = tempfile::TempDir::new()?;
        let mut config = config(&stub, temp.path());
        config.managers = 1;
        config.workers_per_manager = 8;

        let summary = run(config, Arc::new(MemoryDedupStore::default())).await?;

        assert_eq!(summary.entries.failed, 0, "round {round}: {:?}", summary.entries);
        assert_eq!(summary.entries.saved, 1, "round {round}");
        assert_eq!(summary.entries.duplicate, 7, "round {round}");
        let lines = read_output(&temp.path().join("out").join("CC-MAIN-A-00000.jsonl"));
        assert_eq!(lines.len(), 1);
        assert!(files_under(&temp.path().join("warc")).is_empty());
    }
    Ok(())
}

#[tokio::test]
async fn a_panicking_entry_does_not_stop_its_siblings() -> anyhow::Result<()> {
    let mut archive = ArchiveBuilder::new(ARCHIVE_A);
    let good = archive.add("https://example.ir/good", &long_text("good"));
    let bad = archive.add("https://example.ir/bad", &format!("PANIC {}", long_text("bad")));
    let routes = Routes::default()
        .file(&catalog_path(), cc_stub::gzip(format!("{SEGMENT_0}\n").as_bytes()))
        .file(
            SEGMENT_0,
            gzip_lines(&[
                index_line("https://example.ir/bad", "BAD1", "fas", ARCHIVE_A, bad),
                index_line("https://example.ir/good", "GOOD", "fas", ARCHIVE_A, good),
            ]),
        )
        .file(ARCHIVE_A, archive.bytes());
    let stub = CcStub::spawn(routes);
    let temp = tempfile::TempDir::new()?;

    let summary = run(config(&stub, temp.path()), Arc::new(MemoryDedupStore::default())).await?;

    assert_eq!(summary.segments_done, 1);
    assert_eq!(summary.entries.saved, 1);
    assert_eq!(summary.entries.failed, 1);
    assert!(files_under(&temp.path().join("warc")).is_empty());
    Ok(())
}

#[tokio::test]
async fn failed_segments_do_not_stop_the_run() -> anyhow::Result<()> {
    let mut archive = ArchiveBuilder::new(ARCHIVE_A);
    let a = archive.add("https://example.ir/a", &long_text("a"));
    let missing = "cc-index/collections/CC-TEST-2023-23/indexes/cdx-00404.gz";
    let corrupt = "cc-index/collections/CC-TEST-2023-23/indexes/cdx-00500.gz";
    let routes = Routes::default()
        .file(
            &catalog_path(),
            cc_stub::gzip(format!("{missing}\n{corrupt}\n{SEGMENT_0}\n").as_bytes()),
        )
        .file(corrupt, gzip_lines(&["not an index line".to_owned()]))
        .file(
            SEGMENT_0,
            gzip_lines(&[index_line("https://example.ir/a", "AAAA", "fas", ARCHIVE_A, a)]),
        )
        .file(ARCHIVE_A, archive.bytes());
    let stub = CcStub::spawn(routes);
    let temp = tempfile::TempDir::new()?;

    let summary = run(config(&stub, temp.path()), Arc::new(MemoryDedupStore::default())).await?;

    assert_eq!(summary.segments_done, 1);
    assert_eq!(summary.segments_failed, 2);
    assert_eq!(summary.entries.saved, 1);
    // A 404 is not retried.
    assert_eq!(stub.requests_for(missing).len(), 1);
    // The corrupt segment stays on disk for inspection.
    assert_eq!(
        files_under(&temp.path().join("index")),
        vec![temp.path().join("index").join("cdx-00500.gz")]
    );
    Ok(())
}

#[tokio::test]
async fn start_index_skips_leading_segments() -> anyhow::Result<()> {
    let World { routes, .. } = world();
    let stub = CcStub::spawn(routes);
    let temp = tempfile::TempDir::new()?;
    let mut config = config(&stub, temp.path());
    config.start_index = 1;

    let summary = run(config, Arc::new(MemoryDedupStore::default())).await?;

    assert_eq!(summary.catalog_segments, 2);
    assert_eq!(summary.skipped_segments, 1);
    assert_eq!(summary.segments_done, 1);
    assert_eq!(summary.entries.saved, 1);
    assert!(stub.requests_for(SEGMENT_0).is_empty());
    assert_eq!(stub.requests_for(SEGMENT_1).len(), 1);
    Ok(())
}

#[tokio::test]
async fn transient_server_errors_are_retried() -> anyhow::Result<()> {
    let World { routes, .. } = world();
    let stub = CcStub::spawn(
        routes
            .fail_first(SEGMENT_1, &[503, 502])
            .fail_first(ARCHIVE_B, &[500]),
    );
    let temp = tempfile::TempDir::new()?;

    let summary = run(config(&stub, temp.path()), Arc::new(MemoryDedupStore::default())).await?;

    assert_eq!(summary.segments_done, 2);
    assert_eq!(summary.entries.saved, 2);
    assert_eq!(stub.requests_for(SEGMENT_1).len(), 3);
    assert_eq!(stub.requests_for(ARCHIVE_B).len(), 2);
    Ok(())
}
