use std::io::{Read as _, Write as _};
use std::path::Path;

use anyhow::Context as _;

use crate::cli::CatalogArgs;
use crate::config::HarvestConfig;
use crate::fetch::RetrievalClient;
use crate::formats::CatalogPath;

const CATALOG_FILE_NAME: &str = "cc-index.paths.gz";

/// Downloads the snapshot's catalog into `scratch_dir` and returns its
/// index segment paths in catalog order.
pub async fn list_index_segments(
    client: &RetrievalClient,
    config: &HarvestConfig,
    scratch_dir: &Path,
) -> anyhow::Result<Vec<CatalogPath>> {
    let url = config.catalog_url();
    let local = scratch_dir.join(CATALOG_FILE_NAME);

    tracing::info!(%url, "downloading catalog");
    client
        .fetch(&url, &local, None)
        .await
        .context("download catalog")?;

    let compressed =
        std::fs::read(&local).with_context(|| format!("read catalog: {}", local.display()))?;
    if let Err(err) = std::fs::remove_file(&local) {
        tracing::warn!(path = %local.display(), ?err, "failed to remove catalog file");
    }

    let manifest = decompress_catalog(&compressed).context("decompress catalog")?;
    let paths = filter_catalog(&manifest);
    tracing::info!(segments = paths.len(), "catalog listed");
    Ok(paths)
}

pub fn decompress_catalog(compressed: &[u8]) -> anyhow::Result<String> {
    let mut manifest = String::new();
    flate2::read::MultiGzDecoder::new(compressed)
        .read_to_string(&mut manifest)
        .context("gunzip catalog")?;
    Ok(manifest)
}

/// Keeps index segment paths, dropping empty lines, metadata descriptors and
/// cluster summaries.
pub fn filter_catalog(manifest: &str) -> Vec<CatalogPath> {
    manifest
        .split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.contains("metadata.yaml") && !line.contains("cluster.idx"))
        .map(CatalogPath::new)
        .collect()
}

/// `ccharvest catalog`: one `<index>\t<path>` line per segment, where
/// `<index>` is the value `--start-index` takes to resume at that segment.
pub async fn run(args: CatalogArgs) -> anyhow::Result<()> {
    let config = args.resolve()?;
    config.validate().context("validate config")?;
    let client = RetrievalClient::new(&config.retry).context("build http client")?;
    let scratch = tempfile::TempDir::new().context("create scratch dir")?;

    let paths = list_index_segments(&client, &config, scratch.path()).await?;

    let mut stdout = std::io::stdout().lock();
    for (index, path) in paths.iter().enumerate() {
        writeln!(stdout, "{index}\t{path}").context("write stdout")?;
    }
    stdout.flush().context("flush stdout")?;
    Ok(())
}
