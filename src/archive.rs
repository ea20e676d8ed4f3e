use std::io::Read as _;
use std::path::{Path, PathBuf};

use warc::{WarcHeader, WarcReader};

use crate::error::ExtractionError;

/// The first record of a downloaded archive range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePayload {
    /// Document bytes with the HTTP status line and headers stripped.
    pub body: Vec<u8>,
    /// Declared `WARC-Type` of the first record.
    pub record_type: String,
    /// Records present in the range; normally exactly one.
    pub record_count: usize,
}

impl ArchivePayload {
    pub fn is_single_response(&self) -> bool {
        self.record_count == 1 && self.record_type == "response"
    }
}

pub trait ArchiveParser: Send + Sync {
    fn read_payload(&self, path: &Path) -> Result<ArchivePayload, ExtractionError>;
}

/// Reads a gzip-compressed WARC range as produced by a ranged GET against
/// the archive files.
#[derive(Debug, Default, Clone, Copy)]
pub struct WarcArchiveParser;

impl ArchiveParser for WarcArchiveParser {
    fn read_payload(&self, path: &Path) -> Result<ArchivePayload, ExtractionError> {
        let io_err = |source| ExtractionError::Io {
            path: path.to_path_buf(),
            source,
        };
        let compressed = std::fs::read(path).map_err(io_err)?;

        // A range covers one gzip member; bytes past it are not part of the record.
        let mut raw = Vec::new();
        flate2::read::GzDecoder::new(compressed.as_slice())
            .read_to_end(&mut raw)
            .map_err(io_err)?;

        let mut first: Option<(String, Vec<u8>)> = None;
        let mut record_count = 0_usize;
        for record in WarcReader::new(raw.as_slice()).iter_records() {
            let record = match record {
                Ok(record) => record,
                Err(err) if first.is_some() => {
                    tracing::debug!(
                        path = %path.display(),
                        %err,
                        "ignoring trailing archive bytes"
                    );
                    break;
                }
                Err(err) => return Err(ExtractionError::Archive(err.to_string())),
            };
            record_count += 1;
            if first.is_none() {
                let record_type = record
                    .header(WarcHeader::WarcType)
                    .map(|value| value.to_string())
                    .unwrap_or_default();
                first = Some((record_type, strip_http_head(record.body()).to_vec()));
            }
        }

        let (record_type, body) = first.ok_or_else(|| ExtractionError::EmptyArchive {
            path: path.to_path_buf(),
        })?;
        Ok(ArchivePayload {
            body,
            record_type,
            record_count,
        })
    }
}

/// Drops an HTTP response head (`HTTP/1.1 200 OK` plus headers) when present.
pub fn strip_http_head(body: &[u8]) -> &[u8] {
    if !body.starts_with(b"HTTP/") {
        return body;
    }
    if let Some(pos) = find(body, b"\r\n\r\n") {
        return &body[pos + 4..];
    }
    if let Some(pos) = find(body, b"\n\n") {
        return &body[pos + 2..];
    }
    body
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Scratch file removed when dropped, on every exit path of a harvest.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    /// Creates an empty `{digest}.<random>.warc.gz` under `dir`. Harvesters
    /// sharing a digest never share a file.
    pub fn create(dir: &Path, digest: &str) -> std::io::Result<Self> {
        let path = tempfile::Builder::new()
            .prefix(&format!("{digest}."))
            .suffix(".warc.gz")
            .tempfile_in(dir)?
            .into_temp_path()
            .keep()
            .map_err(|err| err.error)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %self.path.display(), ?err, "scratch file leaked");
            }
        }
    }
}
