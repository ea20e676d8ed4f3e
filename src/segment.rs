//! Streaming parser for gzip-compressed CDX index segments.
//!
//! Each line is `<surt-key> <timestamp> <json>`. Only the JSON part is
//! parsed, and only lines whose `languages` contain the target code are
//! decoded into a full [`IndexEntry`].

use std::fs::File;
use std::io::{BufRead as _, BufReader, Write as _};
use std::path::Path;

use anyhow::Context as _;

use crate::cli::EntriesArgs;
use crate::error::ParseError;
use crate::formats::{IndexEntry, LanguageProbe};

pub fn parse_segment(path: &Path, target_language: &str) -> Result<Vec<IndexEntry>, ParseError> {
    let file = File::open(path).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::new(flate2::read::MultiGzDecoder::new(BufReader::new(file)));

    let mut entries = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.map_err(|source| ParseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        if let Some(entry) = parse_index_line(&line, target_language).map_err(|err| match err {
            LineError::MissingJson => ParseError::MissingJson {
                path: path.to_path_buf(),
                line: line_no,
            },
            LineError::Json(source) => ParseError::Json {
                path: path.to_path_buf(),
                line: line_no,
                source,
            },
        })? {
            entries.push(entry);
        }
    }

    Ok(entries)
}

#[derive(Debug)]
pub enum LineError {
    MissingJson,
    Json(serde_json::Error),
}

/// `Ok(None)` for a well-formed line in another language.
pub fn parse_index_line(
    line: &str,
    target_language: &str,
) -> Result<Option<IndexEntry>, LineError> {
    let mut parts = line.splitn(3, ' ');
    let (Some(_key), Some(_timestamp), Some(json)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(LineError::MissingJson);
    };

    let probe: LanguageProbe = serde_json::from_str(json).map_err(LineError::Json)?;
    let matches = probe
        .languages
        .is_some_and(|languages| languages.iter().any(|lang| lang == target_language));
    if !matches {
        return Ok(None);
    }

    serde_json::from_str(json).map(Some).map_err(LineError::Json)
}

/// `ccharvest entries`: retained entries of a local segment as JSON lines.
pub fn run(args: EntriesArgs) -> anyhow::Result<()> {
    let entries = parse_segment(&args.segment, &args.language)
        .with_context(|| format!("parse index segment: {}", args.segment.display()))?;
    tracing::info!(entries = entries.len(), language = %args.language, "segment parsed");

    let mut stdout = std::io::stdout().lock();
    for entry in &entries {
        serde_json::to_writer(&mut stdout, entry).context("encode entry")?;
        writeln!(stdout).context("write stdout")?;
    }
    stdout.flush().context("flush stdout")?;
    Ok(())
}
