use serde::{Deserialize, Deserializer, Serialize};

/// Relative path of one index segment, as listed in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CatalogPath(String);

impl CatalogPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path component, used as the local index file name.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl std::fmt::Display for CatalogPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One archived document descriptor from an index segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub url: String,
    #[serde(deserialize_with = "string_or_number")]
    pub status: String,
    pub digest: String,
    #[serde(deserialize_with = "u64_from_string_or_number")]
    pub length: u64,
    #[serde(deserialize_with = "u64_from_string_or_number")]
    pub offset: u64,
    pub filename: String,
    #[serde(deserialize_with = "language_list")]
    pub languages: Vec<String>,
}

impl IndexEntry {
    pub fn has_language(&self, code: &str) -> bool {
        self.languages.iter().any(|lang| lang == code)
    }

    /// Base name of the source archive up to its first dot, e.g.
    /// `CC-MAIN-20230527223515-20230528013515-00000` for
    /// `crawl-data/.../warc/CC-MAIN-20230527223515-20230528013515-00000.warc.gz`.
    pub fn archive_stem(&self) -> &str {
        let base = self.filename.rsplit('/').next().unwrap_or(&self.filename);
        base.split('.').next().unwrap_or(base)
    }

    /// Name of the output file this entry's record is appended to.
    pub fn output_key(&self) -> String {
        format!("{}.jsonl", self.archive_stem())
    }

    /// Inclusive byte range covering the archived record.
    pub fn byte_range(&self) -> ByteRange {
        ByteRange {
            start: self.offset,
            end: self.offset.saturating_add(self.length),
        }
    }
}

/// `Range: bytes={start}-{end}` with both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// An entry with its extracted article text, one line in an output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestedRecord {
    #[serde(flatten)]
    pub entry: IndexEntry,
    pub content: String,
}

/// Only the language tags of an index line; everything else is ignored.
#[derive(Debug, Deserialize)]
pub(crate) struct LanguageProbe {
    #[serde(default, deserialize_with = "optional_language_list")]
    pub languages: Option<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    String(String),
    Number(serde_json::Number),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Languages {
    Joined(String),
    List(Vec<String>),
}

impl Languages {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::Joined(joined) => joined
                .split(',')
                .map(str::trim)
                .filter(|code| !code.is_empty())
                .map(str::to_owned)
                .collect(),
            Self::List(list) => list,
        }
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(value) => value,
        StringOrNumber::Number(value) => value.to_string(),
    })
}

fn u64_from_string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(value) => value
            .trim()
            .parse()
            .map_err(|_| {
                serde::de::Error::custom(format!("expected unsigned integer, got {value:?}"))
            }),
        StringOrNumber::Number(value) => value
            .as_u64()
            .ok_or_else(|| {
                serde::de::Error::custom(format!("expected unsigned integer, got {value}"))
            }),
    }
}

fn language_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(Languages::deserialize(deserializer)?.into_vec())
}

fn optional_language_list<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Vec<String>>, D::Error> {
    Ok(Option::<Languages>::deserialize(deserializer)?.map(Languages::into_vec))
}
