use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::error::SinkError;
use crate::formats::HarvestedRecord;

/// Append-only JSON-lines writer with one file per output key.
///
/// Each append serializes the whole line first and hands it to a single
/// `write_all` under that file's lock, so lines from concurrent callers
/// never interleave. Handles are cached up to a bound; the oldest one is
/// closed when the cache is full.
#[derive(Debug)]
pub struct OutputSink {
    dir: PathBuf,
    max_open: usize,
    handles: Mutex<HandleCache>,
}

#[derive(Debug, Default)]
struct HandleCache {
    files: HashMap<String, Arc<Mutex<File>>>,
    order: VecDeque<String>,
}

impl OutputSink {
    pub fn new(dir: impl Into<PathBuf>, max_open: usize) -> Self {
        Self {
            dir: dir.into(),
            max_open: max_open.max(1),
            handles: Mutex::new(HandleCache::default()),
        }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    pub fn append(&self, key: &str, record: &HarvestedRecord) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let handle = self.handle(key)?;
        let mut file = handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        file.write_all(&line).map_err(|source| SinkError::Write {
            path: self.path_for(key),
            source,
        })
    }

    fn handle(&self, key: &str) -> Result<Arc<Mutex<File>>, SinkError> {
        if key.is_empty() || key.contains(['/', '\\']) || key == "." || key == ".." {
            return Err(SinkError::InvalidKey(key.to_owned()));
        }

        let mut cache = self.handles.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = cache.files.get(key) {
            return Ok(Arc::clone(handle));
        }

        let path = self.path_for(key);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| SinkError::Open { path, source })?;
        let handle = Arc::new(Mutex::new(file));

        while cache.files.len() >= self.max_open {
            let Some(oldest) = cache.order.pop_front() else {
                break;
            };
            cache.files.remove(&oldest);
        }
        cache.files.insert(key.to_owned(), Arc::clone(&handle));
        cache.order.push_back(key.to_owned());
        Ok(handle)
    }

    pub fn open_handles(&self) -> usize {
        self.handles
            .lock()
            .map(|cache| cache.files.len())
            .unwrap_or_default()
    }
}
