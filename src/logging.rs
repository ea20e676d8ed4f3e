use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context as _;
use tracing_subscriber::Layer as _;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::config::LogConfig;

/// Console logging only.
pub fn init() -> anyhow::Result<()> {
    init_with(None)
}

/// Console logging mirrored into a size-rotated file when one is configured.
pub fn init_with(file: Option<&LogConfig>) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))
        .context("build log filter")?;

    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(io::stderr)
        .with_filter(filter);

    let file_layer = match file.and_then(|log| log.file.as_deref().map(|path| (log, path))) {
        Some((log, path)) => {
            let writer = RollingFile::open(path, log.max_bytes)
                .with_context(|| format!("open log file: {}", path.display()))?;
            let file_filter = tracing_subscriber::EnvFilter::try_new(&log.file_filter)
                .with_context(|| format!("build file log filter: {}", log.file_filter))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_thread_names(true)
                    .with_writer(Mutex::new(writer))
                    .with_filter(file_filter),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow::anyhow!("initialize tracing subscriber: {err}"))?;

    Ok(())
}

/// Append-only log file that moves itself aside as `<name>.<n>` once it
/// would grow past `max_bytes`. Backups are numbered upwards and never
/// removed.
#[derive(Debug)]
pub struct RollingFile {
    path: PathBuf,
    file: File,
    written: u64,
    max_bytes: u64,
    last_backup: u32,
}

impl RollingFile {
    pub fn open(path: &Path, max_bytes: u64) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let written = file.metadata()?.len();
        let last_backup = highest_backup_suffix(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            written,
            max_bytes,
            last_backup,
        })
    }

    fn roll_over(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.last_backup += 1;
        let mut backup = self.path.clone().into_os_string();
        backup.push(format!(".{}", self.last_backup));
        std::fs::rename(&self.path, PathBuf::from(backup))?;
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RollingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.max_bytes > 0
            && self.written > 0
            && self.written + buf.len() as u64 > self.max_bytes
        {
            self.roll_over()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn highest_backup_suffix(path: &Path) -> io::Result<u32> {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(0);
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let prefix = format!("{name}.");
    let mut highest = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(suffix) = file_name
            .to_str()
            .and_then(|candidate| candidate.strip_prefix(&prefix))
        else {
            continue;
        };
        if let Ok(n) = suffix.parse::<u32>() {
            highest = highest.max(n);
        }
    }
    Ok(highest)
}
