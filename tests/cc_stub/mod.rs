#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedRequest {
    pub path: String,
    pub range: Option<String>,
}

/// Files served by the stub, plus statuses to answer with before serving a
/// path for real.
#[derive(Debug, Default)]
pub struct Routes {
    files: HashMap<String, Vec<u8>>,
    failures: HashMap<String, VecDeque<u16>>,
}

impl Routes {
    pub fn file(mut self, path: &str, body: Vec<u8>) -> Self {
        self.files.insert(normalize(path), body);
        self
    }

    pub fn fail_first(mut self, path: &str, statuses: &[u16]) -> Self {
        self.failures
            .entry(normalize(path))
            .or_default()
            .extend(statuses.iter().copied());
        self
    }
}

fn normalize(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}

/// Plays the data endpoint: whole files for plain GETs, `206` slices for
/// `Range: bytes=a-b` requests (inclusive, clamped to the file end).
pub struct CcStub {
    pub base_url: String,
    log: Arc<Mutex<Vec<LoggedRequest>>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CcStub {
    pub fn spawn(routes: Routes) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start cc stub server");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}");

        let log = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let server_log = Arc::clone(&log);
        let handle = thread::spawn(move || {
            let Routes {
                files,
                mut failures,
            } = routes;
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                let path = request.url().to_string();
                let range = request
                    .headers()
                    .iter()
                    .find(|header| header.field.equiv("Range"))
                    .map(|header| header.value.as_str().to_owned());
                server_log.lock().unwrap().push(LoggedRequest {
                    path: path.clone(),
                    range: range.clone(),
                });

                if let Some(status) = failures.get_mut(&path).and_then(VecDeque::pop_front) {
                    let _ = request.respond(
                        tiny_http::Response::from_string("scripted failure")
                            .with_status_code(status),
                    );
                    continue;
                }

                let Some(body) = files.get(&path) else {
                    let _ = request.respond(
                        tiny_http::Response::from_string("not found").with_status_code(404),
                    );
                    continue;
                };

                let response = match range.as_deref().and_then(parse_range) {
                    Some((start, end)) if (start as usize) < body.len() => {
                        let end = (end as usize).min(body.len() - 1);
                        tiny_http::Response::from_data(body[start as usize..=end].to_vec())
                            .with_status_code(206)
                    }
                    Some(_) => tiny_http::Response::from_data(Vec::new()).with_status_code(416),
                    None => tiny_http::Response::from_data(body.clone()).with_status_code(200),
                };
                let _ = request.respond(response);
            }
        });

        Self {
            base_url,
            log,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn requests(&self) -> Vec<LoggedRequest> {
        self.log.lock().unwrap().clone()
    }

    pub fn requests_for(&self, path: &str) -> Vec<LoggedRequest> {
        let path = normalize(path);
        self.requests()
            .into_iter()
            .filter(|request| request.path == path)
            .collect()
    }
}

impl Drop for CcStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn parse_range(value: &str) -> Option<(u64, u64)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.trim().parse().ok()?, end.trim().parse().ok()?))
}

pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(bytes).expect("gzip write");
    encoder.finish().expect("gzip finish")
}

/// Uncompressed WARC response record whose HTTP body is `body`.
pub fn warc_response(url: &str, body: &str) -> Vec<u8> {
    let block = format!("HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\n\r\n{body}");
    let mut record = format!(
        "WARC/1.0\r\n\
WARC-Type: response\r\n\
WARC-Date: 2023-06-01T00:00:00Z\r\n\
WARC-Record-ID: <urn:uuid:00000000-0000-0000-0000-000000000001>\r\n\
WARC-Target-URI: {url}\r\n\
Content-Type: application/http; msgtype=response\r\n\
Content-Length: {}\r\n\r\n",
        block.len()
    )
    .into_bytes();
    record.extend_from_slice(block.as_bytes());
    record.extend_from_slice(b"\r\n\r\n");
    record
}

/// An archive file made of one gzip member per document, the way the
/// crawl's WARC files are laid out.
#[derive(Debug)]
pub struct ArchiveBuilder {
    pub filename: String,
    bytes: Vec<u8>,
}

impl ArchiveBuilder {
    pub fn new(filename: &str) -> Self {
        Self {
            filename: filename.to_owned(),
            bytes: Vec::new(),
        }
    }

    /// Appends a document and returns its `(offset, length)`.
    pub fn add(&mut self, url: &str, body: &str) -> (u64, u64) {
        let member = gzip(&warc_response(url, body));
        let offset = self.bytes.len() as u64;
        self.bytes.extend_from_slice(&member);
        (offset, member.len() as u64)
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.bytes.clone()
    }
}

/// One index line in the crawl's wire format: numbers as strings and the
/// languages comma-joined.
pub fn index_line(
    url: &str,
    digest: &str,
    languages: &str,
    filename: &str,
    (offset, length): (u64, u64),
) -> String {
    let json = serde_json::json!({
        "url": url,
        "mime": "text/html",
        "status": "200",
        "digest": digest,
        "length": length.to_string(),
        "offset": offset.to_string(),
        "filename": filename,
        "languages": languages,
        "encoding": "UTF-8",
    });
    format!("ir,example)/{digest} 20230601000000 {json}")
}

pub fn gzip_lines(lines: &[String]) -> Vec<u8> {
    let mut text = lines.join("\n");
    text.push('\n');
    gzip(text.as_bytes())
}

pub fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return out;
    };
    for entry in entries {
        let path = entry.expect("read dir entry").path();
        if path.is_dir() {
            out.extend(files_under(&path));
        } else {
            out.push(path);
        }
    }
    out.sort();
    out
}
