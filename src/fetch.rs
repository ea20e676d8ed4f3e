//! HTTP retrieval with bounded retries, streaming bodies straight to disk.

use std::path::Path;
use std::time::Duration;

use backon::{BackoffBuilder as _, ExponentialBackoff};
use reqwest::StatusCode;
use reqwest::header::{RANGE, USER_AGENT};
use tokio::io::AsyncWriteExt as _;

use crate::config::RetryConfig;
use crate::error::FetchError;
use crate::formats::ByteRange;

const USER_AGENT_VALUE: &str = concat!("ccharvest/", env!("CARGO_PKG_VERSION"));

/// Retries spent per failure class during one fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryCounts {
    pub connect: u32,
    pub read: u32,
    pub status: u32,
}

impl RetryCounts {
    pub fn total(&self) -> u32 {
        self.connect + self.read + self.status
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Connect,
    Read,
    Status,
}

/// Tracks retry budgets for one fetch. Each failure kind draws from its own
/// backoff schedule, which ends once that kind's budget is spent.
#[derive(Debug)]
pub struct RetryState {
    connect: ExponentialBackoff,
    read: ExponentialBackoff,
    status: ExponentialBackoff,
    used: RetryCounts,
}

impl RetryState {
    pub fn new(policy: &RetryConfig) -> Self {
        Self {
            connect: policy.backoff(policy.connect).build(),
            read: policy.backoff(policy.read).build(),
            status: policy.backoff(policy.status).build(),
            used: RetryCounts::default(),
        }
    }

    pub fn used(&self) -> RetryCounts {
        self.used
    }

    /// Consumes one retry of `kind`. `None` once that budget is spent.
    pub fn next_delay(&mut self, kind: FailureKind) -> Option<Duration> {
        let (schedule, used) = match kind {
            FailureKind::Connect => (&mut self.connect, &mut self.used.connect),
            FailureKind::Read => (&mut self.read, &mut self.used.read),
            FailureKind::Status => (&mut self.status, &mut self.used.status),
        };
        let delay = schedule.next()?;
        *used += 1;
        Some(delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchReport {
    pub bytes: u64,
    pub retries: RetryCounts,
}

enum Attempt {
    Connect(reqwest::Error),
    Read(reqwest::Error),
    Status(StatusCode),
    Fatal(FetchError),
}

impl Attempt {
    fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::Connect(_) => Some(FailureKind::Connect),
            Self::Read(_) => Some(FailureKind::Read),
            Self::Status(_) => Some(FailureKind::Status),
            Self::Fatal(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalClient {
    client: reqwest::Client,
    policy: RetryConfig,
}

impl RetrievalClient {
    pub fn new(policy: &RetryConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(policy.connect_timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(policy.redirects))
            .pool_max_idle_per_host(16);
        if let Some(secs) = policy.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder.build().map_err(FetchError::Client)?;
        Ok(Self {
            client,
            policy: policy.clone(),
        })
    }

    /// GETs `url` into `dest`, truncating it first on every attempt.
    pub async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        range: Option<ByteRange>,
    ) -> Result<FetchReport, FetchError> {
        let mut retries = RetryState::new(&self.policy);
        loop {
            let attempt = match self.attempt(url, dest, range).await {
                Ok(bytes) => {
                    return Ok(FetchReport {
                        bytes,
                        retries: retries.used(),
                    });
                }
                Err(attempt) => attempt,
            };

            let Some(kind) = attempt.kind() else {
                return Err(exhausted(url, attempt, retries.used()));
            };

            match retries.next_delay(kind) {
                Some(delay) => {
                    tracing::debug!(
                        url,
                        ?kind,
                        retry = retries.used().total(),
                        delay_ms = delay.as_millis() as u64,
                        "retrying request"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => return Err(exhausted(url, attempt, retries.used())),
            }
        }
    }

    async fn attempt(
        &self,
        url: &str,
        dest: &Path,
        range: Option<ByteRange>,
    ) -> Result<u64, Attempt> {
        let mut request = self.client.get(url).header(USER_AGENT, USER_AGENT_VALUE);
        if let Some(range) = range {
            request = request.header(RANGE, range.header_value());
        }

        let mut response = request.send().await.map_err(|err| classify(url, err))?;

        let status = response.status();
        if !status.is_success() {
            if self.policy.status_forcelist.contains(&status.as_u16()) {
                return Err(Attempt::Status(status));
            }
            return Err(Attempt::Fatal(FetchError::Status {
                url: url.to_owned(),
                status: status.as_u16(),
            }));
        }

        let io_err = |source| {
            Attempt::Fatal(FetchError::Io {
                path: dest.to_path_buf(),
                source,
            })
        };
        let file = tokio::fs::File::create(dest).await.map_err(io_err)?;
        let mut out = tokio::io::BufWriter::with_capacity(self.policy.chunk_size.max(1), file);

        let mut written = 0_u64;
        while let Some(chunk) = response.chunk().await.map_err(Attempt::Read)? {
            out.write_all(&chunk).await.map_err(io_err)?;
            written += chunk.len() as u64;
        }
        out.flush().await.map_err(io_err)?;

        Ok(written)
    }
}

fn classify(url: &str, err: reqwest::Error) -> Attempt {
    if err.is_redirect() {
        return Attempt::Fatal(FetchError::Redirects {
            url: url.to_owned(),
            source: err,
        });
    }
    if err.is_builder() {
        return Attempt::Fatal(FetchError::Request {
            url: url.to_owned(),
            source: err,
        });
    }
    if err.is_connect() {
        return Attempt::Connect(err);
    }
    Attempt::Read(err)
}

fn exhausted(url: &str, attempt: Attempt, used: RetryCounts) -> FetchError {
    let url = url.to_owned();
    match attempt {
        Attempt::Connect(source) => FetchError::Connect {
            url,
            retries: used.connect,
            source,
        },
        Attempt::Read(source) => FetchError::Read {
            url,
            retries: used.read,
            source,
        },
        Attempt::Status(status) => FetchError::RetryableStatus {
            url,
            status: status.as_u16(),
            retries: used.status,
        },
        Attempt::Fatal(err) => err,
    }
}
