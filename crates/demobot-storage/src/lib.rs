//! Snapshot persistence and dataset fetching for the assembly register.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use demobot_core::{iso_date, Assembly, Dataset};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "demobot-storage";

pub const DEFAULT_DATASET_URL: &str =
    "https://www.dresden.de/data_ext/versammlungsuebersicht/Versammlungen.json";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot {} does not exist", .path.display())]
    Missing { path: PathBuf },
    #[error("snapshot {} is not a valid dataset: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("i/o on snapshot {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing snapshot: {0}")]
    Serialize(#[source] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct PersistedSnapshot {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
    pub record_count: usize,
}

/// The previous run's dataset on disk. Replaced wholesale, never patched.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Read the previous dataset. A missing or undecodable file is an error,
    /// never an empty dataset.
    pub async fn load(&self) -> Result<Dataset, SnapshotError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SnapshotError::Missing {
                    path: self.path.clone(),
                })
            }
            Err(source) => {
                return Err(SnapshotError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let dataset: Dataset =
            serde_json::from_slice(&bytes).map_err(|source| SnapshotError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        debug!(
            path = %self.path.display(),
            records = dataset.len(),
            "loaded snapshot"
        );
        Ok(dataset)
    }

    /// Overwrite the snapshot with `dataset` using a temp file and an atomic rename.
    pub async fn persist(&self, dataset: &Dataset) -> Result<PersistedSnapshot, SnapshotError> {
        let bytes = serde_json::to_vec_pretty(dataset).map_err(SnapshotError::Serialize)?;
        self.write_atomically(&bytes).await?;

        let persisted = PersistedSnapshot {
            path: self.path.clone(),
            content_hash: Self::sha256_hex(&bytes),
            byte_size: bytes.len(),
            record_count: dataset.len(),
        };
        info!(
            path = %persisted.path.display(),
            records = persisted.record_count,
            sha256 = %persisted.content_hash,
            "snapshot persisted"
        );
        Ok(persisted)
    }

    /// Write an empty dataset if no snapshot exists yet. Returns whether a file was created.
    pub async fn init_empty(&self) -> Result<bool, SnapshotError> {
        let exists = fs::try_exists(&self.path)
            .await
            .map_err(|source| self.io_error(source))?;
        if exists {
            return Ok(false);
        }
        self.persist(&Dataset::default()).await?;
        Ok(true)
    }

    async fn write_atomically(&self, bytes: &[u8]) -> Result<(), SnapshotError> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf);
        if let Some(parent) = &parent {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| self.io_error(source))?;
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = match &parent {
            Some(parent) => parent.join(temp_name),
            None => PathBuf::from(temp_name),
        };

        let written = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &self.path).await
        }
        .await;

        if let Err(source) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(self.io_error(source));
        }
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> SnapshotError {
        SnapshotError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Records of `current` that were not announced in this exact state before and
/// are dated today or later, ordered by date.
pub fn change_set(previous: &Dataset, current: &Dataset, today: NaiveDate) -> Vec<Assembly> {
    let seen = previous.identity_keys();
    let day = iso_date(today);
    let mut changes: Vec<Assembly> = current
        .assemblies()
        .into_iter()
        .filter(|a| !seen.contains(&a.identity_key()))
        .filter(|a| a.is_on_or_after(&day))
        .collect();
    changes.sort_by(|a, b| a.date.cmp(&b.date));
    changes
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("dataset from {url} is malformed: {source}")]
    Malformed {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Source(String),
    #[error("dataset unavailable after {attempts} attempts: {last_error}")]
    Exhausted { attempts: usize, last_error: String },
}

/// A single attempt at obtaining the current register.
#[async_trait]
pub trait DatasetSource: Send + Sync {
    fn describe(&self) -> String;

    async fn fetch_once(&self) -> Result<Dataset, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

pub fn build_http_client(config: &HttpClientConfig) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder.build()
}

#[derive(Debug, Clone)]
pub struct HttpDatasetSource {
    client: reqwest::Client,
    url: String,
}

impl HttpDatasetSource {
    pub fn new(url: impl Into<String>, config: &HttpClientConfig) -> Result<Self, FetchError> {
        Ok(Self {
            client: build_http_client(config)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl DatasetSource for HttpDatasetSource {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn fetch_once(&self) -> Result<Dataset, FetchError> {
        let span = tracing::info_span!("dataset_fetch", url = %self.url);
        async {
            let resp = self.client.get(&self.url).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }
            let body = resp.bytes().await?;
            debug!(bytes = body.len(), "dataset body received");
            serde_json::from_slice(&body).map_err(|source| FetchError::Malformed {
                url: self.url.clone(),
                source,
            })
        }
        .instrument(span)
        .await
    }
}

/// Fixed-delay retry for the dataset fetch.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(10),
        }
    }
}

/// Fetch the dataset, retrying any failure up to the policy's attempt budget.
pub async fn fetch_dataset(
    source: &dyn DatasetSource,
    policy: &RetryPolicy,
) -> Result<Dataset, FetchError> {
    let attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match source.fetch_once().await {
            Ok(dataset) => {
                info!(
                    source = %source.describe(),
                    attempt,
                    records = dataset.len(),
                    "dataset fetched"
                );
                return Ok(dataset);
            }
            Err(err) => {
                warn!(
                    source = %source.describe(),
                    attempt,
                    max_attempts = attempts,
                    error = %err,
                    "dataset fetch failed"
                );
                last_error = err.to_string();
                if attempt < attempts {
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }
    }

    Err(FetchError::Exhausted {
        attempts,
        last_error,
    })
}
