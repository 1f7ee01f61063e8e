//! Persistence + HTTP fetch utilities for choka: the deduplicating SQLite store,
//! the raw payload archive, and the source fetcher.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use choka_core::SourceKind;
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

pub mod db;
pub mod http;

pub use db::{BatchOutcome, ConditionsStore, InsertOutcome, StoreError};
pub use http::{FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RetryPolicy};

pub const CRATE_NAME: &str = "choka-storage";

#[derive(Debug, Clone)]
pub struct ArchivedPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable, hash-addressed archive of raw source payloads.
#[derive(Debug, Clone)]
pub struct PayloadArchive {
    root: PathBuf,
}

impl PayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn payload_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source: SourceKind,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(stamp)
            .join(source.as_str())
            .join(format!("{content_hash}.{}", source.payload_extension()))
    }

    /// Archive one payload. A payload already present at its hash-addressed path is
    /// reported as deduplicated and left untouched.
    pub async fn store_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        source: SourceKind,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPayload> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.payload_relative_path(fetched_at, source, &content_hash);
        let mut payload = ArchivedPayload {
            absolute_path: self.root.join(&relative_path),
            relative_path,
            content_hash,
            byte_size: bytes.len(),
            deduplicated: false,
        };

        let dir = payload
            .absolute_path
            .parent()
            .map_or_else(|| self.root.clone(), Path::to_path_buf);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating archive directory {}", dir.display()))?;

        payload.deduplicated = fs::try_exists(&payload.absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", payload.absolute_path.display()))?;
        if !payload.deduplicated {
            write_via_temp(&dir, &payload.absolute_path, bytes).await?;
        }
        Ok(payload)
    }
}

/// Readers never see a half-written payload: bytes land in a hidden sibling first.
async fn write_via_temp(dir: &Path, target: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let temp = dir.join(format!(".{}.partial", Uuid::new_v4()));
    fs::write(&temp, bytes)
        .await
        .with_context(|| format!("writing {}", temp.display()))?;
    if let Err(err) = fs::rename(&temp, target).await {
        let _ = fs::remove_file(&temp).await;
        return Err(err).with_context(|| format!("moving payload into {}", target.display()));
    }
    Ok(())
}
