//! Source adapter contracts + parsers for the weather, tide and catch report sources.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use choka_core::{Availability, SourceKind};
use choka_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub mod reports;
pub mod text;
pub mod tide;
pub mod weather;

pub use reports::{ParseFieldError, ReportAdapter, ReportBatch, ReportSelectors};
pub use tide::TideAdapter;
pub use weather::WeatherAdapter;

pub const CRATE_NAME: &str = "choka-adapters";

/// Characters of raw body kept in format error diagnostics.
pub const SNIPPET_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

/// Per-cycle request context. `reference_date` is the calendar date at cycle start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub cycle_id: Uuid,
    pub reference_date: NaiveDate,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{kind} fetch failed: {error}")]
    Fetch {
        kind: SourceKind,
        #[source]
        error: FetchError,
    },
    #[error("{kind} payload is not valid {expected}: {detail}")]
    Format {
        kind: SourceKind,
        expected: &'static str,
        detail: String,
        snippet: String,
    },
    #[error("invalid selector {selector:?}: {detail}")]
    Selector { selector: String, detail: String },
}

impl AdapterError {
    pub fn format(kind: SourceKind, expected: &'static str, detail: impl ToString, body: &[u8]) -> Self {
        AdapterError::Format {
            kind,
            expected,
            detail: detail.to_string(),
            snippet: text::snippet(body, SNIPPET_CHARS),
        }
    }
}

/// One source: how to address it for a cycle and how to read its payload.
///
/// Parsing is pure. A well-formed payload without the cycle's data returns
/// `Availability::Absent`; only a payload of the wrong shape is an error.
pub trait SourceAdapter: Send + Sync {
    type Output: Send;

    fn source(&self) -> SourceKind;

    fn request_url(&self, ctx: &AdapterContext) -> String;

    fn parse(
        &self,
        ctx: &AdapterContext,
        page: &FetchedPage,
    ) -> Result<Availability<Self::Output>, AdapterError>;
}

#[async_trait]
pub trait PayloadFetcher: Send + Sync {
    async fn fetch(
        &self,
        ctx: &AdapterContext,
        source: SourceKind,
        url: &str,
    ) -> Result<FetchedPage, FetchError>;
}

#[async_trait]
impl PayloadFetcher for HttpFetcher {
    async fn fetch(
        &self,
        ctx: &AdapterContext,
        source: SourceKind,
        url: &str,
    ) -> Result<FetchedPage, FetchError> {
        let resp = self.fetch_bytes(ctx.cycle_id, source, url).await?;
        Ok(FetchedPage {
            url: resp.final_url,
            body: resp.body,
            fetched_at: resp.fetched_at,
        })
    }
}

/// Outcome of one fetch + parse attempt. `page` is kept for archiving even when parsing fails.
#[derive(Debug)]
pub struct SourceAttempt<T> {
    pub source: SourceKind,
    pub page: Option<FetchedPage>,
    pub outcome: Result<Availability<T>, AdapterError>,
}

pub async fn fetch_and_parse<A: SourceAdapter>(
    adapter: &A,
    fetcher: &dyn PayloadFetcher,
    ctx: &AdapterContext,
) -> SourceAttempt<A::Output> {
    let source = adapter.source();
    let url = adapter.request_url(ctx);
    match fetcher.fetch(ctx, source, &url).await {
        Ok(page) => {
            let outcome = adapter.parse(ctx, &page);
            debug!(
                cycle_id = %ctx.cycle_id,
                %source,
                bytes = page.body.len(),
                present = matches!(outcome, Ok(Availability::Present(_))),
                "payload parsed"
            );
            SourceAttempt {
                source,
                page: Some(page),
                outcome,
            }
        }
        Err(error) => SourceAttempt {
            source,
            page: None,
            outcome: Err(AdapterError::Fetch {
                kind: source,
                error,
            }),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixtureResponse {
    Body(Vec<u8>),
    Status(u16),
}

/// Serves canned payloads per source instead of touching the network.
#[derive(Debug, Clone, Default)]
pub struct FixtureFetcher {
    responses: HashMap<SourceKind, FixtureResponse>,
}

impl FixtureFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_body(mut self, source: SourceKind, body: impl Into<Vec<u8>>) -> Self {
        self.responses
            .insert(source, FixtureResponse::Body(body.into()));
        self
    }

    pub fn with_status(mut self, source: SourceKind, status: u16) -> Self {
        self.responses.insert(source, FixtureResponse::Status(status));
        self
    }

    /// Load `weather.json`, `tide.json` and `reports.html` from `dir`, skipping missing files.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut fetcher = Self::new();
        for source in SourceKind::ALL {
            let path = dir.join(format!("{}.{}", source.as_str(), source.payload_extension()));
            if !path.exists() {
                continue;
            }
            let body = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            fetcher = fetcher.with_body(source, body);
        }
        Ok(fetcher)
    }
}

#[async_trait]
impl PayloadFetcher for FixtureFetcher {
    async fn fetch(
        &self,
        _ctx: &AdapterContext,
        source: SourceKind,
        url: &str,
    ) -> Result<FetchedPage, FetchError> {
        match self.responses.get(&source) {
            Some(FixtureResponse::Body(body)) => Ok(FetchedPage {
                url: url.to_string(),
                body: body.clone(),
                fetched_at: Utc::now(),
            }),
            Some(FixtureResponse::Status(status)) => Err(FetchError::HttpStatus {
                status: *status,
                url: url.to_string(),
            }),
            None => Err(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            }),
        }
    }
}
