//! Datastore access + the ingestion sink that upserts normalized opportunities.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use ladder_core::{ConflictKey, Opportunity};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "ladder-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("datastore request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("datastore rejected write ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("datastore returned malformed rows: {0}")]
    Decode(#[from] serde_json::Error),
}

/// The contract the scrape pipeline has with the shared datastore.
#[async_trait]
pub trait OpportunityStore: Send + Sync {
    /// Insert-or-overwrite `rows`, resolving conflicts on `conflict_key`.
    /// Returns the number of rows sent.
    async fn upsert(&self, rows: &[Opportunity], conflict_key: ConflictKey) -> Result<usize, StoreError>;

    async fn select_all(&self) -> Result<Vec<Opportunity>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct RestStoreConfig {
    pub base_url: String,
    pub api_key: String,
    pub table: String,
    pub timeout: Duration,
}

impl RestStoreConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            table: "opportunities".to_string(),
            timeout: Duration::from_secs(20),
        }
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url.trim_end_matches('/'), self.table)
    }
}

/// PostgREST-style store (the hosted Postgres behind the app).
#[derive(Debug)]
pub struct RestOpportunityStore {
    client: reqwest::Client,
    table_url: String,
}

impl RestOpportunityStore {
    pub fn new(config: RestStoreConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "apikey",
            HeaderValue::from_str(&config.api_key).context("datastore api key is not a valid header")?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", config.api_key))
                .context("datastore api key is not a valid header")?,
        );

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            table_url: config.table_url(),
        })
    }

    pub fn table_url(&self) -> &str {
        &self.table_url
    }
}

async fn reject(resp: reqwest::Response) -> StoreError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    StoreError::Rejected { status, body }
}

#[async_trait]
impl OpportunityStore for RestOpportunityStore {
    async fn upsert(&self, rows: &[Opportunity], conflict_key: ConflictKey) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let resp = self
            .client
            .post(&self.table_url)
            .query(&[("on_conflict", conflict_key.column())])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(rows)
            .send()
            .await?;

        match resp.status() {
            status if status.is_success() => Ok(rows.len()),
            _ => Err(reject(resp).await),
        }
    }

    async fn select_all(&self) -> Result<Vec<Opportunity>, StoreError> {
        let resp = self
            .client
            .get(&self.table_url)
            .query(&[("select", "*")])
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(reject(resp).await);
        }
        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Process-local store keyed by the conflict column; used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryOpportunityStore {
    rows: Mutex<BTreeMap<String, Opportunity>>,
    rejection: Option<String>,
}

impl MemoryOpportunityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that refuses every write with `message`.
    pub fn rejecting(message: impl Into<String>) -> Self {
        Self {
            rows: Mutex::default(),
            rejection: Some(message.into()),
        }
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn get(&self, key: &str) -> Option<Opportunity> {
        self.rows.lock().await.get(key).cloned()
    }
}

#[async_trait]
impl OpportunityStore for MemoryOpportunityStore {
    async fn upsert(&self, rows: &[Opportunity], conflict_key: ConflictKey) -> Result<usize, StoreError> {
        if let Some(message) = &self.rejection {
            return Err(StoreError::Rejected {
                status: 409,
                body: message.clone(),
            });
        }
        let mut table = self.rows.lock().await;
        let mut written = 0usize;
        for row in rows {
            let Some(key) = conflict_key.key_of(row) else {
                continue;
            };
            table.insert(key.to_string(), row.clone());
            written += 1;
        }
        Ok(written)
    }

    async fn select_all(&self) -> Result<Vec<Opportunity>, StoreError> {
        Ok(self.rows.lock().await.values().cloned().collect())
    }
}

/// Validates, deduplicates and writes one batch of opportunities.
#[derive(Clone)]
pub struct IngestionSink {
    store: Arc<dyn OpportunityStore>,
    conflict_key: ConflictKey,
}

impl IngestionSink {
    pub fn new(store: Arc<dyn OpportunityStore>, conflict_key: ConflictKey) -> Self {
        Self { store, conflict_key }
    }

    pub fn conflict_key(&self) -> ConflictKey {
        self.conflict_key
    }

    /// Persist `records` with a single upsert and return how many were written.
    ///
    /// Datastore failures are logged and reported as zero rows written.
    pub async fn persist(&self, records: Vec<Opportunity>) -> usize {
        let offered = records.len();
        let batch = prepare_batch(records, self.conflict_key);
        if batch.is_empty() {
            debug!(offered, "nothing persistable in batch");
            return 0;
        }

        let span = info_span!("persist", offered, batch = batch.len(), conflict_key = self.conflict_key.column());
        match self.store.upsert(&batch, self.conflict_key).instrument(span).await {
            Ok(written) => {
                info!(written, offered, "saved opportunities");
                written
            }
            Err(err) => {
                warn!(error = %err, rows = batch.len(), "datastore rejected batch");
                0
            }
        }
    }
}

/// Drops invalid rows and collapses repeated keys (the last occurrence wins,
/// at the position of the first), since one upsert cannot touch a row twice.
pub fn prepare_batch(records: Vec<Opportunity>, conflict_key: ConflictKey) -> Vec<Opportunity> {
    let mut out: Vec<Opportunity> = Vec::with_capacity(records.len());
    let mut index_by_key: HashMap<String, usize> = HashMap::new();

    for record in records {
        if !record.is_persistable() {
            debug!(id = %record.id, "dropping record without title and link");
            continue;
        }
        let Some(key) = conflict_key.key_of(&record).map(ToString::to_string) else {
            debug!(title = %record.title, column = conflict_key.column(), "dropping record without conflict key");
            continue;
        };
        match index_by_key.get(&key) {
            Some(&idx) => out[idx] = record,
            None => {
                index_by_key.insert(key, out.len());
                out.push(record);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ladder_core::{EducationLevel, OpportunityType};

    fn opp(title: &str, link: Option<&str>, description: &str) -> Opportunity {
        Opportunity {
            id: link.unwrap_or(title).to_string(),
            title: title.to_string(),
            organization: "arXiv".into(),
            description: description.to_string(),
            opportunity_type: OpportunityType::Research,
            education_level: EducationLevel::Graduate,
            link: link.map(ToString::to_string),
            requirements: vec![],
            deadline: None,
            location: None,
            source_id: "arxiv".into(),
        }
    }

    fn sink(store: Arc<MemoryOpportunityStore>) -> IngestionSink {
        IngestionSink::new(store, ConflictKey::Link)
    }

    #[tokio::test]
    async fn records_without_title_and_link_are_discarded() {
        let store = Arc::new(MemoryOpportunityStore::new());
        let written = sink(store.clone()).persist(vec![opp("", None, "x")]).await;
        assert_eq!(written, 0);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn upsert_is_idempotent_and_last_write_wins() {
        let store = Arc::new(MemoryOpportunityStore::new());
        let sink = sink(store.clone());
        let link = Some("https://arxiv.org/abs/1");

        assert_eq!(sink.persist(vec![opp("Paper", link, "first")]).await, 1);
        assert_eq!(sink.persist(vec![opp("Paper v2", link, "second")]).await, 1);

        assert_eq!(store.len().await, 1);
        let row = store.get("https://arxiv.org/abs/1").await.unwrap();
        assert_eq!(row.title, "Paper v2");
        assert_eq!(row.description, "second");
    }

    #[tokio::test]
    async fn datastore_rejection_is_logged_not_raised() {
        let store = Arc::new(MemoryOpportunityStore::rejecting("permission denied"));
        let written = sink(store).persist(vec![opp("Paper", Some("https://x.org/1"), "")]).await;
        assert_eq!(written, 0);
    }

    #[test]
    fn batch_collapses_duplicate_keys_in_place() {
        let batch = prepare_batch(
            vec![
                opp("A", Some("https://x.org/a"), "old"),
                opp("B", Some("https://x.org/b"), ""),
                opp("A again", Some("https://x.org/a"), "new"),
            ],
            ConflictKey::Link,
        );
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].title, "A again");
        assert_eq!(batch[1].title, "B");
    }

    #[test]
    fn batch_skips_rows_missing_the_conflict_column() {
        let rows = vec![opp("Title only", None, ""), opp("", Some("https://x.org/z"), "")];
        assert_eq!(prepare_batch(rows.clone(), ConflictKey::Link).len(), 1);
        assert_eq!(prepare_batch(rows, ConflictKey::Title).len(), 1);
    }

    #[test]
    fn rest_table_url_is_normalized() {
        let mut config = RestStoreConfig::new("https://project.supabase.co/", "anon");
        config.table = "opportunities".into();
        let store = RestOpportunityStore::new(config).unwrap();
        assert_eq!(store.table_url(), "https://project.supabase.co/rest/v1/opportunities");
    }
}
