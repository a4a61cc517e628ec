//! One-shot scrape pass: load each configured site, extract, normalize and
//! upsert, isolating failures per site.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ladder_adapters::{
    extractor_for_source, normalize_all, AdapterError, GenericPageExtractor, SiteExtractor, SourceSite, GENERIC_SOURCE_ID,
};
use ladder_browser::{BrowserError, BrowserSession, PageLoader, SessionConfig, WaitStep, DEFAULT_USER_AGENT};
use ladder_core::{AdminAllowList, ConflictKey};
use ladder_storage::{IngestionSink, OpportunityStore, RestOpportunityStore, RestStoreConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ladder-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SiteConfig>,
}

impl SourceRegistry {
    pub fn enabled(&self) -> Vec<SiteConfig> {
        self.sources.iter().filter(|s| s.enabled).cloned().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SiteConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub listing_url: String,
    #[serde(default)]
    pub wait: Vec<WaitStep>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SiteConfig {
    /// An ad-hoc site for one submitted page, read with the generic extractor
    /// once the network is idle.
    pub fn single_page(url: &str) -> Result<Self, AdapterError> {
        let site = SourceSite::from_listing_url(GENERIC_SOURCE_ID, "", url)?;
        let host = site.origin.host_str().unwrap_or(GENERIC_SOURCE_ID).to_string();
        Ok(Self {
            source_id: GENERIC_SOURCE_ID.to_string(),
            display_name: host,
            enabled: true,
            listing_url: url.trim().to_string(),
            wait: vec![WaitStep::network_idle()],
            notes: None,
        })
    }

    fn extractor(&self) -> Option<Box<dyn SiteExtractor>> {
        if self.source_id == GENERIC_SOURCE_ID {
            Some(Box::new(GenericPageExtractor::new(&self.listing_url)))
        } else {
            extractor_for_source(&self.source_id)
        }
    }
}

fn enabled_by_default() -> bool {
    true
}

pub async fn load_source_registry(path: &Path) -> Result<SourceRegistry> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {message}")]
    Invalid { var: &'static str, message: String },
}

/// Settings for the scrape job, read from the process environment.
#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub datastore_url: String,
    pub datastore_key: String,
    pub table: String,
    pub conflict_key: ConflictKey,
    pub sources_path: PathBuf,
    pub reports_dir: Option<PathBuf>,
    pub user_agent: String,
    pub headless: bool,
    pub navigation_timeout_secs: u64,
    pub admins: AdminAllowList,
}

impl ScrapeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; `from_env` passes `std::env::var`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let navigation_timeout_secs = match get("LADDER_NAV_TIMEOUT_SECS") {
            None => 45,
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                var: "LADDER_NAV_TIMEOUT_SECS",
                message: format!("`{raw}` is not a number of seconds"),
            })?,
        };

        Ok(Self {
            datastore_url: required("SUPABASE_URL")?,
            datastore_key: required("SUPABASE_ANON_KEY")?,
            table: get("LADDER_TABLE").unwrap_or_else(|| "opportunities".to_string()),
            conflict_key: ConflictKey::Link,
            sources_path: get("LADDER_SOURCES")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sources.yaml")),
            reports_dir: get("LADDER_REPORTS_DIR").map(PathBuf::from),
            user_agent: get("LADDER_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            headless: get("LADDER_HEADLESS")
                .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no"))
                .unwrap_or(true),
            navigation_timeout_secs,
            admins: get("LADDER_ADMINS")
                .map(|v| AdminAllowList::parse(&v))
                .unwrap_or_default(),
        })
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            headless: self.headless,
            user_agent: self.user_agent.clone(),
            navigation_timeout: Duration::from_secs(self.navigation_timeout_secs),
            ..SessionConfig::default()
        }
    }

    pub fn store_config(&self) -> RestStoreConfig {
        let mut config = RestStoreConfig::new(&self.datastore_url, &self.datastore_key);
        config.table = self.table.clone();
        config
    }
}

#[derive(Debug, Error)]
pub enum SiteError {
    #[error("no extractor registered for source `{0}`")]
    UnknownSource(String),
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

impl SiteError {
    fn is_session_fatal(&self) -> bool {
        matches!(self, SiteError::Browser(err) if err.is_session_fatal())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SiteOutcome {
    Completed { extracted: usize, written: usize },
    Failed { error: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteSummary {
    pub source_id: String,
    pub display_name: String,
    #[serde(flatten)]
    pub outcome: SiteOutcome,
}

impl SiteSummary {
    pub fn written(&self) -> usize {
        match self.outcome {
            SiteOutcome::Completed { written, .. } => written,
            _ => 0,
        }
    }

    pub fn extracted(&self) -> usize {
        match self.outcome {
            SiteOutcome::Completed { extracted, .. } => extracted,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sites: Vec<SiteSummary>,
}

impl SummaryReport {
    pub fn total_extracted(&self) -> usize {
        self.sites.iter().map(SiteSummary::extracted).sum()
    }

    pub fn total_written(&self) -> usize {
        self.sites.iter().map(SiteSummary::written).sum()
    }

    pub fn failed(&self) -> impl Iterator<Item = &SiteSummary> {
        self.sites
            .iter()
            .filter(|s| matches!(s.outcome, SiteOutcome::Failed { .. }))
    }

    pub fn site(&self, source_id: &str) -> Option<&SiteSummary> {
        self.sites.iter().find(|s| s.source_id == source_id)
    }

    /// Markdown brief with one line per site.
    pub fn to_markdown(&self) -> String {
        let lines = self
            .sites
            .iter()
            .map(|s| match &s.outcome {
                SiteOutcome::Completed { extracted, written } => {
                    format!("- {}: {written} saved of {extracted} found", s.display_name)
                }
                SiteOutcome::Failed { error } => format!("- {}: failed ({error})", s.display_name),
                SiteOutcome::Skipped { reason } => format!("- {}: skipped ({reason})", s.display_name),
            })
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "# Scrape Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Found: {}\n- Saved: {}\n\n## Sites\n{}\n",
            self.run_id,
            self.started_at,
            self.finished_at,
            self.total_extracted(),
            self.total_written(),
            lines
        )
    }
}

/// Sequences the per-site pipeline over one page loader.
pub struct ScrapeOrchestrator {
    sink: IngestionSink,
}

impl ScrapeOrchestrator {
    pub fn new(sink: IngestionSink) -> Self {
        Self { sink }
    }

    /// Run every site in order on `loader`. A failing site is recorded and
    /// the pass continues; a session-fatal browser error skips the rest.
    pub async fn run(&self, loader: &dyn PageLoader, sites: &[SiteConfig]) -> SummaryReport {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, sites = sites.len(), "scrape pass starting");

        let mut summaries = Vec::with_capacity(sites.len());
        let mut session_lost: Option<String> = None;

        for site in sites {
            if let Some(reason) = &session_lost {
                summaries.push(SiteSummary {
                    source_id: site.source_id.clone(),
                    display_name: site.display_name.clone(),
                    outcome: SiteOutcome::Skipped {
                        reason: reason.clone(),
                    },
                });
                continue;
            }

            let span = info_span!("scrape_site", %run_id, source_id = %site.source_id);
            let outcome = match self.scrape_site(loader, site).instrument(span).await {
                Ok((extracted, written)) => SiteOutcome::Completed { extracted, written },
                Err(err) => {
                    warn!(source_id = %site.source_id, error = %err, "site scrape failed; continuing");
                    if err.is_session_fatal() {
                        session_lost = Some(format!("browser session lost at {}", site.source_id));
                    }
                    SiteOutcome::Failed {
                        error: err.to_string(),
                    }
                }
            };
            summaries.push(SiteSummary {
                source_id: site.source_id.clone(),
                display_name: site.display_name.clone(),
                outcome,
            });
        }

        let report = SummaryReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sites: summaries,
        };
        info!(
            %run_id,
            found = report.total_extracted(),
            saved = report.total_written(),
            failed = report.failed().count(),
            "scrape pass finished"
        );
        report
    }

    async fn scrape_site(&self, loader: &dyn PageLoader, site: &SiteConfig) -> Result<(usize, usize), SiteError> {
        let extractor = site
            .extractor()
            .ok_or_else(|| SiteError::UnknownSource(site.source_id.clone()))?;
        let source = SourceSite::from_listing_url(&site.source_id, &site.display_name, &site.listing_url)?;

        info!(url = %site.listing_url, "loading listing page");
        let page = loader.load(&site.listing_url, &site.wait).await?;
        let raw = extractor.extract(&page.html)?;
        let extracted = raw.len();
        let opportunities = normalize_all(raw, &source);
        let written = self.sink.persist(opportunities).await;
        info!(extracted, written, "site done");
        Ok((extracted, written))
    }

    /// Launch a browser, run all sites, and close the browser on every path.
    pub async fn run_with_browser(&self, session: &SessionConfig, sites: &[SiteConfig]) -> SummaryReport {
        let browser = match BrowserSession::open(session).await {
            Ok(browser) => browser,
            Err(err) => {
                error!(error = %err, "could not start browser; no sites scraped");
                let now = Utc::now();
                return SummaryReport {
                    run_id: Uuid::new_v4(),
                    started_at: now,
                    finished_at: now,
                    sites: sites
                        .iter()
                        .map(|s| SiteSummary {
                            source_id: s.source_id.clone(),
                            display_name: s.display_name.clone(),
                            outcome: SiteOutcome::Failed {
                                error: err.to_string(),
                            },
                        })
                        .collect(),
                };
            }
        };

        let report = self.run(&browser, sites).await;
        browser.close().await;
        report
    }
}

/// Writes `summary.json` and `scrape_brief.md` under `<dir>/<run_id>/`.
pub async fn write_report(dir: &Path, report: &SummaryReport) -> Result<PathBuf> {
    let run_dir = dir.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing summary report")?;
    fs::write(run_dir.join("summary.json"), json)
        .await
        .context("writing summary.json")?;
    fs::write(run_dir.join("scrape_brief.md"), report.to_markdown())
        .await
        .context("writing scrape_brief.md")?;
    Ok(run_dir)
}

/// Per-source row counts currently in the datastore.
pub async fn source_counts(store: &dyn OpportunityStore) -> Result<BTreeMap<String, usize>> {
    let rows = store.select_all().await.context("selecting opportunities")?;
    let mut counts = BTreeMap::new();
    for row in rows {
        *counts.entry(row.source_id).or_default() += 1;
    }
    Ok(counts)
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0} is not on the admin allow-list")]
pub struct NotAuthorized(pub String);

pub fn authorize_trigger(admins: &AdminAllowList, requester: &str) -> Result<(), NotAuthorized> {
    if admins.is_admin(requester) {
        Ok(())
    } else {
        Err(NotAuthorized(requester.trim().to_string()))
    }
}

/// The scrape job: registry + datastore from `config`, one browser pass,
/// optional report on disk.
pub async fn run_scrape(config: &ScrapeConfig) -> Result<SummaryReport> {
    let registry = load_source_registry(&config.sources_path).await?;
    let sites = registry.enabled();
    let store = RestOpportunityStore::new(config.store_config())?;
    let orchestrator = ScrapeOrchestrator::new(IngestionSink::new(Arc::new(store), config.conflict_key));

    let report = orchestrator.run_with_browser(&config.session_config(), &sites).await;

    if let Some(dir) = &config.reports_dir {
        match write_report(dir, &report).await {
            Ok(path) => info!(path = %path.display(), "report written"),
            Err(err) => warn!(error = %err, "could not write report"),
        }
    }
    Ok(report)
}

/// Admin-initiated scrape, refused unless `requester` is on the allow-list.
/// With `page_url` only that page is scraped; otherwise the whole registry.
pub async fn trigger_scrape(config: &ScrapeConfig, requester: &str, page_url: Option<&str>) -> Result<SummaryReport> {
    authorize_trigger(&config.admins, requester)?;
    let Some(page_url) = page_url else {
        info!(requester, "admin triggered scrape");
        return run_scrape(config).await;
    };

    info!(requester, page_url, "admin triggered single-page scrape");
    let site = SiteConfig::single_page(page_url).with_context(|| format!("scraping {page_url}"))?;
    let store = RestOpportunityStore::new(config.store_config())?;
    let orchestrator = ScrapeOrchestrator::new(IngestionSink::new(Arc::new(store), config.conflict_key));
    Ok(orchestrator.run_with_browser(&config.session_config(), &[site]).await)
}
