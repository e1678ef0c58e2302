use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{bail, Result};
use scraper::Html;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::browser::{BrowserError, BrowserSession, Locator};
use crate::config::CrawlConfig;
use crate::pager::{NextTarget, Pager};
use crate::parser::{count_matches, harvest_page};
use crate::progress::publish;
use crate::record::{FieldValue, LicenseRecord, CURRENT_URL};
use crate::site::{Listing, Paging, SiteAdapter};
use crate::store::{IngestOutcome, RecordStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlState {
    NotStarted,
    Navigating,
    Harvesting,
    Advancing,
    Done,
    Aborted,
}

impl fmt::Display for CrawlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CrawlState::NotStarted => "NOT_STARTED",
            CrawlState::Navigating => "NAVIGATING",
            CrawlState::Harvesting => "HARVESTING",
            CrawlState::Advancing => "ADVANCING",
            CrawlState::Done => "DONE",
            CrawlState::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// The two manual steps an operator completes before a crawl may begin.
#[derive(Debug, Clone, Copy, Default)]
pub struct OperatorGate {
    pub automation_check: bool,
    pub search_terms_entered: bool,
}

impl OperatorGate {
    pub fn ready(&self) -> bool {
        self.automation_check && self.search_terms_entered
    }

    pub fn check(&self) -> Result<()> {
        if self.ready() {
            return Ok(());
        }
        let mut missing = Vec::new();
        if !self.automation_check {
            missing.push("automation check (--captcha-cleared)");
        }
        if !self.search_terms_entered {
            missing.push("search terms (--search-entered)");
        }
        bail!("Crawl not started; operator has not confirmed: {}", missing.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    IterationCeiling(usize),
    Shutdown,
    Browser(String),
    Storage(String),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::IterationCeiling(n) => write!(f, "iteration ceiling of {n} reached"),
            AbortReason::Shutdown => f.write_str("shutdown requested"),
            AbortReason::Browser(e) => write!(f, "browser failure: {e}"),
            AbortReason::Storage(e) => write!(f, "storage failure: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlOutcome {
    Done,
    Aborted(AbortReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlSummary {
    pub outcome: CrawlOutcome,
    pub pages: usize,
    pub failed_pages: usize,
    pub harvested: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub declared_total: Option<usize>,
}

/// Drive one crawl to completion or abort. The session is closed on every
/// path; records ingested before an abort stay persisted.
pub async fn run_crawl<B: BrowserSession>(
    mut session: B,
    site: &dyn SiteAdapter,
    config: &CrawlConfig,
    store: &mut RecordStore,
    progress: &watch::Sender<f64>,
    shutdown: &AtomicBool,
) -> CrawlSummary {
    let mut crawler = Crawler {
        site,
        config,
        store,
        progress,
        shutdown,
        state: CrawlState::NotStarted,
        pages: 0,
        failed_pages: 0,
        harvested: 0,
        inserted: 0,
        duplicates: 0,
    };

    info!(site = site.name(), location = %session.current_location(), "crawl started");
    let mut pager = Pager::new(site.paging(), config.items_per_page);
    let outcome = match crawler.drive(&mut session, &mut pager).await {
        Ok(()) => {
            crawler.enter(CrawlState::Done);
            publish(progress, 1.0);
            CrawlOutcome::Done
        }
        Err(reason) => {
            crawler.enter(CrawlState::Aborted);
            warn!(site = site.name(), "crawl aborted: {}", reason);
            CrawlOutcome::Aborted(reason)
        }
    };
    session.close().await;

    let summary = CrawlSummary {
        outcome,
        pages: crawler.pages,
        failed_pages: crawler.failed_pages,
        harvested: crawler.harvested,
        inserted: crawler.inserted,
        duplicates: crawler.duplicates,
        declared_total: pager.cursor().declared_total,
    };
    info!(
        site = site.name(),
        pages = summary.pages,
        failed_pages = summary.failed_pages,
        harvested = summary.harvested,
        inserted = summary.inserted,
        duplicates = summary.duplicates,
        "crawl finished"
    );
    summary
}

struct Crawler<'a> {
    site: &'a dyn SiteAdapter,
    config: &'a CrawlConfig,
    store: &'a mut RecordStore,
    progress: &'a watch::Sender<f64>,
    shutdown: &'a AtomicBool,
    state: CrawlState,
    pages: usize,
    failed_pages: usize,
    harvested: usize,
    inserted: usize,
    duplicates: usize,
}

impl Crawler<'_> {
    fn enter(&mut self, next: CrawlState) {
        debug!(from = %self.state, to = %next, "crawl state");
        self.state = next;
    }

    async fn drive<B: BrowserSession>(
        &mut self,
        session: &mut B,
        pager: &mut Pager,
    ) -> Result<(), AbortReason> {
        let start = read_markup(session).await?.unwrap_or_default();
        match self.site.paging() {
            Paging::ClickNext { .. } => {
                let total = self.poll_total(session, start.clone()).await?;
                pager.set_declared_total(total);
            }
            Paging::QueryParam { .. } => {
                if let Some(total) = declared_total_of(self.site, &start) {
                    info!(total, "declared total found");
                    pager.set_declared_total(total);
                }
            }
        }
        if pager.cursor().is_done() {
            info!(total = ?pager.cursor().declared_total, "nothing to crawl");
            return Ok(());
        }
        let mut target = pager
            .first_target(&start, &session.current_location())
            .map_err(|e| AbortReason::Browser(format!("{e:#}")))?;

        for iteration in 0.. {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(AbortReason::Shutdown);
            }
            if iteration >= self.config.iteration_ceiling {
                return Err(AbortReason::IterationCeiling(self.config.iteration_ceiling));
            }

            self.enter(CrawlState::Navigating);
            let loaded = match go(session, &target).await {
                Ok(()) => true,
                Err(e) if e.is_fatal() => return Err(AbortReason::Browser(e.to_string())),
                Err(e) => {
                    warn!(page = iteration + 1, "page skipped: {}", e);
                    false
                }
            };
            pause(self.config.settle_delay).await;

            self.enter(CrawlState::Harvesting);
            let markup = if loaded { read_markup(session).await? } else { None };
            let before = self.inserted;
            match (&markup, self.site.listing()) {
                (Some(m), Listing::Inline) => {
                    for record in harvest_page(self.site, m) {
                        self.ingest(&record)?;
                    }
                }
                (Some(m), Listing::Detail { row }) => self.harvest_details(session, m, row).await?,
                (None, _) => self.failed_pages += 1,
            }
            self.pages += 1;

            self.enter(CrawlState::Advancing);
            let step = pager.compute_next(self.site, markup.as_deref());
            let cursor = pager.cursor();
            info!(
                page = self.pages,
                inserted = self.inserted - before,
                offset = cursor.offset,
                total = ?cursor.declared_total,
                "page harvested"
            );
            publish(self.progress, cursor.fraction());
            if step.done {
                return Ok(());
            }
            target = step.target;
            pause(self.config.jitter_delay()).await;
        }
        Ok(())
    }

    /// Read the declared total from the results page, re-reading while it
    /// has not rendered yet. A total that never appears counts as zero.
    async fn poll_total<B: BrowserSession>(
        &mut self,
        session: &mut B,
        mut markup: String,
    ) -> Result<usize, AbortReason> {
        let attempts = self.config.total_poll_attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(total) = declared_total_of(self.site, &markup) {
                info!(total, attempt, "declared total found");
                return Ok(total);
            }
            if attempt < attempts {
                pause(self.config.total_poll_interval).await;
                markup = read_markup(session).await?.unwrap_or_default();
            }
        }
        warn!(attempts, "declared total not found, assuming 0");
        Ok(0)
    }

    /// Open each result row in turn, harvest its detail page, and return to
    /// the results page.
    async fn harvest_details<B: BrowserSession>(
        &mut self,
        session: &mut B,
        results: &str,
        row: &str,
    ) -> Result<(), AbortReason> {
        let results_location = session.current_location();
        let rows = count_matches(results, row);
        debug!(rows, "result rows on page");

        for idx in 0..rows {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(AbortReason::Shutdown);
            }
            let locator = Locator::nth(row, idx);
            match session.click(&locator).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(AbortReason::Browser(e.to_string())),
                Err(e) => {
                    warn!(row = idx, "detail skipped: {}", e);
                    continue;
                }
            }
            pause(self.config.settle_delay).await;

            if let Some(markup) = read_markup(session).await? {
                let location = session.current_location();
                for mut record in harvest_page(self.site, &markup) {
                    record.set(CURRENT_URL, FieldValue::Text(location.clone()));
                    self.ingest(&record)?;
                }
            }

            match session.navigate(&results_location).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(AbortReason::Browser(e.to_string())),
                Err(e) => warn!(row = idx, "could not return to results: {}", e),
            }
        }
        Ok(())
    }

    fn ingest(&mut self, record: &LicenseRecord) -> Result<(), AbortReason> {
        self.harvested += 1;
        match self.store.ingest(record) {
            Ok(IngestOutcome::Inserted) => self.inserted += 1,
            Ok(IngestOutcome::Duplicate) => self.duplicates += 1,
            Err(e) => {
                error!("failed to persist record: {:#}", e);
                return Err(AbortReason::Storage(format!("{e:#}")));
            }
        }
        Ok(())
    }
}

async fn go<B: BrowserSession>(session: &mut B, target: &NextTarget) -> Result<(), BrowserError> {
    match target {
        NextTarget::Url(url) => session.navigate(url).await,
        NextTarget::Click(locator) => session.click(locator).await,
        NextTarget::Stay => Ok(()),
    }
}

/// Current page markup; `None` when it could not be read this time.
async fn read_markup<B: BrowserSession>(session: &mut B) -> Result<Option<String>, AbortReason> {
    match session.current_markup().await {
        Ok(m) => Ok(Some(m)),
        Err(e) if e.is_fatal() => Err(AbortReason::Browser(e.to_string())),
        Err(e) => {
            warn!("could not read page: {}", e);
            Ok(None)
        }
    }
}

fn declared_total_of(site: &dyn SiteAdapter, markup: &str) -> Option<usize> {
    site.declared_total(&Html::parse_document(markup))
}

async fn pause(d: Duration) {
    if !d.is_zero() {
        tokio::time::sleep(d).await;
    }
}
