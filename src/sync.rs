//! The portal sync pipeline: authenticate, walk the list pages, upsert
//! records, backfill detail pages, then hand pending records to the
//! ledger. One record failing its detail fetch or parse never aborts
//! the run; the failure lands in the run summary and the sync log goes
//! out PARTIAL instead of SUCCESS.

use crate::config::PortalConfig;
use crate::driver::PageDriver;
use crate::extract::{self, ListExtractor, RawRecord};
use crate::ledger::{LedgerEngine, LedgerSummary};
use crate::models::{
    ExternalRecord, Portal, RecordError, RecordStatus, RunOptions, RunSummary, SyncLog, SyncStatus,
};
use crate::navigation::{NavError, Navigator};
use crate::parse;
use crate::retry::retry_with_backoff;
use crate::store::{Store, StoreError, UpsertOutcome};
use chrono::Utc;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Pause between detail-page fetches so the portals are not hammered.
const DETAIL_FETCH_DELAY: Duration = Duration::from_millis(350);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("login to {portal:?} failed: {message}")]
    LoginFailed { portal: Portal, message: String },
    #[error(transparent)]
    Nav(#[from] NavError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Everything a finished run reports back to callers.
#[derive(Debug)]
pub struct SyncOutcome {
    pub log: SyncLog,
    pub summary: RunSummary,
    pub ledger: Option<LedgerSummary>,
}

pub struct SyncPipeline<'a, P: PageDriver, S: Store + ?Sized> {
    driver: &'a P,
    store: &'a S,
    portal: Portal,
    config: &'a PortalConfig,
    screenshot_dir: PathBuf,
}

impl<'a, P: PageDriver, S: Store + ?Sized> SyncPipeline<'a, P, S> {
    pub fn new(
        driver: &'a P,
        store: &'a S,
        portal: Portal,
        config: &'a PortalConfig,
        screenshot_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            driver,
            store,
            portal,
            config,
            screenshot_dir: screenshot_dir.into(),
        }
    }

    fn navigator(&self) -> Navigator<'_, P> {
        Navigator::new(
            self.driver,
            &self.config.timeouts,
            &self.config.login_redirect_pattern,
            self.screenshot_dir.clone(),
            self.portal.as_str(),
        )
    }

    /// Runs a full sync for this portal, recording the run in the sync
    /// log from RUNNING to its terminal status.
    pub async fn run(&self, options: &RunOptions) -> Result<SyncOutcome, SyncError> {
        let mut log = SyncLog::start(self.portal);
        self.store.insert_sync_log(&log)?;
        info!(
            target = "stocksync.sync",
            portal = self.portal.as_str(),
            run_id = %log.id,
            "sync run started"
        );

        match self.run_inner(options, &mut log).await {
            Ok((summary, ledger)) => {
                log.counts.failed = summary.errors.len() as u32;
                log.status = if summary.errors.is_empty() {
                    SyncStatus::Success
                } else {
                    SyncStatus::Partial
                };
                log.finished_at = Some(Utc::now());
                log.error = summarize_errors(&summary.errors);
                self.store.update_sync_log(&log)?;
                info!(
                    target = "stocksync.sync",
                    portal = self.portal.as_str(),
                    run_id = %log.id,
                    status = ?log.status,
                    found = log.counts.found,
                    inserted = log.counts.inserted,
                    updated = log.counts.updated,
                    failed = log.counts.failed,
                    "sync run finished"
                );
                Ok(SyncOutcome {
                    log,
                    summary,
                    ledger,
                })
            }
            Err(err) => {
                error!(
                    target = "stocksync.sync",
                    portal = self.portal.as_str(),
                    run_id = %log.id,
                    error = %err,
                    "sync run failed"
                );
                log.status = SyncStatus::Failed;
                log.finished_at = Some(Utc::now());
                log.error = Some(err.to_string());
                self.store.update_sync_log(&log)?;
                Err(err)
            }
        }
    }

    async fn run_inner(
        &self,
        options: &RunOptions,
        log: &mut SyncLog,
    ) -> Result<(RunSummary, Option<LedgerSummary>), SyncError> {
        let navigator = self.navigator();
        self.ensure_authenticated(&navigator).await?;

        let list_url = self.config.list_url();
        navigator
            .await_content(&list_url, &self.config.selectors.list_container)
            .await?;

        let extractor = ListExtractor::new(
            self.driver,
            &self.config.selectors,
            &self.config.base_url,
            self.config.page_size,
            self.config.timeouts.element(),
            self.config.timeouts.poll_interval(),
        );
        let raw_records = extractor.fetch_all(options.limit).await?;
        log.counts.found = raw_records.len() as u32;

        let mut summary = RunSummary::default();
        for raw in &raw_records {
            let record = self.build_record(raw);
            match self.store.upsert_record(&record)? {
                UpsertOutcome::Created => {
                    summary.created += 1;
                    log.counts.inserted += 1;
                }
                UpsertOutcome::Updated => {
                    summary.updated += 1;
                    log.counts.updated += 1;
                }
                UpsertOutcome::Unchanged => summary.skipped += 1,
            }
        }

        self.backfill_details(&navigator, &raw_records, &mut summary)
            .await?;

        let ledger = if options.process_stock {
            Some(LedgerEngine::new(self.store).apply_pending(Some(self.portal))?)
        } else {
            None
        };

        Ok((summary, ledger))
    }

    /// Lands on the list page with a live session. A login redirect or a
    /// missing session marker triggers the sign-in form, retried with
    /// the portal backoff policy. Login failure is fatal for the run.
    async fn ensure_authenticated(&self, navigator: &Navigator<'_, P>) -> Result<(), SyncError> {
        let list_url = self.config.list_url();
        let need_login = match navigator.navigate(&list_url).await {
            Ok(()) => {
                !self
                    .driver
                    .element_exists(&self.config.selectors.logged_in_marker)
                    .await
                    .unwrap_or(false)
            }
            Err(NavError::SessionExpired { .. }) => true,
            Err(err) => return Err(err.into()),
        };
        if !need_login {
            return Ok(());
        }

        info!(
            target = "stocksync.sync",
            portal = self.portal.as_str(),
            "no active session, signing in"
        );
        retry_with_backoff(self.config.retry.policy(), "portal login", || {
            self.attempt_login(navigator)
        })
        .await
        .map_err(|err| SyncError::LoginFailed {
            portal: self.portal,
            message: err.to_string(),
        })?;

        navigator.navigate(&list_url).await?;
        Ok(())
    }

    async fn attempt_login(&self, navigator: &Navigator<'_, P>) -> Result<(), NavError> {
        let selectors = &self.config.selectors;
        navigator.navigate(&self.config.login_url()).await?;
        self.driver
            .type_into(&selectors.login_username, &self.config.username)
            .await?;
        self.driver
            .type_into(&selectors.login_password, &self.config.password)
            .await?;
        self.driver.click(&selectors.login_submit).await?;
        self.driver
            .wait_for_element(&selectors.logged_in_marker, self.config.timeouts.element())
            .await?;
        Ok(())
    }

    /// Fetches the detail page for every record that still has no line
    /// items. Failures are isolated: log, record the error, move on.
    async fn backfill_details(
        &self,
        navigator: &Navigator<'_, P>,
        raw_records: &[RawRecord],
        summary: &mut RunSummary,
    ) -> Result<(), SyncError> {
        let mut first = true;
        for raw in raw_records {
            let Some(stored) = self.store.get_record(self.portal, &raw.natural_key)? else {
                continue;
            };
            if stored.has_detail() || stored.processed {
                continue;
            }
            let Some(detail_url) = stored.detail_url.as_deref() else {
                continue;
            };

            if !first {
                tokio::time::sleep(DETAIL_FETCH_DELAY).await;
            }
            first = false;

            let mut result = self.fetch_detail(navigator, &stored, detail_url).await;
            if let Err(SyncError::Nav(nav_err)) = &result
                && nav_err.is_retryable()
            {
                // Flaky portals earn one more shot before we give up on
                // the record for this run.
                tokio::time::sleep(DETAIL_FETCH_DELAY).await;
                result = self.fetch_detail(navigator, &stored, detail_url).await;
            }
            if let Err(err) = result {
                warn!(
                    target = "stocksync.sync",
                    portal = self.portal.as_str(),
                    natural_key = %stored.natural_key,
                    error = %err,
                    "detail fetch failed, continuing with next record"
                );
                summary.errors.push(RecordError {
                    natural_key: stored.natural_key.clone(),
                    stage: "detail".to_string(),
                    message: err.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn fetch_detail(
        &self,
        navigator: &Navigator<'_, P>,
        record: &ExternalRecord,
        detail_url: &str,
    ) -> Result<(), SyncError> {
        let detail_selectors = &self.config.selectors.detail;
        navigator.navigate(detail_url).await?;
        navigator
            .await_content(detail_url, &detail_selectors.container)
            .await?;
        let html = self.driver.page_source().await.map_err(NavError::Driver)?;
        let detail = extract::extract_detail(&html, detail_selectors);
        self.store.attach_detail(
            self.portal,
            &record.natural_key,
            &detail.lines,
            detail.total.as_deref(),
        )?;
        Ok(())
    }

    fn build_record(&self, raw: &RawRecord) -> ExternalRecord {
        let mut record = ExternalRecord::new(self.portal, &raw.natural_key);
        record.status = raw
            .status_text
            .as_deref()
            .map(RecordStatus::parse)
            .unwrap_or_default();
        record.record_date = raw.date_text.as_deref().and_then(parse::parse_date);
        record.counterparty = raw.counterparty.clone();
        record.total = raw
            .total_text
            .as_deref()
            .map(parse::parse_currency)
            .unwrap_or_else(|| "0".to_string());
        record.purchase_reference = raw.reference_text.clone();
        record.detail_url = raw.detail_url.clone();
        record.raw_capture = Some(raw.raw.clone());
        record
    }
}

fn summarize_errors(errors: &[RecordError]) -> Option<String> {
    if errors.is_empty() {
        return None;
    }
    let max = crate::config::max_reported_errors();
    let mut parts: Vec<String> = errors
        .iter()
        .take(max)
        .map(|e| format!("{} ({}): {}", e.natural_key, e.stage, e.message))
        .collect();
    if errors.len() > max {
        parts.push(format!("and {} more", errors.len() - max));
    }
    Some(parts.join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockDriver;
    use crate::store::MemoryStore;

    fn portal_config() -> PortalConfig {
        let mut config: PortalConfig = serde_yaml::from_str(
            r##"
base_url: "https://p"
login_path: "/login"
list_path: "/list"
username: "sync-bot"
password: "hunter2"
login_redirect_pattern: "/login"
page_size: 10
timeouts:
  navigation_secs: 1
  element_secs: 1
  content_secs: 1
  settle_strict_ms: 1
  settle_lenient_ms: 1
  poll_interval_ms: 10
retry:
  attempts: 2
  base_delay_ms: 1
  exponential: false
selectors:
  login_username: "#user"
  login_password: "#pass"
  login_submit: "#go"
  logged_in_marker: ".session"
  list_container: "table tbody"
  row: "table tbody tr"
  next_button: "a.next"
  fields:
    number: "td.num"
    status: "td.status"
    date: "td.date"
    counterparty: "td.who"
    total: "td.total"
    reference: ""
    detail_link: "td.num a"
  detail:
    container: ".detail"
    line_rows: ".detail .line"
    line_sku: ".sku"
    line_name: ".name"
    line_quantity: ".qty"
    line_unit_price: ".unit"
    line_total: ".sum"
    total_block: ".totals"
"##,
        )
        .expect("test portal config");
        config.validate("test").expect("valid test config");
        config
    }

    fn list_page(rows: &[&str]) -> String {
        let mut body = String::from("<div class='session'></div><table><tbody>");
        for num in rows {
            body.push_str(&format!(
                "<tr><td class='num'><a href='/detail/{num}'>#{num}</a></td>\
                 <td class='status'>Completed</td><td class='date'>2026-02-01</td>\
                 <td class='who'>Acme</td><td class='total'>$10.00</td></tr>"
            ));
        }
        body.push_str("</tbody></table>");
        body
    }

    fn detail_page(sku: &str, quantity: f64) -> String {
        format!(
            "<div class='detail'><div class='line'>\
             <span class='sku'>{sku}</span><span class='name'>{sku} item</span>\
             <span class='qty'>{quantity}</span><span class='unit'>$5.00</span>\
             <span class='sum'>$5.00</span></div>\
             <div class='totals'>$5.00</div></div>"
        )
    }

    fn login_page() -> &'static str {
        "<form><input id='user'><input id='pass'><button id='go'>Sign in</button></form>"
    }

    #[tokio::test]
    async fn full_run_with_live_session() {
        let config = portal_config();
        let store = MemoryStore::new();
        let driver = MockDriver::new()
            .with_page("https://p/list", &list_page(&["1", "2"]))
            .with_page("https://p/detail/1", &detail_page("SKU-A", 3.0))
            .with_page("https://p/detail/2", &detail_page("SKU-B", 2.0));

        let pipeline = SyncPipeline::new(&driver, &store, Portal::Purchases, &config, "/tmp/shots");
        let outcome = pipeline.run(&RunOptions::default()).await.unwrap();

        assert_eq!(outcome.log.status, SyncStatus::Success);
        assert_eq!(outcome.log.counts.found, 2);
        assert_eq!(outcome.log.counts.inserted, 2);
        assert_eq!(outcome.ledger.unwrap().processed, 2);
        assert_eq!(store.get_inventory("SKU-A").unwrap().unwrap().quantity, 3.0);

        // The browser must have actually visited each detail page, not
        // just polled the list page for the detail container.
        assert_eq!(driver.current_url().await.unwrap(), "https://p/detail/2");
        let stored = store.get_record(Portal::Purchases, "1").unwrap().unwrap();
        assert!(stored.has_detail());
    }

    #[tokio::test]
    async fn missing_session_marker_triggers_login() {
        let config = portal_config();
        let store = MemoryStore::new();
        // List page lacks the session marker until sign-in happens.
        let anon_list = list_page(&["5"]).replace("<div class='session'></div>", "");
        let driver = MockDriver::new()
            .with_page("https://p/list", &anon_list)
            .with_page("https://p/login", login_page())
            .with_click_route("#go", &["<div class='session'>ok</div>"])
            .with_page("https://p/detail/5", &detail_page("SKU-C", 1.0));

        let pipeline = SyncPipeline::new(&driver, &store, Portal::Purchases, &config, "/tmp/shots");
        let outcome = pipeline.run(&RunOptions::default()).await.unwrap();

        assert_eq!(outcome.log.status, SyncStatus::Success);
        let typed = driver.typed_values();
        assert!(typed.contains(&("#user".to_string(), "sync-bot".to_string())));
        assert!(typed.contains(&("#pass".to_string(), "hunter2".to_string())));
    }

    #[tokio::test]
    async fn login_failure_is_fatal_and_logged() {
        let config = portal_config();
        let store = MemoryStore::new();
        // Submit never produces the session marker.
        let driver = MockDriver::new()
            .with_page("https://p/list", "<p>please sign in</p>")
            .with_page("https://p/login", login_page());

        let pipeline = SyncPipeline::new(&driver, &store, Portal::Sales, &config, "/tmp/shots");
        let err = pipeline.run(&RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, SyncError::LoginFailed { .. }));

        let history = store.sync_history(5).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, SyncStatus::Failed);
        assert!(history[0].error.is_some());
    }

    #[tokio::test]
    async fn one_bad_detail_page_yields_partial_not_failed() {
        let config = portal_config();
        let store = MemoryStore::new();
        let driver = MockDriver::new()
            .with_page("https://p/list", &list_page(&["1", "2", "3", "4", "5"]))
            .with_page("https://p/detail/1", &detail_page("SKU-1", 1.0))
            .with_page("https://p/detail/2", &detail_page("SKU-2", 1.0))
            // Detail 3 renders but the content container never appears.
            .with_page("https://p/detail/3", "<p>486 Server Flaked Out</p>")
            .with_page("https://p/detail/4", &detail_page("SKU-4", 1.0))
            .with_page("https://p/detail/5", &detail_page("SKU-5", 1.0));

        let pipeline = SyncPipeline::new(&driver, &store, Portal::Purchases, &config, "/tmp/shots");
        let outcome = pipeline.run(&RunOptions::default()).await.unwrap();

        assert_eq!(outcome.log.status, SyncStatus::Partial);
        assert_eq!(outcome.log.counts.failed, 1);
        assert_eq!(outcome.summary.errors.len(), 1);
        assert_eq!(outcome.summary.errors[0].natural_key, "3");
        // The other four records fully processed into the ledger.
        assert_eq!(outcome.ledger.unwrap().processed, 4);
        assert!(store.get_inventory("SKU-4").unwrap().is_some());
    }

    #[tokio::test]
    async fn process_stock_false_leaves_ledger_untouched() {
        let config = portal_config();
        let store = MemoryStore::new();
        let driver = MockDriver::new()
            .with_page("https://p/list", &list_page(&["7"]))
            .with_page("https://p/detail/7", &detail_page("SKU-7", 2.0));

        let pipeline = SyncPipeline::new(&driver, &store, Portal::Purchases, &config, "/tmp/shots");
        let options = RunOptions {
            process_stock: false,
            ..RunOptions::default()
        };
        let outcome = pipeline.run(&options).await.unwrap();

        assert!(outcome.ledger.is_none());
        assert!(store.get_inventory("SKU-7").unwrap().is_none());
        // The record stays pending with its lines for a later pass.
        let pending = store.pending_records(Some(Portal::Purchases)).unwrap();
        assert_eq!(pending.len(), 1);
    }
}
