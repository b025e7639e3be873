//! Row extraction and pagination over the rendered list pages. The page
//! HTML is pulled once per page and parsed locally; only pagination
//! clicks go back through the driver. Everything here is best-effort at
//! row granularity: a broken row is logged and skipped, never fatal.

use crate::config::{DetailSelectors, SelectorConfig};
use crate::driver::{DriverError, PageDriver};
use crate::models::LineItem;
use crate::navigation::NavError;
use crate::parse;
use crate::retry::poll_until;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A list row reduced to its raw cell text, keyed by the portal number.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub natural_key: String,
    pub status_text: Option<String>,
    pub date_text: Option<String>,
    pub counterparty: Option<String>,
    pub total_text: Option<String>,
    pub reference_text: Option<String>,
    pub detail_url: Option<String>,
    /// Full row text, kept on the record for diagnostics.
    pub raw: String,
}

fn sel(css: &str) -> Option<Selector> {
    match Selector::parse(css) {
        Ok(selector) => Some(selector),
        Err(err) => {
            // Config validation makes this unreachable in practice.
            warn!(target = "stocksync.extract", css, error = %err, "unparseable selector");
            None
        }
    }
}

fn text_in(row: &ElementRef<'_>, css: &str) -> Option<String> {
    let selector = sel(css)?;
    row.select(&selector)
        .next()
        .map(|el| el.text().collect::<Vec<_>>().join(" ").trim().to_string())
        .filter(|text| !text.is_empty())
}

fn href_in(row: &ElementRef<'_>, css: &str) -> Option<String> {
    let selector = sel(css)?;
    row.select(&selector)
        .next()
        .and_then(|el| el.value().attr("href"))
        .map(|href| href.to_string())
}

/// Parses every row on one page. Rows without a usable natural key are
/// skipped; the natural key is tried first against the dedicated cell,
/// then against the whole row text with the fallback digit patterns.
pub fn extract_rows(html: &str, selectors: &SelectorConfig, base_url: &str) -> Vec<RawRecord> {
    let document = Html::parse_document(html);
    let Some(row_selector) = sel(&selectors.row) else {
        return Vec::new();
    };

    let mut records = Vec::new();
    for (index, row) in document.select(&row_selector).enumerate() {
        let row_text = row.text().collect::<Vec<_>>().join(" ").trim().to_string();
        let key_source = text_in(&row, &selectors.fields.number).unwrap_or_else(|| row_text.clone());
        let Some(natural_key) = parse::extract_natural_key(&key_source) else {
            debug!(
                target = "stocksync.extract",
                row = index,
                "row skipped: no natural key in `{key_source}`"
            );
            continue;
        };

        let detail_url = href_in(&row, &selectors.fields.detail_link)
            .map(|href| absolutize(base_url, &href));

        records.push(RawRecord {
            natural_key,
            status_text: text_in(&row, &selectors.fields.status),
            date_text: text_in(&row, &selectors.fields.date),
            counterparty: text_in(&row, &selectors.fields.counterparty),
            total_text: text_in(&row, &selectors.fields.total),
            reference_text: if selectors.fields.reference.trim().is_empty() {
                None
            } else {
                text_in(&row, &selectors.fields.reference)
            },
            detail_url,
            raw: row_text,
        });
    }
    records
}

fn absolutize(base_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else {
        format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            href.trim_start_matches('/')
        )
    }
}

/// Line items and the grand total pulled from a detail page.
#[derive(Debug, Clone, Default)]
pub struct DetailData {
    pub lines: Vec<LineItem>,
    pub total: Option<String>,
}

/// Parses a detail page into line items. Zero-quantity lines are kept
/// here (the ledger filters them) but lines without any name or sku text
/// are dropped as rendering artifacts.
pub fn extract_detail(html: &str, selectors: &DetailSelectors) -> DetailData {
    let document = Html::parse_document(html);
    let Some(line_selector) = sel(&selectors.line_rows) else {
        return DetailData::default();
    };

    let mut lines = Vec::new();
    for row in document.select(&line_selector) {
        let sku_text = text_in(&row, &selectors.line_sku).unwrap_or_default();
        let name = text_in(&row, &selectors.line_name).unwrap_or_default();
        if sku_text.is_empty() && name.is_empty() {
            continue;
        }
        let quantity = parse::parse_quantity(&text_in(&row, &selectors.line_quantity).unwrap_or_default());
        lines.push(LineItem {
            sku: parse::normalize_sku(&sku_text, &name),
            name,
            quantity,
            unit_price: parse::parse_currency(
                &text_in(&row, &selectors.line_unit_price).unwrap_or_default(),
            ),
            line_total: parse::parse_currency(
                &text_in(&row, &selectors.line_total).unwrap_or_default(),
            ),
        });
    }

    let total = sel(&selectors.total_block)
        .and_then(|selector| {
            document
                .select(&selector)
                .next()
                .map(|el| el.text().collect::<Vec<_>>().join(" "))
        })
        .map(|text| parse::parse_currency(&text))
        .filter(|total| total != "0");

    DetailData { lines, total }
}

/// Pagination engine. Walks pages until the budget is spent, the portal
/// runs out of rows, or the pagination control stops making progress.
pub struct ListExtractor<'a, P: PageDriver> {
    driver: &'a P,
    selectors: &'a SelectorConfig,
    base_url: &'a str,
    page_size: usize,
    advance_timeout: Duration,
    poll_interval: Duration,
}

impl<'a, P: PageDriver> ListExtractor<'a, P> {
    pub fn new(
        driver: &'a P,
        selectors: &'a SelectorConfig,
        base_url: &'a str,
        page_size: usize,
        advance_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            driver,
            selectors,
            base_url,
            page_size: page_size.max(1),
            advance_timeout,
            poll_interval,
        }
    }

    /// Collects records across pages, de-duplicated by natural key. The
    /// caller must already have navigated to the first list page and
    /// waited for the results container.
    pub async fn fetch_all(&self, limit: Option<usize>) -> Result<Vec<RawRecord>, NavError> {
        let page_budget = match limit {
            Some(limit) => limit.div_ceil(self.page_size).max(1),
            None => usize::MAX,
        };
        let mut seen: HashSet<String> = HashSet::new();
        let mut records: Vec<RawRecord> = Vec::new();

        for page_index in 0..page_budget {
            let html = self.driver.page_source().await.map_err(NavError::Driver)?;
            let rows = extract_rows(&html, self.selectors, self.base_url);

            if rows.is_empty() {
                // Valid terminal state: an empty first page means zero
                // records; an empty later page means end-of-data.
                debug!(
                    target = "stocksync.extract",
                    page = page_index,
                    "empty page, stopping"
                );
                break;
            }

            let fingerprint = rows[0].raw.clone();
            let mut new_keys = 0usize;
            for row in rows {
                if seen.insert(row.natural_key.clone()) {
                    records.push(row);
                    new_keys += 1;
                }
            }

            if new_keys == 0 {
                // The portal is re-serving rows we already hold; more
                // clicking cannot make progress.
                info!(
                    target = "stocksync.extract",
                    page = page_index,
                    "page yielded no new keys, stopping pagination"
                );
                break;
            }

            if let Some(limit) = limit
                && records.len() >= limit
            {
                records.truncate(limit);
                break;
            }

            if page_index + 1 >= page_budget {
                break;
            }

            if !self.advance(&fingerprint).await? {
                break;
            }
        }

        Ok(records)
    }

    /// Clicks "next" and waits for the first-row fingerprint to change.
    /// Returns false when there is no next control or the control turned
    /// out to be a no-op (stuck pagination is treated as end-of-data, not
    /// an error; the fingerprint is a heuristic and the de-dup set above
    /// is the real correctness guard).
    async fn advance(&self, fingerprint: &str) -> Result<bool, NavError> {
        match self.driver.element_exists(&self.selectors.next_button).await {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(err) => return Err(NavError::Driver(err)),
        }

        match self.driver.click(&self.selectors.next_button).await {
            Ok(()) => {}
            Err(DriverError::ElementNotFound { .. }) => return Ok(false),
            Err(err) => return Err(NavError::Driver(err)),
        }

        let changed = poll_until(self.poll_interval, self.advance_timeout, |_| async move {
            match self.driver.page_source().await {
                Ok(html) => {
                    let rows = extract_rows(&html, self.selectors, self.base_url);
                    match rows.first() {
                        Some(first) if first.raw != fingerprint => Some(()),
                        None => Some(()),
                        _ => None,
                    }
                }
                Err(_) => None,
            }
        })
        .await;

        if changed.is_none() {
            warn!(
                target = "stocksync.extract",
                "first row unchanged after next-click, pagination stuck; stopping"
            );
        }
        Ok(changed.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockDriver;

    fn selectors() -> SelectorConfig {
        serde_yaml::from_str(
            r##"
login_username: "#u"
login_password: "#p"
login_submit: "#s"
logged_in_marker: "#m"
list_container: "table tbody"
row: "table tbody tr"
next_button: "a.next"
fields:
  number: "td.num"
  status: "td.status"
  date: "td.date"
  counterparty: "td.who"
  total: "td.total"
  reference: "td.ref"
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
        .expect("test selectors")
    }

    fn page(rows: &[(&str, &str, &str)], with_next: bool) -> String {
        let mut body = String::from("<table><tbody>");
        for (num, status, total) in rows {
            body.push_str(&format!(
                "<tr><td class='num'><a href='/detail/{num}'>Order ID: #{num}</a></td>\
                 <td class='status'>{status}</td><td class='date'>2026-01-10</td>\
                 <td class='who'>Acme</td><td class='total'>{total}</td></tr>"
            ));
        }
        body.push_str("</tbody></table>");
        if with_next {
            body.push_str("<a class='next' href='#'>next</a>");
        }
        body
    }

    fn extractor<'a>(driver: &'a MockDriver, selectors: &'a SelectorConfig) -> ListExtractor<'a, MockDriver> {
        ListExtractor::new(
            driver,
            selectors,
            "https://p",
            2,
            Duration::from_millis(50),
            Duration::from_millis(5),
        )
    }

    async fn land(driver: &MockDriver, url: &str) {
        use crate::driver::{CompletionSignal, PageDriver};
        driver
            .goto(url, CompletionSignal::Committed, Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[test]
    fn rows_parse_fields_and_detail_link() {
        let selectors = selectors();
        let html = page(&[("101", "Shipped", "$1,234.56")], false);
        let rows = extract_rows(&html, &selectors, "https://p");
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.natural_key, "101");
        assert_eq!(row.status_text.as_deref(), Some("Shipped"));
        assert_eq!(row.total_text.as_deref(), Some("$1,234.56"));
        assert_eq!(row.detail_url.as_deref(), Some("https://p/detail/101"));
    }

    #[test]
    fn row_without_key_is_skipped() {
        let selectors = selectors();
        let html = "<table><tbody>\
            <tr><td class='num'>draft</td><td class='status'>Pending</td></tr>\
            <tr><td class='num'>#77</td><td class='status'>Pending</td></tr>\
            </tbody></table>";
        let rows = extract_rows(html, &selectors, "https://p");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].natural_key, "77");
    }

    #[test]
    fn detail_lines_parse_and_normalize() {
        let selectors = selectors();
        let html = "<div class='detail'>\
            <div class='line'><span class='sku'>ab-1</span><span class='name'>Widget</span>\
            <span class='qty'>3 pcs</span><span class='unit'>$2.50</span><span class='sum'>$7.50</span></div>\
            <div class='line'><span class='sku'></span><span class='name'></span></div>\
            <div class='totals'>Total: $7.50</div></div>";
        let detail = extract_detail(html, &selectors.detail);
        assert_eq!(detail.lines.len(), 1);
        assert_eq!(detail.lines[0].sku, "AB-1");
        assert_eq!(detail.lines[0].quantity, 3.0);
        assert_eq!(detail.lines[0].unit_price, "2.50");
        assert_eq!(detail.total.as_deref(), Some("7.50"));
    }

    #[tokio::test]
    async fn empty_first_page_yields_zero_records() {
        let selectors = selectors();
        let driver = MockDriver::new().with_page("https://p/list", &page(&[], false));
        land(&driver, "https://p/list").await;
        let records = extractor(&driver, &selectors).fetch_all(None).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn paginates_until_next_disappears() {
        let selectors = selectors();
        let page1 = page(&[("1", "Pending", "$1"), ("2", "Pending", "$2")], true);
        let page2 = page(&[("3", "Pending", "$3")], false);
        let driver = MockDriver::new()
            .with_page("https://p/list", &page1)
            .with_click_route("a.next", &[&page2]);
        land(&driver, "https://p/list").await;
        let records = extractor(&driver, &selectors).fetch_all(None).await.unwrap();
        let keys: Vec<_> = records.iter().map(|r| r.natural_key.as_str()).collect();
        assert_eq!(keys, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn stuck_next_terminates_bounded() {
        let selectors = selectors();
        // The next control exists but clicking never changes the page.
        let page1 = page(&[("1", "Pending", "$1"), ("2", "Pending", "$2")], true);
        let driver = MockDriver::new().with_page("https://p/list", &page1);
        land(&driver, "https://p/list").await;
        let records = extractor(&driver, &selectors).fetch_all(None).await.unwrap();
        assert_eq!(records.len(), 2);
        // One click attempted, then the frozen fingerprint stops us.
        assert_eq!(driver.click_log().len(), 1);
    }

    #[tokio::test]
    async fn duplicated_page_rows_are_deduplicated() {
        // Flaky next: page 2 re-serves record 2 alongside record 3.
        let selectors = selectors();
        let page1 = page(&[("1", "Pending", "$1"), ("2", "Pending", "$2")], true);
        let page2 = page(&[("2", "Pending", "$2"), ("3", "Pending", "$3")], false);
        let driver = MockDriver::new()
            .with_page("https://p/list", &page1)
            .with_click_route("a.next", &[&page2]);
        land(&driver, "https://p/list").await;
        let records = extractor(&driver, &selectors).fetch_all(None).await.unwrap();
        let keys: Vec<_> = records.iter().map(|r| r.natural_key.as_str()).collect();
        assert_eq!(keys, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn page_of_only_known_keys_stops_extraction() {
        let selectors = selectors();
        let page1 = page(&[("1", "Pending", "$1"), ("2", "Pending", "$2")], true);
        // Different first row ordering defeats the fingerprint guard, but
        // zero new keys still stops the walk.
        let page2 = page(&[("2", "Pending", "$2"), ("1", "Pending", "$1")], true);
        let driver = MockDriver::new()
            .with_page("https://p/list", &page1)
            .with_click_route("a.next", &[&page2, &page2, &page2]);
        land(&driver, "https://p/list").await;
        let records = extractor(&driver, &selectors).fetch_all(None).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(driver.click_log().len(), 1);
    }

    #[tokio::test]
    async fn limit_translates_to_page_budget() {
        let selectors = selectors();
        let page1 = page(&[("1", "Pending", "$1"), ("2", "Pending", "$2")], true);
        let driver = MockDriver::new().with_page("https://p/list", &page1);
        land(&driver, "https://p/list").await;
        let records = extractor(&driver, &selectors)
            .fetch_all(Some(1))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        // Budget of one page: no pagination click at all.
        assert!(driver.click_log().is_empty());
    }
}
