//! Navigation with layered completion signals. The portals never report
//! readiness consistently: sometimes `load` fires, sometimes only the DOM
//! settles, and on bad days the only signal is that the connection was
//! accepted. Each attempt gets its own timeout and its own settle period,
//! and content readiness is always verified by polling for the container
//! rather than trusting the navigation signal.

use crate::config::TimeoutConfig;
use crate::driver::{CompletionSignal, DriverError, PageDriver};
use crate::retry::poll_until;
use chrono::Utc;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum NavError {
    #[error("session expired: {url} bounced to the login form")]
    SessionExpired { url: String },
    #[error("navigation to {url} failed on every signal (last: {last_signal})")]
    NavigationTimeout { url: String, last_signal: String },
    #[error("content `{container}` never appeared on {url} within {waited_secs}s")]
    ContentTimeout {
        url: String,
        container: String,
        waited_secs: u64,
    },
    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl NavError {
    /// Whether the caller should retry with backoff. Session expiry is
    /// retryable too, but only after re-authenticating.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NavError::SessionExpired { .. }
                | NavError::NavigationTimeout { .. }
                | NavError::ContentTimeout { .. }
        )
    }
}

/// One entry in the ordered attempt plan.
struct Attempt {
    signal: CompletionSignal,
    timeout: Duration,
    settle: Duration,
}

pub struct Navigator<'a, P: PageDriver> {
    driver: &'a P,
    timeouts: &'a TimeoutConfig,
    login_redirect_pattern: &'a str,
    screenshot_dir: PathBuf,
    portal_label: &'a str,
}

impl<'a, P: PageDriver> Navigator<'a, P> {
    pub fn new(
        driver: &'a P,
        timeouts: &'a TimeoutConfig,
        login_redirect_pattern: &'a str,
        screenshot_dir: impl Into<PathBuf>,
        portal_label: &'a str,
    ) -> Self {
        Self {
            driver,
            timeouts,
            login_redirect_pattern,
            screenshot_dir: screenshot_dir.into(),
            portal_label,
        }
    }

    fn attempt_plan(&self) -> Vec<Attempt> {
        let strict_settle = Duration::from_millis(self.timeouts.settle_strict_ms);
        let lenient_settle = Duration::from_millis(self.timeouts.settle_lenient_ms);
        vec![
            Attempt {
                signal: CompletionSignal::FullLoad,
                timeout: self.timeouts.navigation(),
                settle: strict_settle,
            },
            Attempt {
                signal: CompletionSignal::DomReady,
                timeout: self.timeouts.navigation(),
                settle: strict_settle,
            },
            Attempt {
                signal: CompletionSignal::Committed,
                timeout: self.timeouts.navigation() / 2,
                settle: lenient_settle,
            },
        ]
    }

    /// Navigates to `url`, trying each completion signal in order of
    /// decreasing strictness, then a last-resort fire-and-settle pass.
    /// A landing URL matching the login pattern fails fast with
    /// [`NavError::SessionExpired`] so callers do not burn the content
    /// budget on a dead session.
    pub async fn navigate(&self, url: &str) -> Result<(), NavError> {
        let mut last_signal = "none";
        for attempt in self.attempt_plan() {
            match self.driver.goto(url, attempt.signal, attempt.timeout).await {
                Ok(()) => {
                    debug!(
                        target = "stocksync.nav",
                        portal = self.portal_label,
                        url,
                        signal = attempt.signal.label(),
                        settle_ms = attempt.settle.as_millis() as u64,
                        "navigation signal satisfied"
                    );
                    tokio::time::sleep(attempt.settle).await;
                    self.check_session(url).await?;
                    return Ok(());
                }
                Err(err) => {
                    last_signal = attempt.signal.label();
                    warn!(
                        target = "stocksync.nav",
                        portal = self.portal_label,
                        url,
                        signal = last_signal,
                        error = %err,
                        "navigation attempt failed, falling back"
                    );
                }
            }
        }

        // Last resort: navigate without any completion wait, then give the
        // page a fixed grace period before judging the result.
        info!(
            target = "stocksync.nav",
            portal = self.portal_label,
            url,
            "all signals failed, firing blind navigation"
        );
        let _ = self
            .driver
            .goto(url, CompletionSignal::Committed, self.timeouts.navigation())
            .await;
        tokio::time::sleep(Duration::from_millis(self.timeouts.settle_lenient_ms)).await;

        match self.driver.current_url().await {
            Ok(_) => {
                self.check_session(url).await?;
                Ok(())
            }
            Err(_) => Err(NavError::NavigationTimeout {
                url: url.to_string(),
                last_signal: last_signal.to_string(),
            }),
        }
    }

    /// Polls for the content container after navigation. The table is
    /// rendered client-side with wildly variable latency, so navigation
    /// completion means nothing here; only the container's presence does.
    /// Diagnostic screenshots are captured periodically so a timeout can
    /// be diagnosed without re-running the sync.
    pub async fn await_content(&self, url: &str, container: &str) -> Result<(), NavError> {
        let interval = self.timeouts.poll_interval();
        let total = self.timeouts.content();
        let snapshot_every = 5u32;

        let found = poll_until(interval, total, |attempt| async move {
            if attempt > 0 && attempt % snapshot_every == 0 {
                self.capture_snapshot(attempt).await;
            }
            match self.driver.element_exists(container).await {
                Ok(true) => Some(()),
                _ => None,
            }
        })
        .await;

        match found {
            Some(()) => Ok(()),
            None => {
                self.capture_snapshot(u32::MAX).await;
                Err(NavError::ContentTimeout {
                    url: url.to_string(),
                    container: container.to_string(),
                    waited_secs: total.as_secs(),
                })
            }
        }
    }

    async fn check_session(&self, requested: &str) -> Result<(), NavError> {
        let landed = self.driver.current_url().await?;
        if !self.login_redirect_pattern.is_empty()
            && landed.contains(self.login_redirect_pattern)
            && !requested.contains(self.login_redirect_pattern)
        {
            return Err(NavError::SessionExpired {
                url: requested.to_string(),
            });
        }
        Ok(())
    }

    async fn capture_snapshot(&self, attempt: u32) {
        let Ok(bytes) = self.driver.screenshot().await else {
            return;
        };
        if bytes.is_empty() {
            return;
        }
        if let Err(err) = std::fs::create_dir_all(&self.screenshot_dir) {
            warn!(target = "stocksync.nav", error = %err, "screenshot dir unavailable");
            return;
        }
        let name = format!(
            "{}-{}-poll{}.png",
            self.portal_label,
            Utc::now().format("%Y%m%dT%H%M%S"),
            attempt
        );
        let path = self.screenshot_dir.join(name);
        match tokio::fs::write(&path, bytes).await {
            Ok(()) => debug!(
                target = "stocksync.nav",
                path = %path.display(),
                "diagnostic snapshot captured"
            ),
            Err(err) => warn!(target = "stocksync.nav", error = %err, "snapshot write failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockDriver;

    fn fast_timeouts() -> TimeoutConfig {
        TimeoutConfig {
            navigation_secs: 1,
            element_secs: 1,
            content_secs: 1,
            settle_strict_ms: 1,
            settle_lenient_ms: 1,
            poll_interval_ms: 10,
        }
    }

    fn navigator<'a>(driver: &'a MockDriver, timeouts: &'a TimeoutConfig) -> Navigator<'a, MockDriver> {
        Navigator::new(driver, timeouts, "/login", "/tmp/stocksync-test-shots", "test")
    }

    #[tokio::test]
    async fn navigate_succeeds_on_first_signal() {
        let driver = MockDriver::new().with_page("https://p/orders", "<div id='x'></div>");
        let timeouts = fast_timeouts();
        let nav = navigator(&driver, &timeouts);
        nav.navigate("https://p/orders").await.expect("navigate");
        assert_eq!(driver.goto_count(), 1);
    }

    #[tokio::test]
    async fn navigate_detects_login_redirect() {
        let driver = MockDriver::new()
            .with_page("https://p/login?next=orders", "<form></form>")
            .with_redirect("https://p/orders", "https://p/login?next=orders");
        let timeouts = fast_timeouts();
        let nav = navigator(&driver, &timeouts);
        let err = nav.navigate("https://p/orders").await.unwrap_err();
        assert!(matches!(err, NavError::SessionExpired { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn navigate_falls_back_to_blind_attempt() {
        // Every scripted goto fails, but the blind pass still lands and
        // the current URL is readable afterwards.
        let driver = MockDriver::new().failing_goto("https://p/orders");
        let timeouts = fast_timeouts();
        let nav = navigator(&driver, &timeouts);
        // Four attempts fire: three signals plus the blind one.
        let result = nav.navigate("https://p/orders").await;
        assert_eq!(driver.goto_count(), 4);
        // current_url still answers (empty), so blind navigation passes.
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn await_content_finds_container() {
        let driver =
            MockDriver::new().with_page("https://p/orders", "<table class='po'><tbody></tbody></table>");
        let timeouts = fast_timeouts();
        let nav = navigator(&driver, &timeouts);
        nav.navigate("https://p/orders").await.unwrap();
        nav.await_content("https://p/orders", "table.po tbody")
            .await
            .expect("container present");
    }

    #[tokio::test]
    async fn await_content_times_out_bounded() {
        let driver = MockDriver::new().with_page("https://p/orders", "<p>still loading</p>");
        let timeouts = fast_timeouts();
        let nav = navigator(&driver, &timeouts);
        nav.navigate("https://p/orders").await.unwrap();
        let err = nav
            .await_content("https://p/orders", ".results")
            .await
            .unwrap_err();
        assert!(matches!(err, NavError::ContentTimeout { .. }));
    }
}
