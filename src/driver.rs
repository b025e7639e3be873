//! Thin capability layer over the browser session. Navigation strategies
//! and the list extractor are generic over [`PageDriver`] so they can run
//! against a scripted mock in tests; the production implementation wraps a
//! fantoccini WebDriver client.

use crate::retry::poll_until;
use fantoccini::{Client, ClientBuilder, Locator};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("webdriver endpoint unreachable at {url}: {detail}")]
    Unreachable { url: String, detail: String },
    #[error("element `{css}` not found")]
    ElementNotFound { css: String },
    #[error("timed out waiting for {what} after {waited_ms}ms")]
    Timeout { what: String, waited_ms: u64 },
    #[error("webdriver command failed: {0}")]
    Command(String),
}

/// How strictly a navigation waits before being considered complete.
/// Ordered from strictest to most lenient; lenient signals need a longer
/// settle period afterwards because client-side rendering may not have
/// started when they fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionSignal {
    /// `document.readyState == "complete"`.
    FullLoad,
    /// `document.readyState` at least `interactive`.
    DomReady,
    /// The navigation request was accepted; nothing about rendering.
    Committed,
}

impl CompletionSignal {
    pub fn label(&self) -> &'static str {
        match self {
            CompletionSignal::FullLoad => "full-load",
            CompletionSignal::DomReady => "dom-ready",
            CompletionSignal::Committed => "committed",
        }
    }
}

pub trait PageDriver: Send + Sync {
    fn goto(
        &self,
        url: &str,
        signal: CompletionSignal,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), DriverError>> + Send;
    fn current_url(&self) -> impl Future<Output = Result<String, DriverError>> + Send;
    fn page_source(&self) -> impl Future<Output = Result<String, DriverError>> + Send;
    fn click(&self, css: &str) -> impl Future<Output = Result<(), DriverError>> + Send;
    fn type_into(
        &self,
        css: &str,
        text: &str,
    ) -> impl Future<Output = Result<(), DriverError>> + Send;
    fn wait_for_element(
        &self,
        css: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), DriverError>> + Send;
    fn element_exists(&self, css: &str) -> impl Future<Output = Result<bool, DriverError>> + Send;
    fn text_of(&self, css: &str) -> impl Future<Output = Result<String, DriverError>> + Send;
    fn screenshot(&self) -> impl Future<Output = Result<Vec<u8>, DriverError>> + Send;
}

use std::future::Future;

/// Short-fuse HTTP client for the WebDriver `/status` probe. Tunable via
/// `WEBDRIVER_STATUS_TIMEOUT_SECS` and `WEBDRIVER_STATUS_CONNECT_TIMEOUT_SECS`.
fn preflight_client() -> reqwest::Client {
    let timeout = std::env::var("WEBDRIVER_STATUS_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(10);
    let connect = std::env::var("WEBDRIVER_STATUS_CONNECT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(5);
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Production driver over a fantoccini WebDriver session (geckodriver or
/// chromedriver listening on `WEBDRIVER_URL`).
pub struct WebDriverPage {
    client: Client,
}

impl WebDriverPage {
    /// Checks the WebDriver `/status` endpoint first so a dead driver
    /// process fails with a clear message instead of a connect hang.
    pub async fn connect(webdriver_url: &str) -> Result<Self, DriverError> {
        let status_url = format!("{}/status", webdriver_url.trim_end_matches('/'));
        preflight_client()
            .get(&status_url)
            .send()
            .await
            .map_err(|err| DriverError::Unreachable {
                url: webdriver_url.to_string(),
                detail: err.to_string(),
            })?;

        let client = ClientBuilder::native()
            .connect(webdriver_url)
            .await
            .map_err(|err| DriverError::Unreachable {
                url: webdriver_url.to_string(),
                detail: err.to_string(),
            })?;
        Ok(Self { client })
    }

    pub async fn close(self) {
        if let Err(err) = self.client.close().await {
            warn!(target = "stocksync.driver", error = %err, "browser session close failed");
        }
    }

    async fn ready_state(&self) -> Result<String, DriverError> {
        let value = self
            .client
            .execute("return document.readyState", vec![])
            .await
            .map_err(|err| DriverError::Command(err.to_string()))?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn await_ready_state(
        &self,
        signal: CompletionSignal,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        let reached = poll_until(Duration::from_millis(250), timeout, |_| async move {
            match self.ready_state().await {
                Ok(state) => {
                    let ok = match signal {
                        CompletionSignal::FullLoad => state == "complete",
                        CompletionSignal::DomReady => {
                            state == "interactive" || state == "complete"
                        }
                        CompletionSignal::Committed => true,
                    };
                    ok.then_some(())
                }
                Err(_) => None,
            }
        })
        .await;
        reached.ok_or_else(|| DriverError::Timeout {
            what: format!("readyState for {}", signal.label()),
            waited_ms: timeout.as_millis() as u64,
        })
    }
}

impl PageDriver for WebDriverPage {
    async fn goto(
        &self,
        url: &str,
        signal: CompletionSignal,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        debug!(target = "stocksync.driver", url, signal = signal.label(), "navigating");
        tokio::time::timeout(timeout, self.client.goto(url))
            .await
            .map_err(|_| DriverError::Timeout {
                what: format!("navigation to {url}"),
                waited_ms: timeout.as_millis() as u64,
            })?
            .map_err(|err| DriverError::Command(err.to_string()))?;
        if signal != CompletionSignal::Committed {
            self.await_ready_state(signal, timeout).await?;
        }
        Ok(())
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        self.client
            .current_url()
            .await
            .map(|url| url.to_string())
            .map_err(|err| DriverError::Command(err.to_string()))
    }

    async fn page_source(&self) -> Result<String, DriverError> {
        self.client
            .source()
            .await
            .map_err(|err| DriverError::Command(err.to_string()))
    }

    async fn click(&self, css: &str) -> Result<(), DriverError> {
        let element = self
            .client
            .find(Locator::Css(css))
            .await
            .map_err(|_| DriverError::ElementNotFound {
                css: css.to_string(),
            })?;
        element
            .click()
            .await
            .map_err(|err| DriverError::Command(err.to_string()))
    }

    async fn type_into(&self, css: &str, text: &str) -> Result<(), DriverError> {
        let element = self
            .client
            .find(Locator::Css(css))
            .await
            .map_err(|_| DriverError::ElementNotFound {
                css: css.to_string(),
            })?;
        element
            .clear()
            .await
            .map_err(|err| DriverError::Command(err.to_string()))?;
        element
            .send_keys(text)
            .await
            .map_err(|err| DriverError::Command(err.to_string()))
    }

    async fn wait_for_element(&self, css: &str, timeout: Duration) -> Result<(), DriverError> {
        self.client
            .wait()
            .at_most(timeout)
            .for_element(Locator::Css(css))
            .await
            .map(|_| ())
            .map_err(|_| DriverError::Timeout {
                what: format!("element `{css}`"),
                waited_ms: timeout.as_millis() as u64,
            })
    }

    async fn element_exists(&self, css: &str) -> Result<bool, DriverError> {
        Ok(self.client.find(Locator::Css(css)).await.is_ok())
    }

    async fn text_of(&self, css: &str) -> Result<String, DriverError> {
        let element = self
            .client
            .find(Locator::Css(css))
            .await
            .map_err(|_| DriverError::ElementNotFound {
                css: css.to_string(),
            })?;
        element
            .text()
            .await
            .map_err(|err| DriverError::Command(err.to_string()))
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        self.client
            .screenshot()
            .await
            .map_err(|err| DriverError::Command(err.to_string()))
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockDriver;
    use super::{CompletionSignal, PageDriver};
    use std::time::Duration;

    #[tokio::test]
    async fn mock_serves_and_rewrites_pages() {
        let driver = MockDriver::new().with_page("https://a", "<p id='x'>hello</p>");
        driver
            .goto("https://a", CompletionSignal::FullLoad, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(driver.current_url().await.unwrap(), "https://a");
        assert_eq!(driver.text_of("#x").await.unwrap(), "hello");
        assert!(!driver.element_exists("#y").await.unwrap());

        driver.set_page("https://a", "<p id='x'>changed</p>");
        assert_eq!(driver.text_of("#x").await.unwrap(), "changed");
    }
}
