use crate::models::Portal;
use scraper::Selector;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read portal config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid portal config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("portal `{portal}`: {problem}")]
    Invalid { portal: String, problem: String },
}

/// Runtime knobs for the host process, all environment-supplied.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub webdriver_url: String,
    pub database_path: String,
    pub port: u16,
    pub cron_expression: String,
    pub timezone: String,
    pub scheduler_enabled: bool,
    pub screenshot_dir: String,
}

impl HostConfig {
    pub fn from_env() -> Self {
        Self {
            webdriver_url: env_string("WEBDRIVER_URL", "http://localhost:4444"),
            database_path: env_string("DATABASE_PATH", "./stocksync.db"),
            port: env_parse("PORT", 8000),
            cron_expression: env_string("SYNC_CRON", "0 */4 * * *"),
            timezone: env_string("SYNC_TIMEZONE", "UTC"),
            scheduler_enabled: env_bool("SCHEDULER_ENABLED"),
            screenshot_dir: env_string("SCREENSHOT_DIR", "./screenshots"),
        }
    }
}

/// Selector maps and timing budgets for both portals, loaded from YAML at
/// startup and validated so a missing selector fails the boot instead of
/// surfacing as a silent extraction miss.
#[derive(Debug, Clone, Deserialize)]
pub struct PortalsConfig {
    pub purchases: PortalConfig,
    pub sales: PortalConfig,
}

impl PortalsConfig {
    /// Loads from `PORTALS_CONFIG` if set, otherwise the bundled defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config: PortalsConfig = match std::env::var("PORTALS_CONFIG") {
            Ok(path) => {
                let text = std::fs::read_to_string(&path)
                    .map_err(|source| ConfigError::Read { path, source })?;
                serde_yaml::from_str(&text)?
            }
            Err(_) => serde_yaml::from_str(include_str!("../portals.yaml"))?,
        };
        config.purchases.apply_env_credentials("PURCHASES");
        config.sales.apply_env_credentials("SALES");
        config.purchases.validate("purchases")?;
        config.sales.validate("sales")?;
        Ok(config)
    }

    pub fn for_portal(&self, portal: Portal) -> &PortalConfig {
        match portal {
            Portal::Purchases => &self.purchases,
            Portal::Sales => &self.sales,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortalConfig {
    pub base_url: String,
    pub login_path: String,
    pub list_path: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// URL substring that marks a bounce back to the login form.
    pub login_redirect_pattern: String,
    pub page_size: usize,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub selectors: SelectorConfig,
}

impl PortalConfig {
    fn apply_env_credentials(&mut self, prefix: &str) {
        if let Ok(user) = std::env::var(format!("{prefix}_USERNAME")) {
            self.username = user;
        }
        if let Ok(pass) = std::env::var(format!("{prefix}_PASSWORD")) {
            self.password = pass;
        }
    }

    pub fn validate(&self, portal: &str) -> Result<(), ConfigError> {
        let invalid = |problem: String| ConfigError::Invalid {
            portal: portal.to_string(),
            problem,
        };
        reqwest::Url::parse(&self.base_url)
            .map_err(|err| invalid(format!("base_url `{}`: {err}", self.base_url)))?;
        if self.page_size == 0 {
            return Err(invalid("page_size must be at least 1".into()));
        }
        for (name, css) in self.selectors.all() {
            if css.trim().is_empty() {
                return Err(invalid(format!("selector `{name}` is empty")));
            }
            Selector::parse(css)
                .map_err(|err| invalid(format!("selector `{name}` (`{css}`): {err}")))?;
        }
        Ok(())
    }

    pub fn login_url(&self) -> String {
        join_url(&self.base_url, &self.login_path)
    }

    pub fn list_url(&self) -> String {
        join_url(&self.base_url, &self.list_path)
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub navigation_secs: u64,
    pub element_secs: u64,
    pub content_secs: u64,
    /// Settle time after a strict completion signal.
    pub settle_strict_ms: u64,
    /// Settle time after a lenient signal, where client-side rendering
    /// may not even have started yet.
    pub settle_lenient_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            navigation_secs: 30,
            element_secs: 10,
            content_secs: 180,
            settle_strict_ms: 500,
            settle_lenient_ms: 5_000,
            poll_interval_ms: 2_000,
        }
    }
}

impl TimeoutConfig {
    pub fn navigation(&self) -> Duration {
        Duration::from_secs(self.navigation_secs)
    }

    pub fn element(&self) -> Duration {
        Duration::from_secs(self.element_secs)
    }

    pub fn content(&self) -> Duration {
        Duration::from_secs(self.content_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub exponential: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 1_000,
            exponential: true,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> crate::retry::BackoffPolicy {
        crate::retry::BackoffPolicy {
            attempts: self.attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            exponential: self.exponential,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectorConfig {
    pub login_username: String,
    pub login_password: String,
    pub login_submit: String,
    /// Element that only exists once a session is established.
    pub logged_in_marker: String,
    pub list_container: String,
    pub row: String,
    pub next_button: String,
    pub fields: FieldSelectors,
    pub detail: DetailSelectors,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldSelectors {
    pub number: String,
    pub status: String,
    pub date: String,
    pub counterparty: String,
    pub total: String,
    #[serde(default)]
    pub reference: String,
    pub detail_link: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetailSelectors {
    pub container: String,
    pub line_rows: String,
    pub line_sku: String,
    pub line_name: String,
    pub line_quantity: String,
    pub line_unit_price: String,
    pub line_total: String,
    pub total_block: String,
}

impl SelectorConfig {
    fn all(&self) -> Vec<(&'static str, &str)> {
        let mut entries = vec![
            ("login_username", self.login_username.as_str()),
            ("login_password", self.login_password.as_str()),
            ("login_submit", self.login_submit.as_str()),
            ("logged_in_marker", self.logged_in_marker.as_str()),
            ("list_container", self.list_container.as_str()),
            ("row", self.row.as_str()),
            ("next_button", self.next_button.as_str()),
            ("fields.number", self.fields.number.as_str()),
            ("fields.status", self.fields.status.as_str()),
            ("fields.date", self.fields.date.as_str()),
            ("fields.counterparty", self.fields.counterparty.as_str()),
            ("fields.total", self.fields.total.as_str()),
            ("fields.detail_link", self.fields.detail_link.as_str()),
            ("detail.container", self.detail.container.as_str()),
            ("detail.line_rows", self.detail.line_rows.as_str()),
            ("detail.line_sku", self.detail.line_sku.as_str()),
            ("detail.line_name", self.detail.line_name.as_str()),
            ("detail.line_quantity", self.detail.line_quantity.as_str()),
            ("detail.line_unit_price", self.detail.line_unit_price.as_str()),
            ("detail.line_total", self.detail.line_total.as_str()),
            ("detail.total_block", self.detail.total_block.as_str()),
        ];
        // `fields.reference` may legitimately be absent on the sales portal.
        if !self.reference_is_blank() {
            entries.push(("fields.reference", self.fields.reference.as_str()));
        }
        entries
    }

    fn reference_is_blank(&self) -> bool {
        self.fields.reference.trim().is_empty()
    }
}

/// Cap on how many per-record errors a run summary spells out.
pub fn max_reported_errors() -> usize {
    env_parse("MAX_REPORTED_ERRORS", 10)
}

fn env_string(key: &str, fallback: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| fallback.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(fallback)
}

fn env_bool(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_defaults_parse_and_validate() {
        let mut config: PortalsConfig =
            serde_yaml::from_str(include_str!("../portals.yaml")).expect("bundled yaml");
        config.purchases.username = "u".into();
        config.purchases.password = "p".into();
        config.purchases.validate("purchases").expect("purchases valid");
        config.sales.validate("sales").expect("sales valid");
    }

    #[test]
    fn empty_selector_is_a_startup_error() {
        let mut config: PortalsConfig =
            serde_yaml::from_str(include_str!("../portals.yaml")).unwrap();
        config.sales.selectors.row = String::new();
        let err = config.sales.validate("sales").unwrap_err();
        assert!(err.to_string().contains("row"));
    }

    #[test]
    fn malformed_selector_is_a_startup_error() {
        let mut config: PortalsConfig =
            serde_yaml::from_str(include_str!("../portals.yaml")).unwrap();
        config.purchases.selectors.fields.total = ":::not-css".into();
        assert!(config.purchases.validate("purchases").is_err());
    }

    #[test]
    fn zero_page_size_rejected() {
        let mut config: PortalsConfig =
            serde_yaml::from_str(include_str!("../portals.yaml")).unwrap();
        config.purchases.page_size = 0;
        assert!(config.purchases.validate("purchases").is_err());
    }

    #[test]
    fn urls_join_without_double_slash() {
        let config: PortalsConfig =
            serde_yaml::from_str(include_str!("../portals.yaml")).unwrap();
        let url = config.purchases.list_url();
        assert!(!url.contains("com//"));
        assert!(url.starts_with(config.purchases.base_url.trim_end_matches('/')));
    }
}
