//! Cron-driven sync runs. The schedule and timezone are validated at
//! startup so a typo fails the boot, not the 3am fire. One advisory
//! lock covers scheduled and operator-triggered runs alike: while a
//! sync is in flight, a cron tick is skipped with a log line and a
//! run-now request is rejected.

use crate::config::{HostConfig, PortalsConfig};
use crate::driver::{DriverError, WebDriverPage};
use crate::models::{Portal, RunOptions, SyncLog};
use crate::store::Store;
use crate::sync::{SyncError, SyncPipeline};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid cron expression `{expression}`: {message}")]
    InvalidCron { expression: String, message: String },
    #[error("unknown timezone `{0}`")]
    InvalidTimezone(String),
    #[error("a sync run is already in progress")]
    AlreadyRunning,
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Accepts both 5-field crontab syntax and the 6-field form with
/// seconds; 5-field input gets a `0` seconds column prepended.
pub fn normalize_cron(expression: &str) -> String {
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}

pub fn parse_schedule(expression: &str, timezone: &str) -> Result<(Schedule, Tz), SchedulerError> {
    let schedule = Schedule::from_str(&normalize_cron(expression)).map_err(|err| {
        SchedulerError::InvalidCron {
            expression: expression.to_string(),
            message: err.to_string(),
        }
    })?;
    let tz: Tz = timezone
        .parse()
        .map_err(|_| SchedulerError::InvalidTimezone(timezone.to_string()))?;
    Ok((schedule, tz))
}

/// Next fire instant strictly after `now`, computed in the portal
/// operator's timezone and returned in UTC.
pub fn next_fire(schedule: &Schedule, tz: Tz, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule
        .after(&now.with_timezone(&tz))
        .next()
        .map(|local| local.with_timezone(&Utc))
}

/// Owns everything a run needs plus the mutual-exclusion guard. Shared
/// as an `Arc` between the cron loop and the HTTP handlers.
pub struct SchedulerContext {
    host: HostConfig,
    portals: PortalsConfig,
    store: Arc<dyn Store>,
    busy: Mutex<()>,
    enabled: AtomicBool,
    stopped: Notify,
}

impl SchedulerContext {
    pub fn new(host: HostConfig, portals: PortalsConfig, store: Arc<dyn Store>) -> Self {
        Self {
            host,
            portals,
            store,
            busy: Mutex::new(()),
            enabled: AtomicBool::new(true),
            stopped: Notify::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Claims the run lock without waiting. `None` means a run is
    /// already in flight.
    pub fn try_begin(&self) -> Option<MutexGuard<'_, ()>> {
        self.busy.try_lock().ok()
    }

    /// Operator-triggered run. Fails fast instead of queueing behind an
    /// in-flight run.
    pub async fn run_now(&self, options: RunOptions) -> Result<Vec<SyncLog>, SchedulerError> {
        let _guard = self.try_begin().ok_or(SchedulerError::AlreadyRunning)?;
        self.run_all(&options).await
    }

    /// Blocks future scheduled fires and wakes the cron loop out of its
    /// sleep so the task exits now, not at the next fire. An in-flight
    /// run finishes on its own; nothing is interrupted mid-record.
    pub fn stop(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        // notify_one stores a permit, so a stop issued before the loop
        // reaches its next select is not lost.
        self.stopped.notify_one();
        info!(target = "stocksync.scheduler", "scheduler stopped");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Both portals, serially, a fresh browser session each. A portal
    /// failing does not stop the other portal's run.
    async fn run_all(&self, options: &RunOptions) -> Result<Vec<SyncLog>, SchedulerError> {
        let mut logs = Vec::new();
        for portal in [Portal::Purchases, Portal::Sales] {
            match self.run_portal(portal, options).await {
                Ok(log) => logs.push(log),
                Err(err) => {
                    error!(
                        target = "stocksync.scheduler",
                        portal = portal.as_str(),
                        error = %err,
                        "portal sync failed"
                    );
                }
            }
        }
        Ok(logs)
    }

    async fn run_portal(
        &self,
        portal: Portal,
        options: &RunOptions,
    ) -> Result<SyncLog, SchedulerError> {
        let driver = WebDriverPage::connect(&self.host.webdriver_url).await?;
        let pipeline = SyncPipeline::new(
            &driver,
            self.store.as_ref(),
            portal,
            self.portals.for_portal(portal),
            &self.host.screenshot_dir,
        );
        let result = pipeline.run(options).await;
        driver.close().await;
        let outcome = result?;
        info!(
            target = "stocksync.scheduler",
            portal = portal.as_str(),
            created = outcome.summary.created,
            updated = outcome.summary.updated,
            skipped = outcome.summary.skipped,
            errors = outcome.summary.errors.len(),
            "portal sync complete"
        );
        if let Some(ledger) = &outcome.ledger {
            info!(
                target = "stocksync.scheduler",
                portal = portal.as_str(),
                processed = ledger.processed,
                skipped = ledger.skipped,
                errors = ledger.errors,
                "stock levels updated"
            );
        }
        Ok(outcome.log)
    }

    /// Spawns the cron loop. The schedule must have been validated with
    /// [`parse_schedule`] before boot got this far; failure here only
    /// ends the loop.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let (schedule, tz) =
                match parse_schedule(&self.host.cron_expression, &self.host.timezone) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        error!(target = "stocksync.scheduler", error = %err, "schedule unusable");
                        return;
                    }
                };
            info!(
                target = "stocksync.scheduler",
                cron = %self.host.cron_expression,
                timezone = %self.host.timezone,
                "scheduler started"
            );

            while self.is_enabled() {
                let now = Utc::now();
                let Some(next) = next_fire(&schedule, tz, now) else {
                    warn!(target = "stocksync.scheduler", "schedule has no future fires");
                    return;
                };
                let wait = (next - now).to_std().unwrap_or_default();
                info!(
                    target = "stocksync.scheduler",
                    next = %next,
                    "sleeping until next fire"
                );
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = self.stopped.notified() => return,
                }
                if !self.is_enabled() {
                    return;
                }

                match self.try_begin() {
                    Some(_guard) => {
                        if let Err(err) = self.run_all(&RunOptions::default()).await {
                            error!(target = "stocksync.scheduler", error = %err, "scheduled run failed");
                        }
                    }
                    None => {
                        warn!(
                            target = "stocksync.scheduler",
                            "previous run still in progress, skipping this fire"
                        );
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn context() -> SchedulerContext {
        let host = HostConfig::from_env();
        let portals: PortalsConfig =
            serde_yaml::from_str(include_str!("../portals.yaml")).expect("bundled portals config");
        SchedulerContext::new(host, portals, Arc::new(MemoryStore::new()))
    }

    #[test]
    fn five_field_cron_gets_a_seconds_column() {
        assert_eq!(normalize_cron("0 */4 * * *"), "0 0 */4 * * *");
        assert_eq!(normalize_cron("0 0 3 * * *"), "0 0 3 * * *");
    }

    #[test]
    fn schedule_validation_rejects_garbage() {
        assert!(parse_schedule("0 */4 * * *", "UTC").is_ok());
        assert!(parse_schedule("0 3 * * *", "America/New_York").is_ok());
        assert!(matches!(
            parse_schedule("not a cron", "UTC"),
            Err(SchedulerError::InvalidCron { .. })
        ));
        assert!(matches!(
            parse_schedule("0 */4 * * *", "Mars/Olympus_Mons"),
            Err(SchedulerError::InvalidTimezone(_))
        ));
    }

    #[test]
    fn next_fire_respects_the_timezone() {
        let (schedule, tz) = parse_schedule("0 3 * * *", "America/New_York").unwrap();
        // 2026-01-15 12:00 UTC is 07:00 in New York; the next 03:00
        // local fire is the following morning, 08:00 UTC (EST, UTC-5).
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();
        let next = next_fire(&schedule, tz, now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 16, 8, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn guard_admits_one_run_at_a_time() {
        let ctx = context();
        let guard = ctx.try_begin().expect("lock free");
        assert!(ctx.try_begin().is_none());

        let err = ctx.run_now(RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyRunning));

        drop(guard);
        assert!(ctx.try_begin().is_some());
    }

    #[tokio::test]
    async fn stop_blocks_future_fires() {
        let ctx = Arc::new(context());
        assert!(ctx.is_enabled());
        ctx.stop();
        assert!(!ctx.is_enabled());
        // The loop observes the flag and exits before its next fire.
        let handle = ctx.clone().spawn();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn stop_wakes_the_sleeping_loop() {
        let ctx = Arc::new(context());
        let handle = ctx.clone().spawn();
        // Default cron fires every four hours, so the loop is asleep by
        // now. A stop must end the task immediately, not at the fire.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        ctx.stop();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("loop exited on stop")
            .unwrap();
    }
}
