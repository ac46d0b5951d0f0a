//! Periodic drivers for the three monitor cycles.
//!
//! Each job owns its own task and ticker. A slow run never stacks ticks
//! (`MissedTickBehavior::Skip`); a run that overlaps a manual trigger is
//! skipped by the service's own cycle guard.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, NaiveTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{error, info};

use crate::config::Config;
use crate::monitor::MonitorService;

pub struct Scheduler {
    service: Arc<MonitorService>,
    fixture_refresh_hour_utc: u32,
    odds_interval: Duration,
    monitor_interval: Duration,
}

impl Scheduler {
    pub fn new(cfg: &Config, service: Arc<MonitorService>) -> Self {
        Self {
            service,
            fixture_refresh_hour_utc: cfg.fixture_refresh_hour_utc,
            odds_interval: Duration::from_secs(cfg.odds_refresh_interval_secs),
            monitor_interval: Duration::from_secs(cfg.monitor_interval_secs),
        }
    }

    /// Spawn all jobs. The handles run until the process exits.
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        let fixtures = FixtureJob {
            service: Arc::clone(&self.service),
            hour_utc: self.fixture_refresh_hour_utc,
        };
        let odds = OddsJob {
            service: Arc::clone(&self.service),
            every: self.odds_interval,
        };
        let monitor = MonitorJob {
            service: self.service,
            every: self.monitor_interval,
        };
        info!(
            fixture_hour_utc = fixtures.hour_utc,
            odds_secs = odds.every.as_secs(),
            monitor_secs = monitor.every.as_secs(),
            "Scheduler started",
        );
        vec![
            tokio::spawn(fixtures.run()),
            tokio::spawn(odds.run()),
            tokio::spawn(monitor.run()),
        ]
    }
}

struct FixtureJob {
    service: Arc<MonitorService>,
    hour_utc: u32,
}

impl FixtureJob {
    async fn run(self) {
        // Load today's fixtures now; waiting for the daily hour would miss earlier kickoffs.
        self.refresh().await;

        loop {
            let now = Utc::now();
            let next = next_daily_run(now, self.hour_utc);
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            info!("Next fixture refresh at {next}");
            sleep(wait).await;

            self.refresh().await;
        }
    }

    /// Fixture refresh followed by an odds pass over the new matches.
    async fn refresh(&self) {
        let now = Utc::now();
        if let Err(e) = self.service.refresh_fixtures(now.date_naive(), now).await {
            error!("Fixture refresh failed: {e}");
            return;
        }
        if let Err(e) = self.service.refresh_odds(Utc::now()).await {
            error!("Odds refresh after fixture load failed: {e}");
        }
    }
}

struct OddsJob {
    service: Arc<MonitorService>,
    every: Duration,
}

impl OddsJob {
    async fn run(self) {
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(e) = self.service.refresh_odds(Utc::now()).await {
                error!("Odds refresh failed: {e}");
            }
        }
    }
}

struct MonitorJob {
    service: Arc<MonitorService>,
    every: Duration,
}

impl MonitorJob {
    async fn run(self) {
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(e) = self.service.run_monitor_cycle(Utc::now()).await {
                error!("Monitor cycle failed: {e}");
            }
        }
    }
}

/// Next instant strictly after `now` at `hour_utc:00:00`.
fn next_daily_run(now: DateTime<Utc>, hour_utc: u32) -> DateTime<Utc> {
    let at = NaiveTime::from_hms_opt(hour_utc.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        today.checked_add_days(Days::new(1)).unwrap_or(today)
    }
}
