use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, Result};

pub const API_FOOTBALL_BASE_URL: &str = "https://v3.football.api-sports.io";
pub const TELEGRAM_API_URL: &str = "https://api.telegram.org";

/// Favorite odds must be strictly below this to be monitored.
pub const DEFAULT_FAVORITE_ODDS_THRESHOLD: f64 = 1.35;

/// Inclusive minute range in which the losing condition is checked.
pub const DEFAULT_WINDOW_START: u16 = 55;
pub const DEFAULT_WINDOW_END: u16 = 62;

/// Bet365 on API-Football.
pub const DEFAULT_BOOKMAKER_ID: u32 = 8;

/// Hour (UTC) of the daily fixture refresh.
pub const FIXTURE_REFRESH_HOUR_UTC: u32 = 8;

/// Odds refresh interval (seconds). Only matches without a flag are queried.
pub const ODDS_REFRESH_INTERVAL_SECS: u64 = 7_200;

/// Live poll + evaluate interval (seconds).
pub const MONITOR_INTERVAL_SECS: u64 = 60;

/// A monitor cycle abandons remaining matches after this long; they resume next tick.
pub const MONITOR_CYCLE_DEADLINE_SECS: u64 = 50;

/// Upper bound on any single odds fetch, live poll or notification send.
pub const EXTERNAL_CALL_TIMEOUT_SECS: u64 = 10;

/// Maximum live polls in flight within one cycle.
pub const POLL_CONCURRENCY: usize = 4;

/// Row cap for the operator match listing.
pub const MATCH_LISTING_LIMIT: i64 = 50;

/// Decision-relevant settings. Built from `Config` in production and directly in tests.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub favorite_odds_threshold: f64,
    pub window_start: u16,
    pub window_end: u16,
    /// Empty = every league the source returns.
    pub leagues: Vec<i64>,
    pub cycle_deadline: Duration,
    pub call_timeout: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            favorite_odds_threshold: DEFAULT_FAVORITE_ODDS_THRESHOLD,
            window_start: DEFAULT_WINDOW_START,
            window_end: DEFAULT_WINDOW_END,
            leagues: Vec::new(),
            cycle_deadline: Duration::from_secs(MONITOR_CYCLE_DEADLINE_SECS),
            call_timeout: Duration::from_secs(EXTERNAL_CALL_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    pub api_football_key: String,
    pub api_football_base_url: String,
    pub bookmaker_id: u32,
    pub telegram_bot_token: String,
    pub telegram_chat_id: String,
    pub fixture_refresh_hour_utc: u32,
    pub odds_refresh_interval_secs: u64,
    pub monitor_interval_secs: u64,
    pub monitor: MonitorSettings,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let threshold: f64 = parse_var("FAVORITE_ODDS_THRESHOLD", DEFAULT_FAVORITE_ODDS_THRESHOLD)?;
        let window_start: u16 = parse_var("MONITOR_MINUTE_START", DEFAULT_WINDOW_START)?;
        let window_end: u16 = parse_var("MONITOR_MINUTE_END", DEFAULT_WINDOW_END)?;

        let leagues = std::env::var("LEAGUES_TO_MONITOR")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<i64>().map_err(|_| {
                    AppError::Config(format!("LEAGUES_TO_MONITOR: '{s}' is not a league id"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let cfg = Self {
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "alerts.db".to_string()),
            api_port: parse_var("API_PORT", 8000u16)?,
            api_football_key: required_var("API_FOOTBALL_KEY")?,
            api_football_base_url: std::env::var("API_FOOTBALL_BASE_URL")
                .unwrap_or_else(|_| API_FOOTBALL_BASE_URL.to_string()),
            bookmaker_id: parse_var("ODDS_BOOKMAKER_ID", DEFAULT_BOOKMAKER_ID)?,
            telegram_bot_token: required_var("TELEGRAM_BOT_TOKEN")?,
            telegram_chat_id: required_var("TELEGRAM_CHAT_ID")?,
            fixture_refresh_hour_utc: parse_var("FIXTURE_REFRESH_HOUR_UTC", FIXTURE_REFRESH_HOUR_UTC)?,
            odds_refresh_interval_secs: parse_var("ODDS_REFRESH_INTERVAL_SECS", ODDS_REFRESH_INTERVAL_SECS)?,
            monitor_interval_secs: parse_var("MONITOR_INTERVAL_SECS", MONITOR_INTERVAL_SECS)?,
            monitor: MonitorSettings {
                favorite_odds_threshold: threshold,
                window_start,
                window_end,
                leagues,
                cycle_deadline: Duration::from_secs(parse_var(
                    "MONITOR_CYCLE_DEADLINE_SECS",
                    MONITOR_CYCLE_DEADLINE_SECS,
                )?),
                call_timeout: Duration::from_secs(parse_var(
                    "EXTERNAL_CALL_TIMEOUT_SECS",
                    EXTERNAL_CALL_TIMEOUT_SECS,
                )?),
            },
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let m = &self.monitor;
        if !m.favorite_odds_threshold.is_finite() || m.favorite_odds_threshold <= 1.0 {
            return Err(AppError::Config(
                "FAVORITE_ODDS_THRESHOLD must be a decimal odd greater than 1.0".to_string(),
            ));
        }
        if m.window_start > m.window_end {
            return Err(AppError::Config(format!(
                "MONITOR_MINUTE_START ({}) must not exceed MONITOR_MINUTE_END ({})",
                m.window_start, m.window_end
            )));
        }
        if self.fixture_refresh_hour_utc > 23 {
            return Err(AppError::Config("FIXTURE_REFRESH_HOUR_UTC must be 0-23".to_string()));
        }
        if self.odds_refresh_interval_secs == 0 || self.monitor_interval_secs == 0 {
            return Err(AppError::Config("refresh intervals must be non-zero".to_string()));
        }
        if m.cycle_deadline.is_zero() || m.call_timeout.is_zero() {
            return Err(AppError::Config("deadlines and timeouts must be non-zero".to_string()));
        }
        Ok(())
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::Config(format!("{name} must be set")))
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("{name}: cannot parse '{raw}'"))),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            log_level: "info".to_string(),
            db_path: ":memory:".to_string(),
            api_port: 8000,
            api_football_key: "key".to_string(),
            api_football_base_url: API_FOOTBALL_BASE_URL.to_string(),
            bookmaker_id: DEFAULT_BOOKMAKER_ID,
            telegram_bot_token: "token".to_string(),
            telegram_chat_id: "chat".to_string(),
            fixture_refresh_hour_utc: FIXTURE_REFRESH_HOUR_UTC,
            odds_refresh_interval_secs: ODDS_REFRESH_INTERVAL_SECS,
            monitor_interval_secs: MONITOR_INTERVAL_SECS,
            monitor: MonitorSettings::default(),
        }
    }

    #[test]
    fn defaults_validate() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn threshold_at_or_below_evens_is_rejected() {
        let mut cfg = config();
        cfg.monitor.favorite_odds_threshold = 1.0;
        assert!(matches!(cfg.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn inverted_window_is_rejected() {
        let mut cfg = config();
        cfg.monitor.window_start = 70;
        cfg.monitor.window_end = 60;
        assert!(matches!(cfg.validate(), Err(AppError::Config(_))));
    }
}
