//! Database row types matching `migrations/0001_init.sql`.
//! Converted into domain types at the store boundary.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::types::{Match, MatchStatus, MonitorFlag, NotificationRecord, OddsSnapshot, Score, Side};

#[derive(Debug, sqlx::FromRow)]
pub struct MatchRow {
    pub id: i64,
    pub league_id: i64,
    pub home_team_id: i64,
    pub away_team_id: i64,
    pub kickoff_at: i64,
    pub status: String,
    pub minute: Option<i64>,
    pub home_score: i64,
    pub away_score: i64,
}

impl TryFrom<MatchRow> for Match {
    type Error = AppError;

    fn try_from(r: MatchRow) -> Result<Self> {
        let status = MatchStatus::parse(&r.status)
            .ok_or_else(|| AppError::Data(format!("match {}: unknown status '{}'", r.id, r.status)))?;
        Ok(Match {
            id: r.id,
            league_id: r.league_id,
            home_team_id: r.home_team_id,
            away_team_id: r.away_team_id,
            kickoff_at: from_unix(r.kickoff_at)?,
            status,
            minute: r.minute.map(|m| to_u16(m, "minute")).transpose()?,
            score: Score::new(to_u16(r.home_score, "home_score")?, to_u16(r.away_score, "away_score")?),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct OddsRow {
    pub match_id: i64,
    pub home_odds: f64,
    pub draw_odds: Option<f64>,
    pub away_odds: f64,
    pub captured_at: i64,
}

impl TryFrom<OddsRow> for OddsSnapshot {
    type Error = AppError;

    fn try_from(r: OddsRow) -> Result<Self> {
        Ok(OddsSnapshot {
            match_id: r.match_id,
            home: r.home_odds,
            draw: r.draw_odds,
            away: r.away_odds,
            captured_at: from_unix(r.captured_at)?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct MonitorFlagRow {
    pub match_id: i64,
    pub favorite: Option<String>,
    pub favorite_odds: Option<f64>,
    pub should_monitor: bool,
    pub closed_at: Option<i64>,
}

impl TryFrom<&MonitorFlagRow> for MonitorFlag {
    type Error = AppError;

    fn try_from(r: &MonitorFlagRow) -> Result<Self> {
        let favorite = match r.favorite.as_deref() {
            Some(s) => Some(Side::parse(s).ok_or_else(|| {
                AppError::Data(format!("match {}: unknown favorite side '{s}'", r.match_id))
            })?),
            None => None,
        };
        Ok(MonitorFlag {
            match_id: r.match_id,
            favorite,
            favorite_odds: r.favorite_odds,
            should_monitor: r.should_monitor,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct NotificationRow {
    pub match_id: i64,
    pub message: String,
    pub sent_at: i64,
}

impl TryFrom<NotificationRow> for NotificationRecord {
    type Error = AppError;

    fn try_from(r: NotificationRow) -> Result<Self> {
        Ok(NotificationRecord {
            match_id: r.match_id,
            sent_at: from_unix(r.sent_at)?,
            message: r.message,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct AlertContextRow {
    pub home_team: String,
    pub away_team: String,
    pub league: String,
    pub favorite: Option<String>,
    pub favorite_odds: Option<f64>,
    pub minute: Option<i64>,
    pub home_score: i64,
    pub away_score: i64,
}

/// One row of the operator match listing.
#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct MatchListingRow {
    pub id: i64,
    pub home_team: String,
    pub away_team: String,
    pub league: String,
    pub status: String,
    pub minute: Option<i64>,
    pub home_score: i64,
    pub away_score: i64,
    pub favorite: Option<String>,
    pub favorite_odds: Option<f64>,
    pub should_monitor: Option<bool>,
    pub closed_at: Option<i64>,
    pub notified_at: Option<i64>,
}

pub fn from_unix(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| AppError::Data(format!("timestamp {secs} out of range")))
}

pub fn to_u16(v: i64, field: &str) -> Result<u16> {
    u16::try_from(v).map_err(|_| AppError::Data(format!("{field} {v} out of range")))
}
