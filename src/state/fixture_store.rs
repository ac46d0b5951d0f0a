use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::models::{
    to_u16, AlertContextRow, MatchListingRow, MatchRow, MonitorFlagRow, NotificationRow, OddsRow,
};
use crate::detector::CloseCause;
use crate::error::{AppError, Result};
use crate::types::{
    AlertContext, Fixture, LiveState, Match, MonitorFlag, MonitorState, NotificationRecord,
    OddsSnapshot, Score,
};

const MATCH_COLUMNS: &str = "m.id, m.league_id, m.home_team_id, m.away_team_id, m.kickoff_at, \
                             m.status, m.minute, m.home_score, m.away_score";

/// Aggregate counts for the operator stats endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total_matches: i64,
    pub monitored_matches: i64,
    pub notifications_sent: i64,
    pub closed_matches: i64,
    pub total_leagues: i64,
    pub total_teams: i64,
}

/// Sole owner of persisted state. Writers touch disjoint columns per match:
/// the classifier writes flags, the poller writes live fields, the evaluator
/// writes notifications and closure. Notifications are create-if-absent.
#[derive(Clone)]
pub struct FixtureStore {
    pool: sqlx::SqlitePool,
}

impl FixtureStore {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    // -----------------------------------------------------------------------
    // Fixtures
    // -----------------------------------------------------------------------

    /// Insert league, teams and match if unknown. For a known match only the
    /// live fields are refreshed; identity columns are never rewritten.
    /// Returns true when the match was newly created.
    pub async fn upsert_fixture(&self, fixture: &Fixture, now: DateTime<Utc>) -> Result<bool> {
        let now = now.timestamp();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO leagues (id, name, country, created_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET name = excluded.name, country = excluded.country
            "#,
        )
        .bind(fixture.league.id)
        .bind(&fixture.league.name)
        .bind(&fixture.league.country)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for team in [&fixture.home_team, &fixture.away_team] {
            sqlx::query(
                r#"
                INSERT INTO teams (id, name, created_at) VALUES (?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET name = excluded.name
                "#,
            )
            .bind(team.id)
            .bind(&team.name)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        let m = fixture.to_match();
        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO matches (
                id, league_id, home_team_id, away_team_id, kickoff_at,
                status, minute, home_score, away_score, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(m.id)
        .bind(m.league_id)
        .bind(m.home_team_id)
        .bind(m.away_team_id)
        .bind(m.kickoff_at.timestamp())
        .bind(m.status.as_str())
        .bind(m.minute.map(i64::from))
        .bind(i64::from(m.score.home))
        .bind(i64::from(m.score.away))
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if !inserted {
            write_live_state(&mut *tx, m.id, &fixture.live, now).await?;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn get_match(&self, match_id: i64) -> Result<Option<Match>> {
        let row = sqlx::query_as::<_, MatchRow>(&format!(
            "SELECT {MATCH_COLUMNS} FROM matches m WHERE m.id = ?"
        ))
        .bind(match_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Match::try_from).transpose()
    }

    /// Overwrite status, minute and score with the latest poll.
    pub async fn update_live_state(
        &self,
        match_id: i64,
        live: &LiveState,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        write_live_state(&mut *conn, match_id, live, now.timestamp()).await
    }

    // -----------------------------------------------------------------------
    // Odds + classification
    // -----------------------------------------------------------------------

    /// Scheduled matches with no monitor flag yet that have not kicked off.
    /// Odds fetched after kickoff are not pre-match odds.
    pub async fn matches_awaiting_classification(&self, now: DateTime<Utc>) -> Result<Vec<Match>> {
        let rows = sqlx::query_as::<_, MatchRow>(&format!(
            r#"
            SELECT {MATCH_COLUMNS}
            FROM matches m
            LEFT JOIN monitor_flags f ON f.match_id = m.id
            WHERE m.status = 'scheduled' AND f.match_id IS NULL AND m.kickoff_at > ?
            ORDER BY m.kickoff_at ASC
            "#
        ))
        .bind(now.timestamp())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Match::try_from).collect()
    }

    pub async fn insert_odds(&self, odds: &OddsSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO odds_snapshots (match_id, home_odds, draw_odds, away_odds, captured_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(odds.match_id)
        .bind(odds.home)
        .bind(odds.draw)
        .bind(odds.away)
        .bind(odds.captured_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The earliest stored snapshot. Classification always uses this one.
    pub async fn first_odds(&self, match_id: i64) -> Result<Option<OddsSnapshot>> {
        let row = sqlx::query_as::<_, OddsRow>(
            r#"
            SELECT match_id, home_odds, draw_odds, away_odds, captured_at
            FROM odds_snapshots WHERE match_id = ? ORDER BY id ASC LIMIT 1
            "#,
        )
        .bind(match_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(OddsSnapshot::try_from).transpose()
    }

    /// Write the flag unless one already exists. Returns true when written.
    pub async fn insert_monitor_flag(&self, flag: &MonitorFlag, now: DateTime<Utc>) -> Result<bool> {
        let written = sqlx::query(
            r#"
            INSERT OR IGNORE INTO monitor_flags (match_id, favorite, favorite_odds, should_monitor, classified_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(flag.match_id)
        .bind(flag.favorite.map(|s| s.as_str()))
        .bind(flag.favorite_odds)
        .bind(flag.should_monitor)
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;
        Ok(written)
    }

    pub async fn monitor_flag(&self, match_id: i64) -> Result<Option<MonitorFlag>> {
        let row = self.flag_row(match_id).await?;
        row.as_ref().map(MonitorFlag::try_from).transpose()
    }

    async fn flag_row(&self, match_id: i64) -> Result<Option<MonitorFlagRow>> {
        Ok(sqlx::query_as::<_, MonitorFlagRow>(
            r#"
            SELECT match_id, favorite, favorite_odds, should_monitor, closed_at
            FROM monitor_flags WHERE match_id = ?
            "#,
        )
        .bind(match_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    // -----------------------------------------------------------------------
    // Monitoring
    // -----------------------------------------------------------------------

    /// Matches in `monitoring` that should be polled: not finished and kicked off.
    pub async fn pollable_matches(&self, now: DateTime<Utc>) -> Result<Vec<Match>> {
        let rows = sqlx::query_as::<_, MatchRow>(&format!(
            r#"
            SELECT {MATCH_COLUMNS}
            FROM matches m
            JOIN monitor_flags f ON f.match_id = m.id
            LEFT JOIN notifications n ON n.match_id = m.id
            WHERE f.should_monitor = 1 AND f.closed_at IS NULL AND n.match_id IS NULL
              AND m.status != 'finished' AND m.kickoff_at <= ?
            ORDER BY m.kickoff_at ASC
            "#
        ))
        .bind(now.timestamp())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Match::try_from).collect()
    }

    /// Every match in `monitoring` state with its flag.
    pub async fn monitoring_matches(&self) -> Result<Vec<(Match, MonitorFlag)>> {
        let rows = sqlx::query_as::<_, MatchRow>(&format!(
            r#"
            SELECT {MATCH_COLUMNS}
            FROM matches m
            JOIN monitor_flags f ON f.match_id = m.id
            LEFT JOIN notifications n ON n.match_id = m.id
            WHERE f.should_monitor = 1 AND f.closed_at IS NULL AND n.match_id IS NULL
            ORDER BY m.kickoff_at ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let m = Match::try_from(row)?;
            let flag = self
                .monitor_flag(m.id)
                .await?
                .ok_or_else(|| AppError::Data(format!("match {}: flag vanished", m.id)))?;
            out.push((m, flag));
        }
        Ok(out)
    }

    pub async fn monitor_state(&self, match_id: i64) -> Result<MonitorState> {
        if self.notification(match_id).await?.is_some() {
            return Ok(MonitorState::Fired);
        }
        Ok(match self.flag_row(match_id).await? {
            Some(row) if row.should_monitor && row.closed_at.is_some() => MonitorState::Closed,
            Some(row) if row.should_monitor => MonitorState::Monitoring,
            _ => MonitorState::Unmonitored,
        })
    }

    /// Move a match from `monitoring` to `closed`. No-op if already closed.
    pub async fn close_monitoring(
        &self,
        match_id: i64,
        cause: CloseCause,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let closed = sqlx::query(
            "UPDATE monitor_flags SET closed_at = ?, close_reason = ? WHERE match_id = ? AND closed_at IS NULL",
        )
        .bind(now.timestamp())
        .bind(cause.to_string())
        .bind(match_id)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;
        Ok(closed)
    }

    // -----------------------------------------------------------------------
    // Notifications
    // -----------------------------------------------------------------------

    /// Create the record unless one exists for the match. Returns true when created.
    /// The UNIQUE constraint on `match_id` makes this atomic.
    pub async fn record_notification(&self, record: &NotificationRecord) -> Result<bool> {
        let created = sqlx::query(
            r#"
            INSERT INTO notifications (match_id, message, sent_at) VALUES (?, ?, ?)
            ON CONFLICT(match_id) DO NOTHING
            "#,
        )
        .bind(record.match_id)
        .bind(&record.message)
        .bind(record.sent_at.timestamp())
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;
        Ok(created)
    }

    pub async fn notification(&self, match_id: i64) -> Result<Option<NotificationRecord>> {
        let row = sqlx::query_as::<_, NotificationRow>(
            "SELECT match_id, message, sent_at FROM notifications WHERE match_id = ?",
        )
        .bind(match_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(NotificationRecord::try_from).transpose()
    }

    pub async fn notification_count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM notifications")
            .fetch_one(&self.pool)
            .await?)
    }

    /// Team, league and favorite names for the alert text. None if any is missing.
    pub async fn alert_context(&self, match_id: i64) -> Result<Option<AlertContext>> {
        let row = sqlx::query_as::<_, AlertContextRow>(
            r#"
            SELECT ht.name AS home_team, at.name AS away_team, l.name AS league,
                   f.favorite, f.favorite_odds, m.minute, m.home_score, m.away_score
            FROM matches m
            JOIN teams ht ON ht.id = m.home_team_id
            JOIN teams at ON at.id = m.away_team_id
            JOIN leagues l ON l.id = m.league_id
            JOIN monitor_flags f ON f.match_id = m.id
            WHERE m.id = ?
            "#,
        )
        .bind(match_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(r) = row else { return Ok(None) };
        let (Some(favorite), Some(favorite_odds)) = (r.favorite, r.favorite_odds) else {
            return Ok(None);
        };
        let favorite_team = if favorite == "home" { r.home_team.clone() } else { r.away_team.clone() };

        Ok(Some(AlertContext {
            home_team: r.home_team,
            away_team: r.away_team,
            league: r.league,
            favorite_team,
            favorite_odds,
            minute: r.minute.map(|m| to_u16(m, "minute")).transpose()?.unwrap_or(0),
            score: Score::new(to_u16(r.home_score, "home_score")?, to_u16(r.away_score, "away_score")?),
        }))
    }

    // -----------------------------------------------------------------------
    // Operator queries
    // -----------------------------------------------------------------------

    pub async fn stats(&self) -> Result<StoreStats> {
        let count = |sql: &'static str| {
            let pool = self.pool.clone();
            async move { sqlx::query_scalar::<_, i64>(sql).fetch_one(&pool).await }
        };

        Ok(StoreStats {
            total_matches: count("SELECT COUNT(*) FROM matches").await?,
            monitored_matches: count("SELECT COUNT(*) FROM monitor_flags WHERE should_monitor = 1").await?,
            notifications_sent: count("SELECT COUNT(*) FROM notifications").await?,
            closed_matches: count("SELECT COUNT(*) FROM monitor_flags WHERE closed_at IS NOT NULL").await?,
            total_leagues: count("SELECT COUNT(*) FROM leagues").await?,
            total_teams: count("SELECT COUNT(*) FROM teams").await?,
        })
    }

    pub async fn list_matches(&self, monitored_only: bool, limit: i64) -> Result<Vec<MatchListingRow>> {
        Ok(sqlx::query_as::<_, MatchListingRow>(
            r#"
            SELECT m.id, ht.name AS home_team, at.name AS away_team, l.name AS league,
                   m.status, m.minute, m.home_score, m.away_score,
                   f.favorite, f.favorite_odds, f.should_monitor, f.closed_at,
                   n.sent_at AS notified_at
            FROM matches m
            JOIN teams ht ON ht.id = m.home_team_id
            JOIN teams at ON at.id = m.away_team_id
            JOIN leagues l ON l.id = m.league_id
            LEFT JOIN monitor_flags f ON f.match_id = m.id
            LEFT JOIN notifications n ON n.match_id = m.id
            WHERE (? = 0 OR f.should_monitor = 1)
            ORDER BY m.kickoff_at ASC
            LIMIT ?
            "#,
        )
        .bind(monitored_only)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }
}

async fn write_live_state(
    conn: &mut sqlx::SqliteConnection,
    match_id: i64,
    live: &LiveState,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE matches SET status = ?, minute = ?, home_score = ?, away_score = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(live.status.as_str())
    .bind(live.minute.map(i64::from))
    .bind(i64::from(live.score.home))
    .bind(i64::from(live.score.away))
    .bind(now)
    .bind(match_id)
    .execute(conn)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Single-connection in-memory store with migrations applied.
#[cfg(test)]
pub(crate) async fn memory_store() -> FixtureStore {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None::<std::time::Duration>)
        .max_lifetime(None::<std::time::Duration>)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    FixtureStore::new(pool)
}

#[cfg(test)]
pub(crate) fn test_fixture(id: i64, kickoff_at: DateTime<Utc>) -> Fixture {
    use crate::types::{League, MatchStatus, Team};

    Fixture {
        id,
        league: League {
            id: 39,
            name: "Premier League".to_string(),
            country: "England".to_string(),
        },
        home_team: Team { id: id * 10, name: format!("Home {id}") },
        away_team: Team { id: id * 10 + 1, name: format!("Away {id}") },
        kickoff_at,
        live: LiveState {
            status: MatchStatus::Scheduled,
            minute: None,
            score: Score::default(),
        },
    }
}
