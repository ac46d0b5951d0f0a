use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::types::{Fixture, League, LiveState, Match, MatchStatus, OddsSnapshot, Score, Team};

/// Odds, fixtures and live state. Implementations must report network and
/// rate-limit failures as `TransientFetch` and malformed payloads as `Data`.
#[async_trait]
pub trait FootballSource: Send + Sync {
    /// All fixtures on `date`; restricted to `leagues` unless it is empty.
    async fn fetch_fixtures(&self, date: NaiveDate, leagues: &[i64]) -> Result<Vec<Fixture>>;

    /// Pre-match 1X2 odds, or None when the bookmaker has not priced the match yet.
    async fn fetch_odds(&self, m: &Match, captured_at: DateTime<Utc>) -> Result<Option<OddsSnapshot>>;

    async fn fetch_live_state(&self, m: &Match) -> Result<LiveState>;

    /// Account plan and request quota. Doubles as a connectivity check.
    async fn fetch_status(&self) -> Result<SourceStatus>;
}

/// Request quota as reported by the source for the current day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceStatus {
    pub plan: Option<String>,
    pub requests_used: u64,
    pub requests_limit: u64,
    pub requests_available: u64,
    pub percentage_used: f64,
    pub quota_exhausted: bool,
}

impl SourceStatus {
    pub fn new(plan: Option<String>, requests_used: u64, requests_limit: u64) -> Self {
        let percentage_used = if requests_limit > 0 {
            (requests_used as f64 / requests_limit as f64 * 1000.0).round() / 10.0
        } else {
            0.0
        };
        Self {
            plan,
            requests_used,
            requests_limit,
            requests_available: requests_limit.saturating_sub(requests_used),
            percentage_used,
            quota_exhausted: requests_used >= requests_limit,
        }
    }
}

/// API-Football v3 REST client.
pub struct ApiFootballClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    bookmaker_id: u32,
}

impl ApiFootballClient {
    pub fn new(cfg: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.monitor.call_timeout.max(Duration::from_secs(1)))
            .build()?;
        Ok(Self {
            client,
            base_url: cfg.api_football_base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_football_key.clone(),
            bookmaker_id: cfg.bookmaker_id,
        })
    }

    /// GET `{base}/{path}` and return the `response` array.
    async fn get_response(&self, path: &str, query: &[(&str, String)]) -> Result<Vec<serde_json::Value>> {
        let body = self.get_body(path, query).await?;
        match body.get("response").and_then(|r| r.as_array()) {
            Some(items) => Ok(items.clone()),
            None => Err(AppError::Data(format!("GET /{path}: response was not an array"))),
        }
    }

    async fn get_body(&self, path: &str, query: &[(&str, String)]) -> Result<serde_json::Value> {
        let url = format!("{}/{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .header("x-apisports-key", &self.api_key)
            .query(query)
            .send()
            .await
            .map_err(|e| AppError::TransientFetch(format!("GET /{path}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AppError::TransientFetch(format!("GET /{path}: HTTP {status}")));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AppError::TransientFetch(format!("GET /{path}: unreadable body: {e}")))?;
        check_api_errors(&body)?;
        Ok(body)
    }
}

#[async_trait]
impl FootballSource for ApiFootballClient {
    async fn fetch_fixtures(&self, date: NaiveDate, leagues: &[i64]) -> Result<Vec<Fixture>> {
        let items = self
            .get_response("fixtures", &[("date", date.format("%Y-%m-%d").to_string())])
            .await?;
        let total = items.len();

        let mut fixtures = Vec::with_capacity(total);
        let mut rejected = 0usize;
        for item in &items {
            match parse_fixture(item) {
                Ok(f) if leagues.is_empty() || leagues.contains(&f.league.id) => fixtures.push(f),
                Ok(_) => {}
                Err(e) => {
                    rejected += 1;
                    debug!("Skipping fixture: {e}");
                }
            }
        }

        info!(
            date = %date,
            total,
            kept = fixtures.len(),
            rejected,
            "Fetched fixtures for {date}: {} kept of {total}",
            fixtures.len(),
        );
        Ok(fixtures)
    }

    async fn fetch_odds(&self, m: &Match, captured_at: DateTime<Utc>) -> Result<Option<OddsSnapshot>> {
        let items = self
            .get_response(
                "odds",
                &[
                    ("fixture", m.id.to_string()),
                    ("bookmaker", self.bookmaker_id.to_string()),
                ],
            )
            .await?;
        match items.first() {
            Some(item) => parse_odds(m.id, item, captured_at),
            None => Ok(None),
        }
    }

    async fn fetch_live_state(&self, m: &Match) -> Result<LiveState> {
        let items = self.get_response("fixtures", &[("id", m.id.to_string())]).await?;
        let item = items
            .first()
            .ok_or_else(|| AppError::TransientFetch(format!("fixture {} not returned", m.id)))?;
        parse_live_state(item)
    }

    async fn fetch_status(&self) -> Result<SourceStatus> {
        let body = self.get_body("status", &[]).await?;
        parse_status(&body)
    }
}

/// API-Football reports quota and auth problems in an `errors` field with HTTP 200.
/// The field is `[]` when clean and an object when not.
fn check_api_errors(body: &serde_json::Value) -> Result<()> {
    let errors = match body.get("errors") {
        Some(serde_json::Value::Object(map)) if !map.is_empty() => body["errors"].to_string(),
        Some(serde_json::Value::Array(list)) if !list.is_empty() => body["errors"].to_string(),
        _ => return Ok(()),
    };
    Err(AppError::TransientFetch(format!("API-Football rejected request: {errors}")))
}

/// Parse the `/status` body. `response` is an object here, not an array.
pub fn parse_status(body: &serde_json::Value) -> Result<SourceStatus> {
    let response = body
        .get("response")
        .filter(|r| r.is_object())
        .ok_or_else(|| AppError::Data("status response missing".to_string()))?;
    let requests = response.get("requests");
    let count = |key: &str| requests.and_then(|r| r.get(key)).and_then(|n| n.as_u64());

    let used = count("current").unwrap_or(0);
    let limit = count("limit_day")
        .ok_or_else(|| AppError::Data("status: requests.limit_day missing".to_string()))?;
    let plan = str_field(response.get("subscription"), "plan")
        .or_else(|| str_field(response.get("account"), "plan"));

    Ok(SourceStatus::new(plan, used, limit))
}

/// Parse one element of the `/fixtures` response.
pub fn parse_fixture(v: &serde_json::Value) -> Result<Fixture> {
    let fixture = v
        .get("fixture")
        .ok_or_else(|| AppError::Data("fixture object missing".to_string()))?;
    let id = fixture
        .get("id")
        .and_then(|i| i.as_i64())
        .ok_or_else(|| AppError::Data("fixture.id missing".to_string()))?;

    let kickoff_at = fixture
        .get("timestamp")
        .and_then(|t| t.as_i64())
        .and_then(|t| DateTime::from_timestamp(t, 0))
        .or_else(|| {
            fixture
                .get("date")
                .and_then(|d| d.as_str())
                .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
                .map(|d| d.with_timezone(&Utc))
        })
        .ok_or_else(|| AppError::Data(format!("fixture {id}: kickoff time missing")))?;

    let league = v.get("league");
    let league = League {
        id: league
            .and_then(|l| l.get("id"))
            .and_then(|i| i.as_i64())
            .ok_or_else(|| AppError::Data(format!("fixture {id}: league.id missing")))?,
        name: str_field(league, "name").unwrap_or_else(|| "Unknown".to_string()),
        country: str_field(league, "country").unwrap_or_default(),
    };

    let home_team = parse_team(v, "home", id)?;
    let away_team = parse_team(v, "away", id)?;
    let live = parse_live_state(v)?;

    Ok(Fixture { league, home_team, away_team, kickoff_at, id, live })
}

fn parse_team(v: &serde_json::Value, side: &str, fixture_id: i64) -> Result<Team> {
    let team = v.get("teams").and_then(|t| t.get(side));
    let id = team
        .and_then(|t| t.get("id"))
        .and_then(|i| i.as_i64())
        .ok_or_else(|| AppError::Data(format!("fixture {fixture_id}: teams.{side}.id missing")))?;
    Ok(Team {
        id,
        name: str_field(team, "name").unwrap_or_else(|| format!("Team {id}")),
    })
}

fn str_field(v: Option<&serde_json::Value>, key: &str) -> Option<String> {
    v.and_then(|o| o.get(key))
        .and_then(|s| s.as_str())
        .map(|s| s.to_string())
}

/// Status, elapsed minute and goals from a `/fixtures` element.
/// Null goals (not kicked off) count as zero.
pub fn parse_live_state(v: &serde_json::Value) -> Result<LiveState> {
    let status_obj = v.get("fixture").and_then(|f| f.get("status"));
    let code = status_obj
        .and_then(|s| s.get("short"))
        .and_then(|s| s.as_str())
        .unwrap_or("NS");
    let status = MatchStatus::from_short_code(code)
        .ok_or_else(|| AppError::Data(format!("unknown fixture status '{code}'")))?;

    let minute = match status_obj.and_then(|s| s.get("elapsed")) {
        None | Some(serde_json::Value::Null) => None,
        Some(e) => Some(json_u16(e, "elapsed")?),
    };

    let goals = v.get("goals");
    let goal = |side: &str| -> Result<u16> {
        match goals.and_then(|g| g.get(side)) {
            None | Some(serde_json::Value::Null) => Ok(0),
            Some(n) => json_u16(n, side),
        }
    };

    Ok(LiveState {
        status,
        minute,
        score: Score::new(goal("home")?, goal("away")?),
    })
}

fn json_u16(v: &serde_json::Value, field: &str) -> Result<u16> {
    v.as_u64()
        .and_then(|n| u16::try_from(n).ok())
        .ok_or_else(|| AppError::Data(format!("{field} is not a non-negative integer: {v}")))
}

/// Extract the "Match Winner" bet of the first bookmaker in an `/odds` element.
/// Returns None when the market is not priced yet.
pub fn parse_odds(
    match_id: i64,
    v: &serde_json::Value,
    captured_at: DateTime<Utc>,
) -> Result<Option<OddsSnapshot>> {
    let Some(bets) = v
        .get("bookmakers")
        .and_then(|b| b.as_array())
        .and_then(|b| b.first())
        .and_then(|b| b.get("bets"))
        .and_then(|b| b.as_array())
    else {
        return Ok(None);
    };

    let Some(values) = bets
        .iter()
        .find(|b| b.get("name").and_then(|n| n.as_str()) == Some("Match Winner"))
        .and_then(|b| b.get("values"))
        .and_then(|v| v.as_array())
    else {
        return Ok(None);
    };

    let price = |label: &str| -> Result<Option<f64>> {
        let Some(odd) = values
            .iter()
            .find(|x| x.get("value").and_then(|l| l.as_str()) == Some(label))
            .and_then(|x| x.get("odd"))
        else {
            return Ok(None);
        };
        odd.as_f64()
            .or_else(|| odd.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
            .map(Some)
            .ok_or_else(|| AppError::Data(format!("match {match_id}: {label} odd unparsable: {odd}")))
    };

    let (Some(home), Some(away)) = (price("Home")?, price("Away")?) else {
        return Ok(None);
    };

    Ok(Some(OddsSnapshot {
        match_id,
        home,
        draw: price("Draw")?,
        away,
        captured_at,
    }))
}
