use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Match
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    Scheduled,
    Live,
    Finished,
}

impl MatchStatus {
    /// Map an API-Football short status code. Postponed, cancelled and abandoned
    /// fixtures are terminal and count as finished.
    pub fn from_short_code(code: &str) -> Option<Self> {
        match code {
            "NS" | "TBD" => Some(MatchStatus::Scheduled),
            "1H" | "HT" | "2H" | "ET" | "BT" | "P" | "LIVE" | "INT" | "SUSP" => {
                Some(MatchStatus::Live)
            }
            "FT" | "AET" | "PEN" | "PST" | "CANC" | "ABD" | "AWD" | "WO" => {
                Some(MatchStatus::Finished)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Scheduled => "scheduled",
            MatchStatus::Live => "live",
            MatchStatus::Finished => "finished",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(MatchStatus::Scheduled),
            "live" => Some(MatchStatus::Live),
            "finished" => Some(MatchStatus::Finished),
            _ => None,
        }
    }
}

impl std::fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Score {
    pub home: u16,
    pub away: u16,
}

impl Score {
    pub fn new(home: u16, away: u16) -> Self {
        Self { home, away }
    }

    /// Goals for `side` and for its opponent.
    pub fn for_side(&self, side: Side) -> (u16, u16) {
        match side {
            Side::Home => (self.home, self.away),
            Side::Away => (self.away, self.home),
        }
    }
}

/// Source identifiers are used as primary keys throughout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub id: i64,
    pub league_id: i64,
    pub home_team_id: i64,
    pub away_team_id: i64,
    pub kickoff_at: DateTime<Utc>,
    pub status: MatchStatus,
    pub minute: Option<u16>,
    pub score: Score,
}

/// Minute, status and score as last reported by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveState {
    pub status: MatchStatus,
    pub minute: Option<u16>,
    pub score: Score,
}

// ---------------------------------------------------------------------------
// Fixtures as delivered by the source
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct League {
    pub id: i64,
    pub name: String,
    pub country: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Team {
    pub id: i64,
    pub name: String,
}

/// A match together with the league and teams it references.
#[derive(Debug, Clone, PartialEq)]
pub struct Fixture {
    pub league: League,
    pub home_team: Team,
    pub away_team: Team,
    pub kickoff_at: DateTime<Utc>,
    pub id: i64,
    pub live: LiveState,
}

impl Fixture {
    pub fn to_match(&self) -> Match {
        Match {
            id: self.id,
            league_id: self.league.id,
            home_team_id: self.home_team.id,
            away_team_id: self.away_team.id,
            kickoff_at: self.kickoff_at,
            status: self.live.status,
            minute: self.live.minute,
            score: self.live.score,
        }
    }
}

// ---------------------------------------------------------------------------
// Odds and classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Home,
    Away,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Home => "home",
            Side::Away => "away",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "home" => Some(Side::Home),
            "away" => Some(Side::Away),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pre-match 1X2 decimal odds. Never mutated; a refetch produces a new snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OddsSnapshot {
    pub match_id: i64,
    pub home: f64,
    pub draw: Option<f64>,
    pub away: f64,
    pub captured_at: DateTime<Utc>,
}

/// Outcome of classifying a match's first odds snapshot. Written once per match.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MonitorFlag {
    pub match_id: i64,
    /// None when home and away odds are equal.
    pub favorite: Option<Side>,
    pub favorite_odds: Option<f64>,
    pub should_monitor: bool,
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub match_id: i64,
    pub sent_at: DateTime<Utc>,
    pub message: String,
}

/// Per-match alerting state. `Fired` and `Closed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Unmonitored,
    Monitoring,
    Fired,
    Closed,
}

impl MonitorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MonitorState::Fired | MonitorState::Closed)
    }
}

impl std::fmt::Display for MonitorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MonitorState::Unmonitored => "unmonitored",
            MonitorState::Monitoring => "monitoring",
            MonitorState::Fired => "fired",
            MonitorState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Names needed to render an alert for one match.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertContext {
    pub home_team: String,
    pub away_team: String,
    pub league: String,
    pub favorite_team: String,
    pub favorite_odds: f64,
    pub minute: u16,
    pub score: Score,
}
