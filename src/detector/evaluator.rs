use crate::types::{Match, MatchStatus, MonitorFlag};

/// Inclusive minute range in which a losing favorite triggers an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertWindow {
    pub start: u16,
    pub end: u16,
}

impl AlertWindow {
    pub fn contains(&self, minute: u16) -> bool {
        self.start <= minute && minute <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    MatchFinished,
    WindowPassed,
}

impl std::fmt::Display for CloseCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseCause::MatchFinished => write!(f, "match_finished"),
            CloseCause::WindowPassed => write!(f, "window_passed"),
        }
    }
}

/// What the evaluator should do with a match currently in `monitoring`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Send the alert; commit the record only if the send succeeds.
    Fire,
    Close(CloseCause),
    Hold,
}

/// True when the favored side has strictly fewer goals than its opponent.
pub fn favorite_losing(m: &Match, flag: &MonitorFlag) -> bool {
    match flag.favorite {
        Some(side) => {
            let (fav, opp) = m.score.for_side(side);
            fav < opp
        }
        None => false,
    }
}

/// Decide the next transition for a match in `monitoring`, from the latest
/// stored live state. Terminal states and existing notification records are
/// filtered out by the caller. Out-of-order minutes are taken as-is.
pub fn evaluate(m: &Match, flag: &MonitorFlag, window: &AlertWindow) -> Decision {
    if !flag.should_monitor {
        return Decision::Hold;
    }
    if m.status == MatchStatus::Finished {
        return Decision::Close(CloseCause::MatchFinished);
    }

    let Some(minute) = m.minute else {
        return Decision::Hold;
    };

    if minute > window.end {
        return Decision::Close(CloseCause::WindowPassed);
    }

    if m.status == MatchStatus::Live && window.contains(minute) && favorite_losing(m, flag) {
        return Decision::Fire;
    }

    Decision::Hold
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Score, Side};
    use chrono::Utc;

    const WINDOW: AlertWindow = AlertWindow { start: 55, end: 62 };

    fn live(minute: u16, home: u16, away: u16) -> Match {
        Match {
            id: 1,
            league_id: 39,
            home_team_id: 10,
            away_team_id: 20,
            kickoff_at: Utc::now(),
            status: MatchStatus::Live,
            minute: Some(minute),
            score: Score::new(home, away),
        }
    }

    fn flag(side: Side) -> MonitorFlag {
        MonitorFlag {
            match_id: 1,
            favorite: Some(side),
            favorite_odds: Some(1.2),
            should_monitor: true,
        }
    }

    #[test]
    fn losing_home_favorite_inside_window_fires() {
        assert_eq!(evaluate(&live(58, 0, 1), &flag(Side::Home), &WINDOW), Decision::Fire);
    }

    #[test]
    fn losing_away_favorite_inside_window_fires() {
        assert_eq!(evaluate(&live(60, 2, 1), &flag(Side::Away), &WINDOW), Decision::Fire);
    }

    #[test]
    fn window_bounds_are_inclusive() {
        assert_eq!(evaluate(&live(55, 0, 1), &flag(Side::Home), &WINDOW), Decision::Fire);
        assert_eq!(evaluate(&live(62, 0, 1), &flag(Side::Home), &WINDOW), Decision::Fire);
    }

    #[test]
    fn before_window_holds() {
        assert_eq!(evaluate(&live(54, 0, 1), &flag(Side::Home), &WINDOW), Decision::Hold);
    }

    #[test]
    fn after_window_closes_even_when_losing() {
        assert_eq!(
            evaluate(&live(63, 0, 1), &flag(Side::Home), &WINDOW),
            Decision::Close(CloseCause::WindowPassed)
        );
    }

    #[test]
    fn level_or_winning_favorite_holds() {
        assert_eq!(evaluate(&live(58, 1, 1), &flag(Side::Home), &WINDOW), Decision::Hold);
        assert_eq!(evaluate(&live(58, 2, 0), &flag(Side::Home), &WINDOW), Decision::Hold);
        assert_eq!(evaluate(&live(58, 0, 1), &flag(Side::Away), &WINDOW), Decision::Hold);
    }

    #[test]
    fn finished_match_closes() {
        let mut m = live(58, 0, 1);
        m.status = MatchStatus::Finished;
        assert_eq!(
            evaluate(&m, &flag(Side::Home), &WINDOW),
            Decision::Close(CloseCause::MatchFinished)
        );
    }

    #[test]
    fn missing_minute_holds() {
        let mut m = live(0, 0, 1);
        m.minute = None;
        assert_eq!(evaluate(&m, &flag(Side::Home), &WINDOW), Decision::Hold);
    }

    #[test]
    fn not_live_inside_window_holds() {
        let mut m = live(58, 0, 1);
        m.status = MatchStatus::Scheduled;
        assert_eq!(evaluate(&m, &flag(Side::Home), &WINDOW), Decision::Hold);
    }

    #[test]
    fn no_favorite_never_fires() {
        let f = MonitorFlag { favorite: None, ..flag(Side::Home) };
        assert_eq!(evaluate(&live(58, 0, 1), &f, &WINDOW), Decision::Hold);
    }

    #[test]
    fn unmonitored_flag_is_never_closed_or_fired() {
        let f = MonitorFlag { should_monitor: false, ..flag(Side::Home) };
        assert_eq!(evaluate(&live(58, 0, 1), &f, &WINDOW), Decision::Hold);

        let mut finished = live(90, 0, 1);
        finished.status = MatchStatus::Finished;
        assert_eq!(evaluate(&finished, &f, &WINDOW), Decision::Hold);
    }
}
