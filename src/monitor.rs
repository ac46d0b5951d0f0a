use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::api::health::{HealthSnapshot, HealthState};
use crate::api::latency::{CycleTimings, LatencySnapshot};
use crate::config::{MonitorSettings, POLL_CONCURRENCY};
use crate::detector::classifier::validate_odds;
use crate::detector::{classify, evaluate, AlertWindow, Decision};
use crate::error::{AppError, Result};
use crate::fetcher::{FootballSource, SourceStatus};
use crate::notifier::{format_alert, Notifier};
use crate::state::{FixtureStore, StoreStats};
use crate::types::{LiveState, Match, MonitorFlag, NotificationRecord};

/// Attempts to commit a notification record after a successful send.
const RECORD_COMMIT_ATTEMPTS: usize = 3;

const TEST_MESSAGE: &str = "🧪 Test message from favorite-alerts";

#[derive(Debug, Default, Clone, Serialize)]
pub struct FixtureReport {
    pub skipped: bool,
    pub fetched: usize,
    pub created: usize,
    pub failed: usize,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct OddsReport {
    pub skipped: bool,
    pub candidates: usize,
    pub classified: usize,
    pub monitored: usize,
    pub absent: usize,
    pub rejected: usize,
    pub failed: usize,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct MonitorReport {
    pub skipped: bool,
    pub polled: usize,
    pub poll_failures: usize,
    pub evaluated: usize,
    pub alerts_sent: usize,
    pub delivery_failures: usize,
    pub closed: usize,
    pub deadline_hit: bool,
    /// Matches left unpolled or unevaluated because the deadline passed.
    pub abandoned: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    #[serde(flatten)]
    pub store: StoreStats,
    pub health: HealthSnapshot,
    pub monitor_cycle_latency: LatencySnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvalOutcome {
    Held,
    Closed,
    Fired,
    DeliveryFailed,
    AlreadyRecorded,
}

/// The monitoring engine. Each cycle is an independent, synchronous operation
/// taking the current time as a parameter; the scheduler and the operator API
/// both call straight into it. A cycle that is already running is never
/// entered twice: the second caller gets a report with `skipped = true`.
pub struct MonitorService {
    store: FixtureStore,
    source: Arc<dyn FootballSource>,
    notifier: Arc<dyn Notifier>,
    settings: MonitorSettings,
    health: Arc<HealthState>,
    timings: Arc<CycleTimings>,
    fixtures_guard: Mutex<()>,
    odds_guard: Mutex<()>,
    monitor_guard: Mutex<()>,
}

impl MonitorService {
    pub fn new(
        store: FixtureStore,
        source: Arc<dyn FootballSource>,
        notifier: Arc<dyn Notifier>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            store,
            source,
            notifier,
            settings,
            health: Arc::new(HealthState::new()),
            timings: Arc::new(CycleTimings::new()),
            fixtures_guard: Mutex::new(()),
            odds_guard: Mutex::new(()),
            monitor_guard: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &FixtureStore {
        &self.store
    }

    pub fn health(&self) -> &HealthState {
        &self.health
    }

    fn window(&self) -> AlertWindow {
        AlertWindow {
            start: self.settings.window_start,
            end: self.settings.window_end,
        }
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Option<Result<T>> {
        tokio::time::timeout(self.settings.call_timeout, fut).await.ok()
    }

    fn timed_out(&self, what: &str) -> AppError {
        AppError::TransientFetch(format!(
            "{what} timed out after {}s",
            self.settings.call_timeout.as_secs_f64()
        ))
    }

    // -----------------------------------------------------------------------
    // Fixture refresh (daily)
    // -----------------------------------------------------------------------

    pub async fn refresh_fixtures(&self, date: NaiveDate, now: DateTime<Utc>) -> Result<FixtureReport> {
        let Ok(_guard) = self.fixtures_guard.try_lock() else {
            warn!("Fixture refresh already running, skipping");
            self.health.record_skipped_run();
            return Ok(FixtureReport { skipped: true, ..Default::default() });
        };

        let fetched = self
            .bounded(self.source.fetch_fixtures(date, &self.settings.leagues))
            .await
            .unwrap_or_else(|| Err(self.timed_out("fixture fetch")));
        let fixtures = match fetched {
            Ok(f) => {
                self.health.record_fetch_ok(None);
                f
            }
            Err(e) => {
                self.health.record_fetch_failure(None, &e);
                error!("Fixture fetch for {date} failed: {e}");
                return Err(e);
            }
        };

        let mut report = FixtureReport { fetched: fixtures.len(), ..Default::default() };
        for fixture in &fixtures {
            match self.store.upsert_fixture(fixture, now).await {
                Ok(true) => report.created += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(match_id = fixture.id, "Failed to store fixture: {e}");
                }
            }
        }

        info!(
            date = %date,
            fetched = report.fetched,
            created = report.created,
            failed = report.failed,
            "Fixture refresh complete: {} fetched, {} new",
            report.fetched, report.created,
        );
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Odds refresh + classification (every few hours)
    // -----------------------------------------------------------------------

    pub async fn refresh_odds(&self, now: DateTime<Utc>) -> Result<OddsReport> {
        let Ok(_guard) = self.odds_guard.try_lock() else {
            warn!("Odds refresh already running, skipping");
            self.health.record_skipped_run();
            return Ok(OddsReport { skipped: true, ..Default::default() });
        };

        let candidates = self.store.matches_awaiting_classification(now).await?;
        let mut report = OddsReport { candidates: candidates.len(), ..Default::default() };

        for m in &candidates {
            match self.classify_match(m, now).await {
                Ok(Some(flag)) => {
                    report.classified += 1;
                    if flag.should_monitor {
                        report.monitored += 1;
                    }
                }
                Ok(None) => report.absent += 1,
                Err(e @ AppError::Data(_)) => {
                    report.rejected += 1;
                    self.health.record_data_error(&e);
                    warn!(match_id = m.id, "Odds rejected: {e}");
                }
                Err(e) if e.is_transient() => {
                    report.failed += 1;
                    self.health.record_fetch_failure(Some(m.id), &e);
                    warn!(match_id = m.id, "Odds fetch failed, retrying next cycle: {e}");
                }
                Err(e) => {
                    report.failed += 1;
                    error!(match_id = m.id, "Classification failed: {e}");
                }
            }
        }

        info!(
            candidates = report.candidates,
            classified = report.classified,
            monitored = report.monitored,
            absent = report.absent,
            rejected = report.rejected,
            failed = report.failed,
            "Odds refresh complete: {} classified, {} to monitor",
            report.classified, report.monitored,
        );
        Ok(report)
    }

    /// Classify one match from its first odds snapshot, fetching odds if none
    /// is stored and the match has not kicked off. Returns the stored flag, or
    /// None while odds are absent.
    /// Calling again on a classified match returns the same flag.
    pub async fn classify_match(&self, m: &Match, now: DateTime<Utc>) -> Result<Option<MonitorFlag>> {
        if let Some(flag) = self.store.monitor_flag(m.id).await? {
            return Ok(Some(flag));
        }

        let snapshot = match self.store.first_odds(m.id).await? {
            Some(s) => s,
            None if m.kickoff_at <= now => {
                debug!(match_id = m.id, "Kicked off without pre-match odds, not classified");
                return Ok(None);
            }
            None => {
                let fetched = self
                    .bounded(self.source.fetch_odds(m, now))
                    .await
                    .unwrap_or_else(|| Err(self.timed_out("odds fetch")))?;
                self.health.record_fetch_ok(Some(m.id));
                let Some(fetched) = fetched else {
                    return Ok(None);
                };
                // Malformed odds are never stored, so a later fetch can still be "first".
                validate_odds(&fetched)?;
                self.store.insert_odds(&fetched).await?;
                self.store.first_odds(m.id).await?.unwrap_or(fetched)
            }
        };

        let flag = classify(&snapshot, self.settings.favorite_odds_threshold)?;
        if self.store.insert_monitor_flag(&flag, now).await? {
            info!(
                match_id = m.id,
                favorite = ?flag.favorite,
                favorite_odds = ?flag.favorite_odds,
                should_monitor = flag.should_monitor,
                "Match classified",
            );
        }
        Ok(self.store.monitor_flag(m.id).await?.or(Some(flag)))
    }

    // -----------------------------------------------------------------------
    // Live poll + evaluate (every minute)
    // -----------------------------------------------------------------------

    pub async fn run_monitor_cycle(&self, now: DateTime<Utc>) -> Result<MonitorReport> {
        let Ok(_guard) = self.monitor_guard.try_lock() else {
            warn!("Monitor cycle already running, skipping");
            self.health.record_skipped_run();
            return Ok(MonitorReport { skipped: true, ..Default::default() });
        };

        let started = Instant::now();
        let deadline = started + self.settings.cycle_deadline;
        let mut report = MonitorReport::default();

        // --- Poll ---
        let pollable = self.store.pollable_matches(now).await?;
        let mut results: Vec<(i64, Result<LiveState>)> = Vec::with_capacity(pollable.len());
        let poll_phase = async {
            let mut polls = stream::iter(pollable.iter().cloned())
                .map(|m| self.poll_one(m))
                .buffer_unordered(POLL_CONCURRENCY);
            while let Some(result) = polls.next().await {
                results.push(result);
            }
        };
        if tokio::time::timeout_at(deadline, poll_phase).await.is_err() {
            report.deadline_hit = true;
            report.abandoned += pollable.len() - results.len();
        }

        for (match_id, result) in results {
            match result {
                Ok(live) => match self.store.update_live_state(match_id, &live, now).await {
                    Ok(()) => {
                        report.polled += 1;
                        self.health.record_fetch_ok(Some(match_id));
                    }
                    Err(e) => {
                        report.poll_failures += 1;
                        error!(match_id, "Failed to store live state: {e}");
                    }
                },
                Err(e) => {
                    report.poll_failures += 1;
                    if matches!(e, AppError::Data(_)) {
                        self.health.record_data_error(&e);
                    } else {
                        self.health.record_fetch_failure(Some(match_id), &e);
                    }
                    warn!(match_id, "Live poll failed, retrying next cycle: {e}");
                }
            }
        }

        // --- Evaluate ---
        let monitoring = self.store.monitoring_matches().await?;
        for (i, (m, flag)) in monitoring.iter().enumerate() {
            if Instant::now() >= deadline {
                report.deadline_hit = true;
                report.abandoned += monitoring.len() - i;
                break;
            }
            report.evaluated += 1;
            match self.evaluate_match(m, flag, now).await {
                Ok(EvalOutcome::Fired) => report.alerts_sent += 1,
                Ok(EvalOutcome::DeliveryFailed) => report.delivery_failures += 1,
                Ok(EvalOutcome::Closed) => report.closed += 1,
                Ok(EvalOutcome::Held) | Ok(EvalOutcome::AlreadyRecorded) => {}
                Err(e) => error!(match_id = m.id, "Evaluation failed: {e}"),
            }
        }

        if report.deadline_hit {
            self.health.record_deadline_abort();
            warn!(abandoned = report.abandoned, "Monitor cycle hit its deadline; remaining matches resume next tick");
        }
        self.timings.record(started.elapsed());
        self.health.set_last_monitor_cycle_at(now.timestamp());

        info!(
            polled = report.polled,
            poll_failures = report.poll_failures,
            evaluated = report.evaluated,
            alerts = report.alerts_sent,
            closed = report.closed,
            "Monitor cycle complete: {} alerts sent",
            report.alerts_sent,
        );
        Ok(report)
    }

    async fn poll_one(&self, m: Match) -> (i64, Result<LiveState>) {
        let result = self
            .bounded(self.source.fetch_live_state(&m))
            .await
            .unwrap_or_else(|| Err(self.timed_out("live poll")));
        (m.id, result)
    }

    async fn evaluate_match(&self, m: &Match, flag: &MonitorFlag, now: DateTime<Utc>) -> Result<EvalOutcome> {
        if self.store.monitor_state(m.id).await?.is_terminal() {
            return Ok(EvalOutcome::AlreadyRecorded);
        }

        match evaluate(m, flag, &self.window()) {
            Decision::Hold => Ok(EvalOutcome::Held),
            Decision::Close(cause) => {
                self.store.close_monitoring(m.id, cause, now).await?;
                info!(match_id = m.id, cause = %cause, minute = ?m.minute, "Monitoring closed without alert");
                Ok(EvalOutcome::Closed)
            }
            Decision::Fire => self.fire(m, now).await,
        }
    }

    /// Send, then commit the record with nothing in between. A crash after the
    /// send and before the commit can repeat the alert on restart.
    async fn fire(&self, m: &Match, now: DateTime<Utc>) -> Result<EvalOutcome> {
        let ctx = self
            .store
            .alert_context(m.id)
            .await?
            .ok_or_else(|| AppError::Data(format!("match {}: team, league or favorite missing", m.id)))?;
        let message = format_alert(&ctx);

        let sent = self
            .bounded(self.notifier.send(&message))
            .await
            .unwrap_or_else(|| Err(AppError::Delivery("send timed out".to_string())));
        if let Err(e) = sent {
            self.health.record_delivery_failure(&e);
            warn!(match_id = m.id, minute = ?m.minute, "Alert delivery failed, retrying next cycle: {e}");
            return Ok(EvalOutcome::DeliveryFailed);
        }

        let record = NotificationRecord { match_id: m.id, sent_at: now, message };
        let mut last_err = None;
        for _ in 0..RECORD_COMMIT_ATTEMPTS {
            match self.store.record_notification(&record).await {
                Ok(true) => {
                    info!(
                        match_id = m.id,
                        minute = ?m.minute,
                        home = m.score.home,
                        away = m.score.away,
                        "ALERT SENT | {} vs {} | {}' | {} - {}",
                        ctx.home_team, ctx.away_team, ctx.minute, ctx.score.home, ctx.score.away,
                    );
                    return Ok(EvalOutcome::Fired);
                }
                Ok(false) => {
                    warn!(match_id = m.id, "Notification already recorded for match");
                    return Ok(EvalOutcome::AlreadyRecorded);
                }
                Err(e) => last_err = Some(e),
            }
        }
        let e = last_err.unwrap_or_else(|| AppError::Data("notification commit failed".to_string()));
        error!(match_id = m.id, "Alert sent but record not committed; it may repeat: {e}");
        Err(e)
    }

    // -----------------------------------------------------------------------
    // Operator hooks
    // -----------------------------------------------------------------------

    pub async fn send_test_notification(&self) -> Result<()> {
        let sent = self
            .bounded(self.notifier.send(TEST_MESSAGE))
            .await
            .unwrap_or_else(|| Err(AppError::Delivery("send timed out".to_string())));
        if let Err(e) = &sent {
            self.health.record_delivery_failure(e);
        }
        sent
    }

    /// Quota and connectivity of the fixture source. Failures feed the health counters.
    pub async fn source_status(&self) -> Result<SourceStatus> {
        let status = self
            .bounded(self.source.fetch_status())
            .await
            .unwrap_or_else(|| Err(self.timed_out("status check")));
        match &status {
            Ok(s) => {
                self.health.record_fetch_ok(None);
                if s.quota_exhausted {
                    warn!(used = s.requests_used, limit = s.requests_limit, "Source request quota exhausted");
                }
            }
            Err(e) => self.health.record_fetch_failure(None, e),
        }
        status
    }

    pub async fn stats(&self) -> Result<StatsReport> {
        Ok(StatsReport {
            store: self.store.stats().await?,
            health: self.health.snapshot(),
            monitor_cycle_latency: self.timings.snapshot(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    use crate::state::fixture_store::{memory_store, test_fixture};
    use crate::types::{Fixture, MatchStatus, MonitorState, OddsSnapshot, Score, Side};

    #[derive(Default)]
    struct FakeSource {
        fixtures: std::sync::Mutex<Vec<Fixture>>,
        odds: std::sync::Mutex<HashMap<i64, (f64, f64)>>,
        /// None → transient failure for that match.
        live: std::sync::Mutex<HashMap<i64, Option<LiveState>>>,
        live_delay: Option<Duration>,
        odds_calls: AtomicUsize,
    }

    impl FakeSource {
        fn set_odds(&self, match_id: i64, home: f64, away: f64) {
            self.odds.lock().unwrap().insert(match_id, (home, away));
        }

        fn set_live(&self, match_id: i64, status: MatchStatus, minute: u16, home: u16, away: u16) {
            self.live.lock().unwrap().insert(
                match_id,
                Some(LiveState { status, minute: Some(minute), score: Score::new(home, away) }),
            );
        }

        fn fail_live(&self, match_id: i64) {
            self.live.lock().unwrap().insert(match_id, None);
        }
    }

    #[async_trait]
    impl FootballSource for FakeSource {
        async fn fetch_fixtures(&self, _date: NaiveDate, _leagues: &[i64]) -> Result<Vec<Fixture>> {
            Ok(self.fixtures.lock().unwrap().clone())
        }

        async fn fetch_odds(&self, m: &Match, captured_at: DateTime<Utc>) -> Result<Option<OddsSnapshot>> {
            self.odds_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.odds.lock().unwrap().get(&m.id).map(|&(home, away)| OddsSnapshot {
                match_id: m.id,
                home,
                draw: Some(6.0),
                away,
                captured_at,
            }))
        }

        async fn fetch_status(&self) -> Result<SourceStatus> {
            Ok(SourceStatus::new(Some("Free".to_string()), 100, 100))
        }

        async fn fetch_live_state(&self, m: &Match) -> Result<LiveState> {
            if let Some(delay) = self.live_delay {
                tokio::time::sleep(delay).await;
            }
            match self.live.lock().unwrap().get(&m.id) {
                Some(Some(live)) => Ok(*live),
                _ => Err(AppError::TransientFetch(format!("fixture {} unavailable", m.id))),
            }
        }
    }

    #[derive(Default)]
    struct FakeNotifier {
        sent: std::sync::Mutex<Vec<String>>,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl Notifier for FakeNotifier {
        async fn send(&self, text: &str) -> Result<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(AppError::Delivery("rate limited: HTTP 429".to_string()));
            }
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    struct Harness {
        svc: MonitorService,
        source: Arc<FakeSource>,
        notifier: Arc<FakeNotifier>,
        now: DateTime<Utc>,
    }

    impl Harness {
        async fn new() -> Self {
            Self::with(FakeSource::default(), MonitorSettings::default()).await
        }

        async fn with(source: FakeSource, settings: MonitorSettings) -> Self {
            let source = Arc::new(source);
            let notifier = Arc::new(FakeNotifier::default());
            let svc = MonitorService::new(memory_store().await, source.clone(), notifier.clone(), settings);
            Self { svc, source, notifier, now: Utc::now() }
        }

        /// Store a match that kicked off an hour ago and classify it.
        async fn monitored_match(&self, id: i64, home_odds: f64, away_odds: f64) {
            let fixture = test_fixture(id, self.now - ChronoDuration::hours(1));
            self.svc.store().upsert_fixture(&fixture, self.now).await.unwrap();
            self.source.set_odds(id, home_odds, away_odds);
            let m = self.svc.store().get_match(id).await.unwrap().unwrap();
            let before_kickoff = self.now - ChronoDuration::hours(2);
            let flag = self.svc.classify_match(&m, before_kickoff).await.unwrap().unwrap();
            assert!(flag.should_monitor);
        }

        fn sent(&self) -> Vec<String> {
            self.notifier.sent.lock().unwrap().clone()
        }

        async fn state(&self, id: i64) -> MonitorState {
            self.svc.store().monitor_state(id).await.unwrap()
        }
    }

    #[tokio::test]
    async fn fixture_refresh_stores_new_matches_once() {
        let h = Harness::new().await;
        *h.source.fixtures.lock().unwrap() = vec![test_fixture(1, h.now), test_fixture(2, h.now)];
        let date = h.now.date_naive();

        let first = h.svc.refresh_fixtures(date, h.now).await.unwrap();
        assert_eq!((first.fetched, first.created), (2, 2));

        let second = h.svc.refresh_fixtures(date, h.now).await.unwrap();
        assert_eq!((second.fetched, second.created), (2, 0));
        assert_eq!(h.svc.stats().await.unwrap().store.total_matches, 2);
    }

    #[tokio::test]
    async fn strong_favorite_is_flagged_and_classification_is_idempotent() {
        let h = Harness::new().await;
        h.svc.store().upsert_fixture(&test_fixture(1, h.now + ChronoDuration::hours(4)), h.now).await.unwrap();
        h.source.set_odds(1, 1.20, 5.0);

        let report = h.svc.refresh_odds(h.now).await.unwrap();
        assert_eq!((report.classified, report.monitored), (1, 1));

        let flag = h.svc.store().monitor_flag(1).await.unwrap().unwrap();
        assert_eq!(flag.favorite, Some(Side::Home));
        assert!(flag.should_monitor);
        assert_eq!(h.state(1).await, MonitorState::Monitoring);

        // Later odds must not change the outcome.
        h.source.set_odds(1, 2.50, 2.60);
        let m = h.svc.store().get_match(1).await.unwrap().unwrap();
        assert_eq!(h.svc.classify_match(&m, h.now).await.unwrap(), Some(flag));
        assert_eq!(h.svc.refresh_odds(h.now).await.unwrap().candidates, 0);
        assert_eq!(h.source.odds_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn absent_odds_leave_match_unmonitored_until_next_cycle() {
        let h = Harness::new().await;
        h.svc.store().upsert_fixture(&test_fixture(1, h.now + ChronoDuration::hours(4)), h.now).await.unwrap();

        let report = h.svc.refresh_odds(h.now).await.unwrap();
        assert_eq!((report.absent, report.classified), (1, 0));
        assert_eq!(h.state(1).await, MonitorState::Unmonitored);
        assert!(h.svc.store().monitor_flag(1).await.unwrap().is_none());

        h.source.set_odds(1, 1.25, 9.0);
        let report = h.svc.refresh_odds(h.now).await.unwrap();
        assert_eq!(report.monitored, 1);
        assert_eq!(h.state(1).await, MonitorState::Monitoring);
    }

    #[tokio::test]
    async fn malformed_odds_are_rejected_and_not_stored() {
        let h = Harness::new().await;
        h.svc.store().upsert_fixture(&test_fixture(1, h.now + ChronoDuration::hours(4)), h.now).await.unwrap();
        h.source.set_odds(1, 1.0, 5.0);

        let report = h.svc.refresh_odds(h.now).await.unwrap();
        assert_eq!(report.rejected, 1);
        assert!(h.svc.store().first_odds(1).await.unwrap().is_none());
        assert!(h.svc.store().monitor_flag(1).await.unwrap().is_none());
        assert_eq!(h.svc.stats().await.unwrap().health.data_errors, 1);
    }

    #[tokio::test]
    async fn losing_favorite_fires_exactly_once() {
        let h = Harness::new().await;
        h.monitored_match(1, 1.20, 5.0).await;

        h.source.set_live(1, MatchStatus::Live, 58, 0, 1);
        let report = h.svc.run_monitor_cycle(h.now).await.unwrap();
        assert_eq!(report.alerts_sent, 1);

        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("Home 1</b> vs <b>Away 1"));
        assert!(sent[0].contains("58'"));
        assert!(sent[0].contains("0 - 1"));
        assert_eq!(h.state(1).await, MonitorState::Fired);
        assert_eq!(h.svc.store().notification(1).await.unwrap().unwrap().message, sent[0]);

        h.source.set_live(1, MatchStatus::Live, 59, 0, 1);
        let report = h.svc.run_monitor_cycle(h.now + ChronoDuration::minutes(1)).await.unwrap();
        assert_eq!(report.alerts_sent, 0);
        assert_eq!(report.polled, 0);
        assert_eq!(h.sent().len(), 1);
        assert_eq!(h.svc.store().notification_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn never_losing_in_window_closes_without_alert() {
        let h = Harness::new().await;
        h.monitored_match(1, 1.20, 5.0).await;

        for minute in [50, 55, 60, 62] {
            h.source.set_live(1, MatchStatus::Live, minute, 1, 1);
            let report = h.svc.run_monitor_cycle(h.now).await.unwrap();
            assert_eq!(report.alerts_sent, 0);
            assert_eq!(h.state(1).await, MonitorState::Monitoring);
        }

        h.source.set_live(1, MatchStatus::Live, 63, 0, 1);
        let report = h.svc.run_monitor_cycle(h.now).await.unwrap();
        assert_eq!(report.closed, 1);
        assert_eq!(h.state(1).await, MonitorState::Closed);

        // A late correction back into the window changes nothing.
        h.source.set_live(1, MatchStatus::Live, 58, 0, 1);
        let report = h.svc.run_monitor_cycle(h.now).await.unwrap();
        assert_eq!((report.polled, report.alerts_sent), (0, 0));
        assert!(h.sent().is_empty());
        assert!(h.svc.store().notification(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn finished_match_closes() {
        let h = Harness::new().await;
        h.monitored_match(1, 1.10, 12.0).await;

        h.source.set_live(1, MatchStatus::Finished, 90, 0, 1);
        let report = h.svc.run_monitor_cycle(h.now).await.unwrap();
        assert_eq!((report.closed, report.alerts_sent), (1, 0));
        assert_eq!(h.state(1).await, MonitorState::Closed);
    }

    #[tokio::test]
    async fn delivery_failure_keeps_monitoring_and_retries() {
        let h = Harness::new().await;
        h.monitored_match(1, 1.20, 5.0).await;
        h.notifier.failures_left.store(1, Ordering::SeqCst);

        h.source.set_live(1, MatchStatus::Live, 57, 0, 1);
        let report = h.svc.run_monitor_cycle(h.now).await.unwrap();
        assert_eq!((report.delivery_failures, report.alerts_sent), (1, 0));
        assert_eq!(h.state(1).await, MonitorState::Monitoring);
        assert!(h.svc.store().notification(1).await.unwrap().is_none());

        let report = h.svc.run_monitor_cycle(h.now).await.unwrap();
        assert_eq!(report.alerts_sent, 1);
        assert_eq!(h.sent().len(), 1);
        assert_eq!(h.svc.stats().await.unwrap().health.delivery_failures, 1);
    }

    #[tokio::test]
    async fn one_failing_poll_does_not_abort_the_batch() {
        let h = Harness::new().await;
        h.monitored_match(1, 1.20, 5.0).await;
        h.monitored_match(2, 8.0, 1.15).await;

        h.source.fail_live(1);
        h.source.set_live(2, MatchStatus::Live, 61, 2, 0);
        let report = h.svc.run_monitor_cycle(h.now).await.unwrap();

        assert_eq!(report.poll_failures, 1);
        assert_eq!(report.polled, 1);
        assert_eq!(report.alerts_sent, 1);
        assert_eq!(h.state(1).await, MonitorState::Monitoring);
        assert_eq!(h.state(2).await, MonitorState::Fired);
        assert_eq!(h.svc.health().match_failures(1), 1);
    }

    #[tokio::test]
    async fn overlapping_cycles_are_skipped_and_fire_once() {
        let h = Harness::new().await;
        h.monitored_match(1, 1.20, 5.0).await;
        h.source.set_live(1, MatchStatus::Live, 58, 0, 1);

        let (a, b) = tokio::join!(h.svc.run_monitor_cycle(h.now), h.svc.run_monitor_cycle(h.now));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(a.skipped ^ b.skipped);
        assert_eq!(a.alerts_sent + b.alerts_sent, 1);
        assert_eq!(h.sent().len(), 1);
        assert_eq!(h.svc.store().notification_count().await.unwrap(), 1);
        assert_eq!(h.svc.stats().await.unwrap().health.skipped_runs, 1);
    }

    #[tokio::test]
    async fn deadline_abandons_slow_polls_without_state_change() {
        let source = FakeSource { live_delay: Some(Duration::from_millis(200)), ..Default::default() };
        let settings = MonitorSettings { cycle_deadline: Duration::from_millis(20), ..Default::default() };
        let h = Harness::with(source, settings).await;
        h.monitored_match(1, 1.20, 5.0).await;
        h.source.set_live(1, MatchStatus::Live, 58, 0, 1);

        let report = h.svc.run_monitor_cycle(h.now).await.unwrap();
        assert!(report.deadline_hit);
        assert_eq!(report.alerts_sent, 0);
        assert!(report.abandoned >= 1);
        assert_eq!(h.state(1).await, MonitorState::Monitoring);
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn not_yet_kicked_off_matches_are_not_polled() {
        let h = Harness::new().await;
        let fixture = test_fixture(1, h.now + ChronoDuration::hours(2));
        h.svc.store().upsert_fixture(&fixture, h.now).await.unwrap();
        h.source.set_odds(1, 1.2, 5.0);
        h.svc.refresh_odds(h.now).await.unwrap();
        h.source.set_live(1, MatchStatus::Live, 58, 0, 1);

        let report = h.svc.run_monitor_cycle(h.now).await.unwrap();
        assert_eq!((report.polled, report.alerts_sent), (0, 0));
        assert_eq!(report.evaluated, 1);
    }

    #[tokio::test]
    async fn monitor_cycle_runs_on_a_spawned_task() {
        let source = Arc::new(FakeSource::default());
        let notifier = Arc::new(FakeNotifier::default());
        let svc = Arc::new(MonitorService::new(
            memory_store().await,
            source.clone(),
            notifier.clone(),
            MonitorSettings::default(),
        ));
        let now = Utc::now();
        let fixture = test_fixture(1, now - ChronoDuration::hours(1));
        svc.store().upsert_fixture(&fixture, now).await.unwrap();
        source.set_odds(1, 1.20, 5.0);
        let m = svc.store().get_match(1).await.unwrap().unwrap();
        svc.classify_match(&m, now - ChronoDuration::hours(2)).await.unwrap();
        source.set_live(1, MatchStatus::Live, 58, 0, 1);

        let task = Arc::clone(&svc);
        let report = tokio::spawn(async move { task.run_monitor_cycle(now).await })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.alerts_sent, 1);
        assert_eq!(notifier.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn kicked_off_match_without_odds_is_never_classified() {
        let h = Harness::new().await;
        let fixture = test_fixture(1, h.now - ChronoDuration::days(2));
        h.svc.store().upsert_fixture(&fixture, h.now).await.unwrap();
        h.source.set_odds(1, 1.20, 5.0);

        for _ in 0..3 {
            let report = h.svc.refresh_odds(h.now).await.unwrap();
            assert_eq!(report.candidates, 0);
        }
        let m = h.svc.store().get_match(1).await.unwrap().unwrap();
        assert_eq!(h.svc.classify_match(&m, h.now).await.unwrap(), None);

        assert_eq!(h.source.odds_calls.load(Ordering::SeqCst), 0);
        assert!(h.svc.store().first_odds(1).await.unwrap().is_none());
        assert_eq!(h.state(1).await, MonitorState::Unmonitored);
    }

    #[tokio::test]
    async fn out_of_order_minute_is_evaluated_as_reported() {
        let h = Harness::new().await;
        h.monitored_match(1, 1.20, 5.0).await;

        h.source.set_live(1, MatchStatus::Live, 60, 0, 0);
        let report = h.svc.run_monitor_cycle(h.now).await.unwrap();
        assert_eq!((report.alerts_sent, report.closed), (0, 0));

        h.source.set_live(1, MatchStatus::Live, 58, 0, 1);
        let report = h.svc.run_monitor_cycle(h.now).await.unwrap();
        assert_eq!((report.alerts_sent, report.closed), (1, 0));
        assert_eq!(h.state(1).await, MonitorState::Fired);
        assert!(h.sent()[0].contains("58'"));
    }

    #[tokio::test]
    async fn source_status_reports_quota() {
        let h = Harness::new().await;
        let status = h.svc.source_status().await.unwrap();
        assert_eq!(status.requests_available, 0);
        assert!(status.quota_exhausted);
        assert_eq!(h.svc.stats().await.unwrap().health.consecutive_fetch_failures, 0);
    }

    #[tokio::test]
    async fn test_notification_reports_delivery_result() {
        let h = Harness::new().await;
        assert!(h.svc.send_test_notification().await.is_ok());
        assert_eq!(h.sent(), vec![TEST_MESSAGE.to_string()]);

        h.notifier.failures_left.store(1, Ordering::SeqCst);
        assert!(matches!(h.svc.send_test_notification().await, Err(AppError::Delivery(_))));
    }
}
