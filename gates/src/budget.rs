//! Budget guard: per-call ceiling, daily token quota, and cost alerts.
//!
//! ```text
//!   check_and_reserve(estimate) ──► Reservation ──► commit(usage, cost)
//!          │                             │
//!          └─ BudgetExceeded             └─ dropped ─► release
//! ```
//!
//! All reads, reservations and commits go through one mutex, so concurrent
//! runs sharing a guard cannot jointly overshoot the quota. A reservation
//! holds the call's worst case (estimated input + max output) until it is
//! committed or released. Committed usage can therefore exceed the quota by
//! at most one in-flight call's worst-case size.
//!
//! Ledger writes happen after the counter lock is released. Each commit
//! stamps its snapshot with a revision and a second lock keeps the file at
//! the newest revision written. Reservations never wait on ledger IO.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::BudgetExceeded;
use crate::ledger::{DayUsage, UsageLedger};

/// Token usage for one model call, or an aggregate of several.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Price per million tokens. Zero prices mean cost is not tracked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pricing {
    pub input_per_mtokens: f64,
    pub output_per_mtokens: f64,
}

impl Pricing {
    pub fn cost_usd(&self, usage: &TokenUsage) -> f64 {
        usage.input_tokens as f64 * (self.input_per_mtokens / 1_000_000.0)
            + usage.output_tokens as f64 * (self.output_per_mtokens / 1_000_000.0)
    }

    pub fn is_zero(&self) -> bool {
        self.input_per_mtokens <= 0.0 && self.output_per_mtokens <= 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Per-call ceiling on estimated input tokens.
    pub max_input_tokens: u64,
    /// Worst-case output size reserved alongside each call.
    pub max_output_tokens: u64,
    /// Rolling daily ceiling on input + output tokens.
    pub daily_token_quota: u64,
    /// Warn once cumulative daily cost reaches this.
    pub cost_alert_usd: Option<f64>,
    /// Warn when a single call costs more than this.
    pub single_call_cost_alert_usd: Option<f64>,
    pub pricing: Pricing,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_input_tokens: 8_000,
            max_output_tokens: 2_048,
            daily_token_quota: 200_000,
            cost_alert_usd: None,
            single_call_cost_alert_usd: None,
            pricing: Pricing::default(),
        }
    }
}

impl BudgetConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_input_tokens == 0 {
            return Err("max_input_tokens must be > 0".into());
        }
        if self.daily_token_quota == 0 {
            return Err("daily_token_quota must be > 0".into());
        }
        for (name, value) in [
            ("cost_alert_usd", self.cost_alert_usd),
            ("single_call_cost_alert_usd", self.single_call_cost_alert_usd),
        ] {
            if let Some(v) = value {
                if !(v >= 0.0) {
                    return Err(format!("{name} must be >= 0, got {v}"));
                }
            }
        }
        if self.pricing.input_per_mtokens < 0.0 || self.pricing.output_per_mtokens < 0.0 {
            return Err("token prices must be >= 0".into());
        }
        Ok(())
    }
}

/// Mutable counters for the current day.
#[derive(Debug, Clone, Default)]
struct BudgetState {
    window: Option<NaiveDate>,
    used_tokens: u64,
    input_tokens: u64,
    output_tokens: u64,
    cost_usd: f64,
    calls: u64,
    reserved_tokens: u64,
    /// Bumped on every commit; orders ledger writes.
    revision: u64,
}

/// Point-in-time copy of the guard's counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub window: Option<NaiveDate>,
    pub used_tokens: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub calls: u64,
    pub reserved_tokens: u64,
    pub daily_token_quota: u64,
}

impl BudgetSnapshot {
    pub fn remaining_tokens(&self) -> u64 {
        self.daily_token_quota
            .saturating_sub(self.used_tokens + self.reserved_tokens)
    }
}

/// Alerts raised by a commit. Alerts never abort a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitOutcome {
    pub cost_usd: f64,
    pub cost_alert: bool,
    pub single_call_alert: bool,
}

pub type Clock = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

/// Shared budget guard. Wrap in `Arc` and hand one to every run.
pub struct BudgetGuard {
    config: BudgetConfig,
    state: Mutex<BudgetState>,
    ledger_path: Option<PathBuf>,
    /// Revision of the last snapshot written to the ledger.
    written: Mutex<u64>,
    clock: Clock,
}

impl std::fmt::Debug for BudgetGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetGuard")
            .field("config", &self.config)
            .field("ledger_path", &self.ledger_path)
            .finish_non_exhaustive()
    }
}

impl BudgetGuard {
    /// In-memory guard starting from zero usage.
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BudgetState::default()),
            ledger_path: None,
            written: Mutex::new(0),
            clock: Arc::new(|| Utc::now().date_naive()),
        }
    }

    /// Guard backed by a usage ledger file. The current day's counters are
    /// seeded from the file and flushed back after every commit.
    pub fn with_ledger(config: BudgetConfig, path: impl Into<PathBuf>) -> Self {
        Self {
            ledger_path: Some(path.into()),
            ..Self::new(config)
        }
    }

    /// Replace the day source (tests pin the date with this).
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BudgetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Roll the window to today, seeding from the ledger on a day change.
    fn roll(&self, state: &mut BudgetState) -> NaiveDate {
        let today = (self.clock)();
        if state.window == Some(today) {
            return today;
        }
        let seed = self.load_day(today).unwrap_or_default();
        debug!(
            window = %today,
            seeded_tokens = seed.tokens,
            seeded_calls = seed.calls,
            "budget window rolled"
        );
        *state = BudgetState {
            window: Some(today),
            used_tokens: seed.tokens,
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: seed.cost_usd,
            calls: seed.calls,
            reserved_tokens: 0,
            revision: state.revision,
        };
        today
    }

    fn load_day(&self, day: NaiveDate) -> Option<DayUsage> {
        let path = self.ledger_path.as_ref()?;
        match UsageLedger::load(path) {
            Ok(ledger) => ledger.day(day),
            Err(e) => {
                warn!(error = %e, "failed to read usage ledger; starting from zero");
                None
            }
        }
    }

    /// Write a committed snapshot. Called without the counter lock held;
    /// snapshots older than the last one written are dropped.
    fn flush(&self, day: NaiveDate, revision: u64, usage: DayUsage) {
        let Some(path) = self.ledger_path.as_ref() else {
            return;
        };
        let mut written = self.written.lock().unwrap_or_else(|e| e.into_inner());
        if revision <= *written {
            debug!(revision, written = *written, "stale ledger snapshot skipped");
            return;
        }
        let mut ledger = match UsageLedger::load(path) {
            Ok(ledger) => ledger,
            Err(e) => {
                warn!(error = %e, "usage ledger unreadable; rewriting");
                UsageLedger::default()
            }
        };
        ledger.set_day(day, usage);
        match ledger.save(path) {
            Ok(()) => *written = revision,
            Err(e) => warn!(error = %e, "failed to write usage ledger"),
        }
    }

    /// Check a call of `estimated_input` tokens against both ceilings and
    /// reserve its worst-case size if it fits.
    pub fn check_and_reserve(
        &self,
        estimated_input: u64,
    ) -> Result<Reservation<'_>, BudgetExceeded> {
        if estimated_input > self.config.max_input_tokens {
            return Err(BudgetExceeded::PerCallCeiling {
                estimated: estimated_input,
                limit: self.config.max_input_tokens,
            });
        }

        let requested = estimated_input + self.config.max_output_tokens;
        let mut state = self.lock();
        let window = self.roll(&mut state);
        if state.used_tokens + state.reserved_tokens + requested > self.config.daily_token_quota {
            return Err(BudgetExceeded::DailyQuota {
                used: state.used_tokens,
                reserved: state.reserved_tokens,
                requested,
                quota: self.config.daily_token_quota,
            });
        }
        state.reserved_tokens += requested;
        debug!(
            requested,
            used = state.used_tokens,
            reserved = state.reserved_tokens,
            "budget reserved"
        );
        Ok(Reservation {
            guard: self,
            tokens: requested,
            window,
            settled: false,
        })
    }

    fn settle(&self, tokens: u64, window: NaiveDate, usage: Option<(&TokenUsage, f64)>) -> CommitOutcome {
        let mut state = self.lock();
        let today = self.roll(&mut state);
        if window == today {
            state.reserved_tokens = state.reserved_tokens.saturating_sub(tokens);
        }
        let Some((usage, cost_usd)) = usage else {
            return CommitOutcome::default();
        };

        state.used_tokens += usage.total();
        state.input_tokens += usage.input_tokens;
        state.output_tokens += usage.output_tokens;
        state.cost_usd += cost_usd;
        state.calls += 1;
        state.revision += 1;

        let cost_alert = self
            .config
            .cost_alert_usd
            .is_some_and(|limit| state.cost_usd >= limit && limit > 0.0);
        let single_call_alert = self
            .config
            .single_call_cost_alert_usd
            .is_some_and(|limit| cost_usd > limit && limit > 0.0);
        if cost_alert {
            warn!(
                daily_cost_usd = state.cost_usd,
                limit = self.config.cost_alert_usd,
                "daily cost alert threshold reached"
            );
        }
        if single_call_alert {
            warn!(
                call_cost_usd = cost_usd,
                limit = self.config.single_call_cost_alert_usd,
                "single call cost alert threshold exceeded"
            );
        }

        let revision = state.revision;
        let day_usage = DayUsage {
            tokens: state.used_tokens,
            cost_usd: state.cost_usd,
            calls: state.calls,
        };
        drop(state);

        self.flush(today, revision, day_usage);
        CommitOutcome {
            cost_usd,
            cost_alert,
            single_call_alert,
        }
    }

    /// Commit usage that was not preceded by a reservation (e.g. replayed usage).
    pub fn commit(&self, usage: &TokenUsage, cost_usd: f64) -> CommitOutcome {
        let window = (self.clock)();
        self.settle(0, window, Some((usage, cost_usd)))
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let mut state = self.lock();
        self.roll(&mut state);
        BudgetSnapshot {
            window: state.window,
            used_tokens: state.used_tokens,
            input_tokens: state.input_tokens,
            output_tokens: state.output_tokens,
            cost_usd: state.cost_usd,
            calls: state.calls,
            reserved_tokens: state.reserved_tokens,
            daily_token_quota: self.config.daily_token_quota,
        }
    }
}

/// Headroom held for one in-flight call.
///
/// Exactly one of `commit` or `release` takes effect; dropping an unsettled
/// reservation releases it.
#[must_use = "a reservation is released when dropped"]
#[derive(Debug)]
pub struct Reservation<'a> {
    guard: &'a BudgetGuard,
    tokens: u64,
    window: NaiveDate,
    settled: bool,
}

impl Reservation<'_> {
    pub fn reserved_tokens(&self) -> u64 {
        self.tokens
    }

    /// Replace the reservation with actual usage.
    pub fn commit(mut self, usage: &TokenUsage, cost_usd: f64) -> CommitOutcome {
        self.settled = true;
        self.guard
            .settle(self.tokens, self.window, Some((usage, cost_usd)))
    }

    /// Return the reserved headroom without recording usage.
    pub fn release(mut self) {
        self.settled = true;
        self.guard.settle(self.tokens, self.window, None);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!(tokens = self.tokens, "unsettled reservation released on drop");
            self.guard.settle(self.tokens, self.window, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(quota: u64) -> BudgetConfig {
        BudgetConfig {
            max_input_tokens: 1_000,
            max_output_tokens: 100,
            daily_token_quota: quota,
            ..BudgetConfig::default()
        }
    }

    fn fixed_day(y: i32, m: u32, d: u32) -> Clock {
        let day = NaiveDate::from_ymd_opt(y, m, d).unwrap();
        Arc::new(move || day)
    }

    #[test]
    fn test_per_call_ceiling_rejects_without_reserving() {
        let guard = BudgetGuard::new(config(10_000));
        let err = guard.check_and_reserve(1_001).unwrap_err();
        assert_eq!(
            err,
            BudgetExceeded::PerCallCeiling {
                estimated: 1_001,
                limit: 1_000
            }
        );
        assert_eq!(guard.snapshot().reserved_tokens, 0);
    }

    #[test]
    fn test_reserve_holds_worst_case() {
        let guard = BudgetGuard::new(config(10_000));
        let reservation = guard.check_and_reserve(400).unwrap();
        assert_eq!(reservation.reserved_tokens(), 500);
        assert_eq!(guard.snapshot().reserved_tokens, 500);
        reservation.release();
        assert_eq!(guard.snapshot().reserved_tokens, 0);
    }

    #[test]
    fn test_commit_replaces_reservation_with_actual_usage() {
        let guard = BudgetGuard::new(config(10_000));
        let reservation = guard.check_and_reserve(400).unwrap();
        reservation.commit(&TokenUsage::new(380, 42), 0.0);
        let snap = guard.snapshot();
        assert_eq!(snap.reserved_tokens, 0);
        assert_eq!(snap.used_tokens, 422);
        assert_eq!(snap.calls, 1);
        assert_eq!(snap.remaining_tokens(), 10_000 - 422);
    }

    #[test]
    fn test_dropped_reservation_is_released() {
        let guard = BudgetGuard::new(config(10_000));
        {
            let _reservation = guard.check_and_reserve(400).unwrap();
            assert_eq!(guard.snapshot().reserved_tokens, 500);
        }
        let snap = guard.snapshot();
        assert_eq!(snap.reserved_tokens, 0);
        assert_eq!(snap.used_tokens, 0);
    }

    #[test]
    fn test_quota_counts_in_flight_reservations() {
        let guard = BudgetGuard::new(config(1_000));
        let first = guard.check_and_reserve(400).unwrap();
        let err = guard.check_and_reserve(450).unwrap_err();
        assert!(matches!(
            err,
            BudgetExceeded::DailyQuota {
                reserved: 500,
                requested: 550,
                ..
            }
        ));
        first.release();
        assert!(guard.check_and_reserve(450).is_ok());
    }

    #[test]
    fn test_exhausted_quota_rejects_everything() {
        let guard = BudgetGuard::new(config(1_000));
        guard.commit(&TokenUsage::new(900, 100), 0.0);
        assert!(matches!(
            guard.check_and_reserve(1),
            Err(BudgetExceeded::DailyQuota { used: 1_000, .. })
        ));
    }

    #[test]
    fn test_cost_alerts_do_not_block() {
        let mut cfg = config(100_000);
        cfg.cost_alert_usd = Some(0.5);
        cfg.single_call_cost_alert_usd = Some(0.3);
        let guard = BudgetGuard::new(cfg);

        let outcome = guard
            .check_and_reserve(10)
            .unwrap()
            .commit(&TokenUsage::new(10, 10), 0.2);
        assert!(!outcome.cost_alert);
        assert!(!outcome.single_call_alert);

        let outcome = guard
            .check_and_reserve(10)
            .unwrap()
            .commit(&TokenUsage::new(10, 10), 0.4);
        assert!(outcome.cost_alert);
        assert!(outcome.single_call_alert);

        assert!(guard.check_and_reserve(10).is_ok());
    }

    #[test]
    fn test_pricing_cost() {
        let pricing = Pricing {
            input_per_mtokens: 2.0,
            output_per_mtokens: 8.0,
        };
        let cost = pricing.cost_usd(&TokenUsage::new(1_000_000, 500_000));
        assert!((cost - 6.0).abs() < 1e-9);
        assert!(Pricing::default().is_zero());
    }

    #[test]
    fn test_window_rolls_over_at_day_change() {
        let day = Arc::new(Mutex::new(NaiveDate::from_ymd_opt(2026, 10, 16).unwrap()));
        let clock_day = Arc::clone(&day);
        let guard = BudgetGuard::new(config(1_000))
            .with_clock(Arc::new(move || *clock_day.lock().unwrap()));

        guard.commit(&TokenUsage::new(900, 100), 0.0);
        assert!(guard.check_and_reserve(1).is_err());

        *day.lock().unwrap() = NaiveDate::from_ymd_opt(2026, 10, 17).unwrap();
        let snap = guard.snapshot();
        assert_eq!(snap.used_tokens, 0);
        assert!(guard.check_and_reserve(1).is_ok());
    }

    #[test]
    fn test_ledger_reload_same_day() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.json");

        let first = BudgetGuard::with_ledger(config(10_000), &path)
            .with_clock(fixed_day(2026, 10, 16));
        first
            .check_and_reserve(100)
            .unwrap()
            .commit(&TokenUsage::new(100, 50), 0.01);

        let second = BudgetGuard::with_ledger(config(10_000), &path)
            .with_clock(fixed_day(2026, 10, 16));
        let snap = second.snapshot();
        assert_eq!(snap.used_tokens, 150);
        assert_eq!(snap.calls, 1);
        assert!((snap.cost_usd - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_ledger_ignored_for_other_day() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.json");

        let first = BudgetGuard::with_ledger(config(10_000), &path)
            .with_clock(fixed_day(2026, 10, 15));
        first.commit(&TokenUsage::new(700, 300), 0.0);

        let second = BudgetGuard::with_ledger(config(10_000), &path)
            .with_clock(fixed_day(2026, 10, 16));
        assert_eq!(second.snapshot().used_tokens, 0);

        let ledger = UsageLedger::load(&path).unwrap();
        assert_eq!(
            ledger
                .day(NaiveDate::from_ymd_opt(2026, 10, 15).unwrap())
                .unwrap()
                .tokens,
            1_000
        );
    }

    #[test]
    fn test_ledger_write_does_not_hold_counters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.json");
        let guard = Arc::new(
            BudgetGuard::with_ledger(config(10_000), &path).with_clock(fixed_day(2026, 10, 16)),
        );

        // Stall the ledger writer; the committing thread parks in flush.
        let writer = guard.written.lock().unwrap();
        let committer = {
            let guard = Arc::clone(&guard);
            std::thread::spawn(move || guard.commit(&TokenUsage::new(60, 40), 0.0))
        };
        while guard.snapshot().calls == 0 {
            std::thread::yield_now();
        }
        let reservation = guard.check_and_reserve(100).unwrap();
        assert_eq!(guard.snapshot().used_tokens, 100);
        reservation.release();
        drop(writer);
        committer.join().unwrap();

        let day = UsageLedger::load(&path)
            .unwrap()
            .day(NaiveDate::from_ymd_opt(2026, 10, 16).unwrap())
            .unwrap();
        assert_eq!(day.tokens, 100);
        assert_eq!(day.calls, 1);
    }

    #[test]
    fn test_stale_ledger_snapshot_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.json");
        let guard = BudgetGuard::with_ledger(config(10_000), &path);
        let day = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        let usage = |tokens| DayUsage {
            tokens,
            cost_usd: 0.0,
            calls: 1,
        };

        guard.flush(day, 2, usage(200));
        guard.flush(day, 1, usage(100));
        let ledger = UsageLedger::load(&path).unwrap();
        assert_eq!(ledger.day(day).unwrap().tokens, 200);
    }

    #[test]
    fn test_config_validate() {
        assert!(BudgetConfig::default().validate().is_ok());
        let bad = BudgetConfig {
            daily_token_quota: 0,
            ..BudgetConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = BudgetConfig {
            cost_alert_usd: Some(-1.0),
            ..BudgetConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
