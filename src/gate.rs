//! Alert gating: active-hour windows plus a post-alert cooldown.
//!
//! `AlertGate` is the only place that decides whether a uniform match may turn
//! into an outbound alert. Time is read through the `Clock` trait so tests can
//! drive arbitrary timelines.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Local, Timelike};
use regex::Regex;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(900);
const MINUTES_PER_DAY: u16 = 24 * 60;

// ----------------------------------------------------------------------------
// Clock
// ----------------------------------------------------------------------------

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

/// Local wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Settable clock shared between a test and the components under test.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Local>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Local>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, at: DateTime<Local>) {
        if let Ok(mut now) = self.now.lock() {
            *now = at;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            if let Ok(delta) = ChronoDuration::from_std(by) {
                *now += delta;
            }
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Local> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> DateTime<Local> {
        (**self).now()
    }
}

// ----------------------------------------------------------------------------
// TimeWindow
// ----------------------------------------------------------------------------

/// Daily active window in minutes since midnight, both ends inclusive.
/// Windows never cross midnight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeWindow {
    start_minute: u16,
    end_minute: u16,
}

fn window_regex() -> &'static Regex {
    static WINDOW_RE: OnceLock<Regex> = OnceLock::new();
    WINDOW_RE.get_or_init(|| {
        Regex::new(r"^\s*(\d{1,2}):(\d{2})\s*-\s*(\d{1,2}):(\d{2})\s*$").unwrap()
    })
}

impl TimeWindow {
    pub fn new(start_minute: u16, end_minute: u16) -> Result<Self> {
        if start_minute >= MINUTES_PER_DAY || end_minute >= MINUTES_PER_DAY {
            return Err(anyhow!(
                "time window minutes must be within 0-1439, got {}-{}",
                start_minute,
                end_minute
            ));
        }
        if start_minute > end_minute {
            return Err(anyhow!(
                "time window start {} is after end {} (windows cannot cross midnight)",
                format_minute(start_minute),
                format_minute(end_minute)
            ));
        }
        Ok(Self {
            start_minute,
            end_minute,
        })
    }

    pub fn from_hm(start: (u16, u16), end: (u16, u16)) -> Result<Self> {
        if start.1 >= 60 || end.1 >= 60 {
            return Err(anyhow!("time window minutes must be below 60"));
        }
        Self::new(start.0 * 60 + start.1, end.0 * 60 + end.1)
    }

    /// Parse `"HH:MM-HH:MM"`.
    pub fn parse(value: &str) -> Result<Self> {
        let caps = window_regex()
            .captures(value)
            .ok_or_else(|| anyhow!("time window must look like HH:MM-HH:MM, got {:?}", value))?;
        let field = |i: usize| -> Result<u16> {
            caps[i]
                .parse::<u16>()
                .with_context(|| format!("invalid number in time window {:?}", value))
        };
        let (sh, sm, eh, em) = (field(1)?, field(2)?, field(3)?, field(4)?);
        if sh >= 24 || eh >= 24 {
            return Err(anyhow!("time window hours must be below 24, got {:?}", value));
        }
        Self::from_hm((sh, sm), (eh, em))
    }

    pub fn start_minute(&self) -> u16 {
        self.start_minute
    }

    pub fn end_minute(&self) -> u16 {
        self.end_minute
    }

    pub fn contains(&self, minute_of_day: u16) -> bool {
        self.start_minute <= minute_of_day && minute_of_day <= self.end_minute
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            format_minute(self.start_minute),
            format_minute(self.end_minute)
        )
    }
}

fn format_minute(minute: u16) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

pub fn minute_of_day(at: &DateTime<Local>) -> u16 {
    (at.hour() * 60 + at.minute()) as u16
}

// ----------------------------------------------------------------------------
// AlertGate
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateState {
    /// Outside every active window.
    Dormant,
    /// Inside a window and the cooldown has elapsed.
    Armed,
    /// Inside a window, cooldown still running.
    Cooling,
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GateState::Dormant => "DORMANT",
            GateState::Armed => "ARMED",
            GateState::Cooling => "COOLING",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FireDecision {
    Fire { at: DateTime<Local> },
    Suppressed(GateState),
}

pub struct AlertGate<C: Clock> {
    windows: Vec<TimeWindow>,
    cooldown: Duration,
    clock: C,
    state: GateState,
    last_alert: Option<DateTime<Local>>,
}

impl<C: Clock> AlertGate<C> {
    pub fn new(windows: Vec<TimeWindow>, cooldown: Duration, clock: C) -> Self {
        let mut gate = Self {
            windows,
            cooldown,
            clock,
            state: GateState::Dormant,
            last_alert: None,
        };
        gate.evaluate();
        gate
    }

    /// Recompute the state from the clock.
    pub fn evaluate(&mut self) -> GateState {
        let now = self.clock.now();
        self.state = self.state_at(&now);
        self.state
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn last_alert(&self) -> Option<DateTime<Local>> {
        self.last_alert
    }

    pub fn windows(&self) -> &[TimeWindow] {
        &self.windows
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Ask for permission to dispatch. Only an armed gate grants it; granting
    /// starts the cooldown immediately.
    pub fn try_fire(&mut self) -> FireDecision {
        let now = self.clock.now();
        let state = self.state_at(&now);
        self.state = state;
        if state != GateState::Armed {
            return FireDecision::Suppressed(state);
        }
        self.last_alert = Some(now);
        self.state = GateState::Cooling;
        FireDecision::Fire { at: now }
    }

    /// Time left before the gate can arm again. Zero when no alert is pending.
    pub fn cooldown_remaining(&self) -> Duration {
        let Some(last) = self.last_alert else {
            return Duration::ZERO;
        };
        self.cooldown.saturating_sub(self.elapsed_since(&last, &self.clock.now()))
    }

    fn state_at(&self, now: &DateTime<Local>) -> GateState {
        let minute = minute_of_day(now);
        if !self.windows.iter().any(|w| w.contains(minute)) {
            return GateState::Dormant;
        }
        match self.last_alert {
            None => GateState::Armed,
            Some(last) if self.elapsed_since(&last, now) >= self.cooldown => GateState::Armed,
            Some(_) => GateState::Cooling,
        }
    }

    fn elapsed_since(&self, last: &DateTime<Local>, now: &DateTime<Local>) -> Duration {
        // a clock that moved backwards counts as no time elapsed
        (*now - *last).to_std().unwrap_or(Duration::ZERO)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 3, 2, h, m, s).unwrap()
    }

    fn morning_gate(clock: ManualClock) -> AlertGate<ManualClock> {
        AlertGate::new(
            vec![TimeWindow::parse("10:00-12:00").unwrap()],
            DEFAULT_COOLDOWN,
            clock,
        )
    }

    #[test]
    fn window_boundaries_are_inclusive() {
        let window = TimeWindow::parse("10:00-12:00").unwrap();
        assert!(!window.contains(9 * 60 + 59));
        assert!(window.contains(10 * 60));
        assert!(window.contains(12 * 60));
        assert!(!window.contains(12 * 60 + 1));
    }

    #[test]
    fn window_parse_rejects_bad_input() {
        assert!(TimeWindow::parse("12:00-10:00").is_err());
        assert!(TimeWindow::parse("24:00-25:00").is_err());
        assert!(TimeWindow::parse("10:60-11:00").is_err());
        assert!(TimeWindow::parse("ten to noon").is_err());
        assert_eq!(
            TimeWindow::parse(" 14:30 - 16:00 ").unwrap().to_string(),
            "14:30-16:00"
        );
    }

    #[test]
    fn initial_state_follows_clock() {
        let clock = ManualClock::new(at(9, 0, 0));
        let gate = morning_gate(clock.clone());
        assert_eq!(gate.state(), GateState::Dormant);

        let gate = morning_gate(ManualClock::new(at(10, 0, 0)));
        assert_eq!(gate.state(), GateState::Armed);
    }

    #[test]
    fn dormant_gate_suppresses() {
        let clock = ManualClock::new(at(12, 1, 0));
        let mut gate = morning_gate(clock);
        assert_eq!(
            gate.try_fire(),
            FireDecision::Suppressed(GateState::Dormant)
        );
        assert!(gate.last_alert().is_none());
    }

    #[test]
    fn cooldown_blocks_until_elapsed() {
        let clock = ManualClock::new(at(10, 0, 0));
        let mut gate = morning_gate(clock.clone());

        assert!(matches!(gate.try_fire(), FireDecision::Fire { .. }));
        assert_eq!(gate.state(), GateState::Cooling);

        clock.advance(Duration::from_secs(899));
        assert_eq!(
            gate.try_fire(),
            FireDecision::Suppressed(GateState::Cooling)
        );
        assert_eq!(gate.cooldown_remaining(), Duration::from_secs(1));

        clock.advance(Duration::from_secs(2));
        assert_eq!(gate.evaluate(), GateState::Armed);
        assert_eq!(
            gate.try_fire(),
            FireDecision::Fire {
                at: at(10, 15, 1)
            }
        );
    }

    #[test]
    fn leaving_window_overrides_cooldown() {
        let clock = ManualClock::new(at(11, 59, 0));
        let mut gate = morning_gate(clock.clone());
        assert!(matches!(gate.try_fire(), FireDecision::Fire { .. }));
        clock.set(at(12, 1, 0));
        assert_eq!(gate.evaluate(), GateState::Dormant);
    }

    #[test]
    fn backwards_clock_counts_as_no_elapsed_time() {
        let clock = ManualClock::new(at(11, 0, 0));
        let mut gate = morning_gate(clock.clone());
        assert!(matches!(gate.try_fire(), FireDecision::Fire { .. }));
        clock.set(at(10, 30, 0));
        assert_eq!(gate.evaluate(), GateState::Cooling);
        assert_eq!(gate.cooldown_remaining(), DEFAULT_COOLDOWN);
    }
}
