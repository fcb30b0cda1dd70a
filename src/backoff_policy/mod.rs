//! BackoffPolicy - Failure-driven pacing per camera
//!
//! ## Responsibilities
//!
//! - Exponential backoff delay from consecutive failures
//! - Degraded mode gate (slow cadence, capped limiter permits)
//! - Capture pause gate (queue back-pressure)
//!
//! ## Design
//!
//! - Pure state machines, no I/O and no clocks beyond timestamps for status
//! - Hysteresis: degraded mode exits only on success; pause exits only below
//!   the resume threshold

use crate::config::{BackoffConfig, DegradedModeConfig, MAX_DELAY_SECONDS};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::time::Duration;

/// Un-jittered delay after the `failures`-th consecutive failure
///
/// `min(initial * multiplier^(failures - 1), max)`; zero failures means no delay.
pub fn delay_for(config: &BackoffConfig, failures: u32) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let exponent = (failures - 1).min(i32::MAX as u32) as i32;
    let seconds = (config.initial_seconds * config.multiplier.powi(exponent)).min(config.max_seconds);
    bounded_secs(seconds)
}

/// Seconds to a `Duration`, clamped to one day; non-finite input maps to the cap
fn bounded_secs(seconds: f64) -> Duration {
    let cap = Duration::from_secs(MAX_DELAY_SECONDS);
    if seconds.is_nan() {
        return cap;
    }
    Duration::try_from_secs_f64(seconds.max(0.0)).map_or(cap, |d| d.min(cap))
}

/// Spread a delay uniformly over ±50%, never above `max_seconds`
pub fn jittered(config: &BackoffConfig, delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let factor: f64 = rand::thread_rng().gen_range(0.5..=1.5);
    let seconds = (delay.as_secs_f64() * factor).min(config.max_seconds);
    bounded_secs(seconds)
}

/// Backoff state for one failure-prone path (capture or upload)
#[derive(Debug, Clone)]
pub struct BackoffState {
    config: BackoffConfig,
    consecutive_failures: u32,
    current_delay: Duration,
    last_failure_at: Option<DateTime<Utc>>,
}

impl BackoffState {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            consecutive_failures: 0,
            current_delay: Duration::ZERO,
            last_failure_at: None,
        }
    }

    /// Register a failure and return the delay to wait before the next attempt
    pub fn record_failure(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let base = delay_for(&self.config, self.consecutive_failures);
        self.current_delay = if self.config.jitter {
            jittered(&self.config, base)
        } else {
            base
        };
        self.last_failure_at = Some(Utc::now());
        self.current_delay
    }

    /// Any success clears the failure streak
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.current_delay = Duration::ZERO;
    }

    /// Force a specific hold-off (e.g. after an auth failure) without
    /// touching the failure streak
    pub fn hold_for(&mut self, delay: Duration) {
        self.current_delay = delay;
        self.last_failure_at = Some(Utc::now());
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_backing_off(&self) -> bool {
        !self.current_delay.is_zero()
    }

    /// Delay currently in force (zero when healthy)
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Un-jittered delay the next failure would produce
    pub fn next_delay(&self) -> Duration {
        delay_for(&self.config, self.consecutive_failures.saturating_add(1))
    }

    pub fn last_failure_at(&self) -> Option<DateTime<Utc>> {
        self.last_failure_at
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

/// Degraded mode transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradedTransition {
    Entered,
    Exited,
}

/// Degraded mode gate for one camera
#[derive(Debug, Clone)]
pub struct DegradedModeState {
    config: DegradedModeConfig,
    active: bool,
    entered_at: Option<DateTime<Utc>>,
}

impl DegradedModeState {
    pub fn new(config: DegradedModeConfig) -> Self {
        Self {
            config,
            active: false,
            entered_at: None,
        }
    }

    /// Feed the current consecutive-failure count after a failure
    pub fn on_failure(&mut self, consecutive_failures: u32) -> Option<DegradedTransition> {
        if !self.config.enabled || self.active {
            return None;
        }
        if consecutive_failures >= self.config.failure_threshold {
            self.active = true;
            self.entered_at = Some(Utc::now());
            return Some(DegradedTransition::Entered);
        }
        None
    }

    pub fn on_success(&mut self) -> Option<DegradedTransition> {
        if self.active {
            self.active = false;
            self.entered_at = None;
            return Some(DegradedTransition::Exited);
        }
        None
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn entered_at(&self) -> Option<DateTime<Utc>> {
        self.entered_at
    }

    /// Capture interval after applying the slow factor
    pub fn effective_interval(&self, base: Duration) -> Duration {
        if self.active {
            Duration::try_from_secs_f64(base.as_secs_f64() * self.config.slow_interval_multiplier)
                .unwrap_or(base)
        } else {
            base
        }
    }

    /// Limiter permits this camera may hold at once
    pub fn permit_cap(&self, normal: usize) -> usize {
        if self.active {
            self.config.concurrency_limit.min(normal).max(1)
        } else {
            normal
        }
    }
}

/// Capture pause transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseTransition {
    Paused,
    Resumed,
}

/// Why capture was paused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// Camera queue reached the critical bucket
    QueueCritical,
    /// System ceiling rejected the enqueue
    QueueFull,
}

/// Two-threshold back-pressure valve
#[derive(Debug, Clone, Default)]
pub struct PauseGate {
    paused: Option<(PauseReason, DateTime<Utc>)>,
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.is_some()
    }

    pub fn reason(&self) -> Option<PauseReason> {
        self.paused.map(|(reason, _)| reason)
    }

    pub fn paused_since(&self) -> Option<DateTime<Utc>> {
        self.paused.map(|(_, since)| since)
    }

    /// Enter the paused state; no-op if already paused
    pub fn pause(&mut self, reason: PauseReason) -> Option<PauseTransition> {
        if self.paused.is_some() {
            return None;
        }
        self.paused = Some((reason, Utc::now()));
        Some(PauseTransition::Paused)
    }

    /// Resume once occupancy is below `resume_threshold` and the system has room
    pub fn evaluate(
        &mut self,
        occupancy: f64,
        resume_threshold: f64,
        system_has_room: bool,
    ) -> Option<PauseTransition> {
        if self.paused.is_some() && occupancy < resume_threshold && system_has_room {
            self.paused = None;
            return Some(PauseTransition::Resumed);
        }
        None
    }
}
