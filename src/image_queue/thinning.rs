//! Thinning planner
//!
//! Pure function of the queue index and policy; returns which sequences to
//! evict and why. The queue applies the plan.

use super::types::{EvictionReason, HealthBucket, QueueEntry};
use crate::config::QueueCameraConfig;
use chrono::{DateTime, Utc};

/// Occupancy ratio: the larger of the byte and count ratios
pub fn occupancy(count: usize, bytes: u64, config: &QueueCameraConfig) -> f64 {
    let by_count = count as f64 / config.max_files.max(1) as f64;
    let by_bytes = bytes as f64 / config.max_size_bytes().max(1) as f64;
    by_count.max(by_bytes)
}

pub fn bucket(ratio: f64, config: &QueueCameraConfig) -> HealthBucket {
    if ratio >= config.threshold_critical {
        HealthBucket::Critical
    } else if ratio >= config.threshold_degraded {
        HealthBucket::Degraded
    } else if ratio >= config.threshold_catching_up {
        HealthBucket::CatchingUp
    } else {
        HealthBucket::Normal
    }
}

/// Working view used while planning
struct Working<'a> {
    config: &'a QueueCameraConfig,
    entries: Vec<&'a QueueEntry>,
    bytes: u64,
    plan: Vec<(u64, EvictionReason)>,
}

impl<'a> Working<'a> {
    fn ratio(&self) -> f64 {
        occupancy(self.entries.len(), self.bytes, self.config)
    }

    fn over_hard_limit(&self) -> bool {
        self.entries.len() > self.config.max_files || self.bytes > self.config.max_size_bytes()
    }

    fn settled(&self) -> bool {
        !self.over_hard_limit() && self.ratio() < self.config.threshold_degraded
    }

    fn evict_at(&mut self, index: usize, reason: EvictionReason) {
        let entry = self.entries.remove(index);
        self.bytes -= entry.size_bytes;
        self.plan.push((entry.sequence, reason));
    }

    /// Oldest-first, ignoring protection; skips the in-flight image
    fn evict_oldest_until_settled(&mut self, in_flight: Option<u64>, reason: EvictionReason) {
        while !self.settled() {
            match self
                .entries
                .iter()
                .position(|e| Some(e.sequence) != in_flight)
            {
                Some(index) => self.evict_at(index, reason),
                None => break,
            }
        }
    }

    /// Indices outside the protected windows, oldest first
    fn unprotected(&self, in_flight: Option<u64>) -> Vec<usize> {
        let len = self.entries.len();
        let start = self.config.protect_oldest.min(len);
        let end = len.saturating_sub(self.config.protect_newest).max(start);
        (start..end)
            .filter(|&i| Some(self.entries[i].sequence) != in_flight)
            .collect()
    }

    /// Keep one, drop the next, oldest first; repeat passes until settled
    fn decimate_until_settled(&mut self, in_flight: Option<u64>) {
        while !self.settled() {
            let candidates = self.unprotected(in_flight);
            if candidates.is_empty() {
                break;
            }

            let picks: Vec<usize> = if candidates.len() == 1 {
                candidates
            } else {
                candidates.into_iter().skip(1).step_by(2).collect()
            };

            // Remove from the back so earlier indices stay valid, but decide in
            // oldest-first order so the pass stops as soon as it is enough.
            let mut chosen = Vec::new();
            let mut count = self.entries.len();
            let mut bytes = self.bytes;
            for index in picks {
                let still_needed = count > self.config.max_files
                    || bytes > self.config.max_size_bytes()
                    || occupancy(count, bytes, self.config) >= self.config.threshold_degraded;
                if !still_needed {
                    break;
                }
                count -= 1;
                bytes -= self.entries[index].size_bytes;
                chosen.push(index);
            }

            for index in chosen.into_iter().rev() {
                self.evict_at(index, EvictionReason::Thinned);
            }
        }
    }
}

/// Plan evictions for one queue
///
/// 1. Expired images always go.
/// 2. Critical occupancy: oldest-first ignoring protection until below degraded.
/// 3. Degraded occupancy or a hard limit exceeded: decimate the unprotected
///    middle until below degraded and within hard limits.
/// 4. Below degraded: nothing else.
///
/// If protection leaves the queue over a hard limit, the oldest images go
/// regardless (`HardLimit`).
pub fn plan(
    entries: &[QueueEntry],
    in_flight: Option<u64>,
    config: &QueueCameraConfig,
    now: DateTime<Utc>,
) -> Vec<(u64, EvictionReason)> {
    let mut working = Working {
        config,
        entries: entries.iter().collect(),
        bytes: entries.iter().map(|e| e.size_bytes).sum(),
        plan: Vec::new(),
    };

    if let Some(max_age) = config.max_age() {
        let cutoff = now - max_age;
        let expired: Vec<usize> = working
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.captured_at < cutoff && Some(e.sequence) != in_flight)
            .map(|(i, _)| i)
            .collect();
        for index in expired.into_iter().rev() {
            working.evict_at(index, EvictionReason::Expired);
        }
    }

    match bucket(working.ratio(), config) {
        HealthBucket::Critical => {
            working.evict_oldest_until_settled(in_flight, EvictionReason::Critical);
        }
        HealthBucket::Degraded => working.decimate_until_settled(in_flight),
        _ if working.over_hard_limit() => working.decimate_until_settled(in_flight),
        _ => {}
    }

    if working.over_hard_limit() {
        working.evict_oldest_until_settled(in_flight, EvictionReason::HardLimit);
    }

    // Expired entries were pushed newest-first; report in sequence order
    working.plan.sort_by_key(|(seq, _)| *seq);
    working.plan
}
