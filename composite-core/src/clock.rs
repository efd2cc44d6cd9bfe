//! Clock offset estimation and latency smoothing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::protocol::{LATENCY_WINDOW, SYNC_SAMPLES};

/// Wall-clock source in milliseconds since the Unix epoch.
pub trait Clock: Send {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicI64>);

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        ManualClock(Arc::new(AtomicI64::new(start_ms)))
    }

    pub fn set(&self, ms: i64) {
        self.0.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// One-way latency estimate from a round trip: `round((now - sent) * 0.5)`, halves rounded up.
pub fn half_round_trip(now_ms: i64, sent_ms: i64) -> i64 {
    (now_ms - sent_ms + 1).div_euclid(2)
}

/// Accumulates time-difference samples for one sync attempt.
#[derive(Debug, Clone, Default)]
pub struct ClockSync {
    samples: Vec<i64>,
}

impl ClockSync {
    pub fn new() -> Self {
        Self {
            samples: Vec::with_capacity(SYNC_SAMPLES),
        }
    }

    /// Record one sample. Returns the median once exactly `SYNC_SAMPLES` are in.
    pub fn record(&mut self, difference: i64) -> Option<i64> {
        self.samples.push(difference);
        if self.samples.len() < SYNC_SAMPLES {
            return None;
        }
        self.samples.sort_unstable();
        Some(self.samples[SYNC_SAMPLES / 2])
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Most-recent-first latency samples, capped at `LATENCY_WINDOW`.
#[derive(Debug, Clone, Default)]
pub struct LatencyWindow {
    samples: VecDeque<i64>,
}

impl LatencyWindow {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(LATENCY_WINDOW + 1),
        }
    }

    pub fn record(&mut self, latency_ms: i64) {
        self.samples.push_front(latency_ms);
        self.samples.truncate(LATENCY_WINDOW);
    }

    /// Floor of the mean of the window; `None` while empty.
    pub fn latency(&self) -> Option<i64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: i64 = self.samples.iter().sum();
        Some(sum.div_euclid(self.samples.len() as i64))
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
