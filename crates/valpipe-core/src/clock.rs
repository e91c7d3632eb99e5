use std::time::{Duration, Instant};

/// Wall-clock run timer. Callers pass `now` so the clock can be driven from
/// a paused runtime in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ElapsedClock {
    started_at: Option<Instant>,
    stopped_at: Option<Instant>,
}

impl ElapsedClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restart from zero.
    pub fn start(&mut self, now: Instant) {
        self.started_at = Some(now);
        self.stopped_at = None;
    }

    /// Freeze at the current value. No-op when not running.
    pub fn stop(&mut self, now: Instant) {
        if self.is_running() {
            self.stopped_at = Some(now);
        }
    }

    pub fn reset(&mut self) {
        self.started_at = None;
        self.stopped_at = None;
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some() && self.stopped_at.is_none()
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        match (self.started_at, self.stopped_at) {
            (Some(start), Some(stop)) => stop.saturating_duration_since(start),
            (Some(start), None) => now.saturating_duration_since(start),
            (None, _) => Duration::ZERO,
        }
    }

    pub fn elapsed_secs(&self, now: Instant) -> u64 {
        self.elapsed(now).as_secs()
    }
}
