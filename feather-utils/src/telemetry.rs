//! Scoped timings for layer setup and forward passes.
//!
//! Telemetry is off until [`configure`] turns it on. Timings go to the
//! `feather::telemetry` log target at the level the caller picks.

use std::{
    borrow::Cow,
    sync::atomic::{AtomicU8, Ordering},
    time::{Duration, Instant},
};

use log::{Level, LevelFilter, log, log_enabled};

const TARGET: &str = "feather::telemetry";

/// Most verbose level that telemetry emits; `0` means off.
static THRESHOLD: AtomicU8 = AtomicU8::new(0);

/// Logs the lifetime of a scope when dropped.
pub struct TimingGuard {
    label: Cow<'static, str>,
    start: Instant,
    level: Option<Level>,
}

impl TimingGuard {
    pub fn is_active(&self) -> bool {
        self.level.is_some()
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the clock without logging.
    pub fn finish(mut self) -> Duration {
        self.level = None;
        self.start.elapsed()
    }
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        if let Some(level) = self.level {
            let elapsed = self.start.elapsed();
            log!(target: TARGET, level, "{}: {:.3} ms", self.label, elapsed.as_secs_f64() * 1e3);
        }
    }
}

/// Start timing `label`; the guard is inert unless telemetry admits `level`.
pub fn timing_guard(label: impl Into<Cow<'static, str>>, level: Level) -> TimingGuard {
    let emits = telemetry_allows(level) && log_enabled!(target: TARGET, level);
    TimingGuard {
        label: label.into(),
        start: Instant::now(),
        level: emits.then_some(level),
    }
}

pub fn configure(enabled: bool, level: LevelFilter) {
    let threshold = if enabled { level as u8 } else { 0 };
    THRESHOLD.store(threshold, Ordering::Relaxed);
}

pub fn telemetry_allows(level: Level) -> bool {
    let threshold = THRESHOLD.load(Ordering::Relaxed);
    threshold != 0 && level as u8 <= threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    // Both cases share the global threshold, so they run in one test.
    #[test]
    fn threshold_follows_configuration() {
        configure(true, LevelFilter::Debug);
        assert!(telemetry_allows(Level::Info));
        assert!(telemetry_allows(Level::Debug));
        assert!(!telemetry_allows(Level::Trace));

        configure(false, LevelFilter::Trace);
        assert!(!telemetry_allows(Level::Error));
        let guard = timing_guard("idle", Level::Error);
        assert!(!guard.is_active());
        assert!(guard.finish() >= Duration::ZERO);
    }
}
