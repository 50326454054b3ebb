//! Frame accounting for the delivery thread, plus recording backlog warnings.

use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Writer backlog, in frames, at which a warning is logged. Two seconds at 30 fps.
pub const BACKLOG_WARN_FRAMES: usize = 60;

/// Per-second rates for one reporting window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameRates {
    pub presented: f32,
    pub dropped: f32,
    pub recorded: f32,
    /// Largest writer backlog seen in the window
    pub peak_backlog: usize,
}

/// Counts what happened to delivered frames and reports rates once per interval.
#[derive(Debug, Clone)]
pub struct FrameStats {
    presented: u32,
    dropped: u32,
    recorded: u32,
    window_start: Instant,
    interval: Duration,
    totals: (u64, u64, u64),
    peak_backlog: usize,
    backlog_warned: bool,
}

impl FrameStats {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(start: Instant) -> Self {
        Self {
            presented: 0,
            dropped: 0,
            recorded: 0,
            window_start: start,
            interval: Duration::from_secs(1),
            totals: (0, 0, 0),
            peak_backlog: 0,
            backlog_warned: false,
        }
    }

    pub fn presented(&mut self) {
        self.presented += 1;
        self.totals.0 += 1;
    }

    /// A frame that reached the coordinator but was not shown.
    pub fn dropped(&mut self) {
        self.dropped += 1;
        self.totals.1 += 1;
    }

    pub fn recorded(&mut self) {
        self.recorded += 1;
        self.totals.2 += 1;
    }

    /// Notes how many frames the recording writer has yet to append.
    ///
    /// Warns once when the depth reaches [`BACKLOG_WARN_FRAMES`] and again only
    /// after it has fallen below half of that.
    pub fn record_backlog(&mut self, depth: usize) {
        self.peak_backlog = self.peak_backlog.max(depth);
        if depth >= BACKLOG_WARN_FRAMES && !self.backlog_warned {
            warn!(
                depth,
                "Recording writer is falling behind; queued frames are held in memory"
            );
            self.backlog_warned = true;
        } else if depth < BACKLOG_WARN_FRAMES / 2 && self.backlog_warned {
            info!(depth, "Recording writer caught up");
            self.backlog_warned = false;
        }
    }

    pub fn backlog_warned(&self) -> bool {
        self.backlog_warned
    }

    /// Closes the window if `interval` has passed, logging and returning its rates.
    pub fn tick(&mut self, now: Instant) -> Option<FrameRates> {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.interval {
            return None;
        }
        let secs = elapsed.as_secs_f32();
        let rates = FrameRates {
            presented: self.presented as f32 / secs,
            dropped: self.dropped as f32 / secs,
            recorded: self.recorded as f32 / secs,
            peak_backlog: self.peak_backlog,
        };
        debug!(
            "[Perf] presented {:.2} fps, dropped {:.2} fps, recorded {:.2} fps, writer backlog {}",
            rates.presented, rates.dropped, rates.recorded, rates.peak_backlog
        );
        self.peak_backlog = 0;
        self.presented = 0;
        self.dropped = 0;
        self.recorded = 0;
        self.window_start = now;
        Some(rates)
    }

    /// Lifetime counts as (presented, dropped, recorded).
    pub fn totals(&self) -> (u64, u64, u64) {
        self.totals
    }
}

impl Default for FrameStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_once_per_interval() {
        let start = Instant::now();
        let mut stats = FrameStats::starting_at(start);
        for _ in 0..30 {
            stats.presented();
            stats.recorded();
        }
        stats.dropped();

        assert_eq!(stats.tick(start + Duration::from_millis(500)), None);
        let rates = stats.tick(start + Duration::from_secs(1)).unwrap();
        assert_eq!(rates.presented, 30.0);
        assert_eq!(rates.dropped, 1.0);
        assert_eq!(rates.recorded, 30.0);

        // window restarts empty
        let rates = stats.tick(start + Duration::from_secs(2)).unwrap();
        assert_eq!(rates.presented, 0.0);
        assert_eq!(stats.totals(), (30, 1, 30));
    }

    #[test]
    fn backlog_warning_rearms_after_the_writer_catches_up() {
        let start = Instant::now();
        let mut stats = FrameStats::starting_at(start);
        stats.record_backlog(BACKLOG_WARN_FRAMES - 1);
        assert!(!stats.backlog_warned());

        stats.record_backlog(BACKLOG_WARN_FRAMES);
        assert!(stats.backlog_warned());
        // still behind, but not yet halfway drained
        stats.record_backlog(BACKLOG_WARN_FRAMES / 2);
        assert!(stats.backlog_warned());
        stats.record_backlog(BACKLOG_WARN_FRAMES / 2 - 1);
        assert!(!stats.backlog_warned());

        let rates = stats.tick(start + Duration::from_secs(1)).unwrap();
        assert_eq!(rates.peak_backlog, BACKLOG_WARN_FRAMES);
        let rates = stats.tick(start + Duration::from_secs(2)).unwrap();
        assert_eq!(rates.peak_backlog, 0);
    }
}
