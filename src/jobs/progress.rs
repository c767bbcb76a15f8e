// Phase progress reporting through the log

use std::sync::atomic::{AtomicU64, Ordering};
use serde::Serialize;
use crate::constants::PROGRESS_LOG_EVERY;

/// Snapshot of a phase's progress.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseProgress {
    pub phase: String,
    pub current: u64,
    pub total: u64,
    pub percent: f64,
}

impl PhaseProgress {
    pub fn new(phase: impl Into<String>, current: u64, total: u64) -> Self {
        let total_safe = total.max(1);
        let percent = (current as f64 / total_safe as f64) * 100.0;
        Self {
            phase: phase.into(),
            current,
            total,
            percent: percent.min(100.0),
        }
    }
}

/// Thread-safe counter that logs every `PROGRESS_LOG_EVERY` units and at the end.
#[derive(Debug)]
pub struct ProgressCounter {
    phase: String,
    total: u64,
    done: AtomicU64,
}

impl ProgressCounter {
    pub fn new(phase: impl Into<String>, total: usize) -> Self {
        Self {
            phase: phase.into(),
            total: total as u64,
            done: AtomicU64::new(0),
        }
    }

    pub fn tick(&self) -> PhaseProgress {
        let current = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        let progress = PhaseProgress::new(self.phase.clone(), current, self.total);
        if current % PROGRESS_LOG_EVERY == 0 || current == self.total {
            log::info!(
                "{}: {}/{} ({:.0}%)",
                progress.phase,
                progress.current,
                progress.total,
                progress.percent
            );
        }
        progress
    }

    pub fn done(&self) -> u64 {
        self.done.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_clamped() {
        assert_eq!(PhaseProgress::new("x", 5, 0).percent, 100.0);
        assert_eq!(PhaseProgress::new("x", 1, 4).percent, 25.0);
    }

    #[test]
    fn test_counter_ticks() {
        let counter = ProgressCounter::new("metadata", 3);
        counter.tick();
        let last = counter.tick();
        assert_eq!(last.current, 2);
        assert_eq!(counter.done(), 2);
    }
}
