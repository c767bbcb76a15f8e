// Job plumbing: cancellation, worker identity and the bounded worker pool

pub mod progress;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use rayon::prelude::*;
use crate::error::{MigrateError, Result};

/// Shared cancel flag. Set by the interrupt handler, checked by phases
/// between units; the unit in flight always finishes.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Route Ctrl-C to the flag. A second Ctrl-C exits immediately.
pub fn install_interrupt_handler(flag: &CancelFlag) -> Result<()> {
    let flag = flag.clone();
    ctrlc::set_handler(move || {
        if flag.is_cancelled() {
            log::warn!("Second interrupt, exiting without waiting");
            std::process::exit(crate::constants::EXIT_INTERRUPTED);
        }
        log::warn!("Interrupt received, finishing current work before stopping");
        flag.request_cancel();
    })
    .map_err(|e| MigrateError::Other(format!("Failed to install interrupt handler: {}", e)))
}

/// Identity of this process, written into the state lock.
pub fn get_worker_id() -> String {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let pid = std::process::id();
    format!("{}:{}", hostname, pid)
}

/// Run `work` over `items` on at most `workers` threads. Items not started
/// before cancellation yield None. Results keep input order.
pub fn run_bounded<T, R, F>(workers: usize, items: &[T], cancel: &CancelFlag, work: F) -> Result<Vec<Option<R>>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync + Send,
{
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|i| format!("takeout-worker-{}", i))
        .build()
        .map_err(|e| MigrateError::Other(format!("Failed to start worker pool: {}", e)))?;

    Ok(pool.install(|| {
        items
            .par_iter()
            .map(|item| {
                if cancel.is_cancelled() {
                    None
                } else {
                    Some(work(item))
                }
            })
            .collect()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_cancel_flag_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!flag.is_cancelled());
        clone.request_cancel();
        assert!(flag.is_cancelled());
    }

    #[test]
    fn test_worker_id_has_pid() {
        let id = get_worker_id();
        assert!(id.ends_with(&format!(":{}", std::process::id())));
    }

    #[test]
    fn test_run_bounded_keeps_order() {
        let items: Vec<u32> = (0..50).collect();
        let out = run_bounded(4, &items, &CancelFlag::new(), |n| n * 2).unwrap();
        let values: Vec<u32> = out.into_iter().map(|v| v.unwrap()).collect();
        assert_eq!(values, (0..50).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_run_bounded_cancelled_skips_all() {
        let flag = CancelFlag::new();
        flag.request_cancel();
        let calls = AtomicUsize::new(0);
        let out = run_bounded(2, &[1, 2, 3], &flag, |_| calls.fetch_add(1, Ordering::SeqCst)).unwrap();
        assert!(out.iter().all(Option::is_none));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
