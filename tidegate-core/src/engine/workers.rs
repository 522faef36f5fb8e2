//! Worker thread pool.
//!
//! A fixed set of named OS threads, optionally pinned to CPU cores. The
//! pool only spawns and joins; the work loop itself is the closure the
//! engine hands in, which drains the ready-event queue until it
//! disconnects.

use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Outcome of pinning a worker to a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinningResult {
    /// Pinned to the requested core.
    Success,

    /// Pinned, but to a different core than requested.
    SuccessDifferentCore(usize),

    /// Pinning is unavailable on this platform.
    Unsupported,

    /// The pinning call failed.
    Failed,
}

/// A fixed pool of worker threads.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `count` threads named `{name}-{index}`, each running
    /// `work(index)`. With `pin` set, thread `i` is pinned to core
    /// `i % cores`.
    pub fn spawn<F>(name: &str, count: usize, pin: bool, work: F) -> std::io::Result<Self>
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let work = std::sync::Arc::new(work);
        let mut handles = Vec::with_capacity(count);

        for index in 0..count {
            let work = work.clone();
            let thread_name = format!("{}-{}", name, index);
            let handle = thread::Builder::new().name(thread_name.clone()).spawn(
                move || {
                    if pin {
                        let result = pin_to_core(index);
                        if result == PinningResult::Failed {
                            warn!(thread = %thread_name, core = index, "thread pinning failed");
                        }
                    }
                    debug!(thread = %thread_name, "worker started");
                    work(index);
                    debug!(thread = %thread_name, "worker exiting");
                },
            )?;
            handles.push(handle);
        }

        Ok(Self { handles })
    }

    /// Number of threads in the pool.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// True for an empty pool.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Blocks until every worker thread has terminated.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

/// Attempts to pin the current thread to `core_id`, falling back to
/// `core_id % cores` when the requested core does not exist.
fn pin_to_core(core_id: usize) -> PinningResult {
    match core_affinity::get_core_ids() {
        Some(core_ids) if !core_ids.is_empty() => {
            if let Some(core) = core_ids.get(core_id) {
                if core_affinity::set_for_current(*core) {
                    PinningResult::Success
                } else {
                    PinningResult::Failed
                }
            } else {
                let fallback = core_id % core_ids.len();
                if core_affinity::set_for_current(core_ids[fallback]) {
                    PinningResult::SuccessDifferentCore(fallback)
                } else {
                    PinningResult::Failed
                }
            }
        }
        _ => PinningResult::Unsupported,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_pool_runs_every_worker() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();

        let pool = WorkerPool::spawn("test-worker", 4, false, move |_index| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert_eq!(pool.len(), 4);
        pool.join();
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_worker_receives_its_index() {
        let sum = Arc::new(AtomicUsize::new(0));
        let seen = sum.clone();

        let pool = WorkerPool::spawn("test-idx", 3, false, move |index| {
            seen.fetch_add(index + 1, Ordering::SeqCst);
        })
        .unwrap();
        pool.join();

        // 1 + 2 + 3
        assert_eq!(sum.load(Ordering::SeqCst), 6);
    }
}
