//! Bounded worker pool for independent engine invocations
//!
//! Optimizer candidates, walk-forward windows and Monte Carlo runs are all
//! "units": independent, read-only over the shared bars, each with its own
//! deterministically seeded RNG. Cancellation and the batch deadline are
//! checked between units, never inside one.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// RNG seed for unit `index` of a batch seeded with `seed`
pub fn unit_seed(seed: u64, index: usize) -> u64 {
    seed.wrapping_add(index as u64)
}

/// Independent RNG stream for unit `index`
pub fn unit_rng(seed: u64, index: usize) -> StdRng {
    StdRng::seed_from_u64(unit_seed(seed, index))
}

/// Shared cancel flag, deadline and progress counters for one batch
#[derive(Debug)]
pub struct BatchControl {
    /// Shared with every child control
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
    total: AtomicU32,
    completed: AtomicU32,
}

impl BatchControl {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: None,
            total: AtomicU32::new(0),
            completed: AtomicU32::new(0),
        }
    }

    /// Control whose whole batch must finish within `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            ..Self::new()
        }
    }

    /// Control for a batch nested inside this one: cancelling either cancels
    /// both and the deadline is the same, but progress is counted separately
    pub fn child(&self) -> Arc<BatchControl> {
        Arc::new(Self {
            cancelled: Arc::clone(&self.cancelled),
            deadline: self.deadline,
            total: AtomicU32::new(0),
            completed: AtomicU32::new(0),
        })
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn timed_out(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// True once no further units should start
    pub fn should_stop(&self) -> bool {
        self.is_cancelled() || self.timed_out()
    }

    pub fn add_total(&self, units: usize) {
        self.total.fetch_add(units as u32, Ordering::Relaxed);
    }

    pub fn mark_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u32 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u32 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Get progress as percentage
    pub fn progress_pct(&self) -> f32 {
        let total = self.total();
        let done = self.completed();
        if total == 0 {
            0.0
        } else {
            (done as f32 / total as f32) * 100.0
        }
    }
}

impl Default for BatchControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Results of one batch in unit order, with failures and skips separated out
#[derive(Debug)]
pub struct BatchOutcome<R> {
    /// `(unit index, result)` for every unit that succeeded, ascending by index
    pub results: Vec<(usize, R)>,
    pub failures: Vec<(usize, EngineError)>,
    /// Units never started because the batch was cancelled or timed out
    pub skipped: usize,
    pub cancelled: bool,
}

impl<R> BatchOutcome<R> {
    /// True when any unit is missing from `results`
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty() || self.skipped > 0
    }

    pub fn into_values(self) -> Vec<R> {
        self.results.into_iter().map(|(_, r)| r).collect()
    }
}

/// Bounded rayon pool. Cloning shares the same threads.
#[derive(Clone)]
pub struct WorkerPool {
    pool: Arc<rayon::ThreadPool>,
    threads: usize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("threads", &self.threads).finish()
    }
}

impl WorkerPool {
    /// Pool with `threads` workers, or one per available core
    pub fn new(threads: Option<usize>) -> Result<Self> {
        let threads = threads.filter(|n| *n > 0).unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("stratlab-worker-{i}"))
            .build()
            .map_err(|e| EngineError::WorkerPool(e.to_string()))?;
        debug!(threads, "Worker pool started");
        Ok(Self {
            pool: Arc::new(pool),
            threads,
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Run `work` over every unit concurrently.
    ///
    /// A failing unit is logged and reported in `failures`; the rest of the
    /// batch continues. Units not yet started when `control` stops are skipped.
    pub fn map<T, R, F>(&self, units: &[T], control: &BatchControl, work: F) -> BatchOutcome<R>
    where
        T: Sync,
        R: Send,
        F: Fn(usize, &T) -> Result<R> + Sync,
    {
        control.add_total(units.len());
        let raw: Vec<Option<Result<R>>> = self.pool.install(|| {
            units
                .par_iter()
                .enumerate()
                .map(|(i, unit)| {
                    if control.should_stop() {
                        return None;
                    }
                    let out = work(i, unit);
                    control.mark_completed();
                    Some(out)
                })
                .collect()
        });

        let mut outcome = BatchOutcome {
            results: Vec::with_capacity(raw.len()),
            failures: Vec::new(),
            skipped: 0,
            cancelled: false,
        };
        for (i, entry) in raw.into_iter().enumerate() {
            match entry {
                Some(Ok(r)) => outcome.results.push((i, r)),
                Some(Err(e)) => {
                    warn!(unit = i, error = %e, "Batch unit failed, excluded");
                    outcome.failures.push((i, e));
                }
                None => outcome.skipped += 1,
            }
        }
        if outcome.skipped > 0 {
            outcome.cancelled = true;
            warn!(
                skipped = outcome.skipped,
                cancelled = control.is_cancelled(),
                timed_out = control.timed_out(),
                "Batch stopped early"
            );
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_map_preserves_unit_order() {
        let pool = WorkerPool::new(Some(4)).unwrap();
        let control = BatchControl::new();
        let units: Vec<u64> = (0..100).collect();
        let outcome = pool.map(&units, &control, |_, u| Ok(u * 2));
        let values: Vec<u64> = outcome.results.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, (0..100).map(|u| u * 2).collect::<Vec<_>>());
        assert!(!outcome.is_partial());
        assert_eq!(control.completed(), 100);
        assert_eq!(control.progress_pct(), 100.0);
    }

    #[test]
    fn test_failures_are_isolated() {
        let pool = WorkerPool::new(Some(2)).unwrap();
        let control = BatchControl::new();
        let units: Vec<i32> = (0..10).collect();
        let outcome = pool.map(&units, &control, |_, u| {
            if *u == 3 {
                Err(EngineError::InvalidInput("bad unit".into()))
            } else {
                Ok(*u)
            }
        });
        assert_eq!(outcome.results.len(), 9);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].0, 3);
        assert!(outcome.is_partial());
    }

    #[test]
    fn test_cancelled_batch_skips_everything() {
        let pool = WorkerPool::new(Some(2)).unwrap();
        let control = BatchControl::new();
        control.cancel();
        let units: Vec<i32> = (0..10).collect();
        let outcome = pool.map(&units, &control, |_, u| Ok(*u));
        assert!(outcome.results.is_empty());
        assert_eq!(outcome.skipped, 10);
        assert!(outcome.cancelled);
    }

    #[test]
    fn test_expired_deadline_stops_batch() {
        let pool = WorkerPool::new(Some(2)).unwrap();
        let control = BatchControl::with_timeout(Duration::ZERO);
        let outcome = pool.map(&[1, 2, 3], &control, |_, u| Ok(*u));
        assert_eq!(outcome.skipped, 3);
    }

    #[test]
    fn test_child_shares_cancel_but_not_progress() {
        let pool = WorkerPool::new(Some(2)).unwrap();
        let parent = BatchControl::new();
        parent.add_total(3);
        parent.mark_completed();

        let child = parent.child();
        pool.map(&[1, 2, 3, 4], &child, |_, u| Ok(*u));
        assert_eq!(child.completed(), 4);
        assert_eq!(parent.total(), 3);
        assert_eq!(parent.completed(), 1);

        child.cancel();
        assert!(parent.is_cancelled());
        assert!(parent.child().should_stop());
    }

    #[test]
    fn test_unit_rng_is_reproducible() {
        let a: Vec<u32> = (0..4).map(|i| unit_rng(42, i).gen()).collect();
        let b: Vec<u32> = (0..4).map(|i| unit_rng(42, i).gen()).collect();
        assert_eq!(a, b);
        assert_ne!(a[0], a[1]);
    }
}
