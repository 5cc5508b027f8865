use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Shared flag that stops a running batch.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Bounded data-parallel fan-out. Results come back in input order.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: usize,
    cancel: CancelToken,
}

impl WorkerPool {
    pub fn new(workers: Option<usize>, cancel: CancelToken) -> Self {
        Self {
            workers: workers.unwrap_or_else(default_workers).max(1),
            cancel,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs `task` on every item. A cancelled batch discards everything it
    /// produced and reports the time since `started`, the start of the
    /// operation the batch belongs to.
    pub fn map<T, R, F>(&self, started: Instant, items: &[T], task: F) -> Result<Vec<R>>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Sync + Send,
    {
        let pool = ThreadPoolBuilder::new().num_threads(self.workers).build()?;
        debug!(tasks = items.len(), workers = self.workers, "Starting batch");

        let results: Vec<Option<R>> = pool.install(|| {
            items
                .par_iter()
                .map(|item| (!self.cancel.is_cancelled()).then(|| task(item)))
                .collect()
        });

        if self.cancel.is_cancelled() {
            let elapsed = started.elapsed();
            warn!(elapsed_secs = elapsed.as_secs_f64(), "Batch cancelled");
            return Err(Error::Cancelled { elapsed });
        }
        Ok(results.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_preserves_order() {
        let pool = WorkerPool::new(Some(3), CancelToken::new());
        let squares = pool.map(Instant::now(), &[1, 2, 3, 4, 5], |x| x * x).unwrap();
        assert_eq!(squares, vec![1, 4, 9, 16, 25]);
    }

    #[test]
    fn worker_count_has_a_floor_of_one() {
        assert_eq!(WorkerPool::new(Some(0), CancelToken::new()).workers(), 1);
        assert!(WorkerPool::new(None, CancelToken::new()).workers() >= 1);
    }

    #[test]
    fn cancellation_discards_partial_results() {
        let cancel = CancelToken::new();
        let pool = WorkerPool::new(Some(2), cancel.clone());
        let result = pool.map(Instant::now(), &[1, 2, 3, 4], |x| {
            if *x == 2 {
                cancel.cancel();
            }
            *x
        });
        assert!(matches!(result, Err(Error::Cancelled { .. })));

        cancel.reset();
        assert_eq!(pool.map(Instant::now(), &[1], |x| *x).unwrap(), vec![1]);
    }

    #[test]
    fn cancellation_reports_time_since_the_operation_started() {
        let cancel = CancelToken::new();
        let pool = WorkerPool::new(Some(1), cancel.clone());
        let started = Instant::now();
        std::thread::sleep(std::time::Duration::from_millis(50));
        cancel.cancel();
        match pool.map(started, &[1, 2], |x| *x) {
            Err(Error::Cancelled { elapsed }) => assert!(elapsed.as_millis() >= 50),
            other => panic!("expected cancellation, got {other:?}"),
        }
    }
}
