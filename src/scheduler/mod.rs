//! Work distribution: typed worklists with thread-local buffers, and the
//! parallel job runner used by every phase that fans out to workers.

pub mod worklist;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

/// A unit of parallel work. Workers call [`Job::run`] once each and claim
/// items internally (typically through an atomic counter or a worklist).
pub trait Job: Sync {
    fn run(&self, delegate: &JobDelegate);

    /// Upper bound on useful workers for this job.
    fn max_concurrency(&self, worker_count: usize) -> usize;
}

/// Per-worker context handed to [`Job::run`].
pub struct JobDelegate {
    task_id: usize,
    joining_thread: bool,
}

impl JobDelegate {
    pub fn get_task_id(&self) -> usize {
        self.task_id
    }

    /// True on the main thread, which joins the job as an extra worker.
    pub fn is_joining_thread(&self) -> bool {
        self.joining_thread
    }

    /// Cooperative yield between pages, slots or worklist items.
    pub fn yield_now(&self) {
        thread::yield_now();
    }
}

/// The worker pool backing all parallel phases. The main thread always joins
/// the job it posts and waits for completion.
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> WorkerPool {
        debug_assert!(workers > 0);
        WorkerPool { workers }
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Run `job` to completion, farming it out to up to
    /// `job.max_concurrency(workers)` threads (the main thread included).
    pub fn run_job<J: Job + ?Sized>(&self, job: &J) {
        let concurrency = job.max_concurrency(self.workers).clamp(1, self.workers);
        if concurrency == 1 {
            job.run(&JobDelegate {
                task_id: 0,
                joining_thread: true,
            });
            return;
        }
        thread::scope(|scope| {
            for task_id in 1..concurrency {
                scope.spawn(move || {
                    job.run(&JobDelegate {
                        task_id,
                        joining_thread: false,
                    });
                });
            }
            job.run(&JobDelegate {
                task_id: 0,
                joining_thread: true,
            });
        });
    }
}

/// An atomic claim counter: each item of an indexed batch is processed
/// exactly once, whichever worker gets there first.
pub struct ClaimCounter {
    next: AtomicUsize,
    limit: usize,
}

impl ClaimCounter {
    pub fn new(limit: usize) -> ClaimCounter {
        ClaimCounter {
            next: AtomicUsize::new(0),
            limit,
        }
    }

    pub fn claim(&self) -> Option<usize> {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        (index < self.limit).then_some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingJob {
        counter: ClaimCounter,
        processed: AtomicUsize,
    }

    impl Job for CountingJob {
        fn run(&self, _delegate: &JobDelegate) {
            while self.counter.claim().is_some() {
                self.processed.fetch_add(1, Ordering::Relaxed);
            }
        }

        fn max_concurrency(&self, workers: usize) -> usize {
            workers
        }
    }

    #[test]
    fn each_item_processed_exactly_once() {
        let pool = WorkerPool::new(4);
        let job = CountingJob {
            counter: ClaimCounter::new(1000),
            processed: AtomicUsize::new(0),
        };
        pool.run_job(&job);
        assert_eq!(job.processed.load(Ordering::Relaxed), 1000);
    }

    #[test]
    fn single_worker_pool_runs_inline() {
        let pool = WorkerPool::new(1);
        let job = CountingJob {
            counter: ClaimCounter::new(10),
            processed: AtomicUsize::new(0),
        };
        pool.run_job(&job);
        assert_eq!(job.processed.load(Ordering::Relaxed), 10);
    }
}
