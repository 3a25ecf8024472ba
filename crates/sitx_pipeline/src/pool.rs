//! Resizable worker pool for asynchronous flushes.

use crate::error::{PipelineError, PipelineResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    queue: VecDeque<Job>,
    max_workers: usize,
    workers: usize,
    idle: usize,
    running: usize,
    spawned: usize,
    shutdown: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    work_ready: Condvar,
    changed: Condvar,
}

/// Runs flush jobs on up to `max_workers` threads.
///
/// Workers are spawned lazily when a job finds no idle worker. Lowering the
/// limit makes surplus workers exit after their current job. Queued jobs are
/// never dropped: [`shutdown`](Self::shutdown) refuses new jobs, runs what is
/// queued and joins every worker.
pub struct WorkerPool {
    name: String,
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Creates a pool with no threads. `max_workers` of zero is treated as one.
    #[must_use]
    pub fn new(name: impl Into<String>, max_workers: usize) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    max_workers: max_workers.max(1),
                    workers: 0,
                    idle: 0,
                    running: 0,
                    spawned: 0,
                    shutdown: false,
                }),
                work_ready: Condvar::new(),
                changed: Condvar::new(),
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Queues `job`.
    ///
    /// # Errors
    ///
    /// `Shutdown` after [`shutdown`](Self::shutdown); `Io` if no worker exists
    /// and none can be spawned.
    pub fn execute<F>(&self, job: F) -> PipelineResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let spawn_id = {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return Err(PipelineError::Shutdown);
            }
            state.queue.push_back(Box::new(job));
            if state.idle == 0 && state.workers < state.max_workers {
                state.workers += 1;
                state.spawned += 1;
                Some(state.spawned)
            } else {
                self.shared.work_ready.notify_one();
                None
            }
        };

        let Some(id) = spawn_id else {
            return Ok(());
        };
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("{}-{id}", self.name))
            .spawn(move || worker_loop(&shared));
        match spawned {
            Ok(handle) => {
                self.handles.lock().push(handle);
                Ok(())
            }
            Err(err) => {
                let mut state = self.shared.state.lock();
                state.workers -= 1;
                if state.workers == 0 {
                    state.queue.pop_back();
                    return Err(err.into());
                }
                warn!(pool = %self.name, error = %err, "worker spawn failed, job left to existing workers");
                Ok(())
            }
        }
    }

    /// Current thread limit.
    #[must_use]
    pub fn max_workers(&self) -> usize {
        self.shared.state.lock().max_workers
    }

    /// Changes the thread limit. Zero is treated as one.
    pub fn set_max_workers(&self, max_workers: usize) {
        let mut state = self.shared.state.lock();
        state.max_workers = max_workers.max(1);
        debug!(pool = %self.name, max_workers = state.max_workers, "resized");
        self.shared.work_ready.notify_all();
    }

    /// Live worker threads.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.shared.state.lock().workers
    }

    /// Jobs currently executing.
    #[must_use]
    pub fn running_jobs(&self) -> usize {
        self.shared.state.lock().running
    }

    /// Jobs waiting for a worker.
    #[must_use]
    pub fn queued_jobs(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Blocks until no job is queued or running.
    pub fn wait_idle(&self) {
        let mut state = self.shared.state.lock();
        while !state.queue.is_empty() || state.running > 0 {
            self.shared.changed.wait(&mut state);
        }
    }

    /// Refuses new jobs, finishes queued ones and joins all workers. Safe to
    /// call more than once.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.shutdown {
                info!(pool = %self.name, queued = state.queue.len(), "shutting down");
            }
            state.shutdown = true;
            self.shared.work_ready.notify_all();
        }
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!(pool = %self.name, "worker thread panicked");
            }
        }
    }

    /// Returns true once [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.state.lock().shutdown
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    while let Some(job) = next_job(shared) {
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            warn!("flush job panicked");
        }

        let mut state = shared.state.lock();
        state.running -= 1;
        shared.changed.notify_all();
    }
}

/// Takes the next job, or retires the calling worker.
///
/// A retiring worker leaves the count in the same critical section that
/// decided it was surplus, so concurrent workers never retire below the
/// limit while jobs are queued.
fn next_job(shared: &Shared) -> Option<Job> {
    let mut state = shared.state.lock();
    loop {
        let surplus = state.workers > state.max_workers;
        if surplus || (state.shutdown && state.queue.is_empty()) {
            state.workers -= 1;
            shared.changed.notify_all();
            return None;
        }
        if let Some(job) = state.queue.pop_front() {
            state.running += 1;
            return Some(job);
        }
        state.idle += 1;
        shared.work_ready.wait(&mut state);
        state.idle -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn runs_every_job() {
        let pool = WorkerPool::new("test", 4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.wait_idle();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert!(pool.worker_count() <= 4);
    }

    #[test]
    fn shutdown_drains_queue_and_refuses_new_jobs() {
        let pool = WorkerPool::new("test", 1);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                thread::sleep(Duration::from_millis(1));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 20);
        assert!(matches!(pool.execute(|| {}), Err(PipelineError::Shutdown)));
        assert_eq!(pool.worker_count(), 0);
        pool.shutdown();
    }

    #[test]
    fn shrinking_retires_surplus_workers() {
        let pool = WorkerPool::new("test", 3);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));
        for _ in 0..3 {
            let release_rx = Arc::clone(&release_rx);
            pool.execute(move || {
                let _ = release_rx.lock().recv();
            })
            .unwrap();
        }
        assert_eq!(pool.worker_count(), 3);

        pool.set_max_workers(1);
        assert_eq!(pool.max_workers(), 1);
        for _ in 0..3 {
            release_tx.send(()).unwrap();
        }
        pool.wait_idle();

        let mut state = pool.shared.state.lock();
        while state.workers > 1 {
            pool.shared.changed.wait(&mut state);
        }
        assert_eq!(state.workers, 1);
    }

    #[test]
    fn surplus_workers_stop_retiring_at_the_limit() {
        let pool = WorkerPool::new("test", 1);
        {
            let mut state = pool.shared.state.lock();
            state.workers = 3;
            state.queue.push_back(Box::new(|| {}));
            state.queue.push_back(Box::new(|| {}));
        }

        assert!(next_job(&pool.shared).is_none());
        assert!(next_job(&pool.shared).is_none());
        assert_eq!(pool.worker_count(), 1);
        assert!(next_job(&pool.shared).is_some());
        assert_eq!(pool.queued_jobs(), 1);
        assert_eq!(pool.running_jobs(), 1);

        let mut state = pool.shared.state.lock();
        state.workers = 0;
        state.running = 0;
        state.queue.clear();
    }

    #[test]
    fn queued_jobs_survive_a_large_shrink() {
        for _ in 0..20 {
            let pool = WorkerPool::new("test", 16);
            let (release_tx, release_rx) = mpsc::channel::<()>();
            let release_rx = Arc::new(Mutex::new(release_rx));
            for _ in 0..16 {
                let release_rx = Arc::clone(&release_rx);
                pool.execute(move || {
                    let _ = release_rx.lock().recv();
                })
                .unwrap();
            }
            let counter = Arc::new(AtomicUsize::new(0));
            for _ in 0..8 {
                let counter = Arc::clone(&counter);
                pool.execute(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }

            pool.set_max_workers(1);
            for _ in 0..16 {
                release_tx.send(()).unwrap();
            }
            pool.wait_idle();
            assert_eq!(counter.load(Ordering::SeqCst), 8);
            assert!(pool.worker_count() >= 1);
            pool.shutdown();
            assert_eq!(pool.worker_count(), 0);
        }
    }

    #[test]
    fn panicking_job_does_not_kill_the_pool() {
        let pool = WorkerPool::new("test", 1);
        pool.execute(|| panic!("boom")).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.execute(move || tx.send(7).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
        pool.wait_idle();
        assert_eq!(pool.running_jobs() + pool.queued_jobs(), 0);
        assert_eq!(pool.worker_count(), 1);
    }
}
