//! Fixed-size worker pool.
//!
//! A set of OS threads draining one shared FIFO queue. Every submitted task gets a [`TaskHandle`]
//! the submitter can wait on. Shutdown never drops queued work: the pool stops accepting tasks,
//! lets the workers drain the queue and joins them.

use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use log;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker pool error.
#[derive(Debug)]
pub enum PoolError {
    /// Task submitted after shutdown began.
    Stopped,
    /// Task panicked while running. The worker that ran it keeps serving the queue.
    TaskPanicked,
    /// Worker thread could not be spawned.
    Spawn(io::Error),
}

impl Error for PoolError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            PoolError::Spawn(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            PoolError::Stopped => write!(f, "worker pool is stopped"),
            PoolError::TaskPanicked => write!(f, "task panicked"),
            PoolError::Spawn(err) => write!(f, "worker thread not spawned: {}", err),
        }
    }
}

/// Worker pool lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Workers are being spawned.
    Created,
    /// Accepting tasks.
    Running,
    /// Shutdown began: no new tasks, workers drain the queue.
    Draining,
    /// All workers exited and the queue is empty.
    Stopped,
}

impl PoolState {
    fn is_closing(&self) -> bool {
        matches!(self, PoolState::Draining | PoolState::Stopped)
    }
}

struct Queue {
    jobs: VecDeque<Job>,
    state: PoolState,
}

struct Shared {
    queue: Mutex<Queue>,
    job_available: Condvar,
    stopped: Condvar,
}

impl Shared {
    // jobs never run under the lock and are unwound by `catch_unwind`, poisoning cannot corrupt the queue
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a submitted task result.
pub struct TaskHandle<T> {
    receiver: mpsc::Receiver<Result<T, PoolError>>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task has run and returns its result.
    pub fn wait(self) -> Result<T, PoolError> {
        match self.receiver.recv() {
            Ok(result) => result,
            // the job was dropped without running
            Err(_) => Err(PoolError::Stopped),
        }
    }
}

/// Fixed-size worker pool.
///
/// Dropping the pool shuts it down. When the last reference is dropped on one of the pool's own
/// worker threads the queue is still drained, but the workers are detached instead of joined and
/// the pool never reaches [`PoolState::Stopped`]. Owners that need the workers joined call
/// [`WorkerPool::shutdown`] from outside the pool before releasing it.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    worker_ids: Vec<thread::ThreadId>,
}

impl WorkerPool {
    /// Spawns `threads_number` worker threads (at least one) and returns a running pool.
    pub fn start(threads_number: usize) -> Result<Self, PoolError> {
        let threads_number = threads_number.max(1);
        log::info!("starting worker pool (threads: {})", threads_number);

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                jobs: VecDeque::new(),
                state: PoolState::Created,
            }),
            job_available: Condvar::new(),
            stopped: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(threads_number);
        for idx in 0..threads_number {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("sort-worker-{}", idx))
                .spawn(move || worker_loop(idx, &worker_shared));

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    shared.lock().state = PoolState::Draining;
                    shared.job_available.notify_all();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    shared.lock().state = PoolState::Stopped;
                    return Err(PoolError::Spawn(err));
                }
            }
        }

        let worker_ids = workers.iter().map(|handle| handle.thread().id()).collect();
        shared.lock().state = PoolState::Running;

        return Ok(WorkerPool {
            shared,
            workers: Mutex::new(workers),
            worker_ids,
        });
    }

    /// Number of worker threads.
    pub fn threads_number(&self) -> usize {
        self.worker_ids.len()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PoolState {
        self.shared.lock().state
    }

    /// Enqueues a task and wakes one idle worker.
    ///
    /// Fails with [`PoolError::Stopped`] once shutdown has begun.
    pub fn submit<F, T>(&self, task: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (sender, receiver) = mpsc::channel();
        let job: Job = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(task)).map_err(|_| PoolError::TaskPanicked);
            // the submitter may have dropped the handle
            let _ = sender.send(result);
        });

        {
            let mut queue = self.shared.lock();
            if queue.state != PoolState::Running {
                return Err(PoolError::Stopped);
            }
            queue.jobs.push_back(job);
        }
        self.shared.job_available.notify_one();

        return Ok(TaskHandle { receiver });
    }

    /// Stops accepting tasks, waits until every queued task has run and joins the workers.
    ///
    /// Idempotent and callable from any thread. Called from a worker thread it only begins
    /// draining; the workers are joined by a caller outside the pool.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.lock();
            if !queue.state.is_closing() {
                log::debug!("worker pool draining (queued tasks: {})", queue.jobs.len());
                queue.state = PoolState::Draining;
            }
        }
        self.shared.job_available.notify_all();

        if self.worker_ids.contains(&thread::current().id()) {
            return;
        }

        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        if handles.is_empty() {
            // another caller is joining the workers
            let mut queue = self.shared.lock();
            while queue.state != PoolState::Stopped {
                queue = self.shared.stopped.wait(queue).unwrap_or_else(PoisonError::into_inner);
            }
            return;
        }

        for handle in handles {
            if handle.join().is_err() {
                log::error!("worker thread terminated abnormally");
            }
        }

        self.shared.lock().state = PoolState::Stopped;
        self.shared.stopped.notify_all();
        log::info!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(idx: usize, shared: &Shared) {
    log::trace!("worker {} started", idx);

    loop {
        let job = {
            let mut queue = shared.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break Some(job);
                }
                if queue.state.is_closing() {
                    break None;
                }
                queue = shared.job_available.wait(queue).unwrap_or_else(PoisonError::into_inner);
            }
        };

        match job {
            Some(job) => {
                log::trace!("worker {} running task", idx);
                job();
            }
            None => break,
        }
    }

    log::trace!("worker {} exited", idx);
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use rstest::*;

    use super::{PoolError, PoolState, WorkerPool};

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(8)]
    fn test_runs_every_task_once(#[case] threads: usize) {
        let pool = WorkerPool::start(threads).unwrap();
        assert_eq!(pool.threads_number(), threads);
        assert_eq!(pool.state(), PoolState::Running);

        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..100)
            .map(|idx| {
                let counter = Arc::clone(&counter);
                pool.submit(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    idx * 2
                })
                .unwrap()
            })
            .collect();

        let results: Vec<usize> = handles.into_iter().map(|h| h.wait().unwrap()).collect();
        assert_eq!(results, Vec::from_iter((0..100).map(|idx| idx * 2)));
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let pool = WorkerPool::start(1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        pool.submit(|| thread::sleep(Duration::from_millis(50))).unwrap();
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.shutdown();

        assert_eq!(counter.load(Ordering::SeqCst), 20);
        assert_eq!(pool.state(), PoolState::Stopped);
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let pool = WorkerPool::start(2).unwrap();
        pool.shutdown();

        let result = pool.submit(|| 1);
        assert!(matches!(result, Err(PoolError::Stopped)));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let pool = Arc::new(WorkerPool::start(2).unwrap());
        for _ in 0..4 {
            pool.submit(|| thread::sleep(Duration::from_millis(10))).unwrap();
        }

        let concurrent = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.shutdown())
        };
        pool.shutdown();
        concurrent.join().unwrap();
        pool.shutdown();

        assert_eq!(pool.state(), PoolState::Stopped);
    }

    #[test]
    fn test_panicking_task() {
        let pool = WorkerPool::start(1).unwrap();

        let failed = pool.submit(|| panic!("task failure")).unwrap();
        assert!(matches!(failed.wait(), Err(PoolError::TaskPanicked)));

        let succeeded = pool.submit(|| 42).unwrap();
        assert_eq!(succeeded.wait().unwrap(), 42);
    }

    #[test]
    fn test_last_reference_dropped_on_worker() {
        let pool = Arc::new(WorkerPool::start(2).unwrap());
        let counter = Arc::new(AtomicUsize::new(0));

        let pool_ref = Arc::clone(&pool);
        let handle = pool
            .submit(move || {
                thread::sleep(Duration::from_millis(50));
                drop(pool_ref);
            })
            .unwrap();
        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        drop(pool);

        // the dropping worker does not join itself
        handle.wait().unwrap();
        while counter.load(Ordering::SeqCst) < 4 {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_shutdown_from_worker() {
        let pool = Arc::new(WorkerPool::start(2).unwrap());

        let handle = {
            let pool_ref = Arc::clone(&pool);
            pool.submit(move || {
                pool_ref.shutdown();
                pool_ref.submit(|| ()).is_err()
            })
            .unwrap()
        };

        assert!(handle.wait().unwrap());
        pool.shutdown();
        assert_eq!(pool.state(), PoolState::Stopped);
    }
}
