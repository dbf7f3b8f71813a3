//! Worker pool, wait group, and semaphore used by every parallel pipeline.
//!
//! Tasks are plain closures on a shared FIFO queue served by OS threads.
//! Recursive fan-out (the directory walker) must use [`ThreadPool::enqueue_or_run`]:
//! it takes a ticket from a semaphore sized to the thread count and runs the
//! task inline when none is available, so a pool saturated with blocked
//! parents can never deadlock.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use anyhow::Result;
use parking_lot::{Condvar, Mutex};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Counting semaphore.
pub struct Semaphore {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new(count: usize) -> Semaphore {
        Semaphore {
            count: Mutex::new(count),
            cv: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cv.notify_one();
    }

    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cv.wait(&mut count);
        }
        *count -= 1;
    }

    /// Take a ticket without blocking; false if none are available.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }
}

/// Collects completion and the first failure from a set of parallel tasks.
/// Every task must call exactly one of [`WaitGroup::done`] or
/// [`WaitGroup::error`]; [`WaitGroup::finish`] routes a `Result` to the right
/// one. Errors after the first are dropped.
#[derive(Clone, Default)]
pub struct WaitGroup {
    inner: Arc<WgInner>,
}

#[derive(Default)]
struct WgInner {
    state: Mutex<WgState>,
    cv: Condvar,
}

#[derive(Default)]
struct WgState {
    count: i64,
    error: Option<anyhow::Error>,
}

impl WaitGroup {
    pub fn new() -> WaitGroup {
        WaitGroup::default()
    }

    pub fn add(&self, delta: i64) {
        let mut state = self.inner.state.lock();
        state.count += delta;
    }

    pub fn done(&self) {
        let mut state = self.inner.state.lock();
        state.count -= 1;
        self.inner.cv.notify_all();
    }

    pub fn error(&self, err: anyhow::Error) {
        let mut state = self.inner.state.lock();
        if state.error.is_none() {
            state.error = Some(err);
        }
        state.count -= 1;
        self.inner.cv.notify_all();
    }

    pub fn finish(&self, result: Result<()>) {
        match result {
            Ok(()) => self.done(),
            Err(err) => self.error(err),
        }
    }

    /// Block until the count reaches zero.
    pub fn wait(&self) {
        let mut state = self.inner.state.lock();
        while state.count > 0 {
            self.inner.cv.wait(&mut state);
        }
    }

    /// Block until the count reaches zero, then propagate the first captured
    /// error, if any.
    pub fn wait_result(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        while state.count > 0 {
            self.inner.cv.wait(&mut state);
        }
        match state.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

struct PoolState {
    queue: VecDeque<Job>,
    stop: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    cv: Condvar,
    tickets: Semaphore,
}

/// Fixed-size worker pool over a FIFO queue.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(threads: usize) -> ThreadPool {
        let threads = threads.max(1);
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                stop: false,
            }),
            cv: Condvar::new(),
            tickets: Semaphore::new(threads),
        });

        let workers = (0..threads)
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || loop {
                    let job = {
                        let mut state = shared.state.lock();
                        loop {
                            if let Some(job) = state.queue.pop_front() {
                                break job;
                            }
                            if state.stop {
                                return;
                            }
                            shared.cv.wait(&mut state);
                        }
                    };
                    job();
                })
            })
            .collect();

        ThreadPool { shared, workers }
    }

    /// Queue a task. Never blocks.
    pub fn enqueue<F: FnOnce() + Send + 'static>(&self, job: F) {
        {
            let mut state = self.shared.state.lock();
            state.queue.push_back(Box::new(job));
        }
        self.shared.cv.notify_one();
    }

    /// Queue a task if a worker ticket is available, otherwise run it on the
    /// calling thread.
    pub fn enqueue_or_run<F: FnOnce() + Send + 'static>(&self, job: F) {
        if self.shared.tickets.try_wait() {
            let shared = Arc::clone(&self.shared);
            self.enqueue(move || {
                job();
                shared.tickets.notify();
            });
        } else {
            job();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.stop = true;
        }
        self.shared.cv.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

static CONFIGURED_THREADS: OnceLock<usize> = OnceLock::new();
static POOL: OnceLock<ThreadPool> = OnceLock::new();

/// Override the global pool size. Only effective before the first use of
/// [`pool`]; later calls are ignored.
pub fn set_thread_count(threads: usize) {
    let _ = CONFIGURED_THREADS.set(threads.max(1));
}

/// The process-wide worker pool, created on first use.
pub fn pool() -> &'static ThreadPool {
    POOL.get_or_init(|| {
        let threads = CONFIGURED_THREADS.get().copied().unwrap_or_else(|| {
            thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(4)
        });
        ThreadPool::new(threads)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn runs_queued_tasks() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        let wg = WaitGroup::new();
        for _ in 0..64 {
            let counter = counter.clone();
            let wg = wg.clone();
            wg.add(1);
            pool.enqueue(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                wg.done();
            });
        }
        wg.wait_result().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn enqueue_or_run_falls_back_inline_when_saturated() {
        let pool = ThreadPool::new(1);
        let wg = WaitGroup::new();
        let release = Arc::new(Semaphore::new(0));

        // Park the only worker.
        let blocker = release.clone();
        wg.add(1);
        pool.enqueue({
            let wg = wg.clone();
            move || {
                blocker.wait();
                wg.done();
            }
        });

        // The ticket is taken by the parked task's enqueue path only for
        // enqueue_or_run; the direct enqueue above left one ticket, so drain it.
        assert!(pool.shared.tickets.try_wait());

        let caller = thread::current().id();
        let ran_on = Arc::new(Mutex::new(None));
        let slot = ran_on.clone();
        pool.enqueue_or_run(move || {
            *slot.lock() = Some(thread::current().id());
        });
        assert_eq!(*ran_on.lock(), Some(caller));

        release.notify();
        wg.wait_result().unwrap();
    }

    #[test]
    fn wait_group_returns_first_error() {
        let pool = ThreadPool::new(2);
        let wg = WaitGroup::new();
        for i in 0..8 {
            let wg = wg.clone();
            wg.add(1);
            pool.enqueue(move || {
                if i % 2 == 0 {
                    wg.finish(Err(anyhow::anyhow!("task {i} failed")));
                } else {
                    wg.finish(Ok(()));
                }
            });
        }
        let err = wg.wait_result().unwrap_err();
        assert!(err.to_string().contains("failed"));
        // A second wait sees a drained error slot and succeeds.
        wg.wait_result().unwrap();
    }

    #[test]
    fn semaphore_counts_tickets() {
        let sem = Semaphore::new(2);
        assert!(sem.try_wait());
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
        sem.notify();
        assert!(sem.try_wait());
    }

    #[test]
    fn wait_blocks_until_done() {
        let pool = ThreadPool::new(2);
        let wg = WaitGroup::new();
        let flag = Arc::new(AtomicUsize::new(0));
        let task_flag = flag.clone();
        let task_wg = wg.clone();
        wg.add(1);
        pool.enqueue(move || {
            thread::sleep(Duration::from_millis(50));
            task_flag.store(1, Ordering::SeqCst);
            task_wg.done();
        });
        wg.wait();
        assert_eq!(flag.load(Ordering::SeqCst), 1);
    }
}
