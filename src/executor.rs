// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The executor interface and the worker thread pool.
//!
//! The pool doubles as a cooperative scheduler: besides the plain job FIFO
//! it keeps a FIFO of runnable routines and a slab of rendezvous slots for
//! `wait_for`/`mark_completed`, sharing one mutex and condvar. Workers
//! prefer routines over plain jobs, and a worker blocked in `wait_for`
//! donates its thread by draining both queues while it waits.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use async_task::Runnable;
use log::{debug, trace};
use once_cell::sync::OnceCell;
use slab::Slab;
use sync::{Condvar, Mutex};

use crate::coop::{CoopHandle, CoopScheduler, WaiterId};

/// A unit of work accepted by an executor.
pub type Job = Box<dyn FnOnce() + Send>;

/// A queue of jobs with some worker policy behind it.
///
/// The only ordering guarantee is FIFO per submission queue; jobs may run
/// on any thread the implementation owns.
pub trait Executor: Send + Sync {
    fn enqueue(&self, job: Job);
}

/// A shared handle to an executor, owned by every combinator cell that may
/// need to enqueue work after its inputs complete.
pub type ExecutorHandle = Arc<dyn Executor>;

#[derive(Default)]
struct PoolState {
    jobs: VecDeque<Job>,
    runnables: VecDeque<Runnable>,
    waiters: Slab<bool>,
    workers: HashSet<ThreadId>,
    closed: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    cv: Condvar,
}

fn run_worker(shared: Arc<PoolShared>) {
    trace!("pool worker {:?} started", thread::current().id());
    loop {
        let mut state = shared.state.lock();
        loop {
            if let Some(runnable) = state.runnables.pop_front() {
                drop(state);
                runnable.run();
                break;
            }
            if let Some(job) = state.jobs.pop_front() {
                drop(state);
                job();
                break;
            }
            if state.closed {
                trace!("pool worker {:?} exiting", thread::current().id());
                return;
            }
            state = shared.cv.wait(state);
        }
    }
}

/// A fixed-size worker thread pool.
///
/// Workers block on a condvar until a job or a runnable routine is
/// available, or until [`ThreadPool::close`] is called. On close, queued
/// work is drained and the workers exit; jobs enqueued afterwards are
/// silently dropped. Dropping the pool closes it and joins the workers, so
/// callers must reach quiescence first: a routine parked forever in
/// `wait_for` on a pool thread would block the drop.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    /// Creates a pool with `num_threads` workers.
    pub fn new(num_threads: usize) -> Arc<ThreadPool> {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState::default()),
            cv: Condvar::new(),
        });
        let mut threads = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            let shared = shared.clone();
            threads.push(thread::spawn(move || run_worker(shared)));
        }
        {
            let mut state = shared.state.lock();
            for handle in &threads {
                state.workers.insert(handle.thread().id());
            }
        }
        Arc::new(ThreadPool {
            shared,
            threads: Mutex::new(threads),
        })
    }

    /// Stops accepting work. Workers finish what is already queued and
    /// exit.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        self.shared.cv.notify_all();
    }

    /// This pool as a plain executor.
    pub fn handle(self: &Arc<Self>) -> ExecutorHandle {
        self.clone()
    }

    /// This pool as a cooperative scheduler.
    pub fn coop_handle(self: &Arc<Self>) -> CoopHandle {
        self.clone()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.close();
        // Combinator cells own executor handles, so the last reference to a
        // pool can die inside one of its own jobs. Joining from a worker
        // would deadlock; the workers exit on their own once closed.
        let on_worker = self
            .shared
            .state
            .lock()
            .workers
            .contains(&thread::current().id());
        for handle in self.threads.lock().drain(..) {
            if on_worker {
                drop(handle);
            } else {
                let _ = handle.join();
            }
        }
    }
}

impl Executor for ThreadPool {
    fn enqueue(&self, job: Job) {
        let mut state = self.shared.state.lock();
        if state.closed {
            debug!("job enqueued on a closed pool; dropping it");
            return;
        }
        state.jobs.push_back(job);
        self.shared.cv.notify_one();
    }
}

impl CoopScheduler for ThreadPool {
    fn init_switch_thread(&self) -> bool {
        // A routine started from outside the pool must hop onto a worker.
        !self
            .shared
            .state
            .lock()
            .workers
            .contains(&thread::current().id())
    }

    fn mark_runnable(&self, routine: Runnable, expect_end_soon: bool) {
        let mut state = self.shared.state.lock();
        if state.closed {
            debug!("routine marked runnable on a closed pool; dropping it");
            return;
        }
        if expect_end_soon {
            state.runnables.push_front(routine);
        } else {
            state.runnables.push_back(routine);
        }
        self.shared.cv.notify_one();
    }

    fn register_waiter(&self) -> WaiterId {
        WaiterId(self.shared.state.lock().waiters.insert(false))
    }

    fn mark_completed(&self, id: WaiterId) {
        let mut state = self.shared.state.lock();
        match state.waiters.get_mut(id.0) {
            Some(done) => *done = true,
            None => panic!("mark_completed() on an unregistered waiter id"),
        }
        self.shared.cv.notify_all();
    }

    fn wait_for(&self, id: WaiterId) {
        let donate = self
            .shared
            .state
            .lock()
            .workers
            .contains(&thread::current().id());
        let mut state = self.shared.state.lock();
        loop {
            match state.waiters.get(id.0) {
                Some(true) => {
                    state.waiters.remove(id.0);
                    return;
                }
                Some(false) => {}
                None => panic!("wait_for() on an unregistered waiter id"),
            }
            if donate {
                if let Some(runnable) = state.runnables.pop_front() {
                    drop(state);
                    trace!("wait_for: donating worker to a runnable routine");
                    runnable.run();
                    state = self.shared.state.lock();
                    continue;
                }
                if let Some(job) = state.jobs.pop_front() {
                    drop(state);
                    trace!("wait_for: donating worker to a queued job");
                    job();
                    state = self.shared.state.lock();
                    continue;
                }
            }
            state = self.shared.cv.wait(state);
        }
    }

    fn address(&self) -> usize {
        Arc::as_ptr(&self.shared) as usize
    }
}

static DEFAULT_POOL: OnceCell<Arc<ThreadPool>> = OnceCell::new();

fn default_pool() -> &'static Arc<ThreadPool> {
    DEFAULT_POOL.get_or_init(|| {
        let parallelism = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        ThreadPool::new(parallelism + 1)
    })
}

/// The process-wide default executor: a lazily created pool sized
/// `available_parallelism + 1`. Shared with [`default_coop_scheduler`].
pub fn default_executor() -> ExecutorHandle {
    default_pool().handle()
}

/// The process-wide default cooperative scheduler; the same pool as
/// [`default_executor`].
pub fn default_coop_scheduler() -> CoopHandle {
    default_pool().coop_handle()
}
