// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Cooperative scheduling: the scheduler interface and the single-thread
//! scheduler.
//!
//! A cooperative scheduler is an executor that additionally tracks runnable
//! routines and per-id completion signals. `wait_for(id)` parks the caller
//! until `mark_completed(id)` fires, and — on the scheduler's own thread(s)
//! — donates the parked thread to other runnable work instead of
//! deadlocking against it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use async_task::Runnable;
use log::{trace, warn};
use slab::Slab;
use sync::{Condvar, Mutex};

use crate::executor::{Executor, Job};

/// A rendezvous slot id handed out by [`CoopScheduler::register_waiter`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct WaiterId(pub(crate) usize);

/// An executor that can also resume suspended routines and rendezvous with
/// waiters.
pub trait CoopScheduler: Executor {
    /// Whether a routine starting on the current thread must immediately
    /// hop to one of the scheduler's threads.
    fn init_switch_thread(&self) -> bool;

    /// Enqueues a routine that is ready to resume. `expect_end_soon` is a
    /// hint that the routine is about to finish and should be preferred.
    fn mark_runnable(&self, routine: Runnable, expect_end_soon: bool);

    /// Allocates a rendezvous slot for a single `wait_for`/`mark_completed`
    /// exchange.
    fn register_waiter(&self) -> WaiterId;

    /// Signals the rendezvous slot; wakes the corresponding `wait_for`.
    fn mark_completed(&self, id: WaiterId);

    /// Blocks until `mark_completed(id)` fires, running other routines and
    /// jobs on the calling thread where the scheduling policy allows it.
    fn wait_for(&self, id: WaiterId);

    /// Opaque identity for diagnostics.
    fn address(&self) -> usize;
}

/// A shared handle to a cooperative scheduler.
pub type CoopHandle = Arc<dyn CoopScheduler>;

#[derive(Default)]
struct SchedState {
    jobs: VecDeque<Job>,
    runnables: VecDeque<Runnable>,
    waiters: Slab<bool>,
}

/// A cooperative scheduler pinned to one host thread.
///
/// Jobs and routines only ever run on the pinned thread, inside
/// [`OneThreadCoopScheduler::run_all_pending`] or inside a donating
/// `wait_for`. Other threads may enqueue work and signal completions, but
/// calling `wait_for` from them simply blocks.
pub struct OneThreadCoopScheduler {
    thread: ThreadId,
    state: Mutex<SchedState>,
    cv: Condvar,
}

impl OneThreadCoopScheduler {
    /// Creates a scheduler pinned to the calling thread.
    pub fn new() -> Arc<OneThreadCoopScheduler> {
        Self::for_thread(thread::current().id())
    }

    /// Creates a scheduler pinned to the given thread.
    pub fn for_thread(thread: ThreadId) -> Arc<OneThreadCoopScheduler> {
        Arc::new(OneThreadCoopScheduler {
            thread,
            state: Mutex::new(SchedState::default()),
            cv: Condvar::new(),
        })
    }

    pub fn handle(self: &Arc<Self>) -> CoopHandle {
        self.clone()
    }

    /// Runs queued routines and jobs until both queues are empty. Returns
    /// immediately (with a warning) when called from any thread but the
    /// pinned one.
    pub fn run_all_pending(&self) {
        if thread::current().id() != self.thread {
            warn!("run_all_pending() called off the scheduler thread; ignoring");
            return;
        }
        let mut state = self.state.lock();
        loop {
            if let Some(runnable) = state.runnables.pop_front() {
                drop(state);
                runnable.run();
                state = self.state.lock();
            } else if let Some(job) = state.jobs.pop_front() {
                drop(state);
                job();
                state = self.state.lock();
            } else {
                return;
            }
        }
    }
}

impl Executor for OneThreadCoopScheduler {
    fn enqueue(&self, job: Job) {
        self.state.lock().jobs.push_back(job);
        self.cv.notify_one();
    }
}

impl CoopScheduler for OneThreadCoopScheduler {
    fn init_switch_thread(&self) -> bool {
        thread::current().id() != self.thread
    }

    fn mark_runnable(&self, routine: Runnable, _expect_end_soon: bool) {
        self.state.lock().runnables.push_back(routine);
        self.cv.notify_one();
        trace!("routine marked runnable on scheduler {:#x}", self.address());
    }

    fn register_waiter(&self) -> WaiterId {
        WaiterId(self.state.lock().waiters.insert(false))
    }

    fn mark_completed(&self, id: WaiterId) {
        let mut state = self.state.lock();
        match state.waiters.get_mut(id.0) {
            Some(done) => *done = true,
            None => panic!("mark_completed() on an unregistered waiter id"),
        }
        self.cv.notify_all();
    }

    fn wait_for(&self, id: WaiterId) {
        let donate = thread::current().id() == self.thread;
        let mut state = self.state.lock();
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
                    runnable.run();
                    state = self.state.lock();
                    continue;
                }
                if let Some(job) = state.jobs.pop_front() {
                    drop(state);
                    job();
                    state = self.state.lock();
                    continue;
                }
            }
            state = self.cv.wait(state);
        }
    }

    fn address(&self) -> usize {
        self as *const OneThreadCoopScheduler as usize
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn run_all_pending_drains_jobs_in_order() {
        let sched = OneThreadCoopScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            sched.enqueue(Box::new(move || order.lock().push(i)));
        }
        sched.run_all_pending();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn run_all_pending_is_a_noop_off_thread() {
        let sched = OneThreadCoopScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        sched.enqueue(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        let s = sched.clone();
        thread::spawn(move || s.run_all_pending()).join().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        sched.run_all_pending();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wait_for_donates_the_pinned_thread() {
        let sched = OneThreadCoopScheduler::new();
        let id = sched.register_waiter();
        let s = sched.clone();
        // The completion is only ever signalled by a job that the waiting
        // thread itself must run.
        sched.enqueue(Box::new(move || s.mark_completed(id)));
        sched.wait_for(id);
    }
}
