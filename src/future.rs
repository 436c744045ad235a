// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The producer and consumer handles over a completion cell.
//!
//! A [`Promise`] is the single producing side; [`Future`] handles are
//! clonable consuming views. Continuation combinators on `Future` live in
//! the `combinators` module.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::cell::Cell;
use crate::coop::CoopHandle;
use crate::error::{Result, TaskError};

/// The consumer-facing side of an asynchronous computation.
///
/// Handles are cheap to clone and share one completion cell. The *value* of
/// the cell has a single consumer: combinators and `await` move it out, so
/// only one of the clones may consume it. Snapshot reads, `wait`, `error`
/// and `get` (which clones) are unrestricted.
pub struct Future<T> {
    cell: Option<Arc<Cell<T>>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Future<T> {
        Future {
            cell: self.cell.clone(),
        }
    }
}

impl<T> Future<T> {
    pub(crate) fn from_cell(cell: Arc<Cell<T>>) -> Future<T> {
        Future { cell: Some(cell) }
    }

    pub(crate) fn cell(&self) -> &Arc<Cell<T>> {
        match &self.cell {
            Some(cell) => cell,
            None => panic!("future used after reset()"),
        }
    }

    /// Blocks the current thread until the computation completes.
    pub fn wait(&self) {
        self.cell().wait();
    }

    /// Returns true if the computation already completed. A false result
    /// can be outdated by the time the caller can use it.
    pub fn is_complete(&self) -> bool {
        self.cell().is_complete()
    }

    /// Returns true if the computation completed with a value.
    pub fn is_normal(&self) -> bool {
        self.cell().is_normal()
    }

    /// Returns true if the computation completed with an error.
    pub fn is_failed(&self) -> bool {
        self.cell().is_failed()
    }

    /// Waits for completion, then returns the stored error, if any.
    pub fn error(&self) -> Option<TaskError> {
        self.cell().error()
    }

    /// Registers a continuation to run when the computation completes.
    ///
    /// If the computation already completed, the continuation runs inline
    /// on the current thread before this call returns; otherwise it runs on
    /// whichever thread performs the completion.
    pub fn on_complete(&self, callback: impl FnOnce() + Send + 'static) {
        self.cell().on_complete(callback);
    }

    /// Releases this handle's reference to the completion cell early. The
    /// handle is unusable afterwards; only dropping it remains legal.
    pub fn reset(&mut self) {
        self.cell = None;
    }

    pub(crate) fn take(&self) -> Result<T> {
        self.cell().take()
    }
}

impl<T: Clone> Future<T> {
    /// Waits for completion, then returns a clone of the value or the
    /// stored error.
    pub fn get(&self) -> Result<T> {
        self.cell().get()
    }
}

impl<T: Send + 'static> Future<T> {
    /// Returns a future that completes with `Ok(())` when this one
    /// completes normally, or with the same error when it fails. Useful for
    /// registries such as [`crate::FutureWaiter`] that only care about
    /// completion.
    pub fn as_unit(&self) -> Future<()> {
        let out = Arc::new(Cell::new());
        let ret = Future::from_cell(out.clone());
        let input = self.clone();
        self.cell().on_complete(move || match input.cell().error() {
            None => out.complete(Ok(())),
            Some(e) => out.complete(Err(e)),
        });
        ret
    }

    /// Waits for completion while donating the current thread to the given
    /// cooperative scheduler: other runnable routines and queued tasks
    /// execute here until this future completes.
    pub fn wait_on(&self, scheduler: &CoopHandle) {
        if self.is_complete() {
            return;
        }
        let id = scheduler.register_waiter();
        let s = scheduler.clone();
        self.cell().on_complete(move || s.mark_completed(id));
        scheduler.wait_for(id);
    }
}

impl<T: Clone + Send + 'static> Future<T> {
    /// [`Future::get`], donating the current thread to `scheduler` while
    /// waiting.
    pub fn get_on(&self, scheduler: &CoopHandle) -> Result<T> {
        self.wait_on(scheduler);
        self.cell().get()
    }
}

/// Futures can be awaited from cooperative routines: readiness is the
/// cell's completion, suspension registers a waker-waking continuation, and
/// resumption moves the outcome out (single consumer).
impl<T: Send + 'static> std::future::Future for Future<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T>> {
        let cell = self.cell();
        if cell.is_complete() {
            return Poll::Ready(cell.take());
        }
        let waker = cx.waker().clone();
        cell.on_complete(move || waker.wake());
        Poll::Pending
    }
}

/// The producing side of a promise/future pair. There is exactly one
/// producer; dropping it without completing fails the pair so that no
/// consumer blocks forever on an abandoned computation.
pub struct Promise<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Promise<T> {
    /// Creates the promise/future pair.
    pub fn new() -> Promise<T> {
        Promise {
            cell: Arc::new(Cell::new()),
        }
    }

    /// Completes the pair with a value. Must be called at most once per
    /// pair, counting [`Promise::fail`].
    pub fn set(&self, value: T) {
        self.cell.complete(Ok(value));
    }

    /// Completes the pair with an error. Must be called at most once per
    /// pair, counting [`Promise::set`].
    pub fn fail(&self, error: TaskError) {
        self.cell.complete(Err(error));
    }

    /// Returns the consumer side of the pair.
    pub fn future(&self) -> Future<T> {
        Future::from_cell(self.cell.clone())
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Promise<T> {
        Promise::new()
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if !self.cell.is_complete() {
            self.cell
                .complete_if_pending(Err(TaskError::msg("promise dropped before completion")));
        }
    }
}

/// Returns an already-completed future holding `value`. `completed_future(())`
/// covers the value-less case.
pub fn completed_future<T>(value: T) -> Future<T> {
    let cell = Arc::new(Cell::new());
    cell.complete(Ok(value));
    Future::from_cell(cell)
}

/// Returns a future already completed with the given error.
pub fn failed_future<T>(error: TaskError) -> Future<T> {
    let cell = Arc::new(Cell::new());
    cell.complete(Err(error));
    Future::from_cell(cell)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn completed_future_round_trip() {
        let f = completed_future(42);
        assert!(f.is_complete());
        assert_eq!(f.get().unwrap(), 42);
        let cont = Arc::new(AtomicI32::new(0));
        let c = cont.clone();
        let f2 = f.clone();
        f.on_complete(move || {
            c.store(2 * f2.get().unwrap(), Ordering::SeqCst);
        });
        assert_eq!(cont.load(Ordering::SeqCst), 84);
    }

    #[test]
    fn failed_future_round_trip() {
        let f: Future<i32> = failed_future(TaskError::msg("nope"));
        assert!(f.is_failed());
        assert!(f.get().is_err());
        assert!(f.error().is_some());
    }

    #[test]
    fn deferred_completion_from_another_thread() {
        let p = Promise::new();
        let f = p.future();
        let cont = Arc::new(AtomicI32::new(0));

        let c = cont.clone();
        let observer = f.clone();
        f.on_complete(move || {
            c.store(observer.get().unwrap() + 1, Ordering::SeqCst);
        });
        assert!(!f.is_complete());
        assert_eq!(cont.load(Ordering::SeqCst), 0);

        let setter = thread::spawn(move || p.set(10));
        assert_eq!(f.get().unwrap(), 10);
        setter.join().unwrap();
        assert!(f.is_normal());
        assert_eq!(cont.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn dropped_promise_fails_the_future() {
        let f = {
            let p: Promise<i32> = Promise::new();
            p.future()
        };
        assert!(f.is_failed());
        assert!(f.get().is_err());
    }

    #[test]
    fn as_unit_tracks_outcome() {
        let p = Promise::new();
        let u = p.future().as_unit();
        assert!(!u.is_complete());
        p.set(5);
        u.wait();
        assert!(u.is_normal());

        let q: Promise<i32> = Promise::new();
        let v = q.future().as_unit();
        q.fail(TaskError::msg("boom"));
        v.wait();
        assert!(v.is_failed());
    }
}
