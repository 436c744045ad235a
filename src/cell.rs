// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The shared completion record behind a promise/future pair.
//!
//! A `Cell` starts pending and transitions exactly once to either a normal
//! value or an error. Continuations registered before the transition run on
//! the completing thread, in registration order, with no lock held;
//! continuations registered after the transition run inline on the
//! registering thread before the registration call returns.

use std::sync::atomic::{AtomicU8, Ordering};

use sync::{Condvar, Mutex};

use crate::error::{Result, TaskError};

const PENDING: u8 = 0;
const NORMAL: u8 = 1;
const FAILED: u8 = 2;

/// A continuation attached to a cell.
pub(crate) type Callback = Box<dyn FnOnce() + Send>;

enum Outcome<T> {
    Pending,
    /// `None` once the value has been moved out by the single consumer.
    Normal(Option<T>),
    Failed(TaskError),
}

/// The completion record. Shared via `Arc` between the producing side (a
/// `Promise` or a combinator) and every `Future` handle observing it.
pub(crate) struct Cell<T> {
    state: AtomicU8,
    cv: Condvar,
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    outcome: Outcome<T>,
    callbacks: Vec<Callback>,
}

impl<T> Cell<T> {
    pub fn new() -> Cell<T> {
        Cell {
            state: AtomicU8::new(PENDING),
            cv: Condvar::new(),
            inner: Mutex::new(Inner {
                outcome: Outcome::Pending,
                callbacks: Vec::new(),
            }),
        }
    }

    /// Snapshot read. A false result can be outdated by the time the caller
    /// can act on it.
    pub fn is_complete(&self) -> bool {
        self.state.load(Ordering::Acquire) != PENDING
    }

    pub fn is_normal(&self) -> bool {
        self.state.load(Ordering::Acquire) == NORMAL
    }

    pub fn is_failed(&self) -> bool {
        self.state.load(Ordering::Acquire) == FAILED
    }

    /// Blocks the current thread until the cell is terminal.
    pub fn wait(&self) {
        if self.is_complete() {
            return;
        }
        let mut inner = self.inner.lock();
        while self.state.load(Ordering::Acquire) == PENDING {
            inner = self.cv.wait(inner);
        }
    }

    /// Waits, then returns the stored error if the cell failed.
    pub fn error(&self) -> Option<TaskError> {
        self.wait();
        match &self.inner.lock().outcome {
            Outcome::Failed(e) => Some(e.clone()),
            _ => None,
        }
    }

    /// Waits, then moves the value out. The value of a cell can be moved
    /// out only once; a failed cell's error can be observed any number of
    /// times.
    pub fn take(&self) -> Result<T> {
        self.wait();
        match &mut self.inner.lock().outcome {
            Outcome::Normal(value) => match value.take() {
                Some(v) => Ok(v),
                None => panic!("future value consumed twice"),
            },
            Outcome::Failed(e) => Err(e.clone()),
            Outcome::Pending => unreachable!("wait() returned on a pending cell"),
        }
    }

    /// Waits, then returns a clone of the value.
    pub fn get(&self) -> Result<T>
    where
        T: Clone,
    {
        self.wait();
        match &self.inner.lock().outcome {
            Outcome::Normal(Some(v)) => Ok(v.clone()),
            Outcome::Normal(None) => panic!("future value already consumed"),
            Outcome::Failed(e) => Err(e.clone()),
            Outcome::Pending => unreachable!("wait() returned on a pending cell"),
        }
    }

    /// Registers a continuation. Runs it inline if the cell is already
    /// terminal.
    pub fn on_complete(&self, callback: impl FnOnce() + Send + 'static) {
        {
            let mut inner = self.inner.lock();
            if self.state.load(Ordering::Acquire) == PENDING {
                inner.callbacks.push(Box::new(callback));
                return;
            }
        }
        callback();
    }

    /// Transitions the cell. Must be called exactly once; the outcome is
    /// published before the state flip, blocked waiters are woken, and the
    /// continuation chain is drained and run in registration order with no
    /// lock held.
    pub fn complete(&self, result: Result<T>) {
        let callbacks = {
            let mut inner = self.inner.lock();
            assert!(
                matches!(inner.outcome, Outcome::Pending),
                "completion cell transitioned twice"
            );
            let state = match result {
                Ok(v) => {
                    inner.outcome = Outcome::Normal(Some(v));
                    NORMAL
                }
                Err(e) => {
                    inner.outcome = Outcome::Failed(e);
                    FAILED
                }
            };
            self.state.store(state, Ordering::Release);
            self.cv.notify_all();
            std::mem::take(&mut inner.callbacks)
        };
        for callback in callbacks {
            callback();
        }
    }

    /// Like `complete`, but a no-op if the cell is already terminal.
    /// Returns whether this call performed the transition. Used where two
    /// racing completers are legal, e.g. a timer firing against its
    /// cancellation.
    pub fn complete_if_pending(&self, result: Result<T>) -> bool {
        let callbacks = {
            let mut inner = self.inner.lock();
            if !matches!(inner.outcome, Outcome::Pending) {
                return false;
            }
            let state = match result {
                Ok(v) => {
                    inner.outcome = Outcome::Normal(Some(v));
                    NORMAL
                }
                Err(e) => {
                    inner.outcome = Outcome::Failed(e);
                    FAILED
                }
            };
            self.state.store(state, Ordering::Release);
            self.cv.notify_all();
            std::mem::take(&mut inner.callbacks)
        };
        for callback in callbacks {
            callback();
        }
        true
    }
}
