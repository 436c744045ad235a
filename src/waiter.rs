// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A registry that keeps fire-and-forget futures alive until they
//! complete.

use std::any::Any;
use std::sync::Arc;

use slab::Slab;
use sync::{Condvar, Mutex};

use crate::future::Future;

struct WaiterInner {
    // The stored handles only exist to keep their cells alive; the value
    // type is erased.
    entries: Mutex<Slab<Box<dyn Any + Send>>>,
    cv: Condvar,
}

/// Holds futures whose side effects matter but whose values nobody reads,
/// so the underlying computations stay alive, and lets a caller block
/// until all of them have completed.
pub struct FutureWaiter {
    inner: Arc<WaiterInner>,
}

impl FutureWaiter {
    pub fn new() -> FutureWaiter {
        FutureWaiter {
            inner: Arc::new(WaiterInner {
                entries: Mutex::new(Slab::new()),
                cv: Condvar::new(),
            }),
        }
    }

    /// Registers a future. It is held until it completes, at which point it
    /// is released automatically.
    pub fn add<T: Send + 'static>(&self, future: Future<T>) {
        let key = self.inner.entries.lock().insert(Box::new(future.clone()));
        let inner = self.inner.clone();
        future.on_complete(move || {
            let mut entries = inner.entries.lock();
            entries.remove(key);
            if entries.is_empty() {
                inner.cv.notify_all();
            }
        });
    }

    /// Blocks until every registered future has completed.
    pub fn wait_all(&self) {
        let entries = self.inner.entries.lock();
        let _entries = self.inner.cv.wait_while(entries, |e| !e.is_empty());
    }
}

impl Default for FutureWaiter {
    fn default() -> FutureWaiter {
        FutureWaiter::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::future::{completed_future, Promise};

    #[test]
    fn wait_all_blocks_until_every_future_completes() {
        let waiter = Arc::new(FutureWaiter::new());

        let p1 = Promise::new();
        waiter.add(p1.future());
        let p2 = Promise::new();
        waiter.add(p2.future());
        waiter.add(completed_future(()));
        p2.set(1);
        let p3 = Promise::new();
        waiter.add(p3.future());

        let finished = Arc::new(AtomicBool::new(false));
        let watcher = {
            let (waiter, finished) = (waiter.clone(), finished.clone());
            thread::spawn(move || {
                waiter.wait_all();
                finished.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(10));
        assert!(!finished.load(Ordering::SeqCst));
        p1.set(2);
        p3.set(3);
        watcher.join().unwrap();
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn empty_waiter_does_not_block() {
        FutureWaiter::new().wait_all();
    }
}
