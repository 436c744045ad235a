// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Spawning cooperative routines.
//!
//! A routine is a plain `std::future::Future` run as an `async_task`
//! runnable on a [`CoopScheduler`]. Suspension points are the `await`s on
//! library futures and stream operations; waking goes through
//! `mark_runnable`, and the routine's result lands in an ordinary
//! [`Future`].

use std::sync::Arc;

use async_task::Runnable;
use log::debug;

use crate::cell::Cell;
use crate::coop::CoopHandle;
use crate::error::Result;
use crate::future::Future;

fn spawn_with<T, Fut>(scheduler: &CoopHandle, force_switch: bool, routine: Fut) -> Future<T>
where
    T: Send + 'static,
    Fut: std::future::Future<Output = Result<T>> + Send + 'static,
{
    let cell = Arc::new(Cell::new());
    let ret = Future::from_cell(cell.clone());
    let wrapped = async move {
        cell.complete(routine.await);
    };
    let sched = scheduler.clone();
    let (runnable, task) = async_task::spawn(wrapped, move |r: Runnable| {
        sched.mark_runnable(r, false)
    });
    task.detach();
    if force_switch || scheduler.init_switch_thread() {
        debug!("routine hopping onto scheduler {:#x}", scheduler.address());
        runnable.schedule();
    } else {
        runnable.run();
    }
    ret
}

/// Starts `routine` eagerly on the calling thread; it keeps running there
/// until its first suspension point, unless the scheduler requires new
/// routines to hop onto its own threads right away. The returned future
/// completes with the routine's result.
pub fn spawn_routine<T, Fut>(scheduler: &CoopHandle, routine: Fut) -> Future<T>
where
    T: Send + 'static,
    Fut: std::future::Future<Output = Result<T>> + Send + 'static,
{
    spawn_with(scheduler, false, routine)
}

/// Like [`spawn_routine`], but always hands the routine to the scheduler
/// instead of starting it on the calling thread.
pub fn spawn_routine_parallel<T, Fut>(scheduler: &CoopHandle, routine: Fut) -> Future<T>
where
    T: Send + 'static,
    Fut: std::future::Future<Output = Result<T>> + Send + 'static,
{
    spawn_with(scheduler, true, routine)
}
