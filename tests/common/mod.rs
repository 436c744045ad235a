// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::thread;
use std::time::Duration;

use promise_async::{run_async, Future, Result};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn delay(ms: u64) {
    thread::sleep(Duration::from_millis(ms));
}

/// A future that completes with `value` after `ms` milliseconds, on the
/// default pool.
pub fn complete_later<T: Send + 'static>(value: T, ms: u64) -> Future<T> {
    run_async(move || {
        thread::sleep(Duration::from_millis(ms));
        Ok(value)
    })
}

/// A future that runs `func` after `ms` milliseconds, on the default pool.
pub fn execute_later<T, F>(func: F, ms: u64) -> Future<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    run_async(move || {
        thread::sleep(Duration::from_millis(ms));
        func()
    })
}
