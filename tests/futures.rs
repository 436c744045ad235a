// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end tests of the future handles and continuation combinators.

mod common;

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use promise_async::{
    execute_async_loop_on, failed_future, run_async_on, when_all, when_all_futures_on,
    when_all_vec_on, Future, Promise, TaskError, ThreadPool,
};
use thiserror::Error;

use crate::common::{complete_later, delay, execute_later};

#[derive(Debug, Error)]
#[error("test failure carrying {0}")]
struct TestError(i32);

#[test]
fn run_async_starts_immediately() {
    let pool = ThreadPool::new(8);
    let f = run_async_on(&pool.handle(), || {
        delay(10);
        Ok(42)
    });
    assert_eq!(f.get().unwrap(), 42);
    assert!(f.is_complete());
}

#[test]
fn then_chain_on_explicit_pool() {
    let pool = ThreadPool::new(8);
    let ex = pool.handle();
    let p = Promise::new();
    let var = Arc::new(AtomicI32::new(0));
    let v1 = var.clone();
    let v2 = var.clone();
    let f = p
        .future()
        .then_on(&ex, |a: i32| {
            delay(10);
            Ok(a + 1)
        })
        .then_on(&ex, move |a| {
            delay(10);
            v1.store(a + 1, Ordering::SeqCst);
            Ok(())
        })
        .then_on(&ex, move |()| {
            delay(10);
            Ok(v2.load(Ordering::SeqCst) + 1)
        });
    delay(20);
    assert!(!f.is_complete());
    p.set(10);
    assert_eq!(f.get().unwrap(), 13);
    assert_eq!(var.load(Ordering::SeqCst), 12);
    assert!(f.is_complete());
}

#[test]
fn then_chain_on_default_executor() {
    let p = Promise::new();
    let var = Arc::new(AtomicI32::new(0));
    let v1 = var.clone();
    let v2 = var.clone();
    let f = p
        .future()
        .then(|a: i32| Ok(a + 1))
        .then(move |a| {
            v1.store(a + 1, Ordering::SeqCst);
            Ok(())
        })
        .then(move |()| Ok(v2.load(Ordering::SeqCst) + 1));
    p.set(10);
    assert_eq!(f.get().unwrap(), 13);
    assert_eq!(var.load(Ordering::SeqCst), 12);
}

#[test]
fn then_async_chains_through_inner_futures() {
    let p = Promise::new();
    let var = Arc::new(AtomicI32::new(0));
    let v1 = var.clone();
    let v2 = var.clone();
    let f = p
        .future()
        .then_async(|a: i32| complete_later(a + 1, 20))
        .then_async(move |a| {
            let v1 = v1.clone();
            execute_later(
                move || {
                    v1.store(a + 1, Ordering::SeqCst);
                    Ok(())
                },
                10,
            )
        })
        .then_async(move |()| {
            let v2 = v2.clone();
            execute_later(move || Ok(v2.load(Ordering::SeqCst) + 1), 10)
        });
    delay(20);
    assert!(!f.is_complete());
    p.set(10);
    assert_eq!(f.get().unwrap(), 13);
    assert_eq!(var.load(Ordering::SeqCst), 12);
}

#[test]
fn when_all_futures_passes_the_handles() {
    let pool = ThreadPool::new(8);
    let p = Promise::new();
    let f = when_all_futures_on(
        &pool.handle(),
        |(fv,): (Future<i32>,)| {
            delay(10);
            Ok(fv.get()? + 1)
        },
        (p.future(),),
    );
    delay(20);
    assert!(!f.is_complete());
    p.set(10);
    assert_eq!(f.get().unwrap(), 11);
}

#[test]
fn when_all_waits_for_the_last_input() {
    let pi = Promise::new();
    let pv = Promise::new();
    let pi2 = Promise::new();
    let seen = Arc::new(AtomicI32::new(0));
    let s = seen.clone();
    let f = when_all(
        move |(a, (), b)| {
            s.store(a + b, Ordering::SeqCst);
            Ok(a + b)
        },
        (pi.future(), pv.future(), pi2.future()),
    );

    pv.set(());
    pi.set(20);
    delay(20);
    assert_eq!(seen.load(Ordering::SeqCst), 0);
    pi2.set(5);
    assert_eq!(f.get().unwrap(), 25);
    assert_eq!(seen.load(Ordering::SeqCst), 25);
}

#[test]
fn when_all_moves_non_clonable_values() {
    struct Token(String);

    let p1 = Promise::new();
    let p2 = Promise::new();
    let f = when_all(
        |(a, b): (Token, Token)| Ok(format!("{}+{}", a.0, b.0)),
        (p1.future(), p2.future()),
    );
    p1.set(Token("left".to_string()));
    p2.set(Token("right".to_string()));
    assert_eq!(f.get().unwrap(), "left+right");
}

#[test]
fn when_all_vec_joins_a_dynamic_set() {
    let pool = ThreadPool::new(8);
    let promises: Vec<Promise<i32>> = (0..6).map(|_| Promise::new()).collect();
    let futures = promises.iter().map(|p| p.future()).collect();
    let f = when_all_vec_on(
        &pool.handle(),
        |futures| {
            let mut sum = 0;
            for fut in futures {
                sum += fut.get()?;
            }
            Ok(sum)
        },
        futures,
    );
    for (i, p) in promises.iter().enumerate() {
        p.set(i as i32);
    }
    assert_eq!(f.get().unwrap(), 15);
}

#[test]
fn reset_releases_one_handle_without_touching_the_rest() {
    let p = Promise::new();
    let f = p.future();
    let mut spare = f.clone();
    spare.reset();
    p.set(3);
    assert_eq!(f.get().unwrap(), 3);
}

#[test]
fn failure_reaches_get() {
    let p = Promise::new();
    let f = p.future().then(|a: i32| -> promise_async::Result<i32> {
        Err(TaskError::new(TestError(a + 1)))
    });
    p.set(42);
    f.wait();
    assert!(f.is_failed());
    let error = f.get().unwrap_err();
    assert_eq!(error.downcast_ref::<TestError>().unwrap().0, 43);
}

#[test]
fn failure_propagates_through_later_stages() {
    let p = Promise::new();
    let f = p
        .future()
        .then(|a: i32| -> promise_async::Result<i32> { Err(TaskError::new(TestError(a + 1))) })
        .then(|a| Ok(a + 1))
        .then(|a| Ok(a + 1));
    p.set(42);
    f.wait();
    assert!(f.is_failed());
    let error = f.error().unwrap();
    assert_eq!(error.downcast_ref::<TestError>().unwrap().0, 43);
}

#[test]
fn typed_catch_handles_matching_failures() {
    let p = Promise::new();
    let f = p
        .future()
        .then(|a: i32| -> promise_async::Result<i32> { Err(TaskError::new(TestError(a + 1))) })
        .then_catch::<TestError, _>(|e| Ok(e.0 + 1));
    delay(20);
    assert!(!f.is_complete());
    p.set(10);
    assert_eq!(f.get().unwrap(), 12);
}

#[test]
fn typed_catch_passes_through_normal_values() {
    let p = Promise::new();
    let f = p
        .future()
        .then(|a: i32| Ok(a - 1))
        .then_catch::<TestError, _>(|e| Ok(e.0 + 1));
    p.set(10);
    assert_eq!(f.get().unwrap(), 9);
}

#[test]
fn typed_catch_propagates_other_payloads() {
    #[derive(Debug, Error)]
    #[error("some other failure")]
    struct OtherError;

    let p = Promise::new();
    let f = p
        .future()
        .then(|a: i32| -> promise_async::Result<i32> { Err(TaskError::new(TestError(a + 1))) })
        .then_catch::<OtherError, _>(|_| Ok(0));
    p.set(10);
    f.wait();
    assert!(f.is_failed());
    // The original payload survives unchanged.
    assert_eq!(f.error().unwrap().downcast_ref::<TestError>().unwrap().0, 11);
}

#[test]
fn typed_catch_async_resolves_through_a_future() {
    let p = Promise::new();
    let f = p
        .future()
        .then(|a: i32| -> promise_async::Result<i32> { Err(TaskError::new(TestError(a + 1))) })
        .then_catch_async::<TestError, _>(|e| complete_later(e.0 + 1, 10));
    p.set(10);
    assert_eq!(f.get().unwrap(), 12);
}

#[test]
fn catch_all_async_sees_any_failure() {
    let p = Promise::new();
    let f = p
        .future()
        .then(|a: i32| -> promise_async::Result<i32> { Err(TaskError::new(TestError(a + 1))) })
        .then_catch_all_async(|error| {
            let carried = error.downcast_ref::<TestError>().map(|e| e.0).unwrap_or(-1);
            complete_later(carried + 1, 10)
        });
    p.set(10);
    assert_eq!(f.get().unwrap(), 12);
}

#[test]
fn async_loop_runs_until_the_condition_fails() {
    let pool = ThreadPool::new(8);
    let ex = pool.handle();
    let body_ex = ex.clone();
    let f = execute_async_loop_on(
        &ex,
        |v: &i32| *v < 52,
        move |v| {
            run_async_on(&body_ex, move || {
                delay(20);
                Ok(v + 1)
            })
        },
        42,
    );
    assert_eq!(f.get().unwrap(), 52);
}

#[test]
fn async_loop_seeded_by_a_future() {
    let p = Promise::new();
    let f = p
        .future()
        .then_async_loop(|v: &i32| *v < 10, |v| complete_later(v + 1, 1));
    delay(20);
    assert!(!f.is_complete());
    p.set(0);
    assert_eq!(f.get().unwrap(), 10);
}

#[test]
fn async_loop_propagates_body_failures() {
    let f = execute_async_loop_on(
        &ThreadPool::new(4).handle(),
        |v: &i32| *v < 100,
        |v| {
            if v == 3 {
                failed_future(TaskError::new(TestError(v)))
            } else {
                complete_later(v + 1, 1)
            }
        },
        0,
    );
    f.wait();
    assert!(f.is_failed());
    assert_eq!(f.error().unwrap().downcast_ref::<TestError>().unwrap().0, 3);
}
