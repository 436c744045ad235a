// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Continuation combinators over [`Future`].
//!
//! Every combinator follows the same skeleton: allocate an output cell that
//! owns the input handles, subscribe a completion callback on each input,
//! and when the last input turns terminal either enqueue the user function
//! on the executor or complete the output directly (error propagation never
//! runs the user function; catch handlers run only on failure). Input
//! handles are dropped as soon as their value has been consumed so that
//! upstream cells are released early.
//!
//! Each combinator comes in two forms: the short one runs the user function
//! on [`default_executor`], the `_on` one takes an explicit executor.

use std::fmt::{Debug, Display};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sync::Mutex;

use crate::cell::Cell;
use crate::error::{Result, TaskError};
use crate::executor::{default_executor, ExecutorHandle};
use crate::future::{failed_future, Future};

impl<T: Send + 'static> Future<T> {
    /// Runs `func` on the executor with this future's value once it is
    /// available; the returned future completes with the function's result.
    /// A failure of this future propagates without running `func`.
    pub fn then_on<R, F>(&self, ex: &ExecutorHandle, func: F) -> Future<R>
    where
        R: Send + 'static,
        F: FnOnce(T) -> Result<R> + Send + 'static,
    {
        let out = Arc::new(Cell::new());
        let ret = Future::from_cell(out.clone());
        let input = self.clone();
        let ex = ex.clone();
        self.on_complete(move || {
            if input.is_normal() {
                ex.enqueue(Box::new(move || match input.take() {
                    Ok(value) => out.complete(func(value)),
                    Err(e) => out.complete(Err(e)),
                }));
            } else {
                match input.error() {
                    Some(e) => out.complete(Err(e)),
                    None => unreachable!("completed future is neither normal nor failed"),
                }
            }
        });
        ret
    }

    /// [`Future::then_on`] on the default executor.
    pub fn then<R, F>(&self, func: F) -> Future<R>
    where
        R: Send + 'static,
        F: FnOnce(T) -> Result<R> + Send + 'static,
    {
        self.then_on(&default_executor(), func)
    }

    /// Runs the asynchronous `func` on the executor once this future's
    /// value is available; the returned future completes when the future
    /// returned by `func` does, adopting its outcome.
    pub fn then_async_on<R, F>(&self, ex: &ExecutorHandle, func: F) -> Future<R>
    where
        R: Send + 'static,
        F: FnOnce(T) -> Future<R> + Send + 'static,
    {
        let out = Arc::new(Cell::new());
        let ret = Future::from_cell(out.clone());
        let input = self.clone();
        let ex = ex.clone();
        self.on_complete(move || {
            if input.is_normal() {
                let ex_adopt = ex.clone();
                ex.enqueue(Box::new(move || {
                    let value = match input.take() {
                        Ok(v) => v,
                        Err(e) => {
                            out.complete(Err(e));
                            return;
                        }
                    };
                    let inner = func(value);
                    let observer = inner.clone();
                    inner.on_complete(move || {
                        if observer.is_normal() {
                            ex_adopt.enqueue(Box::new(move || out.complete(observer.take())));
                        } else {
                            match observer.error() {
                                Some(e) => out.complete(Err(e)),
                                None => {
                                    unreachable!("completed future is neither normal nor failed")
                                }
                            }
                        }
                    });
                }));
            } else {
                match input.error() {
                    Some(e) => out.complete(Err(e)),
                    None => unreachable!("completed future is neither normal nor failed"),
                }
            }
        });
        ret
    }

    /// [`Future::then_async_on`] on the default executor.
    pub fn then_async<R, F>(&self, func: F) -> Future<R>
    where
        R: Send + 'static,
        F: FnOnce(T) -> Future<R> + Send + 'static,
    {
        self.then_async_on(&default_executor(), func)
    }

    /// Once this future completes, keeps running `body` for as long as
    /// `cond` holds on the latest value. The returned future completes with
    /// the first value rejected by `cond`, or with the first error produced
    /// by this future or any iteration.
    pub fn then_async_loop_on<C, B>(&self, ex: &ExecutorHandle, cond: C, body: B) -> Future<T>
    where
        C: Fn(&T) -> bool + Send + Sync + 'static,
        B: FnMut(T) -> Future<T> + Send + 'static,
    {
        let out = Arc::new(Cell::new());
        let ret = Future::from_cell(out.clone());
        let driver = Arc::new(LoopDriver {
            ex: ex.clone(),
            cond,
            body: Mutex::new(body),
            out,
        });
        let input = self.clone();
        self.on_complete(move || match input.take() {
            Ok(value) => driver.step(value),
            Err(e) => driver.out.complete(Err(e)),
        });
        ret
    }

    /// [`Future::then_async_loop_on`] on the default executor.
    pub fn then_async_loop<C, B>(&self, cond: C, body: B) -> Future<T>
    where
        C: Fn(&T) -> bool + Send + Sync + 'static,
        B: FnMut(T) -> Future<T> + Send + 'static,
    {
        self.then_async_loop_on(&default_executor(), cond, body)
    }

    /// Completes with this future's value, or with the handler's result if
    /// this future fails. The handler runs on the executor.
    pub fn then_catch_all_on<F>(&self, ex: &ExecutorHandle, handler: F) -> Future<T>
    where
        F: FnOnce(TaskError) -> Result<T> + Send + 'static,
    {
        let out = Arc::new(Cell::new());
        let ret = Future::from_cell(out.clone());
        let input = self.clone();
        let ex = ex.clone();
        self.on_complete(move || match input.error() {
            None => out.complete(input.take()),
            Some(e) => ex.enqueue(Box::new(move || out.complete(handler(e)))),
        });
        ret
    }

    /// [`Future::then_catch_all_on`] on the default executor.
    pub fn then_catch_all<F>(&self, handler: F) -> Future<T>
    where
        F: FnOnce(TaskError) -> Result<T> + Send + 'static,
    {
        self.then_catch_all_on(&default_executor(), handler)
    }

    /// Like [`Future::then_catch_all_on`], but the handler only sees
    /// failures whose payload is an `E`; any other error propagates
    /// unchanged.
    pub fn then_catch_on<E, F>(&self, ex: &ExecutorHandle, handler: F) -> Future<T>
    where
        E: Display + Debug + Send + Sync + 'static,
        F: FnOnce(&E) -> Result<T> + Send + 'static,
    {
        self.then_catch_all_on(ex, move |error| {
            if let Some(e) = error.downcast_ref::<E>() {
                return handler(e);
            }
            Err(error)
        })
    }

    /// [`Future::then_catch_on`] on the default executor.
    pub fn then_catch<E, F>(&self, handler: F) -> Future<T>
    where
        E: Display + Debug + Send + Sync + 'static,
        F: FnOnce(&E) -> Result<T> + Send + 'static,
    {
        self.then_catch_on::<E, F>(&default_executor(), handler)
    }

    /// Completes with this future's value, or — if it fails — with the
    /// outcome of the future returned by the handler.
    pub fn then_catch_all_async_on<F>(&self, ex: &ExecutorHandle, handler: F) -> Future<T>
    where
        F: FnOnce(TaskError) -> Future<T> + Send + 'static,
    {
        let out = Arc::new(Cell::new());
        let ret = Future::from_cell(out.clone());
        let input = self.clone();
        let ex = ex.clone();
        self.on_complete(move || match input.error() {
            None => out.complete(input.take()),
            Some(e) => ex.enqueue(Box::new(move || {
                let inner = handler(e);
                let observer = inner.clone();
                inner.on_complete(move || out.complete(observer.take()));
            })),
        });
        ret
    }

    /// [`Future::then_catch_all_async_on`] on the default executor.
    pub fn then_catch_all_async<F>(&self, handler: F) -> Future<T>
    where
        F: FnOnce(TaskError) -> Future<T> + Send + 'static,
    {
        self.then_catch_all_async_on(&default_executor(), handler)
    }

    /// Asynchronous variant of [`Future::then_catch_on`]: failures with an
    /// `E` payload are handed to the asynchronous handler, anything else
    /// propagates unchanged.
    pub fn then_catch_async_on<E, F>(&self, ex: &ExecutorHandle, handler: F) -> Future<T>
    where
        E: Display + Debug + Send + Sync + 'static,
        F: FnOnce(&E) -> Future<T> + Send + 'static,
    {
        self.then_catch_all_async_on(ex, move |error| {
            if let Some(e) = error.downcast_ref::<E>() {
                return handler(e);
            }
            failed_future(error)
        })
    }

    /// [`Future::then_catch_async_on`] on the default executor.
    pub fn then_catch_async<E, F>(&self, handler: F) -> Future<T>
    where
        E: Display + Debug + Send + Sync + 'static,
        F: FnOnce(&E) -> Future<T> + Send + 'static,
    {
        self.then_catch_async_on::<E, F>(&default_executor(), handler)
    }
}

/// Starts `func` on the executor right away and returns the future of its
/// result.
pub fn run_async_on<R, F>(ex: &ExecutorHandle, func: F) -> Future<R>
where
    R: Send + 'static,
    F: FnOnce() -> Result<R> + Send + 'static,
{
    let cell = Arc::new(Cell::new());
    let ret = Future::from_cell(cell.clone());
    ex.enqueue(Box::new(move || cell.complete(func())));
    ret
}

/// [`run_async_on`] on the default executor.
pub fn run_async<R, F>(func: F) -> Future<R>
where
    R: Send + 'static,
    F: FnOnce() -> Result<R> + Send + 'static,
{
    run_async_on(&default_executor(), func)
}

struct LoopDriver<T, C, B> {
    ex: ExecutorHandle,
    cond: C,
    body: Mutex<B>,
    out: Arc<Cell<T>>,
}

impl<T, C, B> LoopDriver<T, C, B>
where
    T: Send + 'static,
    C: Fn(&T) -> bool + Send + Sync + 'static,
    B: FnMut(T) -> Future<T> + Send + 'static,
{
    fn step(self: Arc<Self>, value: T) {
        if !(self.cond)(&value) {
            self.out.complete(Ok(value));
            return;
        }
        let iteration = {
            let mut body = self.body.lock();
            (&mut *body)(value)
        };
        let observer = iteration.clone();
        let driver = self;
        // Each iteration re-enters through the executor, so arbitrarily
        // long loops cannot grow the stack.
        iteration.on_complete(move || {
            let ex = driver.ex.clone();
            ex.enqueue(Box::new(move || match observer.take() {
                Ok(next) => driver.step(next),
                Err(e) => driver.out.complete(Err(e)),
            }));
        });
    }
}

/// Runs `body` starting from `seed` for as long as `cond` holds, chaining
/// each iteration's future into the next. The returned future completes
/// with the first value rejected by `cond`, or with the first error.
pub fn execute_async_loop_on<T, C, B>(ex: &ExecutorHandle, cond: C, body: B, seed: T) -> Future<T>
where
    T: Send + 'static,
    C: Fn(&T) -> bool + Send + Sync + 'static,
    B: FnMut(T) -> Future<T> + Send + 'static,
{
    let out = Arc::new(Cell::new());
    let ret = Future::from_cell(out.clone());
    let driver = Arc::new(LoopDriver {
        ex: ex.clone(),
        cond,
        body: Mutex::new(body),
        out,
    });
    driver.step(seed);
    ret
}

/// [`execute_async_loop_on`] on the default executor.
pub fn execute_async_loop<T, C, B>(cond: C, body: B, seed: T) -> Future<T>
where
    T: Send + 'static,
    C: Fn(&T) -> bool + Send + Sync + 'static,
    B: FnMut(T) -> Future<T> + Send + 'static,
{
    execute_async_loop_on(&default_executor(), cond, body, seed)
}

/// A set of input futures accepted by the `when_all` family: tuples of
/// `Future<T>` up to five elements, or a `Vec<Future<T>>`.
pub trait JoinList: Send + 'static {
    /// The tuple (or vector) of values carried by the inputs.
    type Values;

    /// Number of inputs.
    fn len(&self) -> usize;

    /// Registers one freshly made completion callback per input.
    fn subscribe(&self, make_callback: &mut dyn FnMut() -> Box<dyn FnOnce() + Send>);

    /// Consumes the inputs, moving every value out. Returns the first
    /// failure in input order, if any.
    fn take_values(self) -> Result<Self::Values>;
}

macro_rules! impl_join_list {
    ($(($T:ident, $idx:tt)),+) => {
        impl<$($T: Send + 'static),+> JoinList for ($(Future<$T>,)+) {
            type Values = ($($T,)+);

            fn len(&self) -> usize {
                [$($idx,)+].len()
            }

            fn subscribe(&self, make_callback: &mut dyn FnMut() -> Box<dyn FnOnce() + Send>) {
                $( self.$idx.on_complete(make_callback()); )+
            }

            fn take_values(self) -> Result<Self::Values> {
                Ok(($(self.$idx.take()?,)+))
            }
        }
    };
}

impl_join_list!((T0, 0));
impl_join_list!((T0, 0), (T1, 1));
impl_join_list!((T0, 0), (T1, 1), (T2, 2));
impl_join_list!((T0, 0), (T1, 1), (T2, 2), (T3, 3));
impl_join_list!((T0, 0), (T1, 1), (T2, 2), (T3, 3), (T4, 4));

impl<T: Send + 'static> JoinList for Vec<Future<T>> {
    type Values = Vec<T>;

    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn subscribe(&self, make_callback: &mut dyn FnMut() -> Box<dyn FnOnce() + Send>) {
        for future in self {
            future.on_complete(make_callback());
        }
    }

    fn take_values(self) -> Result<Vec<T>> {
        self.into_iter().map(|f| f.take()).collect()
    }
}

struct JoinCore<L, F, R> {
    ex: ExecutorHandle,
    remaining: AtomicUsize,
    inputs: Mutex<Option<L>>,
    func: Mutex<Option<F>>,
    out: Arc<Cell<R>>,
}

impl<L, F, R> JoinCore<L, F, R>
where
    L: JoinList,
    F: FnOnce(L) -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    fn arm(ex: &ExecutorHandle, func: F, inputs: L) -> Future<R> {
        let out = Arc::new(Cell::new());
        let ret = Future::from_cell(out.clone());
        let count = inputs.len();
        let core = Arc::new(JoinCore {
            ex: ex.clone(),
            remaining: AtomicUsize::new(count),
            inputs: Mutex::new(Some(inputs)),
            func: Mutex::new(Some(func)),
            out,
        });
        if count == 0 {
            core.finish();
            return ret;
        }
        let guard = core.inputs.lock();
        match guard.as_ref() {
            Some(list) => list.subscribe(&mut || {
                let core = core.clone();
                Box::new(move || core.input_done())
            }),
            None => unreachable!("inputs taken before the join fired"),
        }
        ret
    }

    fn input_done(self: Arc<Self>) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish();
        }
    }

    fn finish(self: Arc<Self>) {
        let core = self;
        let ex = core.ex.clone();
        ex.enqueue(Box::new(move || {
            let inputs = core.inputs.lock().take();
            let func = core.func.lock().take();
            match (inputs, func) {
                (Some(inputs), Some(func)) => core.out.complete(func(inputs)),
                _ => unreachable!("join fired twice"),
            }
        }));
    }
}

/// Runs `func` on the executor once every input future has completed,
/// passing the input handles themselves; `func` decides how to unwrap
/// them. The returned future completes with the function's result.
pub fn when_all_futures_on<L, F, R>(ex: &ExecutorHandle, func: F, futures: L) -> Future<R>
where
    L: JoinList,
    F: FnOnce(L) -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    JoinCore::arm(ex, func, futures)
}

/// [`when_all_futures_on`] on the default executor.
pub fn when_all_futures<L, F, R>(func: F, futures: L) -> Future<R>
where
    L: JoinList,
    F: FnOnce(L) -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    when_all_futures_on(&default_executor(), func, futures)
}

/// Runs `func` on the executor once every input future has completed
/// normally, passing the values moved out of the inputs. If any input
/// failed, the first failure in input order propagates and `func` never
/// runs.
pub fn when_all_on<L, F, R>(ex: &ExecutorHandle, func: F, futures: L) -> Future<R>
where
    L: JoinList,
    F: FnOnce(L::Values) -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    when_all_futures_on(ex, move |list: L| func(list.take_values()?), futures)
}

/// [`when_all_on`] on the default executor.
pub fn when_all<L, F, R>(func: F, futures: L) -> Future<R>
where
    L: JoinList,
    F: FnOnce(L::Values) -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    when_all_on(&default_executor(), func, futures)
}

/// Dynamic-arity form of [`when_all_futures_on`]: the function receives
/// the whole vector of completed futures. An empty vector fires
/// immediately.
pub fn when_all_vec_on<T, F, R>(ex: &ExecutorHandle, func: F, futures: Vec<Future<T>>) -> Future<R>
where
    T: Send + 'static,
    F: FnOnce(Vec<Future<T>>) -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    when_all_futures_on(ex, func, futures)
}

/// [`when_all_vec_on`] on the default executor.
pub fn when_all_vec<T, F, R>(func: F, futures: Vec<Future<T>>) -> Future<R>
where
    T: Send + 'static,
    F: FnOnce(Vec<Future<T>>) -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    when_all_vec_on(&default_executor(), func, futures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::{completed_future, Promise};

    #[test]
    fn then_identity_law() {
        let f = completed_future(7);
        assert_eq!(f.then(Ok).get().unwrap(), 7);
    }

    #[test]
    fn then_chaining_associativity() {
        let g = |x: i32| x + 1;
        let h = |x: i32| x * 2;

        let split = completed_future(5).then(move |x| Ok(g(x))).then(move |x| Ok(h(x)));
        let fused = completed_future(5).then(move |x| Ok(h(g(x))));
        assert_eq!(split.get().unwrap(), fused.get().unwrap());
    }

    #[test]
    fn when_all_is_commutative_for_commutative_functions() {
        let (p1, p2) = (Promise::new(), Promise::new());
        let a = when_all(|(x, y)| Ok(x + y), (p1.future(), p2.future()));
        let b = when_all(|(x, y)| Ok(x + y), (p2.future(), p1.future()));
        p1.set(20);
        p2.set(5);
        assert_eq!(a.get().unwrap(), 25);
        assert_eq!(b.get().unwrap(), 25);
    }

    #[test]
    fn empty_when_all_vec_fires() {
        let futures: Vec<Future<i32>> = Vec::new();
        let f = when_all_vec(|fs| Ok(fs.len()), futures);
        assert_eq!(f.get().unwrap(), 0);
    }
}
