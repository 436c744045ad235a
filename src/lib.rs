// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Promise/future cells, continuation combinators, cooperative schedulers,
//! SPSC streams, and an alarm clock for thread-based asynchronous
//! pipelines.
//!
//! The atom of the library is the completion cell behind a
//! [`Promise`]/[`Future`] pair: a record that transitions exactly once from
//! pending to a value or a [`TaskError`], waking blocked waiters and firing
//! its continuation chain in registration order with no lock held.
//! Everything else derives completion from these cells.
//!
//! # Chaining work
//!
//! Combinators build new futures whose completion is a function of their
//! inputs: [`Future::then`] and [`Future::then_async`] fan a value through
//! synchronous and asynchronous functions, [`when_all`] joins several
//! inputs, [`execute_async_loop`] iterates an asynchronous body, and the
//! `then_catch` family handles failures, optionally by payload type. User
//! functions run on an [`Executor`]; each combinator has an `_on` form
//! taking an explicit executor and a short form using [`default_executor`].
//!
//! ```
//! use promise_async::Promise;
//!
//! let p = Promise::new();
//! let f = p.future().then(|a: i32| Ok(a + 1));
//! p.set(10);
//! assert_eq!(f.get().unwrap(), 11);
//! ```
//!
//! # Running work
//!
//! [`ThreadPool`] is a fixed set of workers draining one FIFO. It also
//! implements [`CoopScheduler`], the interface for resuming suspended
//! routines and for the `wait_for`/`mark_completed` rendezvous in which a
//! waiter donates its thread to other work instead of deadlocking against
//! it. [`OneThreadCoopScheduler`] is the single-thread cooperative variant.
//! Routines — plain `async` blocks awaiting library futures and streams —
//! are started with [`spawn_routine`].
//!
//! # Streams and timers
//!
//! [`stream_channel`] creates a bounded single-producer single-consumer
//! stream of items ending in an EOF marker or an error; producers feel
//! back-pressure when the queue is full, terminal values stick. The
//! [`AlarmClock`] delivers one-shot timers as `Future<bool>` (`true` fired,
//! `false` cancelled) and periodic timers as streams of timepoints.

mod alarm;
mod cell;
mod combinators;
mod coop;
mod error;
mod executor;
mod future;
mod routine;
mod stream;
mod waiter;

pub use async_task::Runnable;
pub use sync;

pub use alarm::{alarm_clock, AlarmClock, PeriodicTimer, Timer};
pub use combinators::{
    execute_async_loop, execute_async_loop_on, run_async, run_async_on, when_all,
    when_all_futures, when_all_futures_on, when_all_on, when_all_vec, when_all_vec_on, JoinList,
};
pub use coop::{CoopHandle, CoopScheduler, OneThreadCoopScheduler, WaiterId};
pub use error::{Result, TaskError};
pub use executor::{
    default_coop_scheduler, default_executor, Executor, ExecutorHandle, Job, ThreadPool,
};
pub use future::{completed_future, failed_future, Future, Promise};
pub use routine::{spawn_routine, spawn_routine_parallel};
pub use stream::{
    produce_stream, stream_channel, Feed, Recv, RecvItem, SpscQueue, StreamSink, StreamSource,
    StreamValue,
};
pub use waiter::FutureWaiter;
