// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! One-shot and periodic timers driven by a dedicated clock thread.
//!
//! Timer records are ordered by deadline, with a per-clock sequence number
//! breaking ties so that equally-timed timers fire in creation order. The
//! driver thread sleeps until the earliest deadline, fires everything due,
//! and re-inserts periodic records at `deadline + period`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};
use once_cell::sync::OnceCell;
use sync::{Condvar, Mutex};

use crate::cell::Cell;
use crate::future::Future;
use crate::stream::{SpscQueue, StreamSource, StreamValue};

/// Ticks buffered per periodic timer. The driver never blocks on a slow
/// consumer; ticks beyond this backlog are dropped with a warning.
const PERIODIC_TICK_BUFFER: usize = 64;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    deadline: Instant,
    seq: u64,
}

enum TimerKind {
    OneShot(Arc<Cell<bool>>),
    Periodic {
        period: Duration,
        ticks: Arc<SpscQueue<Instant, ()>>,
    },
}

struct ClockState {
    timers: BTreeMap<TimerKey, TimerKind>,
    closed: bool,
    next_seq: u64,
}

struct ClockShared {
    state: Mutex<ClockState>,
    cv: Condvar,
}

/// A scheduler of one-shot and periodic timers.
///
/// One dedicated thread drives all timers set on a clock. Closing the
/// clock (or dropping it) discards undelivered records without
/// notification, equivalent to cancelling them silently.
pub struct AlarmClock {
    shared: Arc<ClockShared>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl AlarmClock {
    pub fn new() -> AlarmClock {
        let shared = Arc::new(ClockShared {
            state: Mutex::new(ClockState {
                timers: BTreeMap::new(),
                closed: false,
                next_seq: 0,
            }),
            cv: Condvar::new(),
        });
        let driver = {
            let shared = shared.clone();
            thread::spawn(move || run_driver(shared))
        };
        AlarmClock {
            shared,
            driver: Mutex::new(Some(driver)),
        }
    }

    /// Schedules a one-shot timer. Its future completes `Ok(true)` when the
    /// deadline is reached, `Ok(false)` if the timer is cancelled first. A
    /// deadline in the past fires on the driver's next iteration.
    pub fn set_timer(&self, when: Instant) -> Timer {
        let cell = Arc::new(Cell::new());
        let mut state = self.shared.state.lock();
        let key = TimerKey {
            deadline: when,
            seq: state.next_seq,
        };
        state.next_seq += 1;
        if state.closed {
            drop(state);
            debug!("timer set on a closed alarm clock");
            cell.complete(Ok(false));
            return Timer {
                cell,
                key,
                shared: self.shared.clone(),
            };
        }
        state.timers.insert(key, TimerKind::OneShot(cell.clone()));
        let is_earliest = matches!(state.timers.keys().next(), Some(k) if *k == key);
        if is_earliest {
            self.shared.cv.notify_all();
        }
        drop(state);
        Timer {
            cell,
            key,
            shared: self.shared.clone(),
        }
    }

    /// [`AlarmClock::set_timer`] with a deadline relative to now.
    pub fn set_timer_after(&self, delay: Duration) -> Timer {
        self.set_timer(Instant::now() + delay)
    }

    /// Schedules a periodic timer whose stream yields the scheduled
    /// timepoints `start`, `start + period`, `start + 2*period`, … until
    /// cancelled.
    pub fn set_periodic_timer_start_at(&self, period: Duration, start: Instant) -> PeriodicTimer {
        assert!(period > Duration::ZERO, "periodic timers need a nonzero period");
        let ticks = SpscQueue::new(PERIODIC_TICK_BUFFER);
        let mut state = self.shared.state.lock();
        let key = TimerKey {
            deadline: start,
            seq: state.next_seq,
        };
        state.next_seq += 1;
        if state.closed {
            drop(state);
            debug!("periodic timer set on a closed alarm clock");
            ticks.enqueue(StreamValue::Eof(()));
            return PeriodicTimer {
                ticks,
                key,
                shared: self.shared.clone(),
            };
        }
        state.timers.insert(
            key,
            TimerKind::Periodic {
                period,
                ticks: ticks.clone(),
            },
        );
        let is_earliest = matches!(state.timers.keys().next(), Some(k) if *k == key);
        if is_earliest {
            self.shared.cv.notify_all();
        }
        drop(state);
        PeriodicTimer {
            ticks,
            key,
            shared: self.shared.clone(),
        }
    }

    /// Periodic timer whose first tick is one period from now.
    pub fn set_periodic_timer(&self, period: Duration) -> PeriodicTimer {
        self.set_periodic_timer_start_at(period, Instant::now() + period)
    }

    /// Periodic timer whose first tick is `delay` from now.
    pub fn set_periodic_timer_start_after(&self, period: Duration, delay: Duration) -> PeriodicTimer {
        self.set_periodic_timer_start_at(period, Instant::now() + delay)
    }

    /// Terminates the clock. Records not yet triggered are discarded and
    /// the driver thread exits.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        let undelivered = state.timers.len();
        state.timers.clear();
        if undelivered > 0 {
            debug!("alarm clock closed with {} undelivered timer(s)", undelivered);
        }
        self.shared.cv.notify_all();
    }
}

impl Default for AlarmClock {
    fn default() -> AlarmClock {
        AlarmClock::new()
    }
}

impl Drop for AlarmClock {
    fn drop(&mut self) {
        self.close();
        if let Some(driver) = self.driver.lock().take() {
            let _ = driver.join();
        }
    }
}

fn run_driver(shared: Arc<ClockShared>) {
    let mut state = shared.state.lock();
    loop {
        if state.closed {
            return;
        }
        let earliest = match state.timers.keys().next() {
            Some(key) => *key,
            None => {
                state = shared.cv.wait(state);
                continue;
            }
        };
        let now = Instant::now();
        if now < earliest.deadline {
            // Either the deadline passes, or a wakeup signals a new
            // earliest timer, a cancellation, or shutdown; every case is
            // handled by re-evaluating from the top.
            let (guard, _) = shared.cv.wait_timeout(state, earliest.deadline - now);
            state = guard;
            continue;
        }
        while let Some((&key, _)) = state.timers.iter().next() {
            if key.deadline > now {
                break;
            }
            let kind = match state.timers.remove(&key) {
                Some(kind) => kind,
                None => unreachable!(),
            };
            match kind {
                TimerKind::OneShot(cell) => {
                    drop(state);
                    debug!("one-shot timer {} fired", key.seq);
                    cell.complete_if_pending(Ok(true));
                    state = shared.state.lock();
                }
                TimerKind::Periodic { period, ticks } => {
                    let next = TimerKey {
                        deadline: key.deadline + period,
                        seq: key.seq,
                    };
                    state.timers.insert(
                        next,
                        TimerKind::Periodic {
                            period,
                            ticks: ticks.clone(),
                        },
                    );
                    drop(state);
                    if !ticks.try_enqueue(StreamValue::Item(key.deadline)) {
                        warn!(
                            "periodic timer {} dropped a tick; consumer lagging or stream ended",
                            key.seq
                        );
                    }
                    state = shared.state.lock();
                }
            }
        }
    }
}

/// Handle to a scheduled one-shot timer.
pub struct Timer {
    cell: Arc<Cell<bool>>,
    key: TimerKey,
    shared: Arc<ClockShared>,
}

impl Timer {
    /// The timer's outcome: `Ok(true)` if it fired, `Ok(false)` if it was
    /// cancelled first.
    pub fn future(&self) -> Future<bool> {
        Future::from_cell(self.cell.clone())
    }

    /// Cancels the timer. A timer that already fired stays fired; the
    /// cancellation then has no effect.
    pub fn cancel(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.timers.remove(&self.key).is_some() {
                self.shared.cv.notify_all();
            }
        }
        if self.cell.complete_if_pending(Ok(false)) {
            debug!("one-shot timer {} cancelled", self.key.seq);
        }
    }
}

/// Handle to a scheduled periodic timer.
pub struct PeriodicTimer {
    ticks: Arc<SpscQueue<Instant, ()>>,
    key: TimerKey,
    shared: Arc<ClockShared>,
}

impl PeriodicTimer {
    /// The stream of scheduled timepoints. The stream has a single
    /// consumer; take the source once.
    pub fn stream(&self) -> StreamSource<Instant, ()> {
        StreamSource::from_queue(self.ticks.clone())
    }

    /// Cancels the timer: the stream reaches EOF after any ticks already
    /// enqueued and not yet consumed.
    pub fn cancel(&self) {
        {
            // The record's deadline advances on every fire, so it is looked
            // up by its stable sequence number.
            let mut state = self.shared.state.lock();
            let current = state.timers.keys().find(|k| k.seq == self.key.seq).copied();
            if let Some(current) = current {
                state.timers.remove(&current);
                self.shared.cv.notify_all();
            }
        }
        if self.ticks.try_enqueue(StreamValue::Eof(())) {
            debug!("periodic timer {} cancelled", self.key.seq);
        }
    }
}

static ALARM_CLOCK: OnceCell<AlarmClock> = OnceCell::new();

/// The process-wide default alarm clock, created lazily.
pub fn alarm_clock() -> &'static AlarmClock {
    ALARM_CLOCK.get_or_init(AlarmClock::new)
}
