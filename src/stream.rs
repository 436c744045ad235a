// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The bounded single-producer / single-consumer stream cell and its
//! handles.
//!
//! A stream carries regular items followed by exactly one terminal value,
//! either an EOF marker or an error. Terminal values are sticky: they are
//! never removed, and every read past the end observes the same terminal
//! value again. Back-pressure is realized through the one-shot
//! slot-available callback: a blocking producer installs a condvar-flipping
//! callback and parks, a cooperative one installs a waker and suspends.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use log::debug;
use sync::{Condvar, Mutex};

use crate::cell::Callback;
use crate::coop::CoopHandle;
use crate::error::{Result, TaskError};
use crate::routine::spawn_routine;

/// A value conveyed through a stream: a regular item, the EOF marker with
/// its payload, or an error.
#[derive(Debug)]
pub enum StreamValue<Item, Eof = ()> {
    Item(Item),
    Eof(Eof),
    Error(TaskError),
}

impl<Item, Eof> StreamValue<Item, Eof> {
    pub fn is_item(&self) -> bool {
        matches!(self, StreamValue::Item(_))
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, StreamValue::Eof(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StreamValue::Error(_))
    }

    /// EOF markers and errors terminate a stream; items do not.
    pub fn is_terminal(&self) -> bool {
        !self.is_item()
    }

    pub fn into_item(self) -> Option<Item> {
        match self {
            StreamValue::Item(item) => Some(item),
            _ => None,
        }
    }
}

impl<Item, Eof: Clone> StreamValue<Item, Eof> {
    fn clone_terminal(&self) -> StreamValue<Item, Eof> {
        match self {
            StreamValue::Eof(eof) => StreamValue::Eof(eof.clone()),
            StreamValue::Error(e) => StreamValue::Error(e.clone()),
            StreamValue::Item(_) => panic!("items are consumed by move, not cloned"),
        }
    }
}

struct QueueState<Item, Eof> {
    queue: VecDeque<StreamValue<Item, Eof>>,
    value_callback: Option<Callback>,
    slot_callback: Option<Callback>,
}

/// The bounded queue behind a stream. One producer and one consumer may
/// operate concurrently; this is a design assumption, not an enforced one.
pub struct SpscQueue<Item, Eof = ()> {
    capacity: usize,
    state: Mutex<QueueState<Item, Eof>>,
}

impl<Item, Eof> SpscQueue<Item, Eof>
where
    Item: Send + 'static,
    Eof: Clone + Send + 'static,
{
    pub fn new(capacity: usize) -> Arc<SpscQueue<Item, Eof>> {
        assert!(capacity >= 1, "a stream queue holds at least one value");
        Arc::new(SpscQueue {
            capacity,
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                value_callback: None,
                slot_callback: None,
            }),
        })
    }

    /// Snapshot read; with a single consumer a true result stays true until
    /// that consumer dequeues.
    pub fn is_value_available(&self) -> bool {
        !self.state.lock().queue.is_empty()
    }

    /// Snapshot read; with a single producer a true result stays true until
    /// that producer enqueues.
    pub fn is_slot_available(&self) -> bool {
        self.state.lock().queue.len() < self.capacity
    }

    /// Installs a one-shot callback to run when a value is available. Runs
    /// it inline, after releasing the lock, if one already is. Replaces any
    /// previously installed callback.
    pub fn set_on_value_available_once(&self, callback: impl FnOnce() + Send + 'static) {
        let mut state = self.state.lock();
        if state.queue.is_empty() {
            state.value_callback = Some(Box::new(callback));
        } else {
            drop(state);
            callback();
        }
    }

    /// Installs a one-shot callback to run when a slot is free; inline if
    /// one already is. Replaces any previously installed callback.
    pub fn set_on_slot_available_once(&self, callback: impl FnOnce() + Send + 'static) {
        let mut state = self.state.lock();
        if state.queue.len() >= self.capacity {
            state.slot_callback = Some(Box::new(callback));
        } else {
            drop(state);
            callback();
        }
    }

    /// Appends a value, blocking the calling thread while the queue is full
    /// if the value is a regular item. Terminal values are always accepted,
    /// even at capacity; enqueueing anything after a terminal value is a
    /// contract violation.
    pub fn enqueue(&self, value: StreamValue<Item, Eof>) {
        let mut state = self.state.lock();
        if let Some(last) = state.queue.back() {
            assert!(
                !last.is_terminal(),
                "stream value enqueued after a terminal value"
            );
        }
        if state.queue.len() >= self.capacity && value.is_item() {
            let gate = Arc::new((Mutex::new(false), Condvar::new()));
            let g = gate.clone();
            state.slot_callback = Some(Box::new(move || {
                *g.0.lock() = true;
                g.1.notify_all();
            }));
            drop(state);
            debug!("stream producer waiting for a free slot");
            let mut done = gate.0.lock();
            while !*done {
                done = gate.1.wait(done);
            }
            drop(done);
            state = self.state.lock();
        }
        state.queue.push_back(value);
        let callback = state.value_callback.take();
        drop(state);
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Non-blocking enqueue for producers that must never stall, such as
    /// the alarm clock driver. Returns false without enqueueing when the
    /// stream already ended, or when `value` is an item and the queue is
    /// full.
    pub fn try_enqueue(&self, value: StreamValue<Item, Eof>) -> bool {
        let mut state = self.state.lock();
        if matches!(state.queue.back(), Some(last) if last.is_terminal()) {
            return false;
        }
        if state.queue.len() >= self.capacity && value.is_item() {
            return false;
        }
        state.queue.push_back(value);
        let callback = state.value_callback.take();
        drop(state);
        if let Some(callback) = callback {
            callback();
        }
        true
    }

    /// Removes and returns the next value, blocking the calling thread
    /// while the queue is empty. Items are moved out; a terminal value
    /// sticks and is returned by clone, so every later call observes it
    /// again.
    pub fn dequeue(&self) -> StreamValue<Item, Eof> {
        let mut state = self.state.lock();
        if state.queue.is_empty() {
            let gate = Arc::new((Mutex::new(false), Condvar::new()));
            let g = gate.clone();
            state.value_callback = Some(Box::new(move || {
                *g.0.lock() = true;
                g.1.notify_all();
            }));
            drop(state);
            let mut done = gate.0.lock();
            while !*done {
                done = gate.1.wait(done);
            }
            drop(done);
            state = self.state.lock();
        }
        if matches!(state.queue.front(), Some(front) if front.is_item()) {
            let value = match state.queue.pop_front() {
                Some(v) => v,
                None => unreachable!(),
            };
            let callback = state.slot_callback.take();
            drop(state);
            if let Some(callback) = callback {
                callback();
            }
            value
        } else {
            match state.queue.front() {
                Some(terminal) => terminal.clone_terminal(),
                None => unreachable!("woken stream consumer found an empty queue"),
            }
        }
    }
}

/// Creates a bounded stream, returning the producing and consuming halves.
pub fn stream_channel<Item, Eof>(capacity: usize) -> (StreamSink<Item, Eof>, StreamSource<Item, Eof>)
where
    Item: Send + 'static,
    Eof: Clone + Send + 'static,
{
    let queue = SpscQueue::new(capacity);
    (
        StreamSink {
            queue: queue.clone(),
        },
        StreamSource { queue, done: false },
    )
}

/// The producing half of a stream. Exactly one producer may exist.
pub struct StreamSink<Item, Eof = ()> {
    queue: Arc<SpscQueue<Item, Eof>>,
}

impl<Item, Eof> StreamSink<Item, Eof>
where
    Item: Send + 'static,
    Eof: Clone + Send + 'static,
{
    /// Blocking send of any stream value.
    pub fn send(&self, value: StreamValue<Item, Eof>) {
        self.queue.enqueue(value);
    }

    /// Blocking send of one item.
    pub fn push(&self, item: Item) {
        self.queue.enqueue(StreamValue::Item(item));
    }

    /// Terminates the stream with an EOF marker. Nothing may be sent
    /// afterwards.
    pub fn close(&self, eof: Eof) {
        self.queue.enqueue(StreamValue::Eof(eof));
    }

    /// Terminates the stream with an error. Nothing may be sent afterwards.
    pub fn fail(&self, error: TaskError) {
        self.queue.enqueue(StreamValue::Error(error));
    }

    /// Sends one item from a cooperative routine, suspending instead of
    /// blocking while the queue is full.
    pub fn feed(&self, item: Item) -> Feed<'_, Item, Eof> {
        Feed {
            queue: &self.queue,
            item: Some(item),
        }
    }

    /// The shared queue, for handing the producing side across routines.
    pub fn queue(&self) -> &Arc<SpscQueue<Item, Eof>> {
        &self.queue
    }
}

/// The consuming half of a stream. Exactly one consumer may exist.
pub struct StreamSource<Item, Eof = ()> {
    queue: Arc<SpscQueue<Item, Eof>>,
    done: bool,
}

impl<Item, Eof> StreamSource<Item, Eof>
where
    Item: Send + 'static,
    Eof: Clone + Send + 'static,
{
    pub(crate) fn from_queue(queue: Arc<SpscQueue<Item, Eof>>) -> StreamSource<Item, Eof> {
        StreamSource { queue, done: false }
    }

    /// Blocking read of the next value. Terminal values stick.
    pub fn dequeue(&self) -> StreamValue<Item, Eof> {
        self.queue.dequeue()
    }

    /// Reads the next value from a cooperative routine, suspending instead
    /// of blocking while the queue is empty.
    pub fn recv(&self) -> Recv<'_, Item, Eof> {
        Recv { queue: &self.queue }
    }

    /// The shared queue, for handing the consuming side across routines.
    pub fn queue(&self) -> &Arc<SpscQueue<Item, Eof>> {
        &self.queue
    }
}

impl<Item: Send + 'static> StreamSource<Item, ()> {
    /// Blocking read of the next item: `Ok(Some(item))` for an item,
    /// `Ok(None)` at EOF, and the stream's error if it failed.
    pub fn next_item(&self) -> Result<Option<Item>> {
        match self.dequeue() {
            StreamValue::Item(item) => Ok(Some(item)),
            StreamValue::Eof(()) => Ok(None),
            StreamValue::Error(e) => Err(e),
        }
    }

    /// [`StreamSource::next_item`] for cooperative routines.
    pub fn recv_item(&self) -> RecvItem<'_, Item> {
        RecvItem { queue: &self.queue }
    }
}

/// Blocking iteration over an item stream. Ends after the EOF marker, or
/// after yielding the stream's error once.
impl<Item: Send + 'static> Iterator for StreamSource<Item, ()> {
    type Item = Result<Item>;

    fn next(&mut self) -> Option<Result<Item>> {
        if self.done {
            return None;
        }
        match self.dequeue() {
            StreamValue::Item(item) => Some(Ok(item)),
            StreamValue::Eof(()) => {
                self.done = true;
                None
            }
            StreamValue::Error(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Future of a cooperative send; see [`StreamSink::feed`].
pub struct Feed<'a, Item, Eof> {
    queue: &'a SpscQueue<Item, Eof>,
    item: Option<Item>,
}

// No field is structurally pinned.
impl<'a, Item, Eof> Unpin for Feed<'a, Item, Eof> {}

impl<'a, Item, Eof> std::future::Future for Feed<'a, Item, Eof>
where
    Item: Send + 'static,
    Eof: Clone + Send + 'static,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.queue.is_slot_available() {
            let item = match this.item.take() {
                Some(item) => item,
                None => panic!("feed future polled after completion"),
            };
            this.queue.enqueue(StreamValue::Item(item));
            Poll::Ready(())
        } else {
            let waker = cx.waker().clone();
            this.queue.set_on_slot_available_once(move || waker.wake());
            Poll::Pending
        }
    }
}

/// Future of a cooperative read; see [`StreamSource::recv`].
pub struct Recv<'a, Item, Eof> {
    queue: &'a SpscQueue<Item, Eof>,
}

impl<'a, Item, Eof> std::future::Future for Recv<'a, Item, Eof>
where
    Item: Send + 'static,
    Eof: Clone + Send + 'static,
{
    type Output = StreamValue<Item, Eof>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<StreamValue<Item, Eof>> {
        if self.queue.is_value_available() {
            Poll::Ready(self.queue.dequeue())
        } else {
            let waker = cx.waker().clone();
            self.queue.set_on_value_available_once(move || waker.wake());
            Poll::Pending
        }
    }
}

/// Future of a cooperative item read; see [`StreamSource::recv_item`].
pub struct RecvItem<'a, Item> {
    queue: &'a SpscQueue<Item, ()>,
}

impl<'a, Item: Send + 'static> std::future::Future for RecvItem<'a, Item> {
    type Output = Result<Option<Item>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<Option<Item>>> {
        if self.queue.is_value_available() {
            Poll::Ready(match self.queue.dequeue() {
                StreamValue::Item(item) => Ok(Some(item)),
                StreamValue::Eof(()) => Ok(None),
                StreamValue::Error(e) => Err(e),
            })
        } else {
            let waker = cx.waker().clone();
            self.queue.set_on_value_available_once(move || waker.wake());
            Poll::Pending
        }
    }
}

/// Spawns a producing routine on `scheduler` and returns the consuming
/// half of its stream. The routine's `Ok` return terminates the stream
/// with that EOF payload; its error is delivered as the stream's terminal
/// error and re-raised at the consumer.
pub fn produce_stream<Item, Eof, F, Fut>(
    capacity: usize,
    scheduler: &CoopHandle,
    producer: F,
) -> StreamSource<Item, Eof>
where
    Item: Send + 'static,
    Eof: Clone + Send + 'static,
    F: FnOnce(StreamSink<Item, Eof>) -> Fut,
    Fut: std::future::Future<Output = Result<Eof>> + Send + 'static,
{
    let queue = SpscQueue::new(capacity);
    let sink = StreamSink {
        queue: queue.clone(),
    };
    let source = StreamSource {
        queue: queue.clone(),
        done: false,
    };
    let body = producer(sink);
    let _completion: crate::future::Future<()> = spawn_routine(scheduler, async move {
        match body.await {
            Ok(eof) => queue.enqueue(StreamValue::Eof(eof)),
            Err(e) => queue.enqueue(StreamValue::Error(e)),
        }
        Ok(())
    });
    source
}
