// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end tests of streams: back-pressure between threads, routine
//! producers and consumers, and error delivery.

mod common;

use std::thread;

use promise_async::{
    default_coop_scheduler, produce_stream, spawn_routine, stream_channel, StreamValue, TaskError,
};
use thiserror::Error;

use crate::common::delay;

#[derive(Debug, Error)]
#[error("producer broke after {0} items")]
struct ProducerError(usize);

#[test]
fn capacity_one_backpressure_preserves_order() {
    let (sink, source) = stream_channel::<i32, ()>(1);
    let queue = source.queue().clone();

    let producer = thread::spawn(move || {
        sink.push(10);
        sink.push(22); // blocks until the consumer takes 10
        sink.push(25); // blocks until the consumer takes 22
        sink.close(());
    });

    delay(20);
    // The producer is parked on a full queue.
    assert!(queue.is_value_available());
    assert!(!queue.is_slot_available());

    assert_eq!(source.dequeue().into_item(), Some(10));
    delay(10);
    assert_eq!(source.dequeue().into_item(), Some(22));
    assert_eq!(source.dequeue().into_item(), Some(25));
    assert!(source.dequeue().is_eof());
    // Terminal values stick.
    assert!(source.dequeue().is_eof());
    producer.join().unwrap();
}

#[test]
fn item_order_is_preserved_across_threads() {
    let (sink, source) = stream_channel::<usize, ()>(4);
    let producer = thread::spawn(move || {
        for i in 0..100 {
            sink.push(i);
        }
        sink.close(());
    });
    let items: Vec<usize> = source.map(|r| r.unwrap()).collect();
    assert_eq!(items, (0..100).collect::<Vec<usize>>());
    producer.join().unwrap();
}

#[test]
fn routine_producer_feeds_a_blocking_consumer() {
    let sched = default_coop_scheduler();
    let source = produce_stream::<i32, (), _, _>(2, &sched, |sink| async move {
        for i in 0..6 {
            sink.feed(i * i).await;
        }
        Ok(())
    });

    let mut seen = Vec::new();
    loop {
        match source.next_item().unwrap() {
            Some(v) => seen.push(v),
            None => break,
        }
    }
    assert_eq!(seen, vec![0, 1, 4, 9, 16, 25]);
}

#[test]
fn producer_error_reaches_the_consumer() {
    let sched = default_coop_scheduler();
    let source = produce_stream::<i32, (), _, _>(2, &sched, |sink| async move {
        sink.feed(1).await;
        sink.feed(2).await;
        Err(TaskError::new(ProducerError(2)))
    });

    assert_eq!(source.next_item().unwrap(), Some(1));
    assert_eq!(source.next_item().unwrap(), Some(2));
    let error = source.next_item().unwrap_err();
    assert_eq!(error.downcast_ref::<ProducerError>().unwrap().0, 2);
    // The error sticks.
    assert!(source.next_item().is_err());
}

#[test]
fn routine_consumes_a_stream_cooperatively() {
    let sched = default_coop_scheduler();
    let (sink, source) = stream_channel::<i32, ()>(2);

    let summed = spawn_routine(&sched, async move {
        let mut sum = 0;
        while let Some(v) = source.recv_item().await? {
            sum += v;
        }
        Ok(sum)
    });

    let producer = thread::spawn(move || {
        for i in 1..=10 {
            sink.push(i);
        }
        sink.close(());
    });

    assert_eq!(summed.get().unwrap(), 55);
    producer.join().unwrap();
}

#[test]
fn routines_hand_off_through_a_stream() {
    let sched = default_coop_scheduler();
    let (sink, source) = stream_channel::<i32, ()>(1);

    let producer = spawn_routine(&sched, async move {
        for i in 0..20 {
            sink.feed(i).await;
        }
        sink.close(());
        Ok(())
    });
    let consumer = spawn_routine(&sched, async move {
        let mut last = -1;
        while let Some(v) = source.recv_item().await? {
            // Order survives the capacity-1 handoff.
            assert_eq!(v, last + 1);
            last = v;
        }
        Ok(last)
    });

    assert_eq!(consumer.get().unwrap(), 19);
    producer.wait();
}

#[test]
fn eof_payload_is_delivered_and_sticks() {
    let (sink, source) = stream_channel::<i32, i32>(2);
    sink.push(7);
    sink.close(33);

    assert_eq!(source.dequeue().into_item(), Some(7));
    match source.dequeue() {
        StreamValue::Eof(v) => assert_eq!(v, 33),
        other => panic!("expected eof, got {:?}", other),
    }
    match source.dequeue() {
        StreamValue::Eof(v) => assert_eq!(v, 33),
        other => panic!("expected eof again, got {:?}", other),
    }
}
