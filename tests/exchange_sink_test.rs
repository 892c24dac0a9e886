// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Integration tests for the exchange sink runtime.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use arrow::array::{Array, Int32Array, RecordBatch};
use arrow::datatypes::{DataType, Field, Schema};

use crate::common::{TestConfig, run_with_timeout, unique_query_id, wait_for};
use minirocks::Page;
use minirocks::runtime::exchange_sink::{
    self, ExchangeKey, ExchangeRequest, ExchangeResponse, ExchangeSinkHandler, PageListener,
};

mod common;

fn page_of(values: &[i32]) -> Page {
    let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, false)]));
    let batch = RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values.to_vec()))])
        .expect("record batch");
    Page::new(batch)
}

fn page_values(page: &Page) -> Vec<i32> {
    let col = page
        .batch
        .column(0)
        .as_any()
        .downcast_ref::<Int32Array>()
        .expect("int32 column");
    (0..col.len()).map(|i| col.value(i)).collect()
}

fn response_channel() -> (PageListener, mpsc::Receiver<ExchangeResponse>) {
    let (tx, rx) = mpsc::channel();
    let listener: PageListener = Box::new(move |response| {
        tx.send(response).expect("send response");
    });
    (listener, rx)
}

/// Pulls until completion, returning every value seen in delivery order.
fn drain_all(handler: &ExchangeSinkHandler) -> Vec<i32> {
    let mut values = Vec::new();
    loop {
        let (listener, rx) = response_channel();
        handler.fetch_page_async(ExchangeRequest::default(), listener);
        let response = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("response within timeout");
        match response.page {
            Some(page) => values.extend(page_values(&page)),
            None if response.finished => break,
            // Transient empty race; request again.
            None => thread::yield_now(),
        }
    }
    values
}

#[test]
fn test_runtime_config_loading() {
    let test_config = TestConfig::new().expect("Failed to create test config");
    let config = test_config.load_config().expect("Failed to load config");

    assert_eq!(config.runtime.exchange_sink_buffer_capacity, 4);
    assert_eq!(config.runtime.exchange_sink_keepalive_ms, 60_000);
    assert_eq!(config.log_level, "info");
}

#[test]
fn test_single_producer_delivers_in_order() {
    run_with_timeout(Duration::from_secs(30), || {
        let handler = ExchangeSinkHandler::new(8);
        let sink = handler.create_exchange_sink();
        let producer = thread::spawn(move || {
            for v in 0..10 {
                sink.add_page(page_of(&[v]));
            }
            sink.finish();
        });

        let values = drain_all(&handler);
        producer.join().expect("join producer");
        assert_eq!(values, (0..10).collect::<Vec<_>>());
        assert!(handler.is_finished());
    });
}

#[test]
fn test_concurrent_producers_deliver_each_page_once() {
    run_with_timeout(Duration::from_secs(30), || {
        let handler = ExchangeSinkHandler::new(4);
        let mut producers = Vec::new();
        for tid in 0..4 {
            let sink = handler.create_exchange_sink();
            producers.push(thread::spawn(move || {
                for seq in 0..25 {
                    sink.add_page(page_of(&[tid * 1000 + seq]));
                }
                sink.finish();
            }));
        }

        let values = drain_all(&handler);
        for producer in producers {
            producer.join().expect("join producer");
        }

        assert_eq!(values.len(), 100);
        let mut sorted = values.clone();
        sorted.sort_unstable();
        let mut expected: Vec<i32> = (0..4)
            .flat_map(|tid| (0..25).map(move |seq| tid * 1000 + seq))
            .collect();
        expected.sort_unstable();
        assert_eq!(sorted, expected);

        // Pages from one producer keep their push order.
        for tid in 0..4 {
            let per_producer: Vec<i32> =
                values.iter().copied().filter(|v| v / 1000 == tid).collect();
            let expected: Vec<i32> = (0..25).map(|seq| tid * 1000 + seq).collect();
            assert_eq!(per_producer, expected);
        }
    });
}

#[test]
fn test_multiple_consumers_partition_the_stream() {
    run_with_timeout(Duration::from_secs(30), || {
        let handler = ExchangeSinkHandler::new(4);
        let mut producers = Vec::new();
        for tid in 0..2 {
            let sink = handler.create_exchange_sink();
            producers.push(thread::spawn(move || {
                for seq in 0..30 {
                    sink.add_page(page_of(&[tid * 100 + seq]));
                }
                sink.finish();
            }));
        }

        let mut consumers = Vec::new();
        for _ in 0..2 {
            let handler = Arc::clone(&handler);
            consumers.push(thread::spawn(move || drain_all(&handler)));
        }

        for producer in producers {
            producer.join().expect("join producer");
        }
        let mut values = Vec::new();
        for consumer in consumers {
            values.extend(consumer.join().expect("join consumer"));
        }

        values.sort_unstable();
        let mut expected: Vec<i32> = (0..2)
            .flat_map(|tid| (0..30).map(move |seq| tid * 100 + seq))
            .collect();
        expected.sort_unstable();
        assert_eq!(values, expected);
    });
}

#[test]
fn test_late_handle_delivers_after_sibling_finished() {
    let handler = ExchangeSinkHandler::new(4);
    let first = handler.create_exchange_sink();
    let second = handler.create_exchange_sink();

    first.finish();
    second.add_page(page_of(&[42]));
    second.finish();

    let (listener, rx) = response_channel();
    handler.fetch_page_async(ExchangeRequest::default(), listener);
    let response = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("response within timeout");
    assert_eq!(page_values(&response.page.expect("page")), vec![42]);
    // The response carrying the last page never claims completion.
    assert!(!response.finished);

    let (listener, rx) = response_channel();
    handler.fetch_page_async(ExchangeRequest::default(), listener);
    let response = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("response within timeout");
    assert!(response.page.is_none());
    assert!(response.finished);
    assert!(handler.is_finished());
}

#[test]
fn test_sources_finished_discards_overflowed_buffer() {
    let handler = ExchangeSinkHandler::new(1);
    let sink = handler.create_exchange_sink();
    for v in 0..5 {
        sink.add_page(page_of(&[v]));
    }
    assert_eq!(handler.buffered_pages(), 5);
    assert!(!sink.await_writable().is_ready());

    let (listener, rx) = response_channel();
    handler.fetch_page_async(
        ExchangeRequest {
            sources_finished: true,
        },
        listener,
    );
    let response = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("response within timeout");
    assert!(response.page.is_none());
    assert!(response.finished);

    assert_eq!(handler.buffered_pages(), 0);
    assert_eq!(handler.stats_snapshot().discarded_pages, 5);
    assert!(sink.is_finished());
}

#[test]
fn test_cancellation_resolves_pending_requests() {
    let handler = ExchangeSinkHandler::new(4);
    let sink = handler.create_exchange_sink();

    let mut receivers = Vec::new();
    for _ in 0..2 {
        let (listener, rx) = response_channel();
        handler.fetch_page_async(ExchangeRequest::default(), listener);
        receivers.push(rx);
    }
    assert_eq!(handler.pending_requests(), 2);

    let (listener, rx) = response_channel();
    handler.fetch_page_async(
        ExchangeRequest {
            sources_finished: true,
        },
        listener,
    );
    receivers.push(rx);

    for rx in receivers {
        let response = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("response within timeout");
        assert!(response.page.is_none());
        assert!(response.finished);
    }

    // The handle winds down without finish, and late pages are dropped.
    assert!(sink.is_finished());
    sink.add_page(page_of(&[1]));
    assert_eq!(handler.buffered_pages(), 0);
}

#[test]
fn test_backpressure_signal_releases_after_pop() {
    let handler = ExchangeSinkHandler::new(2);
    let sink = handler.create_exchange_sink();
    sink.add_page(page_of(&[1]));
    sink.add_page(page_of(&[2]));

    let dep = sink.await_writable();
    assert!(!dep.is_ready());

    let handler_clone = Arc::clone(&handler);
    let puller = thread::spawn(move || {
        let (listener, rx) = response_channel();
        handler_clone.fetch_page_async(ExchangeRequest::default(), listener);
        rx.recv_timeout(Duration::from_secs(5))
            .expect("response within timeout")
    });

    assert!(wait_for(|| dep.is_ready(), Duration::from_secs(5)));
    let response = puller.join().expect("join puller");
    assert!(response.page.is_some());

    // Below capacity again; new signals start out ready.
    assert!(sink.await_writable().is_ready());
}

#[test]
fn test_sink_registry_lifecycle() {
    let test_config = TestConfig::new().expect("Failed to create test config");
    test_config.load_config().expect("Failed to load config");
    test_config.init_logging();

    let id = unique_query_id("sink_registry_lifecycle");
    let key = ExchangeKey {
        finst_id_hi: id.hi,
        finst_id_lo: id.lo,
        node_id: 1,
    };
    let first = exchange_sink::get_or_create_sink_handler(key).expect("create handler");
    let second = exchange_sink::get_or_create_sink_handler(key).expect("get handler");
    assert!(Arc::ptr_eq(&first, &second));

    let sink = first.create_exchange_sink();
    sink.add_page(page_of(&[1, 2]));
    let snapshot = exchange_sink::snapshot_sink_state(key).expect("snapshot");
    assert_eq!(snapshot.buffered_pages, 1);
    assert_eq!(snapshot.added_rows, 2);
    assert_eq!(snapshot.outstanding_sinks, 1);
    assert!(!snapshot.producers_complete);

    exchange_sink::cancel_fragment(key.finst_id_hi, key.finst_id_lo);
    assert!(exchange_sink::get_sink_handler(key).is_none());
    let err = exchange_sink::get_or_create_sink_handler(key).expect_err("canceled key");
    assert_eq!(err, "exchange canceled");
    // The canceled handler dropped its pages and reports completion.
    assert!(first.is_finished());
    assert_eq!(first.buffered_pages(), 0);

    // Reaping removes idle empty handlers and keeps ones still holding pages.
    let idle_key = ExchangeKey {
        finst_id_hi: id.hi,
        finst_id_lo: id.lo,
        node_id: 2,
    };
    let busy_key = ExchangeKey {
        finst_id_hi: id.hi,
        finst_id_lo: id.lo,
        node_id: 3,
    };
    let _idle = exchange_sink::get_or_create_sink_handler(idle_key).expect("create handler");
    let busy = exchange_sink::get_or_create_sink_handler(busy_key).expect("create handler");
    busy.create_exchange_sink().add_page(page_of(&[7]));

    assert_eq!(exchange_sink::reap_inactive_sinks(), 0);
    assert_eq!(
        exchange_sink::reap_inactive_sinks_with_keep_alive(Duration::ZERO),
        1
    );
    assert!(exchange_sink::get_sink_handler(idle_key).is_none());
    assert!(exchange_sink::get_sink_handler(busy_key).is_some());
    exchange_sink::cancel_exchange_key(busy_key);
    assert!(exchange_sink::get_sink_handler(busy_key).is_none());
}
