// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Deferred-call buffering, replay and first-send serialization.

mod common;

use common::{MockTransport, RecordingListener, build_pool};
use managed_channel_pool::{CallOptions, Metadata, PoolError, Status};
use std::sync::Arc;

const CONFIG: &str = r#"{
    "channelPool": { "maxSize": 2, "maxConcurrentStreamsLowWatermark": 5 },
    "method": [
        { "name": ["/svc/GetSession"],
          "affinity": { "command": "BOUND", "affinityKey": "name" } }
    ]
}"#;

#[tokio::test]
async fn buffered_operations_replay_in_order_on_first_send() {
    let transport = MockTransport::new();
    let pool = build_pool(&transport, CONFIG).unwrap();

    let call = pool
        .new_call("/svc/GetSession", CallOptions::default())
        .unwrap();
    let (listener, _) = RecordingListener::new("u");
    let mut headers = Metadata::new();
    headers.insert("x-goog-request-params", "session=s1");
    call.start(Box::new(listener), headers);
    call.request(5).await.unwrap();
    call.set_message_compression(false).await.unwrap();

    // Nothing reaches the transport until the first message.
    assert_eq!(transport.channel_count(), 0);

    call.send_message("key=s1".to_string()).await.unwrap();
    let raw = transport.last_call();
    assert_eq!(raw.method, "/svc/GetSession");
    assert_eq!(
        raw.ops(),
        vec![
            "start".to_string(),
            "set_compression(false)".to_string(),
            "request(5)".to_string(),
            "send(key=s1)".to_string(),
        ]
    );
    assert_eq!(
        raw.headers().unwrap().get("x-goog-request-params"),
        Some("session=s1")
    );

    // Post-send operations forward directly.
    call.request(3).await.unwrap();
    call.half_close().await.unwrap();
    assert_eq!(
        raw.ops()[4..],
        ["request(3)".to_string(), "half_close".to_string()]
    );
    assert!(call.attributes().is_ok());
}

#[tokio::test]
async fn buffered_request_count_overwrites() {
    let transport = MockTransport::new();
    let pool = build_pool(&transport, CONFIG).unwrap();

    let call = pool
        .new_call("/svc/GetSession", CallOptions::default())
        .unwrap();
    let (listener, _) = RecordingListener::new("u");
    call.start(Box::new(listener), Metadata::new());
    call.request(2).await.unwrap();
    call.request(7).await.unwrap();
    call.send_message("m".to_string()).await.unwrap();

    let ops = transport.last_call().ops();
    assert!(ops.contains(&"request(7)".to_string()));
    assert!(!ops.contains(&"request(2)".to_string()));
}

#[tokio::test]
async fn last_start_wins_before_first_send() {
    let transport = MockTransport::new();
    let pool = build_pool(&transport, CONFIG).unwrap();

    let call = pool
        .new_call("/svc/GetSession", CallOptions::default())
        .unwrap();
    let (first, first_events) = RecordingListener::new("first");
    let (second, second_events) = RecordingListener::new("second");
    call.start(Box::new(first), Metadata::new());
    call.start(Box::new(second), Metadata::new());
    call.send_message("m".to_string()).await.unwrap();

    transport.last_call().deliver("resp");
    assert!(first_events.lock().is_empty());
    assert_eq!(
        *second_events.lock(),
        vec!["second:message(resp)".to_string()]
    );
}

#[tokio::test]
async fn send_before_start_is_invalid_then_recovers() {
    let transport = MockTransport::new();
    let pool = build_pool(&transport, CONFIG).unwrap();

    let call = pool
        .new_call("/svc/GetSession", CallOptions::default())
        .unwrap();
    assert!(matches!(
        call.send_message("m".to_string()).await,
        Err(PoolError::InvalidState(_))
    ));
    assert_eq!(transport.channel_count(), 0);

    // A correctly ordered sequence still works on the same call.
    let (listener, _) = RecordingListener::new("u");
    call.start(Box::new(listener), Metadata::new());
    call.send_message("m".to_string()).await.unwrap();
    assert_eq!(transport.last_call().sent(), vec!["m".to_string()]);
}

#[tokio::test]
async fn later_sends_forward_without_reopening() {
    let transport = MockTransport::new();
    let pool = build_pool(&transport, CONFIG).unwrap();

    let call = pool
        .new_call("/svc/GetSession", CallOptions::default())
        .unwrap();
    let (listener, _) = RecordingListener::new("u");
    call.start(Box::new(listener), Metadata::new());
    call.send_message("key=a".to_string()).await.unwrap();
    call.send_message("key=b".to_string()).await.unwrap();

    assert_eq!(transport.calls().len(), 1);
    assert_eq!(
        transport.last_call().sent(),
        vec!["key=a".to_string(), "key=b".to_string()]
    );
    // One stream, not two.
    assert_eq!(pool.metrics()[0].active_streams, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_sends_open_exactly_one_call() {
    let transport = MockTransport::new();
    let pool = build_pool(&transport, CONFIG).unwrap();

    let call = Arc::new(
        pool.new_call("/svc/GetSession", CallOptions::default())
            .unwrap(),
    );
    let (listener, _) = RecordingListener::new("u");
    call.start(Box::new(listener), Metadata::new());

    let left = {
        let call = Arc::clone(&call);
        tokio::spawn(async move { call.send_message("key=a".to_string()).await })
    };
    let right = {
        let call = Arc::clone(&call);
        tokio::spawn(async move { call.send_message("key=a".to_string()).await })
    };
    left.await.unwrap().unwrap();
    right.await.unwrap().unwrap();

    assert_eq!(transport.calls().len(), 1);
    assert_eq!(transport.last_call().sent().len(), 2);
    assert_eq!(pool.metrics()[0].active_streams, 1);
}

#[tokio::test]
async fn keyless_message_falls_back_to_least_busy() {
    let transport = MockTransport::new();
    let pool = build_pool(&transport, CONFIG).unwrap();

    // "key=" carries an empty key, "plain" carries none; both must route
    // least-busy instead of consulting the index.
    for message in ["key=", "plain"] {
        let call = pool
            .new_call("/svc/GetSession", CallOptions::default())
            .unwrap();
        let (listener, _) = RecordingListener::new("u");
        call.start(Box::new(listener), Metadata::new());
        call.send_message(message.to_string()).await.unwrap();
    }
    // Both landed on the single under-watermark channel.
    assert_eq!(pool.size(), 1);
    assert_eq!(pool.metrics()[0].active_streams, 2);
}

#[tokio::test]
async fn is_ready_defaults_to_true_until_open() {
    let transport = MockTransport::new();
    let pool = build_pool(&transport, CONFIG).unwrap();

    let call = pool
        .new_call("/svc/GetSession", CallOptions::default())
        .unwrap();
    assert!(call.is_ready());

    let (listener, _) = RecordingListener::new("u");
    call.start(Box::new(listener), Metadata::new());
    call.send_message("m".to_string()).await.unwrap();
    assert!(call.is_ready());
}

#[tokio::test]
async fn close_after_send_decrements_and_reports_status() {
    let transport = MockTransport::new();
    let pool = build_pool(&transport, CONFIG).unwrap();

    let call = pool
        .new_call("/svc/GetSession", CallOptions::default())
        .unwrap();
    let (listener, events) = RecordingListener::new("u");
    call.start(Box::new(listener), Metadata::new());
    call.send_message("m".to_string()).await.unwrap();
    call.half_close().await.unwrap();
    assert_eq!(pool.metrics()[0].active_streams, 1);

    transport.last_call().deliver("resp");
    transport.last_call().close(Status::ok());
    assert_eq!(pool.metrics()[0].active_streams, 0);
    assert_eq!(
        *events.lock(),
        vec!["u:message(resp)".to_string(), "u:close(Ok)".to_string()]
    );

    // Cancel after close forwards but never double-decrements.
    call.cancel("late", None).await.unwrap();
    assert_eq!(pool.metrics()[0].active_streams, 0);
}
