mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{Harness, INTERVAL_MS};
use fluxer::error::ClientError;
use fluxer::gateway::{ConnectionState, Listeners, Payload};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn terminal_close_never_reconnects() {
    let mut harness = Harness::start(Listeners::new());
    let mut server = harness.accept().await;
    server.hello();
    server.expect_op(2).await;
    server.close(4004);

    let result = harness.task.await.unwrap();
    assert!(matches!(
        result,
        Err(ClientError::SessionTerminal { code: 4004, .. })
    ));
    assert_eq!(harness.handle.state(), ConnectionState::Closed);
    assert!(harness.accepted.try_recv().is_err());
    assert!(matches!(
        harness.handle.send(Payload::heartbeat(None)).await,
        Err(ClientError::ShuttingDown)
    ));
}

#[tokio::test(start_paused = true)]
async fn abnormal_close_resumes_once() {
    let mut harness = Harness::start(Listeners::new());
    let server = harness.connect_ready(1).await;
    server.dispatch("MESSAGE_CREATE", 2, json!({ "id": "1" }));
    server.close(1006);

    let mut server = harness.accept().await;
    assert!(server.url.starts_with("wss://resume.gateway.test"));
    server.hello();
    let resume = server.expect_op(6).await;
    assert_eq!(resume.d["session_id"], "session-1");
    assert_eq!(resume.d["seq"], 2);
    assert_eq!(harness.handle.state(), ConnectionState::Resuming);

    server.dispatch("RESUMED", 3, Value::Null);
    harness.handle.wait_until_connected().await.unwrap();

    harness.handle.shutdown();
    harness.task.await.unwrap().unwrap();
    assert_eq!(server.closed_with(), Some(1000));
    assert!(harness.accepted.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn missing_acks_mark_the_connection_dead() {
    let mut harness = Harness::start(Listeners::new());
    let mut state = harness.handle.watch_state();

    let mut server = harness.accept().await;
    let hello_at = Instant::now();
    server.hello();
    server.expect_op(2).await;
    server.ready(1);

    state.wait_for(|s| s.is_reconnecting()).await.unwrap();
    let elapsed = hello_at.elapsed();
    assert!(elapsed >= Duration::from_millis(2 * INTERVAL_MS));
    assert!(elapsed < Duration::from_millis(2 * INTERVAL_MS + 1_000));
    assert_eq!(server.closed_with(), Some(4000));

    harness.handle.shutdown();
    harness.task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn acks_keep_the_connection_alive() {
    let mut harness = Harness::start(Listeners::new());
    let mut server = harness.connect_ready(1).await;

    for _ in 0..5 {
        server.expect_op(1).await;
        server.send(json!({ "op": 11 }));
    }
    assert_eq!(harness.handle.state(), ConnectionState::Connected);
    assert!(server.closed_with().is_none());

    harness.handle.shutdown();
    harness.task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn sequence_never_goes_backwards() {
    let mut harness = Harness::start(Listeners::new());
    let mut server = harness.connect_ready(1).await;

    server.dispatch("MESSAGE_CREATE", 5, json!({ "id": "5" }));
    server.dispatch("MESSAGE_CREATE", 3, json!({ "id": "3" }));
    server.send(json!({ "op": 1, "d": null }));

    let beat = server.expect_op(1).await;
    assert_eq!(beat.d, json!(5));

    harness.handle.shutdown();
    harness.task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn raw_listeners_run_before_typed_ones() {
    let (seen_tx, mut seen) = mpsc::unbounded_channel();
    let mut listeners = Listeners::new();
    let raw = seen_tx.clone();
    listeners
        .on_raw(move |payload| {
            if payload.t.as_deref() == Some("MESSAGE_CREATE") {
                raw.send("raw").unwrap();
            }
        })
        .on("MESSAGE_CREATE", move |_| seen_tx.send("typed").unwrap());

    let mut harness = Harness::start(listeners);
    let server = harness.connect_ready(1).await;
    server.dispatch("MESSAGE_CREATE", 2, json!({ "id": "2" }));

    assert_eq!(seen.recv().await, Some("raw"));
    assert_eq!(seen.recv().await, Some("typed"));

    harness.handle.shutdown();
    harness.task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn reconnect_request_resumes_on_a_new_socket() {
    let mut harness = Harness::start(Listeners::new());
    let server = harness.connect_ready(1).await;
    server.send(json!({ "op": 7, "d": null }));

    let mut next = harness.accept().await;
    assert_eq!(server.closed_with(), Some(4000));
    next.hello();
    let resume = next.expect_op(6).await;
    assert_eq!(resume.d["seq"], 1);

    harness.handle.shutdown();
    harness.task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn invalid_session_identifies_again() {
    let mut harness = Harness::start(Listeners::new());
    let mut server = harness.connect_ready(1).await;
    let invalidated_at = Instant::now();
    server.send(json!({ "op": 9, "d": false }));

    server.expect_op(2).await;
    let waited = invalidated_at.elapsed();
    assert!(waited >= Duration::from_secs(1));
    assert!(waited <= Duration::from_secs(5));
    assert!(harness.handle.state() != ConnectionState::Connected);

    harness.handle.shutdown();
    harness.task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn sends_are_delivered_once_connected() {
    let mut harness = Harness::start(Listeners::new());
    let mut server = harness.connect_ready(1).await;

    let handle = harness.handle.clone();
    let sent = tokio::spawn(async move {
        handle
            .send(Payload::presence_update("idle", Some("tests"), false))
            .await
    });
    let presence = server.expect_op(3).await;
    assert_eq!(presence.d["status"], "idle");
    sent.await.unwrap().unwrap();

    harness.handle.shutdown();
    harness.task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn heartbeats_keep_going_while_a_backlog_drains() {
    const BACKLOG: usize = 200;
    let handled = Arc::new(AtomicUsize::new(0));
    let (drained_tx, mut drained) = mpsc::unbounded_channel();
    let mut listeners = Listeners::new();
    let counter = handled.clone();
    listeners.on("GUILD_CREATE", move |_| {
        // Slow listener: the whole backlog takes ~400ms to get through.
        std::thread::sleep(Duration::from_millis(2));
        if counter.fetch_add(1, Ordering::SeqCst) + 1 == BACKLOG {
            drained_tx.send(()).unwrap();
        }
    });

    let mut harness = Harness::start(listeners);
    let mut server = harness.accept().await;
    server.send(json!({ "op": 10, "d": { "heartbeat_interval": 50 } }));
    server.expect_op(2).await;
    server.ready(1);
    for n in 0..BACKLOG {
        server.dispatch("GUILD_CREATE", n as u64 + 2, json!({ "id": n.to_string() }));
    }

    drained.recv().await.unwrap();
    let beats = server
        .drain_sent()
        .into_iter()
        .filter(|payload| payload.op == 1)
        .count();
    assert!(beats >= 3, "only {beats} heartbeats while the backlog drained");

    harness.handle.shutdown();
    harness.task.await.unwrap().unwrap();
}
