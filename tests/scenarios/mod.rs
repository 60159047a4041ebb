//! End-to-end pub/sub scenarios shared by every backend.
//!
//! Each scenario takes freshly built buses attached to the same discovery
//! registry and queue backend, and closes them before returning.

use std::collections::HashSet;
use std::time::Duration;

use relaybus::{ArbitraryMessage, Bus, ErrorStream, Message};
use serde_json::json;

use crate::common::{assert_ended, assert_silent, recv, Greeting, RECV_TIMEOUT};

/// Payload fields with the ID stripped.
fn without_id(message: &ArbitraryMessage) -> serde_json::Value {
    let mut fields = message.fields().clone();
    fields.remove("id");
    serde_json::Value::Object(fields)
}

async fn assert_no_errors(name: &str, mut errors: ErrorStream) {
    let next = tokio::time::timeout(RECV_TIMEOUT, errors.recv())
        .await
        .unwrap_or_else(|_| panic!("timeout waiting for {name} error stream to end"));
    assert!(next.is_none(), "unexpected error on {name}: {next:?}");
}

/// X subscribes, Y publishes, X receives the payload with an ID injected.
pub async fn basic(x: Bus, y: Bus) {
    let stream = x.subscribe::<ArbitraryMessage>("mychan").await.unwrap();

    let mut sent = ArbitraryMessage::new().with("hello", "world");
    y.publish("mychan", &mut sent).await.unwrap();

    let mut received = recv(&stream).await;
    assert_eq!(without_id(&received), json!({"hello": "world"}));
    assert_eq!(received.id(), sent.id());

    x.unsubscribe("mychan").await.unwrap();
    x.close().await.unwrap();
    y.close().await.unwrap();
}

/// A message queued before close is still read; then every stream ends
/// without errors.
pub async fn close_drains_queued(x: Bus, y: Bus) {
    let x_errors = x.errors().unwrap();
    let y_errors = y.errors().unwrap();
    let stream = x.subscribe::<ArbitraryMessage>("achan").await.unwrap();

    y.publish("achan", &mut ArbitraryMessage::new().with("before", "close"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    x.close().await.unwrap();
    y.close().await.unwrap();

    let received = recv(&stream).await;
    assert_eq!(without_id(&received), json!({"before": "close"}));
    assert_ended(&stream).await;

    assert_no_errors("x", x_errors).await;
    assert_no_errors("y", y_errors).await;
}

/// Two buses exchange structured messages on separate channels.
pub async fn two_way(q: Bus, r: Bus) {
    let on_q = q.subscribe::<Greeting>("chan1").await.unwrap();
    let on_r = r.subscribe::<Greeting>("chan2").await.unwrap();

    for seq in 0..3 {
        q.publish("chan2", &mut Greeting::new("q", seq)).await.unwrap();
        r.publish("chan1", &mut Greeting::new("r", seq)).await.unwrap();
    }

    for (stream, from) in [(&on_q, "r"), (&on_r, "q")] {
        let mut seen = HashSet::new();
        for _ in 0..3 {
            let greeting = recv(stream).await;
            assert_eq!(greeting.from, from);
            assert!(greeting.mq.is_set());
            assert!(seen.insert(greeting.mq.get().map(str::to_string)));
        }
    }

    q.close().await.unwrap();
    r.close().await.unwrap();
}

/// Three buses on one channel each receive the other two buses' messages.
pub async fn three_way(buses: [Bus; 3]) {
    let tags = ["q1", "q2", "q3"];
    let mut streams = Vec::new();
    for bus in &buses {
        streams.push(bus.subscribe::<ArbitraryMessage>("chan").await.unwrap());
    }

    for (bus, tag) in buses.iter().zip(tags) {
        bus.publish("chan", &mut ArbitraryMessage::new().with("from", tag))
            .await
            .unwrap();
    }

    for (stream, own) in streams.iter().zip(tags) {
        let mut froms = HashSet::new();
        for _ in 0..2 {
            let message = recv(stream).await;
            let from = message
                .get("from")
                .and_then(|v| v.as_str())
                .unwrap()
                .to_string();
            assert_ne!(from, own, "received own message");
            assert!(froms.insert(from), "duplicate message");
        }
        assert_silent(stream, Duration::from_millis(50)).await;
    }

    for bus in &buses {
        bus.close().await.unwrap();
    }
}
