use super::*;
use std::time::Duration;

fn service() -> InMemoryQueueService {
    InMemoryQueueService::new(QueueConfig::with_prefix("test"))
}

async fn next(listener: &mut Listener) -> Delivery {
    tokio::time::timeout(Duration::from_millis(200), listener.deliveries.recv())
        .await
        .expect("timeout waiting for delivery")
        .expect("delivery stream ended")
}

#[tokio::test]
async fn test_push_then_listen_delivers_in_order() {
    let svc = service();
    let queue = svc.open("test:orders").await.unwrap();

    queue.push("1", b"one".to_vec()).await.unwrap();
    queue.push("2", b"two".to_vec()).await.unwrap();

    let mut listener = queue.listen().await.unwrap();
    assert_eq!(next(&mut listener).await.id, "1");
    assert_eq!(next(&mut listener).await.id, "2");
    assert_eq!(svc.pushed("test:orders").await, 2);
}

#[tokio::test]
async fn test_listen_then_push_wakes_listener() {
    let svc = service();
    let queue = svc.open("test:orders").await.unwrap();
    let mut listener = queue.listen().await.unwrap();

    queue.push("1", b"one".to_vec()).await.unwrap();

    let delivery = next(&mut listener).await;
    assert_eq!(delivery.payload, b"one");
}

#[tokio::test]
async fn test_ack_and_fail_settle_in_flight() {
    let svc = service();
    let queue = svc.open("test:orders").await.unwrap();
    let mut listener = queue.listen().await.unwrap();

    queue.push("1", b"one".to_vec()).await.unwrap();
    queue.push("2", b"two".to_vec()).await.unwrap();
    let first = next(&mut listener).await;
    let second = next(&mut listener).await;
    assert_eq!(svc.in_flight("test:orders").await, 2);

    listener.acks.send(first.id).unwrap();
    listener.failures.send(second.id).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(svc.in_flight("test:orders").await, 0);
    assert_eq!(svc.failed("test:orders").await, 1);
}

#[tokio::test]
async fn test_close_ends_delivery_and_error_streams() {
    let svc = service();
    let queue = svc.open("test:orders").await.unwrap();
    let mut listener = queue.listen().await.unwrap();

    queue.close().await.unwrap();

    assert!(listener.deliveries.recv().await.is_none());
    assert!(listener.errors.recv().await.is_none());
    assert!(matches!(
        queue.push("1", vec![]).await,
        Err(QueueError::Closed)
    ));
    assert!(queue.listen().await.is_err());
    // Second close is a no-op.
    queue.close().await.unwrap();
}

#[tokio::test]
async fn test_tasks_survive_close_for_the_next_listener() {
    let svc = service();
    let first = svc.open("test:orders").await.unwrap();
    first.close().await.unwrap();

    let producer = svc.open("test:orders").await.unwrap();
    producer.push("1", b"kept".to_vec()).await.unwrap();
    assert_eq!(svc.pending("test:orders").await, 1);

    let consumer = svc.open("test:orders").await.unwrap();
    let mut listener = consumer.listen().await.unwrap();
    assert_eq!(next(&mut listener).await.payload, b"kept");
}

#[tokio::test]
async fn test_rejected_push() {
    let svc = service();
    let queue = svc.open("test:orders").await.unwrap();
    svc.set_reject_pushes("test:orders", true).await;

    let result = queue.push("1", vec![]).await;
    assert!(matches!(result, Err(QueueError::Rejected(_))));
    assert_eq!(svc.pushed("test:orders").await, 0);
}

#[tokio::test]
async fn test_injected_error_reaches_listener() {
    let svc = service();
    let queue = svc.open("test:orders").await.unwrap();
    let mut listener = queue.listen().await.unwrap();

    assert_eq!(svc.inject_error("test:orders", "link down").await, 1);

    let err = listener.errors.recv().await.unwrap();
    assert!(matches!(err, QueueError::Connection(ref m) if m == "link down"));
}

#[tokio::test]
async fn test_shared_broker_across_services() {
    let svc = service();
    let other = svc.with_config(QueueConfig::with_prefix("other"));

    let producer = other.open("test:orders").await.unwrap();
    let consumer = svc.open("test:orders").await.unwrap();
    let mut listener = consumer.listen().await.unwrap();

    producer.push("1", b"cross".to_vec()).await.unwrap();
    assert_eq!(next(&mut listener).await.payload, b"cross");
}
