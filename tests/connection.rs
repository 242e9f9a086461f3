mod common;

use common::{
    stamped, stamps, unused_port, wait_until, write_device_certs, write_pki, BrokerScript,
    MqttStub, DEVICE_ID,
};
use meterlink::delivery::certs::CertificateResolver;
use meterlink::delivery::connection::{
    ConnectionHandle, ConnectionManager, ConnectionSettings, ConnectionState,
};
use meterlink::delivery::publisher::{BrokerLink, Delivery, LinkError, Publisher};
use meterlink::delivery::queue::OutboundQueue;
use meterlink::observability::DeliveryMetrics;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

fn settings(port: u16) -> ConnectionSettings {
    ConnectionSettings {
        host: "127.0.0.1".into(),
        port,
        client_id: DEVICE_ID.into(),
        topic: format!("indi/AM/{DEVICE_ID}"),
        keep_alive: Duration::from_secs(30),
        clean_session: true,
        request_capacity: 8,
        reconnect_base: Duration::from_millis(20),
        reconnect_max: Duration::from_millis(80),
        cert_retry: Duration::from_millis(20),
        flush_interval: Duration::from_secs(30),
    }
}

struct Harness {
    handle: ConnectionHandle,
    queue: Arc<OutboundQueue>,
    metrics: Arc<DeliveryMetrics>,
    publisher: Publisher<ConnectionHandle>,
    stop: watch::Sender<bool>,
    worker: tokio::task::JoinHandle<()>,
}

impl Harness {
    fn start(cert_dir: &Path, port: u16, queue: Arc<OutboundQueue>) -> Self {
        let metrics = Arc::new(DeliveryMetrics::default());
        let (manager, handle) = ConnectionManager::new(
            settings(port),
            CertificateResolver::new(cert_dir, DEVICE_ID),
            Arc::clone(&queue),
            Arc::clone(&metrics),
        );
        let (stop, stop_rx) = watch::channel(false);
        let worker = manager.spawn(stop_rx);
        let publisher = Publisher::new(handle.clone(), Arc::clone(&queue), Arc::clone(&metrics));
        Self {
            handle,
            queue,
            metrics,
            publisher,
            stop,
            worker,
        }
    }

    async fn shutdown(self) {
        self.stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.worker)
            .await
            .expect("worker stops on request")
            .unwrap();
    }
}

#[tokio::test]
async fn missing_certificates_keep_link_down_and_retry() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::start(
        dir.path(),
        unused_port().port(),
        Arc::new(OutboundQueue::new()),
    );

    assert!(wait_until(|| h.metrics.snapshot().cert_missing_total >= 3).await);
    assert_eq!(h.handle.state(), ConnectionState::Disconnected);
    assert_eq!(h.metrics.snapshot().connect_failures_total, 0);

    assert_eq!(h.handle.send(stamped(1)), Err(LinkError::NotConnected));
    assert_eq!(h.publisher.publish_or_queue(stamped(2)), Delivery::Queued);
    assert!(
        !h.publisher
            .publish_and_confirm(stamped(3), Duration::from_millis(50))
            .await
    );
    assert_eq!(h.queue.len(), 1);
    assert_eq!(h.handle.pending_confirms(), 0);

    h.shutdown().await;
}

#[tokio::test]
async fn refused_connections_back_off_and_keep_queue() {
    let dir = tempfile::tempdir().unwrap();
    write_device_certs(dir.path(), DEVICE_ID);
    let queue = Arc::new(OutboundQueue::new());
    queue.enqueue(stamped(1));
    queue.enqueue(stamped(2));
    let h = Harness::start(dir.path(), unused_port().port(), queue);

    assert!(wait_until(|| h.metrics.snapshot().connect_failures_total >= 2).await);
    assert_ne!(h.handle.state(), ConnectionState::Connected);
    let snapshot = h.metrics.snapshot();
    assert_eq!(snapshot.connects_total, 0);
    assert_eq!(snapshot.cert_missing_total, 0);
    assert_eq!(snapshot.published_total, 0);
    assert_eq!(h.queue.len(), 2);

    h.shutdown().await;
}

#[tokio::test]
async fn connack_flushes_queue_and_acks_reach_their_callers() {
    let dir = tempfile::tempdir().unwrap();
    let (_, broker) = write_pki(dir.path(), DEVICE_ID);
    let stub = MqttStub::start(&broker, BrokerScript::ack_all()).await;
    let queue = Arc::new(OutboundQueue::new());
    queue.enqueue(stamped(1));
    queue.enqueue(stamped(2));
    let h = Harness::start(dir.path(), stub.port, queue);

    assert!(
        wait_until(|| h.handle.state() == ConnectionState::Connected
            && h.metrics.snapshot().acked_total >= 2)
        .await
    );
    assert!(h.queue.is_empty());
    assert_eq!(stub.received_stamps(), vec![1, 2]);
    assert!(stub
        .received()
        .iter()
        .all(|p| p.topic == format!("indi/AM/{DEVICE_ID}")));

    assert!(
        h.publisher
            .publish_and_confirm(stamped(3), Duration::from_secs(5))
            .await
    );
    assert_eq!(h.handle.pending_confirms(), 0);

    assert_eq!(h.publisher.publish_or_queue(stamped(4)), Delivery::Submitted);
    assert!(wait_until(|| h.metrics.snapshot().acked_total >= 4).await);
    assert_eq!(stub.received_stamps(), vec![1, 2, 3, 4]);

    let snapshot = h.metrics.snapshot();
    assert_eq!(snapshot.connects_total, 1);
    assert_eq!(snapshot.flushed_total, 2);
    assert_eq!(snapshot.confirm_timeouts_total, 0);

    let queue = Arc::clone(&h.queue);
    h.shutdown().await;
    assert!(queue.is_empty());
}

#[tokio::test]
async fn dropped_session_restores_unacked_events_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let (_, broker) = write_pki(dir.path(), DEVICE_ID);
    // Ack the first publish, hold the next three, then drop the session.
    let stub = MqttStub::start(
        &broker,
        BrokerScript {
            acks: 1,
            drop_after_unacked: Some(3),
        },
    )
    .await;
    let queue = Arc::new(OutboundQueue::new());
    for stamp in 1..=3 {
        queue.enqueue(stamped(stamp));
    }
    let h = Harness::start(dir.path(), stub.port, queue);

    assert!(
        wait_until(|| h.handle.state() == ConnectionState::Connected
            && stub.received().len() == 3)
        .await
    );

    // Tracked publish held by the broker: the lost session answers it
    // negatively instead of letting it run into the timeout.
    let started = Instant::now();
    assert!(
        !h.publisher
            .publish_and_confirm(stamped(4), Duration::from_secs(10))
            .await
    );
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(wait_until(|| stub.session_closed()).await);

    // Reconnects are refused from here on, so the queue stays as restored.
    assert!(wait_until(|| h.metrics.snapshot().connect_failures_total >= 1).await);
    assert_eq!(stamps(&h.queue.snapshot()), vec![2, 3]);
    let snapshot = h.metrics.snapshot();
    assert_eq!(snapshot.acked_total, 1);
    assert_eq!(snapshot.requeued_total, 2);
    assert_eq!(snapshot.confirm_rejected_total, 1);
    assert_eq!(snapshot.confirm_timeouts_total, 0);
    assert_eq!(h.handle.pending_confirms(), 0);

    h.shutdown().await;
}

#[tokio::test]
async fn shutdown_returns_unacked_events_to_the_spool() {
    let dir = tempfile::tempdir().unwrap();
    let (_, broker) = write_pki(dir.path(), DEVICE_ID);
    let stub = MqttStub::start(&broker, BrokerScript::silent()).await;
    let spool = dir.path().join("outbound.json");
    let h = Harness::start(
        dir.path(),
        stub.port,
        Arc::new(OutboundQueue::with_spool(&spool)),
    );

    assert!(wait_until(|| h.handle.state() == ConnectionState::Connected).await);
    assert_eq!(h.publisher.publish_or_queue(stamped(7)), Delivery::Submitted);
    assert!(wait_until(|| stub.received().len() == 1).await);

    let handle = h.handle.clone();
    let publisher = h.publisher.clone();
    let queue = Arc::clone(&h.queue);
    h.shutdown().await;

    assert_eq!(handle.state(), ConnectionState::Disconnected);
    assert_eq!(stamps(&queue.snapshot()), vec![7]);
    // The worker is gone; new events go straight to the queue.
    assert_eq!(publisher.publish_or_queue(stamped(8)), Delivery::Queued);
    assert!(matches!(handle.send(stamped(9)), Err(LinkError::NotConnected)));

    drop(queue);
    assert_eq!(
        stamps(&OutboundQueue::with_spool(&spool).snapshot()),
        vec![7, 8]
    );
}

#[tokio::test]
async fn idle_handle_never_reports_connected() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, handle) = ConnectionManager::new(
        settings(unused_port().port()),
        CertificateResolver::new(dir.path(), DEVICE_ID),
        Arc::new(OutboundQueue::new()),
        Arc::new(DeliveryMetrics::default()),
    );
    drop(manager);
    assert!(!handle.is_connected());
    assert!(matches!(
        handle.send_tracked(stamped(1)),
        Err(LinkError::NotConnected)
    ));
}
