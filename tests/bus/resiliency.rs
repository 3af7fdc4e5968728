//! Recovery of work left behind by nodes that stopped heartbeating.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use durable_bus::envelope::Envelope;
use durable_bus::persistence::{
    Direction, EnvelopePersistence, InMemoryEnvelopeStore, StoreOperation,
};
use durable_bus::resiliency::ConnectionState;
use durable_bus::transport::MemoryHub;
use durable_bus::{DurabilitySettings, ErrorPolicy, HandlerError, HandlerGraph, ListenerSettings, NodeId};

use crate::support::{eventually, listening, order, settings, start_node, uri, Flaky, Orders};

fn quick_dormancy() -> DurabilitySettings {
    DurabilitySettings::default()
        .with_polling(Duration::from_millis(50))
        .with_reconnect_delay(Duration::from_millis(20))
        .with_dormant_threshold(Duration::from_millis(500))
}

#[tokio::test]
async fn work_of_a_dormant_node_is_picked_up() {
    let hub = MemoryHub::new();
    let store = InMemoryEnvelopeStore::new();
    let dead = NodeId::generate();

    let inbox = Envelope::for_message(order(1));
    let outbox = Envelope::for_message(order(2)).with_destination(uri("memory://shipping/durable"));
    store.persist_incoming(dead, &[inbox.clone()]).await.unwrap();
    store.persist_outgoing(dead, &[outbox.clone()]).await.unwrap();
    store.set_heartbeat(dead, Utc::now() - chrono::Duration::minutes(10));

    let orders = Orders::default();
    let live = start_node(
        listening("shipping", ListenerSettings::parse("memory://shipping/durable").unwrap())
            .with_durability(quick_dormancy()),
        &hub,
        &store,
        orders.handlers(),
    )
    .await;

    eventually(|| orders.len() == 2).await;
    let mut seen = orders.sequences();
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2]);

    eventually(|| store.records().is_empty()).await;
    assert!(store.record(Direction::Incoming, inbox.id).is_none());
    assert!(store.record(Direction::Outgoing, outbox.id).is_none());
    assert!(store.lock_holder(dead).is_none());

    live.shutdown().await;
}

#[tokio::test]
async fn records_of_a_live_node_stay_put() {
    let hub = MemoryHub::new();
    let store = InMemoryEnvelopeStore::new();
    let busy = NodeId::generate();

    let envelope = Envelope::for_message(order(1));
    store.persist_incoming(busy, &[envelope.clone()]).await.unwrap();

    let orders = Orders::default();
    let node = start_node(settings("watcher"), &hub, &store, orders.handlers()).await;
    node.wait_for_node_lock().await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let record = store.record(Direction::Incoming, envelope.id).unwrap();
    assert_eq!(record.owner, Some(busy));
    assert_eq!(orders.len(), 0);

    node.shutdown().await;
}

#[tokio::test]
async fn node_lock_is_taken_on_start_and_released_on_shutdown() {
    let hub = MemoryHub::new();
    let store = InMemoryEnvelopeStore::new();
    let node = start_node(settings("locker"), &hub, &store, HandlerGraph::new()).await;

    node.wait_for_node_lock().await.unwrap();
    assert_eq!(node.agent_state(), ConnectionState::LockAcquired);
    assert!(store.lock_holder(node.node_id()).is_some());
    assert!(store.heartbeat_of(node.node_id()).is_some());

    node.shutdown().await;
    assert!(store.lock_holder(node.node_id()).is_none());
}

#[tokio::test]
async fn shutdown_hands_unfinished_records_back() {
    let hub = MemoryHub::new();
    let store = InMemoryEnvelopeStore::new();
    let node = start_node(settings("leaver").with_failures_before_latch(1), &hub, &store, HandlerGraph::new()).await;
    node.wait_for_node_lock().await.unwrap();

    // Nobody listens on the destination, so the record stays behind.
    node.bus()
        .send_to(uri("memory://nowhere/durable"), order(4))
        .await
        .unwrap();
    eventually(|| !store.records().is_empty()).await;

    node.shutdown().await;
    let records = store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].owner, None);
}

#[tokio::test]
async fn record_that_could_not_be_dead_lettered_is_recovered() {
    let hub = MemoryHub::new();
    let store = InMemoryEnvelopeStore::new();
    store.fail_next(StoreOperation::MoveToDeadLetter, 1);
    let calls = Arc::new(AtomicU32::new(0));
    let handlers = {
        let calls = Arc::clone(&calls);
        HandlerGraph::new()
            .handle(move |_: Flaky, _envelope| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(HandlerError::new("fatal", "rejected"))
                }
            })
            .policy::<Flaky>(ErrorPolicy::new().move_to_errors_on("fatal"))
    };
    let node = start_node(settings("solo").with_durable_local("flaky"), &hub, &store, handlers).await;

    let id = node.bus().enqueue(Flaky { id: 7 }).await.unwrap();

    eventually(|| store.record(Direction::Incoming, id).is_none()).await;
    let dead = store.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].envelope.id, id);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    node.shutdown().await;
}
