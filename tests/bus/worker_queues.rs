//! Local execution: enqueue, invoke, error policies and delayed work.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use durable_bus::persistence::{Direction, EnvelopePersistence, InMemoryEnvelopeStore};
use durable_bus::transport::MemoryHub;
use durable_bus::{BusError, ErrorPolicy, HandlerError, HandlerGraph};
use tokio::time::Instant;

use crate::support::{eventually, order, settings, start_node, uri, Flaky, Orders, PlaceOrder};

#[tokio::test]
async fn enqueue_runs_the_handler_locally() {
    let hub = MemoryHub::new();
    let orders = Orders::default();
    let node = start_node(settings("solo"), &hub, &InMemoryEnvelopeStore::new(), orders.handlers()).await;

    node.bus().enqueue(order(1)).await.unwrap();
    node.bus().enqueue_to_queue("orders", order(2)).await.unwrap();

    eventually(|| orders.len() == 2).await;
    let mut seen = orders.sequences();
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2]);
    assert!(node.workers().find(&uri("loopback://orders")).is_some());

    node.shutdown().await;
}

#[tokio::test]
async fn invoke_returns_the_handler_failure() {
    let hub = MemoryHub::new();
    let handlers = HandlerGraph::new().handle(|order: PlaceOrder, _envelope| async move {
        if order.sequence == 0 {
            Err(HandlerError::new("validation", "sequence must be positive"))
        } else {
            Ok(())
        }
    });
    let node = start_node(settings("solo"), &hub, &InMemoryEnvelopeStore::new(), handlers).await;

    node.bus().invoke(order(1)).await.unwrap();
    let err = node.bus().invoke(order(0)).await.unwrap_err();
    assert!(matches!(err, BusError::Handler(ref e) if e.category() == "validation"));

    node.shutdown().await;
}

#[tokio::test]
async fn durable_local_failures_end_in_the_dead_letter_queue() {
    let hub = MemoryHub::new();
    let store = InMemoryEnvelopeStore::new();
    let calls = Arc::new(AtomicU32::new(0));
    let handlers = {
        let calls = Arc::clone(&calls);
        HandlerGraph::new()
            .handle(move |_: Flaky, _envelope| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(HandlerError::new("boom", "always fails"))
                }
            })
            .policy::<Flaky>(ErrorPolicy::new().requeue_on("boom", 3))
    };
    let node = start_node(settings("solo").with_durable_local("flaky"), &hub, &store, handlers).await;

    let id = node.bus().enqueue(Flaky { id: 1 }).await.unwrap();

    let dead = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let dead = store.dead_letters().await.unwrap();
            if !dead.is_empty() {
                return dead;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].envelope.id, id);
    assert_eq!(dead[0].envelope.attempts, 3);
    assert_eq!(dead[0].direction, Direction::Incoming);
    assert!(dead[0].error.contains("always fails"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(store.record(Direction::Incoming, id).is_none());

    node.shutdown().await;
}

#[tokio::test]
async fn delayed_send_runs_after_the_delay() {
    let hub = MemoryHub::new();
    let handled_at = Arc::new(Mutex::new(None));
    let handlers = {
        let handled_at = Arc::clone(&handled_at);
        HandlerGraph::new().handle(move |_: PlaceOrder, _envelope| {
            let handled_at = Arc::clone(&handled_at);
            async move {
                *handled_at.lock().unwrap() = Some(Instant::now());
                Ok::<(), HandlerError>(())
            }
        })
    };
    let node = start_node(
        settings("solo").publish("place-order", uri("loopback://default")),
        &hub,
        &InMemoryEnvelopeStore::new(),
        handlers,
    )
    .await;

    let sent_at = Instant::now();
    node.bus()
        .delay_send_for(order(1), Duration::from_millis(300))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(handled_at.lock().unwrap().is_none());

    eventually(|| handled_at.lock().unwrap().is_some()).await;
    let ran_at = handled_at.lock().unwrap().unwrap();
    assert!(ran_at.duration_since(sent_at) >= Duration::from_millis(250));

    node.shutdown().await;
}
