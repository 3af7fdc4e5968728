//! Node to node delivery over the memory transport.

use durable_bus::persistence::{EnvelopePersistence, InMemoryEnvelopeStore};
use durable_bus::transport::MemoryHub;
use durable_bus::{HandlerGraph, ListenerSettings};

use crate::support::{eventually, listening, order, settings, start_node, uri, Orders};

#[tokio::test]
async fn lightweight_send_reaches_the_other_node() {
    let hub = MemoryHub::new();
    let orders = Orders::default();
    let receiver = start_node(
        listening("shipping", ListenerSettings::parse("memory://shipping").unwrap()),
        &hub,
        &InMemoryEnvelopeStore::new(),
        orders.handlers(),
    )
    .await;
    let sender = start_node(
        settings("orders").publish("place-order", uri("memory://shipping")),
        &hub,
        &InMemoryEnvelopeStore::new(),
        HandlerGraph::new(),
    )
    .await;

    let ids = sender.bus().send(order(1)).await.unwrap();
    assert_eq!(ids.len(), 1);

    eventually(|| orders.len() == 1).await;
    assert_eq!(orders.sequences(), vec![1]);

    sender.shutdown().await;
    receiver.shutdown().await;
}

#[tokio::test]
async fn batches_arrive_in_send_order() {
    let hub = MemoryHub::new();
    let orders = Orders::default();
    let receiver = start_node(
        listening(
            "shipping",
            ListenerSettings::parse("memory://shipping").unwrap().sequential(),
        ),
        &hub,
        &InMemoryEnvelopeStore::new(),
        orders.handlers(),
    )
    .await;
    let sender = start_node(settings("orders"), &hub, &InMemoryEnvelopeStore::new(), HandlerGraph::new()).await;

    for sequence in 0..120 {
        sender
            .bus()
            .send_to(uri("memory://shipping"), order(sequence))
            .await
            .unwrap();
    }

    eventually(|| orders.len() == 120).await;
    assert_eq!(orders.sequences(), (0..120).collect::<Vec<_>>());

    sender.shutdown().await;
    receiver.shutdown().await;
}

#[tokio::test]
async fn durable_delivery_clears_outbox_and_inbox() {
    let hub = MemoryHub::new();
    let orders = Orders::default();
    let receiver_store = InMemoryEnvelopeStore::new();
    let sender_store = InMemoryEnvelopeStore::new();
    let receiver = start_node(
        listening("shipping", ListenerSettings::parse("memory://shipping/durable").unwrap()),
        &hub,
        &receiver_store,
        orders.handlers(),
    )
    .await;
    let sender = start_node(settings("orders"), &hub, &sender_store, HandlerGraph::new()).await;

    let id = sender
        .bus()
        .send_to(uri("memory://shipping/durable"), order(7))
        .await
        .unwrap();

    eventually(|| orders.len() == 1).await;
    eventually(|| sender_store.records().is_empty() && receiver_store.records().is_empty()).await;
    assert!(sender_store.dead_letters().await.unwrap().is_empty());
    assert!(!id.is_nil());

    sender.shutdown().await;
    receiver.shutdown().await;
}

#[tokio::test]
async fn fan_out_reaches_every_subscriber() {
    let hub = MemoryHub::new();
    let (east, west) = (Orders::default(), Orders::default());
    let east_node = start_node(
        listening("east", ListenerSettings::parse("memory://east").unwrap()),
        &hub,
        &InMemoryEnvelopeStore::new(),
        east.handlers(),
    )
    .await;
    let west_node = start_node(
        listening("west", ListenerSettings::parse("memory://west").unwrap()),
        &hub,
        &InMemoryEnvelopeStore::new(),
        west.handlers(),
    )
    .await;
    let sender = start_node(
        settings("orders")
            .publish("place-order", uri("memory://east"))
            .publish("place-order", uri("memory://west")),
        &hub,
        &InMemoryEnvelopeStore::new(),
        HandlerGraph::new(),
    )
    .await;

    let ids = sender.bus().send(order(3)).await.unwrap();
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);

    eventually(|| east.len() == 1 && west.len() == 1).await;

    sender.shutdown().await;
    east_node.shutdown().await;
    west_node.shutdown().await;
}

#[tokio::test]
async fn unreachable_durable_destination_is_delivered_once_it_comes_up() {
    let hub = MemoryHub::new();
    let orders = Orders::default();
    let sender_store = InMemoryEnvelopeStore::new();
    let sender = start_node(
        settings("orders").with_failures_before_latch(1),
        &hub,
        &sender_store,
        HandlerGraph::new(),
    )
    .await;

    sender
        .bus()
        .send_to(uri("memory://late/durable"), order(9))
        .await
        .unwrap();

    let agent = sender
        .channels()
        .get_or_build(&uri("memory://late/durable"))
        .unwrap();
    eventually(|| agent.latched()).await;
    assert_eq!(sender_store.persisted_counts().await.unwrap().outgoing, 1);

    let receiver = start_node(
        listening("late", ListenerSettings::parse("memory://late/durable").unwrap()),
        &hub,
        &InMemoryEnvelopeStore::new(),
        orders.handlers(),
    )
    .await;

    eventually(|| orders.len() == 1).await;
    eventually(|| !agent.latched()).await;
    eventually(|| sender_store.records().is_empty()).await;

    sender.shutdown().await;
    receiver.shutdown().await;
}
