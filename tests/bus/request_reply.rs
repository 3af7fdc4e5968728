//! Request/reply and send-and-wait across nodes.

use std::time::Duration;

use durable_bus::persistence::InMemoryEnvelopeStore;
use durable_bus::transport::MemoryHub;
use durable_bus::{BusError, HandlerError, HandlerGraph, ListenerSettings, MessagingRoot, RequestOptions};

use crate::support::{listening, order, start_node, uri, GetPrice, Orders, Price};

async fn pricing_node(hub: &MemoryHub) -> MessagingRoot {
    let handlers = HandlerGraph::new().respond(|query: GetPrice, _envelope| async move {
        Ok::<_, HandlerError>(Price {
            cents: query.sku.len() as u64 * 100,
            sku: query.sku,
        })
    });
    start_node(
        listening("pricing", ListenerSettings::parse("memory://pricing").unwrap()),
        hub,
        &InMemoryEnvelopeStore::new(),
        handlers,
    )
    .await
}

async fn client_node(hub: &MemoryHub, handlers: HandlerGraph) -> MessagingRoot {
    start_node(
        listening("client", ListenerSettings::parse("memory://client").unwrap()),
        hub,
        &InMemoryEnvelopeStore::new(),
        handlers,
    )
    .await
}

#[tokio::test]
async fn request_resolves_with_the_typed_reply() {
    let hub = MemoryHub::new();
    let pricing = pricing_node(&hub).await;
    let client = client_node(&hub, HandlerGraph::new()).await;

    let price: Price = client
        .bus()
        .request(
            GetPrice { sku: "abc".into() },
            RequestOptions::new()
                .to(uri("memory://pricing"))
                .timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    assert_eq!(price, Price { sku: "abc".into(), cents: 300 });
    assert!(client.bus().replies().is_empty());

    client.shutdown().await;
    pricing.shutdown().await;
}

#[tokio::test]
async fn request_times_out_and_forgets_the_watch() {
    let hub = MemoryHub::new();
    // Listens, but nothing answers `get-price`.
    let silent = client_node(&hub, HandlerGraph::new()).await;
    let client = start_node(
        listening("asker", ListenerSettings::parse("memory://asker").unwrap()),
        &hub,
        &InMemoryEnvelopeStore::new(),
        HandlerGraph::new(),
    )
    .await;

    let err = client
        .bus()
        .request::<GetPrice, Price>(
            GetPrice { sku: "abc".into() },
            RequestOptions::new()
                .to(uri("memory://client"))
                .timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, BusError::Timeout(t) if t == Duration::from_millis(200)));
    assert!(client.bus().replies().is_empty());

    client.shutdown().await;
    silent.shutdown().await;
}

#[tokio::test]
async fn send_and_wait_resolves_on_acknowledgement() {
    let hub = MemoryHub::new();
    let orders = Orders::default();
    let shipping = start_node(
        listening("shipping", ListenerSettings::parse("memory://shipping").unwrap()),
        &hub,
        &InMemoryEnvelopeStore::new(),
        orders.handlers(),
    )
    .await;
    let client = client_node(&hub, HandlerGraph::new()).await;

    client
        .bus()
        .send_and_wait_with(
            order(5),
            RequestOptions::new()
                .to(uri("memory://shipping"))
                .timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    // The handler ran before the acknowledgement was sent.
    assert_eq!(orders.sequences(), vec![5]);

    client.shutdown().await;
    shipping.shutdown().await;
}

#[tokio::test]
async fn local_request_is_answered_through_the_replies_queue() {
    let hub = MemoryHub::new();
    let handlers = HandlerGraph::new().respond(|query: GetPrice, _envelope| async move {
        Ok::<_, HandlerError>(Price { sku: query.sku, cents: 1 })
    });
    let node = start_node(crate::support::settings("solo"), &hub, &InMemoryEnvelopeStore::new(), handlers).await;

    let price: Price = node
        .bus()
        .request(
            GetPrice { sku: "x".into() },
            RequestOptions::new()
                .to(uri("loopback://default"))
                .timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    assert_eq!(price.cents, 1);

    node.shutdown().await;
}
