//! Subscription-driven routing.

use std::sync::{Arc, Mutex};

use durable_bus::persistence::InMemoryEnvelopeStore;
use durable_bus::routing::{InMemorySubscriptions, MessageRouter, Subscription, SubscriptionsRepository};
use durable_bus::serialization::{SerializerGraph, BITCODE, JSON};
use durable_bus::transport::{MemoryHub, MemoryTransport};
use durable_bus::{BusError, HandlerError, HandlerGraph, ListenerSettings, MessagingBuilder};

use crate::support::{eventually, listening, order, settings, start_node, uri, PlaceOrder};

#[tokio::test]
async fn router_resolves_every_subscriber_of_a_type() {
    let subscriptions = Arc::new(InMemorySubscriptions::with(vec![
        Subscription::publishes("A", uri("memory://u1")),
        Subscription::publishes("A", uri("memory://u2")),
    ]));
    let router = MessageRouter::new(Vec::new(), subscriptions, SerializerGraph::new());

    let routes = router.route("A").await.unwrap();
    let destinations: Vec<_> = routes.iter().map(|r| r.destination.as_str()).collect();
    assert_eq!(destinations, vec!["memory://u1", "memory://u2"]);
    assert!(routes.iter().all(|r| r.content_type == JSON));

    assert!(router.route("B").await.unwrap().is_empty());
}

#[tokio::test]
async fn subscriptions_added_at_runtime_are_honoured() {
    let hub = MemoryHub::new();
    let content_types = Arc::new(Mutex::new(Vec::new()));
    let handlers = {
        let content_types = Arc::clone(&content_types);
        HandlerGraph::new().handle(move |_: PlaceOrder, envelope| {
            let content_types = Arc::clone(&content_types);
            async move {
                content_types.lock().unwrap().push(envelope.content_type.clone());
                Ok::<(), HandlerError>(())
            }
        })
    };
    let receiver = start_node(
        listening("billing", ListenerSettings::parse("memory://billing").unwrap()),
        &hub,
        &InMemoryEnvelopeStore::new(),
        handlers,
    )
    .await;

    let subscriptions = Arc::new(InMemorySubscriptions::new());
    let sender = MessagingBuilder::new(settings("orders"))
        .transport(Arc::new(MemoryTransport::new(hub.clone())))
        .subscriptions(subscriptions.clone())
        .start()
        .await
        .unwrap();

    let err = sender.bus().send(order(1)).await.unwrap_err();
    assert!(matches!(err, BusError::NoRoutes(ref t) if t == "place-order"));

    subscriptions
        .persist(&[Subscription::publishes("place-order", uri("memory://billing")).accepting([BITCODE])])
        .await
        .unwrap();
    sender.bus().send(order(2)).await.unwrap();

    eventually(|| content_types.lock().unwrap().len() == 1).await;
    assert_eq!(content_types.lock().unwrap()[0].as_deref(), Some(BITCODE));

    sender.shutdown().await;
    receiver.shutdown().await;
}
