//! Listener startup failures and back-pressure.

use std::time::Duration;

use durable_bus::persistence::InMemoryEnvelopeStore;
use durable_bus::transport::{ListeningStatus, MemoryHub};
use durable_bus::{BusError, HandlerGraph, ListenerSettings};

use crate::support::{eventually, listening, order, settings, start_node, uri, Orders};

#[tokio::test]
async fn listener_without_a_transport_is_reported_and_the_rest_runs() {
    let hub = MemoryHub::new();
    let orders = Orders::default();
    let node = start_node(
        listening("mixed", ListenerSettings::parse("memory://good").unwrap())
            .with_listener(ListenerSettings::parse("amqp://broker/orders").unwrap()),
        &hub,
        &InMemoryEnvelopeStore::new(),
        orders.handlers(),
    )
    .await;

    let errors = node.endpoint_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].uri, uri("amqp://broker/orders"));
    assert!(matches!(*errors[0].source, BusError::UnknownScheme(ref s) if s == "amqp"));
    assert!(hub.is_listening(&uri("memory://good")));

    let sender = start_node(settings("sender"), &hub, &InMemoryEnvelopeStore::new(), HandlerGraph::new()).await;
    sender.bus().send_to(uri("memory://good"), order(1)).await.unwrap();
    eventually(|| orders.len() == 1).await;

    sender.shutdown().await;
    node.shutdown().await;
}

#[tokio::test]
async fn busy_listener_holds_senders_until_it_resumes() {
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
        settings("orders").with_failures_before_latch(1),
        &hub,
        &InMemoryEnvelopeStore::new(),
        HandlerGraph::new(),
    )
    .await;

    receiver.set_listening_status(ListeningStatus::TooBusy);
    assert!(receiver
        .listeners()
        .iter()
        .all(|l| l.status() == ListeningStatus::TooBusy));

    sender.bus().send_to(uri("memory://shipping"), order(1)).await.unwrap();
    let agent = sender.channels().get_or_build(&uri("memory://shipping")).unwrap();
    eventually(|| agent.latched()).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(orders.len(), 0);

    receiver.set_listening_status(ListeningStatus::Accepting);
    eventually(|| orders.len() == 1).await;
    eventually(|| !agent.latched()).await;

    sender.shutdown().await;
    receiver.shutdown().await;
}
