//! Two nodes talking over real sockets.

use std::sync::Arc;
use std::time::Duration;

use durable_bus::persistence::InMemoryEnvelopeStore;
use durable_bus::transport::TcpTransport;
use durable_bus::{
    BusSettings, HandlerError, HandlerGraph, ListenerSettings, MessagingBuilder, MessagingRoot,
    RequestOptions,
};

use crate::support::{eventually, init_tracing, order, settings, uri, GetPrice, Orders, Price};

async fn tcp_node(settings: BusSettings, handlers: HandlerGraph) -> MessagingRoot {
    init_tracing();
    MessagingBuilder::new(settings)
        .transport(Arc::new(TcpTransport::new()))
        .persistence(Arc::new(InMemoryEnvelopeStore::new()))
        .handlers(handlers)
        .start()
        .await
        .unwrap()
}

#[tokio::test]
async fn durable_send_and_request_over_tcp() {
    let orders = Orders::default();
    let handlers = orders.handlers().respond(|query: GetPrice, _envelope| async move {
        Ok::<_, HandlerError>(Price { sku: query.sku, cents: 42 })
    });
    let server = tcp_node(
        settings("server").with_listener(ListenerSettings::parse("tcp://127.0.0.1:24902/durable").unwrap()),
        handlers,
    )
    .await;
    let client = tcp_node(
        settings("client").with_listener(ListenerSettings::parse("tcp://127.0.0.1:24901").unwrap()),
        HandlerGraph::new(),
    )
    .await;
    assert!(client.endpoint_errors().is_empty());
    assert_eq!(client.reply_uri("tcp"), Some(uri("tcp://127.0.0.1:24901")));

    client
        .bus()
        .send_to(uri("tcp://127.0.0.1:24902/durable"), order(1))
        .await
        .unwrap();
    eventually(|| orders.len() == 1).await;

    let price: Price = client
        .bus()
        .request(
            GetPrice { sku: "tcp".into() },
            RequestOptions::new()
                .to(uri("tcp://127.0.0.1:24902/durable"))
                .timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    assert_eq!(price.cents, 42);

    client.shutdown().await;
    server.shutdown().await;
}
