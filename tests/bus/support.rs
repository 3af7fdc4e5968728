//! Shared messages and node helpers for the bus integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use durable_bus::persistence::InMemoryEnvelopeStore;
use durable_bus::transport::{MemoryHub, MemoryTransport};
use durable_bus::{
    BusSettings, DurabilitySettings, HandlerGraph, HandlerError, ListenerSettings, Message,
    MessagingBuilder, MessagingRoot,
};
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub order_id: String,
    pub sequence: u32,
}

impl Message for PlaceOrder {
    const MESSAGE_TYPE: &'static str = "place-order";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetPrice {
    pub sku: String,
}

impl Message for GetPrice {
    const MESSAGE_TYPE: &'static str = "get-price";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub sku: String,
    pub cents: u64,
}

impl Message for Price {
    const MESSAGE_TYPE: &'static str = "price";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flaky {
    pub id: u32,
}

impl Message for Flaky {
    const MESSAGE_TYPE: &'static str = "flaky";
}

pub fn order(sequence: u32) -> PlaceOrder {
    PlaceOrder {
        order_id: format!("o-{sequence}"),
        sequence,
    }
}

pub fn uri(s: &str) -> Url {
    Url::parse(s).unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Settings tuned for tests: fast flushes, fast polling, no metrics.
pub fn settings(service: &str) -> BusSettings {
    BusSettings::new(service)
        .with_batching(50, Duration::from_millis(10))
        .with_ping_interval(Duration::from_millis(50))
        .with_metrics_interval(Duration::ZERO)
        .with_durability(
            DurabilitySettings::default()
                .with_polling(Duration::from_millis(50))
                .with_reconnect_delay(Duration::from_millis(20)),
        )
}

pub fn listening(service: &str, listener: ListenerSettings) -> BusSettings {
    settings(service).with_listener(listener)
}

/// Start a node on the memory transport.
pub async fn start_node(
    settings: BusSettings,
    hub: &MemoryHub,
    store: &InMemoryEnvelopeStore,
    handlers: HandlerGraph,
) -> MessagingRoot {
    init_tracing();
    MessagingBuilder::new(settings)
        .transport(Arc::new(MemoryTransport::new(hub.clone())))
        .persistence(Arc::new(store.clone()))
        .handlers(handlers)
        .start()
        .await
        .unwrap()
}

/// Collects every `PlaceOrder` a node handles.
#[derive(Clone, Default)]
pub struct Orders(Arc<Mutex<Vec<PlaceOrder>>>);

impl Orders {
    pub fn handlers(&self) -> HandlerGraph {
        let seen = self.clone();
        HandlerGraph::new().handle(move |order: PlaceOrder, _envelope| {
            let seen = seen.clone();
            async move {
                seen.0.lock().unwrap().push(order);
                Ok::<(), HandlerError>(())
            }
        })
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn sequences(&self) -> Vec<u32> {
        self.0.lock().unwrap().iter().map(|o| o.sequence).collect()
    }
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
