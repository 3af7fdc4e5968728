//! Application surface of a running node.
//!
//! ```ignore
//! let root = MessagingBuilder::new(
//!         BusSettings::new("orders")
//!             .with_listener(ListenerSettings::parse("tcp://0.0.0.0:2201/durable")?),
//!     )
//!     .transport(Arc::new(TcpTransport::new()))
//!     .handlers(HandlerGraph::new().handle(|order: PlaceOrder, _envelope| async move {
//!         ship(order).await
//!     }))
//!     .start()
//!     .await?;
//!
//! root.bus().send(PlaceOrder { order_id: "o-1".into() }).await?;
//! root.shutdown().await;
//! ```

mod builder;
mod replies;
mod root;
mod sender;
mod service_bus;

pub use builder::MessagingBuilder;
pub use replies::{ReplyWatch, ReplyWatcher};
pub use root::MessagingRoot;
pub use sender::EnvelopeSender;
pub use service_bus::{RequestOptions, ServiceBus};
