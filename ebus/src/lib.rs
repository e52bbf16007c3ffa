#![deny(unsafe_code)]
//! Encrypted, topic-routed message bus client.
//!
//! Messages are encrypted with a shared secret and published to a broker
//! exchange under their topic, with bounded fixed-delay retries. Consumers
//! register one handler per topic; the background consume loop decrypts each
//! delivery, dispatches it and restarts itself after a handler panic.
//!
//! ```no_run
//! use ebus::{BusClient, CancellationToken, Delivery, Registry};
//! # async fn run(cfg: ebus::conf::BusConfig) -> ebus::Result<()> {
//! let client = BusClient::connect(cfg).await?;
//! client
//!     .listen(Registry::new().register("orders.created", |d: Delivery| async move {
//!         log::info!("order {}", String::from_utf8_lossy(&d.body));
//!         Ok::<_, anyhow::Error>(())
//!     }))
//!     .await?;
//! client.publish(&CancellationToken::new(), "orders.created", b"{\"id\":1}", None).await;
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod cipher; // Payload encryption
mod client;
pub mod consumer; // Topic registry and supervised consume loop
mod error;
pub mod fatal;
pub mod logger; // log to slog bridge
pub mod publisher; // Bounded-retry publishing
pub mod stats;
pub mod transport; // Broker boundary, AMQP and in-memory

pub use client::{BusClient, BusClientBuilder};
pub use consumer::{Handler, Registry};
pub use error::BusError;
pub use publisher::{PublishPolicy, PublishReceipt};
pub use stats::{Fault, StatsSnapshot};
pub use transport::{Delivery, Envelope, Transport};

pub use ebus_conf as conf;
pub use ebus_utils as utils;
pub use tokio_util::sync::CancellationToken;

pub type Result<T, E = BusError> = std::result::Result<T, E>;
