//! In-process broker double.
//!
//! Models one connection with one queue: publishes are routed through the
//! declared exchange bindings into the queue, and `consume` hands out a stream
//! over that queue. Failures can be injected for publishes and declarations,
//! and raw deliveries can be pushed straight into the queue.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ebus_conf::ExchangeType;

use super::{Delivery, DeliveryStream, Envelope, Transport};
use crate::{BusError, Result};

#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    queue_tx: mpsc::UnboundedSender<Delivery>,
    queue_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>>,
    closed: CancellationToken,
    connection_closed: AtomicBool,
    publish_attempts: AtomicUsize,
}

#[derive(Default)]
struct State {
    exchanges: Vec<(String, ExchangeType)>,
    queues: Vec<String>,
    bindings: Vec<Binding>,
    published: Vec<Envelope>,
    attempted_ids: Vec<String>,
    consumes: usize,
    fail_publishes: usize,
    fail_declare_after: Option<usize>,
    exchange_declares: usize,
}

/// A queue-to-exchange binding as recorded by [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                queue_tx,
                queue_rx: Arc::new(tokio::sync::Mutex::new(queue_rx)),
                closed: CancellationToken::new(),
                connection_closed: AtomicBool::new(false),
                publish_attempts: AtomicUsize::new(0),
            }),
        }
    }

    /// Makes the next `n` publish calls fail.
    pub fn fail_next_publishes(&self, n: usize) {
        self.inner.state.lock().fail_publishes = n;
    }

    /// Lets `n` more exchange declarations succeed, then fails every following one.
    pub fn fail_declarations_after(&self, n: usize) {
        let mut state = self.inner.state.lock();
        state.fail_declare_after = Some(state.exchange_declares + n);
    }

    /// Pushes a raw delivery into the queue, bypassing exchange routing.
    pub fn deliver(&self, delivery: Delivery) {
        if self.inner.queue_tx.send(delivery).is_err() {
            log::warn!("memory transport queue dropped a delivery");
        }
    }

    /// Every successful publish, in order.
    pub fn published(&self) -> Vec<Envelope> {
        self.inner.state.lock().published.clone()
    }

    /// Every publish call, successful or not.
    pub fn publish_attempts(&self) -> usize {
        self.inner.publish_attempts.load(Ordering::SeqCst)
    }

    /// Envelope ids of every publish call on an open channel, in order.
    pub fn attempted_ids(&self) -> Vec<String> {
        self.inner.state.lock().attempted_ids.clone()
    }

    pub fn exchanges(&self) -> Vec<(String, ExchangeType)> {
        self.inner.state.lock().exchanges.clone()
    }

    pub fn queues(&self) -> Vec<String> {
        self.inner.state.lock().queues.clone()
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.inner.state.lock().bindings.clone()
    }

    /// Number of `consume` calls, one per consumer loop incarnation.
    pub fn consumes(&self) -> usize {
        self.inner.state.lock().consumes
    }

    pub fn exchange_declares(&self) -> usize {
        self.inner.state.lock().exchange_declares
    }

    pub fn is_channel_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    pub fn is_connection_closed(&self) -> bool {
        self.inner.connection_closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.is_cancelled() {
            Err(BusError::msg("channel closed"))
        } else {
            Ok(())
        }
    }
}

impl State {
    fn routes(&self, exchange: &str, routing_key: &str) -> bool {
        let Some((_, kind)) = self.exchanges.iter().find(|(name, _)| name == exchange) else {
            return false;
        };
        self.bindings.iter().filter(|b| b.exchange == exchange).any(|b| match kind {
            ExchangeType::Direct => b.routing_key == routing_key,
            ExchangeType::Topic => topic_matches(&b.routing_key, routing_key),
            ExchangeType::Fanout | ExchangeType::Headers => true,
        })
    }
}

/// AMQP topic matching: words are separated by `.`, `*` matches exactly one
/// word and `#` matches zero or more words.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..])),
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }
    let pattern = pattern.split('.').collect::<Vec<_>>();
    let key = routing_key.split('.').collect::<Vec<_>>();
    matches(&pattern, &key)
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn declare_exchange(&self, name: &str, kind: ExchangeType) -> Result<()> {
        self.check_open()?;
        let mut state = self.inner.state.lock();
        state.exchange_declares += 1;
        if state.fail_declare_after.is_some_and(|n| state.exchange_declares > n) {
            return Err(BusError::msg(format!("exchange {name} declaration refused")));
        }
        if !state.exchanges.iter().any(|(n, _)| n == name) {
            state.exchanges.push((name.to_owned(), kind));
        }
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<String> {
        self.check_open()?;
        let mut state = self.inner.state.lock();
        if !state.queues.iter().any(|q| q == name) {
            state.queues.push(name.to_owned());
        }
        Ok(name.to_owned())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.check_open()?;
        let binding =
            Binding { queue: queue.to_owned(), exchange: exchange.to_owned(), routing_key: routing_key.to_owned() };
        let mut state = self.inner.state.lock();
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn consume(&self, _queue: &str, _consumer_tag: &str) -> Result<DeliveryStream> {
        self.check_open()?;
        self.inner.state.lock().consumes += 1;

        let rx = self.inner.queue_rx.clone();
        let closed = self.inner.closed.clone();
        let stream = futures::stream::unfold((rx, closed), |(rx, closed)| async move {
            let next = {
                let mut rx_guard = rx.lock().await;
                tokio::select! {
                    _ = closed.cancelled() => None,
                    d = rx_guard.recv() => d,
                }
            };
            next.map(|d| (d, (rx, closed)))
        });
        Ok(stream.boxed())
    }

    async fn publish(&self, exchange: &str, envelope: &Envelope) -> Result<()> {
        self.inner.publish_attempts.fetch_add(1, Ordering::SeqCst);
        self.check_open()?;
        let routed = {
            let mut state = self.inner.state.lock();
            state.attempted_ids.push(envelope.id.clone());
            if state.fail_publishes > 0 {
                state.fail_publishes -= 1;
                return Err(BusError::msg(format!("publish to {exchange} refused")));
            }
            state.published.push(envelope.clone());
            state.routes(exchange, &envelope.topic)
        };
        if routed {
            self.deliver(Delivery::new(envelope.topic.clone(), Some(envelope.id.clone()), envelope.body.clone()));
        }
        Ok(())
    }

    async fn close_channel(&self) -> Result<()> {
        self.check_open()?;
        self.inner.closed.cancel();
        Ok(())
    }

    async fn close_connection(&self) -> Result<()> {
        if self.inner.connection_closed.swap(true, Ordering::SeqCst) {
            return Err(BusError::msg("connection already closed"));
        }
        self.inner.closed.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("orders.created", "orders.created"));
        assert!(!topic_matches("orders.created", "orders.updated"));
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders"));
        assert!(topic_matches("orders.#", "orders.created.eu"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.created", "payments.created"));
        assert!(!topic_matches("*.created", "created"));
        assert!(topic_matches("a.#.z", "a.b.c.z"));
    }

    #[tokio::test]
    async fn test_routing_by_exchange_type() {
        let t = MemoryTransport::new();
        t.declare_exchange("events", ExchangeType::Direct).await.unwrap();
        let q = t.declare_queue("billing").await.unwrap();
        t.bind_queue(&q, "events", "orders").await.unwrap();
        let mut deliveries = t.consume(&q, "").await.unwrap();

        t.publish("events", &Envelope::new("payments", "1", Bytes::from_static(b"a"))).await.unwrap();
        t.publish("events", &Envelope::new("orders", "2", Bytes::from_static(b"b"))).await.unwrap();

        let d = deliveries.next().await.unwrap();
        assert_eq!(d.topic, "orders");
        assert_eq!(d.id.as_deref(), Some("2"));
        assert_eq!(t.published().len(), 2);
        assert_eq!(t.publish_attempts(), 2);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let t = MemoryTransport::new();
        t.fail_next_publishes(2);
        let env = Envelope::new("orders", "1", Bytes::from_static(b"a"));
        assert!(t.publish("events", &env).await.is_err());
        assert!(t.publish("events", &env).await.is_err());
        assert!(t.publish("events", &env).await.is_ok());
        assert_eq!(t.publish_attempts(), 3);
        assert_eq!(t.published(), vec![env]);

        t.fail_declarations_after(1);
        assert!(t.declare_exchange("events", ExchangeType::Topic).await.is_ok());
        assert!(t.declare_exchange("events", ExchangeType::Topic).await.is_err());
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let t = MemoryTransport::new();
        let mut deliveries = t.consume("q", "").await.unwrap();
        t.deliver(Delivery::new("orders", None, Bytes::from_static(b"x")));
        assert!(deliveries.next().await.is_some());

        t.close_channel().await.unwrap();
        assert!(deliveries.next().await.is_none());
        assert!(t.close_channel().await.is_err());
        t.close_connection().await.unwrap();
        assert!(t.is_connection_closed());
        assert!(t.close_connection().await.is_err());
    }
}
