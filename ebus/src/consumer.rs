//! Inbound path.
//!
//! A [`Registry`] maps topics to [`Handler`]s. The consume loop runs on its own
//! task and dispatches deliveries one at a time in stream order. Skipped
//! deliveries and handler errors never stop the loop. A handler panic ends the
//! task; the [`Supervisor`] notices it through the join handle, waits the
//! rejoin delay, re-declares the topology and starts a fresh task. At most one
//! consume task is alive at any moment.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::cipher::Cipher;
use crate::fatal::{self, FatalHook};
use crate::stats::{Fault, Stats};
use crate::transport::{Delivery, DeliveryStream, Topology, Transport};

#[async_trait]
pub trait Handler: Send + Sync {
    /// Handles one decrypted delivery. A returned error is logged and the
    /// delivery is dropped.
    async fn consume(&self, delivery: Delivery) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    #[inline]
    async fn consume(&self, delivery: Delivery) -> anyhow::Result<()> {
        (self)(delivery).await
    }
}

/// Topic to handler mapping. Lookup is by exact routing key.
#[derive(Clone, Default)]
pub struct Registry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl Registry {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn register<T, H>(mut self, topic: T, handler: H) -> Self
    where
        T: Into<String>,
        H: Handler + 'static,
    {
        self.handlers.insert(topic.into(), Arc::new(handler));
        self
    }

    #[inline]
    pub fn insert<T: Into<String>>(&mut self, topic: T, handler: Arc<dyn Handler>) -> Option<Arc<dyn Handler>> {
        self.handlers.insert(topic.into(), handler)
    }

    #[inline]
    pub fn get(&self, topic: &str) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(topic)
    }

    #[inline]
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(|t| t.as_str())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

impl<T: Into<String>> FromIterator<(T, Arc<dyn Handler>)> for Registry {
    fn from_iter<I: IntoIterator<Item = (T, Arc<dyn Handler>)>>(iter: I) -> Self {
        Self { handlers: iter.into_iter().map(|(t, h)| (t.into(), h)).collect() }
    }
}

/// Topic and id of the delivery a consume task is working on.
#[derive(Debug, Clone, Default)]
pub(crate) struct LoopState {
    pub(crate) topic: String,
    pub(crate) id: String,
}

pub(crate) struct ConsumerContext {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) cipher: Arc<dyn Cipher>,
    pub(crate) topology: Topology,
    pub(crate) debug_message: bool,
    pub(crate) rejoin_delay: Duration,
    pub(crate) stats: Arc<Stats>,
    pub(crate) fatal: FatalHook,
}

impl ConsumerContext {
    async fn run(
        self: Arc<Self>,
        registry: Arc<Registry>,
        mut deliveries: DeliveryStream,
        state: Arc<Mutex<LoopState>>,
        shutdown: CancellationToken,
    ) {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                d = deliveries.next() => match d {
                    Some(d) => d,
                    None => break,
                },
            };
            self.dispatch(&registry, delivery, &state).await;
        }
    }

    async fn dispatch(&self, registry: &Registry, mut delivery: Delivery, state: &Mutex<LoopState>) {
        let topic = delivery.topic.clone();
        let id = delivery.id_or_default().to_owned();
        *state.lock() = LoopState { topic: topic.clone(), id: id.clone() };

        let Some(handler) = registry.get(&topic) else {
            log::error!("[{topic}] [{id}] Consumer has no handler registered for topic");
            Stats::incr(&self.stats.dropped);
            return;
        };

        let plaintext = match self.cipher.decrypt(&delivery.body) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                log::error!("[{topic}] [{id}] Consumer failed to decrypt message, {e}");
                Stats::incr(&self.stats.dropped);
                return;
            }
        };
        if self.debug_message {
            log::debug!("[{topic}] [{id}] Body: {}", String::from_utf8_lossy(&plaintext));
        }
        delivery.body = Bytes::from(plaintext);

        match handler.consume(delivery).await {
            Ok(()) => {
                log::debug!("[{topic}] [{id}] Consumed message");
                Stats::incr(&self.stats.consumed);
            }
            Err(e) => {
                log::warn!("[{topic}] [{id}] Consumer handler error, {e}");
                Stats::incr(&self.stats.handler_errors);
            }
        }
    }
}

/// Owns the consume task of one bus client.
pub(crate) struct Supervisor {
    ctx: Arc<ConsumerContext>,
    registry: Arc<RwLock<Arc<Registry>>>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub(crate) fn new(
        ctx: Arc<ConsumerContext>,
        registry: Arc<RwLock<Arc<Registry>>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self { ctx, registry, shutdown }
    }

    /// Consumes `deliveries`, restarting after every handler panic, until
    /// shutdown or until the delivery stream ends on its own.
    pub(crate) async fn run(self, mut deliveries: DeliveryStream) {
        let topology = &self.ctx.topology;
        loop {
            let registry = self.registry.read().clone();
            let state = Arc::new(Mutex::new(LoopState::default()));
            let task = tokio::spawn(self.ctx.clone().run(registry, deliveries, state.clone(), self.shutdown.clone()));

            match task.await {
                Ok(()) if self.shutdown.is_cancelled() => {
                    log::info!("[E: {}] [Q: {}] Consumer stopped", topology.exchange, topology.queue);
                    return;
                }
                Ok(()) => {
                    log::warn!("[E: {}] [Q: {}] Consumer delivery stream ended", topology.exchange, topology.queue);
                    return;
                }
                Err(e) if e.is_panic() => {
                    let LoopState { topic, id } = state.lock().clone();
                    let message = panic_message(e);
                    log::error!("[{topic}] [{id}] Consumer recovering from fault, {message}");
                    self.ctx.stats.record_fault(Fault { topic, id, message });
                }
                Err(e) => {
                    log::warn!("[E: {}] [Q: {}] Consumer task aborted, {e}", topology.exchange, topology.queue);
                    return;
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.ctx.rejoin_delay) => {}
            }

            log::info!("[E: {}] [Q: {}] Consumer rejoining", topology.exchange, topology.queue);
            let registry = self.registry.read().clone();
            deliveries = match topology.declare(self.ctx.transport.as_ref(), &registry).await {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    if !self.shutdown.is_cancelled() {
                        fatal::report(&self.ctx.fatal, e);
                    }
                    return;
                }
            };
        }
    }
}

fn panic_message(e: JoinError) -> String {
    match e.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".into()),
        Err(e) => e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::AesCfb;
    use crate::transport::MemoryTransport;
    use crate::BusError;
    use ebus_conf::ExchangeType;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    const SECRET: &[u8] = b"0123456789abcdef01234567";
    const REJOIN: Duration = Duration::from_secs(5);

    struct Harness {
        transport: MemoryTransport,
        cipher: AesCfb,
        shutdown: CancellationToken,
        fatal: Arc<Mutex<Vec<String>>>,
        stats: Arc<Stats>,
        supervisor: tokio::task::JoinHandle<()>,
    }

    impl Harness {
        async fn start(transport: MemoryTransport, registry: Registry) -> Self {
            let fatal = Arc::new(Mutex::new(Vec::new()));
            let fatal_log = fatal.clone();
            let stats = Arc::new(Stats::default());
            let cipher = AesCfb::new(SECRET).unwrap();
            let ctx = Arc::new(ConsumerContext {
                transport: Arc::new(transport.clone()),
                cipher: Arc::new(cipher.clone()),
                topology: Topology {
                    exchange: "events".into(),
                    kind: ExchangeType::Direct,
                    queue: "billing".into(),
                    consumer_tag: String::new(),
                },
                debug_message: true,
                rejoin_delay: REJOIN,
                stats: stats.clone(),
                fatal: Arc::new(move |e: &BusError| fatal_log.lock().push(e.to_string())),
            });
            let registry = Arc::new(RwLock::new(Arc::new(registry)));
            let deliveries = ctx.topology.declare(&transport, &registry.read()).await.unwrap();
            let shutdown = CancellationToken::new();
            let supervisor = tokio::spawn(Supervisor::new(ctx, registry, shutdown.clone()).run(deliveries));
            Self { transport, cipher, shutdown, fatal, stats, supervisor }
        }

        fn send(&self, topic: &str, id: &str, body: &[u8]) {
            let body = self.cipher.encrypt(body).unwrap();
            self.transport.deliver(Delivery::new(topic, Some(id.to_owned()), body));
        }

        async fn stop(self) {
            self.shutdown.cancel();
            self.transport.close_channel().await.unwrap();
            self.supervisor.await.unwrap();
        }
    }

    async fn explode(_: Delivery) -> anyhow::Result<()> {
        panic!("handler blew up")
    }

    fn forward(tx: mpsc::UnboundedSender<Delivery>) -> impl Handler {
        move |d: Delivery| {
            let tx = tx.clone();
            async move {
                tx.send(d)?;
                Ok::<_, anyhow::Error>(())
            }
        }
    }

    #[test]
    fn test_registry() {
        let noop = |_: Delivery| async { Ok::<_, anyhow::Error>(()) };
        let mut r = Registry::new().register("orders", noop).register("payments", noop);
        assert_eq!(r.len(), 2);
        assert!(r.get("orders").is_some());
        assert!(r.get("orders.created").is_none());
        let mut topics = r.topics().collect::<Vec<_>>();
        topics.sort();
        assert_eq!(topics, ["orders", "payments"]);
        assert!(r.insert("orders", Arc::new(noop)).is_some());
        assert_eq!(r.len(), 2);

        let collected: Registry = [("refunds", Arc::new(noop) as Arc<dyn Handler>)].into_iter().collect();
        assert_eq!(collected.len(), 1);
        assert!(Registry::new().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_binds_every_topic_and_dispatches_plaintext() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = Registry::new().register("orders", forward(tx.clone())).register("payments", forward(tx));
        let h = Harness::start(MemoryTransport::new(), registry).await;

        let mut keys = h.transport.bindings().into_iter().map(|b| b.routing_key).collect::<Vec<_>>();
        keys.sort();
        assert_eq!(keys, ["orders", "payments"]);

        h.send("payments", "p1", b"{\"amount\":3}");
        let d = rx.recv().await.unwrap();
        assert_eq!(d.topic, "payments");
        assert_eq!(d.id.as_deref(), Some("p1"));
        assert_eq!(&d.body[..], b"{\"amount\":3}");
        assert_eq!(h.stats.snapshot().consumed, 1);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_topic_is_skipped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let h = Harness::start(MemoryTransport::new(), Registry::new().register("orders", forward(tx))).await;

        h.send("refunds", "r1", b"ignored");
        h.send("orders", "o1", b"kept");
        assert_eq!(rx.recv().await.unwrap().id.as_deref(), Some("o1"));
        assert_eq!(h.stats.snapshot().dropped, 1);
        assert_eq!(h.stats.snapshot().faults, 0);
        assert_eq!(h.transport.consumes(), 1);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecryptable_body_is_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let h = Harness::start(MemoryTransport::new(), Registry::new().register("orders", forward(tx))).await;

        h.transport.deliver(Delivery::new("orders", Some("bad".into()), Bytes::from_static(b"%%% not base64")));
        h.send("orders", "good", b"ok");
        assert_eq!(rx.recv().await.unwrap().id.as_deref(), Some("good"));
        assert_eq!(h.stats.snapshot().dropped, 1);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_error_does_not_stop_loop() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let handler = move |d: Delivery| {
            let tx = tx.clone();
            async move {
                if &d.body[..] == b"reject" {
                    anyhow::bail!("rejected {}", d.id_or_default());
                }
                tx.send(d)?;
                Ok::<_, anyhow::Error>(())
            }
        };
        let h = Harness::start(MemoryTransport::new(), Registry::new().register("orders", handler)).await;

        h.send("orders", "1", b"reject");
        h.send("orders", "2", b"accept");
        assert_eq!(rx.recv().await.unwrap().id.as_deref(), Some("2"));
        let stats = h.stats.snapshot();
        assert_eq!((stats.handler_errors, stats.consumed, stats.faults), (1, 1, 0));
        assert_eq!(h.transport.consumes(), 1);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_rejoins_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel::<(Delivery, Instant)>();
        let handler = move |d: Delivery| {
            let tx = tx.clone();
            async move {
                if &d.body[..] == b"boom" {
                    panic!("handler blew up");
                }
                tx.send((d, Instant::now()))?;
                Ok::<_, anyhow::Error>(())
            }
        };
        let h = Harness::start(MemoryTransport::new(), Registry::new().register("orders", handler)).await;
        assert_eq!(h.transport.exchange_declares(), 1);

        let faulted_at = Instant::now();
        h.send("orders", "X", b"boom");
        h.send("orders", "Y", b"after");

        let (d, handled_at) = rx.recv().await.unwrap();
        assert_eq!(d.id.as_deref(), Some("Y"));
        assert!(handled_at - faulted_at >= REJOIN);
        assert_eq!(h.transport.exchange_declares(), 2);
        assert_eq!(h.transport.consumes(), 2);
        assert_eq!(h.stats.snapshot().faults, 1);
        let fault = h.stats.last_fault().unwrap();
        assert_eq!((fault.topic.as_str(), fault.id.as_str()), ("orders", "X"));
        assert_eq!(fault.message, "handler blew up");
        assert!(h.fatal.lock().is_empty());
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_redeclare_is_fatal() {
        let t = MemoryTransport::new();
        let h = Harness::start(t.clone(), Registry::new().register("orders", explode)).await;
        t.fail_declarations_after(0);

        h.send("orders", "X", b"boom");
        tokio::time::sleep(REJOIN * 2).await;

        assert!(h.supervisor.is_finished());
        assert_eq!(h.fatal.lock().len(), 1);
        assert_eq!(t.consumes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_rejoin_delay() {
        let h = Harness::start(MemoryTransport::new(), Registry::new().register("orders", explode)).await;

        h.send("orders", "X", b"boom");
        tokio::time::sleep(REJOIN / 2).await;
        let t = h.transport.clone();
        h.stop().await;
        assert_eq!(t.exchange_declares(), 1);
        assert_eq!(t.consumes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_registry_applies_after_restart() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let t = MemoryTransport::new();
        let old = Registry::new().register("orders", explode);
        let new = Registry::new().register("orders", forward(tx));

        let cipher = AesCfb::new(SECRET).unwrap();
        let stats = Arc::new(Stats::default());
        let ctx = Arc::new(ConsumerContext {
            transport: Arc::new(t.clone()),
            cipher: Arc::new(cipher.clone()),
            topology: Topology {
                exchange: "events".into(),
                kind: ExchangeType::Direct,
                queue: "billing".into(),
                consumer_tag: String::new(),
            },
            debug_message: false,
            rejoin_delay: Duration::from_millis(10),
            stats: stats.clone(),
            fatal: Arc::new(|_: &BusError| {}),
        });
        let registry = Arc::new(RwLock::new(Arc::new(old)));
        let deliveries = ctx.topology.declare(&t, &registry.read()).await.unwrap();
        let shutdown = CancellationToken::new();
        let supervisor = tokio::spawn(Supervisor::new(ctx, registry.clone(), shutdown.clone()).run(deliveries));

        t.deliver(Delivery::new("orders", Some("1".into()), cipher.encrypt(b"first").unwrap()));
        while stats.snapshot().faults == 0 {
            tokio::task::yield_now().await;
        }
        *registry.write() = Arc::new(new);
        t.deliver(Delivery::new("orders", Some("2".into()), cipher.encrypt(b"second").unwrap()));
        assert_eq!(rx.recv().await.unwrap().id.as_deref(), Some("2"));
        assert_eq!(t.consumes(), 2);

        shutdown.cancel();
        t.close_channel().await.unwrap();
        supervisor.await.unwrap();
    }
}
