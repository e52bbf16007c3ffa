use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ebus_conf::BusConfig;

use crate::cipher::{AesCfb, Cipher};
use crate::consumer::{ConsumerContext, Registry, Supervisor};
use crate::fatal::{self, FatalHook};
use crate::publisher::{PublishPolicy, PublishReceipt, Publisher};
use crate::stats::{Fault, Stats, StatsSnapshot};
use crate::transport::{Topology, Transport};
use crate::{BusError, Result};

/// Encrypted publish/subscribe over one broker connection.
///
/// Cloning is cheap; clones share the connection, the publish lock and the
/// consumer.
#[derive(Clone)]
pub struct BusClient {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: BusConfig,
    publisher: Publisher,
    consumer: Arc<ConsumerContext>,
    registry: Arc<RwLock<Arc<Registry>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    stats: Arc<Stats>,
}

pub struct BusClientBuilder {
    cfg: BusConfig,
    transport: Option<Arc<dyn Transport>>,
    cipher: Option<Arc<dyn Cipher>>,
    fatal: Option<FatalHook>,
}

impl BusClientBuilder {
    /// Uses `transport` instead of connecting to `dsn`.
    #[inline]
    pub fn transport<T: Transport + 'static>(mut self, transport: T) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Replaces the AES cipher keyed by the configured secret.
    #[inline]
    pub fn cipher<C: Cipher + 'static>(mut self, cipher: C) -> Self {
        self.cipher = Some(Arc::new(cipher));
        self
    }

    /// Receives fatal errors raised after construction: topology declaration
    /// and close failures. Defaults to [`fatal::exit_hook`].
    #[inline]
    pub fn fatal_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&BusError) + Send + Sync + 'static,
    {
        self.fatal = Some(Arc::new(hook));
        self
    }

    /// Validates the configuration, then opens the transport.
    pub async fn build(self) -> Result<BusClient> {
        let kind = self.cfg.validate()?;
        let cipher = match self.cipher {
            Some(cipher) => cipher,
            None => Arc::new(AesCfb::new(self.cfg.secret.as_bytes())?),
        };
        let transport = match self.transport {
            Some(transport) => transport,
            None => Self::connect(&self.cfg.dsn).await?,
        };
        let fatal = self.fatal.unwrap_or_else(fatal::exit_hook);
        let stats = Arc::new(Stats::default());

        let topology = Topology {
            exchange: self.cfg.exchange_name.clone(),
            kind,
            queue: self.cfg.exchange_queue.clone(),
            consumer_tag: self.cfg.consumer_tag.clone(),
        };
        let publisher = Publisher::new(
            transport.clone(),
            cipher.clone(),
            topology.exchange.clone(),
            self.cfg.enable_debug_message,
            stats.clone(),
        );
        let consumer = Arc::new(ConsumerContext {
            transport,
            cipher,
            topology,
            debug_message: self.cfg.enable_debug_message,
            rejoin_delay: self.cfg.effective_rejoin_delay(),
            stats: stats.clone(),
            fatal,
        });

        Ok(BusClient {
            inner: Arc::new(Inner {
                cfg: self.cfg,
                publisher,
                consumer,
                registry: Arc::new(RwLock::new(Arc::new(Registry::new()))),
                supervisor: Mutex::new(None),
                shutdown: CancellationToken::new(),
                stats,
            }),
        })
    }

    #[cfg(feature = "amqp")]
    async fn connect(dsn: &str) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(crate::transport::AmqpTransport::connect(dsn).await?))
    }

    #[cfg(not(feature = "amqp"))]
    async fn connect(_dsn: &str) -> Result<Arc<dyn Transport>> {
        Err(BusError::msg("no broker transport available, enable the amqp feature"))
    }
}

impl BusClient {
    #[inline]
    pub fn builder(cfg: BusConfig) -> BusClientBuilder {
        BusClientBuilder { cfg, transport: None, cipher: None, fatal: None }
    }

    #[cfg(feature = "amqp")]
    #[inline]
    pub async fn connect(cfg: BusConfig) -> Result<Self> {
        Self::builder(cfg).build().await
    }

    /// Like [`BusClient::connect`], but an invalid configuration or a failed
    /// connect terminates the process.
    #[cfg(feature = "amqp")]
    pub async fn connect_or_exit(cfg: BusConfig) -> Self {
        match Self::connect(cfg).await {
            Ok(client) => client,
            Err(e) => fatal::exit(e),
        }
    }

    /// Fire-and-forget publish of `message` on `topic`.
    ///
    /// Retries follow `policy`; the outcome is only logged.
    pub async fn publish(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        message: &[u8],
        policy: Option<PublishPolicy>,
    ) {
        if self.is_closed() {
            log::warn!("Publish topic {topic} on a closed bus client");
            return;
        }
        self.inner.publisher.publish(ctx, topic, message, policy).await
    }

    /// Publishes like [`BusClient::publish`] and reports the outcome.
    pub async fn try_publish(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        message: &[u8],
        policy: Option<PublishPolicy>,
    ) -> Result<PublishReceipt> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        self.inner.publisher.try_publish(ctx, topic, message, policy).await
    }

    /// Serializes `value` as JSON and publishes it.
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        value: &T,
        policy: Option<PublishPolicy>,
    ) -> Result<PublishReceipt> {
        let message = serde_json::to_vec(value)?;
        self.try_publish(ctx, topic, &message, policy).await
    }

    /// Declares the topology for `registry` and starts consuming in the
    /// background.
    ///
    /// When a consumer is already running, `registry` only replaces the one
    /// used after its next restart. A declaration failure is fatal, unless
    /// [`BusClient::close`] ran meanwhile, which yields [`BusError::Closed`].
    pub async fn listen(&self, registry: Registry) -> Result<()> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let ctx = &self.inner.consumer;
        let registry = Arc::new(registry);

        let mut supervisor = self.inner.supervisor.lock().await;
        if supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            *self.inner.registry.write() = registry;
            log::info!(
                "[E: {}] [Q: {}] Consumer registry replaced, applies from the next rejoin",
                ctx.topology.exchange,
                ctx.topology.queue
            );
            return Ok(());
        }

        *self.inner.registry.write() = registry.clone();
        let deliveries = match ctx.topology.declare(ctx.transport.as_ref(), &registry).await {
            Ok(deliveries) => deliveries,
            //close() raced the declaration and tore the channel down under it
            Err(e) if self.is_closed() => {
                log::debug!("listen interrupted by close, {e}");
                return Err(BusError::Closed);
            }
            Err(e) => return Err(fatal::report(&ctx.fatal, e)),
        };

        let task = Supervisor::new(ctx.clone(), self.inner.registry.clone(), self.inner.shutdown.clone());
        *supervisor = Some(tokio::spawn(task.run(deliveries)));
        Ok(())
    }

    /// Stops consuming, then closes the channel and the connection in that
    /// order. A close failure is fatal.
    pub async fn close(&self) -> Result<()> {
        self.inner.shutdown.cancel();
        let ctx = &self.inner.consumer;

        ctx.transport.close_channel().await.map_err(|e| fatal::report(&ctx.fatal, e))?;
        log::debug!("channel closed");
        ctx.transport.close_connection().await.map_err(|e| fatal::report(&ctx.fatal, e))?;
        log::debug!("connection closed");

        if let Some(task) = self.inner.supervisor.lock().await.take() {
            if let Err(e) = task.await {
                log::warn!("consumer supervisor exited abnormally, {e}");
            }
        }
        Ok(())
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    #[inline]
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// The delivery behind the most recent consumer restart.
    #[inline]
    pub fn last_fault(&self) -> Option<Fault> {
        self.inner.stats.last_fault()
    }

    #[inline]
    pub fn config(&self) -> &BusConfig {
        &self.inner.cfg
    }
}
