//! Outbound path: bounded-retry, fixed-delay publishing with per-attempt
//! encryption.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cipher::Cipher;
use crate::stats::Stats;
use crate::transport::{Envelope, Transport};
use crate::{BusError, Result};

const DEFAULT_RETRIES: u32 = 1;
const DEFAULT_DELAY: Duration = Duration::from_secs(1);

/// Attempt bound and inter-attempt delay of one publish call.
///
/// Zero values fall back to one attempt and a one second delay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl PublishPolicy {
    #[inline]
    pub fn new(retries: u32, delay: Duration) -> Self {
        Self { retries, delay }
    }

    #[inline]
    fn effective(policy: Option<&PublishPolicy>) -> (u32, Duration) {
        let retries = policy.map(|p| p.retries).filter(|r| *r > 0).unwrap_or(DEFAULT_RETRIES);
        let delay = policy.map(|p| p.delay).filter(|d| !d.is_zero()).unwrap_or(DEFAULT_DELAY);
        (retries, delay)
    }
}

/// Outcome of a publish call that reached the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub id: String,
    pub attempts: u32,
}

pub struct Publisher {
    transport: Arc<dyn Transport>,
    cipher: Arc<dyn Cipher>,
    exchange: String,
    debug_message: bool,
    stats: Arc<Stats>,
    //One attempt at a time per client, held across encryption, send and retry sleep.
    lock: Mutex<()>,
}

impl Publisher {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        cipher: Arc<dyn Cipher>,
        exchange: String,
        debug_message: bool,
        stats: Arc<Stats>,
    ) -> Self {
        Self { transport, cipher, exchange, debug_message, stats, lock: Mutex::new(()) }
    }

    /// Fire-and-forget publish. The outcome is only visible in the logs.
    #[inline]
    pub async fn publish(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        message: &[u8],
        policy: Option<PublishPolicy>,
    ) {
        let _ = self.try_publish(ctx, topic, message, policy).await;
    }

    /// Same retry loop as [`Publisher::publish`], reporting the outcome.
    ///
    /// `ctx` aborts an in-flight send; the sleeps between attempts still run.
    pub async fn try_publish(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        message: &[u8],
        policy: Option<PublishPolicy>,
    ) -> Result<PublishReceipt> {
        let (retries, delay) = PublishPolicy::effective(policy.as_ref());
        let id = Uuid::new_v4().to_string();

        let mut last = None;
        let mut attempt = 1;
        while attempt <= retries {
            let _guard = self.lock.lock().await;

            log::info!("[{attempt}] [{id}] Publish topic {topic}");
            if self.debug_message {
                log::debug!("[{id}] Body: {}", String::from_utf8_lossy(message));
            }

            let body = match self.cipher.encrypt(message) {
                Ok(body) => body,
                Err(e) => {
                    log::warn!("[{attempt}] [{id}] Failed publish topic {topic}, message encryption error, {e}");
                    Stats::incr(&self.stats.publish_failures);
                    last = Some(BusError::from(e));
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let envelope = Envelope::new(topic, id.as_str(), body);
            let sent = tokio::select! {
                biased;
                _ = ctx.cancelled() => Err(BusError::Cancelled),
                res = self.transport.publish(&self.exchange, &envelope) => res,
            };

            match sent {
                Ok(()) => {
                    log::info!("[{attempt}] [{id}] Success publish topic {topic}");
                    Stats::incr(&self.stats.published);
                    return Ok(PublishReceipt { id, attempts: attempt });
                }
                Err(e) => {
                    log::warn!("[{attempt}] [{id}] Failed publish topic {topic}, {e}");
                    Stats::incr(&self.stats.publish_failures);
                    last = Some(e);
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        }

        log::error!("[{id}] Giving up publish topic {topic} after {retries} attempts");
        Stats::incr(&self.stats.publish_exhausted);
        Err(BusError::Exhausted {
            id,
            attempts: retries,
            last: Box::new(last.unwrap_or_else(|| BusError::msg("no attempt made"))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{AesCfb, CipherError};
    use crate::transport::MemoryTransport;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    const SECRET: &[u8] = b"0123456789abcdef01234567";

    struct FailingCipher {
        failures: AtomicUsize,
        inner: AesCfb,
    }

    impl Cipher for FailingCipher {
        fn encrypt(&self, plaintext: &[u8]) -> std::result::Result<Bytes, CipherError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(CipherError::KeyLength(0));
            }
            self.inner.encrypt(plaintext)
        }

        fn decrypt(&self, body: &[u8]) -> std::result::Result<Vec<u8>, CipherError> {
            self.inner.decrypt(body)
        }
    }

    fn publisher(transport: &MemoryTransport, cipher: Arc<dyn Cipher>) -> Publisher {
        Publisher::new(Arc::new(transport.clone()), cipher, "events".into(), false, Arc::new(Stats::default()))
    }

    fn aes() -> Arc<dyn Cipher> {
        Arc::new(AesCfb::new(SECRET).unwrap())
    }

    #[test]
    fn test_effective_policy() {
        assert_eq!(PublishPolicy::effective(None), (1, Duration::from_secs(1)));
        let p = PublishPolicy::new(0, Duration::ZERO);
        assert_eq!(PublishPolicy::effective(Some(&p)), (1, Duration::from_secs(1)));
        let p = PublishPolicy::new(3, Duration::from_millis(10));
        assert_eq!(PublishPolicy::effective(Some(&p)), (3, Duration::from_millis(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_policy_single_attempt() {
        let t = MemoryTransport::new();
        let p = publisher(&t, aes());
        let receipt = p.try_publish(&CancellationToken::new(), "orders.created", b"{}", None).await.unwrap();
        assert_eq!(receipt.attempts, 1);
        assert_eq!(t.publish_attempts(), 1);

        let sent = t.published();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "orders.created");
        assert_eq!(sent[0].id, receipt.id);
        assert_eq!(sent[0].content_type(), "text/plain");
        assert_eq!(AesCfb::new(SECRET).unwrap().decrypt(&sent[0].body).unwrap(), b"{}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_bound_when_transport_always_fails() {
        let t = MemoryTransport::new();
        t.fail_next_publishes(usize::MAX);
        let p = publisher(&t, aes());
        let delay = Duration::from_millis(200);

        let start = Instant::now();
        p.publish(&CancellationToken::new(), "orders", b"x", Some(PublishPolicy::new(4, delay))).await;
        assert_eq!(t.publish_attempts(), 4);
        assert!(start.elapsed() >= delay * 4);
        assert!(t.published().is_empty());
        assert_eq!(p.stats.snapshot().publish_exhausted, 1);
        assert_eq!(p.stats.snapshot().publish_failures, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_exit_on_success() {
        let t = MemoryTransport::new();
        t.fail_next_publishes(2);
        let p = publisher(&t, aes());

        let receipt = p
            .try_publish(&CancellationToken::new(), "orders", b"x", Some(PublishPolicy::new(5, Duration::from_millis(5))))
            .await
            .unwrap();
        assert_eq!(receipt.attempts, 3);
        assert_eq!(t.publish_attempts(), 3);
        assert_eq!(t.published().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_id_stable_across_retries() {
        let t = MemoryTransport::new();
        t.fail_next_publishes(2);
        let p = publisher(&t, aes());
        let policy = Some(PublishPolicy::new(3, Duration::from_millis(1)));

        let receipt = p.try_publish(&CancellationToken::new(), "orders", b"x", policy).await.unwrap();
        assert_eq!(t.attempted_ids(), vec![receipt.id.clone(); 3]);

        let other = p.try_publish(&CancellationToken::new(), "orders", b"x", policy).await.unwrap();
        assert_ne!(other.id, receipt.id);

        t.fail_next_publishes(1);
        let err = p.try_publish(&CancellationToken::new(), "orders", b"x", None).await.unwrap_err();
        let BusError::Exhausted { id, attempts, .. } = err else { panic!("expected an exhausted publish") };
        assert_eq!(attempts, 1);
        assert_eq!(t.attempted_ids().last(), Some(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_encryption_failure_consumes_attempt() {
        let t = MemoryTransport::new();
        let cipher = Arc::new(FailingCipher { failures: AtomicUsize::new(1), inner: AesCfb::new(SECRET).unwrap() });
        let p = publisher(&t, cipher);

        let receipt = p
            .try_publish(&CancellationToken::new(), "orders", b"x", Some(PublishPolicy::new(2, Duration::from_millis(1))))
            .await
            .unwrap();
        assert_eq!(receipt.attempts, 2);
        assert_eq!(t.publish_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_context() {
        let t = MemoryTransport::new();
        let p = publisher(&t, aes());
        let ctx = CancellationToken::new();
        ctx.cancel();

        let err = p
            .try_publish(&ctx, "orders", b"x", Some(PublishPolicy::new(2, Duration::from_millis(1))))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Exhausted { attempts: 2, ref last, .. } if matches!(**last, BusError::Cancelled)));
        assert!(t.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_publishes_are_serialized() {
        let t = MemoryTransport::new();
        t.fail_next_publishes(1);
        let p = Arc::new(publisher(&t, aes()));
        let delay = Duration::from_secs(1);

        let start = Instant::now();
        let p1 = p.clone();
        let first = tokio::spawn(async move {
            p1.try_publish(&CancellationToken::new(), "a", b"1", Some(PublishPolicy::new(2, delay))).await
        });
        tokio::task::yield_now().await;
        let second = p.try_publish(&CancellationToken::new(), "b", b"2", None).await.unwrap();
        let second_done = start.elapsed();
        let first = first.await.unwrap().unwrap();

        assert_eq!(first.attempts, 2);
        assert_eq!(second.attempts, 1);
        //the second call waited for the first one's retry sleep to release the lock
        assert!(second_done >= delay);
        assert_eq!(t.published().len(), 2);
    }
}
