//! In-process signal mailboxes

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream;
use meshlink_crypto::PublicKey;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{SignalChannel, SignalConfig, SignalStream};
use crate::error::NetworkResult;
use crate::protocol::SignalEnvelope;

/// A queued envelope with its deadline
struct Queued {
    envelope: SignalEnvelope,
    expires_at: Instant,
}

/// Per-recipient queue
struct Mailbox {
    queue: Mutex<VecDeque<Queued>>,
    notify: Notify,
    /// Bumped on every subscribe; older streams end when they see a newer value
    generation: AtomicU64,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            generation: AtomicU64::new(0),
        }
    }

    fn push(&self, queued: Queued, capacity: usize) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= capacity {
            if let Some(dropped) = queue.pop_front() {
                debug!(
                    "Mailbox for {:?} full, dropping oldest from {:?}",
                    dropped.envelope.to, dropped.envelope.from
                );
            }
        }
        queue.push_back(queued);
        drop(queue);
        self.notify.notify_waiters();
    }

    /// Pop the first envelope that has not expired
    fn pop_live(&self) -> Option<SignalEnvelope> {
        let now = Instant::now();
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(queued) = queue.pop_front() {
            if queued.expires_at > now {
                return Some(queued.envelope);
            }
            trace!(
                "Dropping expired signal {:?} -> {:?}",
                queued.envelope.from, queued.envelope.to
            );
        }
        None
    }

    fn purge(&self, now: Instant) -> usize {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let before = queue.len();
        queue.retain(|q| q.expires_at > now);
        before - queue.len()
    }

    fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

struct HubInner {
    mailboxes: DashMap<PublicKey, Arc<Mailbox>>,
    config: SignalConfig,
}

/// In-memory signal channel. Cloning shares the same mailboxes.
#[derive(Clone)]
pub struct SignalHub {
    inner: Arc<HubInner>,
}

impl SignalHub {
    /// Create a new hub
    pub fn new(config: SignalConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                mailboxes: DashMap::new(),
                config,
            }),
        }
    }

    fn mailbox(&self, peer: &PublicKey) -> Arc<Mailbox> {
        self.inner
            .mailboxes
            .entry(*peer)
            .or_insert_with(|| Arc::new(Mailbox::new()))
            .clone()
    }

    /// Queue an envelope for its recipient
    pub fn deliver(&self, envelope: SignalEnvelope) {
        let mailbox = self.mailbox(&envelope.to);
        trace!("Queued signal {:?} -> {:?}", envelope.from, envelope.to);
        mailbox.push(
            Queued {
                envelope,
                expires_at: Instant::now() + self.inner.config.ttl,
            },
            self.inner.config.mailbox_capacity,
        );
    }

    /// Drop expired envelopes and unused mailboxes
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.inner.mailboxes.retain(|_, mailbox| {
            removed += mailbox.purge(now);
            mailbox.len() > 0 || mailbox.generation.load(Ordering::SeqCst) > 0
        });
        if removed > 0 {
            debug!("Purged {} expired signal messages", removed);
        }
        removed
    }

    /// Number of envelopes waiting for `peer`
    pub fn pending(&self, peer: &PublicKey) -> usize {
        self.inner
            .mailboxes
            .get(peer)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Number of known mailboxes
    pub fn mailbox_count(&self) -> usize {
        self.inner.mailboxes.len()
    }
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new(SignalConfig::default())
    }
}

#[async_trait]
impl SignalChannel for SignalHub {
    async fn send(&self, from: PublicKey, to: PublicKey, payload: Vec<u8>) -> NetworkResult<()> {
        self.deliver(SignalEnvelope { from, to, payload });
        Ok(())
    }

    fn subscribe(&self, peer: PublicKey) -> SignalStream {
        let mailbox = self.mailbox(&peer);
        let generation = mailbox.generation.fetch_add(1, Ordering::SeqCst) + 1;
        // Wake a superseded stream so it can end
        mailbox.notify.notify_waiters();
        debug!("Signal subscriber for {:?} (generation {})", peer, generation);

        Box::pin(stream::unfold(mailbox, move |mailbox| async move {
            loop {
                let waiter = Arc::clone(&mailbox);
                let notified = waiter.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if mailbox.generation.load(Ordering::SeqCst) != generation {
                    return None;
                }
                if let Some(envelope) = mailbox.pop_live() {
                    return Some((envelope, mailbox));
                }
                notified.await;
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use meshlink_crypto::KeyPair;
    use std::time::Duration;

    fn key() -> PublicKey {
        KeyPair::generate().public
    }

    #[tokio::test]
    async fn test_delivers_queued_messages_in_sender_order() {
        let hub = SignalHub::default();
        let (a, b) = (key(), key());

        for i in 0..3u8 {
            hub.send(a, b, vec![i]).await.unwrap();
        }

        let mut stream = hub.subscribe(b);
        for i in 0..3u8 {
            let envelope = stream.next().await.unwrap();
            assert_eq!(envelope.from, a);
            assert_eq!(envelope.payload, vec![i]);
        }
    }

    #[tokio::test]
    async fn test_subscriber_wakes_on_send() {
        let hub = SignalHub::default();
        let (a, b) = (key(), key());
        let mut stream = hub.subscribe(b);

        let sender = hub.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            sender.send(a, b, b"offer".to_vec()).await.unwrap();
        });

        let envelope = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.payload, b"offer".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_messages_are_dropped() {
        let hub = SignalHub::default();
        let (a, b) = (key(), key());

        hub.send(a, b, b"stale".to_vec()).await.unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        hub.send(a, b, b"fresh".to_vec()).await.unwrap();

        let mut stream = hub.subscribe(b);
        let envelope = stream.next().await.unwrap();
        assert_eq!(envelope.payload, b"fresh".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let hub = SignalHub::default();
        let (a, b) = (key(), key());

        hub.send(a, b, vec![1]).await.unwrap();
        assert_eq!(hub.pending(&b), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(hub.purge_expired(), 1);
        assert_eq!(hub.pending(&b), 0);
        assert_eq!(hub.mailbox_count(), 0);
    }

    #[tokio::test]
    async fn test_resubscribe_supersedes_old_stream() {
        let hub = SignalHub::default();
        let (a, b) = (key(), key());

        let mut old = hub.subscribe(b);
        let mut new = hub.subscribe(b);

        assert!(old.next().await.is_none());

        hub.send(a, b, vec![7]).await.unwrap();
        assert_eq!(new.next().await.unwrap().payload, vec![7]);
    }

    #[tokio::test]
    async fn test_mailbox_capacity_drops_oldest() {
        let config = SignalConfig {
            mailbox_capacity: 2,
            ..Default::default()
        };
        let hub = SignalHub::new(config);
        let (a, b) = (key(), key());

        for i in 0..3u8 {
            hub.send(a, b, vec![i]).await.unwrap();
        }

        let mut stream = hub.subscribe(b);
        assert_eq!(stream.next().await.unwrap().payload, vec![1]);
        assert_eq!(stream.next().await.unwrap().payload, vec![2]);
    }
}
