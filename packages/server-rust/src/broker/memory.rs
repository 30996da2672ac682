//! In-process broker.
//!
//! Subjects match exactly (no wildcards). Queue groups deliver each message
//! to one member, rotating between members. A subscription disappears as
//! soon as its stream is dropped.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::stream;
use tokio::sync::mpsc;

use super::{BrokerConnection, BrokerError, BrokerMessage, BrokerStream};

struct Subscription {
    group: Option<String>,
    tx: mpsc::UnboundedSender<BrokerMessage>,
}

#[derive(Default)]
pub struct InMemoryBroker {
    subjects: DashMap<String, Vec<Subscription>>,
    queues: DashMap<String, ()>,
    rotation: AtomicUsize,
    disconnected: AtomicBool,
}

impl InMemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open subscriptions across every subject.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subjects
            .iter()
            .map(|entry| entry.value().iter().filter(|s| !s.tx.is_closed()).count())
            .sum()
    }

    /// Whether `ensure_queue` has been called for `queue`.
    #[must_use]
    pub fn has_queue(&self, queue: &str) -> bool {
        self.queues.contains_key(queue)
    }

    /// Simulates losing the broker: every later call fails.
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
        self.subjects.clear();
    }

    fn check(&self) -> Result<(), BrokerError> {
        if self.disconnected.load(Ordering::SeqCst) {
            Err(BrokerError::Connect("in-memory broker disconnected".to_string()))
        } else {
            Ok(())
        }
    }

    fn add(&self, subject: &str, group: Option<&str>) -> BrokerStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subjects
            .entry(subject.to_string())
            .or_default()
            .push(Subscription {
                group: group.map(str::to_string),
                tx,
            });
        Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|message| (message, rx))
        }))
    }
}

#[async_trait]
impl BrokerConnection for InMemoryBroker {
    async fn ensure_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.check()?;
        self.queues.insert(queue.to_string(), ());
        Ok(())
    }

    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        reply_to: Option<&str>,
        correlation_id: Option<&str>,
    ) -> Result<(), BrokerError> {
        self.check()?;
        let message = BrokerMessage {
            subject: subject.to_string(),
            payload,
            reply_to: reply_to.map(str::to_string),
            correlation_id: correlation_id.map(str::to_string),
        };

        let Some(mut subs) = self.subjects.get_mut(subject) else {
            return Ok(());
        };
        subs.retain(|s| !s.tx.is_closed());

        let mut groups: Vec<&str> = Vec::new();
        for sub in subs.iter() {
            match &sub.group {
                None => {
                    let _ = sub.tx.send(message.clone());
                }
                Some(group) if !groups.contains(&group.as_str()) => groups.push(group),
                Some(_) => {}
            }
        }
        for group in groups {
            let members: Vec<&Subscription> = subs
                .iter()
                .filter(|s| s.group.as_deref() == Some(group))
                .collect();
            let pick = self.rotation.fetch_add(1, Ordering::Relaxed) % members.len();
            let _ = members[pick].tx.send(message.clone());
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<BrokerStream, BrokerError> {
        self.check()?;
        Ok(self.add(subject, None))
    }

    async fn queue_subscribe(&self, subject: &str, group: &str) -> Result<BrokerStream, BrokerError> {
        self.check()?;
        Ok(self.add(subject, Some(group)))
    }

    fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }
}
