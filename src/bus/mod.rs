//! # Event bus
//!
//! Topic-addressed publish/subscribe between producers and the action manager.
//!
//! ```text
//! Producer ──publish(topic, event)──► DeliveryQueue ──► worker 1..N ──try_send──► Consumer channels
//!                                           ▲                 │
//!                                           └── retry (full) ─┘
//! ```
//!
//! ## Rules
//! - **Non-blocking publish**: `publish()` only enqueues; delivery happens on a worker.
//! - **Hierarchical matching**: a message on `a:b:c` reaches subscribers of `a:b:c`, `a:b` and `a`.
//! - **Whole-message retry**: if *any* matched channel is full, the message goes back to the
//!   rate-limited queue and is retried for every matched channel. Delivery is at-least-once;
//!   subscribers that already accepted it may see it again. All recipients of a message share
//!   the latency of the slowest one.
//! - **Per-subscriber order**: while a message waits for a retry, every subscriber it matched
//!   is held. Later messages that match a held subscriber are parked and re-queued in publish
//!   order once the messages ahead of them are delivered or dropped. Messages to other
//!   subscribers keep flowing. Across workers, order holds only along these retry chains;
//!   a single-worker bus delivers everything in publish order.
//! - **One lock**: the subscriber table and the parked messages are guarded by a single
//!   mutex shared by subscribe, unsubscribe and delivery.

pub mod consumer;
pub mod queue;
pub mod topic;

pub use consumer::Consumer;

use crate::error::{Error, Result};
use crate::event::Event;
use queue::{DeliveryQueue, ItemBackoff, RateLimiter, TokenBucket};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

fn default_workers() -> usize {
    4
}

fn default_consumer_buffer() -> usize {
    10
}

fn default_base_delay_millis() -> u64 {
    5
}

fn default_max_delay_seconds() -> u64 {
    60
}

fn default_qps() -> f64 {
    10.0
}

fn default_burst() -> u32 {
    100
}

/// Bus tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusConfig {
    /// Number of delivery workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Capacity of each subscriber channel
    #[serde(default = "default_consumer_buffer", rename = "consumerBuffer")]
    pub consumer_buffer: usize,

    /// Retry delay after the first failed delivery
    #[serde(default = "default_base_delay_millis", rename = "baseDelayMillis")]
    pub base_delay_millis: u64,

    /// Upper bound for a single retry delay
    #[serde(default = "default_max_delay_seconds", rename = "maxDelaySeconds")]
    pub max_delay_seconds: u64,

    /// Sustained retry rate across all messages
    #[serde(default = "default_qps")]
    pub qps: f64,

    /// Retry burst ceiling across all messages
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Retries before a message is dropped; unlimited when absent
    #[serde(default, rename = "maxRetries", skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            consumer_buffer: default_consumer_buffer(),
            base_delay_millis: default_base_delay_millis(),
            max_delay_seconds: default_max_delay_seconds(),
            qps: default_qps(),
            burst: default_burst(),
            max_retries: None,
        }
    }
}

impl BusConfig {
    fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(
            ItemBackoff {
                base: Duration::from_millis(self.base_delay_millis),
                max: Duration::from_secs(self.max_delay_seconds),
            },
            TokenBucket::new(self.qps, self.burst),
        )
    }
}

#[derive(Debug, Clone)]
struct Message {
    /// Publish order
    seq: u64,
    topic: String,
    event: Event,
}

struct Subscriber {
    id: String,
    tx: mpsc::Sender<Event>,
    /// Messages this subscriber matched that are not yet delivered or dropped
    holds: BTreeSet<u64>,
}

impl Subscriber {
    fn held_before(&self, seq: u64) -> bool {
        self.holds.first().is_some_and(|first| *first < seq)
    }
}

#[derive(Default)]
struct SubscriberTable {
    topics: HashMap<String, Vec<Subscriber>>,
    /// Messages waiting for an earlier message to one of their subscribers
    parked: BTreeMap<u64, (Uuid, Message)>,
}

impl SubscriberTable {
    /// Subscribers of `topic` and of every ancestor topic.
    fn matched<'a>(&'a self, topic: &'a str) -> impl Iterator<Item = &'a Subscriber> + 'a {
        topic::lineage(topic)
            .filter_map(|t| self.topics.get(t))
            .flatten()
    }

    fn for_each_matched(&mut self, topic: &str, mut f: impl FnMut(&mut Subscriber)) {
        for t in topic::lineage(topic) {
            if let Some(subscribers) = self.topics.get_mut(t) {
                subscribers.iter_mut().for_each(&mut f);
            }
        }
    }

    fn blocked(&self, message: &Message) -> bool {
        self.matched(&message.topic)
            .any(|s| s.held_before(message.seq))
    }

    fn hold(&mut self, message: &Message) {
        self.for_each_matched(&message.topic, |s| {
            s.holds.insert(message.seq);
        });
    }

    fn release(&mut self, message: &Message) {
        self.for_each_matched(&message.topic, |s| {
            s.holds.remove(&message.seq);
        });
    }

    /// Removes and returns parked messages no longer behind an earlier one, in publish order.
    fn take_unblocked(&mut self) -> Vec<(Uuid, Message)> {
        let unblocked: Vec<u64> = self
            .parked
            .values()
            .filter(|(_, message)| !self.blocked(message))
            .map(|(_, message)| message.seq)
            .collect();
        unblocked
            .into_iter()
            .filter_map(|seq| self.parked.remove(&seq))
            .collect()
    }

    fn len(&self) -> usize {
        self.topics.values().map(Vec::len).sum()
    }
}

enum Delivery {
    Delivered {
        subscribers: usize,
        unblocked: Vec<(Uuid, Message)>,
    },
    Backpressure(Message),
    Parked,
}

/// State shared by every clone of a [`Bus`] and referenced weakly by consumers.
pub(crate) struct Shared {
    config: BusConfig,
    subscribers: Mutex<SubscriberTable>,
    queue: DeliveryQueue<Message>,
    sequence: AtomicU64,
    messages: AtomicU64,
}

impl Shared {
    fn lock_subscribers(&self) -> MutexGuard<'_, SubscriberTable> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes a channel from the table; dropping its sender closes it.
    /// Messages parked only behind this channel are re-queued.
    pub(crate) fn unsubscribe(&self, topic: &str, id: &str) {
        let unblocked = {
            let mut table = self.lock_subscribers();
            if let Some(subscribers) = table.topics.get_mut(topic) {
                subscribers.retain(|s| s.id != id);
                if subscribers.is_empty() {
                    table.topics.remove(topic);
                }
            }
            table.take_unblocked()
        };
        debug!(topic = %topic, subscriber = %id, "Unsubscribed");
        self.requeue(unblocked);
    }

    fn try_deliver(&self, id: Uuid, message: Message) -> Delivery {
        let mut table = self.lock_subscribers();
        if table.blocked(&message) {
            table.hold(&message);
            table.parked.insert(message.seq, (id, message));
            return Delivery::Parked;
        }

        let mut subscribers = 0;
        let mut backpressure = false;
        for subscriber in table.matched(&message.topic) {
            subscribers += 1;
            match subscriber.tx.try_send(message.event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => backpressure = true,
                // Receiver went away; its unsubscribe is in flight.
                Err(TrySendError::Closed(_)) => {}
            }
        }

        if backpressure {
            table.hold(&message);
            Delivery::Backpressure(message)
        } else {
            table.release(&message);
            Delivery::Delivered {
                subscribers,
                unblocked: table.take_unblocked(),
            }
        }
    }

    /// Gives up on a message and returns whatever was parked behind it.
    fn abandon(&self, message: &Message) -> Vec<(Uuid, Message)> {
        let mut table = self.lock_subscribers();
        table.release(message);
        table.take_unblocked()
    }

    fn requeue(&self, messages: Vec<(Uuid, Message)>) {
        for (id, message) in messages {
            if !self.queue.add(id, message) {
                debug!("Bus shutting down, parked message dropped");
            }
        }
    }
}

/// Cheap to clone; all clones share one subscriber table and one queue.
#[derive(Clone)]
pub struct Bus {
    shared: Arc<Shared>,
}

impl Bus {
    pub fn new(config: BusConfig) -> Self {
        let queue = DeliveryQueue::new(config.rate_limiter());
        Self {
            shared: Arc::new(Shared {
                config,
                subscribers: Mutex::new(SubscriberTable::default()),
                queue,
                sequence: AtomicU64::new(0),
                messages: AtomicU64::new(0),
            }),
        }
    }

    /// Runs the delivery workers until `cancel` fires.
    ///
    /// On cancellation the queue stops accepting messages, workers finish what is
    /// already queued (deferred retries and parked messages are dropped), every
    /// subscriber channel is closed and the table is cleared.
    pub async fn start(&self, cancel: CancellationToken) {
        let worker_count = self.shared.config.workers.max(1);
        let workers: Vec<_> = (0..worker_count)
            .map(|worker| {
                let bus = self.clone();
                tokio::spawn(async move { bus.work(worker).await })
            })
            .collect();
        info!(workers = worker_count, "Event bus started");

        cancel.cancelled().await;
        info!(pending = self.shared.queue.len(), "Event bus shutting down");

        self.shared.queue.shut_down();
        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = ?e, "Bus worker terminated abnormally");
            }
        }

        let closed = {
            let mut table = self.shared.lock_subscribers();
            let closed = table.len();
            table.topics.clear();
            table.parked.clear();
            closed
        };
        info!(closed, "Event bus stopped");
    }

    async fn work(&self, worker: usize) {
        while let Some((id, message)) = self.shared.queue.get().await {
            self.deliver(id, message);
            tokio::task::yield_now().await;
        }
        debug!(worker, "Bus worker stopped");
    }

    fn deliver(&self, id: Uuid, message: Message) {
        let queue = &self.shared.queue;
        match self.shared.try_deliver(id, message) {
            Delivery::Delivered {
                subscribers,
                unblocked,
            } => {
                trace!(subscribers, released = unblocked.len(), "Delivered");
                queue.forget(id);
                self.shared.requeue(unblocked);
            }
            Delivery::Parked => {
                trace!("Parked behind an earlier message");
            }
            Delivery::Backpressure(message) => {
                let retries = queue.num_requeues(id);
                if let Some(max) = self.shared.config.max_retries {
                    if retries >= max {
                        warn!(
                            topic = %message.topic,
                            event = %message.event.name,
                            retries,
                            "Dropping message after exhausting delivery retries"
                        );
                        queue.forget(id);
                        self.shared.requeue(self.shared.abandon(&message));
                        return;
                    }
                }
                debug!(topic = %message.topic, retries, "Subscriber buffer full, retrying message");
                if !queue.add_rate_limited(id, message) {
                    debug!("Bus shutting down, retry abandoned");
                    queue.forget(id);
                }
            }
        }
    }

    /// Enqueues `event` for delivery on `topic` and returns immediately.
    pub fn publish(&self, topic: impl Into<String>, event: Event) -> Result<()> {
        let topic = topic.into();
        trace!(topic = %topic, event = %event.name, "Publishing");
        let seq = self.shared.messages.fetch_add(1, Ordering::Relaxed);
        if self
            .shared
            .queue
            .add(Uuid::new_v4(), Message { seq, topic, event })
        {
            Ok(())
        } else {
            Err(Error::BusClosed)
        }
    }

    /// Registers a new bounded channel under `topic`.
    ///
    /// Subscribing to a bus that has shut down yields an already-closed consumer.
    pub fn subscribe(&self, topic: impl Into<String>) -> Consumer {
        let topic = topic.into();
        let id = self.subscriber_id(&topic);
        let (tx, rx) = mpsc::channel(self.shared.config.consumer_buffer.max(1));

        {
            let mut table = self.shared.lock_subscribers();
            if self.shared.queue.is_shutting_down() {
                drop(tx);
            } else {
                table.topics.entry(topic.clone()).or_default().push(Subscriber {
                    id: id.clone(),
                    tx,
                    holds: BTreeSet::new(),
                });
            }
        }
        debug!(topic = %topic, subscriber = %id, "Subscribed");

        Consumer::new(id, topic, rx, Arc::downgrade(&self.shared))
    }

    /// Identities of every subscriber a message on `topic` would reach.
    pub fn subscriber_match(&self, topic: &str) -> Vec<String> {
        let table = self.shared.lock_subscribers();
        table.matched(topic).map(|s| s.id.clone()).collect()
    }

    /// Total number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.shared.lock_subscribers().len()
    }

    /// Messages waiting for delivery, including deferred retries and parked messages.
    pub fn pending(&self) -> usize {
        self.shared.queue.len() + self.shared.lock_subscribers().parked.len()
    }

    /// SHA-1 of the topic and creation time; a sequence number separates
    /// subscriptions created within the same clock tick.
    fn subscriber_id(&self, topic: &str) -> String {
        let sequence = self.shared.sequence.fetch_add(1, Ordering::Relaxed);
        let created = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default();

        let mut hasher = Sha1::new();
        hasher.update(topic.as_bytes());
        hasher.update(created.to_be_bytes());
        hasher.update(sequence.to_be_bytes());
        hex::encode(hasher.finalize())
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("config", &self.shared.config)
            .field("subscribers", &self.subscriber_count())
            .field("pending", &self.pending())
            .finish()
    }
}
