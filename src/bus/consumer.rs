//! Subscription handles.

use super::Shared;
use crate::event::Event;
use std::future::poll_fn;
use std::sync::Weak;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

struct Subscription {
    id: String,
    topic: String,
    rx: mpsc::Receiver<Event>,
    bus: Weak<Shared>,
    active: bool,
}

impl Subscription {
    fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(&self.topic, &self.id);
        }
        self.rx.close();
    }
}

/// Receives events for one or more subscriptions.
///
/// A consumer built by [`Consumer::merge`] reads from the union of its
/// constituents' channels. Receiving `None` means every channel is closed:
/// the consumer was unsubscribed or the bus shut down.
///
/// Dropping a consumer unsubscribes it.
pub struct Consumer {
    subscriptions: Vec<Subscription>,
    next: usize,
}

impl Consumer {
    pub(super) fn new(id: String, topic: String, rx: mpsc::Receiver<Event>, bus: Weak<Shared>) -> Self {
        Self {
            subscriptions: vec![Subscription {
                id,
                topic,
                rx,
                bus,
                active: true,
            }],
            next: 0,
        }
    }

    /// Fan-in of several consumers. Unsubscribing the result unsubscribes all of them.
    pub fn merge(consumers: impl IntoIterator<Item = Consumer>) -> Consumer {
        let mut subscriptions = Vec::new();
        for mut consumer in consumers {
            subscriptions.append(&mut consumer.subscriptions);
        }
        Consumer {
            subscriptions,
            next: 0,
        }
    }

    /// Takes over the subscriptions of `other`.
    pub fn extend(&mut self, mut other: Consumer) {
        self.subscriptions.append(&mut other.subscriptions);
    }

    /// Unsubscribes every subscription whose topic `keep` rejects and returns
    /// the events those subscriptions had already buffered.
    pub fn retain_topics(&mut self, mut keep: impl FnMut(&str) -> bool) -> Vec<Event> {
        let mut buffered = Vec::new();
        for mut subscription in std::mem::take(&mut self.subscriptions) {
            if keep(&subscription.topic) {
                self.subscriptions.push(subscription);
                continue;
            }
            subscription.unsubscribe();
            while let Ok(event) = subscription.rx.try_recv() {
                buffered.push(event);
            }
        }
        self.next = 0;
        buffered
    }

    /// Identities of the underlying subscriptions.
    pub fn ids(&self) -> Vec<&str> {
        self.subscriptions.iter().map(|s| s.id.as_str()).collect()
    }

    /// Topics this consumer listens on.
    pub fn topics(&self) -> Vec<&str> {
        self.subscriptions.iter().map(|s| s.topic.as_str()).collect()
    }

    /// Waits for the next event from any subscription.
    pub async fn recv(&mut self) -> Option<Event> {
        poll_fn(|cx| self.poll_recv(cx)).await
    }

    /// Returns a buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        let len = self.subscriptions.len();
        for offset in 0..len {
            let idx = (self.next + offset) % len;
            if let Ok(event) = self.subscriptions[idx].rx.try_recv() {
                self.next = (idx + 1) % len;
                return Some(event);
            }
        }
        None
    }

    /// Whether every channel is closed and drained.
    pub fn is_closed(&self) -> bool {
        self.subscriptions
            .iter()
            .all(|s| s.rx.is_closed() && s.rx.is_empty())
    }

    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        let len = self.subscriptions.len();
        let mut closed = 0;

        // Rotate the starting point so one busy subscription cannot starve the rest.
        for offset in 0..len {
            let idx = (self.next + offset) % len;
            match self.subscriptions[idx].rx.poll_recv(cx) {
                Poll::Ready(Some(event)) => {
                    self.next = (idx + 1) % len;
                    return Poll::Ready(Some(event));
                }
                Poll::Ready(None) => closed += 1,
                Poll::Pending => {}
            }
        }

        if closed == len {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }

    /// Removes every subscription from its bus and closes the channels.
    /// Events already buffered can still be received; nothing new arrives.
    pub fn unsubscribe(&mut self) {
        for subscription in &mut self.subscriptions {
            subscription.unsubscribe();
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("topics", &self.topics())
            .finish_non_exhaustive()
    }
}
