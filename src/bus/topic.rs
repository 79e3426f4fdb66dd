//! Colon-separated topics, ordered general to specific.
//!
//! `HighCPU:monitoring:prometheus` is matched by subscriptions on itself,
//! on `HighCPU:monitoring` and on `HighCPU`.

use crate::event::{Event, ObjectKey};

pub const SEPARATOR: char = ':';

/// Topic an event is published under: `<name>:<source namespace>:<source name>`.
pub fn for_event(event: &Event) -> String {
    for_source(&event.name, &event.source)
}

/// Topic for events of `name` raised by one particular source.
pub fn for_source(name: &str, source: &ObjectKey) -> String {
    format!(
        "{name}{SEPARATOR}{}{SEPARATOR}{}",
        source.namespace, source.name
    )
}

/// The topic with its last segment stripped, or `None` for a single-segment topic.
pub fn parent(topic: &str) -> Option<&str> {
    topic.rfind(SEPARATOR).map(|idx| &topic[..idx])
}

/// The topic followed by each of its ancestors, most specific first.
pub fn lineage(topic: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(Some(topic), |current| parent(current))
}
