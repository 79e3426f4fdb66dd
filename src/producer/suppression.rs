//! Suppression windows for repeated alerts.
//!
//! Alerts are level-triggered: a firing alert shows up on every poll. A
//! window remembers, per dedup key, when the alert last activated and holds
//! back repeats until `activation + duration` has passed. Keys are only
//! recorded once an event was actually dispatched.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::trace;

#[derive(Debug, Clone)]
pub struct SuppressionWindow {
    duration: Duration,
    seen: HashMap<String, DateTime<Utc>>,
}

impl SuppressionWindow {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            seen: HashMap::new(),
        }
    }

    pub fn from_secs(seconds: u64) -> Self {
        let seconds = i64::try_from(seconds).unwrap_or(i64::MAX);
        Self::new(Duration::try_seconds(seconds).unwrap_or(Duration::MAX))
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Changes the window length; recorded activations are kept.
    pub fn set_duration(&mut self, duration: Duration) {
        self.duration = duration;
    }

    /// Drops every entry whose window closed before `now`.
    pub fn purge(&mut self, now: DateTime<Utc>) {
        let duration = self.duration;
        self.seen.retain(|key, activation| {
            let open = activation
                .checked_add_signed(duration)
                .map_or(true, |until| until >= now);
            if !open {
                trace!(key = %key, "Suppression window expired");
            }
            open
        });
    }

    /// Whether `key` is inside an open window. Call [`purge`](Self::purge) first.
    pub fn is_suppressed(&self, key: &str) -> bool {
        !key.is_empty() && self.seen.contains_key(key)
    }

    /// Opens (or re-opens) the window for `key` starting at `activation`.
    pub fn record(&mut self, key: impl Into<String>, activation: DateTime<Utc>) {
        let key = key.into();
        if key.is_empty() {
            return;
        }
        self.seen.insert(key, activation);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_repeat_inside_window_is_suppressed() {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let d = Duration::minutes(10);
        let mut window = SuppressionWindow::new(d);

        window.record("abc", t0);
        window.purge(t0 + d / 2);
        assert!(window.is_suppressed("abc"));
    }

    #[test]
    fn test_repeat_after_window_is_delivered() {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let d = Duration::minutes(10);
        let mut window = SuppressionWindow::new(d);

        window.record("abc", t0);
        window.purge(t0 + d * 2);
        assert!(!window.is_suppressed("abc"));
        assert!(window.is_empty());
    }

    #[test]
    fn test_unrecorded_and_empty_keys_pass() {
        let mut window = SuppressionWindow::from_secs(60);
        window.record("", Utc::now());
        assert!(window.is_empty());
        assert!(!window.is_suppressed(""));
        assert!(!window.is_suppressed("other"));
        assert_eq!(window.duration(), Duration::seconds(60));
    }
}
