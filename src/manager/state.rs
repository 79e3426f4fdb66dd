//! Deployed policies, indexed by the event name they react to.
//!
//! One mutex guards the index, the entries, their running flags and their
//! suppression windows, so a lookup and the flag flip that follows it are a
//! single critical section.

use crate::action::ActionRunner;
use crate::bus::topic;
use crate::crds::CounterMeasure;
use crate::event::{Event, ObjectKey};
use crate::producer::SuppressionWindow;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One deployed policy.
#[derive(Debug)]
pub struct Entry {
    /// Event name the policy reacts to
    pub name: String,
    /// Allowed sources; empty accepts any
    pub sources: HashSet<ObjectKey>,
    pub key: ObjectKey,
    pub generation: Option<i64>,
    pub policy: Arc<CounterMeasure>,
    pub runner: ActionRunner,
    /// Identifier of the run in progress
    running: Option<u64>,
    suppression: Option<SuppressionWindow>,
}

impl Entry {
    pub fn new(policy: CounterMeasure, key: ObjectKey, runner: ActionRunner) -> Self {
        let suppression = policy.suppression_seconds().map(SuppressionWindow::from_secs);
        Self {
            name: policy.alert_name().to_string(),
            sources: policy.source_keys(),
            key,
            generation: policy.metadata.generation,
            policy: Arc::new(policy),
            runner,
            running: None,
            suppression,
        }
    }

    pub fn accept(&self, event: &Event) -> bool {
        self.name == event.name && (self.sources.is_empty() || self.sources.contains(&event.source))
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

/// Work handed out by [`State::claim`].
#[derive(Debug)]
pub struct Dispatch {
    pub key: ObjectKey,
    pub run: u64,
    pub policy: Arc<CounterMeasure>,
    pub runner: ActionRunner,
    /// Whether the policy has a suppression window to record into
    pub suppressed_on_confirm: bool,
}

#[derive(Debug)]
pub enum Claim {
    Dispatch(Dispatch),
    /// A previous run is still in progress
    Busy(Arc<CounterMeasure>),
    /// Inside the policy's suppression window
    Suppressed(ObjectKey),
}

#[derive(Default)]
struct Tables {
    index: HashMap<String, BTreeSet<ObjectKey>>,
    entries: HashMap<ObjectKey, Entry>,
    next_run: u64,
}

impl Tables {
    fn unindex(&mut self, name: &str, key: &ObjectKey) {
        if let Some(keys) = self.index.get_mut(name) {
            keys.remove(key);
            if keys.is_empty() {
                self.index.remove(name);
            }
        }
    }
}

#[derive(Default)]
pub struct State {
    tables: Mutex<Tables>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds or replaces the entry for its key. A run in progress and recorded
    /// suppression activations carry over to the replacement.
    /// Returns the event name of the replaced entry.
    pub fn insert(&self, mut entry: Entry) -> Option<String> {
        let mut tables = self.lock();
        let previous = tables.entries.remove(&entry.key);

        let mut previous_name = None;
        if let Some(old) = previous {
            entry.running = old.running;
            let duration = entry.suppression.as_ref().map(SuppressionWindow::duration);
            if let (Some(duration), Some(mut window)) = (duration, old.suppression) {
                window.set_duration(duration);
                entry.suppression = Some(window);
            }
            previous_name = Some(old.name);
        }
        if let Some(name) = &previous_name {
            tables.unindex(name, &entry.key);
        }

        tables
            .index
            .entry(entry.name.clone())
            .or_default()
            .insert(entry.key.clone());
        tables.entries.insert(entry.key.clone(), entry);
        previous_name
    }

    /// Removes the entry. Returns its event name.
    pub fn remove(&self, key: &ObjectKey) -> Option<String> {
        let mut tables = self.lock();
        let entry = tables.entries.remove(key)?;
        tables.unindex(&entry.name, key);
        Some(entry.name)
    }

    pub fn exists(&self, key: &ObjectKey, generation: Option<i64>) -> bool {
        self.lock()
            .entries
            .get(key)
            .is_some_and(|entry| entry.generation == generation)
    }

    pub fn is_running(&self, key: &ObjectKey) -> bool {
        self.lock().entries.get(key).is_some_and(Entry::is_running)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bus topics that cover every policy indexed under `name`: the bare name
    /// when any policy accepts all sources, otherwise one topic per source.
    pub fn topics_for(&self, name: &str) -> Vec<String> {
        let tables = self.lock();
        let Some(keys) = tables.index.get(name) else {
            return Vec::new();
        };
        let entries: Vec<&Entry> = keys.iter().filter_map(|k| tables.entries.get(k)).collect();

        if entries.iter().any(|entry| entry.sources.is_empty()) {
            return vec![name.to_string()];
        }

        entries
            .iter()
            .flat_map(|entry| entry.sources.iter())
            .map(|source| topic::for_source(name, source))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Decides, for every policy accepting `event`, whether it runs now.
    /// Dispatched entries are marked running before the lock is released.
    pub fn claim(&self, event: &Event, now: DateTime<Utc>) -> Vec<Claim> {
        let mut tables = self.lock();
        let Some(keys) = tables.index.get(&event.name).cloned() else {
            return Vec::new();
        };
        let dedup = event.key();
        let mut claims = Vec::new();

        for key in keys {
            tables.next_run += 1;
            let run = tables.next_run;
            let Some(entry) = tables.entries.get_mut(&key) else {
                continue;
            };
            if !entry.accept(event) {
                continue;
            }

            if let Some(window) = entry.suppression.as_mut() {
                window.purge(now);
                if window.is_suppressed(&dedup) {
                    claims.push(Claim::Suppressed(key));
                    continue;
                }
            }

            if entry.running.is_some() {
                claims.push(Claim::Busy(entry.policy.clone()));
                continue;
            }

            entry.running = Some(run);
            claims.push(Claim::Dispatch(Dispatch {
                key,
                run,
                policy: entry.policy.clone(),
                runner: entry.runner.clone(),
                suppressed_on_confirm: entry.suppression.is_some(),
            }));
        }
        claims
    }

    /// Opens the suppression window for a dispatched event.
    pub fn confirm(&self, key: &ObjectKey, dedup: &str, activation: DateTime<Utc>) {
        if let Some(window) = self
            .lock()
            .entries
            .get_mut(key)
            .and_then(|entry| entry.suppression.as_mut())
        {
            window.record(dedup, activation);
        }
    }

    /// Clears the running flag if `run` is still the current run.
    pub fn finish(&self, key: &ObjectKey, run: u64) -> bool {
        match self.lock().entries.get_mut(key) {
            Some(entry) if entry.running == Some(run) => {
                entry.running = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{
        ActionSpec, AlertSelector, CounterMeasureSpec, DeleteSpec, PrometheusTrigger,
        SourceReference, SuppressionPolicy,
    };
    use chrono::Duration;

    fn policy(name: &str, alert: &str, sources: &[&str], suppression: Option<u64>) -> CounterMeasure {
        let mut policy = CounterMeasure::new(
            name,
            CounterMeasureSpec {
                prometheus: PrometheusTrigger {
                    alert: AlertSelector {
                        name: alert.to_string(),
                        sources: sources
                            .iter()
                            .map(|s| SourceReference {
                                namespace: Some("monitoring".to_string()),
                                name: (*s).to_string(),
                            })
                            .collect(),
                    },
                    suppression_policy: suppression.map(|duration_seconds| SuppressionPolicy {
                        duration_seconds,
                    }),
                },
                dry_run: false,
                actions: vec![ActionSpec {
                    name: "kill".to_string(),
                    delete: Some(DeleteSpec {
                        api_version: "v1".to_string(),
                        kind: "Pod".to_string(),
                        namespace: "default".to_string(),
                        name: "{{ data.pod }}".to_string(),
                    }),
                    ..ActionSpec::default()
                }],
            },
        );
        policy.metadata.namespace = Some("default".to_string());
        policy.metadata.generation = Some(1);
        policy
    }

    fn entry(policy: CounterMeasure) -> Entry {
        let key = ObjectKey::from_meta(&policy.metadata).unwrap();
        let runner = ActionRunner::from_spec(&policy.spec).unwrap();
        Entry::new(policy, key, runner)
    }

    fn event(name: &str, source: &str, pod: &str) -> Event {
        let data = [("pod".to_string(), pod.to_string())].into_iter().collect();
        Event::new(name, Utc::now(), ObjectKey::new("monitoring", source)).with_data(data)
    }

    fn dispatches(claims: &[Claim]) -> usize {
        claims.iter().filter(|c| matches!(c, Claim::Dispatch(_))).count()
    }

    #[test]
    fn test_accept_filters_name_and_source() {
        let any = entry(policy("any", "HighCPU", &[], None));
        let filtered = entry(policy("one", "HighCPU", &["prom-a"], None));

        assert!(any.accept(&event("HighCPU", "prom-b", "p")));
        assert!(!any.accept(&event("HighMemory", "prom-b", "p")));
        assert!(filtered.accept(&event("HighCPU", "prom-a", "p")));
        assert!(!filtered.accept(&event("HighCPU", "prom-b", "p")));
    }

    #[test]
    fn test_index_tracks_insert_replace_remove() {
        let state = State::new();
        assert_eq!(state.insert(entry(policy("p", "HighCPU", &[], None))), None);
        assert!(state.exists(&ObjectKey::new("default", "p"), Some(1)));
        assert!(!state.exists(&ObjectKey::new("default", "p"), Some(2)));

        let mut renamed = policy("p", "HighMemory", &[], None);
        renamed.metadata.generation = Some(2);
        assert_eq!(state.insert(entry(renamed)), Some("HighCPU".to_string()));
        assert_eq!(state.len(), 1);
        assert!(state.topics_for("HighCPU").is_empty());
        assert_eq!(state.topics_for("HighMemory"), vec!["HighMemory"]);

        assert_eq!(
            state.remove(&ObjectKey::new("default", "p")),
            Some("HighMemory".to_string())
        );
        assert!(state.is_empty());
        assert!(state.topics_for("HighMemory").is_empty());
    }

    #[test]
    fn test_topics_for_sources() {
        let state = State::new();
        state.insert(entry(policy("a", "HighCPU", &["prom-b", "prom-a"], None)));
        state.insert(entry(policy("b", "HighCPU", &["prom-a"], None)));
        assert_eq!(
            state.topics_for("HighCPU"),
            vec!["HighCPU:monitoring:prom-a", "HighCPU:monitoring:prom-b"]
        );

        state.insert(entry(policy("c", "HighCPU", &[], None)));
        assert_eq!(state.topics_for("HighCPU"), vec!["HighCPU"]);
    }

    #[test]
    fn test_running_policy_is_not_dispatched_twice() {
        let state = State::new();
        state.insert(entry(policy("p", "HighCPU", &[], None)));
        let key = ObjectKey::new("default", "p");

        let claims = state.claim(&event("HighCPU", "prom", "app-1"), Utc::now());
        let Some(Claim::Dispatch(dispatch)) = claims.into_iter().next() else {
            panic!("expected dispatch");
        };
        assert!(state.is_running(&key));

        let again = state.claim(&event("HighCPU", "prom", "app-2"), Utc::now());
        assert!(matches!(again.as_slice(), [Claim::Busy(_)]));

        assert!(!state.finish(&key, dispatch.run + 1000));
        assert!(state.finish(&key, dispatch.run));
        assert!(!state.is_running(&key));
        assert_eq!(dispatches(&state.claim(&event("HighCPU", "prom", "app-3"), Utc::now())), 1);
    }

    #[test]
    fn test_running_flag_survives_replacement() {
        let state = State::new();
        state.insert(entry(policy("p", "HighCPU", &[], None)));
        let key = ObjectKey::new("default", "p");
        let claims = state.claim(&event("HighCPU", "prom", "app-1"), Utc::now());
        let Some(Claim::Dispatch(dispatch)) = claims.into_iter().next() else {
            panic!("expected dispatch");
        };

        let mut updated = policy("p", "HighCPU", &[], None);
        updated.metadata.generation = Some(2);
        state.insert(entry(updated));
        assert!(state.is_running(&key));
        assert!(state.finish(&key, dispatch.run));
    }

    #[test]
    fn test_suppression_window_after_confirm() {
        let state = State::new();
        state.insert(entry(policy("p", "HighCPU", &[], Some(600))));
        let key = ObjectKey::new("default", "p");
        let first = event("HighCPU", "prom", "app-1");
        let t0 = first.active_time;

        let claims = state.claim(&first, t0);
        let Some(Claim::Dispatch(dispatch)) = claims.into_iter().next() else {
            panic!("expected dispatch");
        };
        assert!(dispatch.suppressed_on_confirm);
        state.confirm(&key, &first.key(), t0);
        state.finish(&key, dispatch.run);

        // Same labels inside the window
        let repeat = state.claim(&first, t0 + Duration::seconds(300));
        assert!(matches!(repeat.as_slice(), [Claim::Suppressed(_)]));

        // Different labels are not suppressed
        assert_eq!(dispatches(&state.claim(&event("HighCPU", "prom", "app-2"), t0)), 1);
    }

    #[test]
    fn test_suppression_window_expires() {
        let state = State::new();
        state.insert(entry(policy("p", "HighCPU", &[], Some(600))));
        let key = ObjectKey::new("default", "p");
        let first = event("HighCPU", "prom", "app-1");
        let t0 = first.active_time;

        let Some(Claim::Dispatch(dispatch)) = state.claim(&first, t0).into_iter().next() else {
            panic!("expected dispatch");
        };
        state.confirm(&key, &first.key(), t0);
        state.finish(&key, dispatch.run);

        assert_eq!(dispatches(&state.claim(&first, t0 + Duration::seconds(1200))), 1);
    }
}
