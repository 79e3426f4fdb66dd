//! # Action manager
//!
//! Receives events from the bus and starts an [`ActionRunner`] for every
//! deployed policy that accepts them.
//!
//! - **Single flight**: a policy whose previous run has not finished is skipped
//!   and a `Skipped` notice is recorded. A waiter task clears the running flag
//!   when the runner's done signal fires, so the delivery path never blocks.
//! - **Suppression**: a policy with a suppression window opens it for an
//!   event's dedup key only after that event was dispatched.
//! - **Listeners**: one bus consumer per event name, merged over the topics the
//!   deployed policies need. When policies change, the listener subscribes the new
//!   topics before dropping the old ones and handles whatever the dropped
//!   subscriptions had buffered. Topic matching is by prefix, so a listener also
//!   sees events whose name merely starts with its own plus `:`; those are skipped.
//!
//! Lock order: `listeners` before the state lock. Neither is held across an await.

pub mod state;

use crate::action::{registry, ActionContext, ActionRunner};
use crate::bus::{topic, Bus, Consumer};
use crate::cluster::ClusterClient;
use crate::crds::CounterMeasure;
use crate::error::{Error, Result};
use crate::event::{Event, ObjectKey};
use crate::metrics::ActionMetrics;
use crate::recorder::{NoticeRecorder, NoticeType, REASON_SKIPPED};
use chrono::Utc;
use kube::api::ObjectMeta;
use state::{Claim, Entry, State};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace};

pub const SKIPPED_MESSAGE: &str = "previous execution still in progress";

struct Listener {
    topics: Vec<String>,
    retopic: watch::Sender<Vec<String>>,
    cancel: CancellationToken,
}

struct Inner {
    bus: Bus,
    cluster: Arc<dyn ClusterClient>,
    recorder: Arc<dyn NoticeRecorder>,
    metrics: ActionMetrics,
    state: State,
    listeners: Mutex<HashMap<String, Listener>>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct ActionManager {
    inner: Arc<Inner>,
}

impl ActionManager {
    /// Listeners stop when `cancel` fires.
    pub fn new(
        bus: Bus,
        cluster: Arc<dyn ClusterClient>,
        recorder: Arc<dyn NoticeRecorder>,
        metrics: ActionMetrics,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus,
                cluster,
                recorder,
                metrics,
                state: State::new(),
                listeners: Mutex::new(HashMap::new()),
                cancel,
            }),
        }
    }

    fn listeners(&self) -> MutexGuard<'_, HashMap<String, Listener>> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Deploys or replaces a policy. Fails without side effects if any action is invalid.
    #[instrument(skip(self, policy), fields(policy = ?policy.metadata.name))]
    pub fn add(&self, policy: &CounterMeasure) -> Result<()> {
        let key = ObjectKey::from_meta(&policy.metadata)?;
        if policy.alert_name().is_empty() {
            return Err(Error::ConfigError("alert name must not be empty".to_string()));
        }
        let runner = ActionRunner::new(registry::build(&policy.spec)?);

        let entry = Entry::new(policy.clone(), key.clone(), runner);
        let name = entry.name.clone();
        let previous = self.inner.state.insert(entry);

        self.refresh_listener(&name);
        if let Some(previous) = previous.filter(|previous| *previous != name) {
            self.refresh_listener(&previous);
        }

        info!(policy = %key, alert = %name, "Policy deployed");
        Ok(())
    }

    /// Withdraws a policy. A run already in progress finishes.
    #[instrument(skip(self))]
    pub fn remove(&self, key: &ObjectKey) -> bool {
        match self.inner.state.remove(key) {
            Some(name) => {
                self.refresh_listener(&name);
                info!(policy = %key, "Policy withdrawn");
                true
            }
            None => false,
        }
    }

    /// Whether this exact generation of the policy is deployed.
    pub fn exists(&self, meta: &ObjectMeta) -> bool {
        ObjectKey::from_meta(meta)
            .is_ok_and(|key| self.inner.state.exists(&key, meta.generation))
    }

    pub fn is_running(&self, key: &ObjectKey) -> bool {
        self.inner.state.is_running(key)
    }

    /// Event names with an active listener.
    pub fn listening(&self) -> Vec<String> {
        let mut names: Vec<String> = self.listeners().keys().cloned().collect();
        names.sort();
        names
    }

    /// Starts runners for every accepting, idle, unsuppressed policy.
    /// Returns the keys of the policies dispatched.
    pub fn on_event(&self, event: &Event) -> Vec<ObjectKey> {
        let claims = self.inner.state.claim(event, Utc::now());
        let mut dispatched = Vec::new();

        for claim in claims {
            match claim {
                Claim::Dispatch(dispatch) => {
                    let context = ActionContext {
                        cluster: self.inner.cluster.clone(),
                        recorder: self.inner.recorder.clone(),
                        metrics: self.inner.metrics.clone(),
                        policy: dispatch.policy,
                    };
                    let done = dispatch.runner.on_detection(context, event.clone());
                    if dispatch.suppressed_on_confirm {
                        self.inner
                            .state
                            .confirm(&dispatch.key, &event.key(), event.active_time);
                    }

                    let manager = self.clone();
                    let key = dispatch.key.clone();
                    let run = dispatch.run;
                    tokio::spawn(async move {
                        // Resolves when the runner drops its sender.
                        let _ = done.await;
                        manager.inner.state.finish(&key, run);
                        debug!(policy = %key, run, "Run finished");
                    });

                    debug!(policy = %dispatch.key, event = %event.name, run, "Dispatched");
                    dispatched.push(dispatch.key);
                }
                Claim::Busy(policy) => {
                    debug!(policy = ?policy.metadata.name, event = %event.name, "Previous run in progress, skipping");
                    let recorder = self.inner.recorder.clone();
                    tokio::spawn(async move {
                        recorder
                            .notice(
                                &kube::Resource::object_ref(policy.as_ref(), &()),
                                NoticeType::Normal,
                                REASON_SKIPPED,
                                SKIPPED_MESSAGE.to_string(),
                            )
                            .await;
                    });
                }
                Claim::Suppressed(key) => {
                    trace!(policy = %key, event = %event.name, "Suppressed");
                }
            }
        }
        dispatched
    }

    /// Makes the listener for `name` match the topics its policies need.
    fn refresh_listener(&self, name: &str) {
        let mut listeners = self.listeners();
        let topics = self.inner.state.topics_for(name);

        if topics.is_empty() {
            if let Some(old) = listeners.remove(name) {
                old.cancel.cancel();
                debug!(alert = %name, "Stopped listener");
            }
            return;
        }
        if let Some(listener) = listeners.get_mut(name) {
            if listener.topics == topics {
                return;
            }
            if listener.retopic.send(topics.clone()).is_ok() {
                debug!(alert = %name, topics = ?topics, "Listener topics changed");
                listener.topics = topics;
                return;
            }
            // The task is gone (bus closed); start over.
            listener.cancel.cancel();
        }

        let consumer = Consumer::merge(
            topics
                .iter()
                .map(|topic| self.inner.bus.subscribe(topic.clone())),
        );
        let (retopic, wanted) = watch::channel(topics.clone());
        let cancel = self.inner.cancel.child_token();
        tokio::spawn(
            self.clone()
                .listen(name.to_string(), consumer, wanted, cancel.clone()),
        );
        debug!(alert = %name, topics = ?topics, "Started listener");

        listeners.insert(
            name.to_string(),
            Listener {
                topics,
                retopic,
                cancel,
            },
        );
    }

    async fn listen(
        self,
        name: String,
        mut consumer: Consumer,
        mut wanted: watch::Receiver<Vec<String>>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                changed = wanted.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let topics = wanted.borrow_and_update().clone();
                    self.retopic(&name, &mut consumer, &topics);
                }
                received = consumer.recv() => match received {
                    Some(event) => self.handle(&name, &event),
                    None => {
                        debug!(alert = %name, "Bus closed, listener exiting");
                        break;
                    }
                },
            }
        }
        consumer.unsubscribe();
    }

    /// Subscribes the new topics, then drops the stale ones and handles what they
    /// had buffered. Buffered events that a surviving subscription also received
    /// are left to that subscription.
    fn retopic(&self, name: &str, consumer: &mut Consumer, topics: &[String]) {
        let previous: Vec<String> = consumer.topics().into_iter().map(str::to_string).collect();
        for added in topics.iter().filter(|t| !previous.contains(t)) {
            consumer.extend(self.inner.bus.subscribe(added.clone()));
        }

        let kept: Vec<&String> = previous.iter().filter(|t| topics.contains(t)).collect();
        let buffered = consumer.retain_topics(|t| topics.iter().any(|wanted| wanted == t));
        for event in &buffered {
            let covered = topic::lineage(&topic::for_event(event))
                .any(|ancestor| kept.iter().any(|k| k.as_str() == ancestor));
            if !covered {
                self.handle(name, event);
            }
        }
        debug!(alert = %name, topics = ?topics, carried = buffered.len(), "Listener resubscribed");
    }

    fn handle(&self, name: &str, event: &Event) {
        if event.name != name {
            trace!(alert = %name, event = %event.name, "Event for a longer alert name, skipping");
            return;
        }
        self.on_event(event);
    }
}

impl std::fmt::Debug for ActionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionManager")
            .field("policies", &self.inner.state.len())
            .field("listening", &self.listening())
            .finish_non_exhaustive()
    }
}
