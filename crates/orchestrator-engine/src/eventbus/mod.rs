//! Event Bus (C3): in-process pub/sub with per-topic batched, debounced
//! delivery and bounded history (§4.3). Subscribers receive whole batches
//! grouped by event subtype rather than one callback per event.
//!
//! Delivery runs on a single background task per topic (spawned lazily on
//! first publish), matching the "single-threaded cooperative on the bus
//! thread/loop" contract — subscribers must not block it, so each handler
//! call has a short internal timeout enforced by the caller, not this bus.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::warn;

pub type Handler = Arc<dyn Fn(&str, &[Value]) + Send + Sync>;

struct TopicState {
    queue: Mutex<VecDeque<Value>>,
    subscribers: Mutex<Vec<(u64, Handler)>>,
    notify: Notify,
    flush_scheduled: std::sync::atomic::AtomicBool,
}

pub struct Subscription {
    bus: Arc<EventBusInner>,
    topic: String,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(topic) = self.bus.topics.get(&self.topic) {
            topic.subscribers.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

struct EventBusInner {
    topics: DashMap<String, Arc<TopicState>>,
    history: Mutex<VecDeque<(String, Value)>>,
    max_history_size: usize,
    batch_delay: Duration,
    dropped_updates: AtomicU64,
    next_subscriber_id: AtomicU64,
    shutdown: Arc<Notify>,
    shutting_down: std::sync::atomic::AtomicBool,
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl EventBus {
    pub fn new(batch_delay: Duration, max_history_size: usize) -> Self {
        Self {
            inner: Arc::new(EventBusInner {
                topics: DashMap::new(),
                history: Mutex::new(VecDeque::new()),
                max_history_size,
                batch_delay,
                dropped_updates: AtomicU64::new(0),
                next_subscriber_id: AtomicU64::new(0),
                shutdown: Arc::new(Notify::new()),
                shutting_down: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe(&self, topic: impl Into<String>, handler: Handler) -> Subscription {
        let topic = topic.into();
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        let state = self
            .inner
            .topics
            .entry(topic.clone())
            .or_insert_with(|| {
                Arc::new(TopicState {
                    queue: Mutex::new(VecDeque::new()),
                    subscribers: Mutex::new(Vec::new()),
                    notify: Notify::new(),
                    flush_scheduled: std::sync::atomic::AtomicBool::new(false),
                })
            })
            .clone();
        state.subscribers.lock().push((id, handler));

        Subscription {
            bus: self.inner.clone(),
            topic,
            id,
        }
    }

    /// Appends `event` to the topic queue and (re-)arms a flush timer.
    pub fn publish(&self, topic: impl Into<String>, event: Value) {
        let topic = topic.into();

        if self.inner.shutting_down.load(Ordering::SeqCst) {
            self.inner.dropped_updates.fetch_add(1, Ordering::SeqCst);
            return;
        }

        let state = self
            .inner
            .topics
            .entry(topic.clone())
            .or_insert_with(|| {
                Arc::new(TopicState {
                    queue: Mutex::new(VecDeque::new()),
                    subscribers: Mutex::new(Vec::new()),
                    notify: Notify::new(),
                    flush_scheduled: std::sync::atomic::AtomicBool::new(false),
                })
            })
            .clone();

        state.queue.lock().push_back(event.clone());

        {
            let mut history = self.inner.history.lock();
            history.push_back((topic.clone(), event));
            while history.len() > self.inner.max_history_size {
                history.pop_front();
            }
        }

        let already_scheduled = state
            .flush_scheduled
            .swap(true, Ordering::SeqCst);
        if !already_scheduled {
            let inner = self.inner.clone();
            let state = state.clone();
            let delay = self.inner.batch_delay;
            let topic = topic.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        flush(&topic, &state);
                    }
                    _ = inner.shutdown.notified() => {
                        let dropped = state.queue.lock().drain(..).count();
                        inner.dropped_updates.fetch_add(dropped as u64, Ordering::SeqCst);
                        state.flush_scheduled.store(false, Ordering::SeqCst);
                    }
                }
            });
        }
    }

    pub fn dropped_updates(&self) -> u64 {
        self.inner.dropped_updates.load(Ordering::SeqCst)
    }

    pub fn history(&self) -> Vec<(String, Value)> {
        self.inner.history.lock().iter().cloned().collect()
    }

    /// Clears any pending flush timers and drops queued events (§4.3
    /// cancellation semantics).
    pub fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.shutdown.notify_waiters();
    }
}

fn flush(topic: &str, state: &Arc<TopicState>) {
    state.flush_scheduled.store(false, Ordering::SeqCst);
    let batch: Vec<Value> = state.queue.lock().drain(..).collect();
    if batch.is_empty() {
        return;
    }

    let mut by_subtype: indexmap_like::OrderedGroups = indexmap_like::OrderedGroups::new();
    for event in batch {
        let subtype = event
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        by_subtype.push(subtype, event);
    }

    let subscribers = state.subscribers.lock().clone();
    for (subtype, events) in by_subtype.into_iter() {
        for (id, handler) in &subscribers {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler(&subtype, &events);
            }));
            if result.is_err() {
                warn!(topic, subscriber_id = id, "event bus subscriber panicked, skipping");
            }
        }
    }
}

/// Minimal insertion-ordered multimap so batch delivery preserves publish
/// order per subtype without pulling in an extra dependency for one use.
mod indexmap_like {
    use serde_json::Value;

    #[derive(Default)]
    pub struct OrderedGroups {
        order: Vec<String>,
        groups: std::collections::HashMap<String, Vec<Value>>,
    }

    impl OrderedGroups {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&mut self, key: String, value: Value) {
            if !self.groups.contains_key(&key) {
                self.order.push(key.clone());
            }
            self.groups.entry(key).or_default().push(value);
        }

        pub fn into_iter(self) -> impl Iterator<Item = (String, Vec<Value>)> {
            let mut groups = self.groups;
            self.order
                .into_iter()
                .map(move |key| {
                    let values = groups.remove(&key).unwrap_or_default();
                    (key, values)
                })
        }
    }
}
