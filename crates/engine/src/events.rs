//! Event bus — typed publish/subscribe between the executor and observers.
//!
//! Handlers run synchronously inside `publish`, in subscription order. They
//! get a time budget; a handler that overruns it is logged, and one that
//! panics is caught and logged. Long work belongs on the async tap returned
//! by [`EventBus::tap`].

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{error, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventName {
    WorkflowStarted,
    StageStarted,
    NodeStarted,
    NodeCompleted,
    StageCompleted,
    CheckpointCreated,
    CheckpointRestored,
    NodeAdjusted,
    /// The executor restored a checkpoint after a fault.
    Recovered,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::WorkflowStarted => "workflow-started",
            EventName::StageStarted => "stage-started",
            EventName::NodeStarted => "node-started",
            EventName::NodeCompleted => "node-completed",
            EventName::StageCompleted => "stage-completed",
            EventName::CheckpointCreated => "checkpoint-created",
            EventName::CheckpointRestored => "checkpoint-restored",
            EventName::NodeAdjusted => "node-adjusted",
            EventName::Recovered => "recovered",
            EventName::WorkflowCompleted => "workflow-completed",
            EventName::WorkflowFailed => "workflow-failed",
            EventName::WorkflowCancelled => "workflow-cancelled",
        }
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fire-and-forget notification.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub name: EventName,
    pub workflow_id: Uuid,
    pub payload: Value,
}

impl Event {
    pub fn new(name: EventName, workflow_id: Uuid, payload: Value) -> Self {
        Self {
            name,
            workflow_id,
            payload,
        }
    }
}

pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct EventBus {
    handlers: RwLock<HashMap<EventName, Vec<(SubscriptionId, Handler)>>>,
    next_id: AtomicU64,
    tap: broadcast::Sender<Event>,
    budget: Duration,
}

impl EventBus {
    /// `capacity` bounds the async tap; `budget` is the per-handler time
    /// allowance.
    pub fn new(capacity: usize, budget: Duration) -> Self {
        let (tap, _) = broadcast::channel(capacity.max(1));
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            tap,
            budget,
        }
    }

    pub fn subscribe<F>(&self, name: EventName, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(name)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Returns whether the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        for list in handlers.values_mut() {
            if let Some(pos) = list.iter().position(|(sid, _)| *sid == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Receiver seeing every published event; lagging receivers lose the
    /// oldest events.
    pub fn tap(&self) -> broadcast::Receiver<Event> {
        self.tap.subscribe()
    }

    pub fn publish(&self, event: Event) {
        // Clone the handler list so handlers may subscribe or publish.
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .get(&event.name)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        for handler in handlers {
            let started = Instant::now();
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                error!(
                    event = %event.name,
                    workflow_id = %event.workflow_id,
                    "event handler panicked"
                );
            }
            let elapsed = started.elapsed();
            if elapsed > self.budget {
                warn!(
                    event = %event.name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    budget_ms = self.budget.as_millis() as u64,
                    "event handler exceeded its budget; hand slow work off to the tap"
                );
            }
        }

        // No receivers is fine.
        let _ = self.tap.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256, Duration::from_millis(50))
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count: usize = self.handlers.read().values().map(Vec::len).sum();
        f.debug_struct("EventBus")
            .field("handlers", &count)
            .field("budget", &self.budget)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn event(name: EventName) -> Event {
        Event::new(name, Uuid::nil(), json!({}))
    }

    #[test]
    fn handlers_only_see_their_event() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        bus.subscribe(EventName::NodeCompleted, move |e| sink.lock().push(e.name));

        bus.publish(event(EventName::StageStarted));
        bus.publish(event(EventName::NodeCompleted));

        assert_eq!(*seen.lock(), vec![EventName::NodeCompleted]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicU64::new(0));

        let c = Arc::clone(&count);
        let id = bus.subscribe(EventName::StageStarted, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(event(EventName::StageStarted));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(event(EventName::StageStarted));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_handler_does_not_stop_others() {
        let bus = EventBus::default();
        let reached = Arc::new(AtomicU64::new(0));

        bus.subscribe(EventName::StageCompleted, |_| panic!("observer bug"));
        let r = Arc::clone(&reached);
        bus.subscribe(EventName::StageCompleted, move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(event(EventName::StageCompleted));
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tap_receives_every_event() {
        let bus = EventBus::default();
        let mut rx = bus.tap();

        bus.publish(event(EventName::WorkflowStarted));
        bus.publish(event(EventName::WorkflowCompleted));

        assert_eq!(rx.recv().await.unwrap().name, EventName::WorkflowStarted);
        assert_eq!(rx.recv().await.unwrap().name, EventName::WorkflowCompleted);
    }

    #[test]
    fn names_render_kebab_case() {
        assert_eq!(EventName::StageStarted.to_string(), "stage-started");
        assert_eq!(
            serde_json::to_value(EventName::NodeCompleted).unwrap(),
            json!("node-completed")
        );
    }
}
