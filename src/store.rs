//! Task store and pub/sub — components C and D.
//!
//! Every task has its own mutex-guarded slot (so mutations for the same
//! task ID are totally ordered by lock acquisition order) and its own set
//! of bounded subscriber queues (so one slow subscriber never blocks
//! another, nor the publisher). A subscriber queue's overflow policy is
//! "newest wins": when full, the oldest queued event is evicted to make
//! room for the new one and the subscriber's lag counter increments. This
//! is deliberately not `tokio::sync::broadcast`'s shared-ring-buffer
//! semantics — each subscriber gets an independent bounded queue and an
//! explicit, per-subscriber lag count.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::debug;

use crate::error::{GatewayError, GatewayResult};
use crate::types::{Task, TaskStatus};

/// One update delivered to a task's subscribers.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Status(Task),
    Artifact(Task),
}

impl TaskEvent {
    pub fn task(&self) -> &Task {
        match self {
            TaskEvent::Status(t) | TaskEvent::Artifact(t) => t,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.task().status.state.is_terminal()
    }
}

/// A bounded, independent queue for one subscriber of one task.
struct SubscriberQueue {
    capacity: usize,
    events: Mutex<VecDeque<TaskEvent>>,
    lag: AtomicU64,
    notify: Notify,
    closed: std::sync::atomic::AtomicBool,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::new()),
            lag: AtomicU64::new(0),
            notify: Notify::new(),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    async fn push(&self, event: TaskEvent) {
        let mut events = self.events.lock().await;
        if events.len() >= self.capacity {
            events.pop_front();
            self.lag.fetch_add(1, Ordering::SeqCst);
        }
        events.push_back(event);
        drop(events);
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

/// Handle returned by [`TaskStore::subscribe`]. Dropping it does not
/// automatically unsubscribe — call [`TaskStore::unsubscribe`] with the same
/// ID, mirroring the explicit subscribe/unsubscribe pair in the component
/// contract.
pub struct Subscription {
    pub id: u64,
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    /// Wait for the next event. Returns `None` once the subscription has
    /// been closed (via `unsubscribe`) and no events remain queued.
    pub async fn recv(&self) -> Option<TaskEvent> {
        loop {
            {
                let mut events = self.queue.events.lock().await;
                if let Some(event) = events.pop_front() {
                    return Some(event);
                }
                if self.queue.closed.load(Ordering::SeqCst) {
                    return None;
                }
            }
            self.queue.notify.notified().await;
        }
    }

    /// Number of events evicted before delivery for this subscriber so far.
    pub fn lag(&self) -> u64 {
        self.queue.lag.load(Ordering::SeqCst)
    }
}

struct TaskSlot {
    task: Task,
    subscribers: HashMap<u64, Arc<SubscriberQueue>>,
}

/// Notified (as a detached task) after every status or artifact mutation a
/// [`TaskStore`] applies, so push-notification delivery can be wired onto
/// the store without it depending on the webhook engine directly — see
/// `webhook::PushNotificationHook`.
#[async_trait]
pub trait TaskEventHook: Send + Sync {
    async fn on_task_event(&self, task: &Task);
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn put(&self, task: Task) -> GatewayResult<()>;
    async fn get(&self, task_id: &str) -> GatewayResult<Option<Task>>;
    /// Atomically attaches a subscriber to `task_id` and returns a snapshot
    /// of its current record alongside the subscription. Returns `Ok(None)`
    /// without attaching anything if no such task exists — callers must not
    /// auto-create a slot just by subscribing to it.
    async fn subscribe(&self, task_id: &str) -> GatewayResult<Option<(Task, Subscription)>>;
    async fn unsubscribe(&self, task_id: &str, subscription_id: u64) -> GatewayResult<()>;
    async fn apply_status_update(
        &self,
        task_id: &str,
        status: TaskStatus,
    ) -> GatewayResult<Task>;
    async fn apply_artifact_update(
        &self,
        task_id: &str,
        artifact: serde_json::Value,
    ) -> GatewayResult<Task>;
}

/// In-memory implementation backed by one mutex-guarded slot per task.
pub struct InMemoryTaskStore {
    slots: RwLock<HashMap<String, Arc<Mutex<TaskSlot>>>>,
    next_subscriber_id: AtomicU64,
    queue_capacity: usize,
    hook: StdRwLock<Option<Arc<dyn TaskEventHook>>>,
}

impl InMemoryTaskStore {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
            queue_capacity,
            hook: StdRwLock::new(None),
        }
    }

    /// Registers a hook invoked after every status/artifact mutation. Must
    /// be called on the concrete type before it's shared as `Arc<dyn
    /// TaskStore>`.
    pub fn set_hook(&self, hook: Arc<dyn TaskEventHook>) {
        *self.hook.write().unwrap() = Some(hook);
    }

    fn notify_hook(&self, task: &Task) {
        if let Some(hook) = self.hook.read().unwrap().clone() {
            let task = task.clone();
            tokio::spawn(async move {
                hook.on_task_event(&task).await;
            });
        }
    }

    async fn slot_for(&self, task_id: &str) -> Arc<Mutex<TaskSlot>> {
        if let Some(slot) = self.slots.read().await.get(task_id) {
            return slot.clone();
        }
        let mut slots = self.slots.write().await;
        slots
            .entry(task_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(TaskSlot {
                    task: Task::new(task_id, "", crate::types::TaskState::Submitted),
                    subscribers: HashMap::new(),
                }))
            })
            .clone()
    }

    async fn broadcast(slot: &TaskSlot, event: TaskEvent) {
        for queue in slot.subscribers.values() {
            queue.push(event.clone()).await;
        }
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn put(&self, task: Task) -> GatewayResult<()> {
        let slot_arc = self.slot_for(&task.id).await;
        let mut slot = slot_arc.lock().await;
        if slot.task.status.state.is_terminal() {
            debug!(task_id = %task.id, "rejected put: task already terminal");
            return Err(GatewayError::terminal(task.id));
        }
        slot.task = task.clone();
        Self::broadcast(&slot, TaskEvent::Status(task)).await;
        Ok(())
    }

    async fn get(&self, task_id: &str) -> GatewayResult<Option<Task>> {
        let slots = self.slots.read().await;
        match slots.get(task_id) {
            Some(slot_arc) => Ok(Some(slot_arc.lock().await.task.clone())),
            None => Ok(None),
        }
    }

    async fn subscribe(&self, task_id: &str) -> GatewayResult<Option<(Task, Subscription)>> {
        let slot_arc = {
            let slots = self.slots.read().await;
            match slots.get(task_id) {
                Some(slot_arc) => slot_arc.clone(),
                None => return Ok(None),
            }
        };
        let mut slot = slot_arc.lock().await;
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        let queue = Arc::new(SubscriberQueue::new(self.queue_capacity));
        slot.subscribers.insert(id, queue.clone());
        Ok(Some((slot.task.clone(), Subscription { id, queue })))
    }

    async fn unsubscribe(&self, task_id: &str, subscription_id: u64) -> GatewayResult<()> {
        let slots = self.slots.read().await;
        if let Some(slot_arc) = slots.get(task_id) {
            let mut slot = slot_arc.lock().await;
            if let Some(queue) = slot.subscribers.remove(&subscription_id) {
                queue.close();
            }
        }
        Ok(())
    }

    async fn apply_status_update(
        &self,
        task_id: &str,
        status: TaskStatus,
    ) -> GatewayResult<Task> {
        let slot_arc = self.slot_for(task_id).await;
        let mut slot = slot_arc.lock().await;
        if slot.task.status.state.is_terminal() {
            debug!(task_id, "rejected status update: task already terminal");
            return Err(GatewayError::terminal(task_id));
        }
        slot.task.status = status;
        let snapshot = slot.task.clone();
        Self::broadcast(&slot, TaskEvent::Status(snapshot.clone())).await;
        drop(slot);
        self.notify_hook(&snapshot);
        Ok(snapshot)
    }

    async fn apply_artifact_update(
        &self,
        task_id: &str,
        artifact: serde_json::Value,
    ) -> GatewayResult<Task> {
        let slot_arc = self.slot_for(task_id).await;
        let mut slot = slot_arc.lock().await;
        if slot.task.status.state.is_terminal() {
            debug!(task_id, "rejected artifact update: task already terminal");
            return Err(GatewayError::terminal(task_id));
        }
        slot.task.artifacts.push(artifact);
        let snapshot = slot.task.clone();
        Self::broadcast(&slot, TaskEvent::Artifact(snapshot.clone())).await;
        drop(slot);
        self.notify_hook(&snapshot);
        Ok(snapshot)
    }
}

/// CRUD store for per-task push-notification configs — backs the
/// `tasks.pushNotificationConfig.*` method family.
#[async_trait]
pub trait PushConfigStore: Send + Sync {
    async fn set(&self, config: crate::types::PushConfig) -> GatewayResult<()>;
    async fn get(&self, task_id: &str, config_id: &str) -> GatewayResult<crate::types::PushConfig>;
    async fn list(&self, task_id: &str) -> GatewayResult<Vec<crate::types::PushConfig>>;
    async fn delete(&self, task_id: &str, config_id: &str) -> GatewayResult<()>;
}

/// In-memory implementation keyed by `(task_id, config_id)`, following the
/// same read-write-locked hash map idiom as [`InMemoryAgentRegistry`].
#[derive(Default)]
pub struct InMemoryPushConfigStore {
    configs: RwLock<HashMap<(String, String), crate::types::PushConfig>>,
}

impl InMemoryPushConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PushConfigStore for InMemoryPushConfigStore {
    async fn set(&self, config: crate::types::PushConfig) -> GatewayResult<()> {
        let key = (config.task_id.clone(), config.id.clone());
        self.configs.write().await.insert(key, config);
        Ok(())
    }

    async fn get(&self, task_id: &str, config_id: &str) -> GatewayResult<crate::types::PushConfig> {
        self.configs
            .read()
            .await
            .get(&(task_id.to_string(), config_id.to_string()))
            .cloned()
            .ok_or_else(|| GatewayError::ConfigNotFound(config_id.to_string()))
    }

    async fn list(&self, task_id: &str) -> GatewayResult<Vec<crate::types::PushConfig>> {
        Ok(self
            .configs
            .read()
            .await
            .values()
            .filter(|c| c.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn delete(&self, task_id: &str, config_id: &str) -> GatewayResult<()> {
        self.configs
            .write()
            .await
            .remove(&(task_id.to_string(), config_id.to_string()));
        Ok(())
    }
}
