//! Change notifications for display collaborators.
//!
//! Subscribers receive changes over a channel and consume them on their own
//! task, never on the lane worker that produced them. A subscription is
//! removed when its handle is dropped or [`Subscription::unsubscribe`] is
//! called.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::event::EventId;
use crate::task::TaskId;

/// A change to the task list.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskChange {
    Enqueued { id: TaskId, queue_name: String },
    Retrying { id: TaskId, retries: u32, next_run_at: DateTime<Utc> },
    Failed { id: TaskId },
    Completed { id: TaskId },
    /// Deletion of a running task was requested; the row goes once it stops.
    AbortRequested { id: TaskId },
    Deleted { id: TaskId },
    /// A failed task was manually put back in its queue.
    Requeued { id: TaskId },
    CleanedUp { removed: usize },
}

/// A change to the event log.
#[derive(Debug, Clone, PartialEq)]
pub enum EventChange {
    Stored { id: EventId, task_id: TaskId },
    SelectionChanged { id: EventId, selected: bool },
    Deleted { id: EventId },
    CleanedUp { removed: usize },
}

struct Listeners<T> {
    next_id: u64,
    senders: HashMap<u64, mpsc::UnboundedSender<T>>,
}

/// A set of subscribers for one kind of change.
pub struct ListenerSet<T> {
    inner: Arc<Mutex<Listeners<T>>>,
}

impl<T: Clone + Send + 'static> ListenerSet<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Listeners {
                next_id: 0,
                senders: HashMap::new(),
            })),
        }
    }

    /// Add a subscriber.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = self.inner.lock();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.senders.insert(id, tx);

        Subscription {
            id,
            rx,
            set: Arc::downgrade(&self.inner),
        }
    }

    /// Send a change to every subscriber, pruning those that went away.
    pub fn notify(&self, change: T) {
        let mut listeners = self.inner.lock();
        listeners
            .senders
            .retain(|_, tx| tx.send(change.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.inner.lock().senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + Send + 'static> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a subscription. Dropping it unsubscribes.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::UnboundedReceiver<T>,
    set: Weak<Mutex<Listeners<T>>>,
}

impl<T> Subscription<T> {
    /// Wait for the next change. Returns None once the manager is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take a pending change without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Stop receiving changes.
    pub fn unsubscribe(self) {}
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(set) = self.set.upgrade() {
            set.lock().senders.remove(&self.id);
        }
    }
}
