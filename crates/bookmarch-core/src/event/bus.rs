//! Broadcast event bus for distributing `TaskEvent` to multiple subscribers.
//!
//! Built on `tokio::sync::broadcast`. Delivery is best-effort and ordered
//! per task (all events flow through one channel in publish order); a lagged
//! subscriber drops events and reconciles by reading the durable stores,
//! which remain the source of truth. Publishing with no active subscribers
//! is a no-op, and subscriber lifecycle never affects task execution.

use bookmarch_types::event::TaskEvent;
use futures_util::Stream;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Multi-consumer event bus for task lifecycle events.
///
/// Cloning the bus clones the sender, allowing multiple producers and
/// consumers.
pub struct TaskEventBus {
    sender: broadcast::Sender<TaskEvent>,
}

impl TaskEventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a new subscriber receiving all future events for all tasks.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }

    /// A stream of future events for one task.
    ///
    /// Lagged receivers skip the missed events and keep going; the stream
    /// ends when the bus is dropped.
    pub fn subscribe_task(&self, task_id: Uuid) -> impl Stream<Item = TaskEvent> + Send + 'static {
        let mut rx = self.sender.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) if event.task_id() == task_id => yield event,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(%task_id, skipped = n, "task event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no subscribers, the event is silently dropped.
    pub fn publish(&self, event: TaskEvent) {
        let _ = self.sender.send(event);
    }
}

impl Clone for TaskEventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for TaskEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
