use crate::store::types::TaskEvent;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

/// Per-listener buffer. A listener that falls more than this many events
/// behind starts dropping (it observes `RecvError::Lagged`); the publisher
/// never blocks.
const LISTENER_BUFFER: usize = 256;

/// Process-local fan-out of task events, keyed by task id.
///
/// The hub does not persist anything: the repository journals every event
/// before publishing here, so late subscribers replay from the store and
/// then attach live. Events for one task are delivered to each listener in
/// publication order.
pub struct EventHub {
    channels: Mutex<HashMap<String, broadcast::Sender<TaskEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Publish an event to all live listeners of its task. Non-blocking;
    /// slow listeners drop events for themselves only.
    pub fn publish(&self, event: &TaskEvent) {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(tx) = channels.get(&event.task_id) {
            if tx.receiver_count() == 0 {
                // Last listener went away; drop the channel entry.
                channels.remove(&event.task_id);
                return;
            }
            // Err means no receivers, which we just ruled out; a receiver
            // detaching between the check and the send is harmless.
            let _ = tx.send(event.clone());
            debug!(
                "published {} seq={} to {} listener(s)",
                event.event_type,
                event.seq,
                tx.receiver_count()
            );
        }
    }

    /// Attach a listener for one task. Dropping the receiver unsubscribes;
    /// dropping it twice is naturally a no-op.
    pub fn subscribe(&self, task_id: &str) -> broadcast::Receiver<TaskEvent> {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        channels
            .entry(task_id.to_string())
            .or_insert_with(|| broadcast::channel(LISTENER_BUFFER).0)
            .subscribe()
    }

    /// Number of tasks with at least one registered channel. Test hook.
    pub fn channel_count(&self) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests;
