use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::message::PendingMessage;

/// Bounded FIFO shared by producing tasks (enqueue) and the background
/// publisher (drain).
///
/// Admission control: once an enqueue fills the queue to capacity, the queue
/// closes and every enqueue waits until the drain brings the depth down to
/// half the capacity, then admission reopens. Messages are never reordered;
/// the publisher removes the head only after a successful publish.
pub(crate) struct BoundedSendQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    space: Notify,
}

struct QueueState {
    items: VecDeque<PendingMessage>,
    draining: bool,
}

impl BoundedSendQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "send queue capacity must be positive");
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                draining: false,
            }),
            capacity,
            space: Notify::new(),
        }
    }

    /// Append one message, waiting while the queue is closed for admission.
    pub async fn enqueue(&self, msg: PendingMessage) {
        let mut msg = Some(msg);
        loop {
            // Register for the wakeup before checking state, so a reopen
            // between the check and the await is not missed.
            let reopened = self.space.notified();
            {
                let mut state = self.state.lock().expect("send queue lock poisoned");
                if !state.draining && state.items.len() < self.capacity {
                    state
                        .items
                        .push_back(msg.take().expect("message enqueued twice"));
                    if state.items.len() >= self.capacity {
                        state.draining = true;
                    }
                    return;
                }
                state.draining = true;
            }
            reopened.await;
        }
    }

    /// Oldest message, without removing it.
    pub fn peek_front(&self) -> Option<PendingMessage> {
        let state = self.state.lock().expect("send queue lock poisoned");
        state.items.front().cloned()
    }

    /// Drop the head after a successful publish. Reopens admission once the
    /// depth reaches half the capacity.
    pub fn pop_front(&self) {
        let mut state = self.state.lock().expect("send queue lock poisoned");
        state.items.pop_front();
        if state.draining && state.items.len() <= self.capacity / 2 {
            state.draining = false;
            self.space.notify_waiters();
        }
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock().expect("send queue lock poisoned");
        state.items.len()
    }
}
