//! Request slot scheduling
//!
//! At most one request is in flight per `(multiplex id, meta)` key. Waiters
//! queue FIFO per priority. Only the head of a queue may start, and a
//! blocked head also holds back every lower-priority queue, so a user
//! request waiting on a busy key keeps later background requests from
//! overtaking it.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::meta::MetaEnum;

/// Request priority; user requests go first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Cyclic,
    User,
}

impl Priority {
    fn queue(self) -> usize {
        match self {
            Priority::User => 0,
            Priority::Cyclic => 1,
        }
    }
}

/// Serialisation key of a request
pub type SlotKey = (u64, MetaEnum);

struct Waiter {
    key: SlotKey,
    grant: oneshot::Sender<SlotPermit>,
}

#[derive(Default)]
struct SchedulerState {
    queues: [VecDeque<Waiter>; 2],
    in_flight: HashSet<SlotKey>,
}

/// Grants request slots
#[derive(Clone, Default)]
pub struct RequestScheduler {
    state: Arc<Mutex<SchedulerState>>,
}

/// Ownership of a request slot; dropping it releases the key
pub struct SlotPermit {
    key: SlotKey,
    state: Arc<Mutex<SchedulerState>>,
}

impl SlotPermit {
    pub fn key(&self) -> SlotKey {
        self.key
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.state.lock().in_flight.remove(&self.key);
        dispatch(&self.state);
    }
}

impl std::fmt::Debug for SlotPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPermit").field("key", &self.key).finish()
    }
}

/// Hand out every slot that can start now
///
/// Grants are sent after the lock is released: a grant whose receiver is
/// gone comes back as a permit, and dropping that permit locks again.
fn dispatch(state: &Arc<Mutex<SchedulerState>>) {
    let mut grants = Vec::new();
    {
        let mut guard = state.lock();
        let SchedulerState { queues, in_flight } = &mut *guard;
        'queues: for queue in queues.iter_mut() {
            while let Some(front) = queue.front() {
                if front.grant.is_closed() {
                    queue.pop_front();
                    continue;
                }
                if in_flight.contains(&front.key) {
                    break 'queues;
                }
                if let Some(waiter) = queue.pop_front() {
                    in_flight.insert(waiter.key);
                    grants.push(waiter);
                }
            }
        }
    }

    for waiter in grants {
        let permit = SlotPermit {
            key: waiter.key,
            state: state.clone(),
        };
        // A canceled waiter returns the permit, whose drop releases the key
        let _ = waiter.grant.send(permit);
    }
}

impl RequestScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the slot of `key`
    ///
    /// Dropping the returned future before it completes gives up the place in
    /// the queue; a slot granted in the meantime is released again.
    pub async fn acquire(&self, key: SlotKey, priority: Priority) -> SlotPermit {
        loop {
            let (tx, rx) = oneshot::channel();
            self.state.lock().queues[priority.queue()].push_back(Waiter { key, grant: tx });
            dispatch(&self.state);

            // The sender stays queued until granted; requeue if it was dropped
            if let Ok(permit) = rx.await {
                return permit;
            }
        }
    }

    /// Keys currently in flight
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Waiters across both queues
    pub fn queued(&self) -> usize {
        self.state.lock().queues.iter().map(VecDeque::len).sum()
    }
}
