use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use vynk_protocol::CommandResult;

use super::{BridgeError, TaskId};

struct Slot {
    result: CommandResult,
    inserted_at: Instant,
}

/// Single-writer / single-reader handoff of command results keyed by task id.
///
/// The dispatcher `put`s, an HTTP worker blocks in `await_result`. Results nobody
/// claims are dropped by `reclaim_expired` once they are older than the TTL.
pub struct ResultStore {
    slots: Mutex<HashMap<TaskId, Slot>>,
    ready: Condvar,
    ttl: Duration,
}

impl ResultStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            ready: Condvar::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn put(&self, task_id: TaskId, result: CommandResult) {
        let mut slots = self.slots.lock();
        slots.insert(
            task_id,
            Slot {
                result,
                inserted_at: Instant::now(),
            },
        );
        self.ready.notify_all();
    }

    /// Blocks the calling thread until the result for `task_id` arrives or `deadline`
    /// passes. A returned result is removed from the store.
    pub fn await_result(
        &self,
        task_id: &TaskId,
        deadline: Instant,
    ) -> Result<CommandResult, BridgeError> {
        let mut slots = self.slots.lock();
        loop {
            if let Some(slot) = slots.remove(task_id) {
                return Ok(slot.result);
            }
            if self.ready.wait_until(&mut slots, deadline).timed_out() {
                return match slots.remove(task_id) {
                    Some(slot) => Ok(slot.result),
                    None => Err(BridgeError::Timeout),
                };
            }
        }
    }

    /// Drops results older than the TTL; returns how many were removed.
    pub fn reclaim_expired(&self) -> usize {
        self.reclaim_expired_at(Instant::now())
    }

    pub fn reclaim_expired_at(&self, now: Instant) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| now.saturating_duration_since(slot.inserted_at) < self.ttl);
        before - slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
