// ABOUTME: Coordinator-side state for one worker process - link, slot arena
// ABOUTME: of in-flight calls, lifetime call count, and exit code.

use super::call::CallRecord;
use crate::protocol::Slot;
use crate::transport::WorkerLink;

/// One worker as the farm sees it.
///
/// In-flight calls live in a slot arena. A call keeps its slot index until it
/// finishes, and freed slots are reused lowest-first.
pub(crate) struct WorkerProcess {
    link: WorkerLink,
    slots: Vec<Option<CallRecord>>,
    active: usize,
    total_calls: usize,
    exit_code: Option<i32>,
}

impl WorkerProcess {
    pub fn new(link: WorkerLink) -> Self {
        Self {
            link,
            slots: Vec::new(),
            active: 0,
            total_calls: 0,
            exit_code: None,
        }
    }

    /// Place `call` in the lowest free slot and count it.
    pub fn assign(&mut self, call: CallRecord) -> Slot {
        self.active += 1;
        self.total_calls += 1;

        match self.slots.iter().position(Option::is_none) {
            Some(slot) => {
                self.slots[slot] = Some(call);
                slot
            }
            None => {
                self.slots.push(Some(call));
                self.slots.len() - 1
            }
        }
    }

    pub fn call_mut(&mut self, slot: Slot) -> Option<&mut CallRecord> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    /// Remove the call in `slot`, freeing it for reuse.
    pub fn take(&mut self, slot: Slot) -> Option<CallRecord> {
        let call = self.slots.get_mut(slot)?.take()?;
        self.active -= 1;
        while matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
        }
        Some(call)
    }

    pub fn occupied_slots(&self) -> Vec<Slot> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, call)| call.as_ref().map(|_| slot))
            .collect()
    }

    /// Remove every in-flight call, in slot order.
    pub fn drain_calls(&mut self) -> Vec<CallRecord> {
        self.active = 0;
        self.slots.drain(..).flatten().collect()
    }

    pub fn active_calls(&self) -> usize {
        self.active
    }

    pub fn total_calls(&self) -> usize {
        self.total_calls
    }

    pub fn is_idle(&self) -> bool {
        self.active == 0
    }

    /// Whether this worker may take another call under the given limits.
    pub fn has_capacity(&self, max_concurrent_calls: usize, max_lifetime_calls: usize) -> bool {
        self.active < max_concurrent_calls
            && self.total_calls < max_lifetime_calls
            && !self.link.is_closed()
    }

    /// Whether some in-flight call still carries the timer `token`.
    pub fn has_timer(&self, token: u64) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|call| call.timer_token() == Some(token))
    }

    pub fn link(&self) -> &WorkerLink {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut WorkerLink {
        &mut self.link
    }

    pub fn set_exit_code(&mut self, code: Option<i32>) {
        self.exit_code = code;
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }
}
