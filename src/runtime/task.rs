//! Slab of spawned routines.
//!
//! Each loop owns one slab. A routine is taken out for polling and put
//! back if it returns `Pending`, so a stale id in the ready queue (the
//! task completed, or was woken twice) simply finds an empty slot.

use std::future::Future;
use std::pin::Pin;

pub(crate) type LocalFuture = Pin<Box<dyn Future<Output = ()>>>;

pub(crate) struct TaskSlab {
    slots: Vec<Option<LocalFuture>>,
    free: Vec<u32>,
    active: usize,
}

impl TaskSlab {
    pub(crate) fn new() -> Self {
        TaskSlab {
            slots: Vec::new(),
            free: Vec::new(),
            active: 0,
        }
    }

    /// Insert a routine, returning its task id.
    pub(crate) fn insert(&mut self, fut: LocalFuture) -> u32 {
        self.active += 1;
        match self.free.pop() {
            Some(id) => {
                self.slots[id as usize] = Some(fut);
                id
            }
            None => {
                self.slots.push(Some(fut));
                (self.slots.len() - 1) as u32
            }
        }
    }

    /// Take the routine out for polling. `None` for stale ids.
    pub(crate) fn take(&mut self, id: u32) -> Option<LocalFuture> {
        self.slots.get_mut(id as usize)?.take()
    }

    /// Put a still-pending routine back.
    pub(crate) fn restore(&mut self, id: u32, fut: LocalFuture) {
        self.slots[id as usize] = Some(fut);
    }

    /// Mark a routine finished and recycle its slot.
    pub(crate) fn complete(&mut self, id: u32) {
        debug_assert!(self.slots[id as usize].is_none());
        self.free.push(id);
        self.active -= 1;
    }

    pub(crate) fn active(&self) -> usize {
        self.active
    }
}
