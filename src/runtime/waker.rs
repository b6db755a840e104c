//! Zero-allocation waker for loop-local routines.
//!
//! Waking pushes the task id onto a thread-local ready queue; the owning
//! loop drains it after each completion batch and polls the tasks. The
//! task id rides in the `RawWaker` data pointer, so cloning and waking
//! never allocate.

use std::collections::VecDeque;
use std::task::{RawWaker, RawWakerVTable, Waker};

thread_local! {
    static READY_QUEUE: std::cell::RefCell<VecDeque<u32>> =
        const { std::cell::RefCell::new(VecDeque::new()) };
}

/// Create a [`Waker`] for the routine with the given task id.
///
/// Only meaningful on the thread whose loop owns the task; completions
/// are dispatched on that same thread, so wakes never cross threads.
pub(crate) fn task_waker(task_id: u32) -> Waker {
    let data = task_id as usize as *const ();
    // Safety: the vtable functions below follow the RawWaker contract;
    // the data pointer is just the task id, nothing is owned.
    unsafe { Waker::from_raw(RawWaker::new(data, &VTABLE)) }
}

/// Push a task id directly onto the ready queue (used by `spawn`).
pub(crate) fn push_ready(task_id: u32) {
    READY_QUEUE.with(|q| q.borrow_mut().push_back(task_id));
}

/// Move all queued task ids into `buf`.
pub(crate) fn drain_ready_queue(buf: &mut VecDeque<u32>) {
    READY_QUEUE.with(|q| buf.append(&mut q.borrow_mut()));
}

const VTABLE: RawWakerVTable = RawWakerVTable::new(clone_fn, wake_fn, wake_by_ref_fn, drop_fn);

unsafe fn clone_fn(data: *const ()) -> RawWaker {
    RawWaker::new(data, &VTABLE)
}

unsafe fn wake_fn(data: *const ()) {
    unsafe { wake_by_ref_fn(data) };
}

unsafe fn wake_by_ref_fn(data: *const ()) {
    push_ready(data as usize as u32);
}

unsafe fn drop_fn(_data: *const ()) {}
