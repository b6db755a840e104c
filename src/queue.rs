//! Bounded lock-free MPMC ring for cross-thread task handoff.
//!
//! A power-of-two ring of slots, each stamped with a sequence number that
//! encodes whether the slot is ready for the producer or the consumer
//! (the Vyukov bounded-queue scheme). Enqueue stamps `pos + 1`, dequeue
//! stamps `pos + capacity`. A negative sequence/position difference means
//! full on the producer side and empty on the consumer side.
//!
//! Producer and consumer cursors sit on their own cache lines so the
//! acceptor loop and a busy worker never false-share.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded MPMC queue with a fixed, power-of-two capacity.
pub struct TaskQueue<T> {
    slots: Box<[Slot<T>]>,
    mask: usize,
    enqueue_pos: CachePadded<AtomicUsize>,
    dequeue_pos: CachePadded<AtomicUsize>,
}

// Safety: slots are handed off between threads through the sequence
// protocol; a value is only read by the thread that won the dequeue CAS.
unsafe impl<T: Send> Send for TaskQueue<T> {}
unsafe impl<T: Send> Sync for TaskQueue<T> {}

impl<T> TaskQueue<T> {
    /// Create a queue; `capacity` is rounded up to the next power of two
    /// (minimum 2).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let slots: Box<[Slot<T>]> = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        TaskQueue {
            slots,
            mask: capacity - 1,
            enqueue_pos: CachePadded::new(AtomicUsize::new(0)),
            dequeue_pos: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Non-blocking enqueue. Returns the value back when the queue is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;
            if diff == 0 {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { (*slot.value.get()).write(value) };
                        slot.sequence.store(pos + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                return Err(value);
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Non-blocking dequeue. Returns `None` when the queue is empty.
    pub fn pop(&self) -> Option<T> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq as isize - (pos + 1) as isize;
            if diff == 0 {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.sequence
                            .store(pos + self.slots.len(), Ordering::Release);
                        return Some(value);
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Approximate occupancy. Exact when no other thread is mid-operation.
    pub fn len(&self) -> usize {
        let tail = self.enqueue_pos.load(Ordering::Relaxed);
        let head = self.dequeue_pos.load(Ordering::Relaxed);
        tail.wrapping_sub(head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for TaskQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;
    use std::thread;

    #[test]
    fn capacity_rounds_up() {
        let q: TaskQueue<u32> = TaskQueue::new(1000);
        assert_eq!(q.capacity(), 1024);
    }

    #[test]
    fn push_pop_fifo_single_thread() {
        let q = TaskQueue::new(8);
        for i in 0..8 {
            q.push(i).unwrap();
        }
        for i in 0..8 {
            assert_eq!(q.pop(), Some(i));
        }
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn full_queue_rejects_and_size_is_bounded() {
        let q = TaskQueue::new(4);
        for i in 0..4 {
            assert!(q.push(i).is_ok());
        }
        assert_eq!(q.len(), q.capacity());
        // size == capacity exactly when the next enqueue fails
        assert_eq!(q.push(99), Err(99));
        assert_eq!(q.len(), 4);

        assert_eq!(q.pop(), Some(0));
        assert!(q.push(99).is_ok());
    }

    #[test]
    fn slot_is_reusable_after_wraparound() {
        let q = TaskQueue::new(2);
        for round in 0..10 {
            q.push(round * 2).unwrap();
            q.push(round * 2 + 1).unwrap();
            assert_eq!(q.pop(), Some(round * 2));
            assert_eq!(q.pop(), Some(round * 2 + 1));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn drops_remaining_values() {
        let q = TaskQueue::new(4);
        q.push(Arc::new(1u32)).unwrap();
        let seen = Arc::new(2u32);
        q.push(seen.clone()).unwrap();
        drop(q);
        assert_eq!(Arc::strong_count(&seen), 1);
    }

    #[test]
    fn mpmc_handoff_is_lossless() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 10_000;

        let q = Arc::new(TaskQueue::new(256));
        let sum = Arc::new(AtomicU64::new(0));
        let received = Arc::new(AtomicU64::new(0));

        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let q = q.clone();
                let sum = sum.clone();
                let received = received.clone();
                thread::spawn(move || {
                    while received.load(Ordering::Relaxed) < PRODUCERS * PER_PRODUCER {
                        if let Some(v) = q.pop() {
                            sum.fetch_add(v, Ordering::Relaxed);
                            received.fetch_add(1, Ordering::Relaxed);
                        } else {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let q = q.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let mut v = p * PER_PRODUCER + i;
                        loop {
                            match q.push(v) {
                                Ok(()) => break,
                                Err(back) => {
                                    v = back;
                                    thread::yield_now();
                                }
                            }
                        }
                    }
                })
            })
            .collect();

        for h in producers {
            h.join().unwrap();
        }
        for h in consumers {
            h.join().unwrap();
        }

        let n = PRODUCERS * PER_PRODUCER;
        assert_eq!(sum.load(Ordering::Relaxed), n * (n - 1) / 2);
    }
}
