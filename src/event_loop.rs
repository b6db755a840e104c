//! Per-thread event loop driving one io_uring instance.
//!
//! The loop batches pending SQEs, blocks for at least one completion,
//! drains the completion queue, dispatches each entry to its
//! [`IoContext`], polls any routines the completions woke, and finally
//! drains the cross-thread task ring (bounded, so queued work cannot
//! starve I/O).
//!
//! Cross-thread wakeup is an 8-byte eventfd read permanently posted on
//! the ring: writing the eventfd from any thread produces a completion
//! that pulls the loop out of its blocking wait.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::future::Future;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use io_uring::types::Fd;
use io_uring::{IoUring, opcode, squeue};
use tracing::{debug, error, warn};

use crate::acceptor::Acceptor;
use crate::buffer::fixed::FixedBufferPool;
use crate::config::LoopOptions;
use crate::connection::Connection;
use crate::context::{IoContext, OpKind};
use crate::error::Error;
use crate::metrics;
use crate::queue::TaskQueue;
use crate::runtime::task::TaskSlab;
use crate::runtime::waker;

/// A unit of work queued onto a loop from another thread.
pub type Task = Box<dyn FnOnce() + Send>;

/// Invoked with `true` when the task ring crosses its high watermark and
/// `false` once it has drained back below the low watermark.
pub type BackpressureCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Upper bound on tasks drained per loop iteration.
const MAX_PENDING_DRAIN: usize = 65536;

/// Snapshot of a loop's task-ring back-pressure counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct BackpressureStats {
    /// Tasks dropped because the ring was full.
    pub queue_full_count: u64,
    /// Transitions into the high-watermark state.
    pub high_mark_events: u64,
    /// Recoveries below the low watermark.
    pub low_mark_events: u64,
    /// Largest ring occupancy observed.
    pub peak_queue_size: usize,
}

/// State confined to the loop's own thread.
struct LoopCore {
    ring: IoUring,
    buffers: Option<FixedBufferPool>,
    tasks: TaskSlab,
    ready: VecDeque<u32>,
    cqe_batch: Vec<(u64, i32)>,
    /// Connections destroyed while ops were still in flight; kept alive
    /// until their last completion drains so the kernel never holds a
    /// dangling user_data.
    retired: Vec<Arc<Connection>>,
    /// Same for stopped acceptors awaiting their cancelled accept CQE.
    retired_acceptors: Vec<Arc<Acceptor>>,
    wakeup_ctx: Box<IoContext>,
    wakeup_buf: Box<u64>,
}

/// One event loop, bound to the thread that constructed it.
pub struct EventLoop {
    opts: LoopOptions,
    tid: libc::pid_t,
    wakeup_fd: RawFd,
    quit: AtomicBool,
    running: AtomicBool,
    calling_pending: AtomicBool,
    pending: TaskQueue<Task>,
    in_high_mark: AtomicBool,
    queue_full_count: AtomicU64,
    high_mark_events: AtomicU64,
    low_mark_events: AtomicU64,
    peak_queue_size: AtomicUsize,
    backpressure_cb: Mutex<Option<BackpressureCallback>>,
    core: UnsafeCell<LoopCore>,
}

// Safety: `core` is only ever touched from the loop's owning thread
// (`core()` asserts this in debug builds); every other field is atomic,
// lock-protected, or the thread-safe task ring.
unsafe impl Send for EventLoop {}
unsafe impl Sync for EventLoop {}

impl EventLoop {
    /// Create a loop on the current thread. The thread that calls `new`
    /// is the loop's owning thread and the only one that may call
    /// [`run`](Self::run).
    pub fn new(opts: LoopOptions) -> Result<Arc<Self>, Error> {
        let opts = opts.normalize();

        let mut builder = IoUring::builder();
        if opts.sqpoll {
            builder.setup_sqpoll(opts.sqpoll_idle_ms);
        }
        let ring = builder
            .build(opts.ring_entries)
            .map_err(|e| Error::RingSetup(e.to_string()))?;

        let wakeup_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wakeup_fd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        let pending = TaskQueue::new(opts.pending_queue_capacity);
        let wakeup_ctx = Box::new(IoContext::new(OpKind::Wakeup, wakeup_fd));

        let event_loop = Arc::new(EventLoop {
            tid: unsafe { libc::gettid() },
            wakeup_fd,
            quit: AtomicBool::new(false),
            running: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            pending,
            in_high_mark: AtomicBool::new(false),
            queue_full_count: AtomicU64::new(0),
            high_mark_events: AtomicU64::new(0),
            low_mark_events: AtomicU64::new(0),
            peak_queue_size: AtomicUsize::new(0),
            backpressure_cb: Mutex::new(None),
            core: UnsafeCell::new(LoopCore {
                ring,
                buffers: None,
                tasks: TaskSlab::new(),
                ready: VecDeque::with_capacity(64),
                cqe_batch: Vec::with_capacity(256),
                retired: Vec::new(),
                retired_acceptors: Vec::new(),
                wakeup_ctx,
                wakeup_buf: Box::new(0),
            }),
            opts,
        });

        event_loop.post_wakeup_read();
        Ok(event_loop)
    }

    /// The normalized options this loop runs with.
    pub fn options(&self) -> &LoopOptions {
        &self.opts
    }

    /// True when called from the loop's owning thread.
    pub fn is_in_loop_thread(&self) -> bool {
        unsafe { libc::gettid() == self.tid }
    }

    #[allow(clippy::mut_from_ref)]
    fn core(&self) -> &mut LoopCore {
        debug_assert!(
            self.is_in_loop_thread(),
            "loop core accessed off the owning thread"
        );
        // Safety: confined to the owning thread; callers never hold two
        // overlapping borrows (each helper scopes its access).
        unsafe { &mut *self.core.get() }
    }

    // ── Main loop ────────────────────────────────────────────────────

    /// Run until [`quit`](Self::quit). Must be called on the owning
    /// thread.
    pub fn run(&self) {
        assert!(self.is_in_loop_thread(), "run() off the owning thread");
        self.running.store(true, Ordering::Release);

        // routines spawned before run() starts
        self.run_ready_routines();

        while !self.quit.load(Ordering::Acquire) {
            // submit anything pending before blocking, or the kernel
            // never sees the requests we are about to wait on
            {
                let core = self.core();
                let has_pending = !core.ring.submission().is_empty();
                if has_pending
                    && let Err(e) = core.ring.submit()
                    && e.raw_os_error() != Some(libc::EINTR)
                {
                    error!("io_uring submit failed: {e}");
                    break;
                }
            }

            match self.core().ring.submitter().submit_and_wait(1) {
                Ok(_) => {}
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => {
                    error!("io_uring submit_and_wait failed: {e}");
                    break;
                }
            }

            let count = {
                let core = self.core();
                core.cqe_batch.clear();
                for cqe in core.ring.completion() {
                    core.cqe_batch.push((cqe.user_data(), cqe.result()));
                }
                core.cqe_batch.len()
            };
            metrics::CQE_PROCESSED.add(count as u64);

            for i in 0..count {
                let (user_data, result) = self.core().cqe_batch[i];
                self.dispatch(user_data, result);
            }

            self.run_ready_routines();
            self.run_pending_tasks();
            self.run_ready_routines();
            self.prune_retired();
        }

        self.running.store(false, Ordering::Release);
    }

    /// Ask the loop to stop. Safe from any thread; wakes the loop if it
    /// is blocked waiting for completions.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    // ── Completion dispatch ──────────────────────────────────────────

    fn dispatch(&self, user_data: u64, result: i32) {
        if user_data == 0 {
            return;
        }
        // Safety: user_data is the address of a pinned IoContext. Owners
        // keep contexts alive while ops are in flight (connections via
        // the retired list, acceptor/loop for the rest).
        let ctx = unsafe { &*(user_data as *const IoContext) };

        if ctx.kind == OpKind::Wakeup {
            ctx.in_flight.set(false);
            self.post_wakeup_read();
            return;
        }

        // Late completion for a destroyed connection (cancelled linked
        // timeout, close races): drop it.
        if ctx.owner_gone() {
            return;
        }

        ctx.result.set(result);
        ctx.in_flight.set(false);

        if let Some(w) = ctx.take_waker() {
            w.wake();
            return;
        }
        let mut callback = ctx.callback.borrow_mut();
        if let Some(f) = callback.as_mut() {
            f(result);
        }
    }

    fn run_ready_routines(&self) {
        loop {
            {
                let core = self.core();
                waker::drain_ready_queue(&mut core.ready);
                if core.ready.is_empty() {
                    return;
                }
            }
            while let Some(id) = self.core().ready.pop_front() {
                let Some(mut fut) = self.core().tasks.take(id) else {
                    continue; // completed or already being polled
                };
                let task_waker = waker::task_waker(id);
                let mut cx = Context::from_waker(&task_waker);
                match fut.as_mut().poll(&mut cx) {
                    Poll::Pending => self.core().tasks.restore(id, fut),
                    Poll::Ready(()) => self.core().tasks.complete(id),
                }
            }
        }
    }

    fn run_pending_tasks(&self) {
        self.calling_pending.store(true, Ordering::Relaxed);
        let mut drained = 0;
        while drained < MAX_PENDING_DRAIN {
            match self.pending.pop() {
                Some(task) => {
                    task();
                    drained += 1;
                }
                None => break,
            }
        }
        self.calling_pending.store(false, Ordering::Relaxed);
    }

    fn prune_retired(&self) {
        let core = self.core();
        if !core.retired.is_empty() {
            core.retired.retain(|c| c.has_inflight());
        }
        if !core.retired_acceptors.is_empty() {
            core.retired_acceptors.retain(|a| a.accept_in_flight());
        }
    }

    /// Park a destroyed connection until its last in-flight op drains.
    pub(crate) fn retire(&self, conn: Arc<Connection>) {
        self.core().retired.push(conn);
    }

    /// Park a stopped acceptor until its cancelled accept drains.
    pub(crate) fn retire_acceptor(&self, acceptor: Arc<Acceptor>) {
        self.core().retired_acceptors.push(acceptor);
    }

    // ── Cross-thread dispatch ────────────────────────────────────────

    /// Run `f` inline when called on the owning thread, otherwise queue
    /// it.
    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Queue `f` for execution on the loop thread. When the ring is full
    /// the task is dropped and counted; watermark transitions fire the
    /// back-pressure callback.
    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        let size_before = self.pending.len();

        if self.pending.push(Box::new(f)).is_err() {
            self.queue_full_count.fetch_add(1, Ordering::Relaxed);
            metrics::TASKS_DROPPED.increment();
            if self.opts.enable_queue_full_stats {
                warn!(
                    size = size_before,
                    capacity = self.pending.capacity(),
                    dropped = self.queue_full_count.load(Ordering::Relaxed),
                    "pending task ring full, task dropped"
                );
            }
            return;
        }

        self.peak_queue_size
            .fetch_max(size_before + 1, Ordering::Relaxed);

        let is_high = size_before >= self.opts.pending_queue_high_mark;
        let was_high = self.in_high_mark.load(Ordering::Relaxed);
        if is_high && !was_high {
            self.in_high_mark.store(true, Ordering::Relaxed);
            self.high_mark_events.fetch_add(1, Ordering::Relaxed);
            metrics::QUEUE_HIGH_MARK_EVENTS.increment();
            warn!(
                size = size_before,
                threshold = self.opts.pending_queue_high_mark,
                "task ring entering high watermark"
            );
            if let Some(cb) = self.backpressure_cb.lock().unwrap().clone() {
                cb(true);
            }
        } else if !is_high && was_high && size_before <= self.opts.pending_queue_low_mark {
            self.in_high_mark.store(false, Ordering::Relaxed);
            self.low_mark_events.fetch_add(1, Ordering::Relaxed);
            metrics::QUEUE_LOW_MARK_EVENTS.increment();
            debug!(
                size = size_before,
                threshold = self.opts.pending_queue_low_mark,
                "task ring back below low watermark"
            );
            if let Some(cb) = self.backpressure_cb.lock().unwrap().clone() {
                cb(false);
            }
        }

        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Relaxed) {
            self.wakeup();
        }
    }

    /// Pull the loop out of its blocking wait.
    pub(crate) fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wakeup_fd,
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n != 8 {
            error!(
                "eventfd wakeup write failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }

    /// Register the callback fired on watermark transitions.
    pub fn set_backpressure_callback(&self, cb: BackpressureCallback) {
        *self.backpressure_cb.lock().unwrap() = Some(cb);
    }

    pub fn backpressure_stats(&self) -> BackpressureStats {
        BackpressureStats {
            queue_full_count: self.queue_full_count.load(Ordering::Relaxed),
            high_mark_events: self.high_mark_events.load(Ordering::Relaxed),
            low_mark_events: self.low_mark_events.load(Ordering::Relaxed),
            peak_queue_size: self.peak_queue_size.load(Ordering::Relaxed),
        }
    }

    pub fn reset_backpressure_stats(&self) {
        self.queue_full_count.store(0, Ordering::Relaxed);
        self.high_mark_events.store(0, Ordering::Relaxed);
        self.low_mark_events.store(0, Ordering::Relaxed);
        self.peak_queue_size.store(0, Ordering::Relaxed);
    }

    // ── Routines ─────────────────────────────────────────────────────

    /// Spawn a suspendable routine on this loop. Must be called on the
    /// owning thread (connection callbacks already run there).
    pub fn spawn(&self, fut: impl Future<Output = ()> + 'static) {
        assert!(
            self.is_in_loop_thread(),
            "spawn must be called on the loop thread"
        );
        let id = self.core().tasks.insert(Box::pin(fut));
        waker::push_ready(id);
    }

    // ── Fixed buffer pool ────────────────────────────────────────────

    /// Allocate and register the fixed buffer pool. Runs on the owning
    /// thread; a no-op if already initialized.
    pub fn init_registered_buffers(&self) -> Result<(), Error> {
        assert!(self.is_in_loop_thread());
        let core = self.core();
        if core.buffers.is_some() {
            return Ok(());
        }
        let pool = FixedBufferPool::new(
            self.opts.registered_buffers_count,
            self.opts.registered_buffers_size,
        );
        // Safety: the iovecs point at pool allocations that live until
        // the loop (and therefore the ring) is dropped.
        unsafe {
            core.ring
                .submitter()
                .register_buffers(pool.iovecs())
                .map_err(|e| Error::BufferRegistration(e.to_string()))?;
        }
        core.buffers = Some(pool);
        Ok(())
    }

    pub(crate) fn acquire_buffer(&self) -> i32 {
        match self.core().buffers.as_mut() {
            Some(pool) => pool.acquire(),
            None => -1,
        }
    }

    pub(crate) fn release_buffer(&self, idx: i32) {
        if idx < 0 {
            return;
        }
        if let Some(pool) = self.core().buffers.as_mut() {
            pool.release(idx);
        }
    }

    pub(crate) fn buffer_ptr(&self, idx: i32) -> *mut u8 {
        self.core()
            .buffers
            .as_ref()
            .expect("fixed buffer pool not initialized")
            .ptr(idx)
    }

    pub(crate) fn registered_buffer_size(&self) -> usize {
        self.core()
            .buffers
            .as_ref()
            .map(|p| p.buf_size())
            .unwrap_or(0)
    }

    // ── SQE submission ───────────────────────────────────────────────

    /// Push one SQE, flushing the queue once if it is full. Returns
    /// false when no slot could be made available; the op is dropped at
    /// the op layer.
    pub(crate) fn push_entry(&self, entry: squeue::Entry) -> bool {
        let core = self.core();
        // Safety: callers guarantee the SQE's referenced memory stays
        // valid for the lifetime of the operation.
        unsafe {
            if core.ring.submission().push(&entry).is_err() {
                let _ = core.ring.submit();
                if core.ring.submission().push(&entry).is_err() {
                    metrics::SQE_SUBMIT_FAILURES.increment();
                    error!("submission queue still full after flush");
                    return false;
                }
            }
        }
        true
    }

    /// Push `first` linked to `second` (IOSQE_IO_LINK on the first) as
    /// one contiguous pair. Used for read + link-timeout co-submission.
    pub(crate) fn push_linked_pair(&self, first: squeue::Entry, second: squeue::Entry) -> bool {
        let entries = [first.flags(squeue::Flags::IO_LINK), second];
        let core = self.core();
        {
            let sq = core.ring.submission();
            if sq.capacity() - sq.len() < 2 {
                drop(sq);
                let _ = core.ring.submit();
            }
        }
        // Safety: as for push_entry; push_multiple keeps the pair
        // contiguous so the kernel sees the link.
        unsafe {
            if core.ring.submission().push_multiple(&entries).is_err() {
                metrics::SQE_SUBMIT_FAILURES.increment();
                error!("submission queue too full for linked pair");
                return false;
            }
        }
        true
    }

    /// Submit an async cancel for a previously submitted op.
    pub(crate) fn push_cancel(&self, target_user_data: u64) {
        let entry = opcode::AsyncCancel::new(target_user_data)
            .build()
            .user_data(0);
        self.push_entry(entry);
    }

    fn post_wakeup_read(&self) {
        let entry = {
            let core = self.core();
            let buf = &mut *core.wakeup_buf as *mut u64 as *mut u8;
            core.wakeup_ctx.in_flight.set(true);
            opcode::Read::new(Fd(self.wakeup_fd), buf, 8)
                .build()
                .user_data(core.wakeup_ctx.user_data())
        };
        if !self.push_entry(entry) {
            error!("failed to re-post wakeup read; cross-thread wakeups degraded");
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wakeup_fd);
        }
    }
}
