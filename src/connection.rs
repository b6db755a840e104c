//! Per-connection state and I/O submission.
//!
//! A connection is bound to the loop chosen at accept time for its entire
//! lifetime; every non-atomic field is only touched on that loop's
//! thread. The connection is shared (`Arc`) between the server's table
//! and the running routine, and its three embedded [`IoContext`]s are the
//! user_data targets for every SQE it submits — the `Arc` pins their
//! addresses for as long as any op is in flight.
//!
//! State machine:
//!
//! ```text
//! Connecting ── connect_established ──► Connected
//! Connected ── shutdown() ────────────► Disconnecting (half-close write)
//! Connected ── force_close() ─────────► Disconnecting (queued handle_close)
//! Disconnecting ── connect_destroyed ─► Disconnected
//! ```

use std::cell::{Cell, RefCell, UnsafeCell};
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::task::Waker;
use std::time::Duration;

use io_uring::types::{Fd, Timespec};
use io_uring::opcode;
use tracing::{debug, warn};

use crate::buffer::egress::EgressBuffer;
use crate::context::{IoContext, OpKind};
use crate::event_loop::EventLoop;
use crate::metrics;
use crate::runtime::io::{ReadFuture, WriteFuture, WriteMode};
use crate::socket::Socket;

/// Invoked on the owning loop once a connection reaches Connected.
pub type ConnectionCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
/// Invoked on the owning loop, at most once, when a connection closes.
pub type CloseCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> ConnState {
        match v {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

/// Policy applied when a routine writes while the egress buffer is
/// already deep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStrategy {
    /// Resume the routine after the first completion.
    Direct,
    /// Keep re-submitting inside a completion callback until the egress
    /// buffer drains to the low watermark, then resume once with the
    /// accumulated byte count.
    Block,
}

const DEFAULT_EGRESS_HIGH_MARK: usize = 1024 * 1024;
const DEFAULT_EGRESS_LOW_MARK: usize = 256 * 1024;

pub struct Connection {
    name: String,
    owner: Arc<EventLoop>,
    /// Back-reference to the owning `Arc`, for callbacks that must
    /// outlive a borrow (Block write, timeouts).
    self_weak: Weak<Connection>,
    sock: Socket,
    state: AtomicU8,
    /// Latch ensuring the user close callback runs at most once.
    close_latch: AtomicBool,

    pub(crate) read_ctx: IoContext,
    pub(crate) write_ctx: IoContext,
    pub(crate) timeout_ctx: IoContext,

    read_timeout: Cell<Duration>,
    /// Kernel timespec for the linked read timeout; address handed to
    /// the kernel, so it lives inside the pinned connection.
    timeout_spec: UnsafeCell<Timespec>,

    // current read buffer triple: where the last successful read landed
    cur_read_ptr: Cell<*mut u8>,
    cur_read_len: Cell<usize>,
    cur_read_off: Cell<usize>,
    /// Heap buffer reads fall back to when the fixed pool is exhausted.
    fallback_buf: RefCell<Vec<u8>>,

    pub(crate) egress: RefCell<EgressBuffer>,
    write_strategy: Cell<WriteStrategy>,
    pub(crate) egress_high_mark: Cell<usize>,
    pub(crate) egress_low_mark: Cell<usize>,
    /// Resumption handle for a routine parked in a Block-strategy write.
    /// Lives outside the write context so dispatch keeps invoking the
    /// re-entrant callback instead of waking the routine early.
    pub(crate) blocked_write_waker: RefCell<Option<Waker>>,

    local_addr: SocketAddr,
    peer_addr: SocketAddr,

    on_connection: RefCell<Option<ConnectionCallback>>,
    on_close: RefCell<Option<CloseCallback>>,
}

// Safety: atomics aside, all fields are confined to the owning loop's
// thread; `force_close`/`quit`-style cross-thread entry points only touch
// atomics and hop to that thread via the task ring.
unsafe impl Send for Connection {}
unsafe impl Sync for Connection {}

impl Connection {
    pub(crate) fn new(
        name: String,
        owner: Arc<EventLoop>,
        fd: RawFd,
        peer_addr: SocketAddr,
    ) -> Arc<Connection> {
        let sock = Socket::from_fd(fd);
        sock.set_nodelay(true);
        let local_addr = sock
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));

        Arc::new_cyclic(|self_weak| Connection {
            name,
            owner,
            self_weak: self_weak.clone(),
            state: AtomicU8::new(ConnState::Connecting as u8),
            close_latch: AtomicBool::new(false),
            read_ctx: IoContext::new(OpKind::Read, fd),
            write_ctx: IoContext::new(OpKind::Write, fd),
            timeout_ctx: IoContext::new(OpKind::LinkTimeout, fd),
            read_timeout: Cell::new(Duration::ZERO),
            timeout_spec: UnsafeCell::new(Timespec::new()),
            cur_read_ptr: Cell::new(std::ptr::null_mut()),
            cur_read_len: Cell::new(0),
            cur_read_off: Cell::new(0),
            fallback_buf: RefCell::new(Vec::new()),
            egress: RefCell::new(EgressBuffer::new()),
            write_strategy: Cell::new(WriteStrategy::Direct),
            egress_high_mark: Cell::new(DEFAULT_EGRESS_HIGH_MARK),
            egress_low_mark: Cell::new(DEFAULT_EGRESS_LOW_MARK),
            blocked_write_waker: RefCell::new(None),
            local_addr,
            peer_addr,
            on_connection: RefCell::new(None),
            on_close: RefCell::new(None),
            sock,
        })
    }

    // ── Identity ─────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The loop this connection is bound to.
    pub fn owner_loop(&self) -> &Arc<EventLoop> {
        &self.owner
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.sock.fd()
    }

    // ── State ────────────────────────────────────────────────────────

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn is_disconnecting(&self) -> bool {
        self.state() == ConnState::Disconnecting
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn cas_state(&self, from: ConnState, to: ConnState) -> bool {
        self.state
            .compare_exchange(
                from as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    // ── Configuration ────────────────────────────────────────────────

    pub(crate) fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.on_connection.borrow_mut() = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.on_close.borrow_mut() = Some(cb);
    }

    /// Arm the per-read idle deadline; `Duration::ZERO` disables it.
    pub fn set_read_timeout(&self, timeout: Duration) {
        self.read_timeout.set(timeout);
        let spec = Timespec::new()
            .sec(timeout.as_secs())
            .nsec(timeout.subsec_nanos());
        unsafe {
            *self.timeout_spec.get() = spec;
        }
    }

    pub fn set_write_strategy(&self, strategy: WriteStrategy) {
        self.write_strategy.set(strategy);
    }

    pub(crate) fn write_strategy(&self) -> WriteStrategy {
        self.write_strategy.get()
    }

    /// Egress watermarks consulted by the Block write strategy. The low
    /// mark is forced strictly below the high mark.
    pub fn set_write_watermarks(&self, high: usize, low: usize) {
        let high = high.max(1);
        self.egress_high_mark.set(high);
        self.egress_low_mark.set(low.min(high - 1));
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Transition to Connected, wire the weak owner references into the
    /// I/O contexts, and invoke the user connection callback. Runs on
    /// the owning loop.
    pub fn connect_established(self: &Arc<Self>) {
        debug_assert!(self.owner.is_in_loop_thread());
        self.set_state(ConnState::Connected);

        self.read_ctx.bind_owner(self);
        self.write_ctx.bind_owner(self);
        self.timeout_ctx.bind_owner(self);

        // The linked timeout fires with -ETIME on idle reads and
        // -ECANCELED when the read won the race.
        let weak = Arc::downgrade(self);
        self.timeout_ctx.set_callback(Box::new(move |res| {
            if res == -libc::ECANCELED {
                return;
            }
            if let Some(conn) = weak.upgrade()
                && conn.is_connected()
            {
                metrics::READ_TIMEOUTS.increment();
                warn!(name = %conn.name(), "read timed out, closing connection");
                Connection::force_close(&conn);
            }
        }));

        metrics::CONNECTIONS_ACCEPTED.increment();
        metrics::CONNECTIONS_ACTIVE.increment();
        debug!(name = %self.name, peer = %self.peer_addr, "connection established");

        let cb = self.on_connection.borrow().clone();
        if let Some(cb) = cb {
            cb(self);
        }
    }

    /// Half-close the write side. Further reads still complete.
    pub fn shutdown(&self) {
        if self.cas_state(ConnState::Connected, ConnState::Disconnecting) {
            self.sock.shutdown_write();
        }
    }

    /// Close the connection. Idempotent and safe from any thread: only
    /// the first transition out of Connected enqueues `handle_close` on
    /// the owning loop.
    pub fn force_close(self: &Arc<Self>) {
        if self.cas_state(ConnState::Connected, ConnState::Disconnecting) {
            let conn = Arc::clone(self);
            self.owner
                .queue_in_loop(move || Connection::handle_close(&conn));
        }
    }

    /// Run the user close callback, at most once per connection. Runs on
    /// the owning loop.
    pub(crate) fn handle_close(self: &Arc<Self>) {
        debug_assert!(self.owner.is_in_loop_thread());
        if self.state() == ConnState::Disconnected {
            return;
        }
        self.set_state(ConnState::Disconnecting);
        if self.close_latch.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(name = %self.name, "connection closing");
        let cb = self.on_close.borrow().clone();
        if let Some(cb) = cb {
            cb(self);
        }
    }

    /// Final teardown on the owning loop: transition to Disconnected,
    /// cancel outstanding ops, and return any held buffer lease. The fd
    /// closes when the last `Arc` drops the socket; late completions are
    /// swallowed by the dispatch owner check.
    pub fn connect_destroyed(self: &Arc<Self>) {
        debug_assert!(self.owner.is_in_loop_thread());
        let state = self.state();
        if state == ConnState::Connected || state == ConnState::Disconnecting {
            self.set_state(ConnState::Disconnected);
        }
        self.close_latch.store(true, Ordering::Release);

        // Cancel in-flight ops so suspended routines resume with
        // -ECANCELED and release their Arc.
        if self.read_ctx.in_flight.get() {
            self.owner.push_cancel(self.read_ctx.user_data());
        }
        if self.write_ctx.in_flight.get() {
            self.owner.push_cancel(self.write_ctx.user_data());
        }
        if self.timeout_ctx.in_flight.get() {
            self.owner.push_cancel(self.timeout_ctx.user_data());
        }

        // A completed read's lease comes back here; an in-flight one is
        // released by the routine's resume path.
        if !self.read_ctx.in_flight.get() {
            self.release_current_read_buffer();
        }

        metrics::CONNECTIONS_CLOSED.increment();
        metrics::CONNECTIONS_ACTIVE.decrement();
        debug!(name = %self.name, "connection destroyed");

        // Contexts referenced by the kernel must outlive their CQEs.
        if self.has_inflight() {
            self.owner.retire(Arc::clone(self));
        }
    }

    pub(crate) fn has_inflight(&self) -> bool {
        self.read_ctx.in_flight.get()
            || self.write_ctx.in_flight.get()
            || self.timeout_ctx.in_flight.get()
    }

    // ── Read-side buffer lease ───────────────────────────────────────

    pub(crate) fn set_current_read(&self, ptr: *mut u8, len: usize) {
        self.cur_read_ptr.set(ptr);
        self.cur_read_len.set(len);
        self.cur_read_off.set(0);
    }

    pub(crate) fn fallback_ptr(&self) -> *mut u8 {
        self.fallback_buf.borrow_mut().as_mut_ptr()
    }

    pub(crate) fn clear_current_read(&self) {
        self.cur_read_ptr.set(std::ptr::null_mut());
        self.cur_read_len.set(0);
        self.cur_read_off.set(0);
    }

    /// Bytes delivered by the last successful read.
    ///
    /// Valid until [`release_current_read_buffer`] or the next read;
    /// callers must not hold the slice across either.
    pub fn data_from_buffer(&self) -> &[u8] {
        let ptr = self.cur_read_ptr.get();
        let len = self.cur_read_len.get();
        if ptr.is_null() || len == 0 {
            return &[];
        }
        let off = self.cur_read_off.get().min(len);
        // Safety: the triple points into the leased fixed buffer, the
        // fallback buffer, or a caller-supplied region, all valid while
        // the lease is held on this thread.
        unsafe { std::slice::from_raw_parts(ptr.add(off), len - off) }
    }

    /// Return the read-buffer lease. Idempotent: a lease already
    /// returned at completion time makes this a no-op.
    pub fn release_current_read_buffer(&self) {
        let idx = self.read_ctx.buf_index.replace(-1);
        if idx >= 0 {
            self.owner.release_buffer(idx);
        }
        self.clear_current_read();
    }

    /// Borrow the egress buffer, e.g. to prepend a protocol header.
    /// Must not be held across a suspension point.
    pub fn egress_buffer(&self) -> std::cell::RefMut<'_, EgressBuffer> {
        self.egress.borrow_mut()
    }

    // ── Suspendable primitives ───────────────────────────────────────

    /// Read up to `nbytes`, preferring a kernel-registered buffer.
    /// Resolves to the signed byte count; on `> 0` the connection holds
    /// the read-buffer lease until [`release_current_read_buffer`].
    pub fn read(&self, nbytes: usize) -> ReadFuture<'_> {
        ReadFuture::pooled(self, nbytes)
    }

    /// Read up to `nbytes` into a caller-supplied buffer (index −1).
    pub fn read_into<'a>(&'a self, buf: &'a mut [u8], nbytes: usize) -> ReadFuture<'a> {
        ReadFuture::into_buffer(self, buf, nbytes)
    }

    /// Write the egress buffer's readable bytes. Resolves to the signed
    /// byte count; under [`WriteStrategy::Block`] the result is the
    /// total accumulated across re-submissions.
    pub fn write(&self) -> WriteFuture<'_> {
        WriteFuture::new(self, WriteMode::Egress)
    }

    /// Zero-copy write of `len` bytes from registered buffer `idx`.
    pub fn write_fixed(&self, idx: i32, len: usize) -> WriteFuture<'_> {
        let ptr = if idx >= 0 {
            self.owner.buffer_ptr(idx) as *const u8
        } else {
            std::ptr::null()
        };
        WriteFuture::new(self, WriteMode::Fixed { ptr, len, idx })
    }

    /// Append `data` to the egress buffer and write it out.
    pub fn send(&self, data: &[u8]) -> WriteFuture<'_> {
        self.egress.borrow_mut().append(data);
        self.write()
    }

    /// Echo the current read buffer back without copying. Requires the
    /// read to have landed in a fixed buffer; falls back to an egress
    /// copy otherwise.
    pub fn send_zero_copy(&self) -> WriteFuture<'_> {
        let idx = self.read_ctx.buf_index.get();
        if idx >= 0 {
            let ptr = self.cur_read_ptr.get() as *const u8;
            let len = self.cur_read_len.get();
            WriteFuture::new(self, WriteMode::Fixed { ptr, len, idx })
        } else {
            let data = self.data_from_buffer().to_vec();
            self.send(&data)
        }
    }

    // ── SQE submission ───────────────────────────────────────────────

    /// Submit a read, leasing a fixed buffer when one is free and
    /// falling back to the per-connection heap buffer otherwise.
    pub(crate) fn submit_read(&self, nbytes: usize) -> bool {
        if !self.is_connected() {
            warn!(name = %self.name, "read submitted on non-connected state");
            return false;
        }
        let idx = self.owner.acquire_buffer();
        let entry = if idx >= 0 {
            let len = nbytes.min(self.owner.registered_buffer_size()) as u32;
            let ptr = self.owner.buffer_ptr(idx);
            self.read_ctx.buf_index.set(idx);
            opcode::ReadFixed::new(Fd(self.fd()), ptr, len, idx as u16)
                .build()
                .user_data(self.read_ctx.user_data())
        } else {
            let mut fallback = self.fallback_buf.borrow_mut();
            if fallback.len() < nbytes {
                fallback.resize(nbytes, 0);
            }
            self.read_ctx.buf_index.set(-1);
            opcode::Read::new(Fd(self.fd()), fallback.as_mut_ptr(), nbytes as u32)
                .build()
                .user_data(self.read_ctx.user_data())
        };
        self.push_read_entry(entry, idx)
    }

    /// Submit a read into a caller-supplied buffer.
    pub(crate) fn submit_read_user(&self, buf: *mut u8, cap: usize, nbytes: usize) -> bool {
        if !self.is_connected() {
            warn!(name = %self.name, "read submitted on non-connected state");
            return false;
        }
        if buf.is_null() || cap == 0 {
            return false;
        }
        self.read_ctx.buf_index.set(-1);
        let entry = opcode::Read::new(Fd(self.fd()), buf, cap.min(nbytes) as u32)
            .build()
            .user_data(self.read_ctx.user_data());
        self.push_read_entry(entry, -1)
    }

    fn push_read_entry(&self, entry: io_uring::squeue::Entry, leased_idx: i32) -> bool {
        let ok = if self.read_timeout.get() > Duration::ZERO {
            let timeout_entry = opcode::LinkTimeout::new(self.timeout_spec.get())
                .build()
                .user_data(self.timeout_ctx.user_data());
            let ok = self.owner.push_linked_pair(entry, timeout_entry);
            if ok {
                self.timeout_ctx.in_flight.set(true);
            }
            ok
        } else {
            self.owner.push_entry(entry)
        };

        if ok {
            self.read_ctx.in_flight.set(true);
        } else if leased_idx >= 0 {
            self.read_ctx.buf_index.set(-1);
            self.owner.release_buffer(leased_idx);
        }
        ok
    }

    /// Submit an ordinary write of the egress buffer's readable span.
    /// The egress buffer must not be appended to while the op is in
    /// flight; the suspended routine guarantees that.
    pub(crate) fn submit_write(&self) -> bool {
        if !self.is_connected() && !self.is_disconnecting() {
            warn!(name = %self.name, "write submitted on invalid state");
            return false;
        }
        let (ptr, len) = {
            let egress = self.egress.borrow();
            (egress.read_ptr(), egress.readable())
        };
        self.write_ctx.buf_index.set(-1);
        let entry = opcode::Write::new(Fd(self.fd()), ptr, len as u32)
            .build()
            .user_data(self.write_ctx.user_data());
        let ok = self.owner.push_entry(entry);
        if ok {
            self.write_ctx.in_flight.set(true);
        }
        ok
    }

    /// Submit a zero-copy write from a registered buffer. The index
    /// stays owned by the caller; the read lease release returns it.
    pub(crate) fn submit_write_fixed(&self, ptr: *const u8, len: usize, idx: i32) -> bool {
        if !self.is_connected() && !self.is_disconnecting() {
            warn!(name = %self.name, "write submitted on invalid state");
            return false;
        }
        if ptr.is_null() || idx < 0 {
            return false;
        }
        self.write_ctx.buf_index.set(idx);
        let entry = opcode::WriteFixed::new(Fd(self.fd()), ptr, len as u32, idx as u16)
            .build()
            .user_data(self.write_ctx.user_data());
        let ok = self.owner.push_entry(entry);
        if ok {
            self.write_ctx.in_flight.set(true);
        }
        ok
    }

    /// Install the re-entrant completion callback for a Block-strategy
    /// write. Advances the egress buffer and re-submits until it drains
    /// to the low watermark (or the write fails), then stores the
    /// accumulated total and wakes the parked routine. The routine — not
    /// the callback — clears the callback slot after resuming.
    pub(crate) fn install_block_write_callback(&self) {
        let weak = self.self_weak.clone();
        let mut accumulated: i32 = 0;
        self.write_ctx.set_callback(Box::new(move |res| {
            let Some(conn) = weak.upgrade() else {
                return;
            };
            if res > 0 {
                conn.egress.borrow_mut().retrieve(res as usize);
                accumulated = accumulated.saturating_add(res);
                let readable = conn.egress.borrow().readable();
                if readable > conn.egress_low_mark.get() && conn.submit_write() {
                    return; // keep draining before resuming
                }
                conn.write_ctx.result.set(accumulated);
            } else {
                conn.write_ctx.result.set(if accumulated > 0 { accumulated } else { res });
            }
            conn.write_ctx.in_flight.set(false);
            if let Some(waker) = conn.blocked_write_waker.borrow_mut().take() {
                waker.wake();
            }
        }));
    }
}
