//! Read/write awaitables.
//!
//! These are the suspension points of a connection routine. The first
//! poll submits the op and parks the routine (the waker goes into the
//! I/O context); the completion loop stores the signed result and wakes
//! it; the next poll interprets the result and manages the buffer lease.
//!
//! At most one read and one write may be in flight per connection: a
//! primitive issued while its counterpart of the same kind is pending
//! resolves immediately to `-EBUSY`.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::connection::{ConnState, Connection, WriteStrategy};
use crate::metrics;

/// Awaitable returned by [`Connection::read`] / [`Connection::read_into`].
///
/// Resolves to the signed byte count. On a positive result the
/// connection's current-read-buffer triple is valid and the caller holds
/// the lease until [`Connection::release_current_read_buffer`]; on zero
/// (EOF) or a negative errno the triple is cleared and any fixed-buffer
/// lease has already been returned.
pub struct ReadFuture<'a> {
    conn: &'a Connection,
    nbytes: usize,
    user_buf: Option<&'a mut [u8]>,
    submitted: bool,
}

impl<'a> ReadFuture<'a> {
    pub(crate) fn pooled(conn: &'a Connection, nbytes: usize) -> Self {
        ReadFuture {
            conn,
            nbytes,
            user_buf: None,
            submitted: false,
        }
    }

    pub(crate) fn into_buffer(conn: &'a Connection, buf: &'a mut [u8], nbytes: usize) -> Self {
        ReadFuture {
            conn,
            nbytes,
            user_buf: Some(buf),
            submitted: false,
        }
    }
}

impl Future for ReadFuture<'_> {
    type Output = i32;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<i32> {
        let this = &mut *self;
        let ctx = &this.conn.read_ctx;

        if !this.submitted {
            if ctx.in_flight.get() {
                return Poll::Ready(-libc::EBUSY);
            }
            if !this.conn.is_connected() {
                return Poll::Ready(-libc::ENOTCONN);
            }
            ctx.set_waker(cx.waker().clone());
            let ok = match this.user_buf.as_mut() {
                Some(buf) => {
                    let cap = buf.len();
                    this.conn.submit_read_user(buf.as_mut_ptr(), cap, this.nbytes)
                }
                None => this.conn.submit_read(this.nbytes),
            };
            if !ok {
                ctx.take_waker();
                return Poll::Ready(-libc::EAGAIN);
            }
            this.submitted = true;
            return Poll::Pending;
        }

        if ctx.in_flight.get() {
            ctx.set_waker(cx.waker().clone());
            return Poll::Pending;
        }

        let n = ctx.result.get();
        let idx = ctx.buf_index.get();
        if n > 0 {
            metrics::BYTES_RECEIVED.add(n as u64);
            let ptr = if idx >= 0 {
                this.conn.owner_loop().buffer_ptr(idx)
            } else if let Some(buf) = this.user_buf.as_mut() {
                buf.as_mut_ptr()
            } else {
                this.conn.fallback_ptr()
            };
            this.conn.set_current_read(ptr, n as usize);
        } else {
            // failed or EOF: the lease goes straight back
            this.conn.clear_current_read();
            if idx >= 0 {
                ctx.buf_index.set(-1);
                this.conn.owner_loop().release_buffer(idx);
            }
        }
        Poll::Ready(n)
    }
}

pub(crate) enum WriteMode {
    /// Write the egress buffer's readable span.
    Egress,
    /// Zero-copy write from a registered buffer. The index stays owned
    /// by the caller (released with the read lease).
    Fixed {
        ptr: *const u8,
        len: usize,
        idx: i32,
    },
}

/// Awaitable returned by the write-side primitives.
///
/// Resolves to the signed byte count. Ordinary writes advance the egress
/// buffer by exactly the returned count: once at resume on the direct
/// path, incrementally inside the completion callback on the Block path.
pub struct WriteFuture<'a> {
    conn: &'a Connection,
    mode: WriteMode,
    submitted: bool,
    blocked: bool,
}

impl<'a> WriteFuture<'a> {
    pub(crate) fn new(conn: &'a Connection, mode: WriteMode) -> Self {
        WriteFuture {
            conn,
            mode,
            submitted: false,
            blocked: false,
        }
    }
}

impl Future for WriteFuture<'_> {
    type Output = i32;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<i32> {
        let this = &mut *self;
        let ctx = &this.conn.write_ctx;

        if !this.submitted {
            if ctx.in_flight.get() {
                return Poll::Ready(-libc::EBUSY);
            }
            if this.conn.state() == ConnState::Disconnected {
                return Poll::Ready(-libc::ENOTCONN);
            }
            let ok = match this.mode {
                WriteMode::Fixed { ptr, len, idx } => {
                    ctx.set_waker(cx.waker().clone());
                    this.conn.submit_write_fixed(ptr, len, idx)
                }
                WriteMode::Egress => {
                    let readable = this.conn.egress.borrow().readable();
                    if this.conn.write_strategy() == WriteStrategy::Block
                        && readable >= this.conn.egress_high_mark.get()
                    {
                        // deep egress: park behind the re-entrant
                        // callback until it drains to the low mark
                        this.blocked = true;
                        *this.conn.blocked_write_waker.borrow_mut() = Some(cx.waker().clone());
                        this.conn.install_block_write_callback();
                        this.conn.submit_write()
                    } else {
                        ctx.set_waker(cx.waker().clone());
                        ctx.clear_callback();
                        this.conn.submit_write()
                    }
                }
            };
            if !ok {
                ctx.take_waker();
                if this.blocked {
                    this.conn.blocked_write_waker.borrow_mut().take();
                    ctx.clear_callback();
                }
                return Poll::Ready(-libc::EAGAIN);
            }
            this.submitted = true;
            return Poll::Pending;
        }

        if ctx.in_flight.get() {
            if this.blocked {
                *this.conn.blocked_write_waker.borrow_mut() = Some(cx.waker().clone());
            } else {
                ctx.set_waker(cx.waker().clone());
            }
            return Poll::Pending;
        }

        let n = ctx.result.get();
        if this.blocked {
            // the callback advanced the egress buffer as completions
            // arrived; clearing it here (never inside the callback)
            // keeps the running closure alive while it executes
            ctx.clear_callback();
        } else if matches!(this.mode, WriteMode::Egress) && n > 0 {
            this.conn.egress.borrow_mut().retrieve(n as usize);
        }
        if n > 0 {
            metrics::BYTES_SENT.add(n as u64);
        }
        Poll::Ready(n)
    }
}
