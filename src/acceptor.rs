//! Listening socket and the continuously re-posted accept op.
//!
//! The acceptor lives on the main loop. One accept SQE is outstanding at
//! any time; its completion hands the new fd to the server facade and
//! immediately re-posts while listening remains enabled. `-ECANCELED`
//! during shutdown is silent.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};

use io_uring::opcode;
use io_uring::types::Fd;
use tracing::{error, info};

use crate::context::{IoContext, OpKind};
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::socket::{Socket, bind_listener, sockaddr_to_socket_addr};

/// Handed each accepted fd together with the peer address.
pub(crate) type NewConnectionCallback = Box<dyn Fn(RawFd, SocketAddr) + Send>;

pub struct Acceptor {
    main_loop: Arc<EventLoop>,
    sock: Socket,
    self_weak: Weak<Acceptor>,
    listening: Cell<bool>,
    ctx: IoContext,
    /// Reusable peer-address buffer for the accept op. Reset before each
    /// re-post because the kernel shrinks the length to what it wrote.
    peer_storage: UnsafeCell<libc::sockaddr_storage>,
    peer_len: UnsafeCell<libc::socklen_t>,
    on_new_connection: RefCell<Option<NewConnectionCallback>>,
}

// Safety: everything mutable is confined to the main loop's thread; the
// callback is installed before listen() posts the first accept.
unsafe impl Send for Acceptor {}
unsafe impl Sync for Acceptor {}

impl Acceptor {
    /// Bind a non-blocking CLOEXEC listener with SO_REUSEADDR (and
    /// optionally SO_REUSEPORT). Listening starts with [`listen`].
    pub fn new(
        main_loop: Arc<EventLoop>,
        listen_addr: SocketAddr,
        reuseport: bool,
    ) -> Result<Arc<Acceptor>, Error> {
        let fd = bind_listener(listen_addr, reuseport)?;
        let sock = Socket::from_fd(fd);

        Ok(Arc::new_cyclic(|self_weak| Acceptor {
            main_loop,
            self_weak: self_weak.clone(),
            listening: Cell::new(false),
            ctx: IoContext::new(OpKind::Accept, fd),
            peer_storage: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            peer_len: UnsafeCell::new(
                std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t
            ),
            on_new_connection: RefCell::new(None),
            sock,
        }))
    }

    /// The bound address (resolves port 0 to the actual port).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    pub(crate) fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.on_new_connection.borrow_mut() = Some(cb);
    }

    /// Start listening and post the first accept. Runs on the main loop.
    pub(crate) fn listen(&self) {
        debug_assert!(self.main_loop.is_in_loop_thread());
        if self.listening.replace(true) {
            return;
        }
        let ret = unsafe { libc::listen(self.sock.fd(), libc::SOMAXCONN) };
        if ret < 0 {
            error!("listen failed: {}", io::Error::last_os_error());
            self.listening.set(false);
            return;
        }

        let weak = self.self_weak.clone();
        self.ctx.set_callback(Box::new(move |res| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_accept(res);
            }
        }));

        info!(addr = ?self.local_addr().ok(), "listening");
        self.post_accept();
    }

    /// Stop listening and cancel the outstanding accept. Runs on the
    /// main loop; the listening fd closes when the acceptor drops.
    pub(crate) fn stop(&self) {
        debug_assert!(self.main_loop.is_in_loop_thread());
        if !self.listening.replace(false) {
            return;
        }
        if self.ctx.in_flight.get() {
            self.main_loop.push_cancel(self.ctx.user_data());
            // the accept context must stay valid until its CQE drains
            if let Some(acceptor) = self.self_weak.upgrade() {
                self.main_loop.retire_acceptor(acceptor);
            }
        }
    }

    pub(crate) fn accept_in_flight(&self) -> bool {
        self.ctx.in_flight.get()
    }

    fn handle_accept(&self, res: i32) {
        if res >= 0 {
            let peer_addr = unsafe {
                sockaddr_to_socket_addr(&*self.peer_storage.get(), *self.peer_len.get())
            }
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));

            let cb = self.on_new_connection.borrow();
            match cb.as_ref() {
                Some(cb) => cb(res, peer_addr),
                None => unsafe {
                    libc::close(res);
                },
            }
        } else if res != -libc::ECANCELED {
            error!("accept failed: {}", io::Error::from_raw_os_error(-res));
        }

        if self.listening.get() {
            unsafe {
                *self.peer_len.get() =
                    std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            }
            self.post_accept();
        }
    }

    fn post_accept(&self) {
        let entry = opcode::Accept::new(
            Fd(self.sock.fd()),
            self.peer_storage.get() as *mut libc::sockaddr,
            self.peer_len.get(),
        )
        .flags(libc::SOCK_CLOEXEC)
        .build()
        .user_data(self.ctx.user_data());

        if self.main_loop.push_entry(entry) {
            self.ctx.in_flight.set(true);
        } else {
            error!("failed to post accept; no further connections will be accepted");
        }
    }
}
