//! Server facade: wires the acceptor, the loop pool, and the connection
//! table.
//!
//! Connections are keyed by a generated name, `"<server>-<ip:port>#<id>"`.
//! The table is owned by the main loop; removal hops main → worker →
//! main so each structure is only mutated on its owning thread.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::info;

use crate::acceptor::Acceptor;
use crate::config::LoopOptions;
use crate::connection::{Connection, ConnectionCallback};
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::loop_pool::EventLoopPool;

pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    main_loop: Arc<EventLoop>,
    name: String,
    ip_port: String,
    acceptor: Arc<Acceptor>,
    pool: Mutex<EventLoopPool>,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    read_timeout_ms: AtomicU64,
    next_conn_id: AtomicU64,
    started: AtomicBool,
}

impl Server {
    /// Create a server listening on `listen_addr`, accepting on
    /// `main_loop`. The socket is bound here; listening starts with
    /// [`start`](Self::start).
    pub fn new(
        main_loop: Arc<EventLoop>,
        listen_addr: SocketAddr,
        name: impl Into<String>,
    ) -> Result<Server, Error> {
        let acceptor = Acceptor::new(main_loop.clone(), listen_addr, true)?;
        let ip_port = acceptor
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| listen_addr.to_string());

        Ok(Server {
            inner: Arc::new(ServerInner {
                pool: Mutex::new(EventLoopPool::new(main_loop.clone())),
                main_loop,
                name: name.into(),
                ip_port,
                acceptor,
                connections: Mutex::new(HashMap::new()),
                connection_cb: Mutex::new(None),
                read_timeout_ms: AtomicU64::new(0),
                next_conn_id: AtomicU64::new(1),
                started: AtomicBool::new(false),
            }),
        })
    }

    /// The bound address; resolves a configured port 0 to the real one.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.inner.acceptor.local_addr().ok()
    }

    pub fn main_loop(&self) -> &Arc<EventLoop> {
        &self.inner.main_loop
    }

    /// Number of worker loops. 0 keeps connections on the main loop.
    pub fn set_thread_num(&self, num_threads: usize) {
        self.inner.pool.lock().unwrap().set_thread_num(num_threads);
    }

    /// Options for every worker loop.
    pub fn set_event_loop_options(&self, opts: LoopOptions) {
        self.inner.pool.lock().unwrap().set_loop_options(opts);
    }

    /// Callback invoked (on the owning loop) for each new connection;
    /// typically spawns the per-connection routine.
    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.inner.connection_cb.lock().unwrap() = Some(cb);
    }

    /// Per-read idle deadline applied to new connections; zero disables.
    pub fn set_read_timeout(&self, timeout: Duration) {
        self.inner
            .read_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Start the worker loops and begin accepting.
    pub fn start(&self) -> Result<(), Error> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStarted);
        }

        {
            let mut pool = self.inner.pool.lock().unwrap();
            pool.start()?;
            if pool.thread_num() == 0 {
                // the main loop hosts connections itself
                let main_loop = self.inner.main_loop.clone();
                self.inner.main_loop.run_in_loop(move || {
                    if let Err(e) = main_loop.init_registered_buffers() {
                        tracing::error!("fixed buffer registration failed: {e}");
                    }
                });
            }
        }

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .acceptor
            .set_new_connection_callback(Box::new(move |fd, peer_addr| {
                match weak.upgrade() {
                    Some(inner) => ServerInner::new_connection(&inner, fd, peer_addr),
                    None => unsafe {
                        libc::close(fd);
                    },
                }
            }));

        let acceptor = self.inner.acceptor.clone();
        self.inner.main_loop.run_in_loop(move || acceptor.listen());

        info!(name = %self.inner.name, addr = %self.inner.ip_port, "server started");
        Ok(())
    }

    /// Stop accepting, close remaining connections, and quit the worker
    /// loops. The main loop keeps running; quit it separately.
    pub fn stop(&self) {
        let acceptor = self.inner.acceptor.clone();
        self.inner.main_loop.run_in_loop(move || acceptor.stop());

        let connections: Vec<_> = self
            .inner
            .connections
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for conn in connections {
            Connection::force_close(&conn);
        }

        self.inner.pool.lock().unwrap().stop();
        info!(name = %self.inner.name, "server stopped");
    }

    /// Connections currently in the table.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().unwrap().len()
    }
}

impl ServerInner {
    /// Runs on the main loop, from the accept completion.
    fn new_connection(inner: &Arc<ServerInner>, fd: RawFd, peer_addr: SocketAddr) {
        let io_loop = inner.pool.lock().unwrap().next_loop();

        let id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}#{}", inner.name, inner.ip_port, id);

        let conn = Connection::new(name.clone(), io_loop.clone(), fd, peer_addr);

        if let Some(cb) = inner.connection_cb.lock().unwrap().clone() {
            conn.set_connection_callback(cb);
        }
        let weak: Weak<ServerInner> = Arc::downgrade(inner);
        conn.set_close_callback(Arc::new(move |c| {
            if let Some(inner) = weak.upgrade() {
                ServerInner::remove_connection(&inner, c);
            }
        }));

        let timeout_ms = inner.read_timeout_ms.load(Ordering::Relaxed);
        if timeout_ms > 0 {
            conn.set_read_timeout(Duration::from_millis(timeout_ms));
        }

        inner
            .connections
            .lock()
            .unwrap()
            .insert(name, conn.clone());

        io_loop.run_in_loop(move || Connection::connect_established(&conn));
    }

    /// Erase from the table on the main loop, then destroy on the
    /// connection's own loop.
    fn remove_connection(inner: &Arc<ServerInner>, conn: &Arc<Connection>) {
        let inner = inner.clone();
        let conn = conn.clone();
        let main_loop = inner.main_loop.clone();
        main_loop.run_in_loop(move || {
            inner.connections.lock().unwrap().remove(conn.name());
            let io_loop = conn.owner_loop().clone();
            io_loop.queue_in_loop(move || Connection::connect_destroyed(&conn));
        });
    }
}
