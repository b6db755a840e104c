//! ringnet — multi-reactor io_uring TCP server runtime for Linux.
//!
//! One event loop per thread, each owning its own io_uring instance.
//! Application code is written as suspendable linear routines
//! (`read → process → write`) instead of callback chains; the engine
//! batches submissions, reuses kernel-registered buffers, and spreads
//! connections across worker loops at accept time.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ringnet::{Connection, EventLoop, LoopOptions, Server};
//!
//! fn main() -> Result<(), ringnet::Error> {
//!     let main_loop = EventLoop::new(LoopOptions::default())?;
//!
//!     let server = Server::new(main_loop.clone(), "127.0.0.1:8888".parse().unwrap(), "echo")?;
//!     server.set_thread_num(2);
//!     server.set_connection_callback(Arc::new(|conn: &Arc<Connection>| {
//!         let conn = conn.clone();
//!         conn.owner_loop().clone().spawn(async move {
//!             loop {
//!                 let n = conn.read(4096).await;
//!                 if n <= 0 {
//!                     break;
//!                 }
//!                 let sent = conn.send_zero_copy().await;
//!                 conn.release_current_read_buffer();
//!                 if sent <= 0 {
//!                     break;
//!                 }
//!             }
//!             Connection::force_close(&conn);
//!         });
//!     }));
//!     server.start()?;
//!
//!     main_loop.run();
//!     Ok(())
//! }
//! ```
//!
//! # Platform
//!
//! Linux only. Requires io_uring with linked timeouts and registered
//! buffers (kernel 5.15+).

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod context;
pub(crate) mod queue;
pub(crate) mod runtime;
pub(crate) mod socket;

// ── Public modules ──────────────────────────────────────────────────────
pub mod acceptor;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod logging;
pub mod loop_pool;
pub mod metrics;
pub mod server;

// ── Re-exports ──────────────────────────────────────────────────────────

/// Listening socket plus the continuously re-posted accept op.
pub use acceptor::Acceptor;
/// Growable egress buffer with a reserved protocol prefix.
pub use buffer::EgressBuffer;
/// Sectioned key=value configuration loader.
pub use config::Config;
/// Logging options (`log.*` keys).
pub use config::LoggingOptions;
/// Per-loop options (`event_loop.*` keys).
pub use config::LoopOptions;
/// Server options (`server.*` keys).
pub use config::ServerOptions;
/// Connection state values.
pub use connection::ConnState;
/// A TCP connection bound to one loop, shared via `Arc`.
pub use connection::Connection;
/// Callback invoked when a connection is established.
pub use connection::ConnectionCallback;
/// Write back-pressure policy.
pub use connection::WriteStrategy;
/// Engine errors.
pub use error::Error;
/// Snapshot of a loop's task-ring back-pressure counters.
pub use event_loop::BackpressureStats;
/// One event loop, bound to the thread that constructed it.
pub use event_loop::EventLoop;
/// Worker loops with round-robin selection.
pub use loop_pool::EventLoopPool;
/// Awaitable read primitive.
pub use runtime::io::ReadFuture;
/// Awaitable write primitive.
pub use runtime::io::WriteFuture;
/// Server facade: acceptor + pool + connection table.
pub use server::Server;
