//! Echo server demo.
//!
//! Run with an optional config file:
//!
//! ```text
//! cargo run --example echo_server -- ringnet.conf
//! ```
//!
//! Each connection gets a routine that reads, echoes the bytes back on
//! the zero-copy path, and closes on EOF or error.

use std::sync::Arc;

use ringnet::{
    Config, Connection, EventLoop, LoggingOptions, LoopOptions, Server, ServerOptions,
};

fn main() -> Result<(), ringnet::Error> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    ringnet::logging::init(&LoggingOptions::from_config(&config));

    let server_opts = ServerOptions::from_config(&config);
    let loop_opts = LoopOptions::from_config(&config);

    let main_loop = EventLoop::new(loop_opts.clone())?;
    let server = Server::new(
        main_loop.clone(),
        server_opts.listen_addr(),
        server_opts.name.as_str(),
    )?;
    server.set_thread_num(server_opts.thread_num);
    server.set_event_loop_options(loop_opts);
    server.set_read_timeout(server_opts.read_timeout);

    server.set_connection_callback(Arc::new(|conn: &Arc<Connection>| {
        tracing::info!(name = %conn.name(), peer = %conn.peer_addr(), "client connected");
        let conn = conn.clone();
        let event_loop = conn.owner_loop().clone();
        event_loop.spawn(async move {
            loop {
                let n = conn.read(4096).await;
                if n <= 0 {
                    break;
                }
                let sent = conn.send_zero_copy().await;
                conn.release_current_read_buffer();
                if sent <= 0 {
                    break;
                }
            }
            Connection::force_close(&conn);
        });
    }));

    server.start()?;
    main_loop.run();
    Ok(())
}
