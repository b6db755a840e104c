//! Integration tests: echo server over real TCP connections.
//!
//! Each test starts a server on a free port, connects with std TCP
//! streams, and verifies the echoed bytes and close behaviour.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ringnet::{Connection, EventLoop, LoopOptions, Server};

// ── Helpers ─────────────────────────────────────────────────────────

fn test_loop_options() -> LoopOptions {
    LoopOptions {
        ring_entries: 256,
        sqpoll: false,
        registered_buffers_count: 64,
        registered_buffers_size: 4096,
        pending_queue_capacity: 1024,
        ..LoopOptions::default()
    }
}

struct TestServer {
    server: Server,
    main_loop: Arc<EventLoop>,
    main_thread: Option<thread::JoinHandle<()>>,
    addr: SocketAddr,
}

impl TestServer {
    /// Start an echo server with `threads` worker loops.
    fn start(threads: usize, read_timeout: Duration) -> TestServer {
        let (tx, rx) = std::sync::mpsc::channel();
        let main_thread = thread::spawn(move || {
            let main_loop = EventLoop::new(test_loop_options()).expect("main loop");
            tx.send(main_loop.clone()).unwrap();
            main_loop.run();
        });
        let main_loop = rx.recv().unwrap();

        let server = Server::new(
            main_loop.clone(),
            "127.0.0.1:0".parse().unwrap(),
            "echo-test",
        )
        .expect("server");
        server.set_thread_num(threads);
        server.set_event_loop_options(test_loop_options());
        server.set_read_timeout(read_timeout);
        server.set_connection_callback(Arc::new(|conn: &Arc<Connection>| {
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
        server.start().expect("start");

        let addr = server.listen_addr().expect("bound address");
        TestServer {
            server,
            main_loop,
            main_thread: Some(main_thread),
            addr,
        }
    }

    fn wait_until_idle(&self) {
        for _ in 0..400 {
            if self.server.connection_count() == 0 {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!(
            "connections never drained: {}",
            self.server.connection_count()
        );
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.stop();
        self.main_loop.quit();
        if let Some(handle) = self.main_thread.take() {
            let _ = handle.join();
        }
    }
}

fn connect(addr: SocketAddr) -> TcpStream {
    for _ in 0..200 {
        if let Ok(stream) = TcpStream::connect(addr) {
            return stream;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("could not connect to {addr}");
}

fn echo_round_trip(stream: &mut TcpStream, msg: &[u8]) -> Vec<u8> {
    stream.write_all(msg).unwrap();
    stream.flush().unwrap();

    let mut buf = vec![0u8; msg.len()];
    let mut total = 0;
    while total < msg.len() {
        match stream.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => panic!("read error: {e}"),
        }
    }
    buf.truncate(total);
    buf
}

// ── Tests ───────────────────────────────────────────────────────────

#[test]
fn echo_small_message() {
    let ts = TestServer::start(2, Duration::ZERO);

    let mut stream = connect(ts.addr);
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let response = echo_round_trip(&mut stream, b"PING\n");
    assert_eq!(response, b"PING\n");

    drop(stream); // FIN → server closes and removes the connection
    ts.wait_until_idle();
}

#[test]
fn echo_survives_multiple_round_trips() {
    let ts = TestServer::start(1, Duration::ZERO);

    let mut stream = connect(ts.addr);
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    for i in 0..20 {
        let msg = format!("message number {i}");
        let response = echo_round_trip(&mut stream, msg.as_bytes());
        assert_eq!(response, msg.as_bytes());
    }

    drop(stream);
    ts.wait_until_idle();
}

#[test]
fn echo_large_message_in_chunks() {
    let ts = TestServer::start(1, Duration::ZERO);

    let mut stream = connect(ts.addr);
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    // larger than one fixed buffer; echoed back across several reads
    let msg: Vec<u8> = (0..65536u32).map(|i| (i % 251) as u8).collect();
    let response = echo_round_trip(&mut stream, &msg);
    assert_eq!(response, msg);

    drop(stream);
    ts.wait_until_idle();
}

#[test]
fn echo_across_worker_loops() {
    let ts = TestServer::start(2, Duration::ZERO);

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let addr = ts.addr;
            thread::spawn(move || {
                let mut stream = connect(addr);
                stream
                    .set_read_timeout(Some(Duration::from_secs(5)))
                    .unwrap();
                let msg = format!("hello from client {i}");
                let response = echo_round_trip(&mut stream, msg.as_bytes());
                assert_eq!(response, msg.as_bytes());
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    ts.wait_until_idle();
}

#[test]
fn idle_connection_times_out() {
    let ts = TestServer::start(1, Duration::from_millis(800));

    let mut stream = connect(ts.addr);
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    // send nothing: the linked per-read deadline fires and the server
    // closes the connection
    let mut buf = [0u8; 16];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("unexpected {n} bytes from idle connection"),
        Err(e)
            if e.kind() == io::ErrorKind::ConnectionReset
                || e.kind() == io::ErrorKind::UnexpectedEof => {}
        Err(e) => panic!("unexpected error: {e}"),
    }

    ts.wait_until_idle();
}

#[test]
fn active_connection_outlives_the_read_deadline() {
    let ts = TestServer::start(1, Duration::from_millis(800));

    let mut stream = connect(ts.addr);
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    // a slow sender that stays inside the per-read deadline
    for chunk in [&b"sl"[..], &b"ow "[..], &b"data"[..]] {
        stream.write_all(chunk).unwrap();
        stream.flush().unwrap();
        let mut buf = vec![0u8; chunk.len()];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(buf, chunk);
        thread::sleep(Duration::from_millis(300));
    }

    drop(stream);
    ts.wait_until_idle();
}

#[test]
fn reads_fall_back_when_fixed_buffers_run_out() {
    // 2 registered buffers, 4 connections with reads posted: the later
    // reads land in heap fallback buffers and still echo correctly
    let (tx, rx) = std::sync::mpsc::channel();
    let main_thread = thread::spawn(move || {
        let main_loop = EventLoop::new(test_loop_options()).expect("main loop");
        tx.send(main_loop.clone()).unwrap();
        main_loop.run();
    });
    let main_loop = rx.recv().unwrap();

    let server = Server::new(
        main_loop.clone(),
        "127.0.0.1:0".parse().unwrap(),
        "exhaust-test",
    )
    .expect("server");
    server.set_thread_num(1);
    server.set_event_loop_options(LoopOptions {
        registered_buffers_count: 2,
        ..test_loop_options()
    });
    server.set_connection_callback(Arc::new(|conn: &Arc<Connection>| {
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
    server.start().expect("start");
    let addr = server.listen_addr().unwrap();

    let mut streams: Vec<_> = (0..4).map(|_| connect(addr)).collect();
    for stream in &mut streams {
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
    }
    // all four have reads pending; two hold the only fixed buffers
    thread::sleep(Duration::from_millis(200));

    for (i, stream) in streams.iter_mut().enumerate() {
        let msg = format!("payload for connection {i}");
        let response = echo_round_trip(stream, msg.as_bytes());
        assert_eq!(response, msg.as_bytes());
    }

    drop(streams);
    for _ in 0..400 {
        if server.connection_count() == 0 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(server.connection_count(), 0);

    server.stop();
    main_loop.quit();
    main_thread.join().unwrap();
}

#[test]
fn echo_with_caller_supplied_buffer() {
    let (tx, rx) = std::sync::mpsc::channel();
    let main_thread = thread::spawn(move || {
        let main_loop = EventLoop::new(test_loop_options()).expect("main loop");
        tx.send(main_loop.clone()).unwrap();
        main_loop.run();
    });
    let main_loop = rx.recv().unwrap();

    let server = Server::new(
        main_loop.clone(),
        "127.0.0.1:0".parse().unwrap(),
        "userbuf-test",
    )
    .expect("server");
    server.set_thread_num(1);
    server.set_event_loop_options(test_loop_options());
    server.set_connection_callback(Arc::new(|conn: &Arc<Connection>| {
        let conn = conn.clone();
        let event_loop = conn.owner_loop().clone();
        event_loop.spawn(async move {
            let mut buf = vec![0u8; 1024];
            loop {
                let n = conn.read_into(&mut buf, 1024).await;
                if n <= 0 {
                    break;
                }
                let sent = conn.send(&buf[..n as usize]).await;
                conn.release_current_read_buffer();
                if sent <= 0 {
                    break;
                }
            }
            Connection::force_close(&conn);
        });
    }));
    server.start().expect("start");
    let addr = server.listen_addr().unwrap();

    let mut stream = connect(addr);
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let response = echo_round_trip(&mut stream, b"through the caller's buffer");
    assert_eq!(response, b"through the caller's buffer");

    server.stop();
    main_loop.quit();
    main_thread.join().unwrap();
}

#[test]
fn connection_burst_drains_cleanly() {
    let ts = TestServer::start(2, Duration::ZERO);

    let mut streams = Vec::new();
    for _ in 0..100 {
        streams.push(connect(ts.addr));
    }
    // let the accept/establish hops settle, then close everything
    thread::sleep(Duration::from_millis(300));
    drop(streams);

    ts.wait_until_idle();
}
