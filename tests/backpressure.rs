//! Back-pressure behaviour: the Block write strategy against a slow
//! reader, and the task-ring watermark signalling.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use ringnet::{Connection, EventLoop, LoopOptions, Server, WriteStrategy};

const PAYLOAD_LEN: usize = 4 * 1024 * 1024;

fn test_loop_options() -> LoopOptions {
    LoopOptions {
        ring_entries: 256,
        sqpoll: false,
        registered_buffers_count: 16,
        registered_buffers_size: 4096,
        pending_queue_capacity: 1024,
        ..LoopOptions::default()
    }
}

/// A routine enqueues a 4 MiB payload behind a stalled reader under the
/// Block strategy; the write stays suspended until the reader drains the
/// egress buffer, and the accumulated byte total equals the payload.
#[test]
fn block_write_delivers_full_payload_to_slow_reader() {
    let (tx, rx) = mpsc::channel();
    let main_thread = thread::spawn(move || {
        let main_loop = EventLoop::new(test_loop_options()).expect("main loop");
        tx.send(main_loop.clone()).unwrap();
        main_loop.run();
    });
    let main_loop = rx.recv().unwrap();

    let server = Server::new(
        main_loop.clone(),
        "127.0.0.1:0".parse().unwrap(),
        "block-test",
    )
    .expect("server");
    server.set_thread_num(1);
    server.set_event_loop_options(test_loop_options());

    let written_total = Arc::new(AtomicI64::new(-1));
    let total = written_total.clone();
    server.set_connection_callback(Arc::new(move |conn: &Arc<Connection>| {
        let conn = conn.clone();
        let total = total.clone();
        let event_loop = conn.owner_loop().clone();
        event_loop.spawn(async move {
            let n = conn.read(16).await;
            conn.release_current_read_buffer();
            if n > 0 {
                conn.set_write_strategy(WriteStrategy::Block);
                conn.set_write_watermarks(64 * 1024, 16 * 1024);

                let payload = vec![0x5Au8; PAYLOAD_LEN];
                let mut written: i64 = 0;
                let sent = conn.send(&payload).await;
                if sent > 0 {
                    written += sent as i64;
                    // flush whatever remained below the low watermark
                    loop {
                        let readable = conn.egress_buffer().readable();
                        if readable == 0 {
                            break;
                        }
                        let m = conn.write().await;
                        if m <= 0 {
                            break;
                        }
                        written += m as i64;
                    }
                }
                total.store(written, Ordering::SeqCst);
            }
            Connection::force_close(&conn);
        });
    }));
    server.start().expect("start");
    let addr = server.listen_addr().unwrap();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(30)))
        .unwrap();
    stream.write_all(b"go").unwrap();
    stream.flush().unwrap();

    // stall: the server's egress buffer fills far beyond the high mark
    thread::sleep(Duration::from_millis(400));

    let mut received = 0usize;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                assert!(buf[..n].iter().all(|&b| b == 0x5A));
                received += n;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => panic!("read error after {received} bytes: {e}"),
        }
    }
    assert_eq!(received, PAYLOAD_LEN);

    for _ in 0..400 {
        if written_total.load(Ordering::SeqCst) >= 0 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(written_total.load(Ordering::SeqCst), PAYLOAD_LEN as i64);

    server.stop();
    main_loop.quit();
    main_thread.join().unwrap();
}

/// Overfilling a loop's task ring counts drops and fires the watermark
/// callback: entering-high exactly once, paired with one low-mark
/// recovery after the loop drains.
#[test]
fn task_ring_watermarks_pair_up() {
    let (loop_tx, loop_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel::<()>();
    let loop_thread = thread::spawn(move || {
        let event_loop = EventLoop::new(test_loop_options()).expect("loop");
        loop_tx.send(event_loop.clone()).unwrap();
        go_rx.recv().unwrap();
        event_loop.run();
    });
    let event_loop = loop_rx.recv().unwrap();

    let transitions = Arc::new(Mutex::new(Vec::new()));
    let observed = transitions.clone();
    event_loop.set_backpressure_callback(Arc::new(move |high| {
        observed.lock().unwrap().push(high);
    }));

    let capacity = event_loop.options().pending_queue_capacity;
    let high_mark = event_loop.options().pending_queue_high_mark;

    // overfill without the loop running: crosses high, then drops
    for _ in 0..capacity + 100 {
        event_loop.queue_in_loop(|| {});
    }

    let stats = event_loop.backpressure_stats();
    assert_eq!(stats.high_mark_events, 1);
    assert_eq!(stats.low_mark_events, 0);
    assert!(stats.queue_full_count > 0, "full ring must count drops");
    assert!(stats.peak_queue_size >= high_mark);
    assert!(stats.peak_queue_size <= capacity);

    // run the loop so it drains, then trip the low-mark recovery
    go_tx.send(()).unwrap();
    let mut recovered = false;
    for _ in 0..400 {
        event_loop.queue_in_loop(|| {});
        if event_loop.backpressure_stats().low_mark_events == 1 {
            recovered = true;
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(recovered, "low-mark recovery never fired");

    let stats = event_loop.backpressure_stats();
    assert_eq!(stats.high_mark_events, 1);
    assert_eq!(stats.low_mark_events, 1);
    assert_eq!(*transitions.lock().unwrap(), vec![true, false]);

    event_loop.quit();
    loop_thread.join().unwrap();
}
