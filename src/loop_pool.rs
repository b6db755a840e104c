//! Worker loop threads and the round-robin pool.

use std::sync::{Arc, Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use tracing::{error, info};

use crate::config::LoopOptions;
use crate::error::Error;
use crate::event_loop::EventLoop;

/// A thread running one [`EventLoop`].
///
/// Startup is a condition-variable handshake: the caller blocks until
/// the worker publishes its loop, so the pointer is visible before
/// `start` returns. The fixed buffer pool is initialized on the worker
/// thread, after the handshake, before the loop runs.
pub(crate) struct LoopThread {
    handle: Option<thread::JoinHandle<()>>,
    event_loop: Arc<EventLoop>,
}

type Handshake = (Mutex<Option<Result<Arc<EventLoop>, String>>>, Condvar);

impl LoopThread {
    pub(crate) fn start(opts: LoopOptions, name: String) -> Result<LoopThread, Error> {
        let shared: Arc<Handshake> = Arc::new((Mutex::new(None), Condvar::new()));
        let worker_shared = shared.clone();

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let event_loop = match EventLoop::new(opts) {
                    Ok(event_loop) => event_loop,
                    Err(e) => {
                        let (lock, cvar) = &*worker_shared;
                        *lock.lock().unwrap() = Some(Err(e.to_string()));
                        cvar.notify_one();
                        return;
                    }
                };
                {
                    let (lock, cvar) = &*worker_shared;
                    *lock.lock().unwrap() = Some(Ok(event_loop.clone()));
                    cvar.notify_one();
                }
                if let Err(e) = event_loop.init_registered_buffers() {
                    // degraded: reads fall back to heap buffers
                    error!("fixed buffer registration failed: {e}");
                }
                info!("loop thread started");
                event_loop.run();
                info!("loop thread exiting");
            })
            .map_err(Error::Io)?;

        let (lock, cvar) = &*shared;
        let mut published = lock.lock().unwrap();
        while published.is_none() {
            published = cvar.wait(published).unwrap();
        }
        match published.take().unwrap() {
            Ok(event_loop) => Ok(LoopThread {
                handle: Some(handle),
                event_loop,
            }),
            Err(msg) => {
                let _ = handle.join();
                error!("worker loop setup failed: {msg}");
                Err(Error::LoopStartup)
            }
        }
    }

    pub(crate) fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub(crate) fn stop(&mut self) {
        self.event_loop.quit();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A fixed set of worker loops plus the base (main) loop.
///
/// `next_loop` is round-robin over the workers; with zero workers it
/// returns the base loop, which then hosts connections itself.
pub struct EventLoopPool {
    base: Arc<EventLoop>,
    opts: LoopOptions,
    num_threads: usize,
    threads: Vec<LoopThread>,
    next: AtomicUsize,
    started: bool,
}

impl EventLoopPool {
    pub fn new(base: Arc<EventLoop>) -> Self {
        EventLoopPool {
            base,
            opts: LoopOptions::default(),
            num_threads: 0,
            threads: Vec::new(),
            next: AtomicUsize::new(0),
            started: false,
        }
    }

    pub fn set_thread_num(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    pub fn thread_num(&self) -> usize {
        self.num_threads
    }

    /// Options applied to every worker loop.
    pub fn set_loop_options(&mut self, opts: LoopOptions) {
        self.opts = opts;
    }

    pub fn start(&mut self) -> Result<(), Error> {
        if self.started {
            return Ok(());
        }
        for i in 0..self.num_threads {
            let thread = LoopThread::start(self.opts.clone(), format!("ringnet-loop-{i}"))?;
            self.threads.push(thread);
        }
        self.started = true;
        Ok(())
    }

    /// Pick the loop for a new connection.
    pub fn next_loop(&self) -> Arc<EventLoop> {
        if self.threads.is_empty() {
            return self.base.clone();
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.threads.len();
        self.threads[i].event_loop().clone()
    }

    pub fn all_loops(&self) -> Vec<Arc<EventLoop>> {
        if self.threads.is_empty() {
            vec![self.base.clone()]
        } else {
            self.threads.iter().map(|t| t.event_loop().clone()).collect()
        }
    }

    /// Quit every worker loop and join its thread.
    pub fn stop(&mut self) {
        for thread in &mut self.threads {
            thread.stop();
        }
    }
}
