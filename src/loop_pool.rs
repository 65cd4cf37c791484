//! One base loop (owned by whoever builds the pool) plus `N` worker loops,
//! each given its own OS thread. `TcpServer` fans freshly accepted
//! connections out across the workers; a pool with zero workers just hands
//! everything back to the base loop, which is the degenerate single-thread
//! case muduo treats identically.
//!
//! Grounded on muduo's `EventLoopThreadPool`/`EventLoopThread`: since
//! [`crate::event_loop::EventLoop`] can only be constructed on the thread
//! it will run on, each worker builds its own loop inside the spawned
//! thread and hands an [`EventLoopHandle`] back across a rendezvous
//! channel. That `sync_channel(1)` handshake is this crate's stand-in for
//! `EventLoopThread::startLoop`'s condition-variable wait.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::event_loop::{EventLoop, EventLoopHandle};

pub type LoopInitCallback = dyn Fn(&mut EventLoop) + Send + Sync;

struct Worker {
    handle: EventLoopHandle,
    join: Option<JoinHandle<()>>,
}

pub struct LoopPool {
    base_handle: EventLoopHandle,
    workers: Vec<Worker>,
    next: AtomicUsize,
    started: bool,
}

impl LoopPool {
    pub fn new(base_handle: EventLoopHandle) -> LoopPool {
        LoopPool {
            base_handle,
            workers: Vec::new(),
            next: AtomicUsize::new(0),
            started: false,
        }
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Spawns `num_threads` worker loops, each running `init` (if given)
    /// once after construction and before its dispatch loop starts.
    /// Blocks until every worker has reported its handle back, same as
    /// the source's blocking `start()`. Idempotent calls are a bug in the
    /// caller, not here: calling twice panics.
    pub fn start(&mut self, num_threads: usize, init: Option<Arc<LoopInitCallback>>) -> io::Result<()> {
        assert!(!self.started, "LoopPool::start called twice");
        self.started = true;

        for index in 0..num_threads {
            let (tx, rx) = mpsc::sync_channel::<io::Result<EventLoopHandle>>(1);
            let init = init.clone();

            let join = thread::Builder::new()
                .name(format!("loop-worker-{}", index))
                .spawn(move || match EventLoop::new() {
                    Ok(mut loop_) => {
                        let handle = loop_.handle();
                        if let Some(cb) = &init {
                            cb(&mut loop_);
                        }
                        if tx.send(Ok(handle)).is_err() {
                            return;
                        }
                        loop_.run();
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                    }
                })?;

            let handle = rx
                .recv()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "worker loop thread died before starting"))??;

            self.workers.push(Worker { handle, join: Some(join) });
        }

        Ok(())
    }

    /// Round-robin next loop. With no workers, every call returns the base
    /// loop's handle.
    pub fn next_loop(&self) -> EventLoopHandle {
        if self.workers.is_empty() {
            return self.base_handle.clone();
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[i].handle.clone()
    }

    /// Picks a worker deterministically by `hash`, e.g. to keep everything
    /// belonging to one client pinned to the same loop.
    pub fn loop_for_hash(&self, hash: usize) -> EventLoopHandle {
        if self.workers.is_empty() {
            return self.base_handle.clone();
        }
        self.workers[hash % self.workers.len()].handle.clone()
    }

    /// Every worker loop's handle, or just the base loop's if there are no
    /// workers.
    pub fn all_loops(&self) -> Vec<EventLoopHandle> {
        if self.workers.is_empty() {
            vec![self.base_handle.clone()]
        } else {
            self.workers.iter().map(|w| w.handle.clone()).collect()
        }
    }
}

impl Drop for LoopPool {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.handle.quit();
        }
        for worker in &mut self.workers {
            if let Some(join) = worker.join.take() {
                let _ = join.join();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn zero_workers_always_returns_base_loop() {
        let loop_ = EventLoop::new().unwrap();
        let base = loop_.handle();
        let mut pool = LoopPool::new(base);
        pool.start(0, None).unwrap();

        assert_eq!(pool.all_loops().len(), 1);
        assert_eq!(pool.thread_count(), 0);
        let _ = pool.next_loop();
    }

    #[test]
    fn workers_run_init_and_round_robin() {
        let loop_ = EventLoop::new().unwrap();
        let base = loop_.handle();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let init: Arc<LoopInitCallback> = Arc::new(move |_loop_: &mut EventLoop| {
            ran2.store(true, Ordering::SeqCst);
            seen2.lock().unwrap().push(());
        });

        let mut pool = LoopPool::new(base);
        pool.start(2, Some(init)).unwrap();

        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(pool.thread_count(), 2);

        let first = pool.next_loop();
        let second = pool.next_loop();
        let _third = pool.next_loop(); // wraps back to the same worker as `first`
        assert!(!first.is_in_loop_thread());
        assert!(!second.is_in_loop_thread());

        drop(pool);
    }
}
