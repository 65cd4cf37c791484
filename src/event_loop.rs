//! One reactor per thread: owns the poller, the timer queue and the
//! pending-task queue, and enforces that exactly one `EventLoop` is ever
//! live on a given OS thread at a time.
//!
//! Everything that registers a channel (a `Connection`, an `Acceptor`, a
//! `Connector`) does so by being handed `&mut EventLoop` — either because
//! it was constructed directly on the loop's thread, or because it was
//! queued there through an [`EventLoopHandle`] and is now running inside
//! `TaskQueue::run_pending`, which supplies that `&mut EventLoop` itself.
//! No networking object keeps a raw back-pointer to its loop the way the
//! C++ original does; it keeps a `Handle` instead.

use std::cell::Cell;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::{info, trace, warn};

use crate::channel::Channel;
use crate::poller::Poller;
use crate::task_queue::{Task, TaskQueue, TaskSender};
use crate::timer::TimerId;
use crate::timer_queue::TimerQueue;

/// How long a single `epoll_wait` blocks with nothing scheduled. Bounds
/// how late a loop notices its own `quit()` call if nothing ever wakes it.
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

thread_local! {
    static LOOP_IN_THIS_THREAD: Cell<bool> = Cell::new(false);
}

static IGNORE_SIGPIPE: Once = Once::new();

fn ignore_sigpipe() {
    IGNORE_SIGPIPE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

pub struct EventLoop {
    poller: Poller,
    timer_queue: TimerQueue,
    timer_fd: RawFd,
    task_queue: TaskQueue,
    task_queue_fd: RawFd,
    quit: Arc<AtomicBool>,
    thread_id: ThreadId,
    iteration: u64,
    calling_pending_tasks: bool,
}

impl EventLoop {
    pub fn new() -> io::Result<EventLoop> {
        ignore_sigpipe();

        LOOP_IN_THIS_THREAD.with(|flag| {
            if flag.get() {
                panic!("another EventLoop already exists in this thread");
            }
            flag.set(true);
        });

        let mut poller = Poller::new()?;
        let timer_queue = TimerQueue::new()?;
        let task_queue = TaskQueue::new()?;

        let timer_fd = timer_queue.timer_fd().as_raw_fd();
        let task_queue_fd = task_queue.as_raw_fd();

        poller.new_channel(timer_fd).enable_reading();
        poller.update_channel(timer_fd)?;

        poller.new_channel(task_queue_fd).enable_reading();
        poller.update_channel(task_queue_fd)?;

        Ok(EventLoop {
            poller,
            timer_queue,
            timer_fd,
            task_queue,
            task_queue_fd,
            quit: Arc::new(AtomicBool::new(false)),
            thread_id: thread::current().id(),
            iteration: 0,
            calling_pending_tasks: false,
        })
    }

    pub fn handle(&self) -> EventLoopHandle {
        EventLoopHandle {
            sender: self.task_queue.sender(),
            quit: self.quit.clone(),
            thread_id: self.thread_id,
        }
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!("EventLoop used from a thread other than the one that created it");
        }
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Runs until `quit()` is called (from any thread) or a wakeup arrives
    /// with nothing left to do but notice the quit flag. Each iteration:
    /// block in the poller, let it dispatch every ready channel, drain the
    /// timer queue, then drain pending tasks — in that order, matching the
    /// teacher's own `EventLoop::loop()` structure.
    pub fn run(&mut self) {
        self.assert_in_loop_thread();
        self.quit.store(false, Ordering::SeqCst);
        info!("EventLoop starting on thread {:?}", self.thread_id);

        while !self.quit.load(Ordering::SeqCst) {
            let now = match self.poller.poll(Some(POLL_TIMEOUT)) {
                Ok(now) => now,
                Err(e) => {
                    warn!("poller error: {}", e);
                    Instant::now()
                }
            };

            self.iteration += 1;

            if let Err(e) = self.timer_queue.handle_read(now) {
                warn!("timer queue error: {}", e);
            }

            self.do_pending_tasks();
        }

        info!("EventLoop stopping on thread {:?}", self.thread_id);
    }

    /// Drains exactly what was pending at the start of this call. A task
    /// queued by a task running here waits for the next iteration — this
    /// is what keeps a task that requeues itself from spinning the loop.
    ///
    /// Each `pop()` only borrows `self.task_queue` for the call itself and
    /// returns an owned task, so the borrow has already ended by the time
    /// the task runs with `&mut self` — `self.task_queue.run_pending(self)`
    /// would not borrow-check, since that keeps the field borrow alive
    /// across the whole call.
    fn do_pending_tasks(&mut self) {
        self.calling_pending_tasks = true;
        let mut remaining = self.task_queue.len();
        while remaining > 0 {
            let task = self.task_queue.pop();
            if let Some(task) = task {
                task(self);
            }
            remaining -= 1;
        }
        self.calling_pending_tasks = false;
    }

    pub fn quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    fn wakeup(&self) {
        self.task_queue.push(Box::new(|_| {}));
    }

    /// Runs `f` synchronously if already on this loop's thread, otherwise
    /// hands it to the task queue for the next iteration.
    pub fn run_in_loop(&mut self, f: impl FnOnce(&mut EventLoop) + Send + 'static) {
        if self.is_in_loop_thread() {
            f(self);
        } else {
            self.queue_in_loop(f);
        }
    }

    pub fn queue_in_loop(&self, f: impl FnOnce(&mut EventLoop) + Send + 'static) {
        self.task_queue.push(Box::new(f));
    }

    pub fn run_at(&mut self, deadline: Instant, cb: impl FnMut() + Send + 'static) -> io::Result<TimerId> {
        self.timer_queue.add_timer(cb, deadline, None)
    }

    pub fn run_after(&mut self, delay: Duration, cb: impl FnMut() + Send + 'static) -> io::Result<TimerId> {
        self.run_at(Instant::now() + delay, cb)
    }

    pub fn run_every(&mut self, interval: Duration, cb: impl FnMut() + Send + 'static) -> io::Result<TimerId> {
        self.timer_queue.add_timer(cb, Instant::now() + interval, Some(interval))
    }

    pub fn cancel(&mut self, id: TimerId) -> io::Result<()> {
        self.timer_queue.cancel(id)
    }

    pub fn new_channel(&mut self, fd: RawFd) -> &mut Channel {
        self.poller.new_channel(fd)
    }

    pub fn channel_mut(&mut self, fd: RawFd) -> Option<&mut Channel> {
        self.poller.channel_mut(fd)
    }

    pub fn update_channel(&mut self, fd: RawFd) -> io::Result<()> {
        self.assert_in_loop_thread();
        self.poller.update_channel(fd)
    }

    pub fn remove_channel(&mut self, fd: RawFd) -> io::Result<()> {
        self.assert_in_loop_thread();
        self.poller.remove_channel(fd)
    }

    pub fn channel_count(&self) -> usize {
        self.poller.channel_count()
    }

    /// True while `do_pending_tasks` is draining this iteration's batch.
    /// A task that queues another task during this window still has to
    /// wait for the next iteration to run — this just lets callers tell
    /// the two situations apart for logging.
    pub fn is_calling_pending_tasks(&self) -> bool {
        self.calling_pending_tasks
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // `remove_channel` requires an already-empty interest set, so
        // disable and sync before dropping the timer/task channels.
        for fd in [self.timer_fd, self.task_queue_fd] {
            if let Some(channel) = self.poller.channel_mut(fd) {
                channel.disable_all();
            }
            let _ = self.poller.update_channel(fd);
            let _ = self.poller.remove_channel(fd);
        }
        LOOP_IN_THIS_THREAD.with(|flag| flag.set(false));
        trace!("EventLoop on thread {:?} dropped after {} iteration(s)", self.thread_id, self.iteration);
    }
}

/// Cheap, `Send + Sync`, cloneable handle to an `EventLoop` living on some
/// other thread. Lets code post work (`queue_in_loop`) and ask for
/// shutdown (`quit`) without any unsafe back-pointer into the loop itself.
#[derive(Clone)]
pub struct EventLoopHandle {
    sender: TaskSender,
    quit: Arc<AtomicBool>,
    thread_id: ThreadId,
}

impl EventLoopHandle {
    pub fn queue_in_loop(&self, f: impl FnOnce(&mut EventLoop) + Send + 'static) {
        self.sender.push(Box::new(f));
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
        // Poke the task queue so a loop blocked in `epoll_wait` notices
        // the flag without waiting out the full poll timeout.
        self.sender.push(Box::new(|_| {}));
    }
}
