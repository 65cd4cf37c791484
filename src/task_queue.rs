//! The pending-task queue an `EventLoop` drains once per iteration.
//!
//! Specializes the teacher's general-purpose [`crate::queue::Queue`] to
//! `Box<dyn FnOnce(&mut EventLoop) + Send>`: pushing a task both enqueues
//! it and, through `Queue`'s own pending-count bookkeeping, arms an
//! eventfd-backed [`crate::waker::Waker`] that the loop's poller is already
//! watching. One `Source` registration does double duty as both "a task
//! arrived" and "please wake up" — the loop never needs a second, dedicated
//! wakeup fd the way a task queue and a plain awakener would if kept apart.
//!
//! Tasks receive `&mut EventLoop` when they finally run, on the loop's own
//! thread. That is what lets code on a *different* thread (an acceptor
//! handing a fresh connection to a worker loop, a client's connector
//! finishing on the base loop) hand over work that needs to register a
//! channel or arm a timer without ever holding a live `&mut EventLoop`
//! itself — it only ever needs the `Send` handle that can push here.

use std::io;
use std::os::unix::io::RawFd;

use crate::epoll::{Epoll, EpollOpt, Ready, Source, Token};
use crate::event_loop::EventLoop;
use crate::queue::Queue;

pub type Task = Box<dyn FnOnce(&mut EventLoop) + Send>;

pub struct TaskQueue {
    inner: Queue<Task>,
}

impl TaskQueue {
    pub fn new() -> io::Result<TaskQueue> {
        Ok(TaskQueue {
            inner: Queue::unbounded()?,
        })
    }

    /// A cheap, `Send + Sync` capable handle other threads use to post work
    /// onto this loop without touching anything else the loop owns.
    pub fn sender(&self) -> TaskSender {
        TaskSender {
            inner: self.inner.clone(),
        }
    }

    pub fn push(&self, task: Task) {
        let _ = self.inner.push(task);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn pop(&self) -> Option<Task> {
        self.inner.pop().ok()
    }

    /// Drains every task queued as of this call and runs each against
    /// `loop_` in order. Tasks queued by a task that is itself running
    /// during this drain are left for the next iteration — a fixed
    /// snapshot count is taken up front, so a task that requeues itself
    /// cannot spin the drain loop forever.
    ///
    /// Takes `&self`, not `&mut self`: the caller (`EventLoop::do_pending_tasks`)
    /// owns both this queue and the loop passed as `loop_`, and calling
    /// through `&self` here is what lets it hand over `&mut EventLoop`
    /// without first having to move this queue out of the loop.
    pub fn run_pending(&self, loop_: &mut EventLoop) {
        let mut remaining = self.inner.len();
        while remaining > 0 {
            match self.inner.pop() {
                Ok(task) => task(loop_),
                Err(_) => break,
            }
            remaining -= 1;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl std::os::unix::io::AsRawFd for TaskQueue {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl Source for TaskQueue {
    fn add(&self, epoll: &Epoll, token: Token, interest: Ready, opts: EpollOpt) -> io::Result<()> {
        self.inner.add(epoll, token, interest, opts)
    }

    fn modify(&self, epoll: &Epoll, token: Token, interest: Ready, opts: EpollOpt) -> io::Result<()> {
        self.inner.modify(epoll, token, interest, opts)
    }

    fn delete(&self, epoll: &Epoll) -> io::Result<()> {
        self.inner.delete(epoll)
    }
}

/// Cloneable, cross-thread handle for posting tasks onto a loop whose
/// `TaskQueue` is otherwise pinned to the loop's own thread.
#[derive(Clone)]
pub struct TaskSender {
    inner: Queue<Task>,
}

impl TaskSender {
    pub fn push(&self, task: Task) {
        let _ = self.inner.push(task);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn run_pending_executes_tasks_in_order() {
        let q = TaskQueue::new().unwrap();
        let mut loop_ = EventLoop::new().unwrap();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = order.clone();
        q.push(Box::new(move |_| o1.lock().unwrap().push(1)));
        let o2 = order.clone();
        q.push(Box::new(move |_| o2.lock().unwrap().push(2)));
        q.run_pending(&mut loop_);
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
        assert!(q.is_empty());
    }

    #[test]
    fn sender_can_push_from_a_clone() {
        let q = TaskQueue::new().unwrap();
        let mut loop_ = EventLoop::new().unwrap();
        let sender = q.sender();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        sender.push(Box::new(move |_| { c.fetch_add(1, Ordering::SeqCst); }));
        q.run_pending(&mut loop_);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn task_queued_during_drain_waits_for_next_round() {
        let q = TaskQueue::new().unwrap();
        let mut loop_ = EventLoop::new().unwrap();
        let ran_twice = Arc::new(AtomicUsize::new(0));
        let sender = q.sender();
        let r = ran_twice.clone();
        q.push(Box::new(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            sender.push(Box::new(|_| {}));
        }));
        q.run_pending(&mut loop_);
        assert_eq!(ran_twice.load(Ordering::SeqCst), 1);
        assert!(!q.is_empty());
        q.run_pending(&mut loop_);
        assert!(q.is_empty());
    }
}
