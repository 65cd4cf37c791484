//! `run_after`/`run_every`/`cancel` scheduling through a live `EventLoop`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use loopio::EventLoop;

#[test]
fn run_after_fires_once_in_insertion_order() {
    let mut loop_ = EventLoop::new().unwrap();
    let handle = loop_.handle();

    let order = Arc::new(Mutex::new(Vec::new()));
    let o1 = order.clone();
    let o2 = order.clone();
    let quit_handle = handle.clone();

    handle.queue_in_loop(move |loop_| {
        let _ = loop_.run_after(Duration::from_millis(10), move || o1.lock().unwrap().push(1));
        let _ = loop_.run_after(Duration::from_millis(10), move || o2.lock().unwrap().push(2));
        let _ = loop_.run_after(Duration::from_millis(50), move || quit_handle.quit());
    });

    loop_.run();

    assert_eq!(&*order.lock().unwrap(), &[1, 2]);
}

#[test]
fn run_every_fires_more_than_once_until_cancelled() {
    let mut loop_ = EventLoop::new().unwrap();
    let handle = loop_.handle();

    let count = Arc::new(AtomicU32::new(0));
    let count2 = count.clone();
    let quit_handle = handle.clone();

    handle.queue_in_loop(move |loop_| {
        let id = loop_.run_every(Duration::from_millis(10), move || {
            count2.fetch_add(1, Ordering::SeqCst);
        }).unwrap();

        let cancel_handle = quit_handle.clone();
        let _ = loop_.run_after(Duration::from_millis(55), move || {
            cancel_handle.queue_in_loop(move |loop_| {
                let _ = loop_.cancel(id);
            });
        });
        let _ = loop_.run_after(Duration::from_millis(100), move || quit_handle.quit());
    });

    loop_.run();

    assert!(count.load(Ordering::SeqCst) >= 3);
}

#[test]
fn cancelling_a_timer_before_it_fires_suppresses_it() {
    let mut loop_ = EventLoop::new().unwrap();
    let handle = loop_.handle();

    let fired = Arc::new(AtomicU32::new(0));
    let fired2 = fired.clone();
    let quit_handle = handle.clone();

    handle.queue_in_loop(move |loop_| {
        let id = loop_.run_after(Duration::from_millis(30), move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        }).unwrap();
        let _ = loop_.cancel(id);
        let _ = loop_.run_after(Duration::from_millis(60), move || quit_handle.quit());
    });

    loop_.run();

    assert_eq!(fired.load(Ordering::SeqCst), 0);
}
