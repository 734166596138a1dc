//! Cross-thread task injection.
//!
//! The task queue is the sole cross-thread write channel into a worker:
//! an MPSC channel of deferred closures paired with the worker's wakeup
//! handle. Posting never blocks the hot read/write paths; wake signals
//! coalesce at the eventfd, so any number of posts between two poll
//! calls costs at most one extra wakeup.
//!
//! Ordering: insertion-FIFO per producer thread. No ordering across
//! producers is guaranteed; closures must tolerate interleaving.

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use mio::Waker;

use crate::worker::ThreadCore;

/// A deferred closure executed on the owning worker with access to its
/// thread-local state.
pub type Task = Box<dyn FnOnce(&mut ThreadCore) + Send + 'static>;

/// Cloneable posting side of a worker's task queue.
#[derive(Clone)]
pub struct TaskSender {
    tx: Sender<Task>,
    waker: Arc<Waker>,
}

impl TaskSender {
    /// Enqueue a task and wake the worker. Safe from any thread. A task
    /// posted to a worker that has already exited is silently dropped.
    pub fn post(&self, task: impl FnOnce(&mut ThreadCore) + Send + 'static) {
        if self.tx.send(Box::new(task)).is_err() {
            log::debug!("task posted to a stopped worker, dropping");
            return;
        }
        if let Err(e) = self.waker.wake() {
            log::warn!("failed to signal worker wakeup handle: {}", e);
        }
    }

    /// Signal the wakeup handle without posting. Idempotent; signals
    /// coalesce.
    pub fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            log::warn!("failed to signal worker wakeup handle: {}", e);
        }
    }

    /// Number of queued tasks, for drain batching.
    pub fn queued(&self) -> usize {
        self.tx.len()
    }
}

/// Build the task channel for one worker. The receiver stays with the
/// worker; senders go to the fleet, the acceptor and peer workers.
pub fn task_channel(waker: Arc<Waker>) -> (TaskSender, Receiver<Task>) {
    let (tx, rx) = unbounded();
    (TaskSender { tx, waker }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll, Token};
    use std::time::Duration;

    const WAKE: Token = Token(0);

    fn wake_setup() -> (Poll, TaskSender, Receiver<Task>) {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), WAKE).unwrap());
        let (sender, rx) = task_channel(waker);
        (poll, sender, rx)
    }

    #[test]
    fn test_post_signals_wakeup() {
        let (mut poll, sender, rx) = wake_setup();
        sender.post(|_core| {});

        let mut events = Events::with_capacity(8);
        poll.poll(&mut events, Some(Duration::from_secs(2))).unwrap();
        assert!(events.iter().any(|e| e.token() == WAKE));
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn test_burst_coalesces_to_one_wakeup() {
        let (mut poll, sender, rx) = wake_setup();

        let producer = {
            let sender = sender.clone();
            std::thread::spawn(move || {
                for _ in 0..10_000 {
                    sender.post(|_core| {});
                }
            })
        };
        producer.join().unwrap();

        // One poll observes the coalesced wakeup with all tasks queued.
        let mut events = Events::with_capacity(8);
        poll.poll(&mut events, Some(Duration::from_secs(2))).unwrap();
        assert!(events.iter().any(|e| e.token() == WAKE));
        assert_eq!(rx.len(), 10_000);

        // Draining the channel and polling again yields no residual wakeup.
        while rx.try_recv().is_ok() {}
        poll.poll(&mut events, Some(Duration::from_millis(100)))
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_wake_without_task_is_safe() {
        let (mut poll, sender, rx) = wake_setup();
        sender.wake();
        sender.wake();

        let mut events = Events::with_capacity(8);
        poll.poll(&mut events, Some(Duration::from_secs(2))).unwrap();
        assert!(events.iter().any(|e| e.token() == WAKE));
        assert_eq!(rx.len(), 0);
    }

    #[test]
    fn test_queued_reflects_channel_depth() {
        let (_poll, sender, rx) = wake_setup();
        assert_eq!(sender.queued(), 0);
        sender.post(|_core| {});
        sender.post(|_core| {});
        assert_eq!(sender.queued(), 2);
        let _ = rx.try_recv();
        assert_eq!(sender.queued(), 1);
    }
}
