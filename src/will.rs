//! Will orchestration.
//!
//! Wills from ungraceful disconnects are queued here: immediately due
//! ones go out on the next timer pass, v5 delayed wills wait out their
//! will-delay interval. On shutdown the orchestrator flushes everything
//! regardless of delay, as part of the first quit barrier.

use std::time::{Duration, Instant};

use crate::message::WillMessage;

struct PendingWill {
    publish_at: Instant,
    will: WillMessage,
}

#[derive(Default)]
pub struct WillOrchestrator {
    pending: Vec<PendingWill>,
}

impl WillOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a will taken from a disconnecting client.
    pub fn queue(&mut self, will: WillMessage, now: Instant) {
        let publish_at = now + Duration::from_secs(will.delay_interval as u64);
        self.pending.push(PendingWill { publish_at, will });
    }

    /// Take every will whose delay has elapsed.
    pub fn take_due(&mut self, now: Instant) -> Vec<WillMessage> {
        let mut due = Vec::new();
        let mut keep = Vec::with_capacity(self.pending.len());
        for pw in self.pending.drain(..) {
            if pw.publish_at <= now {
                due.push(pw.will);
            } else {
                keep.push(pw);
            }
        }
        self.pending = keep;
        due
    }

    /// Take everything, ignoring delays. Used at shutdown.
    pub fn flush_all(&mut self) -> Vec<WillMessage> {
        self.pending.drain(..).map(|pw| pw.will).collect()
    }

    /// Time until the next delayed will is due.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.pending
            .iter()
            .map(|pw| pw.publish_at)
            .min()
            .map(|at| at.saturating_duration_since(now))
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, QoS};

    fn make_will(topic: &str, delay: u32) -> WillMessage {
        WillMessage {
            message: Message::new(topic, QoS::AtLeastOnce, false, &b"gone"[..]),
            delay_interval: delay,
        }
    }

    #[test]
    fn test_immediate_will_due_at_once() {
        let now = Instant::now();
        let mut orch = WillOrchestrator::new();
        orch.queue(make_will("w/1", 0), now);

        assert_eq!(orch.next_timeout(now), Some(Duration::ZERO));
        let due = orch.take_due(now);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].message.topic, "w/1");
        assert!(orch.is_empty());
    }

    #[test]
    fn test_delayed_will_waits_out_interval() {
        let now = Instant::now();
        let mut orch = WillOrchestrator::new();
        orch.queue(make_will("w/delayed", 30), now);

        assert!(orch.take_due(now).is_empty());
        assert_eq!(orch.next_timeout(now), Some(Duration::from_secs(30)));

        let due = orch.take_due(now + Duration::from_secs(30));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].message.topic, "w/delayed");
    }

    #[test]
    fn test_mixed_delays_release_in_due_order() {
        let now = Instant::now();
        let mut orch = WillOrchestrator::new();
        orch.queue(make_will("w/slow", 60), now);
        orch.queue(make_will("w/fast", 5), now);

        let due = orch.take_due(now + Duration::from_secs(10));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].message.topic, "w/fast");
        assert_eq!(orch.len(), 1);
    }

    #[test]
    fn test_flush_all_ignores_delays() {
        let now = Instant::now();
        let mut orch = WillOrchestrator::new();
        orch.queue(make_will("w/1", 300), now);
        orch.queue(make_will("w/2", 0), now);

        let flushed = orch.flush_all();
        assert_eq!(flushed.len(), 2);
        assert!(orch.is_empty());
        assert_eq!(orch.next_timeout(now), None);
    }
}
