//! Worker statistics and `$SYS` topic publication.
//!
//! Counters are lock-free monotonic atomics updated on the hot path and
//! readable from any thread without synchronization. The lead worker's
//! stats tick sums peer counters and publishes them as retained
//! broker-topic messages with change detection, payloads formatted with
//! stack-allocated `itoa` buffers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;

use crate::message::{Message, QoS};
use crate::store::SubscriptionStore;

/// `$SYS` topic string constants.
pub mod topics {
    pub const VERSION: &str = "$SYS/broker/version";

    pub const CLIENTS_CONNECTED: &str = "$SYS/broker/clients/connected";
    pub const CONNECTIONS_TOTAL: &str = "$SYS/broker/connections/total";

    pub const MESSAGES_RECEIVED: &str = "$SYS/broker/messages/received";
    pub const MESSAGES_SENT: &str = "$SYS/broker/messages/sent";

    pub const LOAD_MESSAGES_RECEIVED: &str = "$SYS/broker/load/messages/received/persecond";
    pub const LOAD_MESSAGES_SENT: &str = "$SYS/broker/load/messages/sent/persecond";
    pub const LOAD_CONNECTIONS: &str = "$SYS/broker/load/connections/persecond";
}

/// A monotonically increasing counter whose rate can be derived at
/// stats-tick boundaries. Cross-thread reads need no synchronization
/// beyond atomicity.
#[derive(Debug, Default)]
pub struct DerivableCounter {
    value: AtomicU64,
    /// Value at the previous derive() sample.
    prev: AtomicU64,
}

impl DerivableCounter {
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
            prev: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Per-second rate since the previous sample. Advances the sample
    /// point; intended to be called once per stats tick, by the lead.
    pub fn derive(&self, interval: Duration) -> f64 {
        let current = self.value.load(Ordering::Relaxed);
        let prev = self.prev.swap(current, Ordering::Relaxed);
        let secs = interval.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        current.saturating_sub(prev) as f64 / secs
    }
}

/// Per-worker counters, updated by the owning worker and the codec,
/// read by the lead worker at stats ticks.
#[derive(Debug, Default)]
pub struct WorkerCounters {
    pub received_messages: DerivableCounter,
    pub sent_messages: DerivableCounter,
    pub mqtt_connects: DerivableCounter,
    pub disconnects: DerivableCounter,
    pub sessions_expired: DerivableCounter,
}

impl WorkerCounters {
    pub const fn new() -> Self {
        Self {
            received_messages: DerivableCounter::new(),
            sent_messages: DerivableCounter::new(),
            mqtt_connects: DerivableCounter::new(),
            disconnects: DerivableCounter::new(),
            sessions_expired: DerivableCounter::new(),
        }
    }
}

/// Previous published values for change detection.
#[derive(Default)]
struct PreviousValues {
    received: u64,
    sent: u64,
    connects: u64,
    clients_connected: u64,
    load_received: u64,
    load_sent: u64,
    load_connects: u64,
}

/// Publishes aggregate `$SYS` statistics from the lead worker's tick.
pub struct StatsPublisher {
    interval: Duration,
    version_published: bool,
    prev: PreviousValues,
}

impl StatsPublisher {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            version_published: false,
            prev: PreviousValues::default(),
        }
    }

    /// Aggregate peer counters and publish every changed topic.
    pub fn publish(
        &mut self,
        peers: &[std::sync::Arc<WorkerCounters>],
        clients_connected: u64,
        store: &dyn SubscriptionStore,
    ) {
        if !self.version_published {
            self.version_published = true;
            let payload = format!("emberq {}", env!("CARGO_PKG_VERSION"));
            publish_retained(store, topics::VERSION, Bytes::from(payload));
        }

        let received: u64 = peers.iter().map(|c| c.received_messages.get()).sum();
        let sent: u64 = peers.iter().map(|c| c.sent_messages.get()).sum();
        let connects: u64 = peers.iter().map(|c| c.mqtt_connects.get()).sum();

        let load_received: f64 = peers
            .iter()
            .map(|c| c.received_messages.derive(self.interval))
            .sum();
        let load_sent: f64 = peers
            .iter()
            .map(|c| c.sent_messages.derive(self.interval))
            .sum();
        let load_connects: f64 = peers
            .iter()
            .map(|c| c.mqtt_connects.derive(self.interval))
            .sum();

        if received != self.prev.received {
            self.prev.received = received;
            publish_u64(store, topics::MESSAGES_RECEIVED, received);
        }
        if sent != self.prev.sent {
            self.prev.sent = sent;
            publish_u64(store, topics::MESSAGES_SENT, sent);
        }
        if connects != self.prev.connects {
            self.prev.connects = connects;
            publish_u64(store, topics::CONNECTIONS_TOTAL, connects);
        }
        if clients_connected != self.prev.clients_connected {
            self.prev.clients_connected = clients_connected;
            publish_u64(store, topics::CLIENTS_CONNECTED, clients_connected);
        }

        if rate_changed(load_received, &mut self.prev.load_received) {
            publish_rate(store, topics::LOAD_MESSAGES_RECEIVED, load_received);
        }
        if rate_changed(load_sent, &mut self.prev.load_sent) {
            publish_rate(store, topics::LOAD_MESSAGES_SENT, load_sent);
        }
        if rate_changed(load_connects, &mut self.prev.load_connects) {
            publish_rate(store, topics::LOAD_CONNECTIONS, load_connects);
        }
    }
}

/// Fixed-point (two decimal) change detection for rate values.
#[inline]
fn rate_changed(value: f64, prev: &mut u64) -> bool {
    let fixed = (value * 100.0) as u64;
    if fixed != *prev {
        *prev = fixed;
        true
    } else {
        false
    }
}

fn publish_retained(store: &dyn SubscriptionStore, topic: &'static str, payload: Bytes) {
    store.publish(&Message::new(topic, QoS::AtMostOnce, true, payload));
}

fn publish_u64(store: &dyn SubscriptionStore, topic: &'static str, value: u64) {
    let mut buf = itoa::Buffer::new();
    let formatted = buf.format(value);
    publish_retained(store, topic, Bytes::copy_from_slice(formatted.as_bytes()));
}

/// Publish a rate as "X.XX" without going through float formatting.
fn publish_rate(store: &dyn SubscriptionStore, topic: &'static str, value: f64) {
    let fixed = (value * 100.0) as u64;
    let mut int_buf = itoa::Buffer::new();
    let mut dec_buf = itoa::Buffer::new();
    let int_str = int_buf.format(fixed / 100);
    let dec = fixed % 100;

    let mut out = [0u8; 24];
    let n = int_str.len();
    out[..n].copy_from_slice(int_str.as_bytes());
    out[n] = b'.';
    let mut pos = n + 1;
    if dec < 10 {
        out[pos] = b'0';
        pos += 1;
    }
    let dec_str = dec_buf.format(dec);
    out[pos..pos + dec_str.len()].copy_from_slice(dec_str.as_bytes());
    pos += dec_str.len();

    publish_retained(store, topic, Bytes::copy_from_slice(&out[..pos]));
}
