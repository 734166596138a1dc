//! Bucketed keep-alive enforcement.
//!
//! A client with non-zero negotiated keep-alive K must not go 1.5·K
//! seconds without a packet. Rescheduling on every received byte would
//! mean a map mutation per packet, so the check is lazy: checks sit in
//! buckets keyed by whole seconds, and when a bucket fires each check
//! resolves its weak reference and compares against the client's current
//! last-activity stamp. A still-lively client is re-armed for the
//! remainder of its window; a silent one is expired.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::client::{Client, ClientState};
use crate::io::ClientIO;

/// Keep-alive windows are 1.5 times the negotiated interval.
const GRACE_NUMERATOR: u64 = 3;
const GRACE_DENOMINATOR: u64 = 2;

/// Full tolerated silence for a keep-alive of `secs`.
pub fn keep_alive_window(secs: u16) -> Duration {
    Duration::from_millis(secs as u64 * 1000 * GRACE_NUMERATOR / GRACE_DENOMINATOR)
}

pub struct KeepAliveCheck {
    pub client: Weak<Client>,
    /// Whether a re-armed check is enqueued after this one fires lively.
    pub recheck: bool,
}

/// What the owner should do with a fired check.
#[derive(Debug, PartialEq, Eq)]
pub enum CheckVerdict {
    /// Client already gone or already disconnecting.
    Discard,
    /// Client within its window; re-armed if the check asked for it.
    Alive,
    /// Silent past 1.5·K (or never finished CONNECT): disconnect.
    Expired,
}

pub struct KeepAliveScheduler {
    epoch: Instant,
    /// Bucket second → checks due that second.
    buckets: BTreeMap<u64, Vec<KeepAliveCheck>>,
}

impl KeepAliveScheduler {
    pub fn new(now: Instant) -> Self {
        Self {
            epoch: now,
            buckets: BTreeMap::new(),
        }
    }

    /// Bucket key for a deadline: whole seconds since the epoch.
    fn bucket_of(&self, deadline: Instant) -> u64 {
        deadline.saturating_duration_since(self.epoch).as_secs()
    }

    /// Arm a check for `client` at `deadline`. Invariant: callers only
    /// arm at give_client time and at fire-re-arm time, so each live
    /// client has at most one active check.
    pub fn schedule(&mut self, client: &Arc<Client>, deadline: Instant, recheck: bool) {
        let bucket = self.bucket_of(deadline);
        self.buckets.entry(bucket).or_default().push(KeepAliveCheck {
            client: Arc::downgrade(client),
            recheck,
        });
    }

    /// Earliest instant any bucket is due, for the poll timeout.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.buckets
            .keys()
            .next()
            .map(|&secs| self.epoch + Duration::from_secs(secs))
    }

    /// Remove and return every check in a due bucket.
    pub fn take_due(&mut self, now: Instant) -> Vec<KeepAliveCheck> {
        let now_bucket = now.saturating_duration_since(self.epoch).as_secs();
        let later = self.buckets.split_off(&(now_bucket + 1));
        let due = std::mem::replace(&mut self.buckets, later);
        due.into_values().flatten().collect()
    }

    /// Evaluate a fired check and re-arm it when appropriate. The
    /// last-activity stamp is read lazily through the codec collaborator
    /// at this point, never on the packet hot path.
    pub fn evaluate(&mut self, check: KeepAliveCheck, now: Instant, io: &dyn ClientIO) -> CheckVerdict {
        let Some(client) = check.client.upgrade() else {
            return CheckVerdict::Discard;
        };
        if client.state() == ClientState::Disconnecting {
            return CheckVerdict::Discard;
        }

        let keep_alive = client.keep_alive();
        if keep_alive == 0 {
            // Keep-alive 0 disables the check for connected clients. A
            // client still mid-handshake with its initial window spent
            // never sent CONNECT and is expired instead.
            return if client.state() == ClientState::Connected {
                CheckVerdict::Discard
            } else {
                CheckVerdict::Expired
            };
        }

        let window = keep_alive_window(keep_alive);
        let idle = now.saturating_duration_since(io.last_activity(&client));
        if idle < window {
            if check.recheck {
                let remaining = ceil_to_secs(window - idle);
                self.schedule(&client, now + remaining, true);
            }
            CheckVerdict::Alive
        } else {
            CheckVerdict::Expired
        }
    }

    #[cfg(test)]
    pub fn pending_checks(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }
}

/// Round a duration up to whole seconds, the re-arm granularity.
fn ceil_to_secs(d: Duration) -> Duration {
    Duration::from_secs((d.as_millis() as u64).div_ceil(1000))
}
