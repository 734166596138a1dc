//! Collaborator contracts for the routing and session layers.
//!
//! The worker core does not walk the topic tree or store sessions; it
//! hands messages to a [`SubscriptionStore`] and drives the lifecycle of
//! a [`SessionStore`] through its sweep timer.

use std::time::Instant;

use crate::message::Message;

/// Routes a message to matching subscribers.
///
/// `publish` is synchronous on the calling worker; delivery to clients
/// owned by peer workers happens via tasks inside the store (the task
/// queue is the only cross-thread write channel into a worker).
pub trait SubscriptionStore: Send + Sync + 'static {
    fn publish(&self, message: &Message);
}

/// Persistent-session storage. Sessions survive disconnection for
/// v3.1.1 clean-session=false and v5 session-expiry>0 clients; the only
/// lifecycle event the worker core drives is expiration.
pub trait SessionStore: Send + Sync + 'static {
    /// Drop sessions whose expiry deadline has passed. Returns the
    /// number removed; the worker accounts for them in its counters.
    fn remove_expired(&self, now: Instant) -> usize;
}

/// A subscription store that drops everything. Useful for tests and for
/// hosts bringing up workers before the routing layer.
#[derive(Debug, Default)]
pub struct NullSubscriptionStore;

impl SubscriptionStore for NullSubscriptionStore {
    fn publish(&self, _message: &Message) {}
}

/// A session store with no sessions.
#[derive(Debug, Default)]
pub struct NullSessionStore;

impl SessionStore for NullSessionStore {
    fn remove_expired(&self, _now: Instant) -> usize {
        0
    }
}
