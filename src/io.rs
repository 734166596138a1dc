//! The packet codec contract.
//!
//! The worker core owns sockets and buffers; the codec collaborator owns
//! the wire protocol. On readiness the core drains the socket into the
//! client's read buffer and hands the client to the codec, which
//! consumes packets, queues responses through `Client::queue_bytes`, and
//! reports an [`IoOutcome`]. Auth decisions happen through the
//! [`WorkerCtx`], so every plugin call runs on the owning worker thread
//! with that worker's plugin memory.

use std::sync::Arc;
use std::time::Instant;

use crate::client::Client;
use crate::keepalive::{keep_alive_window, KeepAliveScheduler};
use crate::message::{DisconnectReason, WillMessage};
use crate::plugin::PluginBinding;
use crate::settings::Settings;
use crate::stats::WorkerCounters;
use crate::store::SubscriptionStore;

/// Result of a codec I/O step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    /// Nothing further to do.
    Idle,
    /// Output was queued; the worker ensures write interest is armed.
    NeedsWrite,
    /// The client must be disconnected.
    Disconnect(DisconnectReason),
}

/// Per-call view of the owning worker, handed to the codec.
pub struct WorkerCtx<'a> {
    pub worker_id: usize,
    pub settings: &'a Arc<Settings>,
    pub counters: &'a Arc<WorkerCounters>,
    pub plugin: &'a mut PluginBinding,
    pub subscriptions: &'a Arc<dyn SubscriptionStore>,
    pub keepalive: &'a mut KeepAliveScheduler,
}

impl WorkerCtx<'_> {
    /// Arm the client's rechecking keep-alive check. Called by the codec
    /// once CONNECT has negotiated the real keep-alive; the one-shot
    /// handshake check from `give_client` dies on its own.
    pub fn arm_keep_alive(&mut self, client: &Arc<Client>, now: Instant) {
        let keep_alive = client.keep_alive();
        if keep_alive == 0 {
            return;
        }
        self.keepalive
            .schedule(client, now + keep_alive_window(keep_alive), true);
    }
}

/// The codec collaborator driven by the event loop.
///
/// Registration is edge-triggered: when `on_readable` runs, the read
/// buffer holds everything the socket had, and it will not be re-offered.
pub trait ClientIO: Send + Sync + 'static {
    /// Inbound bytes are waiting in the client's read buffer. Consume as
    /// many complete packets as possible.
    fn on_readable(&self, ctx: &mut WorkerCtx<'_>, client: &Arc<Client>) -> IoOutcome;

    /// The socket drained (fully or partially) after being write-blocked.
    /// A codec feeding from a session queue can top the buffer back up.
    fn on_writable(&self, ctx: &mut WorkerCtx<'_>, client: &Arc<Client>) -> IoOutcome;

    /// Queue a protocol DISCONNECT frame for the client. Used during the
    /// second shutdown barrier and wherever the protocol version calls
    /// for a reasoned disconnect.
    fn queue_disconnect(
        &self,
        ctx: &mut WorkerCtx<'_>,
        client: &Arc<Client>,
        reason: DisconnectReason,
    );

    /// The will to publish if this client disconnects ungracefully.
    /// Taking it is destructive; a will is published at most once.
    fn pending_will(&self, client: &Arc<Client>) -> Option<WillMessage> {
        client.take_will()
    }

    /// When the client last produced a packet. Codecs record activity
    /// with [`Client::touch`] as they consume packets; the keep-alive
    /// scheduler observes that stamp lazily when a bucket fires.
    fn last_activity(&self, client: &Arc<Client>) -> Instant {
        client.last_activity()
    }
}
