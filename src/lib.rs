//! emberq - the worker-thread core of a multi-threaded MQTT broker.
//!
//! emberq owns the concurrency backbone of a broker: N pinned worker
//! threads, each running a readiness-driven event loop over its own set
//! of clients, with cross-thread influence flowing exclusively through
//! posted tasks and a coalescing wakeup handle. It enforces keep-alive
//! deadlines, orchestrates last-will publication and the two-barrier
//! graceful shutdown, publishes `$SYS` statistics, and binds a
//! host-provided authentication plugin to every worker thread.
//!
//! What it deliberately does not do: parse MQTT packets, walk the topic
//! tree, or store retained messages and sessions. Those are external
//! collaborators plugged in through the [`ClientIO`], [`SubscriptionStore`]
//! and [`SessionStore`] traits:
//!
//! ```no_run
//! use std::sync::Arc;
//! use emberq::{Fleet, Settings};
//! use emberq::plugin::AllowAllPlugin;
//! use emberq::store::{NullSessionStore, NullSubscriptionStore};
//! # use std::time::Instant;
//! # use emberq::{Client, ClientIO, IoOutcome, WorkerCtx, DisconnectReason};
//! # struct MyCodec;
//! # impl ClientIO for MyCodec {
//! #     fn on_readable(&self, _: &mut WorkerCtx<'_>, _: &Arc<Client>) -> IoOutcome { IoOutcome::Idle }
//! #     fn on_writable(&self, _: &mut WorkerCtx<'_>, _: &Arc<Client>) -> IoOutcome { IoOutcome::Idle }
//! #     fn queue_disconnect(&self, _: &mut WorkerCtx<'_>, _: &Arc<Client>, _: DisconnectReason) {}
//! # }
//!
//! let settings = Arc::new(Settings::load("emberq.toml")?);
//! let fleet = Fleet::start(
//!     settings,
//!     Arc::new(MyCodec),
//!     Arc::new(NullSubscriptionStore),
//!     Arc::new(NullSessionStore),
//!     Arc::new(AllowAllPlugin),
//! )?;
//! // An external acceptor hands connections over:
//! // fleet.give_client(stream, addr)?;
//! # Ok::<(), emberq::Error>(())
//! ```

pub mod buffer;
pub mod cleanup;
pub mod client;
pub mod error;
pub mod fleet;
pub mod io;
pub mod keepalive;
pub mod message;
pub mod plugin;
pub mod registry;
pub mod settings;
pub mod stats;
pub mod store;
pub mod task_queue;
pub mod will;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use client::{Client, ClientState};
pub use error::{Error, Result};
pub use fleet::Fleet;
pub use io::{ClientIO, IoOutcome, WorkerCtx};
pub use message::{DisconnectReason, Message, ProtocolVersion, QoS, UserProperty, WillMessage};
pub use plugin::{AclAccess, AuthPlugin, AuthResult, ExtendedAuthStage, PLUGIN_VERSION};
pub use settings::Settings;
pub use store::{SessionStore, SubscriptionStore};
pub use worker::{ThreadCore, WorkerShared};
