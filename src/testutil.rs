//! Shared test fixtures: a newline-delimited test codec, recording and
//! forwarding subscription stores, counting collaborators, and a
//! single-worker core harness driven one iteration at a time.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use mio::net::TcpStream;
use mio::{Events, Poll, Token, Waker};
use parking_lot::Mutex;

use crate::client::Client;
use crate::error::Result;
use crate::io::{ClientIO, IoOutcome, WorkerCtx};
use crate::message::{DisconnectReason, Message, QoS, UserProperty, WillMessage};
use crate::plugin::{
    AclAccess, AclRequest, AuthPlugin, AuthResult, PluginOpts, ThreadMemory, PLUGIN_VERSION,
};
use crate::settings::Settings;
use crate::store::{SessionStore, SubscriptionStore};
use crate::task_queue::task_channel;
use crate::worker::{ThreadCore, WorkerShared, WAKE_TOKEN};

/// A minimal newline-delimited codec standing in for the MQTT parser:
///
/// - `CONNECT <id> <keepalive>` → `CONNACK ok` / `CONNACK denied`
/// - `WILL <topic> <payload>`   → stores the client's will
/// - `PUB <topic> <payload>`    → publishes through the store
/// - `PING`                     → `PONG`
/// - `QUIT`                     → graceful disconnect, will discarded
#[derive(Default)]
pub(crate) struct LineCodec {
    /// Partial-line carry per (worker, token).
    carry: Mutex<AHashMap<(usize, Token), Vec<u8>>>,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn reply(&self, ctx: &mut WorkerCtx<'_>, client: &Arc<Client>, text: &str) {
        if client.queue_bytes(text.as_bytes()).is_ok() {
            ctx.counters.sent_messages.inc();
        }
    }

    fn process_line(
        &self,
        ctx: &mut WorkerCtx<'_>,
        client: &Arc<Client>,
        line: &str,
    ) -> Option<DisconnectReason> {
        let mut parts = line.splitn(3, ' ');
        match parts.next().unwrap_or("") {
            "CONNECT" => {
                let id = parts.next().unwrap_or("anon").to_string();
                let keep_alive: u16 = parts
                    .next()
                    .and_then(|s| s.trim().parse().ok())
                    .unwrap_or(0);
                match ctx.plugin.login_check(&id, "", None) {
                    AuthResult::Success => {
                        client.set_client_id(&id);
                        client.set_username(&id);
                        client.set_keep_alive(keep_alive.min(ctx.settings.session.max_keep_alive));
                        client.mark_connected();
                        ctx.counters.mqtt_connects.inc();
                        ctx.arm_keep_alive(client, Instant::now());
                        self.reply(ctx, client, "CONNACK ok\n");
                        None
                    }
                    AuthResult::Error => {
                        self.reply(ctx, client, "CONNACK error\n");
                        Some(DisconnectReason::AuthenticationFailed)
                    }
                    _ => {
                        self.reply(ctx, client, "CONNACK denied\n");
                        Some(DisconnectReason::AuthenticationFailed)
                    }
                }
            }
            "WILL" => {
                let topic = parts.next().unwrap_or("").to_string();
                let payload = parts.next().unwrap_or("").as_bytes().to_vec();
                client.set_will(WillMessage::new(Message::new(
                    topic,
                    QoS::AtMostOnce,
                    false,
                    payload,
                )));
                None
            }
            "PUB" => {
                let topic = parts.next().unwrap_or("").to_string();
                let payload = parts.next().unwrap_or("").as_bytes().to_vec();
                let client_id = client.client_id().unwrap_or_default();
                let username = client.username().unwrap_or_default();
                let verdict = ctx.plugin.acl_check(
                    AclAccess::Write,
                    &client_id,
                    &username,
                    &topic,
                    QoS::AtMostOnce,
                    false,
                    None,
                );
                if verdict == AuthResult::Success {
                    ctx.subscriptions
                        .publish(&Message::new(topic, QoS::AtMostOnce, false, payload));
                }
                None
            }
            "PING" => {
                self.reply(ctx, client, "PONG\n");
                None
            }
            "QUIT" => {
                client.mark_graceful();
                Some(DisconnectReason::NormalDisconnect)
            }
            _ => Some(DisconnectReason::ProtocolError),
        }
    }
}

impl ClientIO for LineCodec {
    fn on_readable(&self, ctx: &mut WorkerCtx<'_>, client: &Arc<Client>) -> IoOutcome {
        let key = (ctx.worker_id, client.token());
        let mut buffered = {
            let mut carry = self.carry.lock();
            std::mem::take(carry.entry(key).or_default())
        };
        client.with_read_buf(|buf| buf.drain_into(&mut buffered));

        let mut outcome = IoOutcome::Idle;
        while let Some(pos) = buffered.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = buffered.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes[..line_bytes.len() - 1])
                .trim()
                .to_string();
            if line.is_empty() {
                continue;
            }
            client.touch(Instant::now());
            ctx.counters.received_messages.inc();
            if let Some(reason) = self.process_line(ctx, client, &line) {
                outcome = IoOutcome::Disconnect(reason);
                break;
            }
        }

        self.carry.lock().insert(key, buffered);
        outcome
    }

    fn on_writable(&self, _ctx: &mut WorkerCtx<'_>, _client: &Arc<Client>) -> IoOutcome {
        IoOutcome::Idle
    }

    fn queue_disconnect(
        &self,
        ctx: &mut WorkerCtx<'_>,
        client: &Arc<Client>,
        reason: DisconnectReason,
    ) {
        self.reply(ctx, client, &format!("DISCONNECT {}\n", reason));
    }
}

/// Records every published message.
#[derive(Default)]
pub(crate) struct RecordingStore {
    pub published: Mutex<Vec<Message>>,
}

impl SubscriptionStore for RecordingStore {
    fn publish(&self, message: &Message) {
        self.published.lock().push(message.clone());
    }
}

impl RecordingStore {
    pub fn count_topic(&self, topic: &str) -> usize {
        self.published.lock().iter().filter(|m| m.topic == topic).count()
    }

    pub fn wait_for_topic(&self, topic: &str, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if self.count_topic(topic) > 0 {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

/// Single-level-wildcard topic matching for the forwarding store.
pub(crate) fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (None, None) => return true,
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(a), Some(b)) if a == b => {}
            _ => return false,
        }
    }
}

/// A store that records publishes and forwards matching ones to
/// registered subscriber clients by posting a delivery task to the
/// subscriber's owning worker, the way a real routing layer would.
#[derive(Default)]
pub(crate) struct ForwardingStore {
    pub published: Mutex<Vec<Message>>,
    subscribers: Mutex<Vec<(String, Weak<Client>, Arc<WorkerShared>)>>,
}

impl ForwardingStore {
    pub fn subscribe(&self, filter: &str, client: &Arc<Client>, worker: Arc<WorkerShared>) {
        self.subscribers
            .lock()
            .push((filter.to_string(), Arc::downgrade(client), worker));
    }
}

impl SubscriptionStore for ForwardingStore {
    fn publish(&self, message: &Message) {
        self.published.lock().push(message.clone());
        let line = format!(
            "MSG {} {}\n",
            message.topic,
            String::from_utf8_lossy(&message.payload)
        );
        for (filter, weak, worker) in self.subscribers.lock().iter() {
            if !topic_matches(filter, &message.topic) {
                continue;
            }
            let weak = weak.clone();
            let line = line.clone();
            worker.post(move |core| {
                if let Some(subscriber) = weak.upgrade() {
                    if subscriber.queue_bytes(line.as_bytes()).is_ok() {
                        core.shared.counters().sent_messages.inc();
                    }
                }
            });
        }
    }
}

/// Session store reporting a fixed expiry count on first sweep.
#[derive(Default)]
pub(crate) struct CountingSessionStore {
    remaining: Mutex<usize>,
    pub sweeps: AtomicUsize,
}

impl CountingSessionStore {
    pub fn set_expired(&self, count: usize) {
        *self.remaining.lock() = count;
    }
}

impl SessionStore for CountingSessionStore {
    fn remove_expired(&self, _now: Instant) -> usize {
        self.sweeps.fetch_add(1, Ordering::SeqCst);
        std::mem::take(&mut *self.remaining.lock())
    }
}

/// Plugin that counts lifecycle calls and can misbehave on demand.
#[derive(Default)]
pub(crate) struct TestPlugin {
    pub inits: AtomicUsize,
    pub periodics: AtomicUsize,
    pub reported_version: Option<i32>,
    /// Usernames whose login panics (plugin isolation scenarios).
    pub panic_logins: Vec<String>,
    /// Usernames whose login is denied.
    pub deny_logins: Vec<String>,
}

impl AuthPlugin for TestPlugin {
    fn plugin_version(&self) -> i32 {
        self.reported_version.unwrap_or(PLUGIN_VERSION)
    }

    fn allocate_thread_memory(&self, _opts: &PluginOpts) -> Result<ThreadMemory> {
        Ok(Box::new(()))
    }

    fn deallocate_thread_memory(&self, _memory: ThreadMemory, _opts: &PluginOpts) {}

    fn init(&self, _memory: &mut ThreadMemory, _opts: &PluginOpts, _reloading: bool) -> Result<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn deinit(
        &self,
        _memory: &mut ThreadMemory,
        _opts: &PluginOpts,
        _reloading: bool,
    ) -> Result<()> {
        Ok(())
    }

    fn periodic_event(&self, _memory: &mut ThreadMemory) {
        self.periodics.fetch_add(1, Ordering::SeqCst);
    }

    fn login_check(
        &self,
        _memory: &mut ThreadMemory,
        username: &str,
        _password: &str,
        _user_properties: Option<&[UserProperty]>,
    ) -> AuthResult {
        if self.panic_logins.iter().any(|u| u == username) {
            panic!("login_check blew up for {}", username);
        }
        if self.deny_logins.iter().any(|u| u == username) {
            AuthResult::LoginDenied
        } else {
            AuthResult::Success
        }
    }

    fn acl_check(
        &self,
        _memory: &mut ThreadMemory,
        _access: AclAccess,
        _client_id: &str,
        _username: &str,
        _request: &AclRequest<'_>,
    ) -> AuthResult {
        AuthResult::Success
    }
}

/// A single worker core plus its collaborators, driven manually with
/// `pump` for deterministic iteration-by-iteration tests.
pub(crate) struct CoreHarness {
    pub core: ThreadCore,
    pub shared: Arc<WorkerShared>,
    pub store: Arc<RecordingStore>,
    pub sessions: Arc<CountingSessionStore>,
    pub plugin: Arc<TestPlugin>,
    pub events: Events,
}

impl CoreHarness {
    pub fn new(settings: Settings) -> Self {
        Self::with_plugin(settings, Arc::new(TestPlugin::default()))
    }

    pub fn with_plugin(settings: Settings, plugin: Arc<TestPlugin>) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let unhealthy = Arc::new(AtomicBool::new(false));
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN).unwrap());
        let (tasks, task_rx) = task_channel(waker);
        let shared = Arc::new(WorkerShared::new(0, tasks, unhealthy));
        let store = Arc::new(RecordingStore::default());
        let sessions = Arc::new(CountingSessionStore::default());
        let core = ThreadCore::new(
            shared.clone(),
            vec![shared.clone()],
            poll,
            task_rx,
            Arc::new(settings),
            Arc::new(LineCodec::new()),
            store.clone(),
            sessions.clone(),
            plugin.clone(),
        )
        .unwrap();
        Self {
            core,
            shared,
            store,
            sessions,
            plugin,
            events: Events::with_capacity(256),
        }
    }

    /// Accept a fresh loopback connection into the worker and return the
    /// peer side with a read timeout preset.
    pub fn connect_peer(&mut self) -> std::net::TcpStream {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, addr) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let stream = TcpStream::from_std(accepted);
        self.core.give_client(stream, addr).unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        peer
    }

    /// Run loop iterations until `deadline` from now has elapsed.
    pub fn pump_for(&mut self, duration: Duration) {
        let start = Instant::now();
        while start.elapsed() < duration {
            self.core.run_once(&mut self.events).unwrap();
        }
    }

    /// Run loop iterations until the predicate holds or the timeout is
    /// hit. Returns whether the predicate held.
    pub fn pump_until(&mut self, timeout: Duration, mut pred: impl FnMut(&Self) -> bool) -> bool {
        let start = Instant::now();
        loop {
            self.core.run_once(&mut self.events).unwrap();
            if pred(self) {
                return true;
            }
            if start.elapsed() > timeout {
                return false;
            }
        }
    }
}

/// Read lines from a peer socket until `needle` appears or EOF/timeout.
pub(crate) fn read_until(peer: &mut std::net::TcpStream, needle: &str) -> String {
    use std::io::Read;
    let mut collected = String::new();
    let mut buf = [0u8; 1024];
    loop {
        match peer.read(&mut buf) {
            Ok(0) => return collected,
            Ok(n) => {
                collected.push_str(&String::from_utf8_lossy(&buf[..n]));
                if collected.contains(needle) {
                    return collected;
                }
            }
            Err(_) => return collected,
        }
    }
}

/// Blocking read of everything until EOF (or timeout error).
pub(crate) fn read_to_eof(peer: &mut std::net::TcpStream) -> String {
    use std::io::Read;
    let mut collected = String::new();
    let mut buf = [0u8; 1024];
    loop {
        match peer.read(&mut buf) {
            Ok(0) => return collected,
            Ok(n) => collected.push_str(&String::from_utf8_lossy(&buf[..n])),
            Err(_) => return collected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("a/b", "a/b"));
        assert!(topic_matches("a/+", "a/b"));
        assert!(topic_matches("a/#", "a/b/c"));
        assert!(!topic_matches("a/+", "a/b/c"));
        assert!(!topic_matches("a/b", "a/c"));
        assert!(topic_matches("#", "anything/at/all"));
    }
}
