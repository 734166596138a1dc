//! Worker thread core.
//!
//! Each worker owns:
//! - Its own mio `Poll` plus a `Waker` wakeup handle
//! - A registry of the clients pinned to it
//! - The receiving side of its task queue
//! - A keep-alive scheduler, removal queue, will orchestrator and the
//!   plugin's per-thread binding
//!
//! Cross-worker influence goes exclusively through posted tasks; workers
//! never touch each other's clients directly. Per-client errors
//! disconnect that client and nothing else; only an explicit quit or a
//! multiplexer-level failure ends the loop.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};

use crate::cleanup::RemovalQueue;
use crate::client::{Client, ClientState};
use crate::error::{Error, Result};
use crate::io::{ClientIO, IoOutcome, WorkerCtx};
use crate::keepalive::{keep_alive_window, CheckVerdict, KeepAliveScheduler};
use crate::message::DisconnectReason;
use crate::plugin::{AuthPlugin, PluginBinding};
use crate::registry::ClientRegistry;
use crate::settings::Settings;
use crate::stats::{StatsPublisher, WorkerCounters};
use crate::store::{SessionStore, SubscriptionStore};
use crate::task_queue::{Task, TaskSender};
use crate::will::WillOrchestrator;

/// Token reserved for the wakeup handle.
pub(crate) const WAKE_TOKEN: Token = Token(0);

/// First token handed to client connections.
const CLIENT_START: usize = 1;

/// Longest the loop sleeps even with no timer armed.
const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// The cross-thread surface of one worker. Everything here is safe to
/// touch from any thread; the rest of the worker lives in [`ThreadCore`]
/// and is owned by its thread alone.
pub struct WorkerShared {
    id: usize,
    tasks: TaskSender,
    registry: ClientRegistry,
    counters: Arc<WorkerCounters>,
    removals: RemovalQueue,
    running: AtomicBool,
    wills_queued: AtomicBool,
    disconnects_sent: AtomicBool,
    /// Process-level flag, shared by every worker of a fleet.
    unhealthy: Arc<AtomicBool>,
}

impl WorkerShared {
    pub(crate) fn new(id: usize, tasks: TaskSender, unhealthy: Arc<AtomicBool>) -> Self {
        Self {
            id,
            tasks,
            registry: ClientRegistry::new(),
            counters: Arc::new(WorkerCounters::new()),
            removals: RemovalQueue::new(),
            running: AtomicBool::new(true),
            wills_queued: AtomicBool::new(false),
            disconnects_sent: AtomicBool::new(false),
            unhealthy,
        }
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn counters(&self) -> &Arc<WorkerCounters> {
        &self.counters
    }

    #[inline]
    pub fn client_count(&self) -> usize {
        self.registry.count()
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Post a task to this worker and wake it.
    pub fn post(&self, task: impl FnOnce(&mut ThreadCore) + Send + 'static) {
        self.tasks.post(task);
    }

    /// Signal the wakeup handle without posting a task.
    pub fn wake(&self) {
        self.tasks.wake();
    }

    /// Queue a client for deferred removal. Safe from any thread.
    pub fn queue_removal(&self, client: &Arc<Client>) {
        self.removals.push(client);
        self.wake();
    }

    /// Post a task that stops accepting life-prolonging work. The loop
    /// exits once the shutdown barriers (wills, disconnects) complete.
    pub fn queue_quit(&self) {
        self.post(|core| {
            core.shared.running.store(false, Ordering::Release);
        });
    }

    /// Post a task applying new settings at the next loop iteration.
    /// Last write wins when several reloads land in one drain.
    pub fn queue_reload(&self, settings: Arc<Settings>) {
        self.post(move |core| core.apply_reload(settings));
    }

    /// First shutdown barrier: submit every pending will to the routing
    /// path.
    pub fn queue_send_wills(&self) {
        self.post(ThreadCore::send_all_wills);
    }

    /// Second shutdown barrier: send protocol DISCONNECTs and close.
    pub fn queue_send_disconnects(&self) {
        self.post(ThreadCore::send_all_disconnects);
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[inline]
    pub fn wills_queued(&self) -> bool {
        self.wills_queued.load(Ordering::Acquire)
    }

    #[inline]
    pub fn disconnects_sent(&self) -> bool {
        self.disconnects_sent.load(Ordering::Acquire)
    }
}

/// One worker's event loop and thread-local state.
pub struct ThreadCore {
    pub(crate) shared: Arc<WorkerShared>,
    /// All workers of the fleet (self included), for stats aggregation.
    peers: Vec<Arc<WorkerShared>>,
    poll: Poll,
    epoll_fd: RawFd,
    task_rx: Receiver<Task>,
    next_token: usize,
    settings: Arc<Settings>,
    io: Arc<dyn ClientIO>,
    subscriptions: Arc<dyn SubscriptionStore>,
    sessions: Arc<dyn SessionStore>,
    plugin: PluginBinding,
    keepalive: KeepAliveScheduler,
    wills: WillOrchestrator,
    stats: Option<StatsPublisher>,
    next_stats_tick: Option<Instant>,
    next_plugin_tick: Option<Instant>,
    next_session_sweep: Option<Instant>,
}

impl ThreadCore {
    /// Build the worker core. Must run on the owning thread: the plugin
    /// allocates its per-thread memory here.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shared: Arc<WorkerShared>,
        peers: Vec<Arc<WorkerShared>>,
        poll: Poll,
        task_rx: Receiver<Task>,
        settings: Arc<Settings>,
        io: Arc<dyn ClientIO>,
        subscriptions: Arc<dyn SubscriptionStore>,
        sessions: Arc<dyn SessionStore>,
        plugin: Arc<dyn AuthPlugin>,
    ) -> Result<Self> {
        let epoll_fd = poll.as_raw_fd();
        let plugin = PluginBinding::new(plugin, &settings.plugin)?;
        let now = Instant::now();
        let mut core = Self {
            shared,
            peers,
            poll,
            epoll_fd,
            task_rx,
            next_token: CLIENT_START,
            settings,
            io,
            subscriptions,
            sessions,
            plugin,
            keepalive: KeepAliveScheduler::new(now),
            wills: WillOrchestrator::new(),
            stats: None,
            next_stats_tick: None,
            next_plugin_tick: None,
            next_session_sweep: None,
        };
        core.reset_timers(now);
        Ok(core)
    }

    #[inline]
    fn is_lead(&self) -> bool {
        self.shared.id() == 0
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// Run the event loop until quit completes or a fatal error occurs.
    /// The plugin's per-thread memory is torn down on every exit path.
    pub fn run(&mut self) -> Result<()> {
        log::info!("worker {} starting", self.shared.id());
        if let Err(e) = self.plugin.init(false) {
            self.plugin.teardown();
            self.shared.unhealthy.store(true, Ordering::Release);
            return Err(e);
        }

        let result = self.run_loop();
        self.plugin.teardown();
        match &result {
            Ok(()) => log::info!("worker {} finished", self.shared.id()),
            Err(e) => {
                self.shared.unhealthy.store(true, Ordering::Release);
                log::error!("worker {} died: {}", self.shared.id(), e);
            }
        }
        result
    }

    fn run_loop(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(1024);
        while !self.should_exit() {
            self.run_once(&mut events)?;
        }
        Ok(())
    }

    /// The loop only exits once quit was requested AND both post-quit
    /// obligations have completed on this worker.
    fn should_exit(&self) -> bool {
        !self.shared.is_running()
            && self.shared.wills_queued()
            && self.shared.disconnects_sent()
    }

    /// One loop iteration: wait, then tasks → I/O readiness (read before
    /// write) → timers → removal queue. Tasks run first so a task that
    /// registers a client makes it visible within the same iteration.
    pub(crate) fn run_once(&mut self, events: &mut Events) -> Result<()> {
        let timeout = self.poll_timeout(Instant::now());
        match self.poll.poll(events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            // Multiplexer-level failure is fatal for this worker.
            Err(e) => return Err(Error::Io(e)),
        }

        self.drain_tasks();

        // Copy readiness out before dispatch; handlers mutate worker state.
        let mut ready: Vec<(Token, bool, bool, bool)> = Vec::new();
        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            ready.push((
                event.token(),
                event.is_readable(),
                event.is_writable(),
                event.is_error() || event.is_read_closed() || event.is_write_closed(),
            ));
        }

        for (token, readable, writable, closed) in ready {
            let Some(client) = self.shared.registry.get(token) else {
                continue;
            };
            if closed {
                self.disconnect(&client, DisconnectReason::ConnectionReset);
                continue;
            }
            if readable {
                self.handle_readable(&client);
            }
            if writable {
                self.handle_writable(&client);
            }
        }

        self.fire_timers(Instant::now());
        self.process_removals();
        Ok(())
    }

    /// Execute the tasks present at drain start. Tasks posted by tasks
    /// run in the next iteration, bounding per-iteration work.
    fn drain_tasks(&mut self) {
        let n = self.task_rx.len();
        if n == 0 {
            return;
        }
        let mut batch = Vec::with_capacity(n);
        for _ in 0..n {
            match self.task_rx.try_recv() {
                Ok(task) => batch.push(task),
                Err(_) => break,
            }
        }
        for task in batch {
            task(self);
        }
    }

    /// Wait no longer than the earliest pending timer, capped at 1s.
    fn poll_timeout(&self, now: Instant) -> Duration {
        let mut deadline = self.keepalive.next_deadline();
        deadline = earliest(deadline, self.next_stats_tick);
        deadline = earliest(deadline, self.next_plugin_tick);
        deadline = earliest(deadline, self.next_session_sweep);
        deadline = earliest(deadline, self.wills.next_timeout(now).map(|t| now + t));

        match deadline {
            Some(d) => d.saturating_duration_since(now).min(MAX_POLL_TIMEOUT),
            None => MAX_POLL_TIMEOUT,
        }
    }

    fn fire_timers(&mut self, now: Instant) {
        self.fire_keepalive(now);

        for will in self.wills.take_due(now) {
            self.subscriptions.publish(&will.message);
        }

        if let Some(tick) = self.next_stats_tick {
            if now >= tick {
                self.publish_stats();
                let interval = Duration::from_secs(self.settings.server.sys_interval.max(1));
                self.next_stats_tick = Some(now + interval);
            }
        }

        if let Some(tick) = self.next_plugin_tick {
            if now >= tick {
                self.plugin.periodic_event();
                let period = Duration::from_secs(self.settings.plugin.timer_period.max(1));
                self.next_plugin_tick = Some(now + period);
            }
        }

        if let Some(tick) = self.next_session_sweep {
            if now >= tick {
                let removed = self.sessions.remove_expired(now);
                if removed > 0 {
                    self.shared.counters.sessions_expired.add(removed as u64);
                    log::info!("worker {} expired {} sessions", self.shared.id(), removed);
                }
                let interval =
                    Duration::from_secs(self.settings.server.session_expiry_interval.max(1));
                self.next_session_sweep = Some(now + interval);
            }
        }
    }

    fn fire_keepalive(&mut self, now: Instant) {
        if self.keepalive.next_deadline().map_or(true, |d| d > now) {
            return;
        }
        let io = Arc::clone(&self.io);
        for check in self.keepalive.take_due(now) {
            let weak = check.client.clone();
            if self.keepalive.evaluate(check, now, io.as_ref()) == CheckVerdict::Expired {
                if let Some(client) = weak.upgrade() {
                    log::info!(
                        "worker {} client {:?} from {} exceeded its keep-alive window",
                        self.shared.id(),
                        client.client_id(),
                        client.addr()
                    );
                    self.disconnect(&client, DisconnectReason::KeepAliveTimeout);
                }
            }
        }
    }

    fn publish_stats(&mut self) {
        let Some(stats) = self.stats.as_mut() else {
            return;
        };
        let counters: Vec<Arc<WorkerCounters>> =
            self.peers.iter().map(|p| p.counters().clone()).collect();
        let clients: u64 = self.peers.iter().map(|p| p.client_count() as u64).sum();
        stats.publish(&counters, clients, self.subscriptions.as_ref());
    }

    /// Accept ownership of a connection. Registers the handle, inserts
    /// into the registry, stamps the initial keep-alive deadline and
    /// takes the initial edge-triggered read pass.
    pub fn give_client(&mut self, stream: TcpStream, addr: SocketAddr) -> Result<Token> {
        if !self.shared.is_running() {
            return Err(Error::ShuttingDown);
        }
        let token = Token(self.next_token);
        self.next_token += 1;

        let mut stream = stream;
        self.poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)
            .map_err(Error::Registration)?;

        let client = Arc::new(Client::new(
            token,
            stream,
            addr,
            self.epoll_fd,
            self.shared.counters().clone(),
            &self.settings,
        ));

        if let Err(e) = self.shared.registry.insert(client.clone()) {
            let _ = client.with_stream(|s| self.poll.registry().deregister(s));
            return Err(e);
        }

        // One-shot handshake check: it dies after its first firing. The
        // codec arms the long-lived rechecking check once CONNECT has
        // negotiated the real keep-alive (`WorkerCtx::arm_keep_alive`).
        let now = Instant::now();
        let window = keep_alive_window(self.settings.session.default_keep_alive);
        self.keepalive.schedule(&client, now + window, false);

        log::debug!(
            "worker {} accepted client {} as {:?}",
            self.shared.id(),
            addr,
            token
        );

        // Data that arrived before registration won't fire an event.
        self.handle_readable(&client);
        Ok(token)
    }

    fn handle_readable(&mut self, client: &Arc<Client>) {
        if client.state() == ClientState::Disconnecting {
            return;
        }

        let status = match client.fill_read_buffer() {
            Ok(status) => status,
            Err(e) if e.kind() == io::ErrorKind::OutOfMemory => {
                log::warn!(
                    "worker {} client {:?} from {} overflowed its read buffer",
                    self.shared.id(),
                    client.client_id(),
                    client.addr()
                );
                self.disconnect(client, DisconnectReason::BufferOverflow);
                return;
            }
            Err(_) => {
                self.disconnect(client, DisconnectReason::ConnectionReset);
                return;
            }
        };

        if status.bytes > 0 {
            let outcome = {
                let io = Arc::clone(&self.io);
                let mut ctx = WorkerCtx {
                    worker_id: self.shared.id(),
                    settings: &self.settings,
                    counters: &self.shared.counters,
                    plugin: &mut self.plugin,
                    subscriptions: &self.subscriptions,
                    keepalive: &mut self.keepalive,
                };
                io.on_readable(&mut ctx, client)
            };
            self.apply_outcome(client, outcome);

            // Optimistic flush: responses usually fit the socket buffer,
            // saving the round through a writable event.
            if client.state() != ClientState::Disconnecting && client.has_pending_writes() {
                if let Err(_e) = client.flush() {
                    self.disconnect(client, DisconnectReason::ConnectionReset);
                }
            }
        }

        if status.eof && client.state() != ClientState::Disconnecting {
            self.disconnect(client, DisconnectReason::ConnectionReset);
        }
    }

    fn handle_writable(&mut self, client: &Arc<Client>) {
        if client.state() == ClientState::Disconnecting {
            return;
        }
        match client.flush() {
            Ok(true) => {
                let outcome = {
                    let io = Arc::clone(&self.io);
                    let mut ctx = WorkerCtx {
                        worker_id: self.shared.id(),
                        settings: &self.settings,
                        counters: &self.shared.counters,
                        plugin: &mut self.plugin,
                        subscriptions: &self.subscriptions,
                        keepalive: &mut self.keepalive,
                    };
                    io.on_writable(&mut ctx, client)
                };
                self.apply_outcome(client, outcome);
            }
            Ok(false) => {}
            Err(_) => self.disconnect(client, DisconnectReason::ConnectionReset),
        }
    }

    fn apply_outcome(&mut self, client: &Arc<Client>, outcome: IoOutcome) {
        match outcome {
            IoOutcome::Idle => {}
            IoOutcome::NeedsWrite => client.set_ready_for_writing(true),
            IoOutcome::Disconnect(reason) => self.disconnect(client, reason),
        }
    }

    /// Transition a client to Disconnecting and queue it for removal.
    /// Later calls for the same client are no-ops.
    fn disconnect(&mut self, client: &Arc<Client>, reason: DisconnectReason) {
        if client.begin_disconnect(reason) {
            self.shared.removals.push(client);
        }
    }

    fn process_removals(&mut self) {
        if self.shared.removals.is_empty() {
            return;
        }
        for weak in self.shared.removals.drain() {
            let Some(client) = weak.upgrade() else {
                continue;
            };
            self.remove_client(&client);
        }
    }

    /// Tear a client down: drop from registry, deregister, flush what
    /// fits, close, and route the will on ungraceful disconnects.
    /// Idempotent: a second call finds the registry entry gone.
    fn remove_client(&mut self, client: &Arc<Client>) {
        let Some(client) = self.shared.registry.remove(client.token()) else {
            return;
        };
        let _ = client.with_stream(|s| self.poll.registry().deregister(s));
        // Final courtesy flush so queued CONNACK denials and DISCONNECT
        // frames reach the peer before the close.
        let _ = client.flush();
        client.shutdown_socket();
        self.shared.counters.disconnects.inc();

        let reason = client
            .disconnect_reason()
            .unwrap_or(DisconnectReason::ConnectionReset);
        log::info!(
            "worker {} removed client {:?} from {}: {}",
            self.shared.id(),
            client.client_id(),
            client.addr(),
            reason
        );

        if !client.is_graceful() {
            let io = Arc::clone(&self.io);
            if let Some(will) = io.pending_will(&client) {
                self.wills.queue(will, Instant::now());
            }
        }
    }

    /// First shutdown barrier: submit every pending will (client-held
    /// and orchestrator-queued, delays ignored) to the routing path,
    /// then latch the flag.
    pub(crate) fn send_all_wills(&mut self) {
        for client in self.shared.registry.snapshot() {
            let io = Arc::clone(&self.io);
            if let Some(will) = io.pending_will(&client) {
                self.subscriptions.publish(&will.message);
            }
        }
        for will in self.wills.flush_all() {
            self.subscriptions.publish(&will.message);
        }
        self.shared.wills_queued.store(true, Ordering::Release);
        log::info!("worker {} queued all wills", self.shared.id());
    }

    /// Second shutdown barrier: queue protocol DISCONNECT frames for
    /// every remaining client and close the connections.
    pub(crate) fn send_all_disconnects(&mut self) {
        for client in self.shared.registry.snapshot() {
            {
                let io = Arc::clone(&self.io);
                let mut ctx = WorkerCtx {
                    worker_id: self.shared.id(),
                    settings: &self.settings,
                    counters: &self.shared.counters,
                    plugin: &mut self.plugin,
                    subscriptions: &self.subscriptions,
                    keepalive: &mut self.keepalive,
                };
                io.queue_disconnect(&mut ctx, &client, DisconnectReason::ServerShutdown);
            }
            self.disconnect(&client, DisconnectReason::ServerShutdown);
        }
        self.shared.disconnects_sent.store(true, Ordering::Release);
        log::info!("worker {} sent shutdown disconnects", self.shared.id());
    }

    /// Apply reloaded settings: swap the local copy, cycle the plugin
    /// (deinit/init with reloading=true) and re-arm the periodic timers.
    pub(crate) fn apply_reload(&mut self, settings: Arc<Settings>) {
        log::info!("worker {} applying reloaded settings", self.shared.id());
        self.settings = settings;
        self.plugin.reload(&self.settings.plugin);
        self.reset_timers(Instant::now());
    }

    fn reset_timers(&mut self, now: Instant) {
        let server = &self.settings.server;
        if self.is_lead() && server.sys_interval > 0 {
            let interval = Duration::from_secs(server.sys_interval);
            self.stats = Some(StatsPublisher::new(interval));
            self.next_stats_tick = Some(now + interval);
        } else {
            self.stats = None;
            self.next_stats_tick = None;
        }

        self.next_plugin_tick = (self.settings.plugin.timer_period > 0)
            .then(|| now + Duration::from_secs(self.settings.plugin.timer_period));
        self.next_session_sweep = (server.session_expiry_interval > 0)
            .then(|| now + Duration::from_secs(server.session_expiry_interval));
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}
