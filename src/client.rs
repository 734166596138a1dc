//! A connected peer and its ephemeral state.
//!
//! A `Client` is owned by exactly one worker for its entire connected
//! lifetime: its handle appears in exactly one registry and one
//! multiplexer. It is shared as `Arc<Client>` so transient holders
//! (keep-alive checks, the removal queue) can hold `Weak` references and
//! resolve them on use.
//!
//! Cross-thread writes (publish fan-out from the subscription store, the
//! stats path) go through the mutex-protected write buffer; the
//! empty→non-empty transition flips epoll write interest directly with
//! `epoll_ctl`, which is thread-safe, guarded by an atomic flag to avoid
//! redundant syscalls.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::Token;
use parking_lot::Mutex;

use crate::buffer::RingBuffer;
use crate::message::{DisconnectReason, ProtocolVersion, WillMessage};
use crate::settings::Settings;
use crate::stats::WorkerCounters;

/// Process-wide steady-clock epoch for the compact last-activity stamp.
static EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Lifecycle state of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    /// Socket accepted, CONNECT not yet processed.
    Connecting = 0,
    /// CONNECT accepted.
    Connected = 1,
    /// Queued for removal; no further packets are processed.
    Disconnecting = 2,
}

impl ClientState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ClientState::Connecting,
            1 => ClientState::Connected,
            _ => ClientState::Disconnecting,
        }
    }
}

/// Identity negotiated at CONNECT time.
#[derive(Debug, Default)]
pub struct ClientIdentity {
    pub client_id: Option<String>,
    pub username: Option<String>,
    /// Key into the external session store, set for persistent sessions.
    pub session_key: Option<String>,
}

/// Result of draining the socket into the read buffer.
#[derive(Debug, Clone, Copy)]
pub struct ReadStatus {
    pub bytes: usize,
    pub eof: bool,
}

pub struct Client {
    token: Token,
    addr: SocketAddr,
    stream: Mutex<TcpStream>,
    /// The owning worker's epoll fd, for thread-safe interest updates.
    epoll_fd: RawFd,
    socket_fd: RawFd,
    read_buf: Mutex<RingBuffer>,
    write_buf: Mutex<RingBuffer>,
    /// Guard to avoid redundant epoll_ctl calls.
    ready_for_writing: AtomicBool,
    state: AtomicU8,
    /// A graceful disconnect discards the will.
    graceful: AtomicBool,
    /// Millis since EPOCH of the last received packet.
    last_activity_ms: AtomicU64,
    /// Negotiated keep-alive seconds; 0 disables the check.
    keep_alive: AtomicU16,
    protocol_version: AtomicU8,
    identity: Mutex<ClientIdentity>,
    will: Mutex<Option<WillMessage>>,
    disconnect_reason: Mutex<Option<DisconnectReason>>,
    counters: Arc<WorkerCounters>,
}

impl Client {
    pub fn new(
        token: Token,
        stream: TcpStream,
        addr: SocketAddr,
        epoll_fd: RawFd,
        counters: Arc<WorkerCounters>,
        settings: &Settings,
    ) -> Self {
        let socket_fd = stream.as_raw_fd();
        let read_limit = settings.limits.read_buffer_limit;
        let client = Self {
            token,
            addr,
            stream: Mutex::new(stream),
            epoll_fd,
            socket_fd,
            read_buf: Mutex::new(RingBuffer::new(read_limit, read_limit)),
            write_buf: Mutex::new(RingBuffer::new(
                settings.limits.write_buffer_soft_limit,
                settings.limits.write_buffer_hard_limit,
            )),
            ready_for_writing: AtomicBool::new(false),
            state: AtomicU8::new(ClientState::Connecting as u8),
            graceful: AtomicBool::new(false),
            last_activity_ms: AtomicU64::new(0),
            keep_alive: AtomicU16::new(settings.session.default_keep_alive),
            protocol_version: AtomicU8::new(ProtocolVersion::V311 as u8),
            identity: Mutex::new(ClientIdentity::default()),
            will: Mutex::new(None),
            disconnect_reason: Mutex::new(None),
            counters,
        };
        client.touch(Instant::now());
        client
    }

    #[inline]
    pub fn token(&self) -> Token {
        self.token
    }

    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[inline]
    pub fn counters(&self) -> &Arc<WorkerCounters> {
        &self.counters
    }

    /// Access the underlying stream, for multiplexer (de)registration by
    /// the owning worker.
    pub fn with_stream<R>(&self, f: impl FnOnce(&mut TcpStream) -> R) -> R {
        f(&mut self.stream.lock())
    }

    /// Drain the socket into the read buffer (edge-triggered: reads
    /// until WouldBlock). An overflowing peer surfaces as `OutOfMemory`.
    pub fn fill_read_buffer(&self) -> io::Result<ReadStatus> {
        let mut stream = self.stream.lock();
        let mut read_buf = self.read_buf.lock();
        let mut tmp = [0u8; 8192];
        let mut total = 0;
        let mut eof = false;
        loop {
            match stream.read(&mut tmp) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => {
                    read_buf.write_bytes(&tmp[..n])?;
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(ReadStatus { bytes: total, eof })
    }

    /// Run a closure over the buffered inbound bytes. Used by the codec
    /// collaborator to consume packets.
    pub fn with_read_buf<R>(&self, f: impl FnOnce(&mut RingBuffer) -> R) -> R {
        f(&mut self.read_buf.lock())
    }

    /// Queue outbound bytes. Safe from any thread. Flips write interest
    /// on the empty→non-empty transition.
    ///
    /// Errors: `WouldBlock` above the soft watermark (caller may drop
    /// QoS 0 traffic), `OutOfMemory` at the hard cap (caller disconnects).
    pub fn queue_bytes(&self, data: &[u8]) -> io::Result<()> {
        {
            let mut write_buf = self.write_buf.lock();
            write_buf.write_bytes(data)?;
        }
        self.set_ready_for_writing(true);
        Ok(())
    }

    /// Flush the write buffer to the socket. Called by the owning worker
    /// only. Returns Ok(true) when fully drained, Ok(false) on partial
    /// write (socket full).
    pub fn flush(&self) -> io::Result<bool> {
        loop {
            let mut stream = self.stream.lock();
            let mut write_buf = self.write_buf.lock();
            if write_buf.is_empty() {
                // Clear the ready flag while holding the lock; a
                // concurrent queue_bytes after release sets it again.
                self.set_ready_for_writing(false);
                return Ok(true);
            }

            let slices = write_buf.as_io_slices();
            match stream.write_vectored(&slices) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "connection closed during flush",
                    ))
                }
                Ok(n) => {
                    write_buf.consume(n);
                    write_buf.maybe_shrink();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    #[inline]
    pub fn has_pending_writes(&self) -> bool {
        !self.write_buf.lock().is_empty()
    }

    /// Update epoll interest. The atomic guard makes repeated calls with
    /// the same value free.
    pub fn set_ready_for_writing(&self, val: bool) {
        if self.ready_for_writing.load(Ordering::Relaxed) == val {
            return;
        }
        if self.ready_for_writing.swap(val, Ordering::Release) == val {
            return;
        }

        let events = if val {
            (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLET) as u32
        } else {
            (libc::EPOLLIN | libc::EPOLLET) as u32
        };

        let mut ev = libc::epoll_event {
            events,
            u64: self.token.0 as u64,
        };

        // epoll_ctl is thread-safe.
        unsafe {
            libc::epoll_ctl(
                self.epoll_fd,
                libc::EPOLL_CTL_MOD,
                self.socket_fd,
                &mut ev,
            );
        }
    }

    /// Record packet activity. The keep-alive scheduler observes this
    /// lazily when a bucket fires.
    #[inline]
    pub fn touch(&self, now: Instant) {
        let ms = now.saturating_duration_since(*EPOCH).as_millis() as u64;
        self.last_activity_ms.store(ms, Ordering::Relaxed);
    }

    #[inline]
    pub fn last_activity(&self) -> Instant {
        *EPOCH + Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    #[inline]
    pub fn keep_alive(&self) -> u16 {
        self.keep_alive.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_keep_alive(&self, secs: u16) {
        self.keep_alive.store(secs, Ordering::Relaxed);
    }

    #[inline]
    pub fn protocol_version(&self) -> ProtocolVersion {
        ProtocolVersion::from_u8(self.protocol_version.load(Ordering::Relaxed))
            .unwrap_or(ProtocolVersion::V311)
    }

    #[inline]
    pub fn set_protocol_version(&self, version: ProtocolVersion) {
        self.protocol_version.store(version as u8, Ordering::Relaxed);
    }

    #[inline]
    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Mark the CONNECT handshake complete.
    pub fn mark_connected(&self) {
        let _ = self.state.compare_exchange(
            ClientState::Connecting as u8,
            ClientState::Connected as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Transition to Disconnecting, recording the first reason. Returns
    /// true on the first call; later calls are no-ops so removal stays
    /// idempotent.
    pub fn begin_disconnect(&self, reason: DisconnectReason) -> bool {
        let prev = self.state.swap(ClientState::Disconnecting as u8, Ordering::AcqRel);
        if prev == ClientState::Disconnecting as u8 {
            return false;
        }
        let mut slot = self.disconnect_reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
        true
    }

    #[inline]
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        *self.disconnect_reason.lock()
    }

    /// Mark a protocol-level (graceful) disconnect. Discards the will
    /// unless the codec re-arms it (v5 "disconnect with will").
    pub fn mark_graceful(&self) {
        self.graceful.store(true, Ordering::Release);
        self.will.lock().take();
    }

    #[inline]
    pub fn is_graceful(&self) -> bool {
        self.graceful.load(Ordering::Acquire)
    }

    pub fn set_will(&self, will: WillMessage) {
        *self.will.lock() = Some(will);
    }

    pub fn take_will(&self) -> Option<WillMessage> {
        self.will.lock().take()
    }

    pub fn has_will(&self) -> bool {
        self.will.lock().is_some()
    }

    pub fn identity(&self) -> &Mutex<ClientIdentity> {
        &self.identity
    }

    pub fn client_id(&self) -> Option<String> {
        self.identity.lock().client_id.clone()
    }

    pub fn set_client_id(&self, id: impl Into<String>) {
        self.identity.lock().client_id = Some(id.into());
    }

    pub fn username(&self) -> Option<String> {
        self.identity.lock().username.clone()
    }

    pub fn set_username(&self, username: impl Into<String>) {
        self.identity.lock().username = Some(username.into());
    }

    /// Shut down the socket. Deregistration happens separately in the
    /// owning worker's removal path.
    pub fn shutdown_socket(&self) {
        let stream = self.stream.lock();
        let _ = stream.shutdown(std::net::Shutdown::Both);
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("token", &self.token.0)
            .field("addr", &self.addr)
            .field("state", &self.state())
            .field("keep_alive", &self.keep_alive())
            .finish()
    }
}
