//! The worker fleet.
//!
//! Starts N workers (one event loop thread each), assigns accepted
//! connections round-robin, fans out configuration reloads and drives
//! the two-barrier graceful shutdown:
//!
//! 1. quit is queued on every worker (`running = false`);
//! 2. every worker queues all pending wills to the routing path;
//! 3. only after ALL workers report wills queued are protocol
//!    DISCONNECT frames sent and connections closed.
//!
//! The barrier between 2 and 3 is what guarantees a client's will is
//! delivered to still-connected subscribers before those subscribers are
//! themselves disconnected.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Poll, Waker};

use crate::error::{Error, Result};
use crate::io::ClientIO;
use crate::plugin::{AuthPlugin, PLUGIN_VERSION};
use crate::settings::Settings;
use crate::store::{SessionStore, SubscriptionStore};
use crate::task_queue::task_channel;
use crate::worker::{ThreadCore, WorkerShared, WAKE_TOKEN};

pub struct Fleet {
    workers: Vec<Arc<WorkerShared>>,
    handles: Vec<JoinHandle<()>>,
    next_worker: AtomicUsize,
    unhealthy: Arc<AtomicBool>,
}

impl Fleet {
    /// Spawn the worker threads. The plugin's interface version is
    /// checked before anything starts.
    pub fn start(
        settings: Arc<Settings>,
        io: Arc<dyn ClientIO>,
        subscriptions: Arc<dyn SubscriptionStore>,
        sessions: Arc<dyn SessionStore>,
        plugin: Arc<dyn AuthPlugin>,
    ) -> Result<Self> {
        let actual = plugin.plugin_version();
        if actual != PLUGIN_VERSION {
            return Err(Error::PluginVersion {
                expected: PLUGIN_VERSION,
                actual,
            });
        }

        let count = settings.effective_workers();
        let unhealthy = Arc::new(AtomicBool::new(false));

        // Phase one: build every worker's cross-thread surface, so each
        // thread can be handed the full peer list for stats aggregation.
        let mut workers = Vec::with_capacity(count);
        let mut thread_parts = Vec::with_capacity(count);
        for id in 0..count {
            let poll = Poll::new()?;
            let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
            let (tasks, task_rx) = task_channel(waker);
            workers.push(Arc::new(WorkerShared::new(id, tasks, unhealthy.clone())));
            thread_parts.push((poll, task_rx));
        }

        // Phase two: spawn the threads. Plugin thread memory is
        // allocated inside each thread, by ThreadCore::new.
        let mut handles = Vec::with_capacity(count);
        for (id, (poll, task_rx)) in thread_parts.into_iter().enumerate() {
            let shared = workers[id].clone();
            let peers = workers.clone();
            let settings = settings.clone();
            let io = io.clone();
            let subscriptions = subscriptions.clone();
            let sessions = sessions.clone();
            let plugin = plugin.clone();
            let unhealthy = unhealthy.clone();

            let handle = thread::Builder::new()
                .name(format!("worker-{}", id))
                .spawn(move || {
                    match ThreadCore::new(
                        shared,
                        peers,
                        poll,
                        task_rx,
                        settings,
                        io,
                        subscriptions,
                        sessions,
                        plugin,
                    ) {
                        Ok(mut core) => {
                            // run() logs and latches unhealthy on error.
                            let _ = core.run();
                        }
                        Err(e) => {
                            unhealthy.store(true, Ordering::Release);
                            log::error!("worker {} failed to start: {}", id, e);
                        }
                    }
                })
                .map_err(Error::ThreadStart)?;
            handles.push(handle);
        }

        log::info!("started {} worker threads", count);
        Ok(Self {
            workers,
            handles,
            next_worker: AtomicUsize::new(0),
            unhealthy,
        })
    }

    pub fn workers(&self) -> &[Arc<WorkerShared>] {
        &self.workers
    }

    /// Total connected clients across the fleet. Foreign read of the
    /// mutex-protected registries.
    pub fn client_count(&self) -> usize {
        self.workers.iter().map(|w| w.client_count()).sum()
    }

    /// False once any worker hit a fatal error; the embedding process
    /// should exit non-zero.
    pub fn healthy(&self) -> bool {
        !self.unhealthy.load(Ordering::Acquire)
    }

    /// Assign an accepted connection to a worker, round-robin. Workers
    /// that have begun shutting down are skipped.
    pub fn give_client(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let count = self.workers.len();
        let mut target = None;
        for _ in 0..count {
            let idx = self.next_worker.fetch_add(1, Ordering::Relaxed) % count;
            if self.workers[idx].is_running() {
                target = Some(idx);
                break;
            }
        }
        let Some(idx) = target else {
            return Err(Error::ShuttingDown);
        };

        self.workers[idx].post(move |core| {
            if let Err(e) = core.give_client(stream, addr) {
                log::warn!("worker could not accept client {}: {}", addr, e);
            }
        });
        Ok(())
    }

    /// Fan a new configuration out to every worker. Each applies it
    /// atomically at its next loop iteration; posting two reloads leaves
    /// the later one in effect.
    pub fn queue_reload(&self, settings: Arc<Settings>) {
        log::info!("queueing settings reload on {} workers", self.workers.len());
        for worker in &self.workers {
            worker.queue_reload(settings.clone());
        }
    }

    /// Graceful shutdown: quit everywhere, then the will barrier, then
    /// the disconnect barrier, then join the threads.
    pub fn shutdown(mut self, timeout: Duration) -> Result<()> {
        log::info!("shutting down {} workers", self.workers.len());
        for worker in &self.workers {
            worker.queue_quit();
        }

        for worker in &self.workers {
            worker.queue_send_wills();
        }
        self.wait_for(timeout, "wills queued", WorkerShared::wills_queued)?;

        for worker in &self.workers {
            worker.queue_send_disconnects();
        }
        self.wait_for(timeout, "disconnects sent", WorkerShared::disconnects_sent)?;

        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        log::info!("fleet shut down");
        Ok(())
    }

    fn wait_for(
        &self,
        timeout: Duration,
        what: &str,
        flag: impl Fn(&WorkerShared) -> bool,
    ) -> Result<()> {
        let start = Instant::now();
        while !self.workers.iter().all(|w| flag(w)) {
            if start.elapsed() > timeout {
                log::error!("timed out waiting for {} on all workers", what);
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("shutdown barrier '{}' timed out", what),
                )));
            }
            thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }
}
