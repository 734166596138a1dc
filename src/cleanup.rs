//! Deferred client removal.
//!
//! Tearing a client down in the middle of readiness dispatch would
//! invalidate references the loop still holds, so any component wanting
//! a client gone posts a weak reference here and signals the worker's
//! wakeup handle. The loop drains the queue after I/O handling. Draining
//! an already-removed client is a no-op.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::client::Client;

#[derive(Default)]
pub struct RemovalQueue {
    inner: Mutex<Vec<Weak<Client>>>,
}

impl RemovalQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    /// Queue a client for removal. Safe from any thread; callers on
    /// foreign threads must also wake the owning worker.
    pub fn push(&self, client: &Arc<Client>) {
        self.inner.lock().push(Arc::downgrade(client));
    }

    /// Swap out all queued entries. Insertion-FIFO order.
    pub fn drain(&self) -> Vec<Weak<Client>> {
        std::mem::take(&mut *self.inner.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
