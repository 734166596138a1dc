//! Handle-indexed client registry.
//!
//! The registry is the one structure foreign threads read (aggregate
//! stats, administration), so it is mutex-protected. The owning worker
//! keeps it consistent with its multiplexer: every registered handle has
//! an entry and vice versa, except inside the narrow removal window.

use ahash::AHashMap;
use mio::Token;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::client::Client;
use crate::error::{Error, Result};

#[derive(Default)]
pub struct ClientRegistry {
    inner: Mutex<AHashMap<Token, Arc<Client>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(AHashMap::new()),
        }
    }

    /// Insert a client. Fails with `DuplicateHandle` if the handle is
    /// already present; the caller keeps ownership of the rejected client.
    pub fn insert(&self, client: Arc<Client>) -> Result<()> {
        let mut inner = self.inner.lock();
        let token = client.token();
        if inner.contains_key(&token) {
            return Err(Error::DuplicateHandle(token));
        }
        inner.insert(token, client);
        Ok(())
    }

    pub fn get(&self, token: Token) -> Option<Arc<Client>> {
        self.inner.lock().get(&token).cloned()
    }

    /// Remove a client by handle. Returns the removed client, or None if
    /// it was already gone (removal is idempotent).
    pub fn remove(&self, token: Token) -> Option<Arc<Client>> {
        self.inner.lock().remove(&token)
    }

    pub fn count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Clone out all clients, for shutdown iteration and keep-alive
    /// bookkeeping without holding the lock across callbacks.
    pub fn snapshot(&self) -> Vec<Arc<Client>> {
        self.inner.lock().values().cloned().collect()
    }
}
