//! Work distribution over a single server-held bag.
//!
//! ```text
//! client take(cb)                        server
//!   queue cb (FIFO)  ── empty message ──▶  pop item
//!                    ◀── item | empty ──   reply
//!   pop oldest cb, resolve with item or None
//! ```
//!
//! On the server, `take` pops locally. The bag itself is a stack: the most
//! recently added item is handed out first.

use crate::ebb::{EbbId, EbbRep};
use crate::error::{EbbError, Result};
use crate::messaging::{Completion, Messenger, NetworkId};
use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A bag of opaque work items held by one server process.
pub struct WorkBag {
    id: EbbId,
    messenger: Arc<dyn Messenger>,
    server: NetworkId,
    items: Mutex<Vec<Bytes>>,
    waiting: Mutex<VecDeque<Completion<Option<Bytes>>>>,
}

impl WorkBag {
    /// Create the local representative of bag `id`, served by `server`.
    pub fn new(id: EbbId, messenger: Arc<dyn Messenger>, server: NetworkId) -> Self {
        Self {
            id,
            messenger,
            server,
            items: Mutex::new(Vec::new()),
            waiting: Mutex::new(VecDeque::new()),
        }
    }

    /// Whether this process holds the bag.
    pub fn is_server(&self) -> bool {
        self.messenger.local_address() == self.server
    }

    /// Store `item` in the bag.
    ///
    /// # Errors
    ///
    /// Returns `EbbError::NotBagServer` on a client: items stored there
    /// could never be taken.
    pub fn add(&self, item: impl Into<Bytes>) -> Result<()> {
        if !self.is_server() {
            tracing::warn!("{} add rejected at client {}", self.id, self.messenger.local_address());
            return Err(EbbError::NotBagServer { server: self.server });
        }
        lock(&self.items).push(item.into());
        Ok(())
    }

    /// Items held locally.
    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    /// Whether the local bag is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take one item; `on_item` receives `None` if the bag is empty.
    pub fn take(&self, on_item: Completion<Option<Bytes>>) -> Result<()> {
        if self.is_server() {
            let item = lock(&self.items).pop();
            on_item.resolve(item);
            return Ok(());
        }
        lock(&self.waiting).push_back(on_item);
        self.messenger
            .send(self.server, self.id, Vec::new(), None)
            .inspect_err(|_| {
                lock(&self.waiting).pop_back();
            })
    }
}

impl EbbRep for WorkBag {
    fn handle_message(&self, from: NetworkId, body: Bytes) -> Result<()> {
        if self.is_server() {
            let item = lock(&self.items).pop();
            tracing::debug!("{} handing {} to {}", self.id, if item.is_some() { "an item" } else { "nothing" }, from);
            return self
                .messenger
                .send(from, self.id, item.into_iter().collect(), None);
        }

        let Some(waiter) = lock(&self.waiting).pop_front() else {
            tracing::warn!("{} reply from {} with no take outstanding", self.id, from);
            return Err(EbbError::UnsolicitedReply { from });
        };
        waiter.resolve((!body.is_empty()).then_some(body));
        Ok(())
    }
}

impl fmt::Debug for WorkBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkBag")
            .field("id", &self.id)
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
