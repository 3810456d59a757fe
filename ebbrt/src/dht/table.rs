//! The distributed hash table representative.
//!
//! # Routing
//!
//! ```text
//! op(key):
//!   owner = crc32c(key) mod node_count
//!   owner == local  → serve from the shard, resolve callbacks now
//!   owner != local  → park a pending record under a fresh op id,
//!                     send the request to nodes[owner]
//!
//! response(op_id) → remove the pending record, resolve it
//! ```
//!
//! SET, SYNC_SET and FREE are fire-and-forget: nothing is parked and no
//! response comes back. Every other remote operation parks exactly one
//! record and is answered by exactly one response.

use crate::dht::shard::{Shard, Waiter};
use crate::dht::wire::DhtMessage;
use crate::ebb::{EbbId, EbbRep};
use crate::error::{DhtError, Result};
use crate::messaging::completion::notify;
use crate::messaging::{Completion, Messenger, NetworkId};
use crate::runtime::DhtConfig;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Shard index owning `key` in a table of `node_count` nodes.
///
/// Depends on nothing but the key bytes and the node count.
pub fn owner_of(key: &[u8], node_count: usize) -> usize {
    (crc32c::crc32c(key) as usize) % node_count.max(1)
}

enum PendingOp {
    Get(Completion<Option<Bytes>>),
    Increment(Completion<u64>),
}

/// A sharded key/value store spread over the nodes of a [`DhtConfig`].
///
/// # Example
///
/// ```rust,ignore
/// let dht = Arc::new(DistributedHashTable::new(id, messenger, DhtConfig::single(addr))?);
/// dht.set(b"foo", "bar", None)?;
///
/// let (done, mut rx) = Completion::channel();
/// dht.get(b"foo", done, None)?;
/// assert_eq!(rx.try_recv()?, Some(Bytes::from_static(b"bar")));
/// ```
pub struct DistributedHashTable {
    id: EbbId,
    messenger: Arc<dyn Messenger>,
    config: DhtConfig,
    shard: Mutex<Shard>,
    pending: Mutex<HashMap<u32, PendingOp>>,
    next_op: AtomicU32,
}

impl DistributedHashTable {
    /// Create the local representative of table `id`.
    ///
    /// # Errors
    ///
    /// Returns `DhtError::InvalidConfig` if the node table is empty or the
    /// local index is out of range.
    pub fn new(id: EbbId, messenger: Arc<dyn Messenger>, config: DhtConfig) -> Result<Self> {
        if config.nodes.is_empty() {
            return Err(DhtError::InvalidConfig("empty node table".into()).into());
        }
        if config.local >= config.nodes.len() {
            return Err(DhtError::InvalidConfig(format!(
                "local index {} outside {} nodes",
                config.local,
                config.nodes.len()
            ))
            .into());
        }
        Ok(Self {
            id,
            messenger,
            config,
            shard: Mutex::new(Shard::new()),
            pending: Mutex::new(HashMap::new()),
            next_op: AtomicU32::new(0),
        })
    }

    /// Id this representative answers to.
    pub fn id(&self) -> EbbId {
        self.id
    }

    /// Shard index owning `key`.
    pub fn owner(&self, key: &[u8]) -> usize {
        owner_of(key, self.config.node_count())
    }

    /// Whether this node owns `key`.
    pub fn is_local(&self, key: &[u8]) -> bool {
        self.owner(key) == self.config.local
    }

    /// Remote operations still waiting for a response.
    pub fn pending(&self) -> usize {
        self.lock_pending().len()
    }

    /// Read `key`; `on_value` receives `None` if it is absent.
    pub fn get(
        &self,
        key: &[u8],
        on_value: Completion<Option<Bytes>>,
        on_sent: Option<Completion<()>>,
    ) -> Result<()> {
        let owner = self.owner(key);
        if owner == self.config.local {
            let value = self.lock_shard().get(key);
            on_value.resolve(value);
            notify(on_sent);
            return Ok(());
        }
        let op_id = self.park(PendingOp::Get(on_value));
        let request = DhtMessage::GetRequest {
            op_id,
            key: Bytes::copy_from_slice(key),
        };
        self.request(owner, op_id, request, on_sent)
    }

    /// Write `value` under `key`.
    pub fn set(&self, key: &[u8], value: impl Into<Bytes>, on_sent: Option<Completion<()>>) -> Result<()> {
        let key = Bytes::copy_from_slice(key);
        let value = value.into();
        let owner = self.owner(&key);
        if owner == self.config.local {
            self.lock_shard().set(key, value);
            notify(on_sent);
            return Ok(());
        }
        self.send_to(owner, DhtMessage::SetRequest { key, value }, on_sent)
    }

    /// Bump the counter of `key`; `on_value` receives the value before the bump.
    pub fn increment(
        &self,
        key: &[u8],
        on_value: Completion<u64>,
        on_sent: Option<Completion<()>>,
    ) -> Result<()> {
        let owner = self.owner(key);
        if owner == self.config.local {
            let value = self.lock_shard().increment(Bytes::copy_from_slice(key));
            on_value.resolve(value);
            notify(on_sent);
            return Ok(());
        }
        let op_id = self.park(PendingOp::Increment(on_value));
        let request = DhtMessage::IncrementRequest {
            op_id,
            key: Bytes::copy_from_slice(key),
        };
        self.request(owner, op_id, request, on_sent)
    }

    /// Read `key` once its accumulated delta reaches `wait_for`.
    ///
    /// Resolves immediately, with the current value, if the threshold is
    /// already met.
    pub fn sync_get(
        &self,
        key: &[u8],
        wait_for: u64,
        on_value: Completion<Option<Bytes>>,
        on_sent: Option<Completion<()>>,
    ) -> Result<()> {
        let owner = self.owner(key);
        if owner == self.config.local {
            let ready = self
                .lock_shard()
                .sync_get(Bytes::copy_from_slice(key), wait_for, Waiter::Local(on_value));
            notify(on_sent);
            if let Some(ready) = ready {
                self.release(vec![ready])?;
            }
            return Ok(());
        }
        let op_id = self.park(PendingOp::Get(on_value));
        let request = DhtMessage::SyncGetRequest {
            op_id,
            wait_for,
            key: Bytes::copy_from_slice(key),
        };
        self.request(owner, op_id, request, on_sent)
    }

    /// Write `value`, add `delta` to the accumulator of `key` and release
    /// every reader whose threshold is now met.
    pub fn sync_set(
        &self,
        key: &[u8],
        value: impl Into<Bytes>,
        delta: u64,
        on_sent: Option<Completion<()>>,
    ) -> Result<()> {
        let key = Bytes::copy_from_slice(key);
        let value = value.into();
        let owner = self.owner(&key);
        if owner == self.config.local {
            let released = self.lock_shard().sync_set(key, value, delta);
            notify(on_sent);
            return self.release(released);
        }
        self.send_to(owner, DhtMessage::SyncSetRequest { delta, key, value }, on_sent)
    }

    /// Remove the value of `key`.
    pub fn free(&self, key: &[u8], on_sent: Option<Completion<()>>) -> Result<()> {
        let key = Bytes::copy_from_slice(key);
        let owner = self.owner(&key);
        if owner == self.config.local {
            self.lock_shard().free(&key);
            notify(on_sent);
            return Ok(());
        }
        self.send_to(owner, DhtMessage::FreeRequest { key }, on_sent)
    }

    /// Clear this node's shard. Parked readers stay parked.
    pub fn flush(&self) {
        self.lock_shard().flush();
        tracing::debug!("Flushed local shard of {}", self.id);
    }

    fn park(&self, op: PendingOp) -> u32 {
        let op_id = self.next_op.fetch_add(1, Ordering::Relaxed);
        self.lock_pending().insert(op_id, op);
        op_id
    }

    fn request(
        &self,
        owner: usize,
        op_id: u32,
        request: DhtMessage,
        on_sent: Option<Completion<()>>,
    ) -> Result<()> {
        self.send_to(owner, request, on_sent).inspect_err(|_| {
            self.lock_pending().remove(&op_id);
        })
    }

    fn send_to(&self, owner: usize, message: DhtMessage, on_sent: Option<Completion<()>>) -> Result<()> {
        let to = self.config.nodes[owner];
        tracing::debug!("{} sending {} to node {} ({})", self.id, opcode_name(&message), owner, to);
        self.messenger.send(to, self.id, vec![message.encode()?], on_sent)
    }

    fn reply(&self, to: NetworkId, message: DhtMessage) -> Result<()> {
        self.messenger.send(to, self.id, vec![message.encode()?], None)
    }

    /// Resolve released waiters in order; must run without the shard lock.
    ///
    /// Every waiter is attempted even if a reply fails; the first failure is
    /// returned.
    fn release(&self, released: Vec<(Waiter, Option<Bytes>)>) -> Result<()> {
        let mut first_err = None;
        for (waiter, value) in released {
            match waiter {
                Waiter::Local(done) => done.resolve(value),
                Waiter::Remote { from, op_id } => {
                    if let Err(e) = self.reply(from, DhtMessage::GetResponse { op_id, value }) {
                        tracing::error!("{} failed to answer operation {} at {}: {}", self.id, op_id, from, e);
                        first_err.get_or_insert(e);
                    }
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn check_owner(&self, key: &[u8]) -> Result<()> {
        let owner = self.owner(key);
        if owner != self.config.local {
            tracing::error!("{} received request for a key owned by node {}", self.id, owner);
            return Err(DhtError::NotOwner {
                owner,
                local: self.config.local,
            }
            .into());
        }
        Ok(())
    }

    fn take_pending(&self, op_id: u32) -> Result<PendingOp> {
        self.lock_pending().remove(&op_id).ok_or_else(|| {
            tracing::warn!("{} response for unknown operation {}", self.id, op_id);
            DhtError::UnknownOperation(op_id).into()
        })
    }

    fn lock_shard(&self) -> MutexGuard<'_, Shard> {
        self.shard.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<u32, PendingOp>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EbbRep for DistributedHashTable {
    fn handle_message(&self, from: NetworkId, body: Bytes) -> Result<()> {
        let message = DhtMessage::decode(body)?;
        tracing::debug!("{} received {} from {}", self.id, opcode_name(&message), from);
        match message {
            DhtMessage::GetRequest { op_id, key } => {
                self.check_owner(&key)?;
                let value = self.lock_shard().get(&key);
                self.reply(from, DhtMessage::GetResponse { op_id, value })
            }
            DhtMessage::SetRequest { key, value } => {
                self.check_owner(&key)?;
                self.lock_shard().set(key, value);
                Ok(())
            }
            DhtMessage::SyncGetRequest {
                op_id,
                wait_for,
                key,
            } => {
                self.check_owner(&key)?;
                let ready = self
                    .lock_shard()
                    .sync_get(key, wait_for, Waiter::Remote { from, op_id });
                match ready {
                    Some(ready) => self.release(vec![ready]),
                    None => Ok(()),
                }
            }
            DhtMessage::SyncSetRequest { delta, key, value } => {
                self.check_owner(&key)?;
                let released = self.lock_shard().sync_set(key, value, delta);
                self.release(released)
            }
            DhtMessage::IncrementRequest { op_id, key } => {
                self.check_owner(&key)?;
                let value = self.lock_shard().increment(key);
                self.reply(from, DhtMessage::IncrementResponse { op_id, value })
            }
            DhtMessage::FreeRequest { key } => {
                self.check_owner(&key)?;
                self.lock_shard().free(&key);
                Ok(())
            }
            DhtMessage::GetResponse { op_id, value } => match self.take_pending(op_id)? {
                PendingOp::Get(done) => {
                    done.resolve(value);
                    Ok(())
                }
                PendingOp::Increment(_) => Err(DhtError::ResponseMismatch(op_id).into()),
            },
            DhtMessage::IncrementResponse { op_id, value } => match self.take_pending(op_id)? {
                PendingOp::Increment(done) => {
                    done.resolve(value);
                    Ok(())
                }
                PendingOp::Get(_) => Err(DhtError::ResponseMismatch(op_id).into()),
            },
        }
    }
}

impl fmt::Debug for DistributedHashTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedHashTable")
            .field("id", &self.id)
            .field("local", &self.config.local)
            .field("nodes", &self.config.node_count())
            .finish_non_exhaustive()
    }
}

fn opcode_name(message: &DhtMessage) -> &'static str {
    match message {
        DhtMessage::GetRequest { .. } => "GET_REQUEST",
        DhtMessage::GetResponse { .. } => "GET_RESPONSE",
        DhtMessage::SetRequest { .. } => "SET_REQUEST",
        DhtMessage::SyncGetRequest { .. } => "SYNC_GET_REQUEST",
        DhtMessage::SyncSetRequest { .. } => "SYNC_SET_REQUEST",
        DhtMessage::IncrementRequest { .. } => "INCREMENT_REQUEST",
        DhtMessage::IncrementResponse { .. } => "INCREMENT_RESPONSE",
        DhtMessage::FreeRequest { .. } => "FREE_REQUEST",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebb::Resolver;
    use crate::error::TransportError;
    use crate::event::EventManager;

    /// Records sends instead of transmitting them.
    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(NetworkId, DhtMessage)>>,
        failures: AtomicU32,
    }

    impl Messenger for Recorder {
        fn local_address(&self) -> NetworkId {
            NetworkId::rank(0, 0)
        }

        fn send(
            &self,
            to: NetworkId,
            _ebb: EbbId,
            payload: Vec<Bytes>,
            on_complete: Option<Completion<()>>,
        ) -> Result<()> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(TransportError::SendFailed("link down".to_string()).into());
            }
            let message = DhtMessage::decode(payload[0].clone())?;
            self.sent.lock().unwrap().push((to, message));
            notify(on_complete);
            Ok(())
        }

        fn start_listening(&self, _events: &Arc<EventManager>, _resolver: Resolver) -> Result<()> {
            Ok(())
        }
    }

    fn two_nodes(local: usize) -> (DistributedHashTable, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let config = DhtConfig::new(vec![NetworkId::rank(0, 0), NetworkId::rank(1, 0)], local);
        let dht = DistributedHashTable::new(EbbId::new(500), recorder.clone(), config).unwrap();
        (dht, recorder)
    }

    fn key_owned_by(node: usize) -> Vec<u8> {
        (0u32..)
            .map(|i| format!("key-{i}").into_bytes())
            .find(|k| owner_of(k, 2) == node)
            .unwrap()
    }

    #[test]
    fn test_owner_is_pure() {
        for key in [b"foo".as_slice(), b"bar".as_slice(), b"k".as_slice(), b"".as_slice()] {
            let first = owner_of(key, 3);
            assert_eq!(owner_of(key, 3), first);
            assert!(first < 3);
        }
        assert_eq!(owner_of(b"anything", 1), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let recorder: Arc<dyn Messenger> = Arc::new(Recorder::default());
        assert!(DistributedHashTable::new(EbbId::new(1), recorder.clone(), DhtConfig::new(vec![], 0)).is_err());
        assert!(DistributedHashTable::new(
            EbbId::new(1),
            recorder,
            DhtConfig::new(vec![NetworkId::rank(0, 0)], 1)
        )
        .is_err());
    }

    #[test]
    fn test_remote_get_parks_until_response() {
        let (dht, recorder) = two_nodes(0);
        let key = key_owned_by(1);
        let (done, mut rx) = Completion::channel();
        let (sent, mut sent_rx) = Completion::channel();
        dht.get(&key, done, Some(sent)).unwrap();

        assert!(sent_rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(dht.pending(), 1);

        let (to, request) = recorder.sent.lock().unwrap().remove(0);
        assert_eq!(to, NetworkId::rank(1, 0));
        let DhtMessage::GetRequest { op_id, .. } = request else {
            panic!("expected GET_REQUEST, got {request:?}");
        };

        let response = DhtMessage::GetResponse { op_id, value: None }.encode().unwrap();
        dht.handle_message(NetworkId::rank(1, 0), response).unwrap();
        assert_eq!(rx.try_recv().unwrap(), None);
        assert_eq!(dht.pending(), 0);
    }

    #[test]
    fn test_set_is_fire_and_forget() {
        let (dht, recorder) = two_nodes(0);
        dht.set(&key_owned_by(1), "v", None).unwrap();
        assert_eq!(dht.pending(), 0);
        assert!(matches!(
            recorder.sent.lock().unwrap()[0].1,
            DhtMessage::SetRequest { .. }
        ));
    }

    #[test]
    fn test_unknown_response_is_error() {
        let (dht, _recorder) = two_nodes(0);
        let response = DhtMessage::IncrementResponse { op_id: 99, value: 1 }.encode().unwrap();
        let err = dht.handle_message(NetworkId::rank(1, 0), response).unwrap_err();
        assert!(matches!(
            err,
            crate::error::EbbError::Dht(DhtError::UnknownOperation(99))
        ));
    }

    #[test]
    fn test_mismatched_response_is_error() {
        let (dht, recorder) = two_nodes(0);
        let (done, _rx) = Completion::channel();
        dht.increment(&key_owned_by(1), done, None).unwrap();
        let (_, request) = recorder.sent.lock().unwrap().remove(0);
        let DhtMessage::IncrementRequest { op_id, .. } = request else {
            panic!("expected INCREMENT_REQUEST");
        };
        let response = DhtMessage::GetResponse { op_id, value: None }.encode().unwrap();
        assert!(dht.handle_message(NetworkId::rank(1, 0), response).is_err());
    }

    #[test]
    fn test_request_for_foreign_key_rejected() {
        let (dht, _recorder) = two_nodes(0);
        let request = DhtMessage::SetRequest {
            key: Bytes::from(key_owned_by(1)),
            value: Bytes::from_static(b"v"),
        }
        .encode()
        .unwrap();
        let err = dht.handle_message(NetworkId::rank(1, 0), request).unwrap_err();
        assert!(matches!(
            err,
            crate::error::EbbError::Dht(DhtError::NotOwner { owner: 1, local: 0 })
        ));
    }

    #[test]
    fn test_remote_sync_get_answered_on_release() {
        let (dht, recorder) = two_nodes(1);
        let key = Bytes::from(key_owned_by(1));
        let from = NetworkId::rank(0, 0);

        let request = DhtMessage::SyncGetRequest {
            op_id: 4,
            wait_for: 2,
            key: key.clone(),
        };
        dht.handle_message(from, request.encode().unwrap()).unwrap();
        assert!(recorder.sent.lock().unwrap().is_empty());

        dht.sync_set(&key, "v1", 2, None).unwrap();
        let sent = recorder.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![(
                from,
                DhtMessage::GetResponse {
                    op_id: 4,
                    value: Some(Bytes::from_static(b"v1")),
                }
            )]
        );
    }

    #[test]
    fn test_failed_reply_does_not_drop_later_waiters() {
        let (dht, recorder) = two_nodes(1);
        let key = Bytes::from(key_owned_by(1));
        let first = NetworkId::rank(0, 0);
        let second = NetworkId::rank(0, 1);

        for (from, op_id) in [(first, 1), (second, 2)] {
            let request = DhtMessage::SyncGetRequest {
                op_id,
                wait_for: 1,
                key: key.clone(),
            };
            dht.handle_message(from, request.encode().unwrap()).unwrap();
        }

        recorder.failures.store(1, Ordering::SeqCst);
        let err = dht.sync_set(&key, "v", 1, None).unwrap_err();
        assert!(matches!(
            err,
            crate::error::EbbError::Transport(TransportError::SendFailed(_))
        ));

        let sent = recorder.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![(
                second,
                DhtMessage::GetResponse {
                    op_id: 2,
                    value: Some(Bytes::from_static(b"v")),
                }
            )]
        );
    }
}
