//! In-memory process group.

use crate::error::{Result, TransportError};
use crate::group::{ProbeStatus, ProcessGroup, RequestId};
use bytes::Bytes;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

struct Envelope {
    source: u32,
    tag: u32,
    data: Bytes,
    request: (u32, RequestId),
}

struct Fabric {
    mailboxes: Vec<Mutex<VecDeque<Envelope>>>,
    completed: Mutex<HashSet<(u32, RequestId)>>,
}

impl Fabric {
    fn mailbox(&self, rank: u32) -> Option<MutexGuard<'_, VecDeque<Envelope>>> {
        self.mailboxes
            .get(rank as usize)
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// One member of an in-memory process group.
///
/// A send completes when the destination receives the message, so a sender
/// sees its buffer held for as long as the message sits unreceived in the
/// destination's mailbox. Messages between one pair of ranks are received
/// in send order.
///
/// # Example
///
/// ```rust,ignore
/// let mut group = LocalGroup::create(2).into_iter();
/// let rank0 = Arc::new(group.next().unwrap());
/// let rank1 = Arc::new(group.next().unwrap());
/// ```
pub struct LocalGroup {
    rank: u32,
    size: u32,
    fabric: Arc<Fabric>,
    next_request: AtomicU64,
}

impl LocalGroup {
    /// Create every member of a group of `size` ranks, in rank order.
    pub fn create(size: u32) -> Vec<LocalGroup> {
        let fabric = Arc::new(Fabric {
            mailboxes: (0..size).map(|_| Mutex::new(VecDeque::new())).collect(),
            completed: Mutex::new(HashSet::new()),
        });
        (0..size)
            .map(|rank| LocalGroup {
                rank,
                size,
                fabric: fabric.clone(),
                next_request: AtomicU64::new(0),
            })
            .collect()
    }

    /// Messages waiting in this rank's mailbox.
    pub fn queued(&self) -> usize {
        self.fabric.mailbox(self.rank).map_or(0, |m| m.len())
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> u32 {
        self.rank
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn isend(&self, dest: u32, tag: u32, data: Bytes) -> Result<RequestId> {
        let request = RequestId(self.next_request.fetch_add(1, Ordering::Relaxed));
        let Some(mut mailbox) = self.fabric.mailbox(dest) else {
            return Err(TransportError::SendFailed(format!(
                "rank {dest} outside group of {}",
                self.size
            ))
            .into());
        };
        mailbox.push_back(Envelope {
            source: self.rank,
            tag,
            data,
            request: (self.rank, request),
        });
        Ok(request)
    }

    fn test(&self, request: RequestId) -> Result<bool> {
        Ok(self
            .fabric
            .completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(self.rank, request)))
    }

    fn iprobe(&self, tag: u32) -> Result<Option<ProbeStatus>> {
        let Some(mailbox) = self.fabric.mailbox(self.rank) else {
            return Ok(None);
        };
        Ok(mailbox.iter().find(|e| e.tag == tag).map(|e| ProbeStatus {
            source: e.source,
            len: e.data.len(),
        }))
    }

    fn recv(&self, source: u32, tag: u32) -> Result<Bytes> {
        let envelope = {
            let Some(mut mailbox) = self.fabric.mailbox(self.rank) else {
                return Err(TransportError::SendFailed(format!("rank {} has no mailbox", self.rank)).into());
            };
            let position = mailbox
                .iter()
                .position(|e| e.source == source && e.tag == tag);
            position.and_then(|i| mailbox.remove(i))
        };
        let Some(envelope) = envelope else {
            return Err(TransportError::SendFailed(format!(
                "no message from rank {source} with tag {tag:#x}"
            ))
            .into());
        };
        self.fabric
            .completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(envelope.request);
        Ok(envelope.data)
    }
}

impl fmt::Debug for LocalGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalGroup")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}
