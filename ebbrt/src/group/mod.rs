//! Process-group transport collaborator.
//!
//! [`ProcessGroup`] is the narrow interface the group messenger needs from a
//! rank-addressed communication layer: non-blocking tagged send, completion
//! test, probe and receive. [`LocalGroup`] implements it in memory so a
//! multi-process group can run inside one test binary.

pub mod local;

pub use local::LocalGroup;

use crate::error::Result;
use bytes::Bytes;

/// Handle for a non-blocking send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// What a successful probe found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeStatus {
    /// Rank the message came from.
    pub source: u32,
    /// Message length in bytes.
    pub len: usize,
}

/// A rank-addressed group of processes.
pub trait ProcessGroup: Send + Sync {
    /// This process's rank.
    fn rank(&self) -> u32;

    /// Number of processes in the group.
    fn size(&self) -> u32;

    /// Start sending `data` to `dest` under `tag`.
    ///
    /// The transport holds `data` until [`test`](Self::test) reports the
    /// request complete.
    fn isend(&self, dest: u32, tag: u32, data: Bytes) -> Result<RequestId>;

    /// Whether `request` has completed.
    ///
    /// A completed request is reported once; the handle is invalid afterwards.
    fn test(&self, request: RequestId) -> Result<bool>;

    /// Look for a message from any source carrying `tag` without receiving it.
    fn iprobe(&self, tag: u32) -> Result<Option<ProbeStatus>>;

    /// Receive the oldest message from `source` carrying `tag`.
    fn recv(&self, source: u32, tag: u32) -> Result<Bytes>;
}
