//! Descriptor ring shared between a driver and a device.
//!
//! # Layout
//!
//! ```text
//! descriptors: [d0][d1][d2] ... [dN-1]      chained by `next` when NEXT is set
//!
//! free list:   free_head → dK → dJ → ...    num_free entries
//!
//! avail ring:  driver publishes chain heads at avail_idx,
//!              device consumes from last_avail
//!
//! used ring:   device publishes (head, len) at used_idx,
//!              driver consumes from last_used
//! ```
//!
//! All four indices are free-running counters that only move forward; the
//! slot they address is `index % size`. A descriptor is either on the
//! free list or part of exactly one in-flight chain, so
//! `num_free + in_flight == size` always holds.
//!
//! The ring owns the buffers attached to in-flight descriptors. Reclaiming a
//! chain hands them back to the driver; after that the ring holds no
//! reference to them.

use crate::error::TransportError;
use bitflags::bitflags;
use bytes::Bytes;
use std::fmt;

bitflags! {
    /// Descriptor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DescFlags: u16 {
        /// The chain continues at `next`.
        const NEXT = 1;
        /// The device writes into this buffer.
        const WRITE = 2;
    }
}

#[derive(Debug, Clone, Default)]
struct Descriptor {
    buf: Bytes,
    // Capacity for WRITE buffers, data length otherwise.
    len: u32,
    flags: DescFlags,
    next: u16,
}

/// One entry of the used ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsedElem {
    /// Head descriptor of the completed chain.
    pub head: u16,
    /// Bytes the device wrote (0 for transmit chains).
    pub len: u32,
}

/// A buffer to place in a chain.
#[derive(Debug, Clone)]
pub enum ChainBuf {
    /// Device reads these bytes.
    Readable(Bytes),
    /// Device may write up to this many bytes.
    Writable(u32),
}

/// Fixed-size descriptor ring.
pub struct Ring {
    size: u16,
    descs: Vec<Descriptor>,
    free_head: u16,
    num_free: u16,
    in_flight: usize,
    avail: Vec<u16>,
    avail_idx: usize,
    last_avail: usize,
    used: Vec<UsedElem>,
    used_idx: usize,
    last_used: usize,
}

impl Ring {
    /// Create a ring of `size` descriptors, all free.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::RingExhausted` for a zero-sized ring.
    pub fn new(size: u16) -> Result<Self, TransportError> {
        if size == 0 {
            return Err(TransportError::RingExhausted { needed: 1, free: 0 });
        }
        let n = usize::from(size);
        let descs = (0..n)
            .map(|i| Descriptor {
                next: if i + 1 < n { (i + 1) as u16 } else { 0 },
                ..Descriptor::default()
            })
            .collect();
        Ok(Self {
            size,
            descs,
            free_head: 0,
            num_free: size,
            in_flight: 0,
            avail: vec![0; n],
            avail_idx: 0,
            last_avail: 0,
            used: vec![UsedElem { head: 0, len: 0 }; n],
            used_idx: 0,
            last_used: 0,
        })
    }

    /// Number of descriptors.
    pub fn size(&self) -> u16 {
        self.size
    }

    /// Number of descriptors on the free list.
    pub fn num_free(&self) -> u16 {
        self.num_free
    }

    /// Number of descriptors belonging to chains not yet reclaimed.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    // ---- driver side ----

    /// Take descriptors for `bufs`, link them and publish the chain head.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::RingExhausted` if fewer than `bufs.len()`
    /// descriptors are free; the ring is left untouched.
    pub fn add_chain(&mut self, bufs: Vec<ChainBuf>) -> Result<u16, TransportError> {
        let needed = bufs.len();
        if needed == 0 || needed > usize::from(self.num_free) {
            return Err(TransportError::RingExhausted {
                needed,
                free: self.num_free,
            });
        }

        let head = self.free_head;
        let mut idx = head;
        let last = needed - 1;
        for (i, buf) in bufs.into_iter().enumerate() {
            let desc = &mut self.descs[usize::from(idx)];
            let next_free = desc.next;
            let (buf, len, mut flags) = match buf {
                ChainBuf::Readable(bytes) => {
                    let len = bytes.len() as u32;
                    (bytes, len, DescFlags::empty())
                }
                ChainBuf::Writable(capacity) => (Bytes::new(), capacity, DescFlags::WRITE),
            };
            if i < last {
                flags |= DescFlags::NEXT;
            }
            desc.buf = buf;
            desc.len = len;
            desc.flags = flags;
            // A NEXT link is the next free descriptor, which is where the
            // following buffer lands.
            if i < last {
                idx = next_free;
            } else {
                self.free_head = next_free;
            }
        }
        self.num_free -= needed as u16;
        self.in_flight += needed;

        let slot = self.avail_idx % usize::from(self.size);
        self.avail[slot] = head;
        self.avail_idx = self.avail_idx.wrapping_add(1);
        Ok(head)
    }

    /// Next completed chain, if any.
    pub fn pop_used(&mut self) -> Option<UsedElem> {
        if self.last_used == self.used_idx {
            return None;
        }
        let elem = self.used[self.last_used % usize::from(self.size)];
        self.last_used = self.last_used.wrapping_add(1);
        Some(elem)
    }

    /// Return every descriptor of the chain at `head` to the free list.
    ///
    /// Returns the chain's buffers in chain order.
    pub fn reclaim_chain(&mut self, head: u16) -> Vec<Bytes> {
        let mut bufs = Vec::new();
        let mut idx = head;
        loop {
            let desc = &mut self.descs[usize::from(idx)];
            let flags = desc.flags;
            let next = desc.next;
            bufs.push(std::mem::take(&mut desc.buf));
            desc.len = 0;
            desc.flags = DescFlags::empty();
            desc.next = self.free_head;
            self.free_head = idx;
            self.num_free += 1;
            self.in_flight -= 1;
            if !flags.contains(DescFlags::NEXT) {
                break;
            }
            idx = next;
        }
        bufs
    }

    // ---- device side ----

    /// Next chain head published by the driver, if any.
    pub fn take_available(&mut self) -> Option<u16> {
        if self.last_avail == self.avail_idx {
            return None;
        }
        let head = self.avail[self.last_avail % usize::from(self.size)];
        self.last_avail = self.last_avail.wrapping_add(1);
        Some(head)
    }

    /// Readable buffers of the chain at `head`, in chain order.
    pub fn chain_buffers(&self, head: u16) -> Vec<Bytes> {
        let mut bufs = Vec::new();
        let mut idx = head;
        loop {
            let desc = &self.descs[usize::from(idx)];
            if !desc.flags.contains(DescFlags::WRITE) {
                bufs.push(desc.buf.clone());
            }
            if !desc.flags.contains(DescFlags::NEXT) {
                break;
            }
            idx = desc.next;
        }
        bufs
    }

    /// Store `data` in the writable head descriptor of a chain.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::FrameTooLarge` if `data` exceeds the
    /// descriptor's capacity or the descriptor is not writable.
    pub fn write_buffer(&mut self, head: u16, data: Bytes) -> Result<u32, TransportError> {
        let desc = &mut self.descs[usize::from(head)];
        let capacity = if desc.flags.contains(DescFlags::WRITE) {
            desc.len as usize
        } else {
            0
        };
        if data.len() > capacity {
            return Err(TransportError::FrameTooLarge {
                size: data.len(),
                mtu: capacity,
            });
        }
        let len = data.len() as u32;
        desc.buf = data;
        Ok(len)
    }

    /// Publish a completed chain to the driver.
    pub fn push_used(&mut self, head: u16, len: u32) {
        let slot = self.used_idx % usize::from(self.size);
        self.used[slot] = UsedElem { head, len };
        self.used_idx = self.used_idx.wrapping_add(1);
    }

    /// Walk the free list and check it accounts for every non-in-flight descriptor.
    pub fn check_invariant(&self) -> bool {
        if usize::from(self.num_free) + self.in_flight != usize::from(self.size) {
            return false;
        }
        let mut seen = vec![false; usize::from(self.size)];
        let mut idx = self.free_head;
        for _ in 0..self.num_free {
            let slot = usize::from(idx);
            if slot >= seen.len() || seen[slot] {
                return false;
            }
            seen[slot] = true;
            idx = self.descs[slot].next;
        }
        true
    }
}

impl fmt::Debug for Ring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("size", &self.size)
            .field("num_free", &self.num_free)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::VecDeque;

    fn readable(data: &'static [u8]) -> ChainBuf {
        ChainBuf::Readable(Bytes::from_static(data))
    }

    #[test]
    fn test_new_ring_all_free() {
        let ring = Ring::new(8).unwrap();
        assert_eq!(ring.num_free(), 8);
        assert_eq!(ring.in_flight(), 0);
        assert!(ring.check_invariant());
        assert!(Ring::new(0).is_err());
    }

    #[test]
    fn test_chain_round_trip() {
        let mut ring = Ring::new(4).unwrap();
        let head = ring
            .add_chain(vec![readable(b"hdr"), readable(b"body")])
            .unwrap();
        assert_eq!(ring.num_free(), 2);

        let taken = ring.take_available().unwrap();
        assert_eq!(taken, head);
        assert_eq!(
            ring.chain_buffers(taken),
            vec![Bytes::from_static(b"hdr"), Bytes::from_static(b"body")]
        );
        assert!(ring.take_available().is_none());

        ring.push_used(taken, 0);
        let used = ring.pop_used().unwrap();
        assert_eq!(used.head, head);
        assert!(ring.pop_used().is_none());

        let bufs = ring.reclaim_chain(used.head);
        assert_eq!(bufs.len(), 2);
        assert_eq!(ring.num_free(), 4);
        assert!(ring.check_invariant());
    }

    #[test]
    fn test_exhaustion_leaves_ring_untouched() {
        let mut ring = Ring::new(2).unwrap();
        let err = ring
            .add_chain(vec![readable(b"a"), readable(b"b"), readable(b"c")])
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::RingExhausted { needed: 3, free: 2 }
        ));
        assert_eq!(ring.num_free(), 2);
        assert!(ring.check_invariant());
    }

    #[test]
    fn test_write_buffer_respects_capacity() {
        let mut ring = Ring::new(2).unwrap();
        let head = ring.add_chain(vec![ChainBuf::Writable(4)]).unwrap();
        assert!(ring.write_buffer(head, Bytes::from_static(b"12345")).is_err());
        assert_eq!(ring.write_buffer(head, Bytes::from_static(b"1234")).unwrap(), 4);
        ring.push_used(head, 4);
        let used = ring.pop_used().unwrap();
        let bufs = ring.reclaim_chain(used.head);
        assert_eq!(bufs, vec![Bytes::from_static(b"1234")]);
    }

    #[test]
    fn test_random_send_complete_sequence_keeps_invariant() {
        let mut rng = StdRng::seed_from_u64(0x8812);
        let mut ring = Ring::new(16).unwrap();
        let mut outstanding: VecDeque<(u16, usize)> = VecDeque::new();

        for _ in 0..2_000 {
            let send = rng.random_bool(0.55);
            if send {
                let parts = rng.random_range(1..=4usize);
                if parts <= usize::from(ring.num_free()) {
                    let bufs = (0..parts).map(|_| readable(b"x")).collect();
                    let head = ring.add_chain(bufs).unwrap();
                    outstanding.push_back((head, parts));
                }
            } else if let Some(head) = ring.take_available() {
                ring.push_used(head, 0);
                let used = ring.pop_used().unwrap();
                let (expected, parts) = outstanding.pop_front().unwrap();
                assert_eq!(used.head, expected);
                assert_eq!(ring.reclaim_chain(used.head).len(), parts);
            }

            let in_flight: usize = outstanding.iter().map(|(_, parts)| parts).sum();
            assert_eq!(usize::from(ring.num_free()), 16 - in_flight);
            assert!(ring.check_invariant());
        }
    }
}
