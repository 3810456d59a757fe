//! Hash-table message encoding.
//!
//! Every message starts with a one-byte opcode. Integers are little-endian;
//! keys and values are length-prefixed with a `u32`.
//!
//! ```text
//! GET_REQUEST         op | op_id u32 | key
//! GET_RESPONSE        op | op_id u32 | present u8 | [value]
//! SET_REQUEST         op | key | value
//! SYNC_GET_REQUEST    op | op_id u32 | wait_for u64 | key
//! SYNC_SET_REQUEST    op | delta u64 | key | value
//! INCREMENT_REQUEST   op | op_id u32 | key
//! INCREMENT_RESPONSE  op | op_id u32 | value u64
//! FREE_REQUEST        op | key
//! ```

use crate::error::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

const GET_REQUEST: u8 = 0;
const GET_RESPONSE: u8 = 1;
const SET_REQUEST: u8 = 2;
const SYNC_GET_REQUEST: u8 = 3;
const SYNC_SET_REQUEST: u8 = 4;
const INCREMENT_REQUEST: u8 = 5;
const INCREMENT_RESPONSE: u8 = 6;
const FREE_REQUEST: u8 = 7;

/// A hash-table protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtMessage {
    /// Read a key at its owner.
    GetRequest {
        /// Operation id echoed in the response.
        op_id: u32,
        /// Key to read.
        key: Bytes,
    },
    /// Answer to a read or a released synchronized read.
    GetResponse {
        /// Operation id of the request.
        op_id: u32,
        /// Value, or `None` if the key is absent.
        value: Option<Bytes>,
    },
    /// Fire-and-forget write.
    SetRequest {
        /// Key to write.
        key: Bytes,
        /// New value.
        value: Bytes,
    },
    /// Read once the key's accumulated delta reaches `wait_for`.
    SyncGetRequest {
        /// Operation id echoed in the response.
        op_id: u32,
        /// Threshold to wait for.
        wait_for: u64,
        /// Key to read.
        key: Bytes,
    },
    /// Write and add `delta` to the key's accumulator.
    SyncSetRequest {
        /// Amount added to the accumulator.
        delta: u64,
        /// Key to write.
        key: Bytes,
        /// New value.
        value: Bytes,
    },
    /// Bump the key's counter.
    IncrementRequest {
        /// Operation id echoed in the response.
        op_id: u32,
        /// Counter key.
        key: Bytes,
    },
    /// Counter value before the increment.
    IncrementResponse {
        /// Operation id of the request.
        op_id: u32,
        /// Pre-increment value.
        value: u64,
    },
    /// Fire-and-forget removal of a key's value.
    FreeRequest {
        /// Key to remove.
        key: Bytes,
    },
}

impl DhtMessage {
    /// Serialize into a single buffer.
    ///
    /// # Errors
    ///
    /// Returns `WireError::TooLong` if a key or value does not fit a `u32`
    /// length prefix.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::new();
        match self {
            DhtMessage::GetRequest { op_id, key } => {
                buf.put_u8(GET_REQUEST);
                buf.put_u32_le(*op_id);
                put_bytes(&mut buf, key)?;
            }
            DhtMessage::GetResponse { op_id, value } => {
                buf.put_u8(GET_RESPONSE);
                buf.put_u32_le(*op_id);
                match value {
                    Some(value) => {
                        buf.put_u8(1);
                        put_bytes(&mut buf, value)?;
                    }
                    None => buf.put_u8(0),
                }
            }
            DhtMessage::SetRequest { key, value } => {
                buf.put_u8(SET_REQUEST);
                put_bytes(&mut buf, key)?;
                put_bytes(&mut buf, value)?;
            }
            DhtMessage::SyncGetRequest {
                op_id,
                wait_for,
                key,
            } => {
                buf.put_u8(SYNC_GET_REQUEST);
                buf.put_u32_le(*op_id);
                buf.put_u64_le(*wait_for);
                put_bytes(&mut buf, key)?;
            }
            DhtMessage::SyncSetRequest { delta, key, value } => {
                buf.put_u8(SYNC_SET_REQUEST);
                buf.put_u64_le(*delta);
                put_bytes(&mut buf, key)?;
                put_bytes(&mut buf, value)?;
            }
            DhtMessage::IncrementRequest { op_id, key } => {
                buf.put_u8(INCREMENT_REQUEST);
                buf.put_u32_le(*op_id);
                put_bytes(&mut buf, key)?;
            }
            DhtMessage::IncrementResponse { op_id, value } => {
                buf.put_u8(INCREMENT_RESPONSE);
                buf.put_u32_le(*op_id);
                buf.put_u64_le(*value);
            }
            DhtMessage::FreeRequest { key } => {
                buf.put_u8(FREE_REQUEST);
                put_bytes(&mut buf, key)?;
            }
        }
        Ok(buf.freeze())
    }

    /// Parse a message. Key and value slices share `buf`'s storage.
    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let op = get_u8(&mut buf)?;
        let message = match op {
            GET_REQUEST => DhtMessage::GetRequest {
                op_id: get_u32(&mut buf)?,
                key: get_bytes(&mut buf)?,
            },
            GET_RESPONSE => {
                let op_id = get_u32(&mut buf)?;
                let value = match get_u8(&mut buf)? {
                    0 => None,
                    _ => Some(get_bytes(&mut buf)?),
                };
                DhtMessage::GetResponse { op_id, value }
            }
            SET_REQUEST => DhtMessage::SetRequest {
                key: get_bytes(&mut buf)?,
                value: get_bytes(&mut buf)?,
            },
            SYNC_GET_REQUEST => DhtMessage::SyncGetRequest {
                op_id: get_u32(&mut buf)?,
                wait_for: get_u64(&mut buf)?,
                key: get_bytes(&mut buf)?,
            },
            SYNC_SET_REQUEST => DhtMessage::SyncSetRequest {
                delta: get_u64(&mut buf)?,
                key: get_bytes(&mut buf)?,
                value: get_bytes(&mut buf)?,
            },
            INCREMENT_REQUEST => DhtMessage::IncrementRequest {
                op_id: get_u32(&mut buf)?,
                key: get_bytes(&mut buf)?,
            },
            INCREMENT_RESPONSE => DhtMessage::IncrementResponse {
                op_id: get_u32(&mut buf)?,
                value: get_u64(&mut buf)?,
            },
            FREE_REQUEST => DhtMessage::FreeRequest {
                key: get_bytes(&mut buf)?,
            },
            other => return Err(WireError::UnknownOpcode(other)),
        };
        Ok(message)
    }
}

fn put_bytes(buf: &mut BytesMut, data: &[u8]) -> Result<(), WireError> {
    buf.put_u32_le(length_prefix(data.len())?);
    buf.put_slice(data);
    Ok(())
}

fn length_prefix(len: usize) -> Result<u32, WireError> {
    u32::try_from(len).map_err(|_| WireError::TooLong { len })
}

fn need(buf: &Bytes, needed: usize) -> Result<(), WireError> {
    if buf.remaining() < needed {
        return Err(WireError::Truncated {
            needed,
            have: buf.remaining(),
        });
    }
    Ok(())
}

fn get_u8(buf: &mut Bytes) -> Result<u8, WireError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, WireError> {
    need(buf, 4)?;
    Ok(buf.get_u32_le())
}

fn get_u64(buf: &mut Bytes) -> Result<u64, WireError> {
    need(buf, 8)?;
    Ok(buf.get_u64_le())
}

fn get_bytes(buf: &mut Bytes) -> Result<Bytes, WireError> {
    let len = get_u32(buf)? as usize;
    need(buf, len)?;
    Ok(buf.split_to(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_get_response_layout() {
        let encoded = DhtMessage::GetResponse {
            op_id: 7,
            value: None,
        }
        .encode()
        .unwrap();
        assert_eq!(&encoded[..], &[GET_RESPONSE, 7, 0, 0, 0, 0]);
    }

    #[test]
    fn test_sync_set_decodes() {
        let message = DhtMessage::SyncSetRequest {
            delta: 3,
            key: Bytes::from_static(b"x"),
            value: Bytes::from_static(b"v2"),
        };
        assert_eq!(DhtMessage::decode(message.encode().unwrap()).unwrap(), message);
    }

    #[test]
    fn test_truncated_key_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(GET_REQUEST);
        buf.put_u32_le(1);
        buf.put_u32_le(10);
        buf.put_slice(b"short");
        assert!(matches!(
            DhtMessage::decode(buf.freeze()),
            Err(WireError::Truncated { needed: 10, have: 5 })
        ));
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        assert!(matches!(
            DhtMessage::decode(Bytes::from_static(&[0xee])),
            Err(WireError::UnknownOpcode(0xee))
        ));
        assert!(matches!(
            DhtMessage::decode(Bytes::new()),
            Err(WireError::Truncated { needed: 1, have: 0 })
        ));
    }

    #[test]
    fn test_oversized_length_prefix_rejected() {
        assert_eq!(length_prefix(16).unwrap(), 16);
        assert_eq!(length_prefix(u32::MAX as usize).unwrap(), u32::MAX);
        #[cfg(target_pointer_width = "64")]
        assert!(matches!(
            length_prefix(u32::MAX as usize + 1),
            Err(WireError::TooLong { len }) if len == u32::MAX as usize + 1
        ));
    }
}
