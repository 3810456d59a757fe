//! Error types for the ebbrt runtime.
//!
//! Every condition the runtime treats as fatal is surfaced as an `Err` from
//! the operation that hit it. Nothing inside the event loop swallows these:
//! they propagate out of [`EventManager::pump_once`](crate::event::EventManager::pump_once)
//! and [`Context::run_loop`](crate::runtime::Context::run_loop) so the
//! embedding binary can terminate with a diagnostic.

use crate::ebb::EbbId;
use crate::event::SlotId;
use crate::messaging::NetworkId;
use thiserror::Error;

/// Errors from the identity and representative tables.
#[derive(Debug, Error)]
pub enum TranslationError {
    /// The identifier space has been used up.
    #[error("EbbId space exhausted (max: {max})")]
    IdSpaceExhausted {
        /// Highest id the allocator may issue.
        max: u32,
    },

    /// No root is bound for this id and the miss handler could not resolve it.
    #[error("No binding for {0}")]
    Unbound(EbbId),

    /// A root was already installed for this id.
    #[error("{0} is already bound")]
    AlreadyBound(EbbId),

    /// The representative exists but is not of the requested type.
    #[error("Representative for {id} is not a {expected}")]
    TypeMismatch {
        /// Id that was resolved.
        id: EbbId,
        /// Type name the caller asked for.
        expected: &'static str,
    },

    /// A static binding name is not present in the configuration.
    #[error("Unknown static Ebb name: {0}")]
    UnknownStaticName(String),

    /// All execution locations of the runtime are in use.
    #[error("No execution locations left (max: {max})")]
    ContextsExhausted {
        /// Number of locations the runtime allows.
        max: usize,
    },
}

/// Errors from the event manager.
#[derive(Debug, Error)]
pub enum EventError {
    /// Every interrupt slot has been handed out.
    #[error("Interrupt slots exhausted (max: {max})")]
    SlotsExhausted {
        /// Upper bound of the slot range.
        max: u16,
    },

    /// An interrupt fired on a slot nobody registered.
    #[error("Interrupt {0} fired with no registered handler")]
    UnregisteredSlot(SlotId),

    /// The pump was entered from inside a handler.
    #[error("Event manager is already dispatching")]
    Reentrant,
}

/// Errors from transports and the devices beneath them.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Not enough free descriptors to queue a send.
    #[error("Ring exhausted: need {needed} descriptors, {free} free")]
    RingExhausted {
        /// Descriptors the chain requires.
        needed: usize,
        /// Descriptors currently free.
        free: u16,
    },

    /// Frame is larger than the device MTU.
    #[error("Frame too large: {size} bytes (mtu: {mtu})")]
    FrameTooLarge {
        /// Frame size in bytes.
        size: usize,
        /// Device MTU in bytes.
        mtu: usize,
    },

    /// The destination address kind does not match this transport.
    #[error("Destination {to} cannot be reached over the {transport} transport")]
    WrongAddressKind {
        /// Requested destination.
        to: NetworkId,
        /// Name of the transport that rejected it.
        transport: &'static str,
    },

    /// The device has not been attached to an event manager yet.
    #[error("Device not attached to an event manager")]
    NotAttached,

    /// The underlying send primitive reported failure.
    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Errors decoding bytes received from the wire.
#[derive(Debug, Clone, Error)]
pub enum WireError {
    /// Not enough data to parse a header or field.
    #[error("Truncated message: need {needed} bytes, have {have}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes left in the buffer.
        have: usize,
    },

    /// Unknown operation discriminator.
    #[error("Unknown opcode: {0}")]
    UnknownOpcode(u8),

    /// A key or value is too long for its `u32` length prefix.
    #[error("Field too long to encode: {len} bytes")]
    TooLong {
        /// Length of the offending field.
        len: usize,
    },
}

/// Protocol errors in the distributed hash table.
#[derive(Debug, Error)]
pub enum DhtError {
    /// A response arrived for an operation id with no pending record.
    #[error("Unknown operation id: {0}")]
    UnknownOperation(u32),

    /// A response arrived whose shape does not match the pending record.
    #[error("Response for operation {0} does not match its request")]
    ResponseMismatch(u32),

    /// A request for a key this process does not own.
    #[error("Request for a key owned by node {owner} arrived at node {local}")]
    NotOwner {
        /// Node that owns the key.
        owner: usize,
        /// Node the request arrived at.
        local: usize,
    },

    /// Node table is empty or the local index is out of range.
    #[error("Invalid DHT configuration: {0}")]
    InvalidConfig(String),
}

/// Umbrella error for the runtime.
#[derive(Debug, Error)]
pub enum EbbError {
    /// Identity table error.
    #[error("Translation error: {0}")]
    Translation(#[from] TranslationError),

    /// Event manager error.
    #[error("Event error: {0}")]
    Event(#[from] EventError),

    /// Transport error.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed inbound message.
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    /// Distributed hash table error.
    #[error("DHT error: {0}")]
    Dht(#[from] DhtError),

    /// Configuration could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),

    /// A message was delivered to a representative that does not accept messages.
    #[error("Representative cannot handle messages (from {from})")]
    MessageNotHandled {
        /// Sender of the message.
        from: NetworkId,
    },

    /// A reply arrived with no request waiting for it.
    #[error("Unsolicited reply from {from}")]
    UnsolicitedReply {
        /// Sender of the reply.
        from: NetworkId,
    },

    /// Work was added to a bag at a process that does not hold it.
    #[error("Work can only be added at the bag's server ({server})")]
    NotBagServer {
        /// Process that holds the bag.
        server: NetworkId,
    },

    /// Location 0 failed to run the one-time initializers.
    #[error("Process-wide initialization failed: {0}")]
    InitFailed(String),
}

/// Result type used throughout the runtime.
pub type Result<T> = std::result::Result<T, EbbError>;
