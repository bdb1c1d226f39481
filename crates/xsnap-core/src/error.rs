//! Machine error types

use crate::slot::Value;
use thiserror::Error;

/// Errors raised by the heap model and the integrity passes
#[derive(Debug, Error)]
pub enum MachineError {
    /// Type error (e.g., calling non-function, harden before lockdown)
    #[error("TypeError: {0}")]
    TypeError(String),

    /// Range error (e.g., invalid array length)
    #[error("RangeError: {0}")]
    RangeError(String),

    /// URI error (malformed URI sequence)
    #[error("URIError: {0}")]
    URIError(String),

    /// Error without a more specific constructor
    #[error("Error: {0}")]
    Unknown(String),

    /// Heap or stack exhausted
    #[error("OutOfMemory: {0}")]
    OutOfMemory(&'static str),

    /// Meter limit exceeded
    #[error("too much computation")]
    TooMuchComputation,

    /// Thrown value (host code threw something that is not a typed error)
    #[error("Uncaught exception: {0:?}")]
    Exception(Value),
}

impl MachineError {
    /// Create a type error
    pub fn type_error(msg: impl Into<String>) -> Self {
        Self::TypeError(msg.into())
    }

    /// Create a range error
    pub fn range_error(msg: impl Into<String>) -> Self {
        Self::RangeError(msg.into())
    }

    /// Create a URI error
    pub fn uri_error(msg: impl Into<String>) -> Self {
        Self::URIError(msg.into())
    }

    /// Create an unknown error
    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::Unknown(msg.into())
    }

    /// Create an exception from a thrown value
    pub fn exception(value: Value) -> Self {
        Self::Exception(value)
    }

    /// Is this a type error
    pub fn is_type_error(&self) -> bool {
        matches!(self, Self::TypeError(_))
    }
}

/// Result type for machine operations
pub type MachineResult<T> = std::result::Result<T, MachineError>;

/// Errors decoding or relocating a serialized slot
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Unknown slot kind byte
    #[error("invalid slot kind {0}")]
    InvalidKind(u8),

    /// Unknown flag bits
    #[error("invalid slot flags {0:#06x}")]
    InvalidFlags(u16),

    /// Slot record has the wrong length
    #[error("slot record of {0} bytes")]
    BadLength(usize),

    /// Heap link out of range
    #[error("heap link {link} out of range (heap has {count} slots)")]
    BadSlotLink {
        /// Relative link
        link: u32,
        /// Heap slot count
        count: u32,
    },

    /// Chunk offset does not designate a chunk of the block
    #[error("chunk offset {0} is not a chunk of the block")]
    BadChunk(u32),

    /// Callback position unknown to the callback table
    #[error("callback {table}:{index} is not in the callback table")]
    BadCallback {
        /// Table tag
        table: u8,
        /// Position in the table
        index: u16,
    },

    /// Callback is not registered in the callback table
    #[error("callback is not registered in the callback table")]
    UnregisteredCallback,

    /// Enumerated payload byte out of range
    #[error("invalid {what} {value}")]
    InvalidEnum {
        /// Field name
        what: &'static str,
        /// Raw value
        value: u8,
    },

    /// Key ID out of range
    #[error("key {0} out of range")]
    BadKey(u32),
}
