//! Snapshot errors

use thiserror::Error;
use xsnap_core::{CodecError, MachineError};

/// Errors that can occur reading or writing a snapshot
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// IO error on the source or sink
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Signature atom does not match the expected signature
    #[error("Invalid signature: {0:?}")]
    BadSignature(String),

    /// Unsupported snapshot version
    #[error("Unsupported version: {0}.{1}.{2}")]
    UnsupportedVersion(u8, u8, u8),

    /// Atom type differs from the one expected at this position
    #[error("Expected atom {expected}, found {found}")]
    UnexpectedAtom {
        /// Expected atom type
        expected: String,
        /// Atom type found
        found: String,
    },

    /// Atom size smaller than its header or inconsistent with its content
    #[error("Atom {atom} has a bad size ({size} bytes)")]
    BadAtomSize {
        /// Atom type
        atom: String,
        /// Size read from the header
        size: u32,
    },

    /// Source ended inside an atom
    #[error("Unexpected end of snapshot in atom {0}")]
    Truncated(String),

    /// Bytes after the last atom
    #[error("Trailing bytes after the last atom")]
    Trailing,

    /// Corrupt slot record
    #[error("Slot {index}: {source}")]
    Slot {
        /// Heap or stack index of the record
        index: usize,
        /// Decoding error
        source: CodecError,
    },

    /// Corrupt table entry
    #[error("Invalid table: {0}")]
    InvalidTable(String),

    /// The reconstructed machine is not usable
    #[error("Machine error: {0}")]
    Machine(#[from] MachineError),
}

/// Result type for snapshot operations
pub type Result<T> = std::result::Result<T, SnapshotError>;
