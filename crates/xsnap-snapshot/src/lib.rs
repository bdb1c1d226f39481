//! # xsnap Snapshots
//!
//! This crate writes, reads and dumps snapshots of an xsnap [`Machine`].
//!
//! ## Format
//!
//! - **Atoms**: a snapshot is a sequence of size-prefixed, typed atoms
//! - **Verbatim**: the block and slot records are written as the machine
//!   holds them, links being indexes and offsets
//! - **Checked**: the reader bounds-checks every link before the machine
//!   is rebuilt, so a corrupt file never yields a machine
//! - **Portable callbacks**: host functions are written as positions in a
//!   [`CallbackTable`] the host supplies on both ends

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod atom;
pub mod dump;
pub mod error;
pub mod reader;
pub mod writer;

pub use dump::dump_snapshot;
pub use error::{Result as SnapshotResult, SnapshotError};
pub use reader::{read_snapshot, read_snapshot_file};
pub use writer::{write_snapshot, write_snapshot_file};

use xsnap_core::{CallbackTable, Machine};

/// Default snapshot signature
pub const SIGNATURE: &[u8] = b"xsnap 1";

/// Snapshot format version: major, minor, patch, reserved
pub const VERSION: [u8; 4] = [1, 0, 0, 0];

/// Options shared by the writer and the reader
#[derive(Clone, Debug)]
pub struct SnapshotOptions {
    /// Signature bytes, compared verbatim when reading
    pub signature: Vec<u8>,
    /// Host callbacks, in wire order
    pub callbacks: CallbackTable,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            signature: SIGNATURE.to_vec(),
            callbacks: CallbackTable::builtins_only(),
        }
    }
}

impl SnapshotOptions {
    /// Default signature with the given host callbacks
    pub fn new(callbacks: CallbackTable) -> Self {
        Self {
            callbacks,
            ..Self::default()
        }
    }

    /// Replace the signature
    pub fn with_signature(mut self, signature: impl Into<Vec<u8>>) -> Self {
        self.signature = signature.into();
        self
    }
}
