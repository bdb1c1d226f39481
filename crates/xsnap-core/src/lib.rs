//! # xsnap core
//!
//! Heap model of an xsnap machine and the passes that run over it.
//!
//! ## Layout
//!
//! - **Slots**: every value lives in a fixed-size slot of the heap, linked
//!   by index. Chunks of variable size (strings, bytecode, array stores)
//!   live in the block.
//! - **Realm**: the stack starts with the machine roots and the intrinsics.
//! - **Passes**: the [`walker`] drives [`alias`] checking and [`purify`];
//!   [`harden`] walks the same edges after [`lockdown`].
//!
//! Snapshots of a [`Machine`] are written and read by `xsnap-snapshot`.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod alias;
pub mod block;
pub mod callbacks;
pub mod codec;
pub mod creation;
pub mod error;
pub mod freeze;
pub mod harden;
pub mod keys;
pub mod lockdown;
pub mod machine;
pub mod modules;
pub mod object;
pub mod platform;
pub mod purify;
pub mod realm;
pub mod slot;
pub mod walker;

pub use alias::{AliasReport, Diagnostic, Severity, check_aliases};
pub use block::{Block, ChunkRef};
pub use callbacks::{CallFrame, Callback, CallbackTable, HostFunction};
pub use creation::Creation;
pub use error::{CodecError, MachineError, MachineResult};
pub use freeze::{freeze, freeze_builtins, is_frozen};
pub use harden::{harden, petrify};
pub use keys::KeyTable;
pub use lockdown::lockdown;
pub use machine::{Machine, MachineParts, Meter, Root};
pub use modules::Declaration;
pub use purify::purify;
pub use realm::Intrinsic;
pub use slot::{KeyId, Slot, SlotFlags, SlotKind, SlotRef, Value};

/// Version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
