//! Host callbacks
//!
//! A callback slot holds a native function pointer while the machine runs.
//! Snapshots cannot hold pointers, so a callback is written as its position
//! in a callback table: the engine's own builtins first (table 0), then the
//! host's table (table 1). The position is the wire identity of a callback,
//! which is why hosts must never reorder their table across versions.

use std::fmt;

use crate::error::MachineResult;
use crate::machine::Machine;
use crate::slot::{SlotRef, Value};

/// Arguments of a host call
#[derive(Debug)]
pub struct CallFrame<'a> {
    /// Called function instance
    pub function: SlotRef,
    /// Receiver
    pub this: Value,
    /// Arguments
    pub args: &'a [Value],
}

impl CallFrame<'_> {
    /// Argument `index`, undefined when absent
    pub fn arg(&self, index: usize) -> Value {
        self.args.get(index).copied().unwrap_or(Value::Undefined)
    }

    /// Argument count
    pub fn argc(&self) -> usize {
        self.args.len()
    }
}

/// Native entry point of a host function
pub type Callback = fn(&mut Machine, &CallFrame<'_>) -> MachineResult<Value>;

/// A callback as stored in a slot
#[derive(Clone, Copy)]
pub struct HostFunction(pub Callback);

impl HostFunction {
    /// Invoke the callback
    pub fn call(self, machine: &mut Machine, frame: &CallFrame<'_>) -> MachineResult<Value> {
        (self.0)(machine, frame)
    }
}

impl PartialEq for HostFunction {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::fn_addr_eq(self.0, other.0)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFunction({:p})", self.0 as *const ())
    }
}

/// Table tag of the engine's builtins
pub const BUILTIN_TABLE: u8 = 0;

/// Table tag of the host's callbacks
pub const HOST_TABLE: u8 = 1;

/// Engine builtins in wire order. Append only.
pub(crate) static BUILTINS: [Callback; 10] = [
    crate::realm::fx_unsupported,
    crate::realm::fx_object_freeze,
    crate::realm::fx_object_is_frozen,
    crate::realm::fx_date_now,
    crate::realm::fx_math_random,
    crate::lockdown::fx_tamed_constructor,
    crate::lockdown::fx_secure_date_now,
    crate::lockdown::fx_secure_math_random,
    crate::harden::fx_harden,
    crate::harden::fx_petrify,
];

/// Version-ordered callback table supplied by the host
#[derive(Clone, Debug, Default)]
pub struct CallbackTable {
    host: Vec<HostFunction>,
}

impl CallbackTable {
    /// Create a table from the host's callbacks, in wire order
    pub fn new(host: &[Callback]) -> Self {
        Self {
            host: host.iter().copied().map(HostFunction).collect(),
        }
    }

    /// A table holding only the engine builtins
    pub fn builtins_only() -> Self {
        Self::default()
    }

    /// Number of host callbacks
    pub fn host_len(&self) -> usize {
        self.host.len()
    }

    /// Wire position of a callback. Builtins win when a host also lists one.
    pub fn position(&self, function: HostFunction) -> Option<(u8, u16)> {
        if let Some(index) = BUILTINS
            .iter()
            .position(|builtin| HostFunction(*builtin) == function)
        {
            return Some((BUILTIN_TABLE, index as u16));
        }
        self.host
            .iter()
            .position(|host| *host == function)
            .map(|index| (HOST_TABLE, index as u16))
    }

    /// Callback at a wire position
    pub fn resolve(&self, table: u8, index: u16) -> Option<HostFunction> {
        match table {
            BUILTIN_TABLE => BUILTINS.get(index as usize).copied().map(HostFunction),
            HOST_TABLE => self.host.get(index as usize).copied(),
            _ => None,
        }
    }
}
