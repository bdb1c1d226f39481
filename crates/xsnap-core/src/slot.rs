//! Heap slots
//!
//! A slot is one tagged heap cell. The same shape is used for heap slots,
//! stack slots and array items; which payload is valid is decided by the
//! variant of [`Value`], so every reader has to match on the kind first.

use std::fmt;
use std::num::NonZeroU32;

use bitflags::bitflags;

use crate::block::ChunkRef;
use crate::callbacks::HostFunction;

/// Index of a slot in the heap. Index 0 is the sentinel and never a valid reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotRef(NonZeroU32);

impl SlotRef {
    /// Create from a heap index, `None` for the sentinel
    pub fn new(index: u32) -> Option<Self> {
        NonZeroU32::new(index).map(Self)
    }

    /// Heap index
    pub fn index(self) -> u32 {
        self.0.get()
    }

    /// Heap index as usize
    pub fn as_usize(self) -> usize {
        self.0.get() as usize
    }
}

impl fmt::Display for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Entry in the key table
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(pub u32);

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Handle to host data attached to a host slot. Never persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HostHandle(pub u32);

bitflags! {
    /// Slot flags
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SlotFlags: u16 {
        /// Garbage collector mark
        const MARK = 1 << 0;
        /// Property is not enumerable
        const DONT_ENUM = 1 << 1;
        /// Property is not configurable
        const DONT_DELETE = 1 << 2;
        /// Property (or internal data) is not writable
        const DONT_SET = 1 << 3;
        /// Internal slot, invisible to property enumeration
        const INTERNAL = 1 << 4;
        /// Visited marker of the engine's own traversals
        const LEVEL = 1 << 5;
        /// Hardened: shared-safe, never re-marshalled across a realm boundary
        const DONT_MARSHALL = 1 << 6;
        /// Instance is not extensible
        const DONT_PATCH = 1 << 7;
        /// Class field
        const FIELD = 1 << 8;
        /// Exotic instance (proxy, host object)
        const EXOTIC = 1 << 9;
    }
}

impl SlotFlags {
    /// Flags that only make sense while a pass runs and are never persisted
    pub const TRANSIENT: SlotFlags = SlotFlags::MARK.union(SlotFlags::LEVEL);

    /// Flags of a frozen data property
    pub const FROZEN: SlotFlags = SlotFlags::DONT_DELETE.union(SlotFlags::DONT_SET);
}

/// Promise state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PromiseStatus {
    /// Not settled
    Pending = 0,
    /// Fulfilled
    Fulfilled = 1,
    /// Rejected
    Rejected = 2,
}

/// Generator state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum GeneratorState {
    /// Created, never resumed
    SuspendedStart = 0,
    /// Suspended at a yield
    SuspendedYield = 1,
    /// Running
    Executing = 2,
    /// Done
    Completed = 3,
}

/// Typed array element type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ElementType {
    /// Int8Array
    Int8 = 0,
    /// Uint8Array
    Uint8 = 1,
    /// Uint8ClampedArray
    Uint8Clamped = 2,
    /// Int16Array
    Int16 = 3,
    /// Uint16Array
    Uint16 = 4,
    /// Int32Array
    Int32 = 5,
    /// Uint32Array
    Uint32 = 6,
    /// Float32Array
    Float32 = 7,
    /// Float64Array
    Float64 = 8,
    /// BigInt64Array
    BigInt64 = 9,
    /// BigUint64Array
    BigUint64 = 10,
}

impl ElementType {
    /// Bytes per element
    pub fn size(self) -> u32 {
        match self {
            Self::Int8 | Self::Uint8 | Self::Uint8Clamped => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Int32 | Self::Uint32 | Self::Float32 => 4,
            Self::Float64 | Self::BigInt64 | Self::BigUint64 => 8,
        }
    }
}

macro_rules! impl_try_from_u8 {
    ($ty:ident { $($variant:ident),* $(,)? }) => {
        impl TryFrom<u8> for $ty {
            type Error = u8;

            fn try_from(value: u8) -> Result<Self, u8> {
                $(if value == $ty::$variant as u8 {
                    return Ok($ty::$variant);
                })*
                Err(value)
            }
        }
    };
}

impl_try_from_u8!(PromiseStatus { Pending, Fulfilled, Rejected });
impl_try_from_u8!(GeneratorState { SuspendedStart, SuspendedYield, Executing, Completed });
impl_try_from_u8!(ElementType {
    Int8, Uint8, Uint8Clamped, Int16, Uint16, Int32, Uint32, Float32, Float64, BigInt64, BigUint64,
});

/// Slot kind: the discriminant of [`Value`], as stored on the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SlotKind {
    /// undefined
    Undefined = 0,
    /// null
    Null = 1,
    /// boolean
    Boolean = 2,
    /// 32-bit integer
    Integer = 3,
    /// number
    Number = 4,
    /// string
    String = 5,
    /// symbol
    Symbol = 6,
    /// bigint
    BigInt = 7,
    /// reference to an instance
    Reference = 8,
    /// reference to a closure binding
    Closure = 9,
    /// instance header
    Instance = 10,
    /// array backing store
    Array = 11,
    /// array buffer data
    ArrayBuffer = 12,
    /// host function
    Callback = 13,
    /// bytecode function
    Code = 14,
    /// date value
    Date = 15,
    /// data view window
    DataView = 16,
    /// map data
    Map = 17,
    /// set data
    Set = 18,
    /// weak map data
    WeakMap = 19,
    /// weak set data
    WeakSet = 20,
    /// module record
    Module = 21,
    /// promise state
    Promise = 22,
    /// proxy handler and target
    Proxy = 23,
    /// regexp pattern
    RegExp = 24,
    /// typed array element type
    TypedArray = 25,
    /// accessor pair
    Accessor = 26,
    /// key table entry
    Key = 27,
    /// list head
    List = 28,
    /// private elements
    Private = 29,
    /// host data
    Host = 30,
    /// module export
    Export = 31,
    /// generator state
    Generator = 32,
}

impl SlotKind {
    /// Every kind, in wire order
    pub const ALL: [SlotKind; 33] = [
        Self::Undefined,
        Self::Null,
        Self::Boolean,
        Self::Integer,
        Self::Number,
        Self::String,
        Self::Symbol,
        Self::BigInt,
        Self::Reference,
        Self::Closure,
        Self::Instance,
        Self::Array,
        Self::ArrayBuffer,
        Self::Callback,
        Self::Code,
        Self::Date,
        Self::DataView,
        Self::Map,
        Self::Set,
        Self::WeakMap,
        Self::WeakSet,
        Self::Module,
        Self::Promise,
        Self::Proxy,
        Self::RegExp,
        Self::TypedArray,
        Self::Accessor,
        Self::Key,
        Self::List,
        Self::Private,
        Self::Host,
        Self::Export,
        Self::Generator,
    ];

    /// Lower-case name used by diagnostics and the dumper
    pub fn name(self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::String => "string",
            Self::Symbol => "symbol",
            Self::BigInt => "bigint",
            Self::Reference => "reference",
            Self::Closure => "closure",
            Self::Instance => "instance",
            Self::Array => "array",
            Self::ArrayBuffer => "arrayBuffer",
            Self::Callback => "callback",
            Self::Code => "code",
            Self::Date => "date",
            Self::DataView => "dataView",
            Self::Map => "map",
            Self::Set => "set",
            Self::WeakMap => "weakMap",
            Self::WeakSet => "weakSet",
            Self::Module => "module",
            Self::Promise => "promise",
            Self::Proxy => "proxy",
            Self::RegExp => "regexp",
            Self::TypedArray => "typedArray",
            Self::Accessor => "accessor",
            Self::Key => "key",
            Self::List => "list",
            Self::Private => "private",
            Self::Host => "host",
            Self::Export => "export",
            Self::Generator => "generator",
        }
    }
}

impl TryFrom<u8> for SlotKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        Self::ALL.get(value as usize).copied().ok_or(value)
    }
}

/// Slot payload
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    /// undefined
    Undefined,
    /// null
    Null,
    /// boolean
    Boolean(bool),
    /// 32-bit integer
    Integer(i32),
    /// number
    Number(f64),
    /// UTF-8 string data in a chunk
    String(ChunkRef),
    /// symbol key
    Symbol(KeyId),
    /// bigint digits (little-endian u32 words) in a chunk
    BigInt {
        /// Digits chunk
        digits: ChunkRef,
        /// Sign
        negative: bool,
    },
    /// reference to an instance
    Reference(SlotRef),
    /// reference to a closure binding (environment variable)
    Closure(SlotRef),
    /// instance header: first slot of every object
    Instance {
        /// Prototype instance
        prototype: Option<SlotRef>,
    },
    /// array items, encoded slots in a chunk
    Array {
        /// Items chunk, `None` when empty
        address: Option<ChunkRef>,
        /// Item count
        length: u32,
    },
    /// array buffer bytes
    ArrayBuffer {
        /// Data chunk, `None` when detached or empty
        address: Option<ChunkRef>,
        /// Byte length
        length: u32,
    },
    /// host function
    Callback {
        /// Native entry point
        function: HostFunction,
        /// Captured environment
        closures: Option<SlotRef>,
    },
    /// bytecode function
    Code {
        /// Bytecode chunk
        address: ChunkRef,
        /// Captured environment
        closures: Option<SlotRef>,
    },
    /// date value (ms since epoch)
    Date(f64),
    /// data view / typed array window
    DataView {
        /// Byte offset
        offset: u32,
        /// Byte size
        size: u32,
    },
    /// map data, entries as key/value slot pairs
    Map {
        /// First entry
        entries: Option<SlotRef>,
    },
    /// set data
    Set {
        /// First entry
        entries: Option<SlotRef>,
    },
    /// weak map data
    WeakMap {
        /// First entry
        entries: Option<SlotRef>,
    },
    /// weak set data
    WeakSet {
        /// First entry
        entries: Option<SlotRef>,
    },
    /// module record
    Module {
        /// Exports instance
        exports: Option<SlotRef>,
        /// Module environment
        environment: Option<SlotRef>,
    },
    /// promise state
    Promise(PromiseStatus),
    /// proxy
    Proxy {
        /// Handler instance, `None` once revoked
        handler: Option<SlotRef>,
        /// Target instance, `None` once revoked
        target: Option<SlotRef>,
    },
    /// regexp pattern
    RegExp {
        /// Source chunk
        source: ChunkRef,
        /// Flag bits
        flags: u32,
    },
    /// typed array element type
    TypedArray(ElementType),
    /// accessor pair
    Accessor {
        /// Getter function
        getter: Option<SlotRef>,
        /// Setter function
        setter: Option<SlotRef>,
    },
    /// key table entry
    Key {
        /// Name or description chunk
        name: Option<ChunkRef>,
        /// Hash sum of the name
        sum: u32,
        /// Symbol key rather than a string key
        symbol: bool,
    },
    /// list head
    List {
        /// First item
        first: Option<SlotRef>,
    },
    /// private elements
    Private {
        /// First private field
        first: Option<SlotRef>,
    },
    /// host data
    Host {
        /// Native data, dropped by snapshots
        data: Option<HostHandle>,
    },
    /// module export
    Export {
        /// Binding slot
        closure: Option<SlotRef>,
        /// Exporting module
        module: Option<SlotRef>,
    },
    /// generator continuation
    Generator(GeneratorState),
}

impl Value {
    /// The slot kind of this payload
    pub fn kind(&self) -> SlotKind {
        match self {
            Self::Undefined => SlotKind::Undefined,
            Self::Null => SlotKind::Null,
            Self::Boolean(_) => SlotKind::Boolean,
            Self::Integer(_) => SlotKind::Integer,
            Self::Number(_) => SlotKind::Number,
            Self::String(_) => SlotKind::String,
            Self::Symbol(_) => SlotKind::Symbol,
            Self::BigInt { .. } => SlotKind::BigInt,
            Self::Reference(_) => SlotKind::Reference,
            Self::Closure(_) => SlotKind::Closure,
            Self::Instance { .. } => SlotKind::Instance,
            Self::Array { .. } => SlotKind::Array,
            Self::ArrayBuffer { .. } => SlotKind::ArrayBuffer,
            Self::Callback { .. } => SlotKind::Callback,
            Self::Code { .. } => SlotKind::Code,
            Self::Date(_) => SlotKind::Date,
            Self::DataView { .. } => SlotKind::DataView,
            Self::Map { .. } => SlotKind::Map,
            Self::Set { .. } => SlotKind::Set,
            Self::WeakMap { .. } => SlotKind::WeakMap,
            Self::WeakSet { .. } => SlotKind::WeakSet,
            Self::Module { .. } => SlotKind::Module,
            Self::Promise(_) => SlotKind::Promise,
            Self::Proxy { .. } => SlotKind::Proxy,
            Self::RegExp { .. } => SlotKind::RegExp,
            Self::TypedArray(_) => SlotKind::TypedArray,
            Self::Accessor { .. } => SlotKind::Accessor,
            Self::Key { .. } => SlotKind::Key,
            Self::List { .. } => SlotKind::List,
            Self::Private { .. } => SlotKind::Private,
            Self::Host { .. } => SlotKind::Host,
            Self::Export { .. } => SlotKind::Export,
            Self::Generator(_) => SlotKind::Generator,
        }
    }

    /// Referenced instance, if this is a reference
    pub fn as_reference(&self) -> Option<SlotRef> {
        match self {
            Self::Reference(r) => Some(*r),
            _ => None,
        }
    }

    /// Number value of numeric payloads
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Values a script can hold in a variable or a property
    pub fn is_language_value(&self) -> bool {
        matches!(
            self,
            Self::Undefined
                | Self::Null
                | Self::Boolean(_)
                | Self::Integer(_)
                | Self::Number(_)
                | Self::String(_)
                | Self::Symbol(_)
                | Self::BigInt { .. }
                | Self::Reference(_)
        )
    }

    /// ToBoolean for values that do not need the heap
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Undefined | Self::Null => false,
            Self::Boolean(b) => *b,
            Self::Integer(i) => *i != 0,
            Self::Number(n) => !(*n == 0.0 || n.is_nan()),
            _ => true,
        }
    }
}

/// One heap cell
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Slot {
    /// Next slot of the chain this slot belongs to
    pub next: Option<SlotRef>,
    /// Key ID for properties, alias ID for instances and bindings
    pub id: Option<u32>,
    /// Flags
    pub flag: SlotFlags,
    /// Payload
    pub value: Value,
}

impl Slot {
    /// An unlinked slot without ID or flags
    pub const fn new(value: Value) -> Self {
        Self {
            next: None,
            id: None,
            flag: SlotFlags::empty(),
            value,
        }
    }

    /// A free slot
    pub const fn free() -> Self {
        Self::new(Value::Undefined)
    }

    /// A property slot
    pub fn property(key: KeyId, value: Value, flag: SlotFlags) -> Self {
        Self {
            next: None,
            id: Some(key.0),
            flag,
            value,
        }
    }

    /// An internal slot
    pub fn internal(value: Value) -> Self {
        Self {
            next: None,
            id: None,
            flag: SlotFlags::INTERNAL | SlotFlags::DONT_ENUM,
            value,
        }
    }

    /// The slot kind
    pub fn kind(&self) -> SlotKind {
        self.value.kind()
    }

    /// Property key of a property slot
    pub fn key(&self) -> Option<KeyId> {
        if self.flag.contains(SlotFlags::INTERNAL) {
            None
        } else {
            self.id.map(KeyId)
        }
    }

    /// Is this slot an internal slot
    pub fn is_internal(&self) -> bool {
        self.flag.contains(SlotFlags::INTERNAL)
    }
}
