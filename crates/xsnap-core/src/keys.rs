//! Key table
//!
//! Keys are interned property names and symbols. Every key is a key slot in
//! the heap; the table maps key IDs to those slots. Names are hashed into
//! `name_modulo` buckets chained through the key slots' `next` links, and
//! `Symbol.for` registrations into `symbol_modulo` buckets the same way.
//!
//! The first key IDs are fixed: the well-known symbols, then the names the
//! heap model itself refers to. A snapshot whose first keys differ cannot be
//! resumed by this build.

use crate::error::{MachineError, MachineResult};
use crate::machine::Machine;
use crate::slot::{KeyId, Slot, SlotRef, Value};

/// Well-known symbol descriptions, in key ID order
pub const WELL_KNOWN_SYMBOLS: [&str; 13] = [
    "Symbol.asyncIterator",
    "Symbol.hasInstance",
    "Symbol.isConcatSpreadable",
    "Symbol.iterator",
    "Symbol.match",
    "Symbol.matchAll",
    "Symbol.replace",
    "Symbol.search",
    "Symbol.species",
    "Symbol.split",
    "Symbol.toPrimitive",
    "Symbol.toStringTag",
    "Symbol.unscopables",
];

/// Well-known symbol key IDs
pub mod well_known {
    use crate::slot::KeyId;

    /// `Symbol.asyncIterator`
    pub const ASYNC_ITERATOR: KeyId = KeyId(0);
    /// `Symbol.hasInstance`
    pub const HAS_INSTANCE: KeyId = KeyId(1);
    /// `Symbol.isConcatSpreadable`
    pub const IS_CONCAT_SPREADABLE: KeyId = KeyId(2);
    /// `Symbol.iterator`
    pub const ITERATOR: KeyId = KeyId(3);
    /// `Symbol.match`
    pub const MATCH: KeyId = KeyId(4);
    /// `Symbol.matchAll`
    pub const MATCH_ALL: KeyId = KeyId(5);
    /// `Symbol.replace`
    pub const REPLACE: KeyId = KeyId(6);
    /// `Symbol.search`
    pub const SEARCH: KeyId = KeyId(7);
    /// `Symbol.species`
    pub const SPECIES: KeyId = KeyId(8);
    /// `Symbol.split`
    pub const SPLIT: KeyId = KeyId(9);
    /// `Symbol.toPrimitive`
    pub const TO_PRIMITIVE: KeyId = KeyId(10);
    /// `Symbol.toStringTag`
    pub const TO_STRING_TAG: KeyId = KeyId(11);
    /// `Symbol.unscopables`
    pub const UNSCOPABLES: KeyId = KeyId(12);
}

macro_rules! known_names {
    ($($id:ident = $name:literal),* $(,)?) => {
        /// Names interned right after the well-known symbols, in key ID order
        pub const KNOWN_NAMES: &[&str] = &[$($name),*];

        #[allow(non_camel_case_types, clippy::upper_case_acronyms)]
        enum KnownName {
            $($id),*
        }

        impl KeyId {
            $(
                #[doc = concat!("`", $name, "`")]
                pub const $id: KeyId = KeyId(WELL_KNOWN_SYMBOLS.len() as u32 + KnownName::$id as u32);
            )*
        }
    };
}

known_names! {
    PROTO = "__proto__",
    CONSTRUCTOR = "constructor",
    PROTOTYPE = "prototype",
    LENGTH = "length",
    NAME = "name",
    GLOBAL = "global",
    GLOBAL_THIS = "globalThis",
    OBJECT = "Object",
    FUNCTION = "Function",
    DATE = "Date",
    MATH = "Math",
    NOW = "now",
    RANDOM = "random",
    FREEZE = "freeze",
    IS_FROZEN = "isFrozen",
    PREVENT_EXTENSIONS = "preventExtensions",
    HARDEN = "harden",
    PETRIFY = "petrify",
    LOCKDOWN = "lockdown",
    DEFAULT = "default",
    CALLBACK = "callback",
    ARGUMENT = "argument",
    INTERVAL = "interval",
    WHEN = "when",
    REPEAT = "repeat",
    ID = "id",
    MESSAGE = "message",
}

/// Number of keys every machine starts with
pub const FIXED_KEY_COUNT: usize = WELL_KNOWN_SYMBOLS.len() + KNOWN_NAMES.len();

/// Hash sum of a key name (32-bit FNV-1a)
pub fn sum(name: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in name {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Key ID to key slot table, plus the name and symbol hash buckets
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyTable {
    pub(crate) keys: Vec<SlotRef>,
    pub(crate) names: Vec<Option<SlotRef>>,
    pub(crate) symbols: Vec<Option<SlotRef>>,
}

impl KeyTable {
    /// Empty table with the given bucket counts
    pub fn new(name_modulo: u32, symbol_modulo: u32, capacity: usize) -> Self {
        Self {
            keys: Vec::with_capacity(capacity),
            names: vec![None; name_modulo as usize],
            symbols: vec![None; symbol_modulo as usize],
        }
    }

    /// Rebuild from tables read out of a snapshot
    pub fn from_parts(
        keys: Vec<SlotRef>,
        names: Vec<Option<SlotRef>>,
        symbols: Vec<Option<SlotRef>>,
    ) -> Self {
        Self {
            keys,
            names,
            symbols,
        }
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Is the table empty
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Key slot of a key ID
    pub fn slot(&self, key: KeyId) -> Option<SlotRef> {
        self.keys.get(key.0 as usize).copied()
    }

    /// Key slots in key ID order
    pub fn key_slots(&self) -> &[SlotRef] {
        &self.keys
    }

    /// Name bucket heads
    pub fn name_buckets(&self) -> &[Option<SlotRef>] {
        &self.names
    }

    /// Symbol registry bucket heads
    pub fn symbol_buckets(&self) -> &[Option<SlotRef>] {
        &self.symbols
    }
}

impl Machine {
    /// Intern a property name
    pub fn intern(&mut self, name: &str) -> MachineResult<KeyId> {
        if let Some(key) = self.find_key(name) {
            return Ok(key);
        }
        let sum = sum(name.as_bytes());
        let bucket = (sum % self.keys.names.len() as u32) as usize;
        let chunk = self.block.allocate(name.as_bytes());
        let key = KeyId(self.keys.keys.len() as u32);
        let slot = self.allocate(Slot {
            next: self.keys.names[bucket],
            id: Some(key.0),
            flag: Default::default(),
            value: Value::Key {
                name: Some(chunk),
                sum,
                symbol: false,
            },
        })?;
        self.keys.names[bucket] = Some(slot);
        self.keys.keys.push(slot);
        Ok(key)
    }

    /// Key of an already interned name
    pub fn find_key(&self, name: &str) -> Option<KeyId> {
        if self.keys.names.is_empty() {
            return None;
        }
        let sum = sum(name.as_bytes());
        let bucket = (sum % self.keys.names.len() as u32) as usize;
        self.find_in_chain(self.keys.names[bucket], name, sum)
    }

    /// Create a new unique symbol
    pub fn new_symbol(&mut self, description: Option<&str>) -> MachineResult<KeyId> {
        let (name, sum) = match description {
            Some(description) => (
                Some(self.block.allocate(description.as_bytes())),
                sum(description.as_bytes()),
            ),
            None => (None, 0),
        };
        let key = KeyId(self.keys.keys.len() as u32);
        let slot = self.allocate(Slot {
            next: None,
            id: Some(key.0),
            flag: Default::default(),
            value: Value::Key {
                name,
                sum,
                symbol: true,
            },
        })?;
        self.keys.keys.push(slot);
        Ok(key)
    }

    /// `Symbol.for(description)`: the registered symbol, created on first use
    pub fn symbol_for(&mut self, description: &str) -> MachineResult<KeyId> {
        let sum = sum(description.as_bytes());
        let bucket = (sum % self.keys.symbols.len() as u32) as usize;
        if let Some(key) = self.find_in_chain(self.keys.symbols[bucket], description, sum) {
            return Ok(key);
        }
        let key = self.new_symbol(Some(description))?;
        let slot = self
            .keys
            .slot(key)
            .ok_or_else(|| MachineError::unknown("symbol key lost"))?;
        self.heap[slot.as_usize()].next = self.keys.symbols[bucket];
        self.keys.symbols[bucket] = Some(slot);
        Ok(key)
    }

    /// Name of a string key, or description of a symbol key
    pub fn key_name(&self, key: KeyId) -> Option<&str> {
        let slot = self.keys.slot(key)?;
        match self.heap.get(slot.as_usize())?.value {
            Value::Key {
                name: Some(chunk), ..
            } => std::str::from_utf8(self.block.data(chunk)).ok(),
            _ => None,
        }
    }

    /// Is this key a symbol
    pub fn is_symbol(&self, key: KeyId) -> bool {
        self.keys
            .slot(key)
            .and_then(|slot| self.heap.get(slot.as_usize()))
            .is_some_and(|slot| matches!(slot.value, Value::Key { symbol: true, .. }))
    }

    /// Key table
    pub fn keys(&self) -> &KeyTable {
        &self.keys
    }

    /// Intern the fixed keys of a fresh machine
    pub(crate) fn intern_fixed_keys(&mut self) -> MachineResult<()> {
        for description in WELL_KNOWN_SYMBOLS {
            self.new_symbol(Some(description))?;
        }
        for name in KNOWN_NAMES {
            self.intern(name)?;
        }
        debug_assert_eq!(self.keys.len(), FIXED_KEY_COUNT);
        Ok(())
    }

    /// Do the fixed keys of this machine match this build
    pub(crate) fn check_fixed_keys(&self) -> Result<(), String> {
        for (index, expected) in WELL_KNOWN_SYMBOLS.iter().chain(KNOWN_NAMES).enumerate() {
            let key = KeyId(index as u32);
            let symbol = index < WELL_KNOWN_SYMBOLS.len();
            if self.key_name(key) != Some(*expected) || self.is_symbol(key) != symbol {
                return Err(format!("key {} is not {:?}", key, expected));
            }
        }
        Ok(())
    }

    fn find_in_chain(&self, mut link: Option<SlotRef>, name: &str, sum: u32) -> Option<KeyId> {
        while let Some(slot) = link {
            let entry = self.heap.get(slot.as_usize())?;
            if let Value::Key {
                name: Some(chunk),
                sum: entry_sum,
                ..
            } = entry.value
                && entry_sum == sum
                && self.block.data(chunk) == name.as_bytes()
            {
                return entry.id.map(KeyId);
            }
            link = entry.next;
        }
        None
    }
}
