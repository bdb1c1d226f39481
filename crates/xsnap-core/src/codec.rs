//! Slot records
//!
//! Fixed 32-byte encoding of a slot, used for heap and stack atoms and for
//! array items stored in chunks:
//!
//! ```text
//! next u32 | id i32 (-1 none) | kind u8 | reserved u8 | flag u16 | payload [u8; 20]
//! ```
//!
//! Integers are big-endian. Heap links are slot indexes and chunk links are
//! block offsets, 0 meaning none. Decoding is two-step: [`RawSlot::decode`]
//! checks the record shape, then [`RawSlot::relocate`] turns every raw link
//! into a live reference through a [`Relocation`].

use crate::block::ChunkRef;
use crate::callbacks::{CallbackTable, HostFunction};
use crate::error::CodecError;
use crate::slot::{
    ElementType, GeneratorState, KeyId, PromiseStatus, Slot, SlotFlags, SlotKind, SlotRef, Value,
};

/// Size of a slot record
pub const SLOT_SIZE: usize = 32;

/// Size of the payload area
pub const PAYLOAD_SIZE: usize = 20;

const NO_ID: i32 = -1;

/// Encode a slot. Transient flags are stripped and host data is dropped.
/// Callbacks need a table to be written; without one they are an error.
pub fn encode_slot(
    slot: &Slot,
    callbacks: Option<&CallbackTable>,
) -> Result<[u8; SLOT_SIZE], CodecError> {
    let mut out = [0u8; SLOT_SIZE];
    out[0..4].copy_from_slice(&link(slot.next).to_be_bytes());
    let id = slot.id.map_or(NO_ID, |id| id as i32);
    out[4..8].copy_from_slice(&id.to_be_bytes());
    out[8] = slot.kind() as u8;
    let flag = slot.flag.difference(SlotFlags::TRANSIENT);
    out[10..12].copy_from_slice(&flag.bits().to_be_bytes());

    let mut payload = Payload::default();
    match slot.value {
        Value::Undefined | Value::Null | Value::Host { .. } => {}
        Value::Boolean(b) => payload.u8(0, b as u8),
        Value::Integer(i) => payload.u32(0, i as u32),
        Value::Number(n) | Value::Date(n) => payload.f64(n),
        Value::String(chunk) => payload.u32(0, chunk.offset()),
        Value::Symbol(key) => payload.u32(0, key.0),
        Value::BigInt { digits, negative } => {
            payload.u32(0, digits.offset());
            payload.u8(4, negative as u8);
        }
        Value::Reference(r) | Value::Closure(r) => payload.u32(0, r.index()),
        Value::Instance { prototype } => payload.u32(0, link(prototype)),
        Value::Array { address, length } | Value::ArrayBuffer { address, length } => {
            payload.u32(0, chunk_link(address));
            payload.u32(4, length);
        }
        Value::Callback { function, closures } => {
            let (table, index) = callbacks
                .and_then(|table| table.position(function))
                .ok_or(CodecError::UnregisteredCallback)?;
            payload.u8(0, table);
            payload.u16(2, index);
            payload.u32(4, link(closures));
        }
        Value::Code { address, closures } => {
            payload.u32(0, address.offset());
            payload.u32(4, link(closures));
        }
        Value::DataView { offset, size } => {
            payload.u32(0, offset);
            payload.u32(4, size);
        }
        Value::Map { entries }
        | Value::Set { entries }
        | Value::WeakMap { entries }
        | Value::WeakSet { entries } => payload.u32(0, link(entries)),
        Value::Module {
            exports,
            environment,
        } => {
            payload.u32(0, link(exports));
            payload.u32(4, link(environment));
        }
        Value::Promise(status) => payload.u8(0, status as u8),
        Value::Proxy { handler, target } => {
            payload.u32(0, link(handler));
            payload.u32(4, link(target));
        }
        Value::RegExp { source, flags } => {
            payload.u32(0, source.offset());
            payload.u32(4, flags);
        }
        Value::TypedArray(element) => payload.u8(0, element as u8),
        Value::Accessor { getter, setter } => {
            payload.u32(0, link(getter));
            payload.u32(4, link(setter));
        }
        Value::Key { name, sum, symbol } => {
            payload.u32(0, chunk_link(name));
            payload.u32(4, sum);
            payload.u8(8, symbol as u8);
        }
        Value::List { first } | Value::Private { first } => payload.u32(0, link(first)),
        Value::Export { closure, module } => {
            payload.u32(0, link(closure));
            payload.u32(4, link(module));
        }
        Value::Generator(state) => payload.u8(0, state as u8),
    }
    out[12..].copy_from_slice(&payload.0);
    Ok(out)
}

/// A decoded record whose links are still raw integers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawSlot {
    /// Raw next link
    pub next: u32,
    /// Raw ID, -1 for none
    pub id: i32,
    /// Kind
    pub kind: SlotKind,
    /// Flags
    pub flag: SlotFlags,
    /// Raw payload
    pub payload: [u8; PAYLOAD_SIZE],
}

/// Turns raw links into live references
pub trait Relocation {
    /// Heap link, 0 for none
    fn slot(&mut self, link: u32) -> Result<Option<SlotRef>, CodecError>;
    /// Chunk offset, 0 for none
    fn chunk(&mut self, offset: u32) -> Result<Option<ChunkRef>, CodecError>;
    /// Key ID
    fn key(&mut self, id: u32) -> Result<KeyId, CodecError>;
    /// Callback position
    fn callback(&mut self, table: u8, index: u16) -> Result<HostFunction, CodecError>;
}

/// Relocation of records produced by this process (array items of a live
/// machine). Items never hold callbacks.
pub(crate) struct Trusted;

impl Relocation for Trusted {
    fn slot(&mut self, link: u32) -> Result<Option<SlotRef>, CodecError> {
        Ok(SlotRef::new(link))
    }

    fn chunk(&mut self, offset: u32) -> Result<Option<ChunkRef>, CodecError> {
        Ok(ChunkRef::new(offset))
    }

    fn key(&mut self, id: u32) -> Result<KeyId, CodecError> {
        Ok(KeyId(id))
    }

    fn callback(&mut self, table: u8, index: u16) -> Result<HostFunction, CodecError> {
        Err(CodecError::BadCallback { table, index })
    }
}

impl RawSlot {
    /// Check the shape of a record
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() != SLOT_SIZE {
            return Err(CodecError::BadLength(bytes.len()));
        }
        let kind = SlotKind::try_from(bytes[8]).map_err(CodecError::InvalidKind)?;
        let bits = u16::from_be_bytes([bytes[10], bytes[11]]);
        let flag = SlotFlags::from_bits(bits).ok_or(CodecError::InvalidFlags(bits))?;
        let mut payload = [0u8; PAYLOAD_SIZE];
        payload.copy_from_slice(&bytes[12..]);
        Ok(Self {
            next: be_u32(&bytes[0..4]),
            id: be_u32(&bytes[4..8]) as i32,
            kind,
            flag,
            payload,
        })
    }

    /// Raw payload word at `at`
    pub fn word(&self, at: usize) -> u32 {
        be_u32(&self.payload[at..at + 4])
    }

    /// Raw payload byte at `at`
    pub fn byte(&self, at: usize) -> u8 {
        self.payload[at]
    }

    /// Resolve every link of the record
    pub fn relocate(&self, relocation: &mut impl Relocation) -> Result<Slot, CodecError> {
        let r = relocation;
        let value = match self.kind {
            SlotKind::Undefined => Value::Undefined,
            SlotKind::Null => Value::Null,
            SlotKind::Boolean => Value::Boolean(self.byte(0) != 0),
            SlotKind::Integer => Value::Integer(self.word(0) as i32),
            SlotKind::Number => Value::Number(self.float()),
            SlotKind::Date => Value::Date(self.float()),
            SlotKind::String => Value::String(required(r, self.word(0))?),
            SlotKind::Symbol => Value::Symbol(r.key(self.word(0))?),
            SlotKind::BigInt => Value::BigInt {
                digits: required(r, self.word(0))?,
                negative: self.byte(4) != 0,
            },
            SlotKind::Reference => {
                Value::Reference(r.slot(self.word(0))?.ok_or(CodecError::BadSlotLink {
                    link: 0,
                    count: 0,
                })?)
            }
            SlotKind::Closure => {
                Value::Closure(r.slot(self.word(0))?.ok_or(CodecError::BadSlotLink {
                    link: 0,
                    count: 0,
                })?)
            }
            SlotKind::Instance => Value::Instance {
                prototype: r.slot(self.word(0))?,
            },
            SlotKind::Array => Value::Array {
                address: r.chunk(self.word(0))?,
                length: self.word(4),
            },
            SlotKind::ArrayBuffer => Value::ArrayBuffer {
                address: r.chunk(self.word(0))?,
                length: self.word(4),
            },
            SlotKind::Callback => Value::Callback {
                function: r.callback(self.byte(0), u16::from_be_bytes([self.byte(2), self.byte(3)]))?,
                closures: r.slot(self.word(4))?,
            },
            SlotKind::Code => Value::Code {
                address: required(r, self.word(0))?,
                closures: r.slot(self.word(4))?,
            },
            SlotKind::DataView => Value::DataView {
                offset: self.word(0),
                size: self.word(4),
            },
            SlotKind::Map => Value::Map {
                entries: r.slot(self.word(0))?,
            },
            SlotKind::Set => Value::Set {
                entries: r.slot(self.word(0))?,
            },
            SlotKind::WeakMap => Value::WeakMap {
                entries: r.slot(self.word(0))?,
            },
            SlotKind::WeakSet => Value::WeakSet {
                entries: r.slot(self.word(0))?,
            },
            SlotKind::Module => Value::Module {
                exports: r.slot(self.word(0))?,
                environment: r.slot(self.word(4))?,
            },
            SlotKind::Promise => Value::Promise(
                PromiseStatus::try_from(self.byte(0)).map_err(|value| CodecError::InvalidEnum {
                    what: "promise status",
                    value,
                })?,
            ),
            SlotKind::Proxy => Value::Proxy {
                handler: r.slot(self.word(0))?,
                target: r.slot(self.word(4))?,
            },
            SlotKind::RegExp => Value::RegExp {
                source: required(r, self.word(0))?,
                flags: self.word(4),
            },
            SlotKind::TypedArray => Value::TypedArray(
                ElementType::try_from(self.byte(0)).map_err(|value| CodecError::InvalidEnum {
                    what: "element type",
                    value,
                })?,
            ),
            SlotKind::Accessor => Value::Accessor {
                getter: r.slot(self.word(0))?,
                setter: r.slot(self.word(4))?,
            },
            SlotKind::Key => Value::Key {
                name: r.chunk(self.word(0))?,
                sum: self.word(4),
                symbol: self.byte(8) != 0,
            },
            SlotKind::List => Value::List {
                first: r.slot(self.word(0))?,
            },
            SlotKind::Private => Value::Private {
                first: r.slot(self.word(0))?,
            },
            SlotKind::Host => Value::Host { data: None },
            SlotKind::Export => Value::Export {
                closure: r.slot(self.word(0))?,
                module: r.slot(self.word(4))?,
            },
            SlotKind::Generator => Value::Generator(
                GeneratorState::try_from(self.byte(0)).map_err(|value| {
                    CodecError::InvalidEnum {
                        what: "generator state",
                        value,
                    }
                })?,
            ),
        };
        Ok(Slot {
            next: r.slot(self.next)?,
            id: (self.id >= 0).then_some(self.id as u32),
            flag: self.flag,
            value,
        })
    }

    fn float(&self) -> f64 {
        let mut bits = [0u8; 8];
        bits.copy_from_slice(&self.payload[0..8]);
        f64::from_be_bytes(bits)
    }
}

/// Decode a record produced by [`encode_slot`] in this process
pub(crate) fn decode_trusted(bytes: &[u8]) -> Result<Slot, CodecError> {
    RawSlot::decode(bytes)?.relocate(&mut Trusted)
}

#[derive(Default)]
struct Payload([u8; PAYLOAD_SIZE]);

impl Payload {
    fn u8(&mut self, at: usize, value: u8) {
        self.0[at] = value;
    }

    fn u16(&mut self, at: usize, value: u16) {
        self.0[at..at + 2].copy_from_slice(&value.to_be_bytes());
    }

    fn u32(&mut self, at: usize, value: u32) {
        self.0[at..at + 4].copy_from_slice(&value.to_be_bytes());
    }

    fn f64(&mut self, value: f64) {
        self.0[0..8].copy_from_slice(&value.to_be_bytes());
    }
}

fn required(r: &mut impl Relocation, offset: u32) -> Result<ChunkRef, CodecError> {
    r.chunk(offset)?.ok_or(CodecError::BadChunk(offset))
}

fn link(slot: Option<SlotRef>) -> u32 {
    slot.map_or(0, SlotRef::index)
}

fn chunk_link(chunk: Option<ChunkRef>) -> u32 {
    chunk.map_or(0, ChunkRef::offset)
}

fn be_u32(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(bytes);
    u32::from_be_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_flags_are_stripped() {
        let mut slot = Slot::new(Value::Integer(-5));
        slot.flag = SlotFlags::MARK | SlotFlags::LEVEL | SlotFlags::DONT_SET;
        let bytes = encode_slot(&slot, None).unwrap();
        let decoded = decode_trusted(&bytes).unwrap();
        assert_eq!(decoded.flag, SlotFlags::DONT_SET);
        assert_eq!(decoded.value, Value::Integer(-5));
        assert_eq!(decoded.id, None);
    }

    #[test]
    fn test_record_layout() {
        let slot = Slot {
            next: SlotRef::new(0x0102_0304),
            id: Some(9),
            flag: SlotFlags::DONT_ENUM,
            value: Value::Reference(SlotRef::new(42).unwrap()),
        };
        let bytes = encode_slot(&slot, None).unwrap();
        assert_eq!(&bytes[0..4], &[1, 2, 3, 4]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 9]);
        assert_eq!(bytes[8], SlotKind::Reference as u8);
        assert_eq!(&bytes[10..12], &SlotFlags::DONT_ENUM.bits().to_be_bytes());
        assert_eq!(&bytes[12..16], &[0, 0, 0, 42]);
    }

    #[test]
    fn test_unregistered_callback_is_an_error() {
        fn native(
            _machine: &mut crate::machine::Machine,
            _frame: &crate::callbacks::CallFrame<'_>,
        ) -> crate::error::MachineResult<Value> {
            Ok(Value::Undefined)
        }
        let slot = Slot::internal(Value::Callback {
            function: HostFunction(native),
            closures: None,
        });
        assert_eq!(
            encode_slot(&slot, Some(&CallbackTable::builtins_only())),
            Err(CodecError::UnregisteredCallback)
        );
        let table = CallbackTable::new(&[native]);
        let bytes = encode_slot(&slot, Some(&table)).unwrap();
        assert_eq!(bytes[12], crate::callbacks::HOST_TABLE);
    }

    #[test]
    fn test_decode_rejects_bad_records() {
        let mut bytes = encode_slot(&Slot::new(Value::Null), None).unwrap();
        assert_eq!(RawSlot::decode(&bytes[..31]), Err(CodecError::BadLength(31)));
        bytes[8] = 99;
        assert_eq!(RawSlot::decode(&bytes), Err(CodecError::InvalidKind(99)));
        bytes[8] = SlotKind::Null as u8;
        bytes[10] = 0xff;
        assert!(matches!(RawSlot::decode(&bytes), Err(CodecError::InvalidFlags(_))));
    }

    #[test]
    fn test_reference_to_sentinel_is_rejected() {
        let mut bytes = encode_slot(&Slot::new(Value::Reference(SlotRef::new(3).unwrap())), None)
            .unwrap();
        bytes[12..16].copy_from_slice(&[0, 0, 0, 0]);
        assert!(decode_trusted(&bytes).is_err());
    }

    #[test]
    fn test_host_data_is_not_persisted() {
        let slot = Slot::internal(Value::Host {
            data: Some(crate::slot::HostHandle(3)),
        });
        let decoded = decode_trusted(&encode_slot(&slot, None).unwrap()).unwrap();
        assert_eq!(decoded.value, Value::Host { data: None });
        assert!(decoded.is_internal());
    }
}
