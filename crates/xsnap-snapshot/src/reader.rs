//! Snapshot reader
//!
//! Atoms are read verbatim into scratch buffers first. The fixup pass then
//! turns every raw link into a live reference, checking it against the heap
//! size, the chunk chain of the block, the key count and the host's callback
//! table. A snapshot that fails any check yields no machine.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use rustc_hash::FxHashSet;
use xsnap_core::codec::{RawSlot, Relocation, SLOT_SIZE};
use xsnap_core::{
    Block, CallbackTable, ChunkRef, CodecError, Creation, HostFunction, KeyId, KeyTable, Machine,
    MachineError, MachineParts, Slot, SlotKind, SlotRef, Value,
};

use crate::atom::{self, AtomReader};
use crate::error::{Result, SnapshotError};
use crate::{SnapshotOptions, VERSION};

/// Relocation of records read from a snapshot
struct Checked<'a> {
    heap_count: u32,
    chunks: &'a FxHashSet<u32>,
    key_count: u32,
    callbacks: &'a CallbackTable,
}

impl Relocation for Checked<'_> {
    fn slot(&mut self, link: u32) -> std::result::Result<Option<SlotRef>, CodecError> {
        if link >= self.heap_count {
            return Err(CodecError::BadSlotLink {
                link,
                count: self.heap_count,
            });
        }
        Ok(SlotRef::new(link))
    }

    fn chunk(&mut self, offset: u32) -> std::result::Result<Option<ChunkRef>, CodecError> {
        if offset == 0 {
            return Ok(None);
        }
        if !self.chunks.contains(&offset) {
            return Err(CodecError::BadChunk(offset));
        }
        Ok(ChunkRef::new(offset))
    }

    fn key(&mut self, id: u32) -> std::result::Result<KeyId, CodecError> {
        if id >= self.key_count {
            return Err(CodecError::BadKey(id));
        }
        Ok(KeyId(id))
    }

    fn callback(&mut self, table: u8, index: u16) -> std::result::Result<HostFunction, CodecError> {
        self.callbacks
            .resolve(table, index)
            .ok_or(CodecError::BadCallback { table, index })
    }
}

/// Read a machine from `source`
pub fn read_snapshot(source: &mut impl Read, options: &SnapshotOptions) -> Result<Machine> {
    let mut atoms = AtomReader::new(source);

    let signature = atoms.read_atom(atom::SIGN)?;
    if signature != options.signature {
        return Err(SnapshotError::BadSignature(
            String::from_utf8_lossy(&signature).into_owned(),
        ));
    }
    let version = atoms.read_atom(atom::VERS)?;
    if version.len() != VERSION.len() {
        return Err(bad_size(atom::VERS, version.len()));
    }
    if version[0] != VERSION[0] || version[1] > VERSION[1] {
        return Err(SnapshotError::UnsupportedVersion(
            version[0], version[1], version[2],
        ));
    }

    let fields = atom::words(atom::CREA, &atoms.read_atom(atom::CREA)?)?;
    let fields: [u32; Creation::FIELD_COUNT] = fields
        .try_into()
        .map_err(|fields: Vec<u32>| bad_size(atom::CREA, fields.len() * 4))?;
    let creation = Creation::from_fields(fields);
    creation
        .validate()
        .map_err(|reason| SnapshotError::Machine(MachineError::range_error(reason)))?;

    let block = Block::from_bytes(
        atoms.read_atom(atom::BLOC)?,
        creation.incremental_chunk_size as usize,
    );
    let heap = raw_slots(atom::HEAP, &atoms.read_atom(atom::HEAP)?)?;
    let stack = raw_slots(atom::STAC, &atoms.read_atom(atom::STAC)?)?;
    let table = atom::words(atom::KEYS, &atoms.read_atom(atom::KEYS)?)?;
    let names = atom::words(atom::NAME, &atoms.read_atom(atom::NAME)?)?;
    let symbols = atom::words(atom::SYMB, &atoms.read_atom(atom::SYMB)?)?;
    let size = atoms.offset();
    atoms.finish()?;

    if heap.is_empty() {
        return Err(SnapshotError::InvalidTable("heap has no sentinel".to_string()));
    }
    if stack.len() > creation.stack_count as usize {
        return Err(SnapshotError::InvalidTable(format!(
            "stack holds {} slots, capacity is {}",
            stack.len(),
            creation.stack_count
        )));
    }
    let [key_count, alias_count, key_indexes @ ..] = table.as_slice() else {
        return Err(bad_size(atom::KEYS, table.len() * 4));
    };
    if key_indexes.len() != *key_count as usize {
        return Err(bad_size(atom::KEYS, table.len() * 4));
    }
    if names.len() != creation.name_modulo as usize {
        return Err(bad_size(atom::NAME, names.len() * 4));
    }
    if symbols.len() != creation.symbol_modulo as usize {
        return Err(bad_size(atom::SYMB, symbols.len() * 4));
    }

    let chunks = chunk_offsets(&block)?;
    let mut relocation = Checked {
        heap_count: heap.len() as u32,
        chunks: &chunks,
        key_count: *key_count,
        callbacks: &options.callbacks,
    };
    let heap = relocate(&heap, &mut relocation)?;
    let stack = relocate(&stack, &mut relocation)?;
    check_array_items(&block, &heap, &mut relocation)?;
    check_acyclic(&heap, "slot chain", |slot| slot.next)?;
    check_acyclic(&heap, "prototype chain", |slot| match slot.value {
        Value::Instance { prototype } => prototype,
        _ => None,
    })?;

    let keys = KeyTable::from_parts(
        key_indexes
            .iter()
            .map(|&index| key_slot(&heap, index)?.ok_or_else(|| bad_entry("key", index)))
            .collect::<Result<_>>()?,
        buckets(&heap, &names)?,
        buckets(&heap, &symbols)?,
    );

    let machine = Machine::from_parts(MachineParts {
        creation,
        block,
        heap,
        stack,
        keys,
        alias_count: *alias_count,
    })?;
    tracing::info!(
        bytes = size,
        heap = machine.heap().len(),
        stack = machine.stack().len(),
        keys = machine.keys().len(),
        "snapshot read"
    );
    Ok(machine)
}

/// Read a machine from a file
pub fn read_snapshot_file(path: impl AsRef<Path>, options: &SnapshotOptions) -> Result<Machine> {
    let mut source = BufReader::new(File::open(path)?);
    read_snapshot(&mut source, options)
}

fn bad_size(kind: atom::AtomType, length: usize) -> SnapshotError {
    SnapshotError::BadAtomSize {
        atom: atom::type_name(kind),
        size: (length + atom::HEADER_SIZE) as u32,
    }
}

fn bad_entry(table: &str, index: u32) -> SnapshotError {
    SnapshotError::InvalidTable(format!("{} entry #{} is not a key slot", table, index))
}

/// Split a slot atom into records and check their shape
pub(crate) fn raw_slots(kind: atom::AtomType, payload: &[u8]) -> Result<Vec<RawSlot>> {
    if payload.len() % SLOT_SIZE != 0 {
        return Err(bad_size(kind, payload.len()));
    }
    payload
        .chunks_exact(SLOT_SIZE)
        .enumerate()
        .map(|(index, record)| {
            RawSlot::decode(record).map_err(|source| SnapshotError::Slot { index, source })
        })
        .collect()
}

/// Data offsets of every chunk, failing on a broken chain
fn chunk_offsets(block: &Block) -> Result<FxHashSet<u32>> {
    block
        .chunks()
        .map(|chunk| {
            chunk.map(ChunkRef::offset).map_err(|at| {
                SnapshotError::InvalidTable(format!("chunk chain broken at offset {}", at))
            })
        })
        .collect()
}

fn relocate(raw: &[RawSlot], relocation: &mut Checked<'_>) -> Result<Vec<Slot>> {
    raw.iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.relocate(relocation)
                .map_err(|source| SnapshotError::Slot { index, source })
        })
        .collect()
}

/// Array stores hold slot records too; each one must decode and relocate
fn check_array_items(block: &Block, heap: &[Slot], relocation: &mut Checked<'_>) -> Result<()> {
    for (index, slot) in heap.iter().enumerate() {
        let Value::Array { address, length } = slot.value else {
            continue;
        };
        let Some(address) = address else {
            if length != 0 {
                return Err(SnapshotError::InvalidTable(format!(
                    "array #{} has {} items and no store",
                    index, length
                )));
            }
            continue;
        };
        let data = block.data(address);
        if data.len() != length as usize * SLOT_SIZE {
            return Err(SnapshotError::InvalidTable(format!(
                "array #{} store holds {} bytes for {} items",
                index,
                data.len(),
                length
            )));
        }
        for record in data.chunks_exact(SLOT_SIZE) {
            RawSlot::decode(record)
                .and_then(|item| item.relocate(relocation))
                .map_err(|source| SnapshotError::Slot { index, source })?;
        }
    }
    Ok(())
}

/// Every slot has at most one `link`, so following links from any slot must
/// reach the end of a chain. Environments chain through their prototype.
fn check_acyclic(
    heap: &[Slot],
    what: &str,
    link: impl Fn(&Slot) -> Option<SlotRef>,
) -> Result<()> {
    const UNSEEN: u8 = 0;
    const WALKING: u8 = 1;
    const DONE: u8 = 2;

    let mut state = vec![UNSEEN; heap.len()];
    let mut walk = Vec::new();
    for start in 0..heap.len() {
        let mut at = Some(start);
        while let Some(index) = at {
            match state[index] {
                UNSEEN => {
                    state[index] = WALKING;
                    walk.push(index);
                    at = link(&heap[index]).map(SlotRef::as_usize);
                }
                WALKING => {
                    return Err(SnapshotError::InvalidTable(format!(
                        "{} through #{} is cyclic",
                        what, index
                    )));
                }
                _ => break,
            }
        }
        for index in walk.drain(..) {
            state[index] = DONE;
        }
    }
    Ok(())
}

fn key_slot(heap: &[Slot], index: u32) -> Result<Option<SlotRef>> {
    let Some(slot) = SlotRef::new(index) else {
        return Ok(None);
    };
    match heap.get(slot.as_usize()) {
        Some(key) if key.kind() == SlotKind::Key => Ok(Some(slot)),
        _ => Err(bad_entry("table", index)),
    }
}

fn buckets(heap: &[Slot], heads: &[u32]) -> Result<Vec<Option<SlotRef>>> {
    heads.iter().map(|&head| key_slot(heap, head)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::write_snapshot;

    fn snapshot(machine: &Machine) -> Vec<u8> {
        let mut bytes = Vec::new();
        write_snapshot(machine, &mut bytes, &SnapshotOptions::default()).unwrap();
        bytes
    }

    #[test]
    fn test_fresh_machine_round_trips() {
        let machine = Machine::new(Creation::small()).unwrap();
        let bytes = snapshot(&machine);
        let read = read_snapshot(&mut bytes.as_slice(), &SnapshotOptions::default()).unwrap();
        assert_eq!(read.heap(), machine.heap());
        assert_eq!(read.stack(), machine.stack());
        assert_eq!(read.block(), machine.block());
        assert_eq!(read.keys(), machine.keys());
        assert_eq!(read.creation(), machine.creation());
    }

    #[test]
    fn test_signature_mismatch() {
        let machine = Machine::new(Creation::small()).unwrap();
        let bytes = snapshot(&machine);
        let options = SnapshotOptions::default().with_signature("xsnap 2");
        assert!(matches!(
            read_snapshot(&mut bytes.as_slice(), &options),
            Err(SnapshotError::BadSignature(signature)) if signature == "xsnap 1"
        ));
    }

    #[test]
    fn test_newer_major_version_is_rejected() {
        let machine = Machine::new(Creation::small()).unwrap();
        let mut bytes = snapshot(&machine);
        // SIGN atom is 15 bytes, VERS payload starts 8 bytes later
        bytes[15 + 8] = 2;
        assert!(matches!(
            read_snapshot(&mut bytes.as_slice(), &SnapshotOptions::default()),
            Err(SnapshotError::UnsupportedVersion(2, 0, 0))
        ));
    }

    #[test]
    fn test_out_of_range_link_is_rejected() {
        let machine = Machine::new(Creation::small()).unwrap();
        let bytes = snapshot(&machine);
        let mut atoms = AtomReader::new(bytes.as_slice());
        let mut rebuilt = Vec::new();
        while let Some((kind, mut payload)) = atoms.next_atom().unwrap() {
            if kind == atom::STAC {
                // global root: a reference, payload word 0 is the heap link
                payload[12..16].copy_from_slice(&u32::MAX.to_be_bytes());
            }
            atom::write_atom(&mut rebuilt, kind, &payload).unwrap();
        }
        assert!(matches!(
            read_snapshot(&mut rebuilt.as_slice(), &SnapshotOptions::default()),
            Err(SnapshotError::Slot {
                index: 0,
                source: CodecError::BadSlotLink { .. }
            })
        ));
    }

    #[test]
    fn test_bucket_must_hold_a_key() {
        let machine = Machine::new(Creation::small()).unwrap();
        let bytes = snapshot(&machine);
        let global = machine.global().unwrap().index();
        let mut atoms = AtomReader::new(bytes.as_slice());
        let mut rebuilt = Vec::new();
        while let Some((kind, mut payload)) = atoms.next_atom().unwrap() {
            if kind == atom::NAME {
                payload[0..4].copy_from_slice(&global.to_be_bytes());
            }
            atom::write_atom(&mut rebuilt, kind, &payload).unwrap();
        }
        assert!(matches!(
            read_snapshot(&mut rebuilt.as_slice(), &SnapshotOptions::default()),
            Err(SnapshotError::InvalidTable(_))
        ));
    }
}
