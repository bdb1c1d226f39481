//! Snapshot dumper
//!
//! Prints every atom of a snapshot without building a machine. Output is
//! written as decoding goes, so a corrupt snapshot still shows everything up
//! to the first error, followed by an `error:` line.

use std::io::{Read, Write};

use rustc_hash::FxHashSet;
use xsnap_core::codec::RawSlot;
use xsnap_core::{Block, ChunkRef, Creation, SlotKind};

use crate::atom::{self, AtomReader};
use crate::error::{Result, SnapshotError};
use crate::reader::raw_slots;

const CREATION_FIELDS: [&str; Creation::FIELD_COUNT] = [
    "initial chunk size",
    "incremental chunk size",
    "initial heap count",
    "incremental heap count",
    "stack count",
    "initial key count",
    "incremental key count",
    "name modulo",
    "symbol modulo",
    "parser buffer size",
    "parser table modulo",
];

#[derive(Default)]
struct Dumper {
    block: Block,
    chunks: FxHashSet<u32>,
    heap: Vec<RawSlot>,
}

/// Print `source` to `sink`, stopping at the first corruption
pub fn dump_snapshot(source: &mut impl Read, sink: &mut impl Write) -> Result<()> {
    let mut atoms = AtomReader::new(source);
    let mut dumper = Dumper::default();
    let result = dumper.dump(&mut atoms, sink).and_then(|()| atoms.finish());
    if let Err(e) = &result {
        writeln!(sink, "error: {}", e)?;
    }
    sink.flush()?;
    result
}

impl Dumper {
    fn dump<R: Read>(&mut self, atoms: &mut AtomReader<R>, out: &mut impl Write) -> Result<()> {
        let signature = atoms.read_atom(atom::SIGN)?;
        writeln!(out, "SIGN {:?}", String::from_utf8_lossy(&signature))?;

        let version = atoms.read_atom(atom::VERS)?;
        match version.as_slice() {
            [major, minor, patch, _] => writeln!(out, "VERS {}.{}.{}", major, minor, patch)?,
            _ => {
                return Err(SnapshotError::BadAtomSize {
                    atom: "VERS".to_string(),
                    size: (version.len() + atom::HEADER_SIZE) as u32,
                });
            }
        }

        let fields = atom::words(atom::CREA, &atoms.read_atom(atom::CREA)?)?;
        writeln!(out, "CREA")?;
        for (name, value) in CREATION_FIELDS.iter().zip(&fields) {
            writeln!(out, "  {}: {}", name, value)?;
        }
        if fields.len() != Creation::FIELD_COUNT {
            return Err(SnapshotError::BadAtomSize {
                atom: "CREA".to_string(),
                size: (fields.len() * 4 + atom::HEADER_SIZE) as u32,
            });
        }

        self.block = Block::from_bytes(atoms.read_atom(atom::BLOC)?, 0);
        writeln!(out, "BLOC {} bytes", self.block.len())?;
        for chunk in self.block.chunks() {
            let chunk = chunk.map_err(|at| {
                SnapshotError::InvalidTable(format!("chunk chain broken at offset {}", at))
            })?;
            self.chunks.insert(chunk.offset());
            writeln!(out, "  @{} {} bytes", chunk.offset(), self.block.size(chunk))?;
        }

        self.heap = self.slots(atoms, atom::HEAP, out)?;
        self.slots(atoms, atom::STAC, out)?;

        let table = atom::words(atom::KEYS, &atoms.read_atom(atom::KEYS)?)?;
        let [key_count, alias_count, keys @ ..] = table.as_slice() else {
            return Err(SnapshotError::Truncated("KEYS".to_string()));
        };
        writeln!(out, "KEYS {} keys, {} aliases", key_count, alias_count)?;
        for (id, &index) in keys.iter().enumerate() {
            writeln!(out, "  {} #{} {}", id, index, self.key_text(index))?;
        }
        if keys.len() != *key_count as usize {
            return Err(SnapshotError::InvalidTable(format!(
                "{} key entries for {} keys",
                keys.len(),
                key_count
            )));
        }

        for kind in [atom::NAME, atom::SYMB] {
            let heads = atom::words(kind, &atoms.read_atom(kind)?)?;
            writeln!(out, "{} {} buckets", atom::type_name(kind), heads.len())?;
            for (bucket, &head) in heads.iter().enumerate().filter(|(_, head)| **head != 0) {
                writeln!(out, "  [{}] #{} {}", bucket, head, self.key_text(head))?;
            }
        }
        Ok(())
    }

    fn slots<R: Read>(
        &self,
        atoms: &mut AtomReader<R>,
        kind: atom::AtomType,
        out: &mut impl Write,
    ) -> Result<Vec<RawSlot>> {
        let payload = atoms.read_atom(kind)?;
        writeln!(out, "{} {} bytes", atom::type_name(kind), payload.len())?;
        let slots = raw_slots(kind, &payload)?;
        for (index, slot) in slots.iter().enumerate() {
            writeln!(out, "  #{} {}", index, describe(slot))?;
        }
        Ok(slots)
    }

    fn key_text(&self, index: u32) -> String {
        let Some(slot) = self.heap.get(index as usize) else {
            return "(out of range)".to_string();
        };
        if slot.kind != SlotKind::Key {
            return format!("(not a key: {})", slot.kind.name());
        }
        let prefix = if slot.byte(8) != 0 { "symbol " } else { "" };
        let offset = slot.word(0);
        match ChunkRef::new(offset).filter(|_| self.chunks.contains(&offset)) {
            Some(chunk) => format!(
                "{}{:?}",
                prefix,
                String::from_utf8_lossy(self.block.data(chunk))
            ),
            None if offset == 0 => format!("{}(anonymous)", prefix),
            None => format!("{}(bad chunk @{})", prefix, offset),
        }
    }
}

fn describe(slot: &RawSlot) -> String {
    let flags: Vec<&str> = slot.flag.iter_names().map(|(name, _)| name).collect();
    let id = if slot.id < 0 {
        "-".to_string()
    } else {
        slot.id.to_string()
    };
    let payload: Vec<String> = (0..5).map(|at| format!("{:08x}", slot.word(at * 4))).collect();
    format!(
        "{} next={} id={} flag={} {}",
        slot.kind.name(),
        slot.next,
        id,
        if flags.is_empty() {
            "-".to_string()
        } else {
            flags.join("|")
        },
        payload.join(" ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SnapshotOptions;
    use crate::writer::write_snapshot;
    use xsnap_core::Machine;

    fn snapshot() -> Vec<u8> {
        let mut machine = Machine::new(Creation::small()).unwrap();
        machine.intern("hello").unwrap();
        let mut bytes = Vec::new();
        write_snapshot(&machine, &mut bytes, &SnapshotOptions::default()).unwrap();
        bytes
    }

    #[test]
    fn test_dump_lists_every_atom() {
        let bytes = snapshot();
        let mut out = Vec::new();
        dump_snapshot(&mut bytes.as_slice(), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("SIGN \"xsnap 1\"\nVERS 1.0.0\nCREA\n"));
        assert!(text.contains("  name modulo: 127\n"));
        for atom in ["BLOC ", "HEAP ", "STAC ", "KEYS ", "NAME ", "SYMB "] {
            assert!(text.contains(atom), "missing {}", atom);
        }
        assert!(text.contains("\"hello\""));
        assert!(text.contains("  #0 undefined next=0 id=- flag=- "));
    }

    #[test]
    fn test_dump_stops_at_corruption() {
        let mut bytes = snapshot();
        bytes.truncate(bytes.len() - 3);
        let mut out = Vec::new();
        let err = dump_snapshot(&mut bytes.as_slice(), &mut out).unwrap_err();
        assert!(matches!(err, SnapshotError::Truncated(_)));
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("KEYS "));
        assert!(text.lines().last().unwrap().starts_with("error: "));
    }
}
