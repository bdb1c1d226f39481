//! Snapshot writer

use std::io::{BufWriter, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use xsnap_core::Machine;
use xsnap_core::Slot;
use xsnap_core::codec::{SLOT_SIZE, encode_slot};

use crate::atom::{self, write_atom};
use crate::error::{Result, SnapshotError};
use crate::{SnapshotOptions, VERSION};

/// Write `machine` to `sink`. Returns the number of bytes written.
pub fn write_snapshot(
    machine: &Machine,
    sink: &mut impl Write,
    options: &SnapshotOptions,
) -> Result<u64> {
    let mut written = 0;
    written += write_atom(sink, atom::SIGN, &options.signature)?;
    written += write_atom(sink, atom::VERS, &VERSION)?;
    written += write_atom(
        sink,
        atom::CREA,
        &atom::to_bytes(&machine.creation().to_fields()),
    )?;
    written += write_atom(sink, atom::BLOC, machine.block().as_bytes())?;
    written += write_atom(sink, atom::HEAP, &encode_slots(machine.heap(), options)?)?;
    written += write_atom(sink, atom::STAC, &encode_slots(machine.stack(), options)?)?;

    let keys = machine.keys();
    let mut table = Vec::with_capacity(keys.len() + 2);
    table.push(keys.len() as u32);
    table.push(machine.alias_count());
    table.extend(keys.key_slots().iter().map(|slot| slot.index()));
    written += write_atom(sink, atom::KEYS, &atom::to_bytes(&table))?;
    written += write_atom(sink, atom::NAME, &bucket_bytes(keys.name_buckets()))?;
    written += write_atom(sink, atom::SYMB, &bucket_bytes(keys.symbol_buckets()))?;
    sink.flush()?;

    tracing::info!(
        bytes = written,
        heap = machine.heap().len(),
        stack = machine.stack().len(),
        block = machine.block().len(),
        keys = keys.len(),
        "snapshot written"
    );
    Ok(written)
}

/// Write `machine` to a file. The snapshot goes to a temporary file in the
/// same directory, renamed over `path` once complete, so a failed write
/// leaves any previous file at `path` untouched.
pub fn write_snapshot_file(
    machine: &Machine,
    path: impl AsRef<Path>,
    options: &SnapshotOptions,
) -> Result<u64> {
    let path = path.as_ref();
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file = NamedTempFile::new_in(parent)?;
    let mut sink = BufWriter::new(file);
    let written = write_snapshot(machine, &mut sink, options)?;
    let file = sink
        .into_inner()
        .map_err(|e| SnapshotError::Io(e.into_error()))?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| SnapshotError::Io(e.error))?;
    Ok(written)
}

fn encode_slots(slots: &[Slot], options: &SnapshotOptions) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(slots.len() * SLOT_SIZE);
    for (index, slot) in slots.iter().enumerate() {
        let record = encode_slot(slot, Some(&options.callbacks))
            .map_err(|source| SnapshotError::Slot { index, source })?;
        out.extend_from_slice(&record);
    }
    Ok(out)
}

fn bucket_bytes(buckets: &[Option<xsnap_core::SlotRef>]) -> Vec<u8> {
    let heads: Vec<u32> = buckets
        .iter()
        .map(|head| head.map_or(0, |slot| slot.index()))
        .collect();
    atom::to_bytes(&heads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::AtomReader;
    use xsnap_core::Creation;

    #[test]
    fn test_atoms_in_order() {
        let machine = Machine::new(Creation::small()).unwrap();
        let mut bytes = Vec::new();
        let written = write_snapshot(&machine, &mut bytes, &SnapshotOptions::default()).unwrap();
        assert_eq!(written, bytes.len() as u64);

        let mut reader = AtomReader::new(bytes.as_slice());
        let mut kinds = Vec::new();
        while let Some((kind, payload)) = reader.next_atom().unwrap() {
            if kind == atom::HEAP {
                assert_eq!(payload.len(), machine.heap().len() * SLOT_SIZE);
            }
            kinds.push(kind);
        }
        assert_eq!(
            kinds,
            vec![
                atom::SIGN,
                atom::VERS,
                atom::CREA,
                atom::BLOC,
                atom::HEAP,
                atom::STAC,
                atom::KEYS,
                atom::NAME,
                atom::SYMB
            ]
        );
    }

    #[test]
    fn test_unregistered_host_callback_fails() {
        fn host(
            _machine: &mut Machine,
            _frame: &xsnap_core::CallFrame<'_>,
        ) -> xsnap_core::MachineResult<xsnap_core::Value> {
            Ok(xsnap_core::Value::Undefined)
        }
        let mut machine = Machine::new(Creation::small()).unwrap();
        machine.new_function(host, "host", 0).unwrap();
        let mut bytes = Vec::new();
        let err = write_snapshot(&machine, &mut bytes, &SnapshotOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::Slot {
                source: xsnap_core::CodecError::UnregisteredCallback,
                ..
            }
        ));
    }
}
