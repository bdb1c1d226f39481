//! Atom framing
//!
//! A snapshot is a sequence of atoms: a big-endian u32 size that includes
//! the 8-byte header, a 4-byte type, then `size - 8` payload bytes.

use std::io::{ErrorKind, Read, Write};

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use crate::error::{Result, SnapshotError};

/// Size of an atom header
pub const HEADER_SIZE: usize = 8;

/// Atom type tag
pub type AtomType = [u8; 4];

/// Signature
pub const SIGN: AtomType = *b"SIGN";
/// Format version
pub const VERS: AtomType = *b"VERS";
/// Creation parameters
pub const CREA: AtomType = *b"CREA";
/// Chunk block
pub const BLOC: AtomType = *b"BLOC";
/// Heap slots
pub const HEAP: AtomType = *b"HEAP";
/// Stack slots
pub const STAC: AtomType = *b"STAC";
/// Key table
pub const KEYS: AtomType = *b"KEYS";
/// Name buckets
pub const NAME: AtomType = *b"NAME";
/// Symbol buckets
pub const SYMB: AtomType = *b"SYMB";

/// Printable atom type
pub fn type_name(kind: AtomType) -> String {
    String::from_utf8_lossy(&kind).into_owned()
}

/// Write one atom, returning the bytes written
pub fn write_atom(sink: &mut impl Write, kind: AtomType, payload: &[u8]) -> Result<u64> {
    let size = u32::try_from(HEADER_SIZE + payload.len()).map_err(|_| {
        SnapshotError::BadAtomSize {
            atom: type_name(kind),
            size: u32::MAX,
        }
    })?;
    sink.write_u32::<BigEndian>(size)?;
    sink.write_all(&kind)?;
    sink.write_all(payload)?;
    Ok(size as u64)
}

/// Payload as big-endian words
pub fn words(kind: AtomType, payload: &[u8]) -> Result<Vec<u32>> {
    if payload.len() % 4 != 0 {
        return Err(SnapshotError::BadAtomSize {
            atom: type_name(kind),
            size: (payload.len() + HEADER_SIZE) as u32,
        });
    }
    let mut out = vec![0u32; payload.len() / 4];
    BigEndian::read_u32_into(payload, &mut out);
    Ok(out)
}

/// Payload of big-endian words
pub fn to_bytes(words: &[u32]) -> Vec<u8> {
    let mut out = vec![0u8; words.len() * 4];
    BigEndian::write_u32_into(words, &mut out);
    out
}

/// Sequential atom reader
pub struct AtomReader<R> {
    source: R,
    offset: u64,
}

impl<R: Read> AtomReader<R> {
    /// Wrap a source
    pub fn new(source: R) -> Self {
        Self { source, offset: 0 }
    }

    /// Bytes consumed so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Next atom, `None` at a clean end of the source
    pub fn next_atom(&mut self) -> Result<Option<(AtomType, Vec<u8>)>> {
        let mut header = [0u8; HEADER_SIZE];
        let mut filled = 0;
        while filled < HEADER_SIZE {
            match self.source.read(&mut header[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        if filled < HEADER_SIZE {
            return Err(SnapshotError::Truncated("header".to_string()));
        }
        let size = BigEndian::read_u32(&header[0..4]);
        let mut kind = [0u8; 4];
        kind.copy_from_slice(&header[4..8]);
        if (size as usize) < HEADER_SIZE {
            return Err(SnapshotError::BadAtomSize {
                atom: type_name(kind),
                size,
            });
        }
        let length = size as usize - HEADER_SIZE;
        let mut payload = Vec::new();
        (&mut self.source)
            .take(length as u64)
            .read_to_end(&mut payload)?;
        if payload.len() != length {
            return Err(SnapshotError::Truncated(type_name(kind)));
        }
        self.offset += size as u64;
        Ok(Some((kind, payload)))
    }

    /// Next atom, which must be of type `expected`
    pub fn read_atom(&mut self, expected: AtomType) -> Result<Vec<u8>> {
        match self.next_atom()? {
            Some((kind, payload)) if kind == expected => Ok(payload),
            Some((kind, _)) => Err(SnapshotError::UnexpectedAtom {
                expected: type_name(expected),
                found: type_name(kind),
            }),
            None => Err(SnapshotError::Truncated(type_name(expected))),
        }
    }

    /// Fail unless the source is exhausted
    pub fn finish(mut self) -> Result<()> {
        let mut byte = [0u8; 1];
        loop {
            match self.source.read(&mut byte) {
                Ok(0) => return Ok(()),
                Ok(_) => return Err(SnapshotError::Trailing),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atom_framing() {
        let mut bytes = Vec::new();
        assert_eq!(write_atom(&mut bytes, SIGN, b"xsnap 1").unwrap(), 15);
        assert_eq!(&bytes[0..8], b"\x00\x00\x00\x0fSIGN");
        let mut reader = AtomReader::new(bytes.as_slice());
        assert_eq!(reader.read_atom(SIGN).unwrap(), b"xsnap 1");
        assert_eq!(reader.offset(), 15);
        reader.finish().unwrap();
    }

    #[test]
    fn test_short_payload_is_truncated() {
        let mut bytes = Vec::new();
        write_atom(&mut bytes, HEAP, &[0; 32]).unwrap();
        bytes.truncate(20);
        let mut reader = AtomReader::new(bytes.as_slice());
        assert!(matches!(
            reader.read_atom(HEAP),
            Err(SnapshotError::Truncated(atom)) if atom == "HEAP"
        ));
    }

    #[test]
    fn test_size_below_header() {
        let bytes = b"\x00\x00\x00\x04SIGN".to_vec();
        let mut reader = AtomReader::new(bytes.as_slice());
        assert!(matches!(
            reader.next_atom(),
            Err(SnapshotError::BadAtomSize { size: 4, .. })
        ));
    }

    #[test]
    fn test_wrong_type_and_trailing() {
        let mut bytes = Vec::new();
        write_atom(&mut bytes, VERS, &[1, 0, 0, 0]).unwrap();
        bytes.push(0);
        let mut reader = AtomReader::new(bytes.as_slice());
        assert!(matches!(
            reader.read_atom(SIGN),
            Err(SnapshotError::UnexpectedAtom { .. })
        ));

        let mut reader = AtomReader::new(bytes.as_slice());
        reader.read_atom(VERS).unwrap();
        assert!(matches!(reader.finish(), Err(SnapshotError::Trailing)));
    }

    #[test]
    fn test_words() {
        let payload = to_bytes(&[1, 0x0102_0304]);
        assert_eq!(payload, vec![0, 0, 0, 1, 1, 2, 3, 4]);
        assert_eq!(words(KEYS, &payload).unwrap(), vec![1, 0x0102_0304]);
        assert!(words(KEYS, &payload[..3]).is_err());
    }
}
