//! Machine creation parameters

use serde::{Deserialize, Serialize};

/// Sizes a machine is created with. Snapshots carry them so the
/// reconstructed heap is allocated compatibly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Creation {
    /// Initial chunk block size in bytes (default: 32MB)
    pub initial_chunk_size: u32,
    /// Chunk block growth in bytes (default: 4MB)
    pub incremental_chunk_size: u32,
    /// Initial heap slot count (default: 256K)
    pub initial_heap_count: u32,
    /// Heap growth in slots (default: 128K)
    pub incremental_heap_count: u32,
    /// Stack slot count (default: 4096)
    pub stack_count: u32,
    /// Initial key table size (default: 32000)
    pub initial_key_count: u32,
    /// Key table growth (default: 8000)
    pub incremental_key_count: u32,
    /// Name hash table modulo (default: 1993)
    pub name_modulo: u32,
    /// Symbol hash table modulo (default: 127)
    pub symbol_modulo: u32,
    /// Parser buffer size (default: 8MB)
    pub parser_buffer_size: u32,
    /// Parser hash table modulo (default: 1993)
    pub parser_table_modulo: u32,
}

impl Default for Creation {
    fn default() -> Self {
        Self {
            initial_chunk_size: 32 * 1024 * 1024,
            incremental_chunk_size: 4 * 1024 * 1024,
            initial_heap_count: 256 * 1024,
            incremental_heap_count: 128 * 1024,
            stack_count: 4096,
            initial_key_count: 32000,
            incremental_key_count: 8000,
            name_modulo: 1993,
            symbol_modulo: 127,
            parser_buffer_size: 8192 * 1024,
            parser_table_modulo: 1993,
        }
    }
}

impl Creation {
    /// Number of u32 fields on the wire
    pub const FIELD_COUNT: usize = 11;

    /// Small sizes for tests and tools
    pub fn small() -> Self {
        Self {
            initial_chunk_size: 64 * 1024,
            incremental_chunk_size: 16 * 1024,
            initial_heap_count: 4096,
            incremental_heap_count: 1024,
            stack_count: 512,
            initial_key_count: 512,
            incremental_key_count: 128,
            name_modulo: 127,
            symbol_modulo: 31,
            parser_buffer_size: 64 * 1024,
            parser_table_modulo: 127,
        }
    }

    /// Fields in wire order
    pub fn to_fields(&self) -> [u32; Self::FIELD_COUNT] {
        [
            self.initial_chunk_size,
            self.incremental_chunk_size,
            self.initial_heap_count,
            self.incremental_heap_count,
            self.stack_count,
            self.initial_key_count,
            self.incremental_key_count,
            self.name_modulo,
            self.symbol_modulo,
            self.parser_buffer_size,
            self.parser_table_modulo,
        ]
    }

    /// Build from fields in wire order
    pub fn from_fields(fields: [u32; Self::FIELD_COUNT]) -> Self {
        Self {
            initial_chunk_size: fields[0],
            incremental_chunk_size: fields[1],
            initial_heap_count: fields[2],
            incremental_heap_count: fields[3],
            stack_count: fields[4],
            initial_key_count: fields[5],
            incremental_key_count: fields[6],
            name_modulo: fields[7],
            symbol_modulo: fields[8],
            parser_buffer_size: fields[9],
            parser_table_modulo: fields[10],
        }
    }

    /// Reason these parameters cannot create a machine, if any
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.name_modulo == 0 {
            return Err("name modulo must not be zero");
        }
        if self.symbol_modulo == 0 {
            return Err("symbol modulo must not be zero");
        }
        if self.stack_count < crate::realm::STACK_BASE as u32 {
            return Err("stack too small for the machine roots");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_round_trip() {
        let creation = Creation::small();
        assert_eq!(Creation::from_fields(creation.to_fields()), creation);
    }

    #[test]
    fn test_defaults_match_xsnap() {
        let creation = Creation::default();
        assert_eq!(creation.name_modulo, 1993);
        assert_eq!(creation.symbol_modulo, 127);
        assert_eq!(creation.stack_count, 4096);
    }

    #[test]
    fn test_validate_rejects_zero_modulo() {
        let creation = Creation {
            name_modulo: 0,
            ..Creation::small()
        };
        assert!(creation.validate().is_err());
    }
}
