pub mod bit;
pub mod byte;
pub mod nibble;
pub mod qf;

use std::io::{Read, Write};

use crate::errors::{OxliError, OxliResult};

pub use bit::BitStorage;
pub use byte::ByteStorage;
pub use nibble::NibbleStorage;
pub use qf::QfStorage;

/// Backend tag as written into the serialized sketch header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BackendKind {
    Byte = 1,
    Nibble = 2,
    Bit = 3,
    Qf = 4,
}

impl BackendKind {
    pub fn from_tag(tag: u8) -> OxliResult<Self> {
        match tag {
            1 => Ok(BackendKind::Byte),
            2 => Ok(BackendKind::Nibble),
            3 => Ok(BackendKind::Bit),
            4 => Ok(BackendKind::Qf),
            other => Err(OxliError::Value(format!(
                "unknown storage backend tag {}",
                other
            ))),
        }
    }

    pub fn bits_per_bucket(self) -> u64 {
        match self {
            BackendKind::Byte => 8,
            BackendKind::Nibble => 4,
            BackendKind::Bit => 1,
            // a QF slot carries a fingerprint byte and a 32-bit count
            BackendKind::Qf => 40,
        }
    }
}

/// The four interchangeable bucket-array backends. Dispatch is a plain
/// match so the rolling-hash hot loop stays monomorphic.
pub enum Storage {
    Bit(BitStorage),
    Byte(ByteStorage),
    Nibble(NibbleStorage),
    Qf(QfStorage),
}

impl Storage {
    pub fn new(kind: BackendKind, sizes: &[u64]) -> OxliResult<Self> {
        for &size in sizes {
            if size < 2 {
                return Err(OxliError::Config(format!(
                    "table size {} is below the two-bucket minimum",
                    size
                )));
            }
        }
        Ok(match kind {
            BackendKind::Bit => Storage::Bit(BitStorage::new(sizes)),
            BackendKind::Byte => Storage::Byte(ByteStorage::new(sizes)),
            BackendKind::Nibble => Storage::Nibble(NibbleStorage::new(sizes)),
            BackendKind::Qf => Storage::Qf(QfStorage::new(sizes)?),
        })
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Storage::Bit(_) => BackendKind::Bit,
            Storage::Byte(_) => BackendKind::Byte,
            Storage::Nibble(_) => BackendKind::Nibble,
            Storage::Qf(_) => BackendKind::Qf,
        }
    }

    /// Insert once. Returns the estimate before and after the insert; both
    /// are the per-table minimum (AND of bits for the presence backend).
    #[inline]
    pub fn count(&self, hash: u64) -> (u64, u64) {
        match self {
            Storage::Bit(s) => s.count(hash),
            Storage::Byte(s) => s.count(hash),
            Storage::Nibble(s) => s.count(hash),
            Storage::Qf(s) => s.count(hash),
        }
    }

    #[inline]
    pub fn get(&self, hash: u64) -> u64 {
        match self {
            Storage::Bit(s) => s.get(hash),
            Storage::Byte(s) => s.get(hash),
            Storage::Nibble(s) => s.get(hash),
            Storage::Qf(s) => s.get(hash),
        }
    }

    /// Occupied buckets in one table.
    pub fn occupied(&self, table: usize) -> u64 {
        match self {
            Storage::Bit(s) => s.occupied(table),
            Storage::Byte(s) => s.occupied(table),
            Storage::Nibble(s) => s.occupied(table),
            Storage::Qf(s) => s.occupied(table),
        }
    }

    pub fn table_sizes(&self) -> &[u64] {
        match self {
            Storage::Bit(s) => s.table_sizes(),
            Storage::Byte(s) => s.table_sizes(),
            Storage::Nibble(s) => s.table_sizes(),
            Storage::Qf(s) => s.table_sizes(),
        }
    }

    pub fn n_tables(&self) -> usize {
        self.table_sizes().len()
    }

    pub fn clear(&self) {
        match self {
            Storage::Bit(s) => s.clear(),
            Storage::Byte(s) => s.clear(),
            Storage::Nibble(s) => s.clear(),
            Storage::Qf(s) => s.clear(),
        }
    }

    pub fn write_tables(&self, writer: &mut dyn Write) -> OxliResult<()> {
        match self {
            Storage::Bit(s) => s.write_tables(writer),
            Storage::Byte(s) => s.write_tables(writer),
            Storage::Nibble(s) => s.write_tables(writer),
            Storage::Qf(s) => s.write_tables(writer),
        }
    }

    pub fn read_tables(&self, reader: &mut dyn Read) -> OxliResult<()> {
        match self {
            Storage::Bit(s) => s.read_tables(reader),
            Storage::Byte(s) => s.read_tables(reader),
            Storage::Nibble(s) => s.read_tables(reader),
            Storage::Qf(s) => s.read_tables(reader),
        }
    }

    /// Raw table bytes, in serialization order. Used for equality checks
    /// and the banding identity tests.
    pub fn table_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        // writing into a Vec cannot fail
        self.write_tables(&mut out).unwrap();
        out
    }
}

impl PartialEq for Storage {
    fn eq(&self, other: &Storage) -> bool {
        self.kind() == other.kind()
            && self.table_sizes() == other.table_sizes()
            && self.table_bytes() == other.table_bytes()
    }
}
