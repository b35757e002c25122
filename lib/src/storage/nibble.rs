use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::errors::OxliResult;

/// Saturation point of a 4-bit counter.
pub const MAX_COUNT: u8 = 15;

struct NibbleTable {
    // two buckets per byte: even buckets in the low nibble
    bytes: Vec<AtomicU8>,
    size: u64,
    occupied: AtomicU64,
}

impl NibbleTable {
    fn new(size: u64) -> Self {
        let n_bytes = ((size + 1) / 2) as usize;
        let mut bytes = Vec::with_capacity(n_bytes);
        bytes.resize_with(n_bytes, || AtomicU8::new(0));
        NibbleTable {
            bytes,
            size,
            occupied: AtomicU64::new(0),
        }
    }

    /// Saturating increment of the target nibble, preserving its sibling.
    #[inline]
    fn incr(&self, hash: u64) -> (u8, u8) {
        let bucket = hash % self.size;
        let cell = &self.bytes[(bucket / 2) as usize];
        let shift = (bucket % 2) * 4;
        let mut cur = cell.load(Ordering::Relaxed);
        loop {
            let nib = (cur >> shift) & 0x0f;
            if nib == MAX_COUNT {
                return (nib, nib);
            }
            let updated = (cur & !(0x0f << shift)) | ((nib + 1) << shift);
            match cell.compare_exchange_weak(cur, updated, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => {
                    if nib == 0 {
                        self.occupied.fetch_add(1, Ordering::Relaxed);
                    }
                    return (nib, nib + 1);
                }
                Err(seen) => cur = seen,
            }
        }
    }

    #[inline]
    fn get(&self, hash: u64) -> u8 {
        let bucket = hash % self.size;
        let shift = (bucket % 2) * 4;
        (self.bytes[(bucket / 2) as usize].load(Ordering::Acquire) >> shift) & 0x0f
    }
}

/// Four-bit counters, two per byte: half the memory of `ByteStorage` at the
/// cost of counter range.
pub struct NibbleStorage {
    tables: Vec<NibbleTable>,
    sizes: Vec<u64>,
}

impl NibbleStorage {
    pub fn new(sizes: &[u64]) -> Self {
        NibbleStorage {
            tables: sizes.iter().map(|&s| NibbleTable::new(s)).collect(),
            sizes: sizes.to_vec(),
        }
    }

    #[inline]
    pub fn count(&self, hash: u64) -> (u64, u64) {
        let mut min_old = u64::from(u8::MAX);
        let mut min_new = u64::from(u8::MAX);
        for table in &self.tables {
            let (old, new) = table.incr(hash);
            min_old = min_old.min(u64::from(old));
            min_new = min_new.min(u64::from(new));
        }
        (min_old, min_new)
    }

    #[inline]
    pub fn get(&self, hash: u64) -> u64 {
        u64::from(self.tables.iter().map(|t| t.get(hash)).min().unwrap_or(0))
    }

    pub fn occupied(&self, table: usize) -> u64 {
        self.tables[table].occupied.load(Ordering::Relaxed)
    }

    pub fn table_sizes(&self) -> &[u64] {
        &self.sizes
    }

    pub fn clear(&self) {
        for table in &self.tables {
            for byte in &table.bytes {
                byte.store(0, Ordering::Relaxed);
            }
            table.occupied.store(0, Ordering::Relaxed);
        }
    }

    pub fn write_tables(&self, writer: &mut dyn Write) -> OxliResult<()> {
        for table in &self.tables {
            let raw: Vec<u8> = table.bytes.iter().map(|b| b.load(Ordering::Relaxed)).collect();
            writer.write_all(&raw)?;
        }
        Ok(())
    }

    pub fn read_tables(&self, reader: &mut dyn Read) -> OxliResult<()> {
        for table in &self.tables {
            let mut raw = vec![0u8; table.bytes.len()];
            reader.read_exact(&mut raw)?;
            let mut occupied = 0u64;
            for (cell, byte) in table.bytes.iter().zip(raw) {
                if byte & 0x0f != 0 {
                    occupied += 1;
                }
                if byte & 0xf0 != 0 {
                    occupied += 1;
                }
                cell.store(byte, Ordering::Relaxed);
            }
            table.occupied.store(occupied, Ordering::Relaxed);
        }
        Ok(())
    }
}
