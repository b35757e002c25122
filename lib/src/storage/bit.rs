use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::errors::OxliResult;

struct BitTable {
    bytes: Vec<AtomicU8>,
    size: u64,
    occupied: AtomicU64,
}

impl BitTable {
    fn new(size: u64) -> Self {
        let n_bytes = ((size + 7) / 8) as usize;
        let mut bytes = Vec::with_capacity(n_bytes);
        bytes.resize_with(n_bytes, || AtomicU8::new(0));
        BitTable {
            bytes,
            size,
            occupied: AtomicU64::new(0),
        }
    }

    /// Set the bit for `hash`; returns whether it was already set.
    #[inline]
    fn set(&self, hash: u64) -> bool {
        let bucket = hash % self.size;
        let mask = 1u8 << (bucket % 8);
        let old = self.bytes[(bucket / 8) as usize].fetch_or(mask, Ordering::AcqRel);
        let was_set = old & mask != 0;
        if !was_set {
            self.occupied.fetch_add(1, Ordering::Relaxed);
        }
        was_set
    }

    #[inline]
    fn test(&self, hash: u64) -> bool {
        let bucket = hash % self.size;
        let mask = 1u8 << (bucket % 8);
        self.bytes[(bucket / 8) as usize].load(Ordering::Acquire) & mask != 0
    }
}

/// One bit per bucket; the Bloom-filter backend behind presence-only
/// node tables.
pub struct BitStorage {
    tables: Vec<BitTable>,
    sizes: Vec<u64>,
}

impl BitStorage {
    pub fn new(sizes: &[u64]) -> Self {
        BitStorage {
            tables: sizes.iter().map(|&s| BitTable::new(s)).collect(),
            sizes: sizes.to_vec(),
        }
    }

    #[inline]
    pub fn count(&self, hash: u64) -> (u64, u64) {
        let mut all_set = true;
        for table in &self.tables {
            all_set &= table.set(hash);
        }
        (u64::from(all_set), 1)
    }

    #[inline]
    pub fn get(&self, hash: u64) -> u64 {
        u64::from(self.tables.iter().all(|t| t.test(hash)))
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
                occupied += u64::from(byte.count_ones());
                cell.store(byte, Ordering::Relaxed);
            }
            table.occupied.store(occupied, Ordering::Relaxed);
        }
        Ok(())
    }
}
