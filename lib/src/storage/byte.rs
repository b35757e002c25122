use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::errors::OxliResult;

/// Saturation point of an 8-bit counter; counts past this go to the
/// sketch's bigcount overflow map, when enabled.
pub const MAX_COUNT: u8 = 255;

struct ByteTable {
    cells: Vec<AtomicU8>,
    size: u64,
    occupied: AtomicU64,
}

impl ByteTable {
    fn new(size: u64) -> Self {
        let mut cells = Vec::with_capacity(size as usize);
        cells.resize_with(size as usize, || AtomicU8::new(0));
        ByteTable {
            cells,
            size,
            occupied: AtomicU64::new(0),
        }
    }

    /// Saturating increment; returns (old, new).
    #[inline]
    fn incr(&self, hash: u64) -> (u8, u8) {
        let cell = &self.cells[(hash % self.size) as usize];
        let mut cur = cell.load(Ordering::Relaxed);
        loop {
            if cur == MAX_COUNT {
                return (cur, cur);
            }
            match cell.compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => {
                    if cur == 0 {
                        self.occupied.fetch_add(1, Ordering::Relaxed);
                    }
                    return (cur, cur + 1);
                }
                Err(seen) => cur = seen,
            }
        }
    }

    #[inline]
    fn get(&self, hash: u64) -> u8 {
        self.cells[(hash % self.size) as usize].load(Ordering::Acquire)
    }
}

/// One saturating byte counter per bucket; the default Count-Min backend.
pub struct ByteStorage {
    tables: Vec<ByteTable>,
    sizes: Vec<u64>,
}

impl ByteStorage {
    pub fn new(sizes: &[u64]) -> Self {
        ByteStorage {
            tables: sizes.iter().map(|&s| ByteTable::new(s)).collect(),
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
            for cell in &table.cells {
                cell.store(0, Ordering::Relaxed);
            }
            table.occupied.store(0, Ordering::Relaxed);
        }
    }

    pub fn write_tables(&self, writer: &mut dyn Write) -> OxliResult<()> {
        for table in &self.tables {
            let raw: Vec<u8> = table.cells.iter().map(|c| c.load(Ordering::Relaxed)).collect();
            writer.write_all(&raw)?;
        }
        Ok(())
    }

    pub fn read_tables(&self, reader: &mut dyn Read) -> OxliResult<()> {
        for table in &self.tables {
            let mut raw = vec![0u8; table.cells.len()];
            reader.read_exact(&mut raw)?;
            let mut occupied = 0u64;
            for (cell, byte) in table.cells.iter().zip(raw) {
                if byte > 0 {
                    occupied += 1;
                }
                cell.store(byte, Ordering::Relaxed);
            }
            table.occupied.store(occupied, Ordering::Relaxed);
        }
        Ok(())
    }
}
