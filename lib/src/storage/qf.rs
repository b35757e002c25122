use std::io::{Read, Write};
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::errors::{OxliError, OxliResult};

#[derive(Clone, Copy, Default)]
struct Slot {
    fingerprint: u8,
    count: u32,
}

struct QfInner {
    slots: Vec<Slot>,
    occupied: u64,
}

/// Counting quotient filter: one backing array of 2^q slots, each holding a
/// remainder fingerprint and a wide count. Linear probing from the quotient
/// position; built for sparse k-mer populations with counts far past 255.
pub struct QfStorage {
    inner: Mutex<QfInner>,
    sizes: Vec<u64>,
}

impl QfStorage {
    pub fn new(sizes: &[u64]) -> OxliResult<Self> {
        if sizes.len() != 1 {
            return Err(OxliError::Config(
                "the quotient filter backend uses a single backing table".to_owned(),
            ));
        }
        let n_slots = sizes[0].next_power_of_two();
        Ok(QfStorage {
            inner: Mutex::new(QfInner {
                slots: vec![Slot::default(); n_slots as usize],
                occupied: 0,
            }),
            sizes: vec![n_slots],
        })
    }

    #[inline]
    fn split(&self, hash: u64) -> (usize, u8) {
        let n_slots = self.sizes[0];
        let quotient = (hash & (n_slots - 1)) as usize;
        let fingerprint = ((hash >> n_slots.trailing_zeros()) & 0xff) as u8;
        (quotient, fingerprint)
    }

    pub fn count(&self, hash: u64) -> (u64, u64) {
        let (quotient, fingerprint) = self.split(hash);
        let mut inner = self.inner.lock().unwrap();
        let n_slots = inner.slots.len();
        for probe in 0..n_slots {
            let idx = (quotient + probe) % n_slots;
            let slot = &mut inner.slots[idx];
            if slot.count == 0 {
                slot.fingerprint = fingerprint;
                slot.count = 1;
                inner.occupied += 1;
                return (0, 1);
            }
            if slot.fingerprint == fingerprint {
                let old = slot.count;
                slot.count = slot.count.saturating_add(1);
                return (u64::from(old), u64::from(slot.count));
            }
        }
        // filter is full; nothing more can be inserted
        let max = u64::from(u32::MAX);
        (max, max)
    }

    pub fn get(&self, hash: u64) -> u64 {
        let (quotient, fingerprint) = self.split(hash);
        let inner = self.inner.lock().unwrap();
        let n_slots = inner.slots.len();
        for probe in 0..n_slots {
            let slot = &inner.slots[(quotient + probe) % n_slots];
            if slot.count == 0 {
                return 0;
            }
            if slot.fingerprint == fingerprint {
                return u64::from(slot.count);
            }
        }
        0
    }

    pub fn occupied(&self, _table: usize) -> u64 {
        self.inner.lock().unwrap().occupied
    }

    pub fn table_sizes(&self) -> &[u64] {
        &self.sizes
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        for slot in inner.slots.iter_mut() {
            *slot = Slot::default();
        }
        inner.occupied = 0;
    }

    pub fn write_tables(&self, writer: &mut dyn Write) -> OxliResult<()> {
        let inner = self.inner.lock().unwrap();
        for slot in &inner.slots {
            writer.write_u8(slot.fingerprint)?;
            writer.write_u32::<LittleEndian>(slot.count)?;
        }
        Ok(())
    }

    pub fn read_tables(&self, reader: &mut dyn Read) -> OxliResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let mut occupied = 0u64;
        for slot in inner.slots.iter_mut() {
            slot.fingerprint = reader.read_u8()?;
            slot.count = reader.read_u32::<LittleEndian>()?;
            if slot.count > 0 {
                occupied += 1;
            }
        }
        inner.occupied = occupied;
        Ok(())
    }
}
