use std::path::Path;

use crate::errors::{OxliError, OxliResult};
use crate::hashing::{murmur_hash_kmer, KmerWindows};
use crate::parser::ReadParser;

/// Lowest and highest relative error the register math supports; outside
/// this band the precision would leave the 4..=16 range.
pub const MIN_ERROR_RATE: f64 = 0.0040625;
pub const MAX_ERROR_RATE: f64 = 0.367695;

const MURMUR_SEED: u64 = 42;

/// HyperLogLog cardinality counter over canonical k-mers.
///
/// Registers hold the longest run of leading zeros seen in the hash suffix
/// routed to them; the harmonic mean of the registers estimates the number
/// of distinct k-mers. Small cardinalities fall back to linear counting.
pub struct HllCounter {
    ksize: usize,
    p: u8,
    registers: Vec<u8>,
}

fn alpha(m: usize) -> f64 {
    match m {
        16 => 0.673,
        32 => 0.697,
        64 => 0.709,
        _ => 0.7213 / (1.0 + 1.079 / m as f64),
    }
}

impl HllCounter {
    pub fn new(error_rate: f64, ksize: usize) -> OxliResult<Self> {
        if !(MIN_ERROR_RATE..=MAX_ERROR_RATE).contains(&error_rate) {
            return Err(OxliError::Config(format!(
                "error rate {} outside [{}, {}]",
                error_rate, MIN_ERROR_RATE, MAX_ERROR_RATE
            )));
        }
        if ksize == 0 || ksize > crate::hashing::MAX_K {
            return Err(OxliError::Config(format!(
                "k-mer size {} outside 1..={}",
                ksize,
                crate::hashing::MAX_K
            )));
        }
        let p = ((1.04 / error_rate).powi(2).log2().ceil() as i64).max(4).min(16) as u8;
        Ok(HllCounter {
            ksize,
            p,
            registers: vec![0; 1 << p],
        })
    }

    pub fn ksize(&self) -> usize {
        self.ksize
    }

    /// Relative error implied by the register count.
    pub fn error_rate(&self) -> f64 {
        1.04 / (self.registers.len() as f64).sqrt()
    }

    #[inline]
    fn add_hash(&mut self, hash: u64) {
        let idx = (hash >> (64 - self.p)) as usize;
        let rest = hash << self.p;
        // rank of the first set bit in the remaining 64 - p bits
        let rank = (rest.leading_zeros() as u8).min(64 - self.p) + 1;
        if rank > self.registers[idx] {
            self.registers[idx] = rank;
        }
    }

    /// Count one k-mer, given as exactly `ksize` bases.
    pub fn add(&mut self, kmer: &[u8]) -> OxliResult<()> {
        if kmer.len() != self.ksize {
            return Err(OxliError::BadLength {
                expected: self.ksize,
                got: kmer.len(),
            });
        }
        let hash = murmur_hash_kmer(kmer, MURMUR_SEED);
        self.add_hash(hash);
        Ok(())
    }

    /// Count every valid k-mer window of `sequence`; returns how many.
    pub fn consume_string(&mut self, sequence: &[u8]) -> u64 {
        let mut n = 0;
        for (start, _kmer) in KmerWindows::new(sequence, self.ksize) {
            let hash = murmur_hash_kmer(&sequence[start..start + self.ksize], MURMUR_SEED);
            self.add_hash(hash);
            n += 1;
        }
        n
    }

    /// Count all k-mers of a sequence file; returns (n_reads, n_kmers).
    pub fn consume_seqfile<P: AsRef<Path>>(&mut self, path: P) -> OxliResult<(u64, u64)> {
        let parser = ReadParser::from_path(path)?;
        let mut n_reads = 0;
        let mut n_kmers = 0;
        while let Some(mut record) = parser.next_record()? {
            record.clean_sequence();
            n_kmers += self.consume_string(&record.sequence);
            n_reads += 1;
        }
        Ok((n_reads, n_kmers))
    }

    pub fn estimate_cardinality(&self) -> u64 {
        let m = self.registers.len() as f64;
        let sum: f64 = self
            .registers
            .iter()
            .map(|&r| 2f64.powi(-i32::from(r)))
            .sum();
        let raw = alpha(self.registers.len()) * m * m / sum;
        if raw <= 2.5 * m {
            let zeros = self.registers.iter().filter(|&&r| r == 0).count();
            if zeros > 0 {
                // linear counting is more accurate while registers are sparse
                return (m * (m / zeros as f64).ln()).round() as u64;
            }
        }
        raw.round() as u64
    }

    /// Fold `other` into this counter; equivalent to having consumed both
    /// inputs here.
    pub fn merge(&mut self, other: &HllCounter) -> OxliResult<()> {
        if self.ksize != other.ksize {
            return Err(OxliError::IncompatibleHll(format!(
                "k-mer sizes differ: {} vs {}",
                self.ksize, other.ksize
            )));
        }
        if self.p != other.p {
            return Err(OxliError::IncompatibleHll(format!(
                "precisions differ: {} vs {}",
                self.p, other.p
            )));
        }
        for (mine, theirs) in self.registers.iter_mut().zip(&other.registers) {
            if *theirs > *mine {
                *mine = *theirs;
            }
        }
        Ok(())
    }
}
