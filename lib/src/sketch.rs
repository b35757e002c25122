use std::collections::HashMap;
use std::fs::File;
use std::hash::BuildHasherDefault;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::errors::{OxliError, OxliResult};
use crate::hashing::{get_n_primes_near_x, hash_kmer, KmerWindows, NoHashHasher};
use crate::parser::{for_each_record_parallel, ReadParser};
use crate::storage::{BackendKind, Storage};
use crate::{MAX_BIGCOUNT, MAX_KCOUNT};

const MAGIC: &[u8; 4] = b"OXLI";
const VERSION: u8 = 4;

type BigcountMap = HashMap<u64, u64, BuildHasherDefault<NoHashHasher>>;

/// A fixed-shape probabilistic k-mer table: N bucket arrays of pairwise
/// coprime (prime) sizes behind one of the four storage backends.
///
/// All update paths go through the canonical two-bit hash, so
/// `add(s) == add(revcomp(s))` by construction. Updates are atomic and
/// commutative; the final table contents are deterministic under any
/// thread interleaving.
pub struct Sketch {
    ksize: usize,
    storage: Storage,
    use_bigcount: bool,
    bigcounts: RwLock<BigcountMap>,
}

fn validate_shape(ksize: usize, n_tables: usize) -> OxliResult<()> {
    if ksize == 0 || ksize > 32 {
        return Err(OxliError::Config(format!(
            "k-mer size {} out of range 1..=32",
            ksize
        )));
    }
    if n_tables == 0 || n_tables > 20 {
        return Err(OxliError::Config(format!(
            "number of tables {} out of range 1..=20",
            n_tables
        )));
    }
    Ok(())
}

impl Sketch {
    pub fn new(kind: BackendKind, ksize: usize, table_sizes: &[u64]) -> OxliResult<Self> {
        validate_shape(ksize, table_sizes.len())?;
        Ok(Sketch {
            ksize,
            storage: Storage::new(kind, table_sizes)?,
            use_bigcount: false,
            bigcounts: RwLock::new(BigcountMap::default()),
        })
    }

    /// Presence-only node table (Bloom filter).
    pub fn nodetable(ksize: usize, n_tables: usize, max_tablesize: u64) -> OxliResult<Self> {
        validate_shape(ksize, n_tables)?;
        let sizes = get_n_primes_near_x(n_tables, max_tablesize)?;
        Sketch::new(BackendKind::Bit, ksize, &sizes)
    }

    /// The default Count-Min table with 8-bit saturating counters.
    pub fn counttable(ksize: usize, n_tables: usize, max_tablesize: u64) -> OxliResult<Self> {
        validate_shape(ksize, n_tables)?;
        let sizes = get_n_primes_near_x(n_tables, max_tablesize)?;
        Sketch::new(BackendKind::Byte, ksize, &sizes)
    }

    /// Half-memory variant with 4-bit counters.
    pub fn smallcounttable(ksize: usize, n_tables: usize, max_tablesize: u64) -> OxliResult<Self> {
        validate_shape(ksize, n_tables)?;
        let sizes = get_n_primes_near_x(n_tables, max_tablesize)?;
        Sketch::new(BackendKind::Nibble, ksize, &sizes)
    }

    /// Counting quotient filter table for sparse, wide-count data.
    pub fn qftable(ksize: usize, n_slots: u64) -> OxliResult<Self> {
        Sketch::new(BackendKind::Qf, ksize, &[n_slots])
    }

    /// Size the tables from a total memory budget instead of a per-table
    /// size: N primes just under `max_memory / N` buckets' worth of bytes.
    pub fn with_memory(
        kind: BackendKind,
        ksize: usize,
        n_tables: usize,
        max_memory: u64,
    ) -> OxliResult<Self> {
        validate_shape(ksize, n_tables)?;
        let buckets_per_table = max_memory
            .saturating_mul(8)
            .checked_div(kind.bits_per_bucket() * n_tables as u64)
            .unwrap_or(0);
        if buckets_per_table < 2 {
            return Err(OxliError::Config(format!(
                "memory budget of {} bytes is below one bucket per table",
                max_memory
            )));
        }
        if kind == BackendKind::Qf {
            // single backing array; round down to a power of two under budget
            let slots = (buckets_per_table * n_tables as u64).next_power_of_two() / 2;
            return Sketch::new(kind, ksize, &[slots.max(2)]);
        }
        let sizes = get_n_primes_near_x(n_tables, buckets_per_table)?;
        Sketch::new(kind, ksize, &sizes)
    }

    pub fn ksize(&self) -> usize {
        self.ksize
    }

    pub fn table_sizes(&self) -> &[u64] {
        self.storage.table_sizes()
    }

    pub fn n_tables(&self) -> usize {
        self.storage.n_tables()
    }

    pub fn backend(&self) -> BackendKind {
        self.storage.kind()
    }

    pub fn use_bigcount(&self) -> bool {
        self.use_bigcount
    }

    /// Enable the exact overflow map for counters that hit the 8-bit cap.
    pub fn set_use_bigcount(&mut self, enable: bool) -> OxliResult<()> {
        if enable && self.storage.kind() != BackendKind::Byte {
            return Err(OxliError::Config(
                "bigcount requires the byte-counter backend".to_owned(),
            ));
        }
        self.use_bigcount = enable;
        Ok(())
    }

    /// Canonical hash of a k-mer string, checked against this sketch's k.
    pub fn hash(&self, kmer: &[u8]) -> OxliResult<u64> {
        hash_kmer(kmer, self.ksize)
    }

    /// Insert one canonical hash; returns the count after insertion.
    pub fn add(&self, hash: u64) -> u64 {
        let (before, after) = self.storage.count(hash);
        if self.use_bigcount && after == MAX_KCOUNT {
            if before == MAX_KCOUNT {
                // table counter is pinned; the exact map takes over
                let mut map = self.bigcounts.write().unwrap();
                let entry = map.entry(hash).or_insert(MAX_KCOUNT);
                *entry += 1;
                return *entry;
            }
            return MAX_KCOUNT;
        }
        after
    }

    pub fn add_kmer(&self, kmer: &[u8]) -> OxliResult<u64> {
        Ok(self.add(self.hash(kmer)?))
    }

    pub fn get(&self, hash: u64) -> u64 {
        let v = self.storage.get(hash);
        if self.use_bigcount && v == MAX_KCOUNT {
            if let Some(&exact) = self.bigcounts.read().unwrap().get(&hash) {
                return exact;
            }
        }
        v
    }

    pub fn get_kmer(&self, kmer: &[u8]) -> OxliResult<u64> {
        Ok(self.get(self.hash(kmer)?))
    }

    /// Rolling-hash insert of every valid length-k window of `seq`.
    /// Windows containing non-ACGT bases are skipped.
    pub fn consume(&self, seq: &[u8]) -> usize {
        let mut n = 0;
        for (_, kmer) in KmerWindows::new(seq, self.ksize) {
            self.add(kmer.canonical());
            n += 1;
        }
        n
    }

    /// As `consume`, but only k-mers whose canonical hash falls in the
    /// given residue band are inserted.
    pub fn consume_banded(&self, seq: &[u8], num_bands: u64, band: u64) -> OxliResult<usize> {
        check_banding(num_bands, band)?;
        let mut n = 0;
        for (_, kmer) in KmerWindows::new(seq, self.ksize) {
            let hash = kmer.canonical();
            if hash % num_bands == band {
                self.add(hash);
            }
            n += 1;
        }
        Ok(n)
    }

    /// Parse a FASTA/FASTQ file (gzip/bzip2 detected by content) and
    /// consume every read. Returns (reads, k-mers consumed).
    pub fn consume_seqfile<P: AsRef<Path>>(&self, path: P) -> OxliResult<(u64, u64)> {
        let parser = ReadParser::from_path(path)?;
        self.consume_seqfile_with_parser(&parser)
    }

    /// Consume from a shared parser; callable from many threads at once
    /// against the same sketch.
    pub fn consume_seqfile_with_parser(&self, parser: &ReadParser) -> OxliResult<(u64, u64)> {
        let mut n_reads = 0u64;
        let mut n_kmers = 0u64;
        while let Some(mut record) = parser.next_record()? {
            record.clean_sequence();
            n_kmers += self.consume(&record.sequence) as u64;
            n_reads += 1;
        }
        Ok((n_reads, n_kmers))
    }

    /// Block-parallel variant for uncompressed files: byte ranges are
    /// handed to rayon workers, each with a private record iterator.
    pub fn consume_seqfile_parallel<P: AsRef<Path>>(
        &self,
        path: P,
        blocksize: u64,
    ) -> OxliResult<(u64, u64)> {
        let n_reads = AtomicU64::new(0);
        let n_kmers = AtomicU64::new(0);
        for_each_record_parallel(path, blocksize, &|mut record| {
            record.clean_sequence();
            let n = self.consume(&record.sequence);
            n_kmers.fetch_add(n as u64, Ordering::Relaxed);
            n_reads.fetch_add(1, Ordering::Relaxed);
        })?;
        Ok((n_reads.into_inner(), n_kmers.into_inner()))
    }

    /// Banded file load: after running every band in [0, num_bands) over
    /// the same file, the tables are bit-identical to a single full pass.
    pub fn consume_seqfile_banding<P: AsRef<Path>>(
        &self,
        path: P,
        num_bands: u64,
        band: u64,
    ) -> OxliResult<(u64, u64)> {
        check_banding(num_bands, band)?;
        let parser = ReadParser::from_path(path)?;
        let mut n_reads = 0u64;
        let mut n_kmers = 0u64;
        while let Some(mut record) = parser.next_record()? {
            record.clean_sequence();
            n_kmers += self.consume_banded(&record.sequence, num_bands, band)? as u64;
            n_reads += 1;
        }
        Ok((n_reads, n_kmers))
    }

    fn counts_of(&self, seq: &[u8]) -> OxliResult<Vec<u64>> {
        if seq.len() < self.ksize {
            return Err(OxliError::Value(format!(
                "sequence length {} is below k={}",
                seq.len(),
                self.ksize
            )));
        }
        Ok(KmerWindows::new(seq, self.ksize)
            .map(|(_, kmer)| self.get(kmer.canonical()))
            .collect())
    }

    /// Median, mean and stdev of the counts of every k-mer in `seq`.
    pub fn get_median_count(&self, seq: &[u8]) -> OxliResult<(u64, f64, f64)> {
        let mut counts = self.counts_of(seq)?;
        if counts.is_empty() {
            return Err(OxliError::Value(
                "sequence has no valid k-mers".to_owned(),
            ));
        }
        counts.sort_unstable();
        let median = counts[counts.len() / 2];
        let mean = counts.iter().sum::<u64>() as f64 / counts.len() as f64;
        let var = counts
            .iter()
            .map(|&c| (c as f64 - mean).powi(2))
            .sum::<f64>()
            / counts.len() as f64;
        Ok((median, mean, var.sqrt()))
    }

    pub fn get_min_count(&self, seq: &[u8]) -> OxliResult<u64> {
        Ok(self.counts_of(seq)?.into_iter().min().unwrap_or(0))
    }

    pub fn get_max_count(&self, seq: &[u8]) -> OxliResult<u64> {
        Ok(self.counts_of(seq)?.into_iter().max().unwrap_or(0))
    }

    /// Histogram of k-mer abundances over a file. `tracking` marks k-mers
    /// already seen so each distinct k-mer is binned exactly once.
    pub fn abundance_distribution<P: AsRef<Path>>(
        &self,
        path: P,
        tracking: &Sketch,
    ) -> OxliResult<Vec<u64>> {
        if tracking.ksize != self.ksize {
            return Err(OxliError::IncompatibleSketch(format!(
                "tracking sketch has k={}, expected {}",
                tracking.ksize, self.ksize
            )));
        }
        let mut dist = vec![0u64; (MAX_BIGCOUNT + 1) as usize];
        let parser = ReadParser::from_path(path)?;
        while let Some(mut record) = parser.next_record()? {
            record.clean_sequence();
            for (_, kmer) in KmerWindows::new(&record.sequence, self.ksize) {
                let hash = kmer.canonical();
                if tracking.get(hash) == 0 {
                    tracking.add(hash);
                    let count = self.get(hash).min(MAX_BIGCOUNT);
                    dist[count as usize] += 1;
                }
            }
        }
        Ok(dist)
    }

    /// Longest prefix of `seq` whose every k-mer has count >= `cutoff`;
    /// returns the prefix and its length. Windows with ambiguous bases
    /// fail the cutoff.
    pub fn trim_on_abundance<'a>(&self, seq: &'a [u8], cutoff: u64) -> (&'a [u8], usize) {
        let k = self.ksize;
        if seq.len() < k {
            return (seq, seq.len());
        }
        let mut expected = 0usize;
        for (pos, kmer) in KmerWindows::new(seq, k) {
            if pos > expected {
                // an invalid window sat at `expected`
                let at = expected + k - 1;
                return (&seq[..at], at);
            }
            if self.get(kmer.canonical()) < cutoff {
                let at = pos + k - 1;
                return (&seq[..at], at);
            }
            expected = pos + 1;
        }
        if expected < seq.len() - k + 1 {
            let at = expected + k - 1;
            return (&seq[..at], at);
        }
        (seq, seq.len())
    }

    /// `(occupied / size)` of the smallest table, to the Nth power: the
    /// expected false-positive / collision rate of the sketch.
    pub fn expected_collisions(&self) -> f64 {
        let smallest = self.n_tables() - 1;
        let size = self.table_sizes()[smallest] as f64;
        let load = self.storage.occupied(smallest) as f64 / size;
        load.powi(self.n_tables() as i32)
    }

    /// Error out when the collision rate is past `max_rate`.
    pub fn check_fp_rate(&self, max_rate: f64) -> OxliResult<()> {
        let rate = self.expected_collisions();
        if rate > max_rate {
            return Err(OxliError::Saturation(rate));
        }
        Ok(())
    }

    pub fn n_occupied(&self) -> u64 {
        self.storage.occupied(0)
    }

    pub fn check_compatible(&self, other: &Sketch) -> OxliResult<()> {
        if self.ksize != other.ksize {
            return Err(OxliError::IncompatibleSketch(format!(
                "k-mer sizes differ: {} vs {}",
                self.ksize, other.ksize
            )));
        }
        if self.backend() != other.backend() {
            return Err(OxliError::IncompatibleSketch(
                "storage backends differ".to_owned(),
            ));
        }
        if self.table_sizes() != other.table_sizes() {
            return Err(OxliError::IncompatibleSketch(
                "table sizes differ".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> OxliResult<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.save_to(&mut writer)
    }

    pub fn save_to(&self, writer: &mut dyn Write) -> OxliResult<()> {
        writer.write_all(MAGIC)?;
        writer.write_u8(VERSION)?;
        writer.write_u8(self.backend() as u8)?;
        writer.write_u8(u8::from(self.use_bigcount))?;
        writer.write_u32::<LittleEndian>(self.ksize as u32)?;
        writer.write_u8(self.n_tables() as u8)?;
        for &size in self.table_sizes() {
            writer.write_u64::<LittleEndian>(size)?;
        }
        self.storage.write_tables(writer)?;
        if self.use_bigcount {
            let map = self.bigcounts.read().unwrap();
            let mut pairs: Vec<(u64, u64)> = map.iter().map(|(&h, &c)| (h, c)).collect();
            pairs.sort_unstable();
            writer.write_u64::<LittleEndian>(pairs.len() as u64)?;
            for (hash, count) in pairs {
                writer.write_u64::<LittleEndian>(hash)?;
                writer.write_u64::<LittleEndian>(count)?;
            }
        }
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> OxliResult<Sketch> {
        let display = path.as_ref().display().to_string();
        let mut reader = BufReader::new(File::open(path)?);
        Sketch::load_from(&mut reader).map_err(|e| match e {
            OxliError::BadFormat {
                filetype, reason, ..
            } => OxliError::BadFormat {
                filetype,
                path: display.clone(),
                reason,
            },
            other => other,
        })
    }

    pub fn load_from(reader: &mut dyn Read) -> OxliResult<Sketch> {
        let bad = |reason: String| OxliError::BadFormat {
            filetype: "sketch",
            path: String::new(),
            reason,
        };
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(bad("bad magic".to_owned()));
        }
        let version = reader.read_u8()?;
        if version != VERSION {
            return Err(bad(format!("unsupported version {}", version)));
        }
        let kind = BackendKind::from_tag(reader.read_u8()?)?;
        let use_bigcount = reader.read_u8()? != 0;
        let ksize = reader.read_u32::<LittleEndian>()? as usize;
        let n_tables = reader.read_u8()? as usize;
        let mut sizes = Vec::with_capacity(n_tables);
        for _ in 0..n_tables {
            sizes.push(reader.read_u64::<LittleEndian>()?);
        }
        let mut sketch = Sketch::new(kind, ksize, &sizes)?;
        sketch.use_bigcount = use_bigcount;
        sketch.storage.read_tables(reader)?;
        if use_bigcount {
            let n_pairs = reader.read_u64::<LittleEndian>()?;
            let mut map = BigcountMap::default();
            for _ in 0..n_pairs {
                let hash = reader.read_u64::<LittleEndian>()?;
                let count = reader.read_u64::<LittleEndian>()?;
                map.insert(hash, count);
            }
            sketch.bigcounts = RwLock::new(map);
        }
        Ok(sketch)
    }
}

impl PartialEq for Sketch {
    fn eq(&self, other: &Sketch) -> bool {
        self.ksize == other.ksize
            && self.use_bigcount == other.use_bigcount
            && self.storage == other.storage
            && *self.bigcounts.read().unwrap() == *other.bigcounts.read().unwrap()
    }
}

fn check_banding(num_bands: u64, band: u64) -> OxliResult<()> {
    if num_bands == 0 || num_bands > 8 {
        return Err(OxliError::Value(format!(
            "num_bands {} out of range 1..=8",
            num_bands
        )));
    }
    if band >= num_bands {
        return Err(OxliError::Value(format!(
            "band {} out of range for {} bands",
            band, num_bands
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_exact_small_count() {
        // k=4, one table: AAAA and TTTT are the same canonical k-mer
        let sketch = Sketch::counttable(4, 1, 10).unwrap();
        sketch.add_kmer(b"AAAA").unwrap();
        assert_eq!(sketch.get_kmer(b"AAAA").unwrap(), 1);
        assert_eq!(sketch.get_kmer(b"TTTT").unwrap(), 1);
        sketch.add_kmer(b"TTTT").unwrap();
        assert_eq!(sketch.get_kmer(b"AAAA").unwrap(), 2);
    }

    #[test]
    fn test_saturation_without_bigcount() {
        let sketch = Sketch::counttable(4, 2, 100).unwrap();
        for _ in 0..1000 {
            sketch.add_kmer(b"AAAA").unwrap();
        }
        assert_eq!(sketch.get_kmer(b"AAAA").unwrap(), 255);
    }

    #[test]
    fn test_bigcount_goes_past_255() {
        let mut sketch = Sketch::counttable(4, 2, 100).unwrap();
        sketch.set_use_bigcount(true).unwrap();
        for _ in 0..1000 {
            sketch.add_kmer(b"AAAA").unwrap();
        }
        assert_eq!(sketch.get_kmer(b"AAAA").unwrap(), 1000);
    }

    #[test]
    fn test_bigcount_needs_byte_backend() {
        let mut sketch = Sketch::nodetable(4, 2, 100).unwrap();
        assert!(sketch.set_use_bigcount(true).is_err());
    }

    #[test]
    fn test_consume_counts_windows() {
        let sketch = Sketch::counttable(4, 2, 100).unwrap();
        assert_eq!(sketch.consume(b"ACGTACGT"), 5);
        assert_eq!(sketch.get_kmer(b"ACGT").unwrap(), 2);
        // invalid windows are skipped
        assert_eq!(sketch.consume(b"ACNGT"), 0);
    }

    #[test]
    fn test_median_mean_stdev() {
        let sketch = Sketch::counttable(4, 2, 1000).unwrap();
        sketch.consume(b"AAAATTTT");
        let (median, mean, stdev) = sketch.get_median_count(b"AAAATTTT").unwrap();
        assert!(median >= 1);
        assert!(mean >= 1.0);
        assert!(stdev >= 0.0);
        assert!(sketch.get_median_count(b"ACG").is_err());
    }

    #[test]
    fn test_trim_on_abundance() {
        let sketch = Sketch::counttable(4, 2, 1000).unwrap();
        sketch.consume(b"AAAAAAAA");
        // the A-run k-mers have counts; the G-run has none
        let read = b"AAAAAAAAGGGGGGGG";
        let (prefix, pos) = sketch.trim_on_abundance(read, 1);
        assert!(pos < read.len());
        assert_eq!(prefix, &read[..pos]);
        for (_, kmer) in KmerWindows::new(prefix, 4) {
            assert!(sketch.get(kmer.canonical()) >= 1);
        }
        // everything passes a zero cutoff
        assert_eq!(sketch.trim_on_abundance(read, 0).1, read.len());
    }

    #[test]
    fn test_trim_stops_at_ambiguous_base() {
        let sketch = Sketch::counttable(4, 2, 1000).unwrap();
        sketch.consume(b"ACGTACGTACGT");
        let read = b"ACGTACNGTACGT";
        let (_, pos) = sketch.trim_on_abundance(read, 1);
        // first window touching the N is window 3 (ACNG..), so trim at 3+k-1
        assert_eq!(pos, 6);
    }

    #[test]
    fn test_banding_validation() {
        let sketch = Sketch::counttable(4, 1, 100).unwrap();
        assert!(sketch.consume_banded(b"ACGTACGT", 0, 0).is_err());
        assert!(sketch.consume_banded(b"ACGTACGT", 9, 0).is_err());
        assert!(sketch.consume_banded(b"ACGTACGT", 4, 4).is_err());
        assert!(sketch.consume_banded(b"ACGTACGT", 4, 3).is_ok());
    }

    #[test]
    fn test_banding_union_equals_full_pass() {
        let seq = b"ACGGCTATTTACGCGCGATCGGATTATAGCGCAT";
        let full = Sketch::counttable(5, 3, 200).unwrap();
        full.consume(seq);

        let banded = Sketch::counttable(5, 3, 200).unwrap();
        for band in 0..4 {
            banded.consume_banded(seq, 4, band).unwrap();
        }
        assert_eq!(full.storage().table_bytes(), banded.storage().table_bytes());
    }

    #[test]
    fn test_compatibility_checks() {
        let a = Sketch::counttable(5, 2, 100).unwrap();
        let b = Sketch::counttable(7, 2, 100).unwrap();
        let c = Sketch::nodetable(5, 2, 100).unwrap();
        assert!(a.check_compatible(&b).is_err());
        assert!(a.check_compatible(&c).is_err());
        let d = Sketch::counttable(5, 2, 100).unwrap();
        assert!(a.check_compatible(&d).is_ok());
    }

    #[test]
    fn test_shape_validation() {
        assert!(Sketch::counttable(0, 2, 100).is_err());
        assert!(Sketch::counttable(33, 2, 100).is_err());
        assert!(Sketch::counttable(21, 0, 100).is_err());
        assert!(Sketch::counttable(21, 21, 100).is_err());
        assert!(Sketch::with_memory(BackendKind::Byte, 21, 4, 1).is_err());
    }

    #[test]
    fn test_with_memory_respects_budget() {
        let sketch = Sketch::with_memory(BackendKind::Byte, 21, 4, 40_000).unwrap();
        let total: u64 = sketch.table_sizes().iter().sum();
        assert!(total <= 40_000);
        assert_eq!(sketch.n_tables(), 4);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.ct");

        let mut sketch = Sketch::counttable(6, 3, 500).unwrap();
        sketch.set_use_bigcount(true).unwrap();
        sketch.consume(b"ACGGCTATTTACGCGCGATCGGATTATAGCGCAT");
        for _ in 0..300 {
            sketch.add_kmer(b"ACGGCT").unwrap();
        }
        sketch.save(&path).unwrap();

        let loaded = Sketch::load(&path).unwrap();
        assert!(loaded == sketch);
        assert_eq!(loaded.get_kmer(b"ACGGCT").unwrap(), 301);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.ct");
        std::fs::write(&path, b"not a sketch at all").unwrap();
        assert!(Sketch::load(&path).is_err());
    }

    #[test]
    fn test_expected_collisions_grows() {
        let sketch = Sketch::counttable(4, 2, 50).unwrap();
        assert_eq!(sketch.expected_collisions(), 0.0);
        for i in 0..500u64 {
            sketch.add(i * 7);
        }
        assert!(sketch.expected_collisions() > 0.15);
        assert!(sketch.check_fp_rate(0.15).is_err());
    }

    proptest! {
        #[test]
        fn prop_add_then_get_at_least_one(s in "[ACGT]{8}") {
            let sketch = Sketch::counttable(8, 2, 1000).unwrap();
            sketch.add_kmer(s.as_bytes()).unwrap();
            let got = sketch.get_kmer(s.as_bytes()).unwrap();
            prop_assert!(got >= 1 && got <= 255);
        }

        #[test]
        fn prop_trim_prefix_is_clean(seq in "[ACGT]{10,40}", cutoff in 1u64..4) {
            let sketch = Sketch::counttable(5, 2, 1000).unwrap();
            sketch.consume(seq.as_bytes());
            sketch.consume(seq.as_bytes());
            let (prefix, _) = sketch.trim_on_abundance(seq.as_bytes(), cutoff);
            for (_, kmer) in KmerWindows::new(prefix, 5) {
                prop_assert!(sketch.get(kmer.canonical()) >= cutoff);
            }
        }
    }
}
