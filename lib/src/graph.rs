use std::collections::{BTreeSet, VecDeque};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::errors::{OxliError, OxliResult};
use crate::hashing::{hash_kmer, HashIntSet, Kmer, KmerWindows};
use crate::parser::ReadParser;
use crate::sketch::Sketch;
use crate::{BIG_TRAVERSAL_THRESHOLD, TAG_DENSITY};

const MAGIC: &[u8; 4] = b"OXLI";
const VERSION: u8 = 4;
const FILETYPE_TAGSET: u8 = 2;
const FILETYPE_STOPTAGS: u8 = 3;

/// The de Bruijn graph implied by a sketch: a k-mer is a node iff its
/// count is nonzero, and edges are the k-1 overlaps. Nothing is stored
/// beyond the sketch itself, the tag set and the stop-tag set.
pub struct Graph {
    sketch: Sketch,
    tags: Mutex<BTreeSet<u64>>,
    stop_tags: Mutex<HashIntSet>,
    tag_density: usize,
}

impl Graph {
    pub fn new(sketch: Sketch) -> Self {
        Graph::with_tag_density(sketch, TAG_DENSITY)
    }

    pub fn with_tag_density(sketch: Sketch, tag_density: usize) -> Self {
        Graph {
            sketch,
            tags: Mutex::new(BTreeSet::new()),
            stop_tags: Mutex::new(HashIntSet::default()),
            tag_density: tag_density.max(1),
        }
    }

    pub fn sketch(&self) -> &Sketch {
        &self.sketch
    }

    pub fn into_sketch(self) -> Sketch {
        self.sketch
    }

    pub fn ksize(&self) -> usize {
        self.sketch.ksize()
    }

    pub fn tag_density(&self) -> usize {
        self.tag_density
    }

    #[inline]
    fn present(&self, kmer: &Kmer) -> bool {
        self.sketch.get(kmer.canonical()) > 0
    }

    fn is_stop_tag(&self, hash: u64) -> bool {
        self.stop_tags.lock().unwrap().contains(&hash)
    }

    /// Left and right extensions of `kmer` present in the sketch. Up to
    /// eight; a palindromic neighborhood can yield the same canonical hash
    /// from both sides.
    pub fn neighbors(&self, kmer: &Kmer) -> Vec<Kmer> {
        let mut found = Vec::new();
        for base in 0..4 {
            let right = kmer.extend_right(base);
            if self.present(&right) {
                found.push(right);
            }
            let left = kmer.extend_left(base);
            if self.present(&left) {
                found.push(left);
            }
        }
        found
    }

    pub fn kmer_degree(&self, kmer: &Kmer) -> usize {
        self.neighbors(kmer).len()
    }

    fn right_neighbors(&self, kmer: &Kmer) -> Vec<Kmer> {
        (0..4)
            .map(|base| kmer.extend_right(base))
            .filter(|n| self.present(n))
            .collect()
    }

    /// Walk right from `start`, appending one base per step, until a fork,
    /// a dead end, a stop-tag or a node already on the path.
    fn walk_right(&self, start: Kmer, visited: &mut HashIntSet) -> Vec<u8> {
        let mut grown = Vec::new();
        let mut cur = start;
        loop {
            let nexts = self.right_neighbors(&cur);
            if nexts.len() != 1 {
                break;
            }
            let next = nexts[0];
            let hash = next.canonical();
            if self.is_stop_tag(hash) || visited.contains(&hash) {
                break;
            }
            if self.kmer_degree(&next) > 2 {
                break;
            }
            visited.insert(hash);
            grown.extend_from_slice(&next.to_bytes()[next.ksize() - 1..]);
            cur = next;
        }
        grown
    }

    /// Maximal linear path through `seed`, as the lexicographically smaller
    /// of the contig and its reverse complement so every seed on the path
    /// yields the same string.
    pub fn assemble_linear_path(&self, seed: &[u8]) -> OxliResult<Vec<u8>> {
        let kmer = Kmer::from_bytes(seed, self.ksize())?;
        if !self.present(&kmer) || self.is_stop_tag(kmer.canonical()) {
            return Ok(Vec::new());
        }
        let mut visited = HashIntSet::default();
        visited.insert(kmer.canonical());

        let right = self.walk_right(kmer, &mut visited);
        let left = self.walk_right(kmer.rc(), &mut visited);

        let mut contig = crate::hashing::revcomp(&left);
        contig.extend_from_slice(&kmer.to_bytes());
        contig.extend_from_slice(&right);

        let rc = crate::hashing::revcomp(&contig);
        if rc < contig {
            contig = rc;
        }
        Ok(contig)
    }

    /// Breadth-first size of the component containing `seed`, counting
    /// unique canonical k-mers. With `threshold > 0` the walk stops and
    /// reports `threshold` as soon as the count reaches it.
    pub fn calc_connected_graph_size(
        &self,
        seed: &Kmer,
        threshold: u64,
        break_on_stoptags: bool,
    ) -> u64 {
        if !self.present(seed) {
            return 0;
        }
        let mut visited = HashIntSet::default();
        let mut queue = VecDeque::new();
        visited.insert(seed.canonical());
        queue.push_back(*seed);
        while let Some(kmer) = queue.pop_front() {
            if threshold > 0 && visited.len() as u64 >= threshold {
                return threshold;
            }
            for next in self.neighbors(&kmer) {
                let hash = next.canonical();
                if break_on_stoptags && self.is_stop_tag(hash) {
                    continue;
                }
                if visited.insert(hash) {
                    queue.push_back(next);
                }
            }
        }
        visited.len() as u64
    }

    /// All k-mers on `sequence` with more than two present neighbors.
    pub fn find_high_degree_nodes(&self, sequence: &[u8]) -> Vec<Kmer> {
        let mut seen = HashIntSet::default();
        let mut hdns = Vec::new();
        for (_, kmer) in KmerWindows::new(sequence, self.ksize()) {
            if seen.insert(kmer.canonical()) && self.kmer_degree(&kmer) > 2 {
                hdns.push(kmer);
            }
        }
        hdns
    }

    /// Longest prefix of `sequence` before the first stop-tagged k-mer;
    /// returns the prefix and its length.
    pub fn trim_on_stoptags<'a>(&self, sequence: &'a [u8]) -> (&'a [u8], usize) {
        let k = self.ksize();
        if sequence.len() < k {
            return (sequence, sequence.len());
        }
        let mut expected = 0usize;
        for (pos, kmer) in KmerWindows::new(sequence, k) {
            if pos > expected {
                let at = expected + k - 1;
                return (&sequence[..at], at);
            }
            if self.is_stop_tag(kmer.canonical()) {
                let at = pos + k - 1;
                return (&sequence[..at], at);
            }
            expected = pos + 1;
        }
        if expected < sequence.len() - k + 1 {
            let at = expected + k - 1;
            return (&sequence[..at], at);
        }
        (sequence, sequence.len())
    }

    pub fn consume(&self, sequence: &[u8]) -> usize {
        self.sketch.consume(sequence)
    }

    pub fn get(&self, hash: u64) -> u64 {
        self.sketch.get(hash)
    }

    /// As `consume`, but drop a tag on the first k-mer, every
    /// `tag_density` bases after the last tag, and on the last k-mer.
    /// Returns (k-mers consumed, tags on this sequence).
    pub fn consume_and_tag(&self, sequence: &[u8]) -> (usize, Vec<u64>) {
        let mut n = 0usize;
        let mut read_tags = Vec::new();
        let mut since_tag = 0usize;
        let mut last_hash = None;
        for (_, kmer) in KmerWindows::new(sequence, self.ksize()) {
            let hash = kmer.canonical();
            self.sketch.add(hash);
            n += 1;
            since_tag += 1;
            if n == 1 || since_tag >= self.tag_density {
                read_tags.push(hash);
                since_tag = 0;
            }
            last_hash = Some(hash);
        }
        if let Some(hash) = last_hash {
            if read_tags.last() != Some(&hash) {
                read_tags.push(hash);
            }
        }
        if !read_tags.is_empty() {
            let mut tags = self.tags.lock().unwrap();
            for &t in &read_tags {
                tags.insert(t);
            }
        }
        (n, read_tags)
    }

    /// Consume a whole file with tagging. Returns (reads, k-mers).
    pub fn consume_seqfile_and_tag<P: AsRef<Path>>(&self, path: P) -> OxliResult<(u64, u64)> {
        let parser = ReadParser::from_path(path)?;
        let mut n_reads = 0u64;
        let mut n_kmers = 0u64;
        while let Some(mut record) = parser.next_record()? {
            record.clean_sequence();
            let (n, _) = self.consume_and_tag(&record.sequence);
            n_kmers += n as u64;
            n_reads += 1;
        }
        Ok((n_reads, n_kmers))
    }

    pub fn add_tag(&self, hash: u64) {
        self.tags.lock().unwrap().insert(hash);
    }

    pub fn n_tags(&self) -> usize {
        self.tags.lock().unwrap().len()
    }

    /// Snapshot of the tag set in ascending hash order.
    pub fn tags(&self) -> Vec<u64> {
        self.tags.lock().unwrap().iter().copied().collect()
    }

    /// Tags in `[start, end)`; an `end` of 0 means unbounded.
    pub fn tags_in_range(&self, start: u64, end: u64) -> Vec<u64> {
        let tags = self.tags.lock().unwrap();
        match end {
            0 => tags.range(start..).copied().collect(),
            _ => tags.range(start..end).copied().collect(),
        }
    }

    pub fn add_stop_tag(&self, hash: u64) {
        self.stop_tags.lock().unwrap().insert(hash);
    }

    pub fn add_stop_tag_kmer(&self, kmer: &[u8]) -> OxliResult<()> {
        self.add_stop_tag(hash_kmer(kmer, self.ksize())?);
        Ok(())
    }

    pub fn n_stop_tags(&self) -> usize {
        self.stop_tags.lock().unwrap().len()
    }

    pub fn stop_tags(&self) -> Vec<u64> {
        let mut v: Vec<u64> = self.stop_tags.lock().unwrap().iter().copied().collect();
        v.sort_unstable();
        v
    }

    /// Tags (other than the start, if tagged) reachable from `start` by
    /// BFS. Honors stop-tags when `break_on_stoptags`; with
    /// `stop_big_traversals` the walk aborts past the node cap without
    /// touching any state.
    pub fn find_connected_tags(
        &self,
        start: &Kmer,
        break_on_stoptags: bool,
        stop_big_traversals: bool,
    ) -> OxliResult<Vec<u64>> {
        let mut found = Vec::new();
        if !self.present(start) {
            return Ok(found);
        }
        let tags: BTreeSet<u64> = self.tags.lock().unwrap().clone();
        let mut visited = HashIntSet::default();
        let mut queue = VecDeque::new();
        let start_hash = start.canonical();
        visited.insert(start_hash);
        queue.push_back(*start);
        if tags.contains(&start_hash) {
            found.push(start_hash);
        }
        while let Some(kmer) = queue.pop_front() {
            if stop_big_traversals && visited.len() as u64 > BIG_TRAVERSAL_THRESHOLD {
                return Err(OxliError::TraversalAborted {
                    visited: visited.len() as u64,
                });
            }
            for next in self.neighbors(&kmer) {
                let hash = next.canonical();
                if break_on_stoptags && self.is_stop_tag(hash) {
                    continue;
                }
                if visited.insert(hash) {
                    if tags.contains(&hash) {
                        found.push(hash);
                    }
                    queue.push_back(next);
                }
            }
        }
        Ok(found)
    }

    pub fn save_tagset<P: AsRef<Path>>(&self, path: P) -> OxliResult<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        write_hash_file(&mut writer, FILETYPE_TAGSET, self.ksize(), &self.tags())
    }

    pub fn load_tagset<P: AsRef<Path>>(&self, path: P) -> OxliResult<()> {
        let hashes = self.read_hash_file(&path, FILETYPE_TAGSET, "tagset")?;
        let mut tags = self.tags.lock().unwrap();
        tags.extend(hashes);
        Ok(())
    }

    pub fn save_stoptags<P: AsRef<Path>>(&self, path: P) -> OxliResult<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        write_hash_file(
            &mut writer,
            FILETYPE_STOPTAGS,
            self.ksize(),
            &self.stop_tags(),
        )
    }

    pub fn load_stoptags<P: AsRef<Path>>(&self, path: P) -> OxliResult<()> {
        let hashes = self.read_hash_file(&path, FILETYPE_STOPTAGS, "stoptags")?;
        let mut stop_tags = self.stop_tags.lock().unwrap();
        stop_tags.extend(hashes);
        Ok(())
    }

    fn read_hash_file<P: AsRef<Path>>(
        &self,
        path: P,
        filetype: u8,
        filetype_name: &'static str,
    ) -> OxliResult<Vec<u64>> {
        let display = path.as_ref().display().to_string();
        let mut reader = BufReader::new(File::open(path)?);
        read_hash_file(&mut reader, filetype, self.ksize()).map_err(|e| match e {
            OxliError::BadFormat { reason, .. } => OxliError::BadFormat {
                filetype: filetype_name,
                path: display.clone(),
                reason,
            },
            other => other,
        })
    }
}

fn write_hash_file(
    writer: &mut dyn Write,
    filetype: u8,
    ksize: usize,
    hashes: &[u64],
) -> OxliResult<()> {
    writer.write_all(MAGIC)?;
    writer.write_u8(VERSION)?;
    writer.write_u8(filetype)?;
    writer.write_u32::<LittleEndian>(ksize as u32)?;
    writer.write_u64::<LittleEndian>(hashes.len() as u64)?;
    for &hash in hashes {
        writer.write_u64::<LittleEndian>(hash)?;
    }
    Ok(())
}

fn read_hash_file(reader: &mut dyn Read, filetype: u8, ksize: usize) -> OxliResult<Vec<u64>> {
    let bad = |reason: String| OxliError::BadFormat {
        filetype: "tagset",
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
    let found_type = reader.read_u8()?;
    if found_type != filetype {
        return Err(bad(format!("wrong filetype tag {}", found_type)));
    }
    let found_k = reader.read_u32::<LittleEndian>()? as usize;
    if found_k != ksize {
        return Err(bad(format!("k-mer size {} does not match {}", found_k, ksize)));
    }
    let count = reader.read_u64::<LittleEndian>()?;
    let mut hashes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        hashes.push(reader.read_u64::<LittleEndian>()?);
    }
    Ok(hashes)
}
