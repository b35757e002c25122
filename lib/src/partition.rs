use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::errors::{OxliError, OxliResult};
use crate::graph::Graph;
use crate::hashing::{HashIntMap, HashIntSet, Kmer};
use crate::sketch::Sketch;

/// Bounded-excursion defaults for knot detection.
pub const EXCURSION_DISTANCE: usize = 40;
pub const EXCURSION_KMER_THRESHOLD: u64 = 200;
pub const EXCURSION_KMER_COUNT_THRESHOLD: u64 = 2;

/// Tag-keyed union-find with path compression. Roots are tags; stable
/// small partition ids are only assigned when a map is exported.
struct UnionFind {
    parent: HashIntMap<u64>,
}

impl UnionFind {
    fn new() -> Self {
        UnionFind {
            parent: HashIntMap::default(),
        }
    }

    fn contains(&self, tag: u64) -> bool {
        self.parent.contains_key(&tag)
    }

    fn find(&mut self, tag: u64) -> u64 {
        let mut root = tag;
        loop {
            match self.parent.get(&root) {
                None => {
                    self.parent.insert(tag, tag);
                    return tag;
                }
                Some(&p) if p == root => break,
                Some(&p) => root = p,
            }
        }
        // compress the chain we just walked
        let mut cur = tag;
        while cur != root {
            let next = self.parent[&cur];
            self.parent.insert(cur, root);
            cur = next;
        }
        root
    }

    fn union(&mut self, a: u64, b: u64) -> u64 {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            let (keep, absorb) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent.insert(absorb, keep);
            return keep;
        }
        ra
    }

    fn roots(&mut self) -> Vec<u64> {
        let tags: Vec<u64> = self.parent.keys().copied().collect();
        let mut roots: Vec<u64> = tags.into_iter().map(|t| self.find(t)).collect();
        roots.sort_unstable();
        roots.dedup();
        roots
    }
}

/// Summary of one `do_subset_partition` run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SubsetStats {
    pub n_tags_examined: usize,
    pub n_too_big: usize,
}

/// A partial partitioning of a graph's tag set: connected tags share a
/// union-find root. Subsets over disjoint tag ranges can be computed
/// independently and merged afterwards.
pub struct SubsetPartition {
    uf: Mutex<UnionFind>,
    too_big: Mutex<HashIntSet>,
}

impl Default for SubsetPartition {
    fn default() -> Self {
        SubsetPartition::new()
    }
}

impl SubsetPartition {
    pub fn new() -> Self {
        SubsetPartition {
            uf: Mutex::new(UnionFind::new()),
            too_big: Mutex::new(HashIntSet::default()),
        }
    }

    /// Partition every tag of `graph` in `[start, end)` (`end == 0` means
    /// unbounded) by BFS over the implicit graph. A traversal that hits
    /// the size cap marks its tag too-big and leaves partition state
    /// untouched.
    pub fn do_subset_partition(
        &self,
        graph: &Graph,
        start: u64,
        end: u64,
        break_on_stoptags: bool,
        stop_big_traversals: bool,
    ) -> OxliResult<SubsetStats> {
        let ksize = graph.ksize();
        let mut stats = SubsetStats::default();
        for tag in graph.tags_in_range(start, end) {
            stats.n_tags_examined += 1;
            if self.uf.lock().unwrap().contains(tag) {
                continue;
            }
            let seed = Kmer::from_hash(tag, ksize);
            match graph.find_connected_tags(&seed, break_on_stoptags, stop_big_traversals) {
                Ok(connected) => {
                    let mut uf = self.uf.lock().unwrap();
                    uf.find(tag);
                    for other in connected {
                        uf.union(tag, other);
                    }
                }
                Err(OxliError::TraversalAborted { .. }) => {
                    stats.n_too_big += 1;
                    self.too_big.lock().unwrap().insert(tag);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(stats)
    }

    pub fn assign(&self, a: u64, b: u64) {
        self.uf.lock().unwrap().union(a, b);
    }

    /// Partition id of `tag`, or None if it was never partitioned. Ids are
    /// 1-based and stable for a given final map, not across merges.
    pub fn partition_id(&self, tag: u64) -> Option<u64> {
        let mut uf = self.uf.lock().unwrap();
        if !uf.contains(tag) {
            return None;
        }
        let root = uf.find(tag);
        let roots = uf.roots();
        roots.iter().position(|&r| r == root).map(|i| i as u64 + 1)
    }

    pub fn n_partitions(&self) -> usize {
        self.uf.lock().unwrap().roots().len()
    }

    pub fn n_too_big(&self) -> usize {
        self.too_big.lock().unwrap().len()
    }

    /// (tag, partition id) pairs, tag-sorted, ids 1-based in root order.
    pub fn partition_map(&self) -> Vec<(u64, u64)> {
        let mut uf = self.uf.lock().unwrap();
        let roots = uf.roots();
        let mut tags: Vec<u64> = uf.parent.keys().copied().collect();
        tags.sort_unstable();
        tags.into_iter()
            .map(|t| {
                let root = uf.find(t);
                let id = roots.binary_search(&root).map(|i| i as u64 + 1).unwrap_or(0);
                (t, id)
            })
            .collect()
    }

    /// Union another subset into this one. Tags sharing a partition id in
    /// `other` end up sharing a root here; idempotent and order-free.
    pub fn merge(&self, other: &SubsetPartition) {
        self.merge_pairs(&other.partition_map());
        let theirs = other.too_big.lock().unwrap();
        self.too_big.lock().unwrap().extend(theirs.iter().copied());
    }

    fn merge_pairs(&self, pairs: &[(u64, u64)]) {
        let mut uf = self.uf.lock().unwrap();
        let mut first_by_id: HashIntMap<u64> = HashIntMap::default();
        for &(tag, id) in pairs {
            if id == 0 {
                // 0 marks an unpartitioned tag; register it on its own
                uf.find(tag);
                continue;
            }
            match first_by_id.get(&id) {
                Some(&first) => {
                    uf.union(first, tag);
                }
                None => {
                    uf.find(tag);
                    first_by_id.insert(id, tag);
                }
            }
        }
    }

    pub fn save_pmap<P: AsRef<Path>>(&self, path: P) -> OxliResult<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        let pairs = self.partition_map();
        writer.write_u64::<LittleEndian>(pairs.len() as u64)?;
        for (tag, id) in pairs {
            writer.write_u64::<LittleEndian>(tag)?;
            writer.write_u64::<LittleEndian>(id)?;
        }
        Ok(())
    }

    /// Merge a `.pmap` file into this subset. Loading several files yields
    /// the same final map in any order.
    pub fn load_pmap<P: AsRef<Path>>(&self, path: P) -> OxliResult<()> {
        let mut reader = BufReader::new(File::open(path)?);
        let n_pairs = reader.read_u64::<LittleEndian>()?;
        let mut pairs = Vec::with_capacity(n_pairs as usize);
        for _ in 0..n_pairs {
            let tag = reader.read_u64::<LittleEndian>()?;
            let id = reader.read_u64::<LittleEndian>()?;
            pairs.push((tag, id));
        }
        self.merge_pairs(&pairs);
        Ok(())
    }

    /// Knot detection: from every tag of the largest partition, run a
    /// depth-bounded BFS while counting per-k-mer visits in `counts`.
    /// When an excursion covers more than `kmer_threshold` unique nodes,
    /// the k-mers it visited at least `count_threshold` times become stop
    /// tags. Returns the number of stop tags added.
    pub fn find_stoptags_by_excursion(
        &self,
        graph: &Graph,
        counts: &Sketch,
        distance: usize,
        kmer_threshold: u64,
        count_threshold: u64,
    ) -> OxliResult<usize> {
        if counts.ksize() != graph.ksize() {
            return Err(OxliError::IncompatibleSketch(format!(
                "visit counter has k={}, expected {}",
                counts.ksize(),
                graph.ksize()
            )));
        }
        let largest = match self.largest_partition_tags() {
            Some(tags) => tags,
            None => return Ok(0),
        };
        let before = graph.n_stop_tags();
        for tag in largest {
            let seed = Kmer::from_hash(tag, graph.ksize());
            let visited = bounded_excursion(graph, &seed, distance);
            if visited.len() as u64 <= kmer_threshold {
                continue;
            }
            for &hash in &visited {
                if counts.add(hash) >= count_threshold {
                    graph.add_stop_tag(hash);
                }
            }
        }
        Ok(graph.n_stop_tags() - before)
    }

    fn largest_partition_tags(&self) -> Option<Vec<u64>> {
        let mut uf = self.uf.lock().unwrap();
        let tags: Vec<u64> = uf.parent.keys().copied().collect();
        let mut by_root: HashIntMap<Vec<u64>> = HashIntMap::default();
        for tag in tags {
            let root = uf.find(tag);
            by_root.entry(root).or_insert_with(Vec::new).push(tag);
        }
        by_root.into_iter().map(|(_, v)| v).max_by_key(Vec::len)
    }
}

/// Unique canonical hashes within `distance` BFS steps of `seed`.
fn bounded_excursion(graph: &Graph, seed: &Kmer, distance: usize) -> HashIntSet {
    let mut visited = HashIntSet::default();
    if graph.get(seed.canonical()) == 0 {
        return visited;
    }
    let mut queue = VecDeque::new();
    visited.insert(seed.canonical());
    queue.push_back((*seed, 0usize));
    while let Some((kmer, depth)) = queue.pop_front() {
        if depth >= distance {
            continue;
        }
        for next in graph.neighbors(&kmer) {
            if visited.insert(next.canonical()) {
                queue.push_back((next, depth + 1));
            }
        }
    }
    visited
}
