use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::errors::{OxliError, OxliResult};
use crate::graph::Graph;
use crate::hashing::{HashIntMap, HashIntSet, Kmer, KmerWindows};

struct ComponentMap {
    tag_to_component: HashIntMap<u64>,
    components: BTreeMap<u64, BTreeSet<u64>>,
    next_id: u64,
}

impl ComponentMap {
    fn new() -> Self {
        ComponentMap {
            tag_to_component: HashIntMap::default(),
            components: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn assign(&mut self, tags: &[u64], id: u64) {
        let members = self.components.entry(id).or_insert_with(BTreeSet::new);
        for &tag in tags {
            members.insert(tag);
            self.tag_to_component.insert(tag, id);
        }
    }

    fn merge_into(&mut self, winner: u64, losers: &[u64]) {
        for &loser in losers {
            if loser == winner {
                continue;
            }
            if let Some(members) = self.components.remove(&loser) {
                for tag in members {
                    self.tag_to_component.insert(tag, winner);
                    self.components
                        .entry(winner)
                        .or_insert_with(BTreeSet::new)
                        .insert(tag);
                }
            }
        }
    }
}

/// Incremental partitioner: reads are tagged as they stream in and their
/// tags are folded into connected components on the spot, instead of the
/// offline tag-then-partition pass.
///
/// Component ids are 1-based and stable until a merge retires them; output
/// is deterministic under a single-threaded feed.
pub struct StreamingPartitioner<'a> {
    graph: &'a Graph,
    inner: RwLock<ComponentMap>,
}

#[derive(Serialize, Deserialize)]
struct ComponentRecord {
    component_id: u64,
    tags: Vec<u64>,
}

#[derive(Serialize, Deserialize)]
struct SidecarState {
    graph: String,
    n_components: usize,
    components: Vec<ComponentRecord>,
}

impl<'a> StreamingPartitioner<'a> {
    pub fn new(graph: &'a Graph) -> Self {
        StreamingPartitioner {
            graph,
            inner: RwLock::new(ComponentMap::new()),
        }
    }

    pub fn graph(&self) -> &Graph {
        self.graph
    }

    /// Consume one read and fold its tags into the component map.
    /// Returns the component id the read landed in, or None for a read
    /// with no valid k-mers.
    pub fn consume(&self, sequence: &[u8]) -> OxliResult<Option<u64>> {
        let (_, read_tags) = self.graph.consume_and_tag(sequence);
        if read_tags.is_empty() {
            return Ok(None);
        }
        // every tag reachable from this read, existing ones included; an
        // ambiguous base splits the read, so seed one BFS per contiguous
        // run of valid windows
        let mut connected = Vec::new();
        let mut last_pos: Option<usize> = None;
        for (pos, kmer) in KmerWindows::new(sequence, self.graph.ksize()) {
            let fresh = match last_pos {
                None => true,
                Some(p) => pos > p + 1,
            };
            if fresh {
                connected.extend(self.graph.find_connected_tags(&kmer, false, false)?);
            }
            last_pos = Some(pos);
        }
        Ok(Some(self.fold(&read_tags, &connected)))
    }

    /// Consume both mates; their components are merged even when the two
    /// sequences share no k-mer.
    pub fn consume_pair(&self, r1: &[u8], r2: &[u8]) -> OxliResult<Option<u64>> {
        let first = self.consume(r1)?;
        let second = self.consume(r2)?;
        match (first, second) {
            (Some(a), Some(b)) if a != b => {
                let winner = a.min(b);
                let mut inner = self.inner.write().unwrap();
                inner.merge_into(winner, &[a.max(b)]);
                Ok(Some(winner))
            }
            (Some(a), _) => Ok(Some(a)),
            (None, b) => Ok(b),
        }
    }

    fn fold(&self, read_tags: &[u64], connected: &[u64]) -> u64 {
        let mut inner = self.inner.write().unwrap();
        let mut existing = BTreeSet::new();
        for tag in read_tags.iter().chain(connected) {
            if let Some(&id) = inner.tag_to_component.get(tag) {
                existing.insert(id);
            }
        }
        let id = match existing.iter().next() {
            None => {
                let id = inner.next_id;
                inner.next_id += 1;
                id
            }
            Some(&smallest) => {
                let losers: Vec<u64> = existing.iter().skip(1).copied().collect();
                inner.merge_into(smallest, &losers);
                smallest
            }
        };
        inner.assign(read_tags, id);
        inner.assign(connected, id);
        id
    }

    pub fn n_components(&self) -> usize {
        self.inner.read().unwrap().components.len()
    }

    /// (component id, sorted tags) in id order.
    pub fn components(&self) -> Vec<(u64, Vec<u64>)> {
        self.inner
            .read()
            .unwrap()
            .components
            .iter()
            .map(|(&id, tags)| (id, tags.iter().copied().collect()))
            .collect()
    }

    pub fn tag_components(&self) -> Vec<(u64, u64)> {
        let inner = self.inner.read().unwrap();
        let mut pairs: Vec<(u64, u64)> = inner
            .tag_to_component
            .iter()
            .map(|(&tag, &id)| (tag, id))
            .collect();
        pairs.sort_unstable();
        pairs
    }

    pub fn component_of_tag(&self, tag: u64) -> Option<u64> {
        self.inner.read().unwrap().tag_to_component.get(&tag).copied()
    }

    /// Component of the tag nearest to `kmer` by BFS distance, if any is
    /// reachable.
    pub fn get_nearest_component(&self, kmer: &[u8]) -> OxliResult<Option<u64>> {
        let seed = Kmer::from_bytes(kmer, self.graph.ksize())?;
        if self.graph.get(seed.canonical()) == 0 {
            return Ok(None);
        }
        let inner = self.inner.read().unwrap();
        if let Some(&id) = inner.tag_to_component.get(&seed.canonical()) {
            return Ok(Some(id));
        }
        let mut visited = HashIntSet::default();
        let mut queue = VecDeque::new();
        visited.insert(seed.canonical());
        queue.push_back(seed);
        while let Some(kmer) = queue.pop_front() {
            for next in self.graph.neighbors(&kmer) {
                let hash = next.canonical();
                if !visited.insert(hash) {
                    continue;
                }
                if let Some(&id) = inner.tag_to_component.get(&hash) {
                    return Ok(Some(id));
                }
                queue.push_back(next);
            }
        }
        Ok(None)
    }

    /// Tab-separated component table: id, tag count, comma-joined tags.
    pub fn write_components<P: AsRef<Path>>(&self, path: P) -> OxliResult<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        for (id, tags) in self.components() {
            let joined = tags
                .iter()
                .map(u64::to_string)
                .collect::<Vec<_>>()
                .join(",");
            writeln!(writer, "{}\t{}\t{}", id, tags.len(), joined)?;
        }
        Ok(())
    }

    /// JSON sidecar carrying the component map plus the path of the sketch
    /// it belongs to.
    pub fn save_json<P: AsRef<Path>>(&self, path: P, graph_path: &str) -> OxliResult<()> {
        let state = SidecarState {
            graph: graph_path.to_owned(),
            n_components: self.n_components(),
            components: self
                .components()
                .into_iter()
                .map(|(component_id, tags)| ComponentRecord { component_id, tags })
                .collect(),
        };
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, &state)?;
        Ok(())
    }

    /// Restore a component map saved by `save_json`. Returns the sketch
    /// path recorded in the sidecar.
    pub fn load_json<P: AsRef<Path>>(&self, path: P) -> OxliResult<String> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let state: SidecarState = serde_json::from_reader(reader)?;
        if state.n_components != state.components.len() {
            return Err(OxliError::BadFormat {
                filetype: "components",
                path: path.display().to_string(),
                reason: format!(
                    "n_components {} does not match {} component records",
                    state.n_components,
                    state.components.len()
                ),
            });
        }
        let mut inner = self.inner.write().unwrap();
        *inner = ComponentMap::new();
        for record in state.components {
            inner.next_id = inner.next_id.max(record.component_id + 1);
            inner.assign(&record.tags, record.component_id);
        }
        Ok(state.graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sketch::Sketch;

    fn random_dna(len: usize, mut state: u64) -> Vec<u8> {
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                b"ACGT"[(state & 3) as usize]
            })
            .collect()
    }

    fn nodegraph() -> Graph {
        Graph::new(Sketch::nodetable(21, 4, 400_000).unwrap())
    }

    #[test]
    fn test_two_reads_two_components_then_one() {
        let graph = nodegraph();
        let sp = StreamingPartitioner::new(&graph);
        let a = random_dna(500, 21);
        let b = random_dna(500, 900_000_001);

        sp.consume(&a).unwrap();
        sp.consume(&b).unwrap();
        assert_eq!(sp.n_components(), 2);

        // the concatenation bridges both
        let mut bridge = a.clone();
        bridge.extend_from_slice(&b);
        sp.consume(&bridge).unwrap();
        assert_eq!(sp.n_components(), 1);
    }

    #[test]
    fn test_overlapping_reads_share_component() {
        let graph = nodegraph();
        let sp = StreamingPartitioner::new(&graph);
        let a = random_dna(400, 7);
        let id1 = sp.consume(&a).unwrap().unwrap();
        // overlap of 100 bases, far past k-1
        let id2 = sp.consume(&a[300..]).unwrap().unwrap();
        assert_eq!(id1, id2);
        assert_eq!(sp.n_components(), 1);
    }

    #[test]
    fn test_segments_after_ambiguity_still_connect() {
        let graph = nodegraph();
        let sp = StreamingPartitioner::new(&graph);
        let a = random_dna(300, 61);
        sp.consume(&a).unwrap();
        assert_eq!(sp.n_components(), 1);

        // the shared k-mers all sit past a mid-read N
        let mut read = random_dna(100, 5_000_017);
        read.push(b'N');
        read.extend_from_slice(&a[50..150]);
        sp.consume(&read).unwrap();
        assert_eq!(sp.n_components(), 1);
    }

    #[test]
    fn test_bridge_overlap_boundary() {
        let k = 21;
        let graph = nodegraph();
        let sp = StreamingPartitioner::new(&graph);
        let a = random_dna(200, 101);
        let b = random_dna(200, 909_090);
        sp.consume(&a).unwrap();
        sp.consume(&b).unwrap();
        assert_eq!(sp.n_components(), 2);

        // k-2 bases of flank never touch a k-mer of either read
        let mut short = a[a.len() - (k - 2)..].to_vec();
        short.extend_from_slice(&random_dna(60, 3_333));
        short.extend_from_slice(&b[..k - 2]);
        sp.consume(&short).unwrap();
        assert_eq!(sp.n_components(), 3);

        // k-1 bases of flank adjoin the last/first k-mers of both reads
        let mut bridge = a[a.len() - (k - 1)..].to_vec();
        bridge.extend_from_slice(&random_dna(60, 4_444));
        bridge.extend_from_slice(&b[..k - 1]);
        sp.consume(&bridge).unwrap();
        assert_eq!(sp.n_components(), 2);
    }

    #[test]
    fn test_every_tag_in_exactly_one_component() {
        let graph = nodegraph();
        let sp = StreamingPartitioner::new(&graph);
        for seed in [3u64, 5, 7, 11] {
            sp.consume(&random_dna(300, seed)).unwrap();
        }
        let pairs = sp.tag_components();
        assert_eq!(pairs.len(), graph.n_tags());
        let components = sp.components();
        let total: usize = components.iter().map(|(_, tags)| tags.len()).sum();
        assert_eq!(total, pairs.len());
    }

    #[test]
    fn test_consume_pair_merges_disjoint_mates() {
        let graph = nodegraph();
        let sp = StreamingPartitioner::new(&graph);
        let r1 = random_dna(300, 41);
        let r2 = random_dna(300, 43_000_000);
        let id = sp.consume_pair(&r1, &r2).unwrap().unwrap();
        assert_eq!(sp.n_components(), 1);
        assert_eq!(sp.components()[0].0, id);
    }

    #[test]
    fn test_read_without_kmers_is_none() {
        let graph = nodegraph();
        let sp = StreamingPartitioner::new(&graph);
        assert!(sp.consume(b"ACGT").unwrap().is_none());
        assert_eq!(sp.n_components(), 0);
    }

    #[test]
    fn test_nearest_component() {
        let graph = nodegraph();
        let sp = StreamingPartitioner::new(&graph);
        let a = random_dna(300, 17);
        let id = sp.consume(&a).unwrap().unwrap();

        // an untagged k-mer in the middle of the read still resolves
        let probe = &a[100..121];
        assert_eq!(sp.get_nearest_component(probe).unwrap(), Some(id));
        // an absent k-mer resolves to nothing
        let absent = random_dna(21, 999_999_999);
        assert_eq!(sp.get_nearest_component(&absent).unwrap(), None);
    }

    #[test]
    fn test_json_roundtrip() {
        let graph = nodegraph();
        let sp = StreamingPartitioner::new(&graph);
        sp.consume(&random_dna(300, 29)).unwrap();
        sp.consume(&random_dna(300, 500_000)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("components.json");
        sp.save_json(&path, "graph.ct").unwrap();

        let restored = StreamingPartitioner::new(&graph);
        let graph_path = restored.load_json(&path).unwrap();
        assert_eq!(graph_path, "graph.ct");
        assert_eq!(restored.components(), sp.components());
        assert_eq!(restored.n_components(), sp.n_components());
    }

    #[test]
    fn test_write_components_table() {
        let graph = nodegraph();
        let sp = StreamingPartitioner::new(&graph);
        sp.consume(&random_dna(300, 47)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("components.tsv");
        sp.write_components(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let line = text.lines().next().unwrap();
        let fields: Vec<&str> = line.split('\t').collect();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0], "1");
    }
}
