use std::collections::HashMap;
use std::hash::BuildHasherDefault;

use crate::errors::OxliResult;
use crate::graph::Graph;
use crate::hashing::{revcomp, HashIntMap, HashIntSet, Kmer, KmerWindows, NoHashHasher};

/// What one `update` did to the compact graph.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct UpdateStats {
    pub nodes_added: usize,
    pub edges_added: usize,
    pub edges_split: usize,
    pub edges_merged: usize,
}

/// A maximal non-branching path between decision nodes. `start`/`end` are
/// the canonical hashes of the flanking high-degree nodes, None at a tip.
/// The sequence spans flank to flank, so two adjacent decision nodes are
/// joined by a trivial edge of length k+1.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Edge {
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub sequence: Vec<u8>,
}

impl Edge {
    pub fn length(&self) -> usize {
        self.sequence.len()
    }
}

/// Streaming compact de Bruijn graph: nodes are the high-degree k-mers of
/// the underlying implicit graph, edges the linear segments between them,
/// both kept current as sequences stream in.
pub struct CompactDbg {
    graph: Graph,
    nodes: HashIntSet,
    edges: HashMap<u64, Edge, BuildHasherDefault<NoHashHasher>>,
    kmer_to_edge: HashIntMap<u64>,
    next_edge_id: u64,
}

impl CompactDbg {
    pub fn new(graph: Graph) -> Self {
        CompactDbg {
            graph,
            nodes: HashIntSet::default(),
            edges: HashMap::default(),
            kmer_to_edge: HashIntMap::default(),
            next_edge_id: 1,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn n_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn nodes(&self) -> Vec<u64> {
        let mut v: Vec<u64> = self.nodes.iter().copied().collect();
        v.sort_unstable();
        v
    }

    pub fn edges(&self) -> Vec<&Edge> {
        self.edges.values().collect()
    }

    /// Consume `sequence` into the sketch and fold the consequences into
    /// the compact graph.
    pub fn update(&mut self, sequence: &[u8]) -> OxliResult<UpdateStats> {
        let mut stats = UpdateStats::default();
        let k = self.graph.ksize();
        if self.graph.consume(sequence) == 0 {
            return Ok(stats);
        }

        // candidate decision nodes: the sequence's k-mers and their
        // immediate neighbors (a tip raises the degree of an off-sequence
        // predecessor)
        let mut candidates: Vec<Kmer> = Vec::new();
        let mut seen = HashIntSet::default();
        for (_, kmer) in KmerWindows::new(sequence, k) {
            if seen.insert(kmer.canonical()) {
                candidates.push(kmer);
            }
            for n in self.graph.neighbors(&kmer) {
                if seen.insert(n.canonical()) {
                    candidates.push(n);
                }
            }
        }

        let mut touched_nodes: Vec<Kmer> = Vec::new();
        for kmer in &candidates {
            let hash = kmer.canonical();
            if self.graph.kmer_degree(kmer) > 2 {
                if self.nodes.insert(hash) {
                    stats.nodes_added += 1;
                    if let Some(&eid) = self.kmer_to_edge.get(&hash) {
                        self.split_edge(eid, hash);
                        stats.edges_split += 1;
                    }
                }
                touched_nodes.push(*kmer);
            }
        }

        if touched_nodes.is_empty() {
            // a linear island: one segment covers the whole component
            if let Some((_, first)) = KmerWindows::new(sequence, k).next() {
                let segment = self.graph.assemble_linear_path(&first.to_bytes())?;
                self.insert_segment(segment, &mut stats);
            }
            return Ok(stats);
        }

        for hdn in touched_nodes {
            for (oriented, next) in self.walk_starts(&hdn) {
                let segment = self.walk_segment(&oriented, next, &mut stats);
                self.insert_segment(segment, &mut stats);
            }
        }
        Ok(stats)
    }

    /// Present extensions of `hdn`, each paired with the orientation of
    /// `hdn` that makes the step a right-extension.
    fn walk_starts(&self, hdn: &Kmer) -> Vec<(Kmer, Kmer)> {
        let mut starts = Vec::new();
        for base in 0..4 {
            let right = hdn.extend_right(base);
            if self.graph.get(right.canonical()) > 0 {
                starts.push((*hdn, right));
            }
            let left = hdn.rc().extend_right(base);
            if self.graph.get(left.canonical()) > 0 {
                starts.push((hdn.rc(), left));
            }
        }
        starts
    }

    /// Walk right from `from` through `first` until the next decision node
    /// or a dead end; returns the full flank-to-flank segment. Decision
    /// nodes discovered en route are registered on the spot.
    fn walk_segment(&mut self, from: &Kmer, first: Kmer, stats: &mut UpdateStats) -> Vec<u8> {
        let k = from.ksize();
        let mut segment = from.to_bytes();
        let mut visited = HashIntSet::default();
        visited.insert(from.canonical());
        let mut cur = first;
        loop {
            segment.extend_from_slice(&cur.to_bytes()[k - 1..]);
            let hash = cur.canonical();
            if !visited.insert(hash) {
                break;
            }
            if self.graph.kmer_degree(&cur) > 2 {
                if self.nodes.insert(hash) {
                    stats.nodes_added += 1;
                    if let Some(&eid) = self.kmer_to_edge.get(&hash) {
                        self.split_edge(eid, hash);
                        stats.edges_split += 1;
                    }
                }
                break;
            }
            let nexts: Vec<Kmer> = (0..4)
                .map(|b| cur.extend_right(b))
                .filter(|n| self.graph.get(n.canonical()) > 0)
                .collect();
            if nexts.len() != 1 {
                break;
            }
            cur = nexts[0];
        }
        segment
    }

    fn canonical_segment(mut segment: Vec<u8>) -> Vec<u8> {
        let rc = revcomp(&segment);
        if rc < segment {
            segment = rc;
        }
        segment
    }

    fn segment_interiors(&self, segment: &[u8]) -> Vec<u64> {
        KmerWindows::new(segment, self.graph.ksize())
            .map(|(_, kmer)| kmer.canonical())
            .filter(|h| !self.nodes.contains(h))
            .collect()
    }

    fn insert_segment(&mut self, segment: Vec<u8>, stats: &mut UpdateStats) {
        let k = self.graph.ksize();
        if segment.len() < k {
            return;
        }
        let segment = Self::canonical_segment(segment);
        let interiors = self.segment_interiors(&segment);

        let mut stale: Vec<u64> = interiors
            .iter()
            .filter_map(|h| self.kmer_to_edge.get(h).copied())
            .collect();
        stale.sort_unstable();
        stale.dedup();

        if stale.len() == 1 && self.edges[&stale[0]].sequence == segment {
            return;
        }
        for eid in &stale {
            self.remove_edge(*eid);
        }
        self.index_edge(segment);
        if stale.is_empty() {
            stats.edges_added += 1;
        } else if stale.len() >= 2 {
            stats.edges_merged += stale.len() - 1;
        }
    }

    fn index_edge(&mut self, segment: Vec<u8>) {
        let k = self.graph.ksize();
        let id = self.next_edge_id;
        self.next_edge_id += 1;
        for hash in self.segment_interiors(&segment) {
            self.kmer_to_edge.insert(hash, id);
        }
        let windows: Vec<u64> = KmerWindows::new(&segment, k)
            .map(|(_, kmer)| kmer.canonical())
            .collect();
        let start = windows.first().copied().filter(|h| self.nodes.contains(h));
        let end = windows.last().copied().filter(|h| self.nodes.contains(h));
        self.edges.insert(
            id,
            Edge {
                start,
                end,
                sequence: segment,
            },
        );
    }

    fn remove_edge(&mut self, id: u64) {
        if let Some(edge) = self.edges.remove(&id) {
            for hash in self.segment_interiors(&edge.sequence) {
                if self.kmer_to_edge.get(&hash) == Some(&id) {
                    self.kmer_to_edge.remove(&hash);
                }
            }
        }
    }

    /// Cut an edge at a freshly promoted decision node; both halves keep
    /// the node as their shared flank.
    fn split_edge(&mut self, id: u64, at: u64) {
        let k = self.graph.ksize();
        let edge = match self.edges.remove(&id) {
            Some(e) => e,
            None => return,
        };
        for hash in KmerWindows::new(&edge.sequence, k).map(|(_, kmer)| kmer.canonical()) {
            if self.kmer_to_edge.get(&hash) == Some(&id) {
                self.kmer_to_edge.remove(&hash);
            }
        }
        let pos = KmerWindows::new(&edge.sequence, k)
            .find(|(_, kmer)| kmer.canonical() == at)
            .map(|(p, _)| p);
        match pos {
            Some(pos) => {
                let left = edge.sequence[..pos + k].to_vec();
                let right = edge.sequence[pos..].to_vec();
                if left.len() > k {
                    self.index_edge(Self::canonical_segment(left));
                }
                if right.len() > k {
                    self.index_edge(Self::canonical_segment(right));
                }
            }
            None => {
                // node not on this edge after all; restore it
                self.index_edge(edge.sequence);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sketch::Sketch;

    const K: usize = 21;

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

    fn cdbg() -> CompactDbg {
        CompactDbg::new(Graph::new(Sketch::nodetable(K, 4, 400_000).unwrap()))
    }

    fn mutate_last(kmer: &[u8]) -> Vec<u8> {
        let mut out = kmer.to_vec();
        let last = out.len() - 1;
        out[last] = match out[last] {
            b'A' => b'C',
            b'C' => b'G',
            b'G' => b'T',
            _ => b'A',
        };
        out
    }

    #[test]
    fn test_linear_sequence_is_one_edge() {
        let mut dbg = cdbg();
        let seq = random_dna(200, 17);
        let stats = dbg.update(&seq).unwrap();
        assert_eq!(stats.nodes_added, 0);
        assert_eq!(stats.edges_added, 1);
        assert_eq!(stats.edges_split, 0);
        assert_eq!(dbg.n_nodes(), 0);
        assert_eq!(dbg.n_edges(), 1);

        let mut expect = seq.clone();
        let rc = revcomp(&seq);
        if rc < expect {
            expect = rc;
        }
        assert_eq!(dbg.edges()[0].sequence, expect);
        assert_eq!(dbg.edges()[0].start, None);
        assert_eq!(dbg.edges()[0].end, None);
    }

    #[test]
    fn test_short_input_is_noop() {
        let mut dbg = cdbg();
        let stats = dbg.update(b"ACGT").unwrap();
        assert_eq!(stats, UpdateStats::default());
        assert_eq!(dbg.n_edges(), 0);
    }

    #[test]
    fn test_tip_splits_edge() {
        let mut dbg = cdbg();
        let seq = random_dna(200, 29);
        dbg.update(&seq).unwrap();

        let s = 80;
        let tip = mutate_last(&seq[s + 1..s + 1 + K]);
        let stats = dbg.update(&tip).unwrap();
        assert_eq!(stats.nodes_added, 1);
        assert_eq!(stats.edges_split, 1);
        assert_eq!(stats.edges_added, 1);
        // one island became: left of the junction, right of it, and the tip
        assert_eq!(dbg.n_nodes(), 1);
        assert_eq!(dbg.n_edges(), 3);

        let hdn = Kmer::from_bytes(&seq[s..s + K], K).unwrap().canonical();
        assert_eq!(dbg.nodes(), vec![hdn]);
        for edge in dbg.edges() {
            assert!(edge.start == Some(hdn) || edge.end == Some(hdn));
        }
    }

    #[test]
    fn test_adjacent_hdns_trivial_edge() {
        let mut dbg = cdbg();
        let seq = random_dna(200, 53);
        dbg.update(&seq).unwrap();

        let s = 80;
        dbg.update(&mutate_last(&seq[s + 1..s + 1 + K])).unwrap();
        dbg.update(&mutate_last(&seq[s + 2..s + 2 + K])).unwrap();
        assert_eq!(dbg.n_nodes(), 2);

        let a = Kmer::from_bytes(&seq[s..s + K], K).unwrap().canonical();
        let b = Kmer::from_bytes(&seq[s + 1..s + 1 + K], K).unwrap().canonical();
        let trivial: Vec<&Edge> = dbg
            .edges()
            .into_iter()
            .filter(|e| e.length() == K + 1)
            .collect();
        assert!(trivial.iter().any(|e| {
            let ends = [e.start, e.end];
            ends.contains(&Some(a)) && ends.contains(&Some(b))
        }));
    }

    #[test]
    fn test_bridge_merges_islands() {
        let mut dbg = cdbg();
        let seq = random_dna(300, 61);
        dbg.update(&seq[..120]).unwrap();
        dbg.update(&seq[180..]).unwrap();
        assert_eq!(dbg.n_edges(), 2);

        let stats = dbg.update(&seq[100..200]).unwrap();
        assert_eq!(stats.edges_merged, 1);
        assert_eq!(dbg.n_edges(), 1);
        assert_eq!(dbg.n_nodes(), 0);

        let mut expect = seq.clone();
        let rc = revcomp(&seq);
        if rc < expect {
            expect = rc;
        }
        assert_eq!(dbg.edges()[0].sequence, expect);
    }

    #[test]
    fn test_repeated_update_is_stable() {
        let mut dbg = cdbg();
        let seq = random_dna(200, 71);
        dbg.update(&seq).unwrap();
        let stats = dbg.update(&seq).unwrap();
        assert_eq!(stats, UpdateStats::default());
        assert_eq!(dbg.n_edges(), 1);
    }
}
