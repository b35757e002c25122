use std::path::Path;

use rayon::prelude::*;

#[macro_use]
pub mod errors;
pub mod cdbg;
pub mod graph;
pub mod hashing;
pub mod hll;
pub mod parser;
pub mod partition;
pub mod sketch;
pub mod storage;
pub mod streaming;

pub use crate::cdbg::{CompactDbg, UpdateStats};
pub use crate::graph::Graph;
pub use crate::hll::HllCounter;
pub use crate::parser::{BrokenPairedReader, ReadParser, Record};
pub use crate::partition::SubsetPartition;
pub use crate::sketch::Sketch;
pub use crate::storage::BackendKind;
pub use crate::streaming::StreamingPartitioner;

use crate::errors::OxliResult;

/// Bases between waypoint tags along a consumed sequence.
pub const TAG_DENSITY: usize = 40;

/// Saturation point of the byte-counter tables.
pub const MAX_KCOUNT: u64 = 255;

/// Upper bin of abundance histograms and the bigcount serialization cap.
pub const MAX_BIGCOUNT: u64 = 65_535;

/// Collision rate past which trimming refuses to trust the sketch.
pub const MAX_FALSE_POSITIVE_RATE: f64 = 0.8;

/// Node cap for traversals that opt into the too-big bailout.
pub const BIG_TRAVERSAL_THRESHOLD: u64 = 1_000_000;

/// Default byte-range block size for the parallel file consumers.
pub const DEFAULT_BLOCKSIZE: u64 = 1 << 20;

/// Consume one file per rayon worker into freshly built sketches of the
/// same shape. For threading within a single file, see
/// `Sketch::consume_seqfile_parallel`.
pub fn consume_files<P: AsRef<Path> + Sync>(
    paths: &[P],
    kind: BackendKind,
    ksize: usize,
    n_tables: usize,
    max_tablesize: u64,
) -> OxliResult<Vec<Sketch>> {
    paths
        .par_iter()
        .map(|path| {
            let sketch = match kind {
                BackendKind::Qf => Sketch::qftable(ksize, max_tablesize)?,
                _ => {
                    let sizes = hashing::get_n_primes_near_x(n_tables, max_tablesize)?;
                    Sketch::new(kind, ksize, &sizes)?
                }
            };
            sketch.consume_seqfile(path)?;
            Ok(sketch)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_consume_files_one_sketch_per_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for (i, seq) in [b"ACGTACGTACGTACGT", b"TTTTTTTTTTTTTTTT"].iter().enumerate() {
            let path = dir.path().join(format!("reads{}.fa", i));
            let mut f = std::fs::File::create(&path).unwrap();
            writeln!(f, ">r0").unwrap();
            f.write_all(*seq).unwrap();
            writeln!(f).unwrap();
            paths.push(path);
        }
        let sketches = consume_files(&paths, BackendKind::Byte, 8, 2, 1000).unwrap();
        assert_eq!(sketches.len(), 2);
        // ACGTACGT occurs at offsets 0, 4 and 8
        assert_eq!(sketches[0].get_kmer(b"ACGTACGT").unwrap(), 3);
        assert_eq!(sketches[1].get_kmer(b"AAAAAAAA").unwrap(), 9);
    }
}
