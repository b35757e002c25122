use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;

use oxli::hashing::revcomp;
use oxli::{BackendKind, Graph, HllCounter, Sketch, StreamingPartitioner};

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

fn write_fastq(dir: &tempfile::TempDir, name: &str, reads: &[Vec<u8>]) -> PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    for (i, read) in reads.iter().enumerate() {
        writeln!(
            file,
            "@read{}\n{}\n+\n{}",
            i,
            String::from_utf8_lossy(read),
            "I".repeat(read.len())
        )
        .unwrap();
    }
    path
}

#[test]
fn banded_passes_union_to_full_pass() {
    let dir = tempfile::tempdir().unwrap();
    let reads: Vec<Vec<u8>> = (0..50).map(|i| random_dna(80, 1000 + i)).collect();
    let path = write_fastq(&dir, "banding-reads.fq", &reads);

    let full = Sketch::counttable(21, 3, 50_000).unwrap();
    full.consume_seqfile(&path).unwrap();

    let banded = Sketch::counttable(21, 3, 50_000).unwrap();
    for band in 0..4 {
        banded.consume_seqfile_banding(&path, 4, band).unwrap();
    }
    assert_eq!(
        full.storage().table_bytes(),
        banded.storage().table_bytes()
    );
    assert!(full == banded);
}

#[test]
fn parallel_consume_matches_sequential() {
    let dir = tempfile::tempdir().unwrap();
    let reads: Vec<Vec<u8>> = (0..200).map(|i| random_dna(100, 5000 + i)).collect();
    let path = write_fastq(&dir, "reads.fq", &reads);

    let sequential = Sketch::counttable(21, 3, 100_000).unwrap();
    let (n_reads, n_kmers) = sequential.consume_seqfile(&path).unwrap();
    assert_eq!(n_reads, 200);
    assert_eq!(n_kmers, 200 * 80);

    let parallel = Sketch::counttable(21, 3, 100_000).unwrap();
    let (p_reads, p_kmers) = parallel.consume_seqfile_parallel(&path, 4096).unwrap();
    assert_eq!((p_reads, p_kmers), (n_reads, n_kmers));
    assert!(sequential == parallel);
}

#[test]
fn assembly_recovers_genome_from_any_seed() {
    // a 500 bp "genome" consumed at k=21; every seed lands on one path
    let genome = random_dna(500, 424_242);
    let graph = Graph::new(Sketch::nodetable(21, 4, 400_000).unwrap());
    graph.consume(&genome);

    let mut expect = genome.clone();
    let rc = revcomp(&genome);
    if rc < expect {
        expect = rc;
    }
    let mut i = 0;
    while i + 21 <= genome.len() {
        let contig = graph.assemble_linear_path(&genome[i..i + 21]).unwrap();
        assert_eq!(contig, expect);
        i += 150;
    }
}

#[test]
fn streaming_partitioner_counts_components() {
    let graph = Graph::new(Sketch::nodetable(21, 4, 500_000).unwrap());
    let sp = StreamingPartitioner::new(&graph);
    let a = random_dna(500, 8_675_309);
    let b = random_dna(500, 1_234_567);

    sp.consume(&a).unwrap();
    sp.consume(&b).unwrap();
    assert_eq!(sp.n_components(), 2);

    let mut joined = a.clone();
    joined.extend_from_slice(&b);
    sp.consume(&joined).unwrap();
    assert_eq!(sp.n_components(), 1);
}

#[test]
fn hll_estimate_tracks_distinct_kmers() {
    let dir = tempfile::tempdir().unwrap();
    let reads: Vec<Vec<u8>> = (0..100).map(|i| random_dna(60, 31_337 + i)).collect();
    let path = write_fastq(&dir, "random-20.fq", &reads);

    let mut truth: HashSet<Vec<u8>> = HashSet::new();
    for read in &reads {
        for window in read.windows(20) {
            let rc = revcomp(window);
            truth.insert(std::cmp::min(window.to_vec(), rc));
        }
    }

    let mut hll = HllCounter::new(0.01, 20).unwrap();
    let (n_reads, n_kmers) = hll.consume_seqfile(&path).unwrap();
    assert_eq!(n_reads, 100);
    assert_eq!(n_kmers, 100 * 41);

    let expected = truth.len() as f64;
    let estimate = hll.estimate_cardinality() as f64;
    assert!(
        (estimate - expected).abs() / expected <= 0.02,
        "estimate {} vs {} distinct",
        estimate,
        expected
    );
}

#[test]
fn end_to_end_count_save_load_trim() {
    let dir = tempfile::tempdir().unwrap();
    let genome = random_dna(300, 99);
    // 30 reads sampled from the genome plus one error-laden read
    let mut reads: Vec<Vec<u8>> = (0..30)
        .map(|i| genome[(i * 7) % 200..(i * 7) % 200 + 100].to_vec())
        .collect();
    let mut noisy = genome[..50].to_vec();
    noisy.extend_from_slice(&random_dna(50, 777_777));
    reads.push(noisy.clone());
    let path = write_fastq(&dir, "sample.fq", &reads);

    let sketch = Sketch::with_memory(BackendKind::Byte, 21, 4, 1_000_000).unwrap();
    sketch.consume_seqfile(&path).unwrap();
    sketch.check_fp_rate(0.15).unwrap();

    let saved = dir.path().join("sample.ct");
    sketch.save(&saved).unwrap();
    let loaded = Sketch::load(&saved).unwrap();
    assert!(loaded == sketch);

    // genomic k-mers are well covered, the noisy tail is singleton
    let (prefix, pos) = loaded.trim_on_abundance(&noisy, 2);
    assert!(pos < noisy.len());
    assert!(pos >= 50 - 21);
    assert_eq!(prefix, &noisy[..pos]);
}
