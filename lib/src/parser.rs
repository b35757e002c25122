use std::fs::File;
use std::path::Path;
use std::sync::Mutex;

use memmap::{Mmap, MmapOptions};
use needletail::parse_fastx_file;
use needletail::parser::FastxReader;
use rayon::iter::{ParallelBridge, ParallelIterator};

use crate::errors::{OxliError, OxliResult};

/// One sequencing read as it flows through the pipeline.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Record {
    pub name: Vec<u8>,
    pub sequence: Vec<u8>,
    pub quality: Option<Vec<u8>>,
}

impl Record {
    /// Uppercase the sequence and map N to A, the form the sketches expect.
    pub fn clean_sequence(&mut self) {
        for b in self.sequence.iter_mut() {
            *b = match b.to_ascii_uppercase() {
                b'N' => b'A',
                other => other,
            };
        }
    }
}

/// Pair-number suffix conventions: `name/1`-`name/2` and Illumina
/// `name 1:...`-`name 2:...`.
fn split_name(name: &[u8]) -> (&[u8], Option<u8>) {
    if let Some(space) = name.iter().position(|&b| b == b' ') {
        let rest = &name[space + 1..];
        if rest.len() >= 2 && rest[1] == b':' && (rest[0] == b'1' || rest[0] == b'2') {
            return (&name[..space], Some(rest[0] - b'0'));
        }
        return (&name[..space], None);
    }
    if name.len() >= 2 && name[name.len() - 2] == b'/' {
        let last = name[name.len() - 1];
        if last == b'1' || last == b'2' {
            return (&name[..name.len() - 2], Some(last - b'0'));
        }
    }
    (name, None)
}

/// True when `r1`/`r2` are the two halves of one fragment by naming
/// convention.
pub fn check_is_pair(r1: &Record, r2: &Record) -> bool {
    let (base1, num1) = split_name(&r1.name);
    let (base2, num2) = split_name(&r2.name);
    base1 == base2 && num1 == Some(1) && num2 == Some(2)
}

struct ParserInner {
    reader: Box<dyn FastxReader>,
    n_reads: u64,
    n_errors: u64,
    done: bool,
}

/// Threadsafe FASTA/FASTQ reader. Compression (gzip, bzip2) is detected by
/// content. Many workers may pull records from one parser; each `next_record`
/// hands out one read under the lock.
pub struct ReadParser {
    inner: Mutex<ParserInner>,
}

impl ReadParser {
    pub fn from_path<P: AsRef<Path>>(path: P) -> OxliResult<Self> {
        let reader = parse_fastx_file(path)?;
        Ok(ReadParser {
            inner: Mutex::new(ParserInner {
                reader,
                n_reads: 0,
                n_errors: 0,
                done: false,
            }),
        })
    }

    pub fn next_record(&self) -> OxliResult<Option<Record>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.done {
            return Ok(None);
        }
        match inner.reader.next() {
            None => {
                inner.done = true;
                Ok(None)
            }
            Some(Ok(rec)) => {
                let record = Record {
                    name: rec.id().to_vec(),
                    sequence: rec.seq().to_vec(),
                    quality: rec.qual().map(|q| q.to_vec()),
                };
                drop(rec);
                inner.n_reads += 1;
                Ok(Some(record))
            }
            Some(Err(e)) => {
                // the record is dropped and counted; the stream is not
                // trusted past a framing error
                inner.n_errors += 1;
                inner.done = true;
                Err(e.into())
            }
        }
    }

    pub fn n_reads(&self) -> u64 {
        self.inner.lock().unwrap().n_reads
    }

    pub fn n_parse_errors(&self) -> u64 {
        self.inner.lock().unwrap().n_errors
    }
}

/// What the broken-paired reader yields: a pair kept together, or an
/// orphan. `index` is the ordinal of the first read in the chunk.
#[derive(Debug)]
pub struct PairedChunk {
    pub index: u64,
    pub is_pair: bool,
    pub first: Record,
    pub second: Option<Record>,
}

/// Wraps a `ReadParser` and emits (pair, orphan) chunks so that downstream
/// filters keep mates adjacent. Single-pass, not restartable.
pub struct BrokenPairedReader {
    parser: ReadParser,
    buffered: Option<Record>,
    index: u64,
    min_length: Option<usize>,
    require_paired: bool,
    failed: bool,
}

impl BrokenPairedReader {
    pub fn new(parser: ReadParser) -> Self {
        BrokenPairedReader {
            parser,
            buffered: None,
            index: 0,
            min_length: None,
            require_paired: false,
            failed: false,
        }
    }

    /// Drop reads shorter than `min_length` before pairing.
    pub fn min_length(mut self, min_length: usize) -> Self {
        self.min_length = Some(min_length);
        self
    }

    /// Error out on any orphan read.
    pub fn require_paired(mut self) -> Self {
        self.require_paired = true;
        self
    }

    fn pull(&mut self) -> OxliResult<Option<Record>> {
        if let Some(rec) = self.buffered.take() {
            return Ok(Some(rec));
        }
        loop {
            match self.parser.next_record()? {
                None => return Ok(None),
                Some(rec) => {
                    if let Some(min) = self.min_length {
                        if rec.sequence.len() < min {
                            self.index += 1;
                            continue;
                        }
                    }
                    return Ok(Some(rec));
                }
            }
        }
    }
}

impl Iterator for BrokenPairedReader {
    type Item = OxliResult<PairedChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let first = match self.pull() {
            Ok(Some(rec)) => rec,
            Ok(None) => return None,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };
        let index = self.index;
        let second = match self.pull() {
            Ok(s) => s,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };
        match second {
            Some(rec) if check_is_pair(&first, &rec) => {
                self.index += 2;
                Some(Ok(PairedChunk {
                    index,
                    is_pair: true,
                    first,
                    second: Some(rec),
                }))
            }
            other => {
                self.buffered = other;
                if self.require_paired {
                    self.failed = true;
                    return Some(Err(OxliError::Value(format!(
                        "unpaired read '{}' in paired-only mode",
                        String::from_utf8_lossy(&first.name)
                    ))));
                }
                self.index += 1;
                Some(Ok(PairedChunk {
                    index,
                    is_pair: false,
                    first,
                    second: None,
                }))
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum BlockFormat {
    Fasta,
    Fastq,
}

/// A byte range of the input file, trimmed to whole records.
struct Block {
    mmap: Mmap,
    end: usize,
}

impl Block {
    fn data(&self) -> &[u8] {
        &self.mmap[..self.end]
    }
}

/// Splits an uncompressed FASTA/FASTQ file into record-aligned byte ranges
/// that can be parsed independently.
struct BlockProducer {
    file: File,
    format: BlockFormat,
    offset: u64,
    file_length: u64,
    blocksize: u64,
}

impl BlockProducer {
    fn new(file: File, format: BlockFormat, blocksize: u64) -> OxliResult<Self> {
        let file_length = file.metadata()?.len();
        Ok(BlockProducer {
            file,
            format,
            offset: 0,
            file_length,
            blocksize: blocksize.max(1),
        })
    }

    fn next_block(&mut self) -> OxliResult<Option<Block>> {
        if self.offset >= self.file_length {
            return Ok(None);
        }
        if self.offset + self.blocksize >= self.file_length {
            let len = (self.file_length - self.offset) as usize;
            let mmap = unsafe { MmapOptions::new().offset(self.offset).len(len).map(&self.file)? };
            self.offset = self.file_length;
            return Ok(Some(Block { end: len, mmap }));
        }
        let mmap = unsafe {
            MmapOptions::new()
                .offset(self.offset)
                .len(self.blocksize as usize)
                .map(&self.file)?
        };
        let end = match self.format {
            BlockFormat::Fasta => fasta_boundary(&mmap),
            BlockFormat::Fastq => fastq_boundary(&mmap),
        }
        .ok_or_else(|| {
            OxliError::Value(format!(
                "no record boundary within a {}-byte block; increase the blocksize",
                self.blocksize
            ))
        })?;
        self.offset += end as u64;
        Ok(Some(Block { end, mmap }))
    }
}

impl Iterator for BlockProducer {
    type Item = OxliResult<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_block().transpose()
    }
}

/// End of the last whole FASTA record: cut just after the newline that
/// precedes the final '>' header in the block.
fn fasta_boundary(block: &[u8]) -> Option<usize> {
    let mut i = block.len();
    while i > 1 {
        i -= 1;
        if block[i] == b'>' && block[i - 1] == b'\n' {
            return Some(i);
        }
    }
    None
}

/// Rewind to the start of the last whole record. A '+' separator line pins
/// the record frame: the next record's '@' header starts two lines after
/// it. Quality lines may themselves begin with '+' or '@', so a candidate
/// separator only counts when the implied cut lands on an '@' line.
fn fastq_boundary(block: &[u8]) -> Option<usize> {
    // line starts of the tail of the block, oldest first; offset 0 is a
    // record boundary by construction
    let mut starts = Vec::with_capacity(9);
    let mut end = block.len();
    for _ in 0..8 {
        match block[..end].iter().rposition(|&b| b == b'\n') {
            Some(nl) => {
                starts.push(nl + 1);
                end = nl;
            }
            None => {
                starts.push(0);
                break;
            }
        }
    }
    starts.reverse();
    for i in (0..starts.len()).rev() {
        let pos = starts[i];
        if pos >= block.len() || block[pos] != b'+' {
            continue;
        }
        if i + 2 < starts.len() {
            let cut = starts[i + 2];
            if cut == block.len() || block[cut] == b'@' {
                return Some(cut);
            }
        } else if i >= 2 && starts[i - 2] > 0 && block[starts[i - 2]] == b'@' {
            // the block ends inside this record; cut before its header
            return Some(starts[i - 2]);
        }
    }
    None
}

/// Iterator over the records inside one block.
struct BlockRecords {
    block: Block,
    offset: usize,
    format: BlockFormat,
}

impl BlockRecords {
    fn new(block: Block, format: BlockFormat) -> Self {
        BlockRecords {
            block,
            offset: 0,
            format,
        }
    }

    fn line(&mut self) -> Option<&[u8]> {
        let data = self.block.data();
        if self.offset >= data.len() {
            return None;
        }
        let rest = &data[self.offset..];
        let end = rest
            .iter()
            .position(|&b| b == b'\n')
            .unwrap_or(rest.len());
        self.offset += end + 1;
        Some(&rest[..end])
    }

    fn next_record(&mut self) -> OxliResult<Option<Record>> {
        match self.format {
            BlockFormat::Fastq => {
                let header = match self.line() {
                    Some(line) if !line.is_empty() => line.to_vec(),
                    _ => return Ok(None),
                };
                if header[0] != b'@' {
                    return Err(OxliError::Value(
                        "fastq record does not start with '@'".to_owned(),
                    ));
                }
                let sequence = self
                    .line()
                    .ok_or_else(|| OxliError::Value("truncated fastq record".to_owned()))?
                    .to_vec();
                let _plus = self
                    .line()
                    .ok_or_else(|| OxliError::Value("truncated fastq record".to_owned()))?;
                let quality = self
                    .line()
                    .ok_or_else(|| OxliError::Value("truncated fastq record".to_owned()))?
                    .to_vec();
                Ok(Some(Record {
                    name: header[1..].to_vec(),
                    sequence,
                    quality: Some(quality),
                }))
            }
            BlockFormat::Fasta => {
                let header = match self.line() {
                    Some(line) if !line.is_empty() => line.to_vec(),
                    _ => return Ok(None),
                };
                if header[0] != b'>' {
                    return Err(OxliError::Value(
                        "fasta record does not start with '>'".to_owned(),
                    ));
                }
                let mut sequence = Vec::new();
                loop {
                    let data = self.block.data();
                    if self.offset >= data.len() || data[self.offset] == b'>' {
                        break;
                    }
                    match self.line() {
                        Some(line) => sequence.extend_from_slice(line),
                        None => break,
                    }
                }
                Ok(Some(Record {
                    name: header[1..].to_vec(),
                    sequence,
                    quality: None,
                }))
            }
        }
    }
}

fn sniff_format(path: &Path) -> OxliResult<Option<BlockFormat>> {
    use std::io::Read;
    let mut head = [0u8; 3];
    let n = File::open(path)?.read(&mut head)?;
    if n == 0 {
        return Ok(None);
    }
    // compressed input cannot be range-split
    if head.starts_with(&[0x1f, 0x8b]) || head.starts_with(b"BZh") {
        return Ok(None);
    }
    match head[0] {
        b'>' => Ok(Some(BlockFormat::Fasta)),
        b'@' => Ok(Some(BlockFormat::Fastq)),
        _ => Ok(None),
    }
}

/// Run `worker` over every record of a sequence file, fanning byte-range
/// blocks out to the rayon pool. Compressed or unrecognized input falls
/// back to a single sequential reader.
pub fn for_each_record_parallel<P, F>(path: P, blocksize: u64, worker: &F) -> OxliResult<()>
where
    P: AsRef<Path>,
    F: Fn(Record) + Send + Sync,
{
    let path = path.as_ref();
    let format = match sniff_format(path)? {
        Some(format) => format,
        None => {
            let parser = ReadParser::from_path(path)?;
            while let Some(record) = parser.next_record()? {
                worker(record);
            }
            return Ok(());
        }
    };
    let producer = BlockProducer::new(File::open(path)?, format, blocksize)?;
    let result = producer
        .par_bridge()
        .map(|block| -> OxliResult<()> {
            let mut records = BlockRecords::new(block?, format);
            while let Some(record) = records.next_record()? {
                worker(record);
            }
            Ok(())
        })
        .find_any(|r| r.is_err());
    match result {
        Some(err) => err,
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn rec(name: &[u8]) -> Record {
        Record {
            name: name.to_vec(),
            sequence: b"ACGT".to_vec(),
            quality: None,
        }
    }

    #[test]
    fn test_check_is_pair_slash_convention() {
        assert!(check_is_pair(&rec(b"frag/1"), &rec(b"frag/2")));
        assert!(!check_is_pair(&rec(b"frag/2"), &rec(b"frag/1")));
        assert!(!check_is_pair(&rec(b"a/1"), &rec(b"b/2")));
        assert!(!check_is_pair(&rec(b"frag"), &rec(b"frag")));
    }

    #[test]
    fn test_check_is_pair_illumina_convention() {
        assert!(check_is_pair(
            &rec(b"inst:1:2 1:N:0:ACGT"),
            &rec(b"inst:1:2 2:N:0:ACGT")
        ));
        assert!(!check_is_pair(
            &rec(b"inst:1:2 1:N:0:ACGT"),
            &rec(b"other:1:2 2:N:0:ACGT")
        ));
    }

    #[test]
    fn test_clean_sequence() {
        let mut record = rec(b"x");
        record.sequence = b"acgtNnACGT".to_vec();
        record.clean_sequence();
        assert_eq!(record.sequence, b"ACGTAAACGT");
    }

    fn write_fastq(records: &[(&str, &str)]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for (name, seq) in records {
            writeln!(file, "@{}\n{}\n+\n{}", name, seq, "I".repeat(seq.len())).unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn write_fasta(records: &[(&str, &str)]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for (name, seq) in records {
            writeln!(file, ">{}\n{}", name, seq).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_read_parser_fastq() {
        let file = write_fastq(&[("r1", "ACGTACGT"), ("r2", "TTTTCCCC")]);
        let parser = ReadParser::from_path(file.path()).unwrap();
        let first = parser.next_record().unwrap().unwrap();
        assert_eq!(first.name, b"r1");
        assert_eq!(first.sequence, b"ACGTACGT");
        assert!(first.quality.is_some());
        assert!(parser.next_record().unwrap().is_some());
        assert!(parser.next_record().unwrap().is_none());
        assert_eq!(parser.n_reads(), 2);
        assert_eq!(parser.n_parse_errors(), 0);
    }

    #[test]
    fn test_broken_paired_keeps_pairs_together() {
        let file = write_fastq(&[
            ("a/1", "ACGTACGTAA"),
            ("a/2", "ACGTACGTCC"),
            ("orphan", "ACGTACGTGG"),
            ("b/1", "ACGTACGTTT"),
            ("b/2", "ACGTACGTAC"),
        ]);
        let parser = ReadParser::from_path(file.path()).unwrap();
        let chunks: Vec<PairedChunk> = BrokenPairedReader::new(parser)
            .map(|c| c.unwrap())
            .collect();
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].is_pair);
        assert_eq!(chunks[0].index, 0);
        assert!(!chunks[1].is_pair);
        assert_eq!(chunks[1].index, 2);
        assert!(chunks[1].second.is_none());
        assert!(chunks[2].is_pair);
        assert_eq!(chunks[2].index, 3);
    }

    #[test]
    fn test_broken_paired_min_length() {
        let file = write_fastq(&[("a/1", "ACGTACGTAA"), ("a/2", "ACG"), ("c", "ACGTACGTAA")]);
        let parser = ReadParser::from_path(file.path()).unwrap();
        let chunks: Vec<PairedChunk> = BrokenPairedReader::new(parser)
            .min_length(5)
            .map(|c| c.unwrap())
            .collect();
        // a/2 is dropped, a/1 becomes an orphan
        assert_eq!(chunks.len(), 2);
        assert!(!chunks[0].is_pair);
        assert!(!chunks[1].is_pair);
    }

    #[test]
    fn test_broken_paired_require_paired() {
        let file = write_fastq(&[("a/1", "ACGTACGTAA"), ("orphan", "ACGTACGTAA")]);
        let parser = ReadParser::from_path(file.path()).unwrap();
        let results: Vec<_> = BrokenPairedReader::new(parser).require_paired().collect();
        assert!(results.iter().any(|r| r.is_err()));
    }

    #[test]
    fn test_fastq_boundary_quality_at_sign() {
        // quality line starting with '@' must not be taken for a header
        let data = b"@r1\nACGT\n+\n@III\n@r2\nTTTT\n+\nIIII\n";
        let cut = fastq_boundary(&data[..data.len() - 10]).unwrap();
        assert_eq!(data[cut], b'@');
        assert_eq!(&data[cut..cut + 3], b"@r2");
    }

    #[test]
    fn test_fastq_boundary_cut_before_separator() {
        // the block ends between a header and its '+' line
        let data = b"@r1\nACGT\n+\nIIII\n@r2\nTTTT\n+\nIIII\n";
        let cut = fastq_boundary(&data[..18]).unwrap();
        assert_eq!(cut, 16);
        assert_eq!(&data[cut..cut + 3], b"@r2");
    }

    #[test]
    fn test_fastq_boundary_quality_plus_sign() {
        // quality line starting with '+' must not be taken for a separator
        let data = b"@r1\nACGT\n+\n+III\n@r2\nTTTT\n+\nIIII\n";
        let cut = fastq_boundary(&data[..22]).unwrap();
        assert_eq!(&data[cut..cut + 3], b"@r2");
    }

    #[test]
    fn test_fasta_boundary() {
        let data = b">a\nACGT\n>b\nTTTT\n";
        assert_eq!(fasta_boundary(&data[..12]), Some(8));
    }

    #[test]
    fn test_parallel_matches_sequential_fasta() {
        let records: Vec<(String, String)> = (0..200)
            .map(|i| (format!("r{}", i), "ACGTACGTACGTACGTACGT".to_owned()))
            .collect();
        let borrowed: Vec<(&str, &str)> = records
            .iter()
            .map(|(n, s)| (n.as_str(), s.as_str()))
            .collect();
        let file = write_fasta(&borrowed);

        let count = AtomicU64::new(0);
        let bases = AtomicU64::new(0);
        for_each_record_parallel(file.path(), 256, &|record| {
            count.fetch_add(1, Ordering::Relaxed);
            bases.fetch_add(record.sequence.len() as u64, Ordering::Relaxed);
        })
        .unwrap();
        assert_eq!(count.into_inner(), 200);
        assert_eq!(bases.into_inner(), 200 * 20);
    }

    #[test]
    fn test_parallel_matches_sequential_fastq() {
        let records: Vec<(String, String)> = (0..100)
            .map(|i| (format!("r{}", i), "ACGTACGTACGTACGT".to_owned()))
            .collect();
        let borrowed: Vec<(&str, &str)> = records
            .iter()
            .map(|(n, s)| (n.as_str(), s.as_str()))
            .collect();
        let file = write_fastq(&borrowed);

        let count = AtomicU64::new(0);
        for_each_record_parallel(file.path(), 200, &|_| {
            count.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
        assert_eq!(count.into_inner(), 100);
    }
}
