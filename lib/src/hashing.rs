use std::collections::{HashMap, HashSet};
use std::hash::{BuildHasherDefault, Hasher};

use murmurhash3::murmurhash3_x64_128;

use crate::errors::{OxliError, OxliResult};

/// Largest supported k-mer size; canonical hashes are two bits per base
/// packed into a u64.
pub const MAX_K: usize = 32;

pub type KmerHash = u64;

/// If we're using a `HashMap` where the keys themselves are hashes, it's
/// a little silly to re-hash them. That's where the `NoHashHasher` comes in.
#[derive(Default)]
pub struct NoHashHasher(u64);

impl Hasher for NoHashHasher {
    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        *self = NoHashHasher(
            (u64::from(bytes[0]) << 24)
                + (u64::from(bytes[1]) << 16)
                + (u64::from(bytes[2]) << 8)
                + u64::from(bytes[3]),
        );
    }
    fn finish(&self) -> u64 {
        self.0
    }
}

pub type HashIntSet = HashSet<KmerHash, BuildHasherDefault<NoHashHasher>>;
pub type HashIntMap<V> = HashMap<KmerHash, V, BuildHasherDefault<NoHashHasher>>;

#[inline]
fn encode_base(b: u8) -> Option<u64> {
    match b {
        b'A' | b'a' => Some(0),
        b'C' | b'c' => Some(1),
        b'G' | b'g' => Some(2),
        b'T' | b't' => Some(3),
        _ => None,
    }
}

#[inline]
fn decode_base(v: u64) -> u8 {
    b"ACGT"[(v & 3) as usize]
}

#[inline]
fn mask(ksize: usize) -> u64 {
    if ksize == 32 {
        u64::MAX
    } else {
        (1u64 << (2 * ksize)) - 1
    }
}

/// Reverse-complement of a packed forward hash.
pub fn revcomp_hash(fwd: u64, ksize: usize) -> u64 {
    let mut rev = 0u64;
    let mut h = fwd;
    for _ in 0..ksize {
        rev = (rev << 2) | ((h & 3) ^ 3);
        h >>= 2;
    }
    rev
}

/// Reverse-complement of a DNA byte string.
pub fn revcomp(seq: &[u8]) -> Vec<u8> {
    seq.iter()
        .rev()
        .map(|b| match b {
            b'A' | b'a' => b'T',
            b'C' | b'c' => b'G',
            b'G' | b'g' => b'C',
            b'T' | b't' => b'A',
            other => *other,
        })
        .collect()
}

/// A k-mer caught mid-flight: both strand encodings at once, so canonical
/// hashing and neighbor enumeration are O(1) bit fiddling.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Kmer {
    pub fwd: u64,
    pub rev: u64,
    ksize: u8,
}

impl Kmer {
    pub fn from_bytes(kmer: &[u8], ksize: usize) -> OxliResult<Self> {
        if ksize == 0 || ksize > MAX_K {
            return Err(OxliError::Config(format!(
                "k-mer size {} out of range 1..=32",
                ksize
            )));
        }
        if kmer.len() != ksize {
            return Err(OxliError::BadLength {
                expected: ksize,
                got: kmer.len(),
            });
        }
        let mut fwd = 0u64;
        let mut rev = 0u64;
        for (i, &b) in kmer.iter().enumerate() {
            let v = encode_base(b).ok_or(OxliError::BadAlphabet(b as char))?;
            fwd = (fwd << 2) | v;
            rev |= (v ^ 3) << (2 * i);
        }
        Ok(Kmer {
            fwd,
            rev,
            ksize: ksize as u8,
        })
    }

    /// Rebuild a `Kmer` from a canonical hash. The hash is itself a valid
    /// forward encoding of one orientation.
    pub fn from_hash(hash: u64, ksize: usize) -> Self {
        Kmer {
            fwd: hash,
            rev: revcomp_hash(hash, ksize),
            ksize: ksize as u8,
        }
    }

    #[inline]
    pub fn canonical(&self) -> u64 {
        self.fwd.min(self.rev)
    }

    #[inline]
    pub fn ksize(&self) -> usize {
        self.ksize as usize
    }

    /// The same k-mer read off the other strand.
    #[inline]
    pub fn rc(&self) -> Kmer {
        Kmer {
            fwd: self.rev,
            rev: self.fwd,
            ksize: self.ksize,
        }
    }

    /// Shift one base onto the right end (walking 5'→3').
    #[inline]
    pub fn extend_right(&self, base: u64) -> Kmer {
        let k = self.ksize as usize;
        Kmer {
            fwd: ((self.fwd << 2) | base) & mask(k),
            rev: (self.rev >> 2) | ((base ^ 3) << (2 * (k - 1))),
            ksize: self.ksize,
        }
    }

    /// Shift one base onto the left end.
    #[inline]
    pub fn extend_left(&self, base: u64) -> Kmer {
        let k = self.ksize as usize;
        Kmer {
            fwd: (self.fwd >> 2) | (base << (2 * (k - 1))),
            rev: ((self.rev << 2) | (base ^ 3)) & mask(k),
            ksize: self.ksize,
        }
    }

    /// Last base of the forward orientation (two-bit code).
    #[inline]
    pub fn last_base(&self) -> u64 {
        self.fwd & 3
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let k = self.ksize as usize;
        (0..k)
            .rev()
            .map(|i| decode_base(self.fwd >> (2 * i)))
            .collect()
    }
}

/// Canonical hash of a single k-mer string.
pub fn hash_kmer(kmer: &[u8], ksize: usize) -> OxliResult<u64> {
    Ok(Kmer::from_bytes(kmer, ksize)?.canonical())
}

/// Hash used by the HLL counter: murmur over the canonical string form, so
/// it stays uncorrelated with the two-bit sketch hash of the same k-mer.
pub fn murmur_hash_kmer(kmer: &[u8], seed: u64) -> u64 {
    let rc = revcomp(kmer);
    let canon: &[u8] = if kmer <= rc.as_slice() { kmer } else { &rc };
    murmurhash3_x64_128(canon, seed).0
}

/// Rolling two-bit hasher over a sequence; O(1) per base, restarts after an
/// ambiguous base.
pub struct RollingHasher {
    ksize: usize,
    fwd: u64,
    rev: u64,
    loaded: usize,
}

impl RollingHasher {
    pub fn new(ksize: usize) -> Self {
        RollingHasher {
            ksize,
            fwd: 0,
            rev: 0,
            loaded: 0,
        }
    }

    /// Push one base; yields a full window once k valid bases are in.
    #[inline]
    pub fn push(&mut self, b: u8) -> Option<Kmer> {
        let v = match encode_base(b) {
            Some(v) => v,
            None => {
                self.loaded = 0;
                return None;
            }
        };
        let k = self.ksize;
        self.fwd = ((self.fwd << 2) | v) & mask(k);
        self.rev = (self.rev >> 2) | ((v ^ 3) << (2 * (k - 1)));
        if self.loaded < k {
            self.loaded += 1;
        }
        if self.loaded == k {
            Some(Kmer {
                fwd: self.fwd,
                rev: self.rev,
                ksize: k as u8,
            })
        } else {
            None
        }
    }
}

/// Iterator over every valid k-mer window of a sequence, with the window's
/// start offset. Windows containing non-ACGT bases are skipped.
pub struct KmerWindows<'a> {
    seq: &'a [u8],
    pos: usize,
    hasher: RollingHasher,
}

impl<'a> KmerWindows<'a> {
    pub fn new(seq: &'a [u8], ksize: usize) -> Self {
        KmerWindows {
            seq,
            pos: 0,
            hasher: RollingHasher::new(ksize),
        }
    }
}

impl<'a> Iterator for KmerWindows<'a> {
    type Item = (usize, Kmer);

    fn next(&mut self) -> Option<(usize, Kmer)> {
        while self.pos < self.seq.len() {
            let b = self.seq[self.pos];
            self.pos += 1;
            if let Some(kmer) = self.hasher.push(b) {
                return Some((self.pos - self.hasher.ksize, kmer));
            }
        }
        None
    }
}

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n == 2 {
        return true;
    }
    if n % 2 == 0 {
        return false;
    }
    let mut i = 3u64;
    while i.saturating_mul(i) <= n {
        if n % i == 0 {
            return false;
        }
        i += 2;
    }
    true
}

/// `n` distinct primes descending from `x`, for pairwise-coprime table sizes.
pub fn get_n_primes_near_x(n: usize, x: u64) -> OxliResult<Vec<u64>> {
    if x < 2 {
        return Err(OxliError::Config(format!(
            "requested table size {} is too small",
            x
        )));
    }
    let mut primes = Vec::with_capacity(n);
    let mut candidate = if x % 2 == 0 { x - 1 } else { x };
    while primes.len() < n && candidate >= 2 {
        if is_prime(candidate) {
            primes.push(candidate);
        }
        candidate = match candidate.checked_sub(2) {
            Some(c) => c,
            None => break,
        };
    }
    if primes.len() < n {
        return Err(OxliError::Config(format!(
            "cannot find {} primes below {}",
            n, x
        )));
    }
    Ok(primes)
}
