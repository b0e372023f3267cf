//! Monotone minimal perfect hashing over sorted, prefix-free, distinct keys.
//!
//! Keys are cut into fixed-size buckets; the longest common prefix of each
//! bucket acts as its distributor. Three retrieval functions compose the rank:
//! one maps a key to its offset inside its bucket, a layered one maps it to
//! its bucket's LCP length, and one maps the LCP slice to the bucket id:
//!
//! `rank(key) = bucket(key[0..lcp_len(key)]) * bucket_size + offset(key)`
//!
//! Non-member queries return the sentinel only probabilistically unless a
//! signature is configured.

use crate::bits::{ceil_log2, BitVector, CompactList};
use crate::error::BuildError;
use crate::hash::jenkins;
use crate::mwhc::{MwhcBuilder, MwhcFunction, ValueSource, DEFAULT_SEED, GAMMA};
use crate::store::ChunkedHashStore;
use crate::transform::Transform;
use crate::two_steps::{threshold, TwoStepsBuilder, TwoStepsMwhc};
use log::{debug, info};
use std::path::PathBuf;

const MAGIC: &[u8; 4] = b"MMF1";

/// Build parameters.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Key encoding strategy. Must yield distinct, prefix-free vectors in the
    /// caller's (sorted) key order.
    pub transform: Transform,
    /// Signature bits stored per rank; 0 disables non-member rejection.
    /// Negative widths are reserved for dictionary mode and currently behave
    /// like their absolute value.
    pub signature_width: i32,
    /// Spill directory for the hash store; `None` uses the OS temp directory.
    pub temp_dir: Option<PathBuf>,
    /// Known key count; `None` counts by scanning.
    pub num_keys: Option<u64>,
    /// Base salt; every reseed is derived from it deterministically.
    pub base_seed: u64,
    /// How many store reseeds to attempt when a hypergraph refuses to orient.
    pub max_rebuilds: u32,
    /// Returned for non-members and degenerate inputs.
    pub sentinel: i64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            transform: Transform::default(),
            signature_width: 0,
            temp_dir: None,
            num_keys: None,
            base_seed: DEFAULT_SEED,
            max_rebuilds: 16,
            sentinel: -1,
        }
    }
}

/// Builder for [`MonotoneMphf`].
pub struct Builder {
    cfg: BuildConfig,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            cfg: BuildConfig::default(),
        }
    }

    pub fn with_config(mut self, cfg: BuildConfig) -> Self {
        self.cfg = cfg;
        self
    }

    pub fn transform(mut self, transform: Transform) -> Self {
        self.cfg.transform = transform;
        self
    }

    /// Stores a `signature_width`-bit signature per rank for non-member
    /// rejection. 0 disables signatures.
    pub fn signed(mut self, signature_width: i32) -> Self {
        self.cfg.signature_width = signature_width;
        self
    }

    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cfg.temp_dir = Some(dir.into());
        self
    }

    pub fn num_keys(mut self, num_keys: u64) -> Self {
        self.cfg.num_keys = Some(num_keys);
        self
    }

    pub fn seed(mut self, base_seed: u64) -> Self {
        self.cfg.base_seed = base_seed;
        self
    }

    pub fn sentinel(mut self, sentinel: i64) -> Self {
        self.cfg.sentinel = sentinel;
        self
    }

    /// Builds the function. Keys must arrive in ascending lexicographic order
    /// of their encoded bit vectors, distinct and prefix-free.
    pub fn build<K, I>(self, keys: I) -> Result<MonotoneMphf, BuildError>
    where
        K: AsRef<[u8]>,
        I: IntoIterator<Item = K>,
    {
        let iter = keys.into_iter();
        match self.cfg.num_keys {
            Some(n) => build_inner(self.cfg, n, iter),
            None => {
                let collected: Vec<K> = iter.collect();
                let n = collected.len() as u64;
                build_inner(self.cfg, n, collected.into_iter())
            }
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

fn build_inner<K, I>(cfg: BuildConfig, n: u64, mut keys: I) -> Result<MonotoneMphf, BuildError>
where
    K: AsRef<[u8]>,
    I: Iterator<Item = K>,
{
    if n == 0 {
        return Ok(MonotoneMphf {
            n: 0,
            log2_bucket_size: 0,
            seed: 0,
            sentinel: cfg.sentinel,
            transform: cfg.transform,
            offsets: None,
            lcp_lengths: None,
            lcp2bucket: None,
            signature_mask: 0,
            signatures: None,
        });
    }

    let ln_n = (n as f64).ln();
    let t = (1.0 + GAMMA * std::f64::consts::LN_2 + ln_n - (1.0 + ln_n).ln()).ceil() as u64;
    let log2_bucket_size = ceil_log2(t);
    let bucket_size = 1u64 << log2_bucket_size;
    let bucket_mask = bucket_size - 1;
    debug!("bucket size: {bucket_size}");
    let num_buckets = n.div_ceil(bucket_size);

    let mut store = ChunkedHashStore::new_spilled(cfg.base_seed, cfg.temp_dir.as_deref())?;
    let mut distributors: Vec<BitVector> = Vec::with_capacity(num_buckets as usize);
    let mut bucket_lcp: Vec<u64> = Vec::with_capacity(num_buckets as usize);

    // Single pass: stream every key into the store while extracting each
    // bucket's longest common prefix and validating the input shape.
    for b in 0..num_buckets {
        let key = keys.next().expect("key iterator ended before num_keys keys");
        let mut prev = cfg.transform.to_bit_vector(key.as_ref());
        store.add(&prev)?;
        let mut curr_lcp = prev.len();
        let curr_bucket_size = bucket_size.min(n - b * bucket_size);
        for _ in 1..curr_bucket_size {
            let key = keys.next().expect("key iterator ended before num_keys keys");
            let curr = cfg.transform.to_bit_vector(key.as_ref());
            store.add(&curr)?;
            let prefix = curr.lcp(&prev);
            if prefix == prev.len() && prefix == curr.len() {
                return Err(BuildError::DuplicateKey);
            }
            if prefix == prev.len() || prefix == curr.len() {
                return Err(BuildError::NotPrefixFree);
            }
            if prev.get(prefix) {
                return Err(BuildError::NotSorted);
            }
            curr_lcp = curr_lcp.min(prefix);
            prev = curr;
        }
        distributors.push(prev.prefix(curr_lcp));
        bucket_lcp.push(curr_lcp);
    }

    store.check_and_retry()?;

    #[cfg(debug_assertions)]
    {
        let distinct: hashbrown::HashSet<&BitVector> = distributors.iter().collect();
        debug_assert_eq!(distinct.len(), distributors.len(), "distributors collide");
    }

    // The distributor set is tiny next to the key set; it gets its own store.
    let bucket_ids: Vec<u64> = (0..num_buckets).collect();
    let lcp2bucket = MwhcBuilder::new()
        .keys(&distributors)
        .values(ValueSource::Slice(&bucket_ids))
        .width(ceil_log2(num_buckets))
        .seed(cfg.base_seed)
        .build()?;

    // Both per-key functions must share the store's seed, so an orientation
    // failure in either one reseeds the store and rebuilds both.
    let mut attempt = 0u32;
    let (offsets, lcp_lengths) = loop {
        let outcome = (|| -> Result<(MwhcFunction, TwoStepsMwhc), BuildError> {
            let offsets = MwhcBuilder::new()
                .store(&store)
                .values(ValueSource::Indexed {
                    get: &|i| i & bucket_mask,
                    len: n,
                })
                .width(log2_bucket_size)
                .build()?;
            let lcp_lengths = TwoStepsBuilder::new()
                .store(&store)
                .values(ValueSource::Indexed {
                    get: &|i| bucket_lcp[(i >> log2_bucket_size) as usize],
                    len: n,
                })
                .build()?;
            Ok((offsets, lcp_lengths))
        })();
        match outcome {
            Ok(pair) => break pair,
            Err(BuildError::ConstructionFailed) if attempt < cfg.max_rebuilds => {
                attempt += 1;
                store.reseed()?;
            }
            Err(e) => return Err(e),
        }
    };

    if lcp_lengths.width > 0 && lcp_lengths.rank_mean > 0.0 {
        let p = 1.0 / (lcp_lengths.rank_mean + 1.0);
        debug!(
            "forecast best threshold: {}",
            threshold(p, lcp_lengths.width)
        );
    }

    let signature_width = (cfg.signature_width.unsigned_abs()).min(64);
    let (signature_mask, signatures) = if signature_width != 0 {
        let mask = u64::MAX >> (64 - signature_width);
        let mut sigs = CompactList::new(signature_width, n);
        for chunk in store.chunks() {
            for rec in chunk {
                sigs.set(rec[3], rec[0] & mask);
            }
        }
        (mask, Some(sigs))
    } else {
        (0, None)
    };

    let mmphf = MonotoneMphf {
        n,
        log2_bucket_size,
        seed: store.seed(),
        sentinel: cfg.sentinel,
        transform: cfg.transform,
        offsets: Some(offsets),
        lcp_lengths: Some(lcp_lengths),
        lcp2bucket: Some(lcp2bucket),
        signature_mask,
        signatures,
    };
    info!("bits per key: {:.3}", mmphf.num_bits() as f64 / n as f64);
    Ok(mmphf)
}

/// A monotone minimal perfect hash function: maps each of the `n` build keys
/// to its rank in `[0, n)`. Immutable after construction; queries are pure.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct MonotoneMphf {
    n: u64,
    log2_bucket_size: u32,
    seed: u64,
    sentinel: i64,
    transform: Transform,
    offsets: Option<MwhcFunction>,
    lcp_lengths: Option<TwoStepsMwhc>,
    lcp2bucket: Option<MwhcFunction>,
    signature_mask: u64,
    signatures: Option<CompactList>,
}

impl MonotoneMphf {
    pub fn builder() -> Builder {
        Builder::new()
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.n
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    #[inline]
    pub fn bucket_size(&self) -> u64 {
        1 << self.log2_bucket_size
    }

    #[inline]
    pub fn sentinel(&self) -> i64 {
        self.sentinel
    }

    /// Rank of `key`, or the sentinel. For keys outside the build set the
    /// result is arbitrary unless a signature was configured.
    pub fn rank(&self, key: impl AsRef<[u8]>) -> i64 {
        if self.n == 0 {
            return self.sentinel;
        }
        let bv = self.transform.to_bit_vector(key.as_ref());
        let triple = jenkins(&bv, self.seed);
        self.rank_with_triple(&bv, &triple)
    }

    /// Rank lookup for a pre-encoded, pre-hashed key. The triple must have
    /// been produced with this function's seed.
    pub fn rank_with_triple(&self, bv: &BitVector, triple: &[u64; 3]) -> i64 {
        let (Some(offsets), Some(lcp_lengths), Some(lcp2bucket)) =
            (&self.offsets, &self.lcp_lengths, &self.lcp2bucket)
        else {
            return self.sentinel;
        };
        let prefix = lcp_lengths.get_by_triple(triple);
        if prefix > bv.len() {
            return self.sentinel;
        }
        let bucket = lcp2bucket.get(&bv.prefix(prefix));
        let result = (bucket << self.log2_bucket_size) + offsets.get_by_triple(triple);
        if result >= self.n {
            return self.sentinel;
        }
        if self.signature_mask != 0 {
            let signatures = match &self.signatures {
                Some(s) => s,
                None => return self.sentinel,
            };
            if (signatures.get(result) ^ triple[0]) & self.signature_mask != 0 {
                return self.sentinel;
            }
        }
        result as i64
    }

    /// Total size of the structure in bits.
    pub fn num_bits(&self) -> u64 {
        if self.n == 0 {
            return 0;
        }
        self.offsets.as_ref().map_or(0, MwhcFunction::num_bits)
            + self.lcp_lengths.as_ref().map_or(0, TwoStepsMwhc::num_bits)
            + self.lcp2bucket.as_ref().map_or(0, MwhcFunction::num_bits)
            + self.signatures.as_ref().map_or(0, CompactList::num_bits)
            + self.transform.num_bits()
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&self.n.to_le_bytes());
        out.extend_from_slice(&self.log2_bucket_size.to_le_bytes());
        out.extend_from_slice(&self.seed.to_le_bytes());
        out.extend_from_slice(&self.signature_mask.to_le_bytes());
        out.extend_from_slice(&self.sentinel.to_le_bytes());
        out.push(self.transform.tag());
        write_opt(out, &self.offsets, MwhcFunction::write_to);
        write_opt(out, &self.lcp_lengths, TwoStepsMwhc::write_to);
        write_opt(out, &self.lcp2bucket, MwhcFunction::write_to);
        write_opt(out, &self.signatures, CompactList::write_to);
    }

    pub fn read_from(buf: &[u8]) -> Option<Self> {
        let mut cursor = crate::Cursor::new(buf);
        let mut magic = [0u8; 4];
        cursor.read_bytes(&mut magic)?;
        if &magic != MAGIC {
            return None;
        }
        let n = cursor.read_u64()?;
        let log2_bucket_size = cursor.read_u32()?;
        let seed = cursor.read_u64()?;
        let signature_mask = cursor.read_u64()?;
        let sentinel = cursor.read_u64()? as i64;
        let transform = Transform::from_tag(cursor.read_u8()?)?;
        let offsets = read_opt(&mut cursor, MwhcFunction::read_from)?;
        let lcp_lengths = read_opt(&mut cursor, TwoStepsMwhc::read_from)?;
        let lcp2bucket = read_opt(&mut cursor, MwhcFunction::read_from)?;
        let signatures = read_opt(&mut cursor, CompactList::read_from)?;
        Some(Self {
            n,
            log2_bucket_size,
            seed,
            sentinel,
            transform,
            offsets,
            lcp_lengths,
            lcp2bucket,
            signature_mask,
            signatures,
        })
    }

    #[cfg(feature = "serde")]
    pub fn to_bytes(&self) -> Result<Vec<u8>, BuildError> {
        Ok(bincode::serialize(self)?)
    }

    #[cfg(feature = "serde")]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BuildError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

fn write_opt<T>(out: &mut Vec<u8>, value: &Option<T>, write: impl Fn(&T, &mut Vec<u8>)) {
    match value {
        Some(v) => {
            out.push(1);
            write(v, out);
        }
        None => out.push(0),
    }
}

fn read_opt<T>(
    cursor: &mut crate::Cursor<'_>,
    read: impl Fn(&mut crate::Cursor<'_>) -> Option<T>,
) -> Option<Option<T>> {
    match cursor.read_u8()? {
        0 => Some(None),
        1 => Some(Some(read(cursor)?)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::XorShift64;

    fn random_sorted_keys(count: usize, seed: u64) -> Vec<Vec<u8>> {
        let mut rng = XorShift64::seeded(seed);
        let mut set = std::collections::BTreeSet::new();
        while set.len() < count {
            let len = 2 + (rng.next() % 14) as usize;
            // NUL-free so the prefix-free transform keeps order.
            let bytes: Vec<u8> = (0..len).map(|_| (rng.next() % 255) as u8 + 1).collect();
            set.insert(bytes);
        }
        set.into_iter().collect()
    }

    #[test]
    fn four_fruit_ranks() {
        let keys = ["apple", "banana", "cherry", "date"];
        let mmphf = Builder::new().build(keys).unwrap();
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(mmphf.rank(key), i as i64);
        }
    }

    #[test]
    fn rank_identity_over_random_keys() {
        let keys = random_sorted_keys(1000, 99);
        let mmphf = Builder::new().build(keys.iter()).unwrap();
        assert_eq!(mmphf.len(), 1000);
        assert!(mmphf.num_bits() > 0);
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(mmphf.rank(key), i as i64, "key {i}");
        }
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let err = Builder::new().build(["same", "same"]).unwrap_err();
        assert!(matches!(err, BuildError::DuplicateKey));
    }

    #[test]
    fn prefix_keys_are_rejected() {
        let err = Builder::new()
            .transform(Transform::Raw)
            .build(["a", "ab"])
            .unwrap_err();
        assert!(matches!(err, BuildError::NotPrefixFree));
    }

    #[test]
    fn out_of_order_keys_are_rejected() {
        let err = Builder::new()
            .transform(Transform::Raw)
            .build([[0b01u8], [0b00u8]])
            .unwrap_err();
        assert!(matches!(err, BuildError::NotSorted));
    }

    #[test]
    fn empty_input_always_answers_sentinel() {
        let mmphf = Builder::new().build(std::iter::empty::<&[u8]>()).unwrap();
        assert_eq!(mmphf.len(), 0);
        assert_eq!(mmphf.num_bits(), 0);
        assert_eq!(mmphf.rank("anything"), -1);
    }

    #[test]
    fn single_key() {
        let mmphf = Builder::new().signed(16).build(["only"]).unwrap();
        assert_eq!(mmphf.rank("only"), 0);
        assert_eq!(mmphf.rank("other"), -1);
    }

    #[test]
    fn signatures_reject_non_members() {
        let keys = random_sorted_keys(1000, 5);
        let member: std::collections::BTreeSet<&Vec<u8>> = keys.iter().collect();
        let mmphf = Builder::new().signed(32).build(keys.iter()).unwrap();
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(mmphf.rank(key), i as i64);
        }
        let mut rng = XorShift64::seeded(123);
        let mut false_positives = 0;
        let mut probes = 0;
        while probes < 10_000 {
            let len = 2 + (rng.next() % 14) as usize;
            let probe: Vec<u8> = (0..len).map(|_| (rng.next() % 255) as u8 + 1).collect();
            if member.contains(&probe) {
                continue;
            }
            probes += 1;
            if mmphf.rank(&probe) != -1 {
                false_positives += 1;
            }
        }
        assert!(false_positives <= 1, "{false_positives} false positives");
    }

    #[test]
    fn builds_are_reproducible() {
        let keys = random_sorted_keys(500, 7);
        let a = Builder::new().signed(8).build(keys.iter()).unwrap();
        let b = Builder::new().signed(8).build(keys.iter()).unwrap();
        let (mut buf_a, mut buf_b) = (Vec::new(), Vec::new());
        a.write_to(&mut buf_a);
        b.write_to(&mut buf_b);
        assert_eq!(buf_a, buf_b);
        assert_eq!(a.num_bits(), b.num_bits());
    }

    #[test]
    fn serialization_preserves_queries() {
        let keys = random_sorted_keys(400, 13);
        let mmphf = Builder::new().signed(16).build(keys.iter()).unwrap();
        let mut buf = Vec::new();
        mmphf.write_to(&mut buf);
        let back = MonotoneMphf::read_from(&buf).unwrap();
        assert_eq!(mmphf, back);
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(back.rank(key), i as i64);
        }
    }

    #[test]
    fn sentinel_is_configurable() {
        let keys = random_sorted_keys(100, 21);
        let mmphf = Builder::new()
            .signed(32)
            .sentinel(-7)
            .build(keys.iter())
            .unwrap();
        assert_eq!(mmphf.rank([0u8]), -7);
    }

    #[test]
    fn explicit_num_keys_streams() {
        let keys = random_sorted_keys(300, 31);
        let mmphf = Builder::new()
            .num_keys(300)
            .build(keys.iter())
            .unwrap();
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(mmphf.rank(key), i as i64);
        }
    }

    #[test]
    fn temp_dir_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        let keys = random_sorted_keys(200, 41);
        let mmphf = Builder::new()
            .temp_dir(dir.path())
            .build(keys.iter())
            .unwrap();
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(mmphf.rank(key), i as i64);
        }
    }
}
