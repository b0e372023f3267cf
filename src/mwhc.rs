//! 3-XOR retrieval function: stores one `w`-bit value per key in a cell table
//! such that the XOR of three hash-indexed cells reconstructs the value.

use crate::bits::{ceil_log2, BitVector, CompactList};
use crate::error::BuildError;
use crate::hash::jenkins;
use crate::hypergraph::{orient, solve_xor_system};
use crate::store::ChunkedHashStore;

/// Vertex overhead of the 3-uniform hypergraph. Peeling succeeds with high
/// probability when the cell table has at least `GAMMA` cells per key.
pub const GAMMA: f64 = 1.23;

/// Default base salt for functions that own their hash store.
pub(crate) const DEFAULT_SEED: u64 = 0xC0FF_EE00_D15E_A5E;

/// Bound on hypergraph rebuilds before a build is declared failed.
const REBUILD_LIMIT: u32 = 16;

/// Where a key's value comes from during assignment.
///
/// `Indexed` is the indirect mode: values are produced on demand from the
/// key's insertion rank, so large value lists never need buffering.
pub enum ValueSource<'a> {
    Slice(&'a [u64]),
    Indexed { get: &'a dyn Fn(u64) -> u64, len: u64 },
}

impl<'a> ValueSource<'a> {
    #[inline]
    pub(crate) fn get(&self, i: u64) -> u64 {
        match self {
            ValueSource::Slice(s) => s[i as usize],
            ValueSource::Indexed { get, .. } => get(i),
        }
    }

    #[inline]
    fn len(&self) -> u64 {
        match self {
            ValueSource::Slice(s) => s.len() as u64,
            ValueSource::Indexed { len, .. } => *len,
        }
    }
}

/// A static function `key -> w-bit value` in roughly `GAMMA * w` bits per key.
/// Querying a key that was not stored yields an arbitrary `w`-bit value.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MwhcFunction {
    n: u64,
    m: u64,
    width: u32,
    seed: u64,
    data: CompactList,
}

impl MwhcFunction {
    #[inline]
    pub fn len(&self) -> u64 {
        self.n
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn num_bits(&self) -> u64 {
        self.data.num_bits()
    }

    /// Looks up a key by hashing it under this function's own seed.
    #[inline]
    pub fn get(&self, bv: &BitVector) -> u64 {
        self.get_by_triple(&jenkins(bv, self.seed))
    }

    /// Looks up a pre-hashed key. The triple must come from the seed this
    /// function was built with (its own, or the shared store's).
    #[inline]
    pub fn get_by_triple(&self, triple: &[u64; 3]) -> u64 {
        if self.width == 0 || self.m == 0 {
            return 0;
        }
        let segment = self.m / 3;
        let v0 = triple[0] % segment;
        let v1 = segment + triple[1] % segment;
        let v2 = 2 * segment + triple[2] % segment;
        self.data.get(v0) ^ self.data.get(v1) ^ self.data.get(v2)
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.n.to_le_bytes());
        out.extend_from_slice(&self.m.to_le_bytes());
        out.extend_from_slice(&self.width.to_le_bytes());
        out.extend_from_slice(&self.seed.to_le_bytes());
        self.data.write_to(out);
    }

    pub fn read_from(cursor: &mut crate::Cursor<'_>) -> Option<Self> {
        let n = cursor.read_u64()?;
        let m = cursor.read_u64()?;
        let width = cursor.read_u32()?;
        let seed = cursor.read_u64()?;
        let data = CompactList::read_from(cursor)?;
        if m % 3 != 0 || data.len() != m {
            return None;
        }
        Some(Self {
            n,
            m,
            width,
            seed,
            data,
        })
    }
}

/// Builder for [`MwhcFunction`]. Either borrows a checked shared store
/// (`store`) or hashes its own keys (`keys`); values come from a slice or an
/// index-addressed supplier.
pub struct MwhcBuilder<'a> {
    keys: Option<&'a [BitVector]>,
    store: Option<&'a ChunkedHashStore>,
    values: Option<ValueSource<'a>>,
    width: Option<u32>,
    filter: Option<&'a dyn Fn(u64) -> bool>,
    base_seed: u64,
}

impl<'a> MwhcBuilder<'a> {
    pub fn new() -> Self {
        Self {
            keys: None,
            store: None,
            values: None,
            width: None,
            filter: None,
            base_seed: DEFAULT_SEED,
        }
    }

    /// Builds over these keys with a private store and seed.
    pub fn keys(mut self, keys: &'a [BitVector]) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Builds over a shared, already-checked store. A failure to orient the
    /// hypergraph is returned to the caller, which owns reseeding.
    pub fn store(mut self, store: &'a ChunkedHashStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn values(mut self, values: ValueSource<'a>) -> Self {
        self.values = Some(values);
        self
    }

    /// Cell width in bits. Defaults to the bit length of the largest slice
    /// value; mandatory for `ValueSource::Indexed`.
    pub fn width(mut self, width: u32) -> Self {
        self.width = Some(width);
        self
    }

    /// Restricts a store-backed build to the keys whose insertion rank passes
    /// the predicate. Used for layered functions over a value subset.
    pub fn filter(mut self, filter: &'a dyn Fn(u64) -> bool) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn seed(mut self, base_seed: u64) -> Self {
        self.base_seed = base_seed;
        self
    }

    pub fn build(self) -> Result<MwhcFunction, BuildError> {
        let values = self.values.expect("value source is required");

        if let Some(store) = self.store {
            debug_assert_eq!(values.len(), store.len());
            let width = self
                .width
                .expect("explicit width is required when building from a store");
            return match try_assemble(store, width, &values, self.filter) {
                Some((n, m, data)) => Ok(MwhcFunction {
                    n,
                    m,
                    width,
                    seed: store.seed(),
                    data,
                }),
                None => Err(BuildError::ConstructionFailed),
            };
        }

        let keys = self.keys.expect("either keys or a store is required");
        let n = keys.len() as u64;
        debug_assert_eq!(values.len(), n);
        let width = match self.width {
            Some(w) => w,
            None => {
                let mut range = 0u64;
                for i in 0..n {
                    range |= values.get(i);
                }
                ceil_log2(range + 1)
            }
        };

        let mut store = ChunkedHashStore::new_in_memory(self.base_seed);
        for bv in keys {
            store.add(bv)?;
        }
        store.check_and_retry()?;
        for _ in 0..REBUILD_LIMIT {
            if let Some((n, m, data)) = try_assemble(&store, width, &values, None) {
                return Ok(MwhcFunction {
                    n,
                    m,
                    width,
                    seed: store.seed(),
                    data,
                });
            }
            store.reseed()?;
        }
        Err(BuildError::ConstructionFailed)
    }
}

impl<'a> Default for MwhcBuilder<'a> {
    fn default() -> Self {
        Self::new()
    }
}

fn vertex_count(n: u64) -> u64 {
    ((GAMMA * n as f64).ceil() as u64).div_ceil(3) * 3
}

/// One assembly attempt under the store's current seed: derive edges, orient,
/// solve the core, back-substitute along the reverse peel order. Returns the
/// number of edges actually built (after filtering), the vertex count, and the
/// cell table.
fn try_assemble(
    store: &ChunkedHashStore,
    width: u32,
    values: &ValueSource<'_>,
    filter: Option<&dyn Fn(u64) -> bool>,
) -> Option<(u64, u64, CompactList)> {
    let n = match filter {
        None => store.len(),
        Some(f) => {
            let mut kept = 0u64;
            for chunk in store.chunks() {
                kept += chunk.iter().filter(|rec| f(rec[3])).count() as u64;
            }
            kept
        }
    };
    if n == 0 || width == 0 {
        return Some((n, 0, CompactList::new(0, 0)));
    }
    let mask = if width == 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    };

    let m = vertex_count(n);
    let segment = m / 3;
    let mut vertex0 = Vec::with_capacity(n as usize);
    let mut vertex1 = Vec::with_capacity(n as usize);
    let mut vertex2 = Vec::with_capacity(n as usize);
    let mut d = vec![0u32; m as usize];
    let mut edge_value = Vec::with_capacity(n as usize);
    for chunk in store.chunks() {
        for rec in chunk {
            if let Some(f) = filter {
                if !f(rec[3]) {
                    continue;
                }
            }
            let v0 = (rec[0] % segment) as u32;
            let v1 = (segment + rec[1] % segment) as u32;
            let v2 = (2 * segment + rec[2] % segment) as u32;
            d[v0 as usize] += 1;
            d[v1 as usize] += 1;
            d[v2 as usize] += 1;
            vertex0.push(v0);
            vertex1.push(v1);
            vertex2.push(v2);
            edge_value.push(values.get(rec[3]) & mask);
        }
    }

    let orientation = orient(&mut d, &vertex0, &vertex1, &vertex2, 0)?;
    let mut data = CompactList::new(width, m);

    if !orientation.core.is_empty() {
        // Cells of the 2-core are constrained jointly; solve them as an XOR
        // system before the peel is unwound.
        let mut cols: Vec<u32> = Vec::with_capacity(orientation.core.len() * 3);
        for &e in &orientation.core {
            cols.push(vertex0[e as usize]);
            cols.push(vertex1[e as usize]);
            cols.push(vertex2[e as usize]);
        }
        cols.sort_unstable();
        cols.dedup();
        let nwords = cols.len().div_ceil(64);
        let rows: Vec<(Vec<u64>, u64)> = orientation
            .core
            .iter()
            .map(|&e| {
                let mut bits = vec![0u64; nwords];
                for v in [
                    vertex0[e as usize],
                    vertex1[e as usize],
                    vertex2[e as usize],
                ] {
                    let c = cols.binary_search(&v).unwrap();
                    bits[c >> 6] |= 1u64 << (c & 63);
                }
                (bits, edge_value[e as usize])
            })
            .collect();
        let solution = solve_xor_system(rows, cols.len())?;
        for (c, &v) in cols.iter().enumerate() {
            data.set(v as u64, solution[c]);
        }
    }

    for &e in orientation.peel_order.iter().rev() {
        let ei = e as usize;
        let hinge = orientation.hinges[ei];
        let (a, b) = if hinge == vertex0[ei] {
            (vertex1[ei], vertex2[ei])
        } else if hinge == vertex1[ei] {
            (vertex0[ei], vertex2[ei])
        } else {
            (vertex0[ei], vertex1[ei])
        };
        let cell = edge_value[ei] ^ data.get(a as u64) ^ data.get(b as u64);
        data.set(hinge as u64, cell);
    }

    Some((n, m, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{jenkins, XorShift64};

    fn random_keys(count: usize, seed: u64) -> Vec<BitVector> {
        let mut rng = XorShift64::seeded(seed);
        let mut set = std::collections::BTreeSet::new();
        while set.len() < count {
            let len = 3 + (rng.next() % 16) as usize;
            let bytes: Vec<u8> = (0..len).map(|_| (rng.next() % 255) as u8 + 1).collect();
            set.insert(bytes);
        }
        set.iter().map(|b| BitVector::from_bytes(b)).collect()
    }

    #[test]
    fn stores_and_recovers_values() {
        let keys = random_keys(2000, 17);
        let mut rng = XorShift64::seeded(23);
        let values: Vec<u64> = (0..keys.len()).map(|_| rng.next() & 0x3FF).collect();
        let f = MwhcBuilder::new()
            .keys(&keys)
            .values(ValueSource::Slice(&values))
            .build()
            .unwrap();
        assert_eq!(f.width(), 10);
        for (bv, &v) in keys.iter().zip(&values) {
            assert_eq!(f.get(bv), v);
        }
    }

    #[test]
    fn indirect_mode_matches_direct() {
        let keys = random_keys(500, 31);
        let values: Vec<u64> = (0..keys.len() as u64).map(|i| i % 97).collect();
        let direct = MwhcBuilder::new()
            .keys(&keys)
            .values(ValueSource::Slice(&values))
            .width(7)
            .build()
            .unwrap();
        let indirect = MwhcBuilder::new()
            .keys(&keys)
            .values(ValueSource::Indexed {
                get: &|i| i % 97,
                len: keys.len() as u64,
            })
            .width(7)
            .build()
            .unwrap();
        assert_eq!(direct, indirect);
    }

    #[test]
    fn shared_store_functions_agree_on_triples() {
        let keys = random_keys(800, 41);
        let mut store = ChunkedHashStore::new_in_memory(DEFAULT_SEED);
        for bv in &keys {
            store.add(bv).unwrap();
        }
        store.check_and_retry().unwrap();

        let low = MwhcBuilder::new()
            .store(&store)
            .values(ValueSource::Indexed {
                get: &|i| i & 0xF,
                len: keys.len() as u64,
            })
            .width(4)
            .build()
            .unwrap();
        let high = MwhcBuilder::new()
            .store(&store)
            .values(ValueSource::Indexed {
                get: &|i| i >> 4,
                len: keys.len() as u64,
            })
            .width(9)
            .build()
            .unwrap();
        assert_eq!(low.seed(), high.seed());
        for (i, bv) in keys.iter().enumerate() {
            let triple = jenkins(bv, store.seed());
            let rebuilt = (high.get_by_triple(&triple) << 4) | low.get_by_triple(&triple);
            assert_eq!(rebuilt, i as u64);
        }
    }

    #[test]
    fn serialization_round_trip() {
        let keys = random_keys(300, 53);
        let values: Vec<u64> = (0..keys.len() as u64).collect();
        let f = MwhcBuilder::new()
            .keys(&keys)
            .values(ValueSource::Slice(&values))
            .build()
            .unwrap();
        let mut buf = Vec::new();
        f.write_to(&mut buf);
        let back = MwhcFunction::read_from(&mut crate::Cursor::new(&buf)).unwrap();
        assert_eq!(f, back);
    }

    #[test]
    fn width_zero_is_storage_free() {
        let keys = random_keys(64, 67);
        let values = vec![0u64; keys.len()];
        let f = MwhcBuilder::new()
            .keys(&keys)
            .values(ValueSource::Slice(&values))
            .build()
            .unwrap();
        assert_eq!(f.num_bits(), 0);
        for bv in &keys {
            assert_eq!(f.get(bv), 0);
        }
    }
}
