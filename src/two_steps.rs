//! Layered retrieval for skewed value distributions.
//!
//! A narrow first function stores a rank code for the most frequent values
//! (code 0 meaning "rare"); a second, full-width function stores only the
//! rare ones. For the LCP-length distribution of a monotone hash this beats a
//! single full-width function by a wide margin.

use crate::bits::ceil_log2;
use crate::error::BuildError;
use crate::hash::jenkins;
use crate::mwhc::{MwhcBuilder, MwhcFunction, ValueSource, GAMMA};
use crate::store::ChunkedHashStore;
use crate::BitVector;
use hashbrown::HashMap;

/// `W(x) = -ln(-1/x) - ln(ln(-1/x))`, the Lambert-W approximation used by the
/// space-planning closed form. Valid for `x` in `(-1/e, 0)`.
fn lambert_w(x: f64) -> f64 {
    let l = (-1.0 / x).ln();
    -l - l.ln()
}

/// Closed-form threshold `s(p, r)` splitting frequent from rare values, where
/// `p` is the probability of the mean-ranked value and `r` the full width.
pub(crate) fn threshold(p: f64, r: u32) -> f64 {
    let x = 1.0 / (std::f64::consts::LN_2 * (r as f64 + GAMMA) * (p - 1.0));
    (lambert_w(x) / (1.0 - p).ln()).log2()
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct TwoStepsMwhc {
    n: u64,
    /// Width of the raw values (and of the remainder function).
    pub width: u32,
    /// Mean rank of a key's value in frequency order; consumed by callers for
    /// space forecasts.
    pub rank_mean: f64,
    rank_table: Vec<u64>,
    ranks: MwhcFunction,
    remainder: Option<MwhcFunction>,
}

impl TwoStepsMwhc {
    #[inline]
    pub fn len(&self) -> u64 {
        self.n
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    #[inline]
    pub fn seed(&self) -> u64 {
        self.ranks.seed()
    }

    #[inline]
    pub fn get(&self, bv: &BitVector) -> u64 {
        self.get_by_triple(&jenkins(bv, self.ranks.seed()))
    }

    pub fn get_by_triple(&self, triple: &[u64; 3]) -> u64 {
        let code = self.ranks.get_by_triple(triple);
        if code != 0 {
            let idx = (code - 1) as usize;
            if idx < self.rank_table.len() {
                return self.rank_table[idx];
            }
            return 0;
        }
        match &self.remainder {
            Some(rest) => rest.get_by_triple(triple),
            None => 0,
        }
    }

    pub fn num_bits(&self) -> u64 {
        self.ranks.num_bits()
            + self.remainder.as_ref().map_or(0, MwhcFunction::num_bits)
            + self.rank_table.len() as u64 * 64
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.n.to_le_bytes());
        out.extend_from_slice(&self.width.to_le_bytes());
        out.extend_from_slice(&self.rank_mean.to_bits().to_le_bytes());
        out.extend_from_slice(&(self.rank_table.len() as u64).to_le_bytes());
        for &v in &self.rank_table {
            out.extend_from_slice(&v.to_le_bytes());
        }
        self.ranks.write_to(out);
        match &self.remainder {
            Some(rest) => {
                out.push(1);
                rest.write_to(out);
            }
            None => out.push(0),
        }
    }

    pub fn read_from(cursor: &mut crate::Cursor<'_>) -> Option<Self> {
        let n = cursor.read_u64()?;
        let width = cursor.read_u32()?;
        let rank_mean = f64::from_bits(cursor.read_u64()?);
        let table_len = cursor.read_u64()? as usize;
        let mut rank_table = Vec::with_capacity(table_len);
        for _ in 0..table_len {
            rank_table.push(cursor.read_u64()?);
        }
        let ranks = MwhcFunction::read_from(cursor)?;
        let remainder = match cursor.read_u8()? {
            0 => None,
            1 => Some(MwhcFunction::read_from(cursor)?),
            _ => return None,
        };
        Some(Self {
            n,
            width,
            rank_mean,
            rank_table,
            ranks,
            remainder,
        })
    }
}

/// Builder for [`TwoStepsMwhc`]. Always works off a shared, checked store so
/// the layered lookup and its siblings agree on one seed.
pub struct TwoStepsBuilder<'a> {
    store: Option<&'a ChunkedHashStore>,
    values: Option<ValueSource<'a>>,
}

impl<'a> TwoStepsBuilder<'a> {
    pub fn new() -> Self {
        Self {
            store: None,
            values: None,
        }
    }

    pub fn store(mut self, store: &'a ChunkedHashStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn values(mut self, values: ValueSource<'a>) -> Self {
        self.values = Some(values);
        self
    }

    pub fn build(self) -> Result<TwoStepsMwhc, BuildError> {
        let store = self.store.expect("a checked store is required");
        let values = self.values.expect("value source is required");
        let n = store.len();

        let mut counts: HashMap<u64, u64> = HashMap::new();
        let mut max_value = 0u64;
        for i in 0..n {
            let v = values.get(i);
            *counts.entry(v).or_insert(0) += 1;
            max_value = max_value.max(v);
        }
        let width = ceil_log2(max_value + 1);

        if width == 0 {
            // All values are zero; both layers are storage-free.
            let ranks = MwhcBuilder::new()
                .store(store)
                .values(values)
                .width(0)
                .build()?;
            return Ok(TwoStepsMwhc {
                n,
                width: 0,
                rank_mean: 0.0,
                rank_table: Vec::new(),
                ranks,
                remainder: None,
            });
        }

        // Frequency order with a value tie-break keeps the build reproducible.
        let mut freq: Vec<(u64, u64)> = counts.into_iter().collect();
        freq.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let rank_mean = freq
            .iter()
            .enumerate()
            .map(|(rank, &(_, count))| rank as f64 * count as f64)
            .sum::<f64>()
            / n as f64;

        let p = 1.0 / (rank_mean + 1.0);
        let mut s = if rank_mean == 0.0 {
            1.0
        } else {
            threshold(p, width)
        };
        if !s.is_finite() {
            s = 1.0;
        }
        let cap = ceil_log2(freq.len() as u64 + 1).clamp(1, 63);
        let s = (s.round() as i64).clamp(1, cap as i64) as u32;

        let frequent = ((1u64 << s) - 1).min(freq.len() as u64) as usize;
        let rank_table: Vec<u64> = freq[..frequent].iter().map(|&(v, _)| v).collect();
        let code_of: HashMap<u64, u64> = rank_table
            .iter()
            .enumerate()
            .map(|(i, &v)| (v, i as u64 + 1))
            .collect();

        let rank_value = |i: u64| code_of.get(&values.get(i)).copied().unwrap_or(0);
        let ranks = MwhcBuilder::new()
            .store(store)
            .values(ValueSource::Indexed {
                get: &rank_value,
                len: n,
            })
            .width(s)
            .build()?;

        let is_rare = |i: u64| !code_of.contains_key(&values.get(i));
        let has_rare = (0..n).any(&is_rare);
        let remainder = if has_rare {
            Some(
                MwhcBuilder::new()
                    .store(store)
                    .values(ValueSource::Indexed {
                        get: &|i| values.get(i),
                        len: n,
                    })
                    .width(width)
                    .filter(&is_rare)
                    .build()?,
            )
        } else {
            None
        };

        Ok(TwoStepsMwhc {
            n,
            width,
            rank_mean,
            rank_table,
            ranks,
            remainder,
        })
    }
}

impl<'a> Default for TwoStepsBuilder<'a> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::XorShift64;
    use crate::mwhc::DEFAULT_SEED;

    fn keyed_store(count: usize, seed: u64) -> (Vec<BitVector>, ChunkedHashStore) {
        let mut rng = XorShift64::seeded(seed);
        let mut set = std::collections::BTreeSet::new();
        while set.len() < count {
            let len = 4 + (rng.next() % 10) as usize;
            let bytes: Vec<u8> = (0..len).map(|_| (rng.next() % 255) as u8 + 1).collect();
            set.insert(bytes);
        }
        let keys: Vec<BitVector> = set.iter().map(|b| BitVector::from_bytes(b)).collect();
        let mut store = ChunkedHashStore::new_in_memory(DEFAULT_SEED);
        for bv in &keys {
            store.add(bv).unwrap();
        }
        store.check_and_retry().unwrap();
        (keys, store)
    }

    #[test]
    fn skewed_distribution_round_trips() {
        let (keys, store) = keyed_store(2000, 3);
        // ~90% of keys share a handful of values, the rest spread wide.
        let value_of = |i: u64| {
            if i % 10 != 0 {
                i % 4
            } else {
                100 + (i * 37) % 4000
            }
        };
        let f = TwoStepsBuilder::new()
            .store(&store)
            .values(ValueSource::Indexed {
                get: &value_of,
                len: keys.len() as u64,
            })
            .build()
            .unwrap();
        assert!(f.width >= 12, "width {}", f.width);
        for (i, bv) in keys.iter().enumerate() {
            assert_eq!(f.get(bv), value_of(i as u64), "key {i}");
        }
        // The frequent layer should be far narrower than the raw width.
        assert!(f.num_bits() < keys.len() as u64 * f.width as u64);
    }

    #[test]
    fn constant_values_need_no_remainder() {
        let (keys, store) = keyed_store(300, 5);
        let f = TwoStepsBuilder::new()
            .store(&store)
            .values(ValueSource::Indexed {
                get: &|_| 9,
                len: keys.len() as u64,
            })
            .build()
            .unwrap();
        assert!((f.rank_mean - 0.0).abs() < f64::EPSILON);
        for bv in &keys {
            assert_eq!(f.get(bv), 9);
        }
    }

    #[test]
    fn all_zero_values_are_storage_free() {
        let (keys, store) = keyed_store(200, 7);
        let f = TwoStepsBuilder::new()
            .store(&store)
            .values(ValueSource::Indexed {
                get: &|_| 0,
                len: keys.len() as u64,
            })
            .build()
            .unwrap();
        assert_eq!(f.num_bits(), 0);
        for bv in &keys {
            assert_eq!(f.get(bv), 0);
        }
    }

    #[test]
    fn serialization_round_trip() {
        let (keys, store) = keyed_store(600, 11);
        let value_of = |i: u64| if i % 5 == 0 { i % 1000 } else { 2 };
        let f = TwoStepsBuilder::new()
            .store(&store)
            .values(ValueSource::Indexed {
                get: &value_of,
                len: keys.len() as u64,
            })
            .build()
            .unwrap();
        let mut buf = Vec::new();
        f.write_to(&mut buf);
        let back = TwoStepsMwhc::read_from(&mut crate::Cursor::new(&buf)).unwrap();
        assert_eq!(f, back);
    }
}
