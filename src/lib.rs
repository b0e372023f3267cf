//! monotone_mph — monotone minimal perfect hashing (LCP distributors + 3-XOR
//! retrieval).
//!
//! - Build once on a **sorted, distinct, prefix-free** key set.
//! - O(1) lookups: key -> its rank in `[0..n)`, a few bits per key.
//! - Robust: unsolvable hypergraphs and hash collisions reseed
//!   deterministically; queries never fail, they return a sentinel.
//!
//! ```
//! use monotone_mph::Builder;
//!
//! let keys = ["apple", "banana", "cherry", "date"];
//! let mmphf = Builder::new().build(keys).unwrap();
//! assert_eq!(mmphf.rank("cherry"), 2);
//! ```

mod bits;
mod error;
mod hash;
mod hypergraph;
mod monotone;
mod mwhc;
mod store;
mod transform;
mod two_steps;

pub use bits::{BitSet, BitVector, CompactList};
pub use error::BuildError;
pub use hypergraph::direct_hyperedges;
pub use monotone::{BuildConfig, Builder, MonotoneMphf};
pub use mwhc::{MwhcBuilder, MwhcFunction, ValueSource, GAMMA};
pub use store::{ChunkedHashStore, Record};
pub use transform::Transform;
pub use two_steps::{TwoStepsBuilder, TwoStepsMwhc};

/// Little-endian reader over a serialized buffer.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        if self.pos + 1 > self.buf.len() {
            return None;
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Some(v)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        if self.pos + 4 > self.buf.len() {
            return None;
        }
        let mut array = [0u8; 4];
        array.copy_from_slice(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Some(u32::from_le_bytes(array))
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        if self.pos + 8 > self.buf.len() {
            return None;
        }
        let mut array = [0u8; 8];
        array.copy_from_slice(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Some(u64::from_le_bytes(array))
    }

    pub fn read_bytes(&mut self, out: &mut [u8]) -> Option<()> {
        if self.pos + out.len() > self.buf.len() {
            return None;
        }
        out.copy_from_slice(&self.buf[self.pos..self.pos + out.len()]);
        self.pos += out.len();
        Some(())
    }
}
