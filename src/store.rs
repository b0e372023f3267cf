//! Spillable hash store shared by all retrieval functions of one build.
//!
//! Keys stream in as bit vectors; the store keeps the packed payload (in
//! memory, or in a temp file when spilling) and, once checked, a sorted record
//! table of `(h0, h1, h2, index)` quadruples under a seed for which all
//! triples are pairwise distinct. Every function built from the same store
//! keys into the same hypergraph, which is what makes the composed query
//! (`lookup by triple`) coherent.

use crate::bits::{ceil_log2, BitVector};
use crate::error::BuildError;
use crate::hash::{jenkins, mix_salt};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// One stored key: hash triple plus the key's insertion rank.
pub type Record = [u64; 4];

/// Target number of records per chunk when iterating.
const CHUNK_TARGET: u64 = 1024;

/// How many seeds to try before declaring the input hopeless.
const MAX_ATTEMPTS: u32 = 64;

enum Payload {
    Memory(Vec<BitVector>),
    Disk {
        file: NamedTempFile,
        writer: BufWriter<std::fs::File>,
    },
}

pub struct ChunkedHashStore {
    base_seed: u64,
    attempt: u32,
    seed: u64,
    len: u64,
    payload: Payload,
    records: Vec<Record>,
    chunk_ends: Vec<usize>,
    checked: bool,
}

impl ChunkedHashStore {
    /// A store that keeps key payloads in memory. Used for small key sets
    /// such as the per-bucket distributor set.
    pub fn new_in_memory(base_seed: u64) -> Self {
        Self {
            base_seed,
            attempt: 0,
            seed: mix_salt(base_seed, 0),
            len: 0,
            payload: Payload::Memory(Vec::new()),
            records: Vec::new(),
            chunk_ends: Vec::new(),
            checked: false,
        }
    }

    /// A store that spills key payloads to a temp file in `temp_dir` (the OS
    /// temp directory when `None`). The file is removed when the store drops,
    /// whatever the build outcome.
    pub fn new_spilled(base_seed: u64, temp_dir: Option<&Path>) -> Result<Self, BuildError> {
        let dir = match temp_dir {
            Some(d) => d.to_path_buf(),
            None => std::env::temp_dir(),
        };
        let file = tempfile::Builder::new()
            .prefix("mmphf_store_")
            .tempfile_in(dir)?;
        let writer = BufWriter::new(file.reopen()?);
        Ok(Self {
            base_seed,
            attempt: 0,
            seed: mix_salt(base_seed, 0),
            len: 0,
            payload: Payload::Disk { file, writer },
            records: Vec::new(),
            chunk_ends: Vec::new(),
            checked: false,
        })
    }

    /// Ingests one key. Hashing is deferred to [`Self::check_and_retry`].
    pub fn add(&mut self, bv: &BitVector) -> Result<(), BuildError> {
        match &mut self.payload {
            Payload::Memory(keys) => keys.push(bv.clone()),
            Payload::Disk { writer, .. } => {
                writer.write_all(&bv.len().to_le_bytes())?;
                for &w in bv.words() {
                    writer.write_all(&w.to_le_bytes())?;
                }
            }
        }
        self.len += 1;
        self.checked = false;
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The seed under which the current records were hashed. Stable once
    /// [`Self::check_and_retry`] has returned successfully.
    #[inline]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Rescans the stored payload until a seed is found under which all hash
    /// triples are pairwise distinct. Bounded; exhausting the budget surfaces
    /// [`BuildError::ConstructionFailed`].
    pub fn check_and_retry(&mut self) -> Result<(), BuildError> {
        if let Payload::Disk { writer, .. } = &mut self.payload {
            writer.flush()?;
        }
        while self.attempt < MAX_ATTEMPTS {
            self.seed = mix_salt(self.base_seed, self.attempt);
            self.rehash()?;
            self.records.sort_unstable();
            let collision = self
                .records
                .windows(2)
                .any(|w| w[0][..3] == w[1][..3]);
            if !collision {
                self.rebuild_chunk_ends();
                self.checked = true;
                return Ok(());
            }
            self.attempt += 1;
        }
        Err(BuildError::ConstructionFailed)
    }

    /// Forces the next seed in the chain and re-checks. Called when a
    /// downstream hypergraph refuses to orient under the current seed.
    pub fn reseed(&mut self) -> Result<(), BuildError> {
        self.attempt += 1;
        self.checked = false;
        self.check_and_retry()
    }

    fn rehash(&mut self) -> Result<(), BuildError> {
        let seed = self.seed;
        self.records.clear();
        match &mut self.payload {
            Payload::Memory(keys) => {
                #[cfg(feature = "parallel")]
                {
                    self.records = keys
                        .par_iter()
                        .enumerate()
                        .map(|(i, bv)| {
                            let h = jenkins(bv, seed);
                            [h[0], h[1], h[2], i as u64]
                        })
                        .collect();
                }
                #[cfg(not(feature = "parallel"))]
                {
                    self.records.reserve(keys.len());
                    for (i, bv) in keys.iter().enumerate() {
                        let h = jenkins(bv, seed);
                        self.records.push([h[0], h[1], h[2], i as u64]);
                    }
                }
            }
            Payload::Disk { file, .. } => {
                self.records.reserve(self.len as usize);
                let mut reader = BufReader::new(file.reopen()?);
                let mut buf8 = [0u8; 8];
                for i in 0..self.len {
                    reader.read_exact(&mut buf8)?;
                    let bits = u64::from_le_bytes(buf8);
                    let nwords = bits.div_ceil(64) as usize;
                    let mut words = Vec::with_capacity(nwords);
                    for _ in 0..nwords {
                        reader.read_exact(&mut buf8)?;
                        words.push(u64::from_le_bytes(buf8));
                    }
                    let bv = BitVector::from_raw(bits, words);
                    let h = jenkins(&bv, seed);
                    self.records.push([h[0], h[1], h[2], i]);
                }
            }
        }
        Ok(())
    }

    fn rebuild_chunk_ends(&mut self) {
        self.chunk_ends.clear();
        if self.records.is_empty() {
            return;
        }
        let log2_chunks = ceil_log2(self.len.div_ceil(CHUNK_TARGET));
        if log2_chunks == 0 {
            self.chunk_ends.push(self.records.len());
            return;
        }
        let shift = 64 - log2_chunks;
        let mut current = self.records[0][0] >> shift;
        for (i, rec) in self.records.iter().enumerate() {
            let chunk = rec[0] >> shift;
            if chunk != current {
                self.chunk_ends.push(i);
                current = chunk;
            }
        }
        self.chunk_ends.push(self.records.len());
    }

    /// Iterates the record table chunk by chunk. Records within a chunk are in
    /// ascending triple order; chunks partition the `h0` space by high bits.
    /// Only valid after a successful [`Self::check_and_retry`].
    pub fn chunks(&self) -> impl Iterator<Item = &[Record]> {
        debug_assert!(self.checked || self.is_empty());
        let mut start = 0;
        self.chunk_ends.iter().map(move |&end| {
            let slice = &self.records[start..end];
            start = end;
            slice
        })
    }

    /// All records in ascending triple order.
    pub fn records(&self) -> &[Record] {
        debug_assert!(self.checked || self.is_empty());
        &self.records
    }
}
