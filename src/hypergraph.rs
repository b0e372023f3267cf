//! 3-uniform hypergraph orientation engine.
//!
//! Every retrieval function maps each key to a hyperedge `(v0, v1, v2)` drawn
//! from three disjoint vertex segments. Construction needs each edge directed
//! at a distinct "hinge" vertex such that cell values can be assigned without
//! clobbering earlier edges: degree-1 vertices are stripped first (recording a
//! peel order), and the residual 2-core, if any, is oriented by augmenting
//! paths. Core cell values are then fixed by solving the XOR system directly.

use crate::bits::BitSet;
use hashbrown::HashMap;

/// Result of directing all hyperedges.
#[derive(Debug)]
pub(crate) struct Orientation {
    /// Hinge vertex of each edge (global vertex id).
    pub hinges: Vec<u32>,
    /// Peeled edge ids, in peel sequence. Assignment walks this in reverse.
    pub peel_order: Vec<u32>,
    /// Edge ids left in the 2-core, ascending. Their cells are fixed by
    /// solving the XOR system, not by back-substitution along the peel.
    pub core: Vec<u32>,
}

const NO_HINGE: u32 = u32::MAX;

/// Directs the hyperedges of the graph described by the three vertex arrays.
///
/// `d[v - vertex_offset]` must hold the degree of vertex `v`. Returns `None`
/// when some subset of edges has fewer incident vertices than edges, in which
/// case the caller reseeds.
pub(crate) fn orient(
    d: &mut [u32],
    vertex0: &[u32],
    vertex1: &[u32],
    vertex2: &[u32],
    vertex_offset: u32,
) -> Option<Orientation> {
    let n = vertex0.len();
    debug_assert_eq!(n, vertex1.len());
    debug_assert_eq!(n, vertex2.len());

    // XOR summary per vertex: a degree-1 vertex names its unique edge.
    let mut edge_xor = vec![0u32; d.len()];
    for e in 0..n {
        edge_xor[(vertex0[e] - vertex_offset) as usize] ^= e as u32;
        edge_xor[(vertex1[e] - vertex_offset) as usize] ^= e as u32;
        edge_xor[(vertex2[e] - vertex_offset) as usize] ^= e as u32;
    }

    let mut work: Vec<u32> = Vec::new();
    for (i, &deg) in d.iter().enumerate() {
        if deg == 1 {
            work.push(i as u32 + vertex_offset);
        }
    }

    let mut hinges = vec![NO_HINGE; n];
    let mut peel_order = Vec::with_capacity(n);

    while let Some(v) = work.pop() {
        let vi = (v - vertex_offset) as usize;
        if d[vi] != 1 {
            continue;
        }
        let e = edge_xor[vi];
        hinges[e as usize] = v;
        peel_order.push(e);
        for u in [
            vertex0[e as usize],
            vertex1[e as usize],
            vertex2[e as usize],
        ] {
            let ui = (u - vertex_offset) as usize;
            d[ui] -= 1;
            edge_xor[ui] ^= e;
            if d[ui] == 1 {
                work.push(u);
            }
        }
    }

    if peel_order.len() == n {
        return Some(Orientation {
            hinges,
            peel_order,
            core: Vec::new(),
        });
    }

    // Orient the 2-core: each remaining edge claims a distinct vertex of its
    // own, displacing previous claims along augmenting paths.
    let core: Vec<u32> = (0..n as u32)
        .filter(|&e| hinges[e as usize] == NO_HINGE)
        .collect();
    let mut owner: HashMap<u32, u32> = HashMap::with_capacity(core.len() * 2);
    let mut visited = BitSet::new(d.len());
    for &e in &core {
        visited.clear();
        if !claim(
            e,
            vertex0,
            vertex1,
            vertex2,
            vertex_offset,
            &mut owner,
            &mut visited,
        ) {
            return None;
        }
    }
    for (&v, &e) in &owner {
        hinges[e as usize] = v;
    }

    Some(Orientation {
        hinges,
        peel_order,
        core,
    })
}

fn claim(
    e: u32,
    vertex0: &[u32],
    vertex1: &[u32],
    vertex2: &[u32],
    vertex_offset: u32,
    owner: &mut HashMap<u32, u32>,
    visited: &mut BitSet,
) -> bool {
    for v in [
        vertex0[e as usize],
        vertex1[e as usize],
        vertex2[e as usize],
    ] {
        let vi = (v - vertex_offset) as usize;
        if visited.test(vi) {
            continue;
        }
        visited.set(vi);
        match owner.get(&v).copied() {
            None => {
                owner.insert(v, e);
                return true;
            }
            Some(holder) => {
                if claim(holder, vertex0, vertex1, vertex2, vertex_offset, owner, visited) {
                    owner.insert(v, e);
                    return true;
                }
            }
        }
    }
    false
}

/// Tests whether the hypergraph can be fully directed: every edge ends up with
/// a hinge among its own three vertices, all hinges distinct, and the peeled
/// part admits a valid strip order. On success `hinges[i]` holds edge `i`'s
/// hinge vertex.
pub fn direct_hyperedges(
    d: &mut [u32],
    vertex0: &[u32],
    vertex1: &[u32],
    vertex2: &[u32],
    hinges: &mut [u32],
    vertex_offset: u32,
) -> bool {
    match orient(d, vertex0, vertex1, vertex2, vertex_offset) {
        Some(orientation) => {
            hinges.copy_from_slice(&orientation.hinges);
            true
        }
        None => false,
    }
}

/// Solves a sparse XOR system over GF(2) by dense elimination.
///
/// Each row is a bit set over `ncols` unknowns plus a right-hand side of up to
/// 64 bits. Returns one solution (free unknowns zero), or `None` if the system
/// is inconsistent.
pub(crate) fn solve_xor_system(
    rows: Vec<(Vec<u64>, u64)>,
    ncols: usize,
) -> Option<Vec<u64>> {
    let mut pivot_of_col: Vec<usize> = vec![usize::MAX; ncols];
    let mut pivots: Vec<(usize, Vec<u64>, u64)> = Vec::new();

    for (mut bits, mut rhs) in rows {
        loop {
            let Some(col) = first_set_bit(&bits) else {
                if rhs != 0 {
                    return None;
                }
                break;
            };
            let p = pivot_of_col[col];
            if p == usize::MAX {
                pivot_of_col[col] = pivots.len();
                pivots.push((col, bits, rhs));
                break;
            }
            for (w, pw) in bits.iter_mut().zip(&pivots[p].1) {
                *w ^= pw;
            }
            rhs ^= pivots[p].2;
        }
    }

    // A pivot column is the smallest set column of its row, so walking pivots
    // by decreasing column sees every other column of a row (later pivot or
    // free unknown) already resolved.
    let mut order: Vec<usize> = (0..pivots.len()).collect();
    order.sort_unstable_by(|&a, &b| pivots[b].0.cmp(&pivots[a].0));
    let mut solution = vec![0u64; ncols];
    for &p in &order {
        let (col, bits, rhs) = &pivots[p];
        let mut value = *rhs;
        for c in set_bits(bits) {
            if c != *col {
                value ^= solution[c];
            }
        }
        solution[*col] = value;
    }
    Some(solution)
}

#[inline]
fn first_set_bit(words: &[u64]) -> Option<usize> {
    for (i, &w) in words.iter().enumerate() {
        if w != 0 {
            return Some(i * 64 + w.trailing_zeros() as usize);
        }
    }
    None
}

fn set_bits(words: &[u64]) -> impl Iterator<Item = usize> + '_ {
    words.iter().enumerate().flat_map(|(i, &w)| {
        let mut w = w;
        std::iter::from_fn(move || {
            if w == 0 {
                return None;
            }
            let b = w.trailing_zeros() as usize;
            w &= w - 1;
            Some(i * 64 + b)
        })
    })
}
