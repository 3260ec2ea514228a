// Copyright 2022-2023 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Zobrist-style fingerprints for positions. Every position maps to a
//! 64-bit value by XORing one random constant per non-empty cell (keyed by
//! cell index and seed count) with one of two to-move constants.
//!
//! The constant table is an explicit per-run object, never a global.
//! Everything that computes fingerprints (the main process and every
//! worker) builds its own [`Table`] from the same fixed seed, so handles
//! across threads and across resumed runs always agree on every value.

use crate::core::{State, Variant};

struct Xorshift64 {
    state: u64,
}

impl Xorshift64 {
    const fn new(seed: u64) -> Xorshift64 {
        Xorshift64 { state: seed }
    }

    fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        self.state
    }
}

/// The documented fixed seed. Changing it invalidates every existing store.
pub const FINGERPRINT_SEED: u64 = 42;

/// Fingerprint constants for one variant. Sized for every cell index and
/// every seed count a cell could ever hold, so table lookups never fail.
pub struct Table {
    cells: Vec<u64>,
    to_move: [u64; 2],
    counts: usize,
}

impl Table {
    pub fn new(variant: Variant) -> Table {
        Table::with_seed(variant, FINGERPRINT_SEED)
    }

    fn with_seed(variant: Variant, seed: u64) -> Table {
        // A single store can in principle bank every seed in play, so the
        // per-cell constants cover counts up to the variant total.
        let counts = variant.total_seeds() as usize + 1;
        let mut rng = Xorshift64::new(seed);
        let mut cells = Vec::with_capacity(variant.cells() * counts);
        for _ in 0..variant.cells() * counts {
            cells.push(rng.next());
        }

        let to_move = [rng.next(), rng.next()];
        Table {
            cells,
            to_move,
            counts,
        }
    }

    /// The fingerprint of a state. Deterministic across processes and runs
    /// for tables built from the same seed.
    pub fn fingerprint(&self, state: &State) -> u64 {
        let mut hash = 0u64;
        for (index, &seeds) in state.board().iter().enumerate() {
            if seeds > 0 {
                hash ^= self.cells[index * self.counts + seeds as usize];
            }
        }

        hash ^ self.to_move[state.to_move().index()]
    }
}
