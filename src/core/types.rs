// Copyright 2022-2023 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::{fmt, ops::Range, str::FromStr};

use thiserror::Error;

/// The largest board any supported variant can have: 7 pits per side plus
/// the two stores.
pub const MAX_CELLS: usize = 16;

/// Largest supported number of pits per side.
pub const MAX_PITS: u8 = 7;

/// Largest supported number of starting seeds per pit.
pub const MAX_SEEDS: u8 = 6;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum VariantError {
    #[error("pits per side out of range (1..=7): {0}")]
    PitsOutOfRange(u8),
    #[error("starting seeds per pit out of range (1..=6): {0}")]
    SeedsOutOfRange(u8),
}

/// One of the two players. `One` owns the low half of the board and
/// maximizes the game value; `Two` owns the high half and minimizes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Player {
    One,
    Two,
}

impl Player {
    pub const fn toggle(self) -> Player {
        match self {
            Player::One => Player::Two,
            Player::Two => Player::One,
        }
    }

    /// 0 for `One`, 1 for `Two`. Used as a table and bit index.
    pub const fn index(self) -> usize {
        match self {
            Player::One => 0,
            Player::Two => 1,
        }
    }

    pub const fn from_index(index: usize) -> Player {
        if index == 0 {
            Player::One
        } else {
            Player::Two
        }
    }
}

impl fmt::Display for Player {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Player::One => write!(f, "player 1"),
            Player::Two => write!(f, "player 2"),
        }
    }
}

/// A Kalah variant, parameterized by pits per side and starting seeds per
/// pit. All board geometry derives from this pair.
///
/// The fixed cell layout for `pits = P`:
///   * `[0, P)`: player 1's pits,
///   * `P`: player 1's store,
///   * `[P + 1, 2P + 1)`: player 2's pits,
///   * `2P + 1`: player 2's store.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Variant {
    pits: u8,
    seeds: u8,
}

impl Variant {
    pub fn new(pits: u8, seeds: u8) -> Result<Variant, VariantError> {
        if pits == 0 || pits > MAX_PITS {
            return Err(VariantError::PitsOutOfRange(pits));
        }

        if seeds == 0 || seeds > MAX_SEEDS {
            return Err(VariantError::SeedsOutOfRange(seeds));
        }

        Ok(Variant { pits, seeds })
    }

    pub const fn pits(self) -> u8 {
        self.pits
    }

    pub const fn seeds(self) -> u8 {
        self.seeds
    }

    /// Total number of board cells, stores included.
    pub const fn cells(self) -> usize {
        2 * self.pits as usize + 2
    }

    /// Total seeds in play. This is also the `seeds_in_pits` value of the
    /// starting position, and therefore the last retrograde layer.
    pub const fn total_seeds(self) -> u8 {
        2 * self.pits * self.seeds
    }

    pub const fn store_of(self, player: Player) -> usize {
        match player {
            Player::One => self.pits as usize,
            Player::Two => 2 * self.pits as usize + 1,
        }
    }

    /// Cell indices of the given player's pits.
    pub const fn pits_of(self, player: Player) -> Range<usize> {
        match player {
            Player::One => 0..self.pits as usize,
            Player::Two => self.pits as usize + 1..2 * self.pits as usize + 1,
        }
    }

    /// The pit captured from when the last sown seed lands in `pit`. Not
    /// meaningful for store indices.
    pub const fn opposite(self, pit: usize) -> usize {
        2 * self.pits as usize - pit
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kalah({},{})", self.pits, self.seeds)
    }
}

impl FromStr for Variant {
    type Err = String;

    /// Parses a `PxS` shorthand such as `6x4`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pits, seeds) = s
            .split_once('x')
            .ok_or_else(|| format!("expected PxS, got {}", s))?;
        let pits = pits.parse::<u8>().map_err(|e| e.to_string())?;
        let seeds = seeds.parse::<u8>().map_err(|e| e.to_string())?;
        Variant::new(pits, seeds).map_err(|e| e.to_string())
    }
}
