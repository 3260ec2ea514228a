// Copyright 2022-2023 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Bit-packing of positions for storage. Five bits per board cell followed
//! by a single to-move bit, filled little-endian within each byte. The
//! layout is part of the on-disk format: workers and resumed runs unpack
//! bytes written by other processes, so it must never drift.

use thiserror::Error;

use crate::core::{Board, Player, State};

const BITS_PER_CELL: usize = 5;

/// The largest seed count one cell can encode.
pub const MAX_CELL_SEEDS: u8 = 31;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("cell {index} holds {seeds} seeds, more than the packable maximum of 31")]
    CellOverflow { index: usize, seeds: u8 },
}

/// Packed width in bytes for a variant with `pits` pits per side. Nine
/// bytes for Kalah(6,4): 14 cells at 5 bits plus the turn bit is 71 bits.
pub const fn packed_len(pits: u8) -> usize {
    ((2 * pits as usize + 2) * BITS_PER_CELL + 1 + 7) / 8
}

/// Packs a state into its on-disk byte representation. Fails if any cell
/// exceeds [`MAX_CELL_SEEDS`]; every variant in the supported range stays
/// under that bound by construction.
pub fn pack(state: &State) -> Result<Vec<u8>, CodecError> {
    let mut packed = vec![0u8; packed_len(state.pits())];
    let mut offset = 0usize;

    for (index, &seeds) in state.board().iter().enumerate() {
        if seeds > MAX_CELL_SEEDS {
            return Err(CodecError::CellOverflow { index, seeds });
        }

        for bit in 0..BITS_PER_CELL {
            if seeds & (1 << bit) != 0 {
                packed[offset / 8] |= 1 << (offset % 8);
            }
            offset += 1;
        }
    }

    if state.to_move() == Player::Two {
        packed[offset / 8] |= 1 << (offset % 8);
    }

    Ok(packed)
}

/// Reconstructs a state from packed bytes. Inverse of [`pack`] for every
/// state that packs successfully.
pub fn unpack(packed: &[u8], pits: u8) -> State {
    let cells = 2 * pits as usize + 2;
    let mut board = Board::new();
    let mut offset = 0usize;

    for _ in 0..cells {
        let mut seeds = 0u8;
        for bit in 0..BITS_PER_CELL {
            let byte = offset / 8;
            if byte < packed.len() && packed[byte] & (1 << (offset % 8)) != 0 {
                seeds |= 1 << bit;
            }
            offset += 1;
        }
        board.push(seeds);
    }

    let byte = offset / 8;
    let to_move = if byte < packed.len() && packed[byte] & (1 << (offset % 8)) != 0 {
        Player::Two
    } else {
        Player::One
    };

    State::from_cells(&board, to_move)
}
