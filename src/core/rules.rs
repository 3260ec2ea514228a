// Copyright 2022-2023 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The Kalah successor function: legal move generation, move application,
//! and the terminal test and score. Everything here is pure: the rules
//! read a [`State`] and produce values, never touching shared state.
//!
//! Moves are pit indices *relative to the mover*, in `[0, P)`. Player 2's
//! relative pit `m` is board cell `P + 1 + m`. Relative indexing keeps
//! stored best-move bytes meaningful without knowing whose turn it was.

use arrayvec::ArrayVec;

use crate::core::{Player, State, Variant, MAX_PITS};

/// Legal moves for one position. At most `P` entries.
pub type MoveList = ArrayVec<u8, { MAX_PITS as usize }>;

/// The board cell a relative move picks up from.
fn source_cell(state: &State, mov: u8) -> usize {
    match state.to_move {
        Player::One => mov as usize,
        Player::Two => state.pits() as usize + 1 + mov as usize,
    }
}

/// The mover's non-empty pits, in ascending relative order. Empty exactly
/// when the position is terminal.
pub fn legal_moves(state: &State) -> MoveList {
    let mut moves = MoveList::new();
    if is_terminal(state) {
        return moves;
    }

    for mov in 0..state.pits() {
        if state.board[source_cell(state, mov)] > 0 {
            moves.push(mov);
        }
    }

    moves
}

/// True when either side's pits are all empty. The game ends the moment
/// one side runs dry, regardless of whose turn it would be.
pub fn is_terminal(state: &State) -> bool {
    let variant = variant_of(state);
    let side_empty = |player| {
        variant
            .pits_of(player)
            .all(|cell| state.board[cell] == 0)
    };
    side_empty(Player::One) || side_empty(Player::Two)
}

/// Applies a legal move and returns the resulting position.
///
/// Sowing walks counter-clockwise, dropping one seed per cell and skipping
/// only the opponent's store. Landing in the mover's own store grants a
/// bonus turn; landing in a previously-empty own pit whose opposite pit is
/// non-empty captures both into the mover's store; anything else passes
/// the turn.
pub fn apply(state: &State, mov: u8) -> State {
    debug_assert!(legal_moves(state).contains(&mov), "illegal move {}", mov);

    let variant = variant_of(state);
    let mover = state.to_move;
    let own_store = variant.store_of(mover);
    let opponent_store = variant.store_of(mover.toggle());
    let cells = variant.cells();

    let mut board = state.board.clone();
    let source = source_cell(state, mov);
    let mut in_hand = board[source];
    board[source] = 0;

    let mut cell = source;
    while in_hand > 0 {
        cell = (cell + 1) % cells;
        if cell == opponent_store {
            continue;
        }

        board[cell] += 1;
        in_hand -= 1;
    }

    // Last seed in the mover's own store: the mover goes again.
    if cell == own_store {
        return State {
            board,
            to_move: mover,
        };
    }

    // Last seed filled a previously-empty own pit: capture it together
    // with the opposite pit, provided the opposite pit has seeds.
    if variant.pits_of(mover).contains(&cell) && board[cell] == 1 {
        let opposite = variant.opposite(cell);
        if board[opposite] > 0 {
            board[own_store] += board[cell] + board[opposite];
            board[cell] = 0;
            board[opposite] = 0;
        }
    }

    State {
        board,
        to_move: mover.toggle(),
    }
}

/// Final score of a terminal position, from player 1's perspective: each
/// side's leftover pit seeds sweep into that side's store, and the result
/// is store 1 minus store 2. Only meaningful when [`is_terminal`] holds.
pub fn terminal_score(state: &State) -> i32 {
    debug_assert!(is_terminal(state));

    let variant = variant_of(state);
    let side_total = |player: Player| -> i32 {
        let swept: u32 = variant
            .pits_of(player)
            .map(|cell| state.board[cell] as u32)
            .sum();
        swept as i32 + state.store(player) as i32
    };

    side_total(Player::One) - side_total(Player::Two)
}

fn variant_of(state: &State) -> Variant {
    // The board width always encodes a supported pit count; seeds per pit
    // is irrelevant to geometry, so any in-range value works.
    match Variant::new(state.pits(), 1) {
        Ok(variant) => variant,
        Err(_) => unreachable!("state with unsupported board width"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Variant;

    #[test]
    fn all_pits_legal_at_start() {
        let state = State::starting(Variant::new(4, 3).unwrap());
        let moves = legal_moves(&state);
        assert_eq!(&[0, 1, 2, 3], moves.as_slice());
    }

    #[test]
    fn empty_pits_are_not_legal() {
        let state = State::from_cells(&[0, 3, 0, 3, 0, 3, 3, 3, 3, 0], Player::One);
        assert_eq!(&[1, 3], legal_moves(&state).as_slice());
    }

    #[test]
    fn player_two_moves_are_relative() {
        let state = State::from_cells(&[3, 3, 3, 3, 0, 0, 3, 0, 3, 0], Player::Two);
        assert_eq!(&[1, 3], legal_moves(&state).as_slice());
    }

    #[test]
    fn simple_move_sows_and_passes_turn() {
        let state = State::starting(Variant::new(4, 3).unwrap());
        let next = apply(&state, 0);

        assert_eq!(0, next.cell(0));
        assert_eq!(4, next.cell(1));
        assert_eq!(4, next.cell(2));
        assert_eq!(4, next.cell(3));
        assert_eq!(0, next.cell(4));
        assert_eq!(Player::Two, next.to_move());
    }

    #[test]
    fn landing_in_own_store_grants_bonus_turn() {
        let state = State::from_cells(&[4, 3, 3, 3, 0, 3, 3, 3, 3, 0], Player::One);
        let next = apply(&state, 0);

        assert_eq!(1, next.cell(4));
        assert_eq!(Player::One, next.to_move());
    }

    #[test]
    fn capture_sweeps_both_pits() {
        let state = State::from_cells(&[0, 2, 0, 0, 0, 5, 0, 0, 0, 0], Player::One);
        let next = apply(&state, 1);

        assert_eq!(
            &[0, 0, 0, 0, 6, 0, 0, 0, 0, 0],
            next.board(),
            "landing seed plus the opposite pit move to the store"
        );
        assert_eq!(Player::Two, next.to_move());
    }

    #[test]
    fn landing_in_occupied_own_pit_does_not_capture() {
        let state = State::from_cells(&[0, 1, 1, 0, 0, 5, 0, 0, 0, 0], Player::One);
        let next = apply(&state, 1);

        // The last seed lands in pit 2, which already held a seed, so no
        // capture fires even though the opposite pit is full.
        assert_eq!(2, next.cell(2));
        assert_eq!(5, next.cell(5));
        assert_eq!(0, next.cell(4));
        assert_eq!(Player::Two, next.to_move());
    }

    #[test]
    fn landing_opposite_empty_pit_does_not_capture() {
        let state = State::from_cells(&[0, 2, 0, 0, 0, 0, 5, 0, 0, 0], Player::One);
        let next = apply(&state, 1);

        // Opposite of pit 3 is pit 5, which is empty: the seed stays put.
        assert_eq!(1, next.cell(3));
        assert_eq!(0, next.cell(4));
    }

    #[test]
    fn sowing_skips_opponent_store() {
        // Ten seeds from pit 3 wrap the whole board; the opponent's store
        // at cell 9 must stay empty while everything else gains a seed.
        let state = State::from_cells(&[1, 1, 1, 10, 0, 1, 1, 1, 1, 0], Player::One);
        let next = apply(&state, 3);

        assert_eq!(0, next.cell(9));
        assert_eq!(2, next.cell(5));
        assert_eq!(2, next.cell(0));
        // Wrapped past the start: pit 3 restarted from zero and gained the
        // wrap seed, and the tenth seed landed in the mover's store.
        assert_eq!(1, next.cell(3));
        assert_eq!(2, next.cell(4));
        assert_eq!(Player::One, next.to_move());
    }

    #[test]
    fn terminal_when_either_side_is_empty() {
        let one_empty = State::from_cells(&[0, 0, 0, 0, 10, 2, 3, 4, 5, 5], Player::One);
        assert!(is_terminal(&one_empty));

        let two_empty = State::from_cells(&[1, 0, 0, 2, 10, 0, 0, 0, 0, 5], Player::Two);
        assert!(is_terminal(&two_empty));

        let live = State::starting(Variant::new(4, 3).unwrap());
        assert!(!is_terminal(&live));
    }

    #[test]
    fn legal_moves_empty_iff_terminal() {
        let terminal = State::from_cells(&[0, 0, 0, 0, 10, 2, 3, 4, 5, 5], Player::Two);
        assert!(is_terminal(&terminal));
        assert!(legal_moves(&terminal).is_empty());

        let live = State::from_cells(&[0, 1, 0, 0, 0, 0, 0, 0, 1, 0], Player::One);
        assert!(!is_terminal(&live));
        assert!(!legal_moves(&live).is_empty());
    }

    #[test]
    fn terminal_score_sweeps_remaining_seeds() {
        let state = State::from_cells(&[0, 0, 0, 0, 10, 2, 3, 4, 5, 5], Player::One);
        // Player 1 banks 10; player 2 banks 5 + (2 + 3 + 4 + 5) = 19.
        assert_eq!(-9, terminal_score(&state));
    }

    #[test]
    fn terminal_score_without_leftovers() {
        let state = State::from_cells(&[0, 0, 0, 0, 15, 0, 0, 0, 0, 9], Player::One);
        assert_eq!(6, terminal_score(&state));
    }

    #[test]
    fn seeds_in_pits_never_increases() {
        // Random-ish walk from the Kalah(4,3) start; the invariant must
        // hold along every edge, not just in aggregate.
        let mut state = State::starting(Variant::new(4, 3).unwrap());
        let mut step = 0usize;
        while !is_terminal(&state) && step < 200 {
            let moves = legal_moves(&state);
            let mov = moves[step % moves.len()];
            let next = apply(&state, mov);
            assert!(
                next.seeds_in_pits() <= state.seeds_in_pits(),
                "seeds_in_pits increased applying {} to {:?}",
                mov,
                state
            );
            assert_eq!(state.total_seeds(), next.total_seeds());
            state = next;
            step += 1;
        }
    }
}
