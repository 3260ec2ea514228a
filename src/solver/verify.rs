// Copyright 2022-2023 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Post-solve verification: one full pass over a solved store checking
//! the invariants the pipeline promises. Terminal records must carry the
//! swept score and no move; non-terminal records must carry a legal,
//! optimal, lowest-index move whose successor value matches; every
//! successor must exist within one depth; and stored fingerprints must
//! match recomputation. An offline tool; it trades speed for certainty.

use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    codec,
    config::Config,
    core::{rules, Player},
    solver::SolveError,
    store::{OpenOptions, Record, Store},
    zobrist,
};

/// How many individual violations are logged before the report goes
/// counts-only.
const LOGGED_VIOLATIONS: u64 = 20;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VerifySummary {
    pub records: u64,
    pub violations: u64,
}

impl VerifySummary {
    pub fn is_clean(&self) -> bool {
        self.violations == 0
    }
}

struct Verifier<'a> {
    store: &'a Store,
    table: &'a zobrist::Table,
    pits: u8,
    summary: VerifySummary,
}

impl Verifier<'_> {
    fn violation(&mut self, record: &Record, what: &str) {
        self.summary.violations += 1;
        if self.summary.violations <= LOGGED_VIOLATIONS {
            warn!(
                fingerprint = %format!("{:#018x}", record.fingerprint),
                depth = record.depth,
                seeds_in_pits = record.seeds_in_pits,
                what,
                "invariant violation"
            );
        }
    }

    fn check(&mut self, record: Record) -> Result<(), SolveError> {
        self.summary.records += 1;
        let state = codec::unpack(&record.packed, self.pits);

        if self.table.fingerprint(&state) != record.fingerprint {
            self.violation(&record, "stored fingerprint does not match the packed state");
            return Ok(());
        }

        if record.seeds_in_pits != state.seeds_in_pits() {
            self.violation(&record, "cached seeds_in_pits is wrong");
        }

        let value = match record.value {
            Some(value) => value,
            None => {
                self.violation(&record, "record is unsolved");
                return Ok(());
            }
        };

        if rules::is_terminal(&state) {
            if value as i32 != rules::terminal_score(&state) {
                self.violation(&record, "terminal value is not the swept score");
            }
            if record.best_move.is_some() {
                self.violation(&record, "terminal record carries a best move");
            }
            return Ok(());
        }

        let best_move = match record.best_move {
            Some(best_move) => best_move,
            None => {
                self.violation(&record, "non-terminal record has no best move");
                return Ok(());
            }
        };

        let moves = rules::legal_moves(&state);
        if !moves.contains(&best_move) {
            self.violation(&record, "best move is not legal");
            return Ok(());
        }

        let maximizing = state.to_move() == Player::One;
        let mut optimal: Option<(i8, u8)> = None;
        let mut achieved = None;
        for mov in moves {
            let successor = rules::apply(&state, mov);
            if successor.seeds_in_pits() > state.seeds_in_pits() {
                self.violation(&record, "successor gained seeds in pits");
            }

            let child = match self.store.get(self.table.fingerprint(&successor))? {
                Some(child) => child,
                None => {
                    self.violation(&record, "successor missing from the store");
                    return Ok(());
                }
            };
            if child.depth > record.depth + 1 {
                self.violation(&record, "successor depth exceeds parent depth + 1");
            }

            let child_value = match child.value {
                Some(child_value) => child_value,
                None => {
                    self.violation(&record, "successor is unsolved");
                    return Ok(());
                }
            };

            if mov == best_move {
                achieved = Some(child_value);
            }
            let better = match optimal {
                None => true,
                Some((best, _)) => {
                    if maximizing {
                        child_value > best
                    } else {
                        child_value < best
                    }
                }
            };
            if better {
                optimal = Some((child_value, mov));
            }
        }

        match optimal {
            Some((optimal_value, optimal_move)) => {
                if optimal_value != value {
                    self.violation(&record, "value is not the min/max over successors");
                }
                if achieved != Some(value) {
                    self.violation(&record, "best move does not achieve the value");
                }
                if optimal_move != best_move {
                    self.violation(&record, "best move is not the lowest-index optimum");
                }
            }
            None => self.violation(&record, "non-terminal record has no successors"),
        }

        Ok(())
    }
}

/// Verifies a solved store. Returns the scan summary; a non-empty
/// violation count means the store cannot be trusted.
pub fn run(config: &Config, table: &Arc<zobrist::Table>) -> Result<VerifySummary, SolveError> {
    let store = Store::open(
        &config.store_path,
        &OpenOptions::handle(config.durability),
    )?;

    info!(variant = %config.variant, "verifying solved store");
    let mut verifier = Verifier {
        store: &store,
        table,
        pits: config.variant.pits(),
        summary: VerifySummary::default(),
    };

    let max_depth = store.max_depth()?;
    for depth in 0..=max_depth.max(0) {
        let mut pending = Vec::new();
        store.scan_by_depth::<SolveError, _>(depth as u8, |record| {
            pending.push(record);
            Ok(())
        })?;
        for record in pending {
            verifier.check(record)?;
        }
    }

    let summary = verifier.summary;
    if summary.is_clean() {
        info!(records = summary.records, "verification passed");
    } else {
        warn!(
            records = summary.records,
            violations = summary.violations,
            "verification FAILED"
        );
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::Variant,
        solver::{enumerate, evaluate},
    };

    fn config_for(dir: &tempfile::TempDir, pits: u8, seeds: u8) -> (Config, Arc<zobrist::Table>) {
        let mut config = Config::new(
            Variant::new(pits, seeds).unwrap(),
            dir.path().join("kalah.db"),
        );
        config.workers = 2;
        let table = Arc::new(zobrist::Table::new(config.variant));
        (config, table)
    }

    #[test]
    fn a_solved_store_verifies_clean() {
        let dir = tempfile::tempdir().unwrap();
        let (config, table) = config_for(&dir, 2, 2);

        enumerate::run(&config, &table, None).unwrap();
        evaluate::run(&config, &table).unwrap();

        let summary = run(&config, &table).unwrap();
        assert!(summary.is_clean());
        assert!(summary.records > 10);
    }

    #[test]
    fn an_unsolved_store_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let (config, table) = config_for(&dir, 2, 1);

        enumerate::run(&config, &table, None).unwrap();

        let summary = run(&config, &table).unwrap();
        assert!(!summary.is_clean());
        assert_eq!(summary.records, summary.violations);
    }

    #[test]
    fn a_corrupted_solution_is_caught() {
        let dir = tempfile::tempdir().unwrap();
        let (config, table) = config_for(&dir, 2, 1);

        enumerate::run(&config, &table, None).unwrap();
        evaluate::run(&config, &table).unwrap();

        // Flip the start position's stored value to something impossible.
        let start = crate::core::State::starting(config.variant);
        let fingerprint = table.fingerprint(&start);
        let mut store = Store::open(&config.store_path, &OpenOptions::default()).unwrap();
        store.update_solution(fingerprint, 99, Some(0)).unwrap();
        drop(store);

        let summary = run(&config, &table).unwrap();
        assert!(!summary.is_clean());
    }
}
