// Copyright 2022-2023 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Retrograde evaluation: assigns every enumerated position its exact
//! game value and an optimal move.
//!
//! Layers are solved in ascending `seeds_in_pits` order. Every move keeps
//! that quantity equal or shrinks it, so by the time a layer is scheduled
//! all of its strict successors (in smaller layers) already hold values.
//! Same-layer dependencies (bonus-turn moves that rearrange seeds among
//! pits without banking any) are handled by iterating the layer to
//! fixpoint: each pass solves every position whose successors are all
//! solved, and a pass that solves nothing while work remains means a
//! dependency cycle, which Kalah cannot produce, so it is reported as a
//! fatal invariant violation rather than looped on forever.

use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    codec,
    config::{Config, DEFAULT_CACHE_CEILING_BYTES},
    core::{rules, Player, State},
    monitor::{MemoryState, ResourceMonitor},
    solver::{
        pool::{Worker, WorkerPool},
        SolveError,
    },
    store::{OpenOptions, Record, Store},
    zobrist,
};

#[derive(Clone, Debug)]
pub struct EvaluationSummary {
    /// Game value of the starting position, from player 1's perspective.
    pub value: i8,
    /// Optimal opening move; absent only for degenerate variants whose
    /// start is terminal (none in the supported range).
    pub best_move: Option<u8>,
    pub solved: u64,
}

/// A solved position, ready to be written back.
type Solution = (u64, i8, Option<u8>);

enum LayerTask {
    /// Solvability check: keep the records whose successors all hold
    /// values (or which are terminal).
    Check(Vec<Record>),
    /// Solve records previously confirmed solvable.
    Solve(Vec<Record>),
}

enum LayerOutput {
    Check(Result<Vec<Record>, SolveError>),
    Solve(Result<Vec<Solution>, SolveError>),
}

struct LayerWorker {
    store: Store,
    table: Arc<zobrist::Table>,
    pits: u8,
}

impl Worker for LayerWorker {
    type Task = LayerTask;
    type Output = LayerOutput;

    fn run(&mut self, task: LayerTask) -> LayerOutput {
        match task {
            LayerTask::Check(records) => LayerOutput::Check(self.check(records)),
            LayerTask::Solve(records) => LayerOutput::Solve(self.solve(records)),
        }
    }
}

impl LayerWorker {
    fn check(&self, records: Vec<Record>) -> Result<Vec<Record>, SolveError> {
        let mut solvable = Vec::new();
        for record in records {
            let state = codec::unpack(&record.packed, self.pits);
            if self.all_successors_solved(&state)? {
                solvable.push(record);
            }
        }

        Ok(solvable)
    }

    /// Terminal positions count as solvable on sight. A missing successor
    /// reads as unsolved here; if it is genuinely absent the solve pass
    /// (or ultimately the no-progress guard) turns it into a hard error.
    fn all_successors_solved(&self, state: &State) -> Result<bool, SolveError> {
        if rules::is_terminal(state) {
            return Ok(true);
        }

        for mov in rules::legal_moves(state) {
            let successor = rules::apply(state, mov);
            match self.store.get(self.table.fingerprint(&successor))? {
                Some(child) if child.is_solved() => {}
                _ => return Ok(false),
            }
        }

        Ok(true)
    }

    fn solve(&self, records: Vec<Record>) -> Result<Vec<Solution>, SolveError> {
        let mut solutions = Vec::with_capacity(records.len());
        for record in records {
            let state = codec::unpack(&record.packed, self.pits);
            solutions.push(self.solve_one(&record, &state)?);
        }

        Ok(solutions)
    }

    fn solve_one(&self, record: &Record, state: &State) -> Result<Solution, SolveError> {
        if rules::is_terminal(state) {
            return Ok((record.fingerprint, rules::terminal_score(state) as i8, None));
        }

        // Player 1 maximizes, player 2 minimizes. Strict improvement only,
        // so ties resolve to the lowest pit index.
        let maximizing = state.to_move() == Player::One;
        let mut best: Option<(i8, u8)> = None;
        for mov in rules::legal_moves(state) {
            let successor = rules::apply(state, mov);
            let fingerprint = self.table.fingerprint(&successor);
            let child = self
                .store
                .get(fingerprint)?
                .ok_or(SolveError::MissingSuccessor {
                    fingerprint,
                    seeds_in_pits: record.seeds_in_pits,
                })?;
            let value = child.value.ok_or(SolveError::MissingSuccessor {
                fingerprint,
                seeds_in_pits: record.seeds_in_pits,
            })?;

            let better = match best {
                None => true,
                Some((best_value, _)) => {
                    if maximizing {
                        value > best_value
                    } else {
                        value < best_value
                    }
                }
            };
            if better {
                best = Some((value, mov));
            }
        }

        let (value, mov) = best.ok_or(SolveError::MissingSuccessor {
            fingerprint: record.fingerprint,
            seeds_in_pits: record.seeds_in_pits,
        })?;
        Ok((record.fingerprint, value, Some(mov)))
    }
}

/// Evaluates an enumerated store to completion and reports the start
/// position's value and optimal opening move.
pub fn run(config: &Config, table: &Arc<zobrist::Table>) -> Result<EvaluationSummary, SolveError> {
    let variant = config.variant;
    let mut monitor = ResourceMonitor::new(
        &config.store_path,
        config.memory_throttled_bytes,
        config.memory_critical_bytes,
    );
    monitor.disk_check()?;

    let open = OpenOptions {
        durability: config.durability,
        create: false,
        cache_bytes: monitor.recommend_cache_bytes(DEFAULT_CACHE_CEILING_BYTES),
    };
    let mut store = Store::open(&config.store_path, &open)?;

    info!(
        %variant,
        workers = config.evaluate_workers(),
        top_layer = variant.total_seeds(),
        "phase: retrograde evaluation"
    );

    let mut workers = Vec::with_capacity(config.evaluate_workers());
    for _ in 0..config.evaluate_workers() {
        workers.push(LayerWorker {
            store: Store::open(&config.store_path, &OpenOptions::handle(config.durability))?,
            table: Arc::clone(table),
            pits: variant.pits(),
        });
    }
    let pool = WorkerPool::spawn("evaluate", workers);

    let mut total_solved = 0u64;
    for layer in 0..=variant.total_seeds() {
        let unsolved = store.count_unsolved_at_seeds(layer)?;
        if unsolved == 0 {
            continue;
        }

        total_solved += solve_layer(config, &mut store, &pool, &mut monitor, layer, unsolved)?;
    }

    drop(pool);

    let start = State::starting(variant);
    let record = store
        .get(table.fingerprint(&start))?
        .ok_or(SolveError::StartUnsolved)?;
    let value = record.value.ok_or(SolveError::StartUnsolved)?;
    info!(
        value,
        best_move = ?record.best_move,
        solved = total_solved,
        "evaluation complete"
    );

    Ok(EvaluationSummary {
        value,
        best_move: record.best_move,
        solved: total_solved,
    })
}

/// Iterates one layer to fixpoint. Returns the number of records solved.
fn solve_layer(
    config: &Config,
    store: &mut Store,
    pool: &WorkerPool<LayerWorker>,
    monitor: &mut ResourceMonitor,
    layer: u8,
    unsolved: u64,
) -> Result<u64, SolveError> {
    debug!(layer, unsolved, "layer start");
    let mut iterations = 0u32;
    let mut layer_solved = 0u64;

    loop {
        iterations += 1;

        // Memory pressure is advisory here: a throttled pass fans out
        // fewer, larger chunks so less of the page is in flight at once.
        let fanout = match monitor.memory_state() {
            MemoryState::Normal => 4,
            MemoryState::Throttled | MemoryState::Critical => 2,
        };

        let mut pass_solved = 0u64;
        let mut offset = 0u64;
        let mut pages = 0u64;
        loop {
            let page =
                store.scan_unsolved_by_seeds_page(layer, config.batch_size as u64, offset)?;
            if page.is_empty() {
                break;
            }

            pass_solved += solve_page(store, pool, page, fanout)?;
            offset += config.batch_size as u64;
            pages += 1;
            if pages % 10 == 0 {
                monitor.disk_check()?;
            }
        }

        layer_solved += pass_solved;
        let remaining = store.count_unsolved_at_seeds(layer)?;
        if remaining == 0 {
            break;
        }

        // Solved rows shift the unsolved pagination underneath us, so a
        // pass can legitimately skip records; the next pass picks them
        // up. Zero progress over a full pass, though, means the layer can
        // never drain.
        if pass_solved == 0 {
            return Err(SolveError::NoProgress {
                seeds_in_pits: layer,
                remaining,
                iterations,
            });
        }
    }

    info!(
        seeds_in_pits = layer,
        solved = layer_solved,
        iterations,
        "layer complete"
    );
    Ok(layer_solved)
}

/// Runs the two worker passes over one page: solvability check, then
/// solve. The split is a barrier; a record is solved at most once.
fn solve_page(
    store: &mut Store,
    pool: &WorkerPool<LayerWorker>,
    page: Vec<Record>,
    fanout: usize,
) -> Result<u64, SolveError> {
    let solvable = run_pass(pool, page, fanout, LayerTask::Check, |output| match output {
        LayerOutput::Check(result) => result,
        LayerOutput::Solve(_) => unreachable!("solve result during check pass"),
    })?;
    if solvable.is_empty() {
        return Ok(0);
    }

    let solutions = run_pass(pool, solvable, fanout, LayerTask::Solve, |output| {
        match output {
            LayerOutput::Solve(result) => result,
            LayerOutput::Check(_) => unreachable!("check result during solve pass"),
        }
    })?;

    // All solution writes funnel through this one handle: SQLite allows a
    // single writer, and one transaction per page is the fast path anyway.
    store.update_solutions(&solutions)?;
    store.flush()?;
    Ok(solutions.len() as u64)
}

/// Fans `records` out across the pool in `workers * fanout` chunks and
/// concatenates the per-chunk results.
fn run_pass<T>(
    pool: &WorkerPool<LayerWorker>,
    records: Vec<Record>,
    fanout: usize,
    make_task: impl Fn(Vec<Record>) -> LayerTask,
    take_output: impl Fn(LayerOutput) -> Result<Vec<T>, SolveError>,
) -> Result<Vec<T>, SolveError> {
    let chunk_size = (records.len() + pool.size() * fanout - 1) / (pool.size() * fanout);
    let chunk_size = chunk_size.max(1);

    let mut submitted = 0usize;
    let mut iter = records.into_iter();
    loop {
        let chunk: Vec<Record> = iter.by_ref().take(chunk_size).collect();
        if chunk.is_empty() {
            break;
        }
        pool.submit(make_task(chunk))?;
        submitted += 1;
    }

    let mut results = Vec::new();
    for _ in 0..submitted {
        results.extend(take_output(pool.recv()?)?);
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::Variant,
        solver::enumerate,
        store::Record,
    };

    fn solved_config(dir: &tempfile::TempDir, pits: u8, seeds: u8) -> (Config, Arc<zobrist::Table>) {
        let mut config = Config::new(
            Variant::new(pits, seeds).unwrap(),
            dir.path().join("kalah.db"),
        );
        config.workers = 2;
        let table = Arc::new(zobrist::Table::new(config.variant));
        (config, table)
    }

    #[test]
    fn trivial_variant_is_a_draw() {
        let dir = tempfile::tempdir().unwrap();
        let (config, table) = solved_config(&dir, 1, 1);

        enumerate::run(&config, &table, None).unwrap();
        let summary = run(&config, &table).unwrap();

        // The only move banks one seed and sweeps the opponent's one seed
        // back at the end: 1 - 1 = 0.
        assert_eq!(0, summary.value);
        assert_eq!(Some(0), summary.best_move);
        assert_eq!(2, summary.solved);
    }

    #[test]
    fn every_record_is_solved_and_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let (config, table) = solved_config(&dir, 2, 2);

        enumerate::run(&config, &table, None).unwrap();
        run(&config, &table).unwrap();

        let store = Store::open(&config.store_path, &OpenOptions::default()).unwrap();
        let max = store.max_depth().unwrap();
        let mut checked = 0u64;
        for depth in 0..=max {
            store
                .scan_by_depth::<SolveError, _>(depth as u8, |record| {
                    let state = codec::unpack(&record.packed, 2);
                    let value = record.value.expect("record left unsolved");

                    if rules::is_terminal(&state) {
                        assert_eq!(rules::terminal_score(&state) as i8, value);
                        assert_eq!(None, record.best_move);
                        checked += 1;
                        return Ok(());
                    }

                    // The recorded move must be optimal: it achieves the
                    // recorded value, and no sibling beats it.
                    let best_move = record.best_move.expect("non-terminal without best move");
                    let maximizing = state.to_move() == Player::One;
                    let mut child_values = Vec::new();
                    for mov in rules::legal_moves(&state) {
                        let successor = rules::apply(&state, mov);
                        let child = store
                            .get(table.fingerprint(&successor))?
                            .expect("successor missing");
                        child_values.push((mov, child.value.expect("successor unsolved")));
                    }

                    let optimal = child_values
                        .iter()
                        .map(|&(_, v)| v)
                        .fold(None::<i8>, |acc, v| {
                            Some(match acc {
                                None => v,
                                Some(best) => {
                                    if maximizing {
                                        best.max(v)
                                    } else {
                                        best.min(v)
                                    }
                                }
                            })
                        })
                        .expect("terminal handled above");
                    assert_eq!(optimal, value);

                    let achieved = child_values
                        .iter()
                        .find(|&&(mov, _)| mov == best_move)
                        .map(|&(_, v)| v)
                        .expect("best move is not legal");
                    assert_eq!(value, achieved);

                    // Lowest-index tie-break.
                    let first_achiever = child_values
                        .iter()
                        .find(|&&(_, v)| v == value)
                        .map(|&(mov, _)| mov)
                        .expect("no move achieves the value");
                    assert_eq!(first_achiever, best_move);

                    checked += 1;
                    Ok(())
                })
                .unwrap();
        }

        assert!(checked > 10, "suspiciously small reachable set");
    }

    #[test]
    fn small_variant_solves_within_the_seed_bound() {
        // Kalah(2,1): whatever the outcome, no value can exceed the total
        // seeds in play.
        let dir = tempfile::tempdir().unwrap();
        let (config, table) = solved_config(&dir, 2, 1);

        enumerate::run(&config, &table, None).unwrap();
        let summary = run(&config, &table).unwrap();
        assert!(summary.value.unsigned_abs() <= config.variant.total_seeds());
        assert!(summary.best_move.is_some());
    }

    #[test]
    #[ignore = "full Kalah(4,3) solve over 5M positions; takes minutes"]
    fn kalah_4_3_golden_solution() {
        let dir = tempfile::tempdir().unwrap();
        let (mut config, table) = solved_config(&dir, 4, 3);
        config.workers = num_cpus::get();

        let enumeration = enumerate::run(&config, &table, None).unwrap();
        assert_eq!(5_283_478, enumeration.total_positions);

        let summary = run(&config, &table).unwrap();
        assert_eq!(6, summary.value);
        assert_eq!(Some(1), summary.best_move);
    }

    #[test]
    fn a_layer_that_cannot_drain_is_a_hard_error() {
        // Fabricate a store holding one non-terminal position whose
        // successors were never enumerated. No pass can ever solve it, and
        // the guard must refuse to spin.
        let dir = tempfile::tempdir().unwrap();
        let (config, table) = solved_config(&dir, 2, 2);

        let state = State::starting(config.variant);
        let record = Record::unsolved(
            table.fingerprint(&state),
            codec::pack(&state).unwrap(),
            0,
            state.seeds_in_pits(),
        );
        let mut store = Store::open(&config.store_path, &OpenOptions::default()).unwrap();
        store.insert(&record).unwrap();
        store.flush().unwrap();
        drop(store);

        let err = run(&config, &table).unwrap_err();
        assert!(matches!(
            err,
            SolveError::NoProgress {
                seeds_in_pits: 8,
                remaining: 1,
                ..
            }
        ));
    }
}
