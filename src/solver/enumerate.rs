// Copyright 2022-2023 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Forward enumeration: breadth-first discovery of every reachable
//! position, written to the store tagged with its minimum depth.
//!
//! Frontiers are processed adaptively. Small frontiers run in a single
//! task over a streaming scan; large ones are partitioned into pages and
//! fanned out across the worker pool. Cross-task deduplication starts in
//! exact mode (an in-memory fingerprint set backed by the store's
//! conflict-dropping insert) and downgrades mid-depth to
//! duplicate-tolerant inserts when the set outgrows its cap or memory
//! turns critical; the compactor reconciles afterwards.

use std::{mem, sync::Arc};

use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

use crate::{
    codec,
    config::{Config, DEFAULT_CACHE_CEILING_BYTES},
    core::{rules, State},
    monitor::{MemoryState, ResourceMonitor},
    solver::{
        compact::{self, CompactSummary},
        pool::{Worker, WorkerPool},
        SolveError,
    },
    store::{OpenOptions, Record, Store},
    writer::AsyncWriter,
    zobrist,
};

/// How successor fingerprints are deduplicated across tasks of one depth.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum DedupMode {
    Exact,
    DuplicateTolerant,
}

/// How one frontier is processed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum FrontierMode {
    Single,
    Parallel,
}

#[derive(Clone, Debug)]
pub struct EnumerationSummary {
    pub total_positions: u64,
    pub max_depth: i64,
    /// Successor candidates generated (after within-task dedup).
    pub generated: u64,
    /// Records the writer actually inserted.
    pub written: u64,
    pub compacted: Option<CompactSummary>,
}

/// One page of a frontier, claimed by a worker.
struct FrontierPage {
    depth: u8,
    offset: u64,
    limit: u64,
}

struct FrontierWorker {
    store: Store,
    table: Arc<zobrist::Table>,
    pits: u8,
}

impl Worker for FrontierWorker {
    type Task = FrontierPage;
    type Output = Result<Vec<Record>, SolveError>;

    fn run(&mut self, page: FrontierPage) -> Self::Output {
        let records = self
            .store
            .scan_by_depth_page(page.depth, page.limit, page.offset)?;

        let mut seen = FxHashSet::default();
        let mut successors = Vec::new();
        for record in &records {
            expand(record, &self.table, self.pits, &mut seen, &mut successors)?;
        }

        Ok(successors)
    }
}

/// Unpacks one record and pushes its not-yet-seen successors.
fn expand(
    record: &Record,
    table: &zobrist::Table,
    pits: u8,
    seen: &mut FxHashSet<u64>,
    out: &mut Vec<Record>,
) -> Result<(), SolveError> {
    let state = codec::unpack(&record.packed, pits);
    let next_depth = record
        .depth
        .checked_add(1)
        .ok_or(SolveError::DepthExhausted)?;

    for mov in rules::legal_moves(&state) {
        let successor = rules::apply(&state, mov);
        let fingerprint = table.fingerprint(&successor);
        if !seen.insert(fingerprint) {
            continue;
        }

        out.push(Record::unsolved(
            fingerprint,
            codec::pack(&successor)?,
            next_depth,
            successor.seeds_in_pits(),
        ));
    }

    Ok(())
}

/// Runs enumeration to completion (or to `stop_after_depth`, for partial
/// runs). Safe to re-run against an interrupted store: the deepest stored
/// frontier is re-expanded and everything already present dedups away.
pub fn run(
    config: &Config,
    table: &Arc<zobrist::Table>,
    stop_after_depth: Option<u8>,
) -> Result<EnumerationSummary, SolveError> {
    let variant = config.variant;
    let pits = variant.pits();
    let mut monitor = ResourceMonitor::new(
        &config.store_path,
        config.memory_throttled_bytes,
        config.memory_critical_bytes,
    );
    monitor.disk_check()?;

    let open = OpenOptions {
        durability: config.durability,
        create: true,
        cache_bytes: monitor.recommend_cache_bytes(DEFAULT_CACHE_CEILING_BYTES),
    };
    let mut store = Store::open(&config.store_path, &open)?;

    info!(
        %variant,
        workers = config.enumerate_workers(),
        durability = %config.durability,
        "phase: forward enumeration"
    );

    // A store with content is authoritative: resume at its deepest
    // frontier. An interrupted duplicate-tolerant run may have left
    // duplicates behind, so resumption forces a final compaction.
    let resumed = store.max_depth()?;
    let mut depth = if resumed >= 0 {
        info!(depth = resumed, "resuming from the deepest stored frontier");
        resumed as u8
    } else {
        let start = State::starting(variant);
        let record = Record::unsolved(
            table.fingerprint(&start),
            codec::pack(&start)?,
            0,
            start.seeds_in_pits(),
        );
        store.insert(&record)?;
        store.flush()?;
        debug!(fingerprint = record.fingerprint, "inserted starting position");
        0
    };
    let mut needs_compaction = resumed >= 0;

    let writer = AsyncWriter::spawn(Store::open(
        &config.store_path,
        &OpenOptions::handle(config.durability),
    )?);
    let mut pool: Option<WorkerPool<FrontierWorker>> = None;
    let mut generated = 0u64;

    loop {
        if let Some(limit) = stop_after_depth {
            if depth >= limit {
                info!(depth, "stopping enumeration at the requested depth");
                break;
            }
        }

        monitor.disk_check()?;
        let frontier = store.count(Some(depth))?;
        if frontier == 0 {
            break;
        }

        let next_depth = depth.checked_add(1).ok_or(SolveError::DepthExhausted)?;
        let mode = if frontier < config.parallel_threshold {
            FrontierMode::Single
        } else {
            FrontierMode::Parallel
        };

        let depth_generated = match mode {
            FrontierMode::Single => process_single(&store, &writer, table, pits, depth, config)?,
            FrontierMode::Parallel => {
                if pool.is_none() {
                    pool = Some(spawn_pool(config, table, pits)?);
                }
                let pool = pool.as_ref().expect("pool just spawned");
                let (depth_generated, went_tolerant) =
                    process_parallel(config, pool, &writer, &mut monitor, depth, frontier)?;
                needs_compaction |= went_tolerant;
                depth_generated
            }
        };

        // Strict barrier: depth d+1 is not counted, let alone processed,
        // until every depth-d successor write has landed.
        writer.wait_until_empty()?;
        store.flush()?;

        generated += depth_generated;
        let discovered = store.count(Some(next_depth))?;
        let running_total = store.count(None)?;
        info!(
            depth,
            frontier,
            discovered,
            running_total,
            mode = ?mode,
            "depth complete"
        );

        depth = next_depth;
    }

    drop(pool);
    let written = writer.finish()?;

    let compacted = if needs_compaction {
        Some(compact::run(&mut store)?)
    } else {
        None
    };

    let total_positions = store.count(None)?;
    let max_depth = store.max_depth()?;
    if generated > 0 {
        let duplication_rate = 100.0 * (1.0 - written as f64 / generated as f64);
        info!(
            total_positions,
            max_depth,
            generated,
            written,
            duplication_rate = %format!("{:.1}%", duplication_rate),
            "enumeration complete"
        );
    } else {
        info!(total_positions, max_depth, "enumeration complete");
    }

    Ok(EnumerationSummary {
        total_positions,
        max_depth,
        generated,
        written,
        compacted,
    })
}

fn spawn_pool(
    config: &Config,
    table: &Arc<zobrist::Table>,
    pits: u8,
) -> Result<WorkerPool<FrontierWorker>, SolveError> {
    let mut workers = Vec::with_capacity(config.enumerate_workers());
    for _ in 0..config.enumerate_workers() {
        workers.push(FrontierWorker {
            store: Store::open(&config.store_path, &OpenOptions::handle(config.durability))?,
            table: Arc::clone(table),
            pits,
        });
    }

    Ok(WorkerPool::spawn("enumerate", workers))
}

/// Small-frontier path: stream the whole depth through one task, keeping
/// a frontier-wide seen-set, and hand batches to the writer as they fill.
fn process_single(
    store: &Store,
    writer: &AsyncWriter,
    table: &zobrist::Table,
    pits: u8,
    depth: u8,
    config: &Config,
) -> Result<u64, SolveError> {
    let mut seen = FxHashSet::default();
    let mut buffer: Vec<Record> = Vec::new();
    let mut depth_generated = 0u64;

    store.scan_by_depth::<SolveError, _>(depth, |record| {
        expand(&record, table, pits, &mut seen, &mut buffer)?;
        if buffer.len() >= config.batch_size {
            depth_generated += buffer.len() as u64;
            writer.put(mem::take(&mut buffer), false)?;
        }
        Ok(())
    })?;

    depth_generated += buffer.len() as u64;
    writer.put(buffer, false)?;
    Ok(depth_generated)
}

/// Large-frontier path: partition into pages, fan out across the pool,
/// and dedup worker results as they stream back.
fn process_parallel(
    config: &Config,
    pool: &WorkerPool<FrontierWorker>,
    writer: &AsyncWriter,
    monitor: &mut ResourceMonitor,
    depth: u8,
    frontier: u64,
) -> Result<(u64, bool), SolveError> {
    let chunk = config.chunk_size.max(1);
    let pages = (frontier + chunk - 1) / chunk;
    debug!(depth, pages, chunk, "parallel frontier");

    for page in 0..pages {
        pool.submit(FrontierPage {
            depth,
            offset: page * chunk,
            limit: chunk,
        })?;
    }

    // Every depth starts out exact; the set only lives for this depth.
    // Cross-depth transpositions are dropped by the store's conflict
    // guard, not by this set.
    let mut mode = DedupMode::Exact;
    let mut seen: FxHashSet<u64> = FxHashSet::default();
    let mut depth_generated = 0u64;

    for page in 0..pages {
        let mut batch = pool.recv()??;
        depth_generated += batch.len() as u64;

        match mode {
            DedupMode::Exact => {
                batch.retain(|record| seen.insert(record.fingerprint));

                let over_cap = seen.len() > config.dedup_cap;
                let critical = page % 10 == 9 && monitor.memory_state() == MemoryState::Critical;
                if over_cap || critical {
                    warn!(
                        depth,
                        entries = seen.len(),
                        over_cap,
                        "dedup going duplicate-tolerant for the rest of this depth"
                    );
                    seen = FxHashSet::default();
                    mode = DedupMode::DuplicateTolerant;
                }

                writer.put(batch, false)?;
            }
            DedupMode::DuplicateTolerant => writer.put(batch, true)?,
        }

        if page % 10 == 9 {
            monitor.disk_check()?;
        }
    }

    Ok((depth_generated, mode == DedupMode::DuplicateTolerant))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Player, Variant};

    fn test_config(dir: &tempfile::TempDir, pits: u8, seeds: u8) -> Config {
        let mut config = Config::new(
            Variant::new(pits, seeds).unwrap(),
            dir.path().join("kalah.db"),
        );
        config.workers = 2;
        config
    }

    fn all_records(store: &Store) -> Vec<Record> {
        let mut records = Vec::new();
        let max = store.max_depth().unwrap();
        for depth in 0..=max.max(0) {
            store
                .scan_by_depth::<crate::store::StoreError, _>(depth as u8, |record| {
                    records.push(record);
                    Ok(())
                })
                .unwrap();
        }
        records
    }

    fn fingerprints(store: &Store) -> Vec<u64> {
        let mut prints: Vec<u64> = all_records(store).iter().map(|r| r.fingerprint).collect();
        prints.sort_unstable();
        prints
    }

    #[test]
    fn trivial_variant_enumerates_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, 1, 1);
        let table = Arc::new(zobrist::Table::new(config.variant));

        let summary = run(&config, &table, None).unwrap();
        // Kalah(1,1) has exactly two reachable positions: the start, and
        // the terminal position after the only move (a bonus-turn sow into
        // the store that empties player 1's side).
        assert_eq!(2, summary.total_positions);
        assert_eq!(1, summary.max_depth);

        let store = Store::open(&config.store_path, &OpenOptions::default()).unwrap();
        let start = State::starting(config.variant);
        let terminal = State::from_cells(&[0, 1, 1, 0], Player::One);
        assert!(store.exists(table.fingerprint(&start)).unwrap());
        assert!(store.exists(table.fingerprint(&terminal)).unwrap());
    }

    #[test]
    fn every_successor_is_stored_within_one_depth() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, 2, 2);
        let table = Arc::new(zobrist::Table::new(config.variant));

        run(&config, &table, None).unwrap();

        let store = Store::open(&config.store_path, &OpenOptions::default()).unwrap();
        for record in all_records(&store) {
            let state = codec::unpack(&record.packed, 2);
            assert_eq!(record.seeds_in_pits, state.seeds_in_pits());
            for mov in rules::legal_moves(&state) {
                let successor = rules::apply(&state, mov);
                let child = store
                    .get(table.fingerprint(&successor))
                    .unwrap()
                    .expect("successor missing from store");
                assert!(child.depth <= record.depth + 1);
                assert!(child.seeds_in_pits <= record.seeds_in_pits);
            }
        }
    }

    #[test]
    fn resumed_run_matches_uninterrupted_run() {
        let interrupted = tempfile::tempdir().unwrap();
        let config = test_config(&interrupted, 2, 2);
        let table = Arc::new(zobrist::Table::new(config.variant));

        // Stop early, then resume to completion.
        run(&config, &table, Some(3)).unwrap();
        let partial = run(&config, &table, None).unwrap();

        let clean_dir = tempfile::tempdir().unwrap();
        let clean_config = test_config(&clean_dir, 2, 2);
        let clean = run(&clean_config, &table, None).unwrap();

        assert_eq!(clean.total_positions, partial.total_positions);
        assert_eq!(clean.max_depth, partial.max_depth);

        let resumed_store = Store::open(&config.store_path, &OpenOptions::default()).unwrap();
        let clean_store = Store::open(&clean_config.store_path, &OpenOptions::default()).unwrap();
        assert_eq!(fingerprints(&clean_store), fingerprints(&resumed_store));
    }

    #[test]
    fn parallel_and_single_paths_agree() {
        let single_dir = tempfile::tempdir().unwrap();
        let single_config = test_config(&single_dir, 2, 2);
        let table = Arc::new(zobrist::Table::new(single_config.variant));
        let single = run(&single_config, &table, None).unwrap();

        // Force the parallel path with page-sized chunks.
        let parallel_dir = tempfile::tempdir().unwrap();
        let mut parallel_config = test_config(&parallel_dir, 2, 2);
        parallel_config.parallel_threshold = 1;
        parallel_config.chunk_size = 7;
        let parallel = run(&parallel_config, &table, None).unwrap();

        assert_eq!(single.total_positions, parallel.total_positions);
        assert_eq!(single.max_depth, parallel.max_depth);

        let single_store = Store::open(&single_config.store_path, &OpenOptions::default()).unwrap();
        let parallel_store =
            Store::open(&parallel_config.store_path, &OpenOptions::default()).unwrap();
        assert_eq!(fingerprints(&single_store), fingerprints(&parallel_store));
    }

    #[test]
    fn duplicate_tolerant_mode_compacts_to_the_same_set() {
        let exact_dir = tempfile::tempdir().unwrap();
        let exact_config = test_config(&exact_dir, 2, 2);
        let table = Arc::new(zobrist::Table::new(exact_config.variant));
        let exact = run(&exact_config, &table, None).unwrap();

        // A tiny dedup cap forces the duplicate-tolerant downgrade almost
        // immediately; the trailing compaction must reconcile.
        let tolerant_dir = tempfile::tempdir().unwrap();
        let mut tolerant_config = test_config(&tolerant_dir, 2, 2);
        tolerant_config.parallel_threshold = 1;
        tolerant_config.chunk_size = 4;
        tolerant_config.dedup_cap = 1;
        let tolerant = run(&tolerant_config, &table, None).unwrap();

        assert!(tolerant.compacted.is_some());
        assert_eq!(exact.total_positions, tolerant.total_positions);

        let exact_store = Store::open(&exact_config.store_path, &OpenOptions::default()).unwrap();
        let tolerant_store =
            Store::open(&tolerant_config.store_path, &OpenOptions::default()).unwrap();
        assert_eq!(fingerprints(&exact_store), fingerprints(&tolerant_store));
        assert_eq!(
            tolerant_store.count(None).unwrap(),
            tolerant_store.count_distinct_fingerprints().unwrap()
        );
    }
}
