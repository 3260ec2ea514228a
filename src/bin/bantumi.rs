// Copyright 2022-2023 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context};
use serde::Serialize;
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

use bantumi::{
    config::Config,
    core::State,
    solver::{compact, enumerate, evaluate, verify},
    store::{OpenOptions, Store},
    zobrist, Durability, Variant,
};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "bantumi",
    about = "A strong solver for Kalah-family mancala variants."
)]
enum Command {
    /// Run the full pipeline: enumerate, compact, evaluate.
    Solve(SolveOptions),
    /// Run only forward enumeration.
    Enumerate(EnumerateOptions),
    /// Run only retrograde evaluation against an enumerated store.
    Evaluate(SolveOptions),
    /// Report totals and the starting position's solution.
    Query(QueryOptions),
    /// Collapse duplicate records left by a duplicate-tolerant run.
    Compact(CommonOptions),
    /// Audit a solved store against the solver's invariants.
    Verify(CommonOptions),
}

#[derive(Debug, StructOpt)]
struct CommonOptions {
    /// Pits per side of the variant.
    #[structopt(short = "p", long, default_value = "6")]
    pits: u8,
    /// Starting seeds per pit of the variant.
    #[structopt(short = "s", long, default_value = "4")]
    seeds: u8,
    /// Path of the position store.
    #[structopt(long, parse(from_os_str))]
    store: PathBuf,
    /// Log filter directive, e.g. `info` or `bantumi=debug`.
    #[structopt(long, default_value = "info")]
    log: String,
}

#[derive(Debug, StructOpt)]
struct SolveOptions {
    #[structopt(flatten)]
    common: CommonOptions,
    /// Worker threads for both phases (default: logical CPU count).
    #[structopt(long)]
    workers: Option<usize>,
    /// Worker threads for enumeration only.
    #[structopt(long)]
    enumerate_workers: Option<usize>,
    /// Worker threads for evaluation only.
    #[structopt(long)]
    evaluate_workers: Option<usize>,
    /// Write durability: `normal` (crash safe) or `fast` (restartable
    /// batch runs only).
    #[structopt(long, default_value = "normal")]
    durability: Durability,
    /// Frontier size above which enumeration goes parallel.
    #[structopt(long)]
    parallel_threshold: Option<u64>,
    /// Records per parallel worker page.
    #[structopt(long)]
    chunk_size: Option<u64>,
    /// Records per write batch and per retrograde page.
    #[structopt(long)]
    batch_size: Option<usize>,
    /// Ceiling on the in-memory exact-dedup fingerprint set.
    #[structopt(long)]
    dedup_cap: Option<usize>,
    /// Available-memory floor, in GiB, below which work throttles.
    #[structopt(long)]
    memory_throttled_gib: Option<u64>,
    /// Available-memory floor, in GiB, below which memory is critical.
    #[structopt(long)]
    memory_critical_gib: Option<u64>,
}

#[derive(Debug, StructOpt)]
struct EnumerateOptions {
    #[structopt(flatten)]
    solve: SolveOptions,
    /// Stop before expanding this depth (for partial runs).
    #[structopt(long)]
    max_depth: Option<u8>,
}

#[derive(Debug, StructOpt)]
struct QueryOptions {
    #[structopt(flatten)]
    common: CommonOptions,
    /// Serialize the report as JSON.
    #[structopt(long)]
    json: bool,
}

#[derive(Serialize)]
struct QueryReport {
    variant: String,
    total_positions: u64,
    max_depth: i64,
    value: Option<i8>,
    best_move: Option<u8>,
}

fn main() -> anyhow::Result<()> {
    let command = Command::from_args();
    init_logging(match &command {
        Command::Solve(options) | Command::Evaluate(options) => &options.common.log,
        Command::Enumerate(options) => &options.solve.common.log,
        Command::Query(options) => &options.common.log,
        Command::Compact(common) | Command::Verify(common) => &common.log,
    })?;

    match command {
        Command::Solve(options) => {
            let config = build_config(&options)?;
            let table = Arc::new(zobrist::Table::new(config.variant));
            enumerate::run(&config, &table, None)?;
            let summary = evaluate::run(&config, &table)?;
            print_outcome(summary.value, summary.best_move);
        }
        Command::Enumerate(options) => {
            let config = build_config(&options.solve)?;
            let table = Arc::new(zobrist::Table::new(config.variant));
            let summary = enumerate::run(&config, &table, options.max_depth)?;
            println!(
                "{}: {} positions through depth {}",
                config.variant, summary.total_positions, summary.max_depth
            );
        }
        Command::Evaluate(options) => {
            let config = build_config(&options)?;
            let table = Arc::new(zobrist::Table::new(config.variant));
            let summary = evaluate::run(&config, &table)?;
            print_outcome(summary.value, summary.best_move);
        }
        Command::Query(options) => {
            let report = query(&options)?;
            if options.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("variant:         {}", report.variant);
                println!("total positions: {}", report.total_positions);
                println!("max depth:       {}", report.max_depth);
                match report.value {
                    Some(value) => print_outcome(value, report.best_move),
                    None => println!("starting position is not solved yet"),
                }
            }
        }
        Command::Compact(common) => {
            let variant = variant_of(&common)?;
            let mut store = Store::open(&common.store, &OpenOptions::handle(Durability::Normal))
                .with_context(|| format!("opening store {}", common.store.display()))?;
            let summary = compact::run(&mut store)?;
            println!(
                "{}: removed {} duplicates ({} -> {} positions)",
                variant, summary.removed, summary.before, summary.after
            );
        }
        Command::Verify(common) => {
            let variant = variant_of(&common)?;
            let config = Config::new(variant, &common.store);
            let table = Arc::new(zobrist::Table::new(variant));
            let summary = verify::run(&config, &table)?;
            if !summary.is_clean() {
                bail!(
                    "{} of {} records violate solver invariants",
                    summary.violations,
                    summary.records
                );
            }
            println!("{}: {} records verified", variant, summary.records);
        }
    }

    Ok(())
}

fn init_logging(filter: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(filter).context("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn variant_of(common: &CommonOptions) -> anyhow::Result<Variant> {
    Variant::new(common.pits, common.seeds).context("invalid variant")
}

fn build_config(options: &SolveOptions) -> anyhow::Result<Config> {
    let variant = variant_of(&options.common)?;
    let mut config = Config::new(variant, &options.common.store);
    if let Some(workers) = options.workers {
        if workers == 0 {
            bail!("--workers must be at least 1");
        }
        config.workers = workers;
    }
    config.enumerate_workers = options.enumerate_workers;
    config.evaluate_workers = options.evaluate_workers;
    config.durability = options.durability;
    if let Some(parallel_threshold) = options.parallel_threshold {
        config.parallel_threshold = parallel_threshold;
    }
    if let Some(chunk_size) = options.chunk_size {
        if chunk_size == 0 {
            bail!("--chunk-size must be at least 1");
        }
        config.chunk_size = chunk_size;
    }
    if let Some(batch_size) = options.batch_size {
        if batch_size == 0 {
            bail!("--batch-size must be at least 1");
        }
        config.batch_size = batch_size;
    }
    if let Some(dedup_cap) = options.dedup_cap {
        config.dedup_cap = dedup_cap;
    }
    if let Some(gib) = options.memory_throttled_gib {
        config.memory_throttled_bytes = gib << 30;
    }
    if let Some(gib) = options.memory_critical_gib {
        config.memory_critical_bytes = gib << 30;
    }
    Ok(config)
}

fn query(options: &QueryOptions) -> anyhow::Result<QueryReport> {
    let variant = variant_of(&options.common)?;
    let store = Store::open(&options.common.store, &OpenOptions::handle(Durability::Normal))
        .with_context(|| format!("opening store {}", options.common.store.display()))?;
    let table = zobrist::Table::new(variant);

    let start = State::starting(variant);
    let record = store.get(table.fingerprint(&start))?;

    Ok(QueryReport {
        variant: variant.to_string(),
        total_positions: store.count(None)?,
        max_depth: store.max_depth()?,
        value: record.as_ref().and_then(|r| r.value),
        best_move: record.as_ref().and_then(|r| r.best_move),
    })
}

fn print_outcome(value: i8, best_move: Option<u8>) {
    match value {
        v if v > 0 => println!("player 1 wins by {} with optimal play", v),
        v if v < 0 => println!("player 2 wins by {} with optimal play", -(v as i16)),
        _ => println!("optimal play is a draw"),
    }
    if let Some(mov) = best_move {
        println!("best opening move: pit {}", mov);
    }
}
