// Copyright 2022-2023 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Run configuration. One [`Config`] is built at startup, validated, and
//! then passed by reference to every phase; nothing reads tuning knobs
//! from anywhere else.

use std::{fmt, path::PathBuf, str::FromStr};

use crate::core::Variant;

/// Frontier sizes below this are processed in a single task.
pub const DEFAULT_PARALLEL_THRESHOLD: u64 = 750_000;

/// Records per worker page when a frontier is processed in parallel.
pub const DEFAULT_CHUNK_SIZE: u64 = 500_000;

/// Records per write batch, and per retrograde page.
pub const DEFAULT_BATCH_SIZE: usize = 100_000;

/// Ceiling on the in-memory exact-dedup fingerprint set (about 12 GiB of
/// table at 300M entries). Beyond this the enumerator goes
/// duplicate-tolerant.
pub const DEFAULT_DEDUP_CAP: usize = 300_000_000;

/// Available memory below this is the throttled state.
pub const DEFAULT_MEMORY_THROTTLED_BYTES: u64 = 4 << 30;

/// Available memory below this is the critical state.
pub const DEFAULT_MEMORY_CRITICAL_BYTES: u64 = 2 << 30;

/// Ceiling handed to the store's adaptive page-cache sizing.
pub const DEFAULT_CACHE_CEILING_BYTES: u64 = 256 << 20;

/// Write-durability mode of the store.
///
/// `Fast` trades crash safety for a large write-throughput win and is only
/// sound for batch computations that can be restarted from scratch; it is
/// never the default.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Durability {
    Normal,
    Fast,
}

impl Default for Durability {
    fn default() -> Self {
        Durability::Normal
    }
}

impl fmt::Display for Durability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Durability::Normal => write!(f, "normal"),
            Durability::Fast => write!(f, "fast"),
        }
    }
}

impl FromStr for Durability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Durability::Normal),
            "fast" => Ok(Durability::Fast),
            other => Err(format!("unknown durability mode: {}", other)),
        }
    }
}

/// Everything a solve needs to know, resolved once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub variant: Variant,
    pub store_path: PathBuf,
    /// Default worker count for both phases.
    pub workers: usize,
    /// Phase-specific overrides.
    pub enumerate_workers: Option<usize>,
    pub evaluate_workers: Option<usize>,
    pub durability: Durability,
    pub parallel_threshold: u64,
    pub chunk_size: u64,
    pub batch_size: usize,
    pub dedup_cap: usize,
    pub memory_throttled_bytes: u64,
    pub memory_critical_bytes: u64,
}

impl Config {
    pub fn new(variant: Variant, store_path: impl Into<PathBuf>) -> Config {
        Config {
            variant,
            store_path: store_path.into(),
            workers: num_cpus::get(),
            enumerate_workers: None,
            evaluate_workers: None,
            durability: Durability::default(),
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
            chunk_size: DEFAULT_CHUNK_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            dedup_cap: DEFAULT_DEDUP_CAP,
            memory_throttled_bytes: DEFAULT_MEMORY_THROTTLED_BYTES,
            memory_critical_bytes: DEFAULT_MEMORY_CRITICAL_BYTES,
        }
    }

    pub fn enumerate_workers(&self) -> usize {
        self.enumerate_workers.unwrap_or(self.workers).max(1)
    }

    pub fn evaluate_workers(&self) -> usize {
        self.evaluate_workers.unwrap_or(self.workers).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_overrides() {
        let mut config = Config::new(Variant::new(4, 3).unwrap(), "kalah.db");
        config.workers = 8;
        assert_eq!(8, config.enumerate_workers());
        assert_eq!(8, config.evaluate_workers());

        config.enumerate_workers = Some(2);
        config.evaluate_workers = Some(12);
        assert_eq!(2, config.enumerate_workers());
        assert_eq!(12, config.evaluate_workers());
    }

    #[test]
    fn durability_parses() {
        assert_eq!(Ok(Durability::Normal), "normal".parse());
        assert_eq!(Ok(Durability::Fast), "fast".parse());
        assert!("paranoid".parse::<Durability>().is_err());
        assert_eq!(Durability::Normal, Durability::default());
    }
}
