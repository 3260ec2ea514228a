// Copyright 2022-2023 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The position store: a durable mapping from fingerprint to position
//! record, backed by a single SQLite database file.
//!
//! The store is the one piece of shared mutable state in the whole solver
//! and its performance model dominates everything else. The design treats
//! SQLite as a tuned local KV engine: bulk inserts run inside one
//! transaction per batch, the hot scans ride secondary indices on `depth`
//! and `seeds_in_pits`, and readers in worker threads each hold their own
//! connection. SQLite permits only one writer at a time, so all writes
//! flow through a single handle (the async writer during enumeration, the
//! orchestrator during evaluation).
//!
//! A note on uniqueness: the duplicate-tolerant bulk path must be able to
//! append blindly, so `fingerprint` carries a plain (non-unique) index
//! rather than a primary-key constraint. The deduplicating insert paths
//! enforce uniqueness with an indexed `WHERE NOT EXISTS` guard, and the
//! compactor restores it wholesale after a duplicate-tolerant run.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Durability;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("no record for fingerprint {0:#018x}")]
    Missing(u64),
}

/// One entry in the store. Created unsolved by the enumerator; `value` and
/// `best_move` are filled in exactly once by the retrograde evaluator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub fingerprint: u64,
    /// The position, packed by [`crate::codec::pack`].
    pub packed: Vec<u8>,
    /// Minimum distance from the starting position.
    pub depth: u8,
    /// Cached layer key for retrograde scans.
    pub seeds_in_pits: u8,
    /// Game value from player 1's perspective; absent until solved.
    pub value: Option<i8>,
    /// Optimal move, relative to the mover; absent until solved and for
    /// terminal positions.
    pub best_move: Option<u8>,
}

impl Record {
    pub fn unsolved(fingerprint: u64, packed: Vec<u8>, depth: u8, seeds_in_pits: u8) -> Record {
        Record {
            fingerprint,
            packed,
            depth,
            seeds_in_pits,
            value: None,
            best_move: None,
        }
    }

    pub fn is_solved(&self) -> bool {
        self.value.is_some()
    }
}

/// How a store handle is opened.
#[derive(Clone, Debug)]
pub struct OpenOptions {
    pub durability: Durability,
    /// Create the file and schema if absent. Worker handles leave this
    /// off so a mistyped path fails loudly instead of spawning an empty
    /// database.
    pub create: bool,
    /// Page-cache budget for this connection, usually taken from the
    /// resource monitor's recommendation.
    pub cache_bytes: u64,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            durability: Durability::Normal,
            create: true,
            cache_bytes: 64 << 20,
        }
    }
}

impl OpenOptions {
    /// Options for an additional handle onto an existing store, as opened
    /// by worker threads and read-only commands.
    pub fn handle(durability: Durability) -> OpenOptions {
        OpenOptions {
            durability,
            create: false,
            cache_bytes: 64 << 20,
        }
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS positions (
    fingerprint   INTEGER NOT NULL,
    state         BLOB NOT NULL,
    depth         INTEGER NOT NULL,
    seeds_in_pits INTEGER NOT NULL,
    value         INTEGER,
    best_move     INTEGER
);
CREATE INDEX IF NOT EXISTS idx_fingerprint   ON positions(fingerprint);
CREATE INDEX IF NOT EXISTS idx_depth         ON positions(depth);
CREATE INDEX IF NOT EXISTS idx_seeds_in_pits ON positions(seeds_in_pits);
";

const SELECT_COLUMNS: &str = "fingerprint, state, depth, seeds_in_pits, value, best_move";

pub struct Store {
    conn: Connection,
    path: PathBuf,
    durability: Durability,
}

impl Store {
    pub fn open(path: &Path, options: &OpenOptions) -> Result<Store, StoreError> {
        let conn = if options.create {
            Connection::open(path)?
        } else {
            Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)?
        };

        // Worker handles contend with the writer; give them a generous
        // window before surfacing SQLITE_BUSY.
        conn.busy_timeout(Duration::from_secs(30))?;

        let store = Store {
            conn,
            path: path.to_path_buf(),
            durability: options.durability,
        };
        store.apply_pragmas(options)?;
        if options.create {
            store.conn.execute_batch(SCHEMA)?;
        }

        Ok(store)
    }

    fn apply_pragmas(&self, options: &OpenOptions) -> Result<(), StoreError> {
        // SQLite takes the cache budget as a negative KiB count. The mmap
        // window scales with the cache, capped at 512 MiB. journal_mode
        // and mmap_size report their new setting back as a row, so they
        // go through query_row rather than a batch.
        let cache_kib = (options.cache_bytes / 1024) as i64;
        let mmap_bytes = (options.cache_bytes * 4).min(512 << 20);

        match options.durability {
            Durability::Normal => {
                let _mode: String =
                    self.conn
                        .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
                self.conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
                debug!(
                    cache_mib = options.cache_bytes >> 20,
                    mmap_mib = mmap_bytes >> 20,
                    "store opened in normal durability (WAL)"
                );
            }
            Durability::Fast => {
                let _mode: String =
                    self.conn
                        .query_row("PRAGMA journal_mode = OFF", [], |row| row.get(0))?;
                self.conn.execute_batch(
                    "PRAGMA synchronous = OFF;
                     PRAGMA read_uncommitted = ON;",
                )?;
                if options.create {
                    warn!(
                        "fast durability enabled: no crash recovery, the store \
                         is discardable if this process dies"
                    );
                }
            }
        }

        self.conn.execute_batch(&format!(
            "PRAGMA cache_size = -{};
             PRAGMA temp_store = MEMORY;",
            cache_kib
        ))?;
        let _mmap: i64 =
            self.conn
                .query_row(&format!("PRAGMA mmap_size = {}", mmap_bytes), [], |row| {
                    row.get(0)
                })?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn durability(&self) -> Durability {
        self.durability
    }

    /// Inserts one record if its fingerprint is absent. Returns whether an
    /// insert happened.
    pub fn insert(&mut self, record: &Record) -> Result<bool, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO positions (fingerprint, state, depth, seeds_in_pits)
             SELECT ?1, ?2, ?3, ?4
             WHERE NOT EXISTS (SELECT 1 FROM positions WHERE fingerprint = ?1)",
        )?;
        let inserted = stmt.execute(params![
            record.fingerprint as i64,
            record.packed,
            record.depth,
            record.seeds_in_pits
        ])?;
        Ok(inserted == 1)
    }

    /// Bulk insert, the write hot path: one transaction per batch. With
    /// `allow_duplicates` the rows are appended blindly (to be reconciled
    /// by the compactor); otherwise duplicate fingerprints are dropped
    /// silently. Returns the number of rows actually inserted.
    pub fn insert_batch(
        &mut self,
        records: &[Record],
        allow_duplicates: bool,
    ) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        let mut inserted = 0usize;
        {
            let sql = if allow_duplicates {
                "INSERT INTO positions (fingerprint, state, depth, seeds_in_pits)
                 VALUES (?1, ?2, ?3, ?4)"
            } else {
                "INSERT INTO positions (fingerprint, state, depth, seeds_in_pits)
                 SELECT ?1, ?2, ?3, ?4
                 WHERE NOT EXISTS (SELECT 1 FROM positions WHERE fingerprint = ?1)"
            };
            let mut stmt = tx.prepare_cached(sql)?;
            for record in records {
                inserted += stmt.execute(params![
                    record.fingerprint as i64,
                    record.packed,
                    record.depth,
                    record.seeds_in_pits
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn exists(&self, fingerprint: u64) -> Result<bool, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT 1 FROM positions WHERE fingerprint = ?1 LIMIT 1")?;
        let found = stmt
            .query_row(params![fingerprint as i64], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get(&self, fingerprint: u64) -> Result<Option<Record>, StoreError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {} FROM positions WHERE fingerprint = ?1 LIMIT 1",
            SELECT_COLUMNS
        ))?;
        let record = stmt
            .query_row(params![fingerprint as i64], read_record)
            .optional()?;
        Ok(record)
    }

    /// Streams every record at one depth through the callback. Restartable
    /// and unordered within the depth.
    pub fn scan_by_depth<E, F>(&self, depth: u8, mut f: F) -> Result<(), E>
    where
        E: From<StoreError>,
        F: FnMut(Record) -> Result<(), E>,
    {
        let mut stmt = self
            .conn
            .prepare_cached(&format!(
                "SELECT {} FROM positions WHERE depth = ?1",
                SELECT_COLUMNS
            ))
            .map_err(|e| E::from(StoreError::from(e)))?;
        let mut rows = stmt
            .query(params![depth])
            .map_err(|e| E::from(StoreError::from(e)))?;
        while let Some(row) = rows.next().map_err(|e| E::from(StoreError::from(e)))? {
            f(read_record(row).map_err(|e| E::from(StoreError::from(e)))?)?;
        }

        Ok(())
    }

    /// One page of a depth, for workers partitioning a frontier without
    /// materializing it in one place.
    pub fn scan_by_depth_page(
        &self,
        depth: u8,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Record>, StoreError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {} FROM positions WHERE depth = ?1 LIMIT ?2 OFFSET ?3",
            SELECT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![depth, limit as i64, offset as i64], read_record)?;
        let mut page = Vec::new();
        for row in rows {
            page.push(row?);
        }

        Ok(page)
    }

    /// Streams every record in one retrograde layer through the callback.
    pub fn scan_by_seeds_in_pits<E, F>(&self, seeds_in_pits: u8, mut f: F) -> Result<(), E>
    where
        E: From<StoreError>,
        F: FnMut(Record) -> Result<(), E>,
    {
        let mut stmt = self
            .conn
            .prepare_cached(&format!(
                "SELECT {} FROM positions WHERE seeds_in_pits = ?1",
                SELECT_COLUMNS
            ))
            .map_err(|e| E::from(StoreError::from(e)))?;
        let mut rows = stmt
            .query(params![seeds_in_pits])
            .map_err(|e| E::from(StoreError::from(e)))?;
        while let Some(row) = rows.next().map_err(|e| E::from(StoreError::from(e)))? {
            f(read_record(row).map_err(|e| E::from(StoreError::from(e)))?)?;
        }

        Ok(())
    }

    /// One page of the still-unsolved records in a layer.
    pub fn scan_unsolved_by_seeds_page(
        &self,
        seeds_in_pits: u8,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Record>, StoreError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {} FROM positions WHERE seeds_in_pits = ?1 AND value IS NULL
             LIMIT ?2 OFFSET ?3",
            SELECT_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![seeds_in_pits, limit as i64, offset as i64],
            read_record,
        )?;
        let mut page = Vec::new();
        for row in rows {
            page.push(row?);
        }

        Ok(page)
    }

    pub fn count_unsolved_at_seeds(&self, seeds_in_pits: u8) -> Result<u64, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT COUNT(*) FROM positions WHERE seeds_in_pits = ?1 AND value IS NULL",
        )?;
        let count: i64 = stmt.query_row(params![seeds_in_pits], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Records a solution. The record must already exist; re-recording the
    /// same solution is harmless.
    pub fn update_solution(
        &mut self,
        fingerprint: u64,
        value: i8,
        best_move: Option<u8>,
    ) -> Result<(), StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "UPDATE positions SET value = ?2, best_move = ?3 WHERE fingerprint = ?1",
        )?;
        let updated = stmt.execute(params![fingerprint as i64, value, best_move])?;
        if updated == 0 {
            return Err(StoreError::Missing(fingerprint));
        }

        Ok(())
    }

    /// Records a page of solutions in one transaction. This is the
    /// evaluator's write path; SQLite has a single writer, so solutions
    /// from all workers funnel through here.
    pub fn update_solutions(
        &mut self,
        solutions: &[(u64, i8, Option<u8>)],
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE positions SET value = ?2, best_move = ?3 WHERE fingerprint = ?1",
            )?;
            for &(fingerprint, value, best_move) in solutions {
                let updated = stmt.execute(params![fingerprint as i64, value, best_move])?;
                if updated == 0 {
                    return Err(StoreError::Missing(fingerprint));
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Total records, optionally restricted to one depth.
    pub fn count(&self, depth: Option<u8>) -> Result<u64, StoreError> {
        let count: i64 = match depth {
            Some(depth) => {
                let mut stmt = self
                    .conn
                    .prepare_cached("SELECT COUNT(*) FROM positions WHERE depth = ?1")?;
                stmt.query_row(params![depth], |row| row.get(0))?
            }
            None => {
                let mut stmt = self.conn.prepare_cached("SELECT COUNT(*) FROM positions")?;
                stmt.query_row([], |row| row.get(0))?
            }
        };

        Ok(count as u64)
    }

    /// The deepest frontier present, or -1 for an empty store. The
    /// enumerator uses this to resume interrupted runs.
    pub fn max_depth(&self) -> Result<i64, StoreError> {
        let mut stmt = self.conn.prepare_cached("SELECT MAX(depth) FROM positions")?;
        let max: Option<i64> = stmt.query_row([], |row| row.get(0))?;
        Ok(max.unwrap_or(-1))
    }

    /// Makes previously committed writes durable. A passive WAL checkpoint
    /// in normal mode; meaningless (and skipped) in fast mode, which has
    /// no durability to offer.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        if self.durability == Durability::Normal {
            // The checkpoint reports (busy, log, checkpointed) back.
            let _: i64 = self
                .conn
                .query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |row| row.get(0))?;
        }

        Ok(())
    }

    /// Distinct fingerprints currently stored. Equal to [`Store::count`]
    /// exactly when the store is duplicate-free.
    pub fn count_distinct_fingerprints(&self) -> Result<u64, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT COUNT(DISTINCT fingerprint) FROM positions")?;
        let count: i64 = stmt.query_row([], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Rewrites the relation keeping one record per fingerprint at the
    /// minimum depth, then rebuilds the secondary indices the swap drops.
    /// The compactor wraps this with counting and space reclamation.
    pub fn rewrite_deduplicated(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "BEGIN;
             DROP TABLE IF EXISTS positions_dedup;
             CREATE TABLE positions_dedup AS
                 SELECT fingerprint,
                        MIN(state)         AS state,
                        MIN(depth)         AS depth,
                        MIN(seeds_in_pits) AS seeds_in_pits,
                        MIN(value)         AS value,
                        MIN(best_move)     AS best_move
                 FROM positions
                 GROUP BY fingerprint;
             DROP TABLE positions;
             ALTER TABLE positions_dedup RENAME TO positions;
             CREATE INDEX idx_fingerprint   ON positions(fingerprint);
             CREATE INDEX idx_depth         ON positions(depth);
             CREATE INDEX idx_seeds_in_pits ON positions(seeds_in_pits);
             COMMIT;",
        )?;
        Ok(())
    }

    /// Releases the space freed by a rewrite back to the filesystem.
    pub fn vacuum(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch("VACUUM;")?;
        Ok(())
    }
}

fn read_record(row: &Row<'_>) -> rusqlite::Result<Record> {
    Ok(Record {
        fingerprint: row.get::<_, i64>(0)? as u64,
        packed: row.get(1)?,
        depth: row.get::<_, i64>(2)? as u8,
        seeds_in_pits: row.get::<_, i64>(3)? as u8,
        value: row.get::<_, Option<i64>>(4)?.map(|v| v as i8),
        best_move: row.get::<_, Option<i64>>(5)?.map(|m| m as u8),
    })
}
