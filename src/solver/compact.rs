// Copyright 2022-2023 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The dedup compactor. A duplicate-tolerant enumeration leaves multiple
//! rows per fingerprint behind; this pass rewrites the relation keeping
//! one row per fingerprint at its minimum depth, rebuilds the secondary
//! indices the rewrite drops, and hands freed pages back to the
//! filesystem. Safe to run on a clean store, and running it twice changes
//! nothing observable.

use tracing::info;

use crate::{solver::SolveError, store::Store};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CompactSummary {
    pub before: u64,
    pub after: u64,
    pub removed: u64,
}

pub fn run(store: &mut Store) -> Result<CompactSummary, SolveError> {
    let before = store.count(None)?;
    let distinct = store.count_distinct_fingerprints()?;

    if before == distinct {
        info!(positions = before, "store has no duplicates; nothing to compact");
        return Ok(CompactSummary {
            before,
            after: before,
            removed: 0,
        });
    }

    info!(
        positions = before,
        distinct,
        duplicates = before - distinct,
        "compacting duplicate records"
    );
    store.rewrite_deduplicated()?;
    store.vacuum()?;

    let after = store.count(None)?;
    info!(
        positions = after,
        removed = before - after,
        "compaction complete"
    );

    Ok(CompactSummary {
        before,
        after,
        removed: before - after,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{OpenOptions, Record, Store};

    fn record(fingerprint: u64, depth: u8) -> Record {
        Record::unsolved(fingerprint, vec![fingerprint as u8, 7], depth, 6)
    }

    #[test]
    fn keeps_one_copy_at_minimum_depth() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(&dir.path().join("kalah.db"), &OpenOptions::default()).unwrap();

        store
            .insert_batch(
                &[
                    record(1, 4),
                    record(1, 2),
                    record(1, 7),
                    record(2, 3),
                    record(3, 5),
                    record(3, 5),
                ],
                true,
            )
            .unwrap();

        let summary = run(&mut store).unwrap();
        assert_eq!(
            CompactSummary {
                before: 6,
                after: 3,
                removed: 3
            },
            summary
        );

        assert_eq!(2, store.get(1).unwrap().unwrap().depth);
        assert_eq!(3, store.get(2).unwrap().unwrap().depth);
        assert_eq!(5, store.get(3).unwrap().unwrap().depth);
    }

    #[test]
    fn indices_survive_the_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(&dir.path().join("kalah.db"), &OpenOptions::default()).unwrap();

        store
            .insert_batch(&[record(1, 1), record(1, 1), record(2, 2)], true)
            .unwrap();
        run(&mut store).unwrap();

        // Depth and layer scans still answer after the table swap.
        assert_eq!(1, store.count(Some(1)).unwrap());
        assert_eq!(1, store.count(Some(2)).unwrap());
        assert_eq!(2, store.count_unsolved_at_seeds(6).unwrap());
        assert_eq!(2, store.max_depth().unwrap());
    }

    #[test]
    fn second_run_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(&dir.path().join("kalah.db"), &OpenOptions::default()).unwrap();

        store
            .insert_batch(&[record(1, 1), record(1, 3), record(2, 2)], true)
            .unwrap();

        let first = run(&mut store).unwrap();
        assert_eq!(1, first.removed);

        let second = run(&mut store).unwrap();
        assert_eq!(
            CompactSummary {
                before: 2,
                after: 2,
                removed: 0
            },
            second
        );
        assert_eq!(1, store.get(1).unwrap().unwrap().depth);
    }

    #[test]
    fn clean_store_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(&dir.path().join("kalah.db"), &OpenOptions::default()).unwrap();

        store
            .insert_batch(&[record(1, 1), record(2, 2)], false)
            .unwrap();
        let summary = run(&mut store).unwrap();
        assert_eq!(0, summary.removed);
        assert_eq!(2, summary.after);
    }
}
