// Copyright 2022-2023 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Memory and disk monitoring for long-running solves. The solvers poll
//! this every handful of chunks, so sampling has to stay cheap: memory
//! reads refresh a single [`sysinfo::System`], and the disk guard only
//! enumerates mounts when actually called (once per depth or layer).

use std::path::{Path, PathBuf};

use sysinfo::{Disks, System};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{DEFAULT_MEMORY_CRITICAL_BYTES, DEFAULT_MEMORY_THROTTLED_BYTES};

/// Never recommend less page cache than this.
const MIN_CACHE_BYTES: u64 = 16 << 20;

/// Absolute free-disk floor; the effective floor is the larger of this and
/// 5% of the volume.
const MIN_FREE_DISK_BYTES: u64 = 5 << 30;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error(
        "free disk space at {} is {} GiB, below the {} GiB floor",
        .path.display(),
        .free_bytes >> 30,
        .required_bytes >> 30
    )]
    DiskBelowThreshold {
        path: PathBuf,
        free_bytes: u64,
        required_bytes: u64,
    },
}

/// Memory pressure, derived from available RAM against two thresholds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryState {
    Normal,
    Throttled,
    Critical,
}

pub struct ResourceMonitor {
    system: System,
    store_path: PathBuf,
    throttled_bytes: u64,
    critical_bytes: u64,
    last_state: MemoryState,
}

impl ResourceMonitor {
    pub fn new(store_path: &Path, throttled_bytes: u64, critical_bytes: u64) -> ResourceMonitor {
        ResourceMonitor {
            system: System::new(),
            store_path: store_path.to_path_buf(),
            throttled_bytes,
            critical_bytes,
            last_state: MemoryState::Normal,
        }
    }

    pub fn with_defaults(store_path: &Path) -> ResourceMonitor {
        ResourceMonitor::new(
            store_path,
            DEFAULT_MEMORY_THROTTLED_BYTES,
            DEFAULT_MEMORY_CRITICAL_BYTES,
        )
    }

    /// Samples available RAM and classifies it. Transitions are logged so
    /// the event stream records when a run started throttling.
    pub fn memory_state(&mut self) -> MemoryState {
        self.system.refresh_memory();
        let available = self.system.available_memory();

        let state = if available < self.critical_bytes {
            MemoryState::Critical
        } else if available < self.throttled_bytes {
            MemoryState::Throttled
        } else {
            MemoryState::Normal
        };

        if state != self.last_state {
            warn!(
                from = ?self.last_state,
                to = ?state,
                available_gib = available >> 30,
                "memory state changed"
            );
            self.last_state = state;
        }

        state
    }

    /// Recommended store page-cache budget: 5% of available RAM, clamped
    /// into `[16 MiB, ceiling]`.
    pub fn recommend_cache_bytes(&mut self, ceiling: u64) -> u64 {
        self.system.refresh_memory();
        let adaptive = self.system.available_memory() / 20;
        adaptive.clamp(MIN_CACHE_BYTES, ceiling.max(MIN_CACHE_BYTES))
    }

    /// Fails when free space on the store's volume drops below
    /// `max(5 GiB, 5%)`. Running a multi-hundred-gigabyte enumeration into
    /// a full disk corrupts nothing but wastes days; this aborts early.
    pub fn disk_check(&self) -> Result<(), ResourceError> {
        let disks = Disks::new_with_refreshed_list();
        let mut best: Option<(&Path, u64, u64)> = None;
        for disk in disks.list() {
            let mount = disk.mount_point();
            if self.store_path.starts_with(mount) {
                let longer = match best {
                    Some((prev, _, _)) => mount.as_os_str().len() > prev.as_os_str().len(),
                    None => true,
                };
                if longer {
                    best = Some((mount, disk.available_space(), disk.total_space()));
                }
            }
        }

        // No matching mount (unusual container setups): nothing to check.
        let (_, free, total) = match best {
            Some(found) => found,
            None => return Ok(()),
        };

        let required = MIN_FREE_DISK_BYTES.max(total / 20);
        if free < required {
            return Err(ResourceError::DiskBelowThreshold {
                path: self.store_path.clone(),
                free_bytes: free,
                required_bytes: required,
            });
        }

        Ok(())
    }

    /// One structured line of the current memory picture.
    pub fn log_memory(&mut self) {
        self.system.refresh_memory();
        info!(
            available_gib = self.system.available_memory() >> 30,
            total_gib = self.system.total_memory() >> 30,
            swap_used_gib = self.system.used_swap() >> 30,
            "memory snapshot"
        );
    }
}
