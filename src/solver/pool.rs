// Copyright 2022-2023 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A fixed-size pool of named worker threads. The orchestrator feeds
//! tasks into a shared channel and collects one result per task; workers
//! are stateful (each carries its own store handle and fingerprint table)
//! but share nothing mutable with each other.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use thiserror::Error;

/// A worker thread panicked or the pool has been shut down; whatever
/// happened, the current frontier or layer cannot complete.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
#[error("worker pool disconnected")]
pub struct Disconnected;

/// Per-thread task processor. One instance is moved onto each pool
/// thread; it keeps whatever handles it needs as fields.
pub trait Worker: Send + 'static {
    type Task: Send + 'static;
    type Output: Send + 'static;

    fn run(&mut self, task: Self::Task) -> Self::Output;
}

pub struct WorkerPool<W: Worker> {
    tasks: Option<Sender<W::Task>>,
    results: Receiver<W::Output>,
    handles: Vec<JoinHandle<()>>,
}

impl<W: Worker> WorkerPool<W> {
    /// Spawns one thread per worker. Workers idle on the task channel
    /// until work arrives and exit when the pool is dropped. The result
    /// channel is bounded so that a slow consumer stalls the workers
    /// instead of letting finished output pile up in memory.
    pub fn spawn(name: &str, workers: Vec<W>) -> WorkerPool<W> {
        let (task_tx, task_rx) = unbounded::<W::Task>();
        let (result_tx, result_rx) = bounded::<W::Output>(2 * workers.len().max(1));

        let handles = workers
            .into_iter()
            .enumerate()
            .map(|(id, mut worker)| {
                let tasks = task_rx.clone();
                let results = result_tx.clone();
                thread::Builder::new()
                    .name(format!("bantumi {} {}", name, id))
                    .spawn(move || {
                        while let Ok(task) = tasks.recv() {
                            if results.send(worker.run(task)).is_err() {
                                return;
                            }
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        WorkerPool {
            tasks: Some(task_tx),
            results: result_rx,
            handles,
        }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    pub fn submit(&self, task: W::Task) -> Result<(), Disconnected> {
        match &self.tasks {
            Some(tasks) => tasks.send(task).map_err(|_| Disconnected),
            None => Err(Disconnected),
        }
    }

    /// Receives one task's output. Blocks; call exactly as many times as
    /// tasks were submitted.
    pub fn recv(&self) -> Result<W::Output, Disconnected> {
        self.results.recv().map_err(|_| Disconnected)
    }
}

impl<W: Worker> Drop for WorkerPool<W> {
    fn drop(&mut self) {
        // Closing the task channel is the shutdown signal.
        self.tasks.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
