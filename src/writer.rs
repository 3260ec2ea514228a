// Copyright 2022-2023 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The async writer decouples record producers from store writes. A
//! bounded queue accepts batches from enumeration workers; one dedicated
//! writer thread drains it through `insert_batch` and `flush`. Producers
//! block when the queue fills; that is the intended backpressure, sized
//! so a burst of fast workers cannot balloon memory while the disk
//! catches up.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{sync_channel, Receiver, SyncSender},
        Arc, Condvar, Mutex,
    },
    thread::{self, JoinHandle},
};

use thiserror::Error;
use tracing::{debug, error};

use crate::store::{Record, Store, StoreError};

/// Maximum queued batches before producers block.
pub const QUEUE_CAPACITY: usize = 1000;

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("store write failed: {0}")]
    Store(#[from] StoreError),
    #[error("writer failed earlier: {0}")]
    Latched(String),
    #[error("writer thread is gone")]
    Disconnected,
}

struct Shared {
    /// Batches accepted but not yet written (or discarded). Guards the
    /// wait-until-empty handshake together with `drained`.
    pending: Mutex<u64>,
    drained: Condvar,
    /// First store error, rendered; re-raised on every later call.
    latched: Mutex<Option<String>>,
    written: AtomicU64,
}

/// Handle to the writer thread.
pub struct AsyncWriter {
    batches: SyncSender<(Vec<Record>, bool)>,
    shared: Arc<Shared>,
    handle: JoinHandle<()>,
}

impl AsyncWriter {
    /// Spawns the writer thread over its own store handle.
    pub fn spawn(store: Store) -> AsyncWriter {
        let (batches, queue) = sync_channel(QUEUE_CAPACITY);
        let shared = Arc::new(Shared {
            pending: Mutex::new(0),
            drained: Condvar::new(),
            latched: Mutex::new(None),
            written: AtomicU64::new(0),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("bantumi writer".into())
            .spawn(move || writer_loop(store, queue, thread_shared))
            .expect("failed to spawn writer thread");

        AsyncWriter {
            batches,
            shared,
            handle,
        }
    }

    /// Queues a batch for writing, blocking while the queue is full. Any
    /// earlier writer failure re-raises here.
    pub fn put(&self, batch: Vec<Record>, allow_duplicates: bool) -> Result<(), WriterError> {
        self.check_latched()?;
        if batch.is_empty() {
            return Ok(());
        }

        {
            let mut pending = self.shared.pending.lock().unwrap();
            *pending += 1;
        }

        if self.batches.send((batch, allow_duplicates)).is_err() {
            let mut pending = self.shared.pending.lock().unwrap();
            *pending -= 1;
            return Err(self
                .latched_error()
                .unwrap_or(WriterError::Disconnected));
        }

        Ok(())
    }

    /// Blocks until every queued batch has been written. The barrier
    /// between frontiers and between layers.
    pub fn wait_until_empty(&self) -> Result<(), WriterError> {
        let pending = self.shared.pending.lock().unwrap();
        let pending = self
            .shared
            .drained
            .wait_while(pending, |pending| *pending > 0)
            .unwrap();
        drop(pending);
        self.check_latched()
    }

    /// Records actually inserted so far (duplicates dropped by the store
    /// do not count).
    pub fn written(&self) -> u64 {
        self.shared.written.load(Ordering::Acquire)
    }

    /// Shuts the writer down: closing the queue is the sentinel. Returns
    /// the total records written once the thread has drained and exited.
    pub fn finish(self) -> Result<u64, WriterError> {
        let AsyncWriter {
            batches,
            shared,
            handle,
        } = self;
        drop(batches);
        if handle.join().is_err() {
            return Err(WriterError::Disconnected);
        }

        if let Some(message) = shared.latched.lock().unwrap().clone() {
            return Err(WriterError::Latched(message));
        }

        Ok(shared.written.load(Ordering::Acquire))
    }

    fn check_latched(&self) -> Result<(), WriterError> {
        match self.latched_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn latched_error(&self) -> Option<WriterError> {
        self.shared
            .latched
            .lock()
            .unwrap()
            .clone()
            .map(WriterError::Latched)
    }
}

fn writer_loop(mut store: Store, queue: Receiver<(Vec<Record>, bool)>, shared: Arc<Shared>) {
    debug!("writer thread entering drain loop");
    while let Ok((batch, allow_duplicates)) = queue.recv() {
        let failed = shared.latched.lock().unwrap().is_some();
        if !failed {
            let outcome = store
                .insert_batch(&batch, allow_duplicates)
                .and_then(|inserted| store.flush().map(|_| inserted));
            match outcome {
                Ok(inserted) => {
                    shared.written.fetch_add(inserted as u64, Ordering::Release);
                }
                Err(err) => {
                    // Latch the first failure and keep draining so that
                    // blocked producers wake up and observe it.
                    error!(error = %err, "writer failed; discarding subsequent batches");
                    *shared.latched.lock().unwrap() = Some(err.to_string());
                }
            }
        }

        let mut pending = shared.pending.lock().unwrap();
        *pending -= 1;
        if *pending == 0 {
            shared.drained.notify_all();
        }
    }

    debug!(
        written = shared.written.load(Ordering::Acquire),
        "writer thread exiting"
    );
}
