// Copyright 2022-2023 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The solving pipeline: forward enumeration, compaction, retrograde
//! evaluation, and post-solve verification, plus the worker pool they run
//! on. Each phase is a free-standing `run` function over a [`Config`];
//! the `solve` command chains them.

pub mod compact;
pub mod enumerate;
pub mod evaluate;
pub mod pool;
pub mod verify;

use thiserror::Error;

use crate::{codec::CodecError, monitor::ResourceError, store::StoreError, writer::WriterError};

#[derive(Debug, Error)]
pub enum SolveError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("writer: {0}")]
    Writer(#[from] WriterError),
    #[error("resource guard: {0}")]
    Resource(#[from] ResourceError),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("worker pool: {0}")]
    Pool(#[from] pool::Disconnected),
    #[error(
        "layer {seeds_in_pits} made no progress with {remaining} unsolved after {iterations} \
         passes: the layer contains a dependency cycle"
    )]
    NoProgress {
        seeds_in_pits: u8,
        remaining: u64,
        iterations: u32,
    },
    #[error("successor {fingerprint:#018x} in layer {seeds_in_pits} is missing from the store")]
    MissingSuccessor { fingerprint: u64, seeds_in_pits: u8 },
    #[error("frontier depth exceeds the representable maximum of 255")]
    DepthExhausted,
    #[error("start position is absent or unsolved; run enumeration and evaluation first")]
    StartUnsolved,
}
