//! chunkfetch core - download engine
//!
//! This crate splits remote files into byte ranges, fetches them
//! concurrently and assembles the result in memory. Downloads can be
//! paused, resumed and cancelled, throttled per download, and capped in
//! number by a [`DownloadManager`].

mod engine;
mod error;

pub use engine::*;
pub use error::*;

pub use chunkfetch_types as types;
