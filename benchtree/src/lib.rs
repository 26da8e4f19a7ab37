//! YCSB benchmark driver for a B+-tree reached through one-sided RDMA.
//!
//! Worker threads host cooperative coroutine slots. Each slot owns a
//! [`arena::ScratchArena`] that tree operations borrow local buffers from,
//! replays its share of the thread's transactions through a
//! [`generator::ReplayGenerator`], and records latency and tree counters in
//! its thread's [`stats::ThreadStats`]. The driver samples and resets those
//! statistics once per epoch.

pub mod affinity;
pub mod arena;
pub mod config;
pub mod driver;
pub mod engine;
pub mod epoch;
pub mod error;
pub mod generator;
#[cfg(feature = "mpi")]
pub mod mpi_util;
pub mod parquet_out;
pub mod request;
pub mod sim;
pub mod stats;
pub mod transport;
pub mod tree;
pub mod worker;
pub mod workload;

pub use error::{Error, Result};
