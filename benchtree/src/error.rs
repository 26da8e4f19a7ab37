//! Error types for benchtree.

use std::io;
use std::path::PathBuf;

/// Fatal benchmark errors.
///
/// Lock contention and read retries are not errors; they only show up in
/// the statistics counters.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error outside of workload and report files.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// A workload file could not be opened or read.
    #[error("cannot read workload file {}: {source}", path.display())]
    WorkloadOpen { path: PathBuf, source: io::Error },
    /// A workload line could not be parsed.
    #[error("{}:{line}: {reason}", path.display())]
    WorkloadParse {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    /// A transaction sequence has no requests to replay.
    #[error("workload {} contains no requests", path.display())]
    EmptyWorkload { path: PathBuf },
    /// Invalid command line or derived configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Another node gave up; this one cannot finish the run either.
    #[error("another node aborted the run")]
    ClusterAborted,
    /// A latency or parquet report could not be written.
    #[error("cannot write report {}: {source}", path.display())]
    ReportWrite {
        path: PathBuf,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Result type for benchtree operations.
pub type Result<T> = std::result::Result<T, Error>;
