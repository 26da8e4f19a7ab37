//! YCSB workload files and synthetic transaction patterns.
//!
//! Files are named `load_<type>_workload<idx><id>` and
//! `txn_<type>_workload<idx><id>`, one per loader / worker id. Lines are
//! `<OP> <key> [<range>]` for integer workloads and `<OP> <key>` for string
//! workloads.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use rand::Rng;
use rand::SeedableRng;
use rand_distr::Distribution;

use crate::error::{Error, Result};
use crate::request::{Key, OpKind, WorkloadEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum WorkloadType {
    /// Fixed-width integer keys
    Randint,
    /// Variable-length string keys
    Email,
}

impl WorkloadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadType::Randint => "randint",
            WorkloadType::Email => "email",
        }
    }

    #[inline]
    pub fn is_str(&self) -> bool {
        matches!(self, WorkloadType::Email)
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum KeyDistribution {
    Uniform,
    Zipfian,
}

pub fn load_path(dir: &Path, ty: WorkloadType, idx: &str, loader_id: u64) -> PathBuf {
    dir.join(format!("load_{}_workload{}{}", ty.as_str(), idx, loader_id))
}

pub fn txn_path(dir: &Path, ty: WorkloadType, idx: &str, worker_id: u64) -> PathBuf {
    dir.join(format!("txn_{}_workload{}{}", ty.as_str(), idx, worker_id))
}

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| Error::WorkloadOpen {
            path: path.to_path_buf(),
            source,
        })
}

fn parse_error(path: &Path, line: usize, reason: impl Into<String>) -> Error {
    Error::WorkloadParse {
        path: path.to_path_buf(),
        line,
        reason: reason.into(),
    }
}

fn parse_key(path: &Path, line: usize, ty: WorkloadType, raw: Option<&str>) -> Result<Key> {
    let raw = raw.ok_or_else(|| parse_error(path, line, "missing key"))?;
    if ty.is_str() {
        return Ok(Key::Str(raw.to_string()));
    }
    raw.parse::<u64>()
        .map(Key::Int)
        .map_err(|e| parse_error(path, line, format!("bad integer key {raw:?}: {e}")))
}

/// Call `f(line_no, tokens)` for every non-empty line.
fn for_each_line(
    path: &Path,
    mut f: impl FnMut(usize, &mut std::str::SplitWhitespace<'_>) -> Result<()>,
) -> Result<()> {
    let reader = open(path)?;
    for (i, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| Error::WorkloadOpen {
            path: path.to_path_buf(),
            source,
        })?;
        let mut tokens = line.split_whitespace();
        if line.trim().is_empty() {
            continue;
        }
        f(i + 1, &mut tokens)?;
    }
    Ok(())
}

/// Read the keys of a load file. Every line must be an `INSERT`.
pub fn read_load_file(path: &Path, ty: WorkloadType) -> Result<Vec<Key>> {
    let mut keys = Vec::new();
    for_each_line(path, |line, tokens| {
        let op = tokens.next().unwrap_or_default();
        if op != "INSERT" {
            return Err(parse_error(path, line, format!("load files only hold INSERT, got {op:?}")));
        }
        keys.push(parse_key(path, line, ty, tokens.next())?);
        Ok(())
    })?;
    Ok(keys)
}

/// Read a transaction file.
///
/// `fix_range_size` overrides the range column of every scan. String
/// workloads do not support scans.
pub fn read_txn_file(
    path: &Path,
    ty: WorkloadType,
    fix_range_size: Option<u64>,
) -> Result<Vec<WorkloadEntry>> {
    let mut entries = Vec::new();
    for_each_line(path, |line, tokens| {
        let op: OpKind = tokens
            .next()
            .unwrap_or_default()
            .parse()
            .map_err(|e: String| parse_error(path, line, e))?;
        let key = parse_key(path, line, ty, tokens.next())?;
        let range_size = match op {
            OpKind::Scan if ty.is_str() => {
                return Err(parse_error(path, line, "string workloads do not support SCAN"));
            }
            OpKind::Scan => {
                let column = match tokens.next() {
                    Some(raw) => raw
                        .parse::<u64>()
                        .map_err(|e| parse_error(path, line, format!("bad range {raw:?}: {e}")))?,
                    None => 0,
                };
                fix_range_size.unwrap_or(column)
            }
            _ => 0,
        };
        entries.push(WorkloadEntry { op, key, range_size });
        Ok(())
    })?;
    if entries.is_empty() {
        return Err(Error::EmptyWorkload {
            path: path.to_path_buf(),
        });
    }
    Ok(entries)
}

/// Generate an integer-key transaction sequence without workload files.
/// Non-read operations are updates, so the sequence can be replayed forever.
pub fn generate_pattern(
    key_range: u64,
    read_ratio: f64,
    distribution: KeyDistribution,
    pattern_len: usize,
    seed: u64,
) -> Vec<WorkloadEntry> {
    let mut rng = rand::rngs::SmallRng::seed_from_u64(seed);
    let key_range = key_range.max(1);
    let zipf = match distribution {
        KeyDistribution::Uniform => None,
        KeyDistribution::Zipfian => rand_distr::Zipf::new(key_range as f64, 0.99).ok(),
    };

    (0..pattern_len)
        .map(|_| {
            let key = match &zipf {
                Some(zipf) => (zipf.sample(&mut rng) as u64 - 1).min(key_range - 1),
                None => rng.random_range(0..key_range),
            };
            let op = if rng.random::<f64>() < read_ratio {
                OpKind::Read
            } else {
                OpKind::Update
            };
            WorkloadEntry {
                op,
                key: Key::Int(key),
                range_size: 0,
            }
        })
        .collect()
}
