//! Keys, values and the requests handed from generators to the engine.

use std::fmt;

pub type Value = u64;

pub const VALUE_MIN: Value = 1;
pub const VALUE_MAX: Value = (1 << 48) - 1;

/// First integer key handed out once an insert workload has wrapped.
/// Keys of the preloaded key space stay below it.
pub const MAX_KEY_SPACE_SIZE: u64 = 60_000_000;

/// Index key. `randint` workloads use fixed-width integer keys, `email`
/// workloads variable-length strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    Int(u64),
    Str(String),
}

impl Key {
    /// 64-bit image used for placement. Integer keys map to themselves,
    /// string keys to an FNV-1a hash.
    pub fn to_u64(&self) -> u64 {
        match self {
            Key::Int(k) => *k,
            Key::Str(s) => {
                let mut h: u64 = 0xcbf2_9ce4_8422_2325;
                for b in s.as_bytes() {
                    h ^= *b as u64;
                    h = h.wrapping_mul(0x0100_0000_01b3);
                }
                h
            }
        }
    }

    /// Key `range` positions above `self`; string keys do not support scans.
    pub fn offset(&self, range: u64) -> Option<Key> {
        match self {
            Key::Int(k) => Some(Key::Int(k.saturating_add(range))),
            Key::Str(_) => None,
        }
    }

    /// Fresh variant of a string key for replay epoch `epoch`.
    pub fn with_epoch(&self, epoch: u64) -> Key {
        match self {
            Key::Str(s) if epoch > 0 => Key::Str(format!("{s}#{epoch}")),
            other => other.clone(),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(k) => write!(f, "{k}"),
            Key::Str(s) => f.write_str(s),
        }
    }
}

/// Operation column of a workload line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Insert,
    Update,
    Scan,
}

impl std::str::FromStr for OpKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "READ" => Ok(OpKind::Read),
            "INSERT" => Ok(OpKind::Insert),
            "UPDATE" => Ok(OpKind::Update),
            "SCAN" => Ok(OpKind::Scan),
            other => Err(format!("unknown operation {other:?}")),
        }
    }
}

/// One preloaded transaction line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadEntry {
    pub op: OpKind,
    pub key: Key,
    pub range_size: u64,
}

/// A request produced by a generator, consumed once by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Search { key: Key },
    Insert { key: Key, value: Value },
    Update { key: Key, value: Value },
    Scan { key: Key, range_size: u64 },
}

impl Request {
    #[inline]
    pub fn key(&self) -> &Key {
        match self {
            Request::Search { key }
            | Request::Insert { key, .. }
            | Request::Update { key, .. }
            | Request::Scan { key, .. } => key,
        }
    }

    #[inline]
    pub fn is_insert(&self) -> bool {
        matches!(self, Request::Insert { .. })
    }
}
