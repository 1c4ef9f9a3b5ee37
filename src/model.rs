use std::fmt;

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};

/// A validated (weight, height) submission.
///
/// Both components are non-zero, so every pair that exists can be fed to the
/// calculator. Equality is on the parsed integers, which makes the pair its
/// own canonical dedup key: "070" and "70" produce the same pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputPair {
    weight: u32,
    height: u32,
}

impl InputPair {
    pub fn new(weight: u32, height: u32) -> Option<Self> {
        if weight == 0 || height == 0 {
            return None;
        }
        Some(Self { weight, height })
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

impl fmt::Display for InputPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.weight, self.height)
    }
}

/// A persisted score, addressable by its id forever.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Record {
    pub id: u64,
    pub value: f64,
}

/// One frame of the on-disk log.
///
/// The log is replayed in order on open: the highest `Counter` wins, each
/// `Record` id appears at most once, and the first `Dedup` entry per pair
/// that points at a written record wins.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub enum LogEntry {
    /// Id counter after an allocation.
    Counter { value: u64 },

    /// An immutable computed score.
    Record { id: u64, value: f64 },

    /// First-writer claim of an input pair.
    Dedup { weight: u32, height: u32, id: u64 },
}
