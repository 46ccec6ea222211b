// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// `Key` names a logical partition of the record store. Keys are opaque to
/// this crate; they are typically issued by some external party.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key(pub String);

/// `Field` names one member within a key.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Field(pub String);

/// Distinguishes concurrent write attempts on the same field.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub String);

/// `Score` is the freshness marker of a tuple: when two versions of the same
/// tuple meet, the higher score wins.
///
/// Scores are floats, but we need them as map keys and as lattice values, so
/// they carry the IEEE total order rather than the partial one. Two scores are
/// equal exactly when their bit patterns are.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Score(pub f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Hash for Score {
    fn hash<H: Hasher>(&self, hstate: &mut H) {
        self.0.to_bits().hash(hstate);
    }
}

impl From<f64> for Score {
    fn from(f: f64) -> Self {
        Score(f)
    }
}

macro_rules! string_newtype {
    ($t:ident) => {
        impl From<&str> for $t {
            fn from(s: &str) -> Self {
                $t(s.to_string())
            }
        }
        impl From<String> for $t {
            fn from(s: String) -> Self {
                $t(s)
            }
        }
        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_newtype!(Key);
string_newtype!(Field);
string_newtype!(TransactionId);

/// A versioned record: the unit of storage on every shard.
///
/// The derived order is (key, field, score, txn, value), which is also the
/// "full identity" order used by `TupleSet`.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyFieldScoreTxnValue {
    pub key: Key,
    pub field: Field,
    pub score: Score,
    pub txn: TransactionId,
    pub value: Vec<u8>,
}

/// A tuple with its score stripped off. This is the identity under which
/// versions of the same record are merged.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyFieldTxnValue {
    pub key: Key,
    pub field: Field,
    pub txn: TransactionId,
    pub value: Vec<u8>,
}

impl KeyFieldScoreTxnValue {
    pub fn new<K, F, T>(key: K, field: F, score: f64, txn: T, value: impl Into<Vec<u8>>) -> Self
    where
        K: Into<Key>,
        F: Into<Field>,
        T: Into<TransactionId>,
    {
        KeyFieldScoreTxnValue {
            key: key.into(),
            field: field.into(),
            score: Score(score),
            txn: txn.into(),
            value: value.into(),
        }
    }

    pub fn identity(&self) -> KeyFieldTxnValue {
        KeyFieldTxnValue {
            key: self.key.clone(),
            field: self.field.clone(),
            txn: self.txn.clone(),
            value: self.value.clone(),
        }
    }
}

impl KeyFieldTxnValue {
    pub fn with_score(self, score: Score) -> KeyFieldScoreTxnValue {
        KeyFieldScoreTxnValue {
            key: self.key,
            field: self.field,
            score,
            txn: self.txn,
            value: self.value,
        }
    }
}

/// Bounds a shard applies to incoming writes. A zero bound means unbounded.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SizeLimits {
    pub max_field_bytes: usize,
    pub max_value_bytes: usize,
    pub max_members_per_key: usize,
}

impl SizeLimits {
    fn exceeds(bound: usize, n: usize) -> bool {
        bound != 0 && n > bound
    }

    /// Returns a description of the first bound `tuple` violates, if any.
    pub fn violation(&self, tuple: &KeyFieldScoreTxnValue) -> Option<String> {
        if Self::exceeds(self.max_field_bytes, tuple.field.0.len()) {
            return Some(format!(
                "field of {} bytes exceeds limit of {}",
                tuple.field.0.len(),
                self.max_field_bytes
            ));
        }
        if Self::exceeds(self.max_value_bytes, tuple.value.len()) {
            return Some(format!(
                "value of {} bytes exceeds limit of {}",
                tuple.value.len(),
                self.max_value_bytes
            ));
        }
        None
    }

    pub fn admits_members(&self, n: usize) -> bool {
        !Self::exceeds(self.max_members_per_key, n)
    }
}
