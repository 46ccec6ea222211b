// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Agreement tracking over the scalar outcomes shards report.
//!
//! `SimilarInt` answers "did everyone say the same thing?" and `LargestInt`
//! answers "if not, what do we report instead?". Neither cares about the
//! order observations arrive in.

use crate::{FarmError, FarmResult};
use im::OrdSet;

/// Tracks whether every observed value so far has been the same one.
///
/// Once two distinct values have been seen the tracker stays in disagreement
/// for the rest of its life.
#[derive(Clone, Debug, Default)]
pub struct SimilarInt {
    values: OrdSet<i64>,
}

impl SimilarInt {
    pub fn new() -> Self {
        SimilarInt::default()
    }

    /// Record `v`, returning true iff exactly one distinct value has been
    /// recorded so far.
    pub fn observe(&mut self, v: i64) -> bool {
        self.values.insert(v);
        self.agrees()
    }

    pub fn agrees(&self) -> bool {
        self.values.len() == 1
    }

    /// The agreed value, provided exactly one distinct value was recorded.
    pub fn value(&self) -> FarmResult<i64> {
        match self.values.get_min() {
            Some(v) if self.agrees() => Ok(*v),
            _ => Err(FarmError::UnexpectedResults("mismatch")),
        }
    }
}

/// Tracks the largest of the distinct values observed.
#[derive(Clone, Debug, Default)]
pub struct LargestInt {
    values: OrdSet<i64>,
}

impl LargestInt {
    pub fn new() -> Self {
        LargestInt::default()
    }

    pub fn add(&mut self, v: i64) {
        self.values.insert(v);
    }

    pub fn value(&self) -> FarmResult<i64> {
        self.values
            .get_max()
            .copied()
            .ok_or(FarmError::UnexpectedResults("no values"))
    }
}
