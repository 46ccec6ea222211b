// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Error taxonomy of the coordinator.
//!
//! A caller of the `Farm` sees exactly one of: a value, a `PartialError`, a
//! complete failure, or a rate-limit rejection. Which shard misbehaved is
//! never part of the returned error.

use itertools::Itertools;
use std::fmt;
use thiserror::Error;

pub type FarmResult<T> = std::result::Result<T, FarmError>;

/// What a single backing store may report for one key.
#[derive(Debug, Error)]
pub enum ShardError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend: {0}")]
    Backend(String),

    #[error("rejected by size limits: {0}")]
    TooLarge(String),

    #[error("shard closed")]
    Closed,
}

/// Subsystem a `PartialError` is attributed to.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Category {
    Store,
    Counter,
    Persistence,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Category::Store => "store",
            Category::Counter => "counter",
            Category::Persistence => "persistence",
        })
    }
}

/// Some, but not all, shards produced a usable and consistent answer.
#[derive(Debug, Error)]
pub enum PartialError {
    /// At least one shard failed outright. The messages are joined so the
    /// caller still gets a single error.
    #[error("partial error: {}", joined(.messages))]
    Failures { messages: Vec<String> },

    /// Every shard answered, but not with the same scalar.
    #[error("{category} partial error: expected {expected}, actual {actual:?}")]
    Disagreement {
        category: Category,
        expected: i64,
        actual: Vec<i64>,
    },
}

impl PartialError {
    pub fn failures<'a, I>(errors: I) -> Self
    where
        I: IntoIterator<Item = &'a ShardError>,
    {
        PartialError::Failures {
            messages: errors.into_iter().map(|e| e.to_string()).collect(),
        }
    }

    /// The best-effort representative value, where there is one.
    pub fn expected(&self) -> Option<i64> {
        match self {
            PartialError::Failures { .. } => None,
            PartialError::Disagreement { expected, .. } => Some(*expected),
        }
    }

    pub fn actual(&self) -> &[i64] {
        match self {
            PartialError::Failures { .. } => &[],
            PartialError::Disagreement { actual, .. } => actual,
        }
    }
}

fn joined(messages: &[String]) -> String {
    messages.iter().join("; ")
}

#[derive(Debug, Error)]
pub enum FarmError {
    /// Every targeted shard failed; there is nothing to reconcile from.
    #[error("complete failure: {0}")]
    CompleteFailure(String),

    #[error(transparent)]
    Partial(#[from] PartialError),

    /// The tactic refused the whole batch before dispatching anything.
    #[error("rate limited: {requested} permits unavailable")]
    RateLimited { requested: usize },

    /// An agreement tracker was asked for a value it cannot produce.
    #[error("unexpected results: {0}")]
    UnexpectedResults(&'static str),

    #[error("configuration error: {0}")]
    Config(String),
}

impl FarmError {
    pub fn complete_failure<'a, I>(errors: I) -> Self
    where
        I: IntoIterator<Item = &'a ShardError>,
    {
        let joined = errors.into_iter().map(|e| e.to_string()).join("; ");
        if joined.is_empty() {
            FarmError::CompleteFailure("no shard produced a result".to_string())
        } else {
            FarmError::CompleteFailure(joined)
        }
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, FarmError::Partial(_))
    }

    pub fn as_partial(&self) -> Option<&PartialError> {
        match self {
            FarmError::Partial(p) => Some(p),
            _ => None,
        }
    }
}
