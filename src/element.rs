// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Key, KeyFieldScoreTxnValue, ShardError};
use futures::stream::{self, BoxStream, StreamExt};

/// The lazy, non-blocking stream of results a shard operation produces. It
/// yields exactly one terminal `Element` per key the operation was given.
pub type ElementStream = BoxStream<'static, Element>;

/// `Element`s are what shards say back. Each one is bound to the key it
/// answers for and carries exactly one kind of payload.
///
/// The accessors below never fail: asking for a payload the element doesn't
/// carry yields an empty default, so callers that only care about one kind
/// can ignore the rest. The farm itself matches on the variants.
#[derive(Debug)]
pub enum Element {
    Error { key: Key, error: ShardError },
    Count { key: Key, amount: i64 },
    KeyList { key: Key, keys: Vec<Key> },
    Tuple { key: Key, tuple: KeyFieldScoreTxnValue },
    TupleList { key: Key, tuples: Vec<KeyFieldScoreTxnValue> },
}

impl Element {
    pub fn key(&self) -> &Key {
        match self {
            Element::Error { key, .. }
            | Element::Count { key, .. }
            | Element::KeyList { key, .. }
            | Element::Tuple { key, .. }
            | Element::TupleList { key, .. } => key,
        }
    }

    pub fn error(&self) -> Option<&ShardError> {
        match self {
            Element::Error { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn amount(&self) -> i64 {
        match self {
            Element::Count { amount, .. } => *amount,
            _ => 0,
        }
    }

    pub fn keys(&self) -> &[Key] {
        match self {
            Element::KeyList { keys, .. } => keys,
            _ => &[],
        }
    }

    pub fn tuple(&self) -> Option<&KeyFieldScoreTxnValue> {
        match self {
            Element::Tuple { tuple, .. } => Some(tuple),
            _ => None,
        }
    }

    /// All tuples carried, whether as a single `Tuple` or a `TupleList`.
    pub fn tuples(&self) -> &[KeyFieldScoreTxnValue] {
        match self {
            Element::Tuple { tuple, .. } => std::slice::from_ref(tuple),
            Element::TupleList { tuples, .. } => tuples,
            _ => &[],
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Element::Error { .. } => "error",
            Element::Count { .. } => "count",
            Element::KeyList { .. } => "key-list",
            Element::Tuple { .. } => "tuple",
            Element::TupleList { .. } => "tuple-list",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Element::Error { .. })
    }
}

/// Wrap already-computed elements into an `ElementStream`.
pub fn ready_stream(elements: Vec<Element>) -> ElementStream {
    stream::iter(elements).boxed()
}
