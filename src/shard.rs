// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{ElementStream, Field, Key, KeyFieldScoreTxnValue, ShardError, SizeLimits};
use async_trait::async_trait;

/// A `Shard` is one independently operated backing store. The farm treats
/// every shard as a replica of the same logical data.
///
/// Every operation returns its stream without blocking; the work happens as
/// the stream is polled. Whatever the backing technology, a stream must yield
/// exactly one terminal `Element` per key it was handed (an error counts as
/// terminal), otherwise the farm cannot tell when a shard is done.
#[async_trait]
pub trait Shard: Send + Sync {
    /// Write `members`, keeping the higher score where a field already exists.
    /// Yields one `Count` (members changed) or `Error` per distinct key.
    fn insert(&self, members: Vec<KeyFieldScoreTxnValue>, limits: SizeLimits) -> ElementStream;

    /// Remove `members` whose score is at least the stored one. Yields one
    /// `Count` or `Error` per distinct key.
    fn delete(&self, members: Vec<KeyFieldScoreTxnValue>, limits: SizeLimits) -> ElementStream;

    /// Write back winning versions after a disagreement. Same element shape
    /// as `insert`, but never subject to size limits.
    fn repair(&self, members: Vec<KeyFieldScoreTxnValue>) -> ElementStream;

    /// Every member of `key`, as a single `TupleList`.
    fn members(&self, key: &Key) -> ElementStream;

    /// The member of `key` named `field`, as a `TupleList` of zero or one.
    fn select(&self, key: &Key, field: &Field) -> ElementStream;

    /// All keys held, as a single `KeyList`.
    fn keys(&self) -> ElementStream;

    /// Number of members of `key`, as a `Count`.
    fn size(&self, key: &Key) -> ElementStream;

    async fn close(&self) -> Result<(), ShardError>;
}
