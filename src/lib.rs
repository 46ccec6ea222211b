// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * This crate coordinates a set of independently operated replica stores
 * ("shards") so that callers see a single logical record store. It has no
 * opinion on what the shards are made of; it only needs each one to answer
 * the `Shard` trait.
 *
 * The records are _tuples_: a key, a field within it, a floating point score
 * marking freshness, a transaction id and an opaque value. Two versions of
 * the same tuple that differ only in score are reconciled by keeping the
 * higher score, which makes the set of tuples a shard holds a (join
 * semi-)lattice, and read-repair just its join.
 *
 * Every operation is a scatter/gather:
 *
 *   - A per-operation `Tactic` decides whether and how to dispatch the call
 *     to the shards: not at all, unconditionally, or only if a shared token
 *     bucket has a permit for every shard.
 *
 *   - Each shard answers with a stream of `Element`s. The farm drains them
 *     all, in whatever order they finish.
 *
 *   - Scalar answers (write counts, sizes) must agree; set answers (reads)
 *     are merged. Failures and disagreements come back as a `PartialError`
 *     and start an asynchronous repair, which the caller never waits on.
 *
 * Nothing here is a consensus protocol. There are no quorums, no leader and
 * no retries: a write that reached some shards and not others is simply
 * reported, and the system converges through repair.
 *
 * ## Name
 *
 * A consort is a group of musicians playing together, each from their own
 * part, ideally in agreement.
 */

mod agreement;
mod cfg;
mod element;
mod error;
mod farm;
mod instrumentation;
pub mod memory;
mod reconcile;
mod repair;
mod shard;
mod tactic;
mod tuple;

pub use agreement::{LargestInt, SimilarInt};
pub use cfg::{FarmConfig, Instruments, Op, PerOp, Strategy, StrategyConfig, TacticKind, Tactics};
pub use element::{ready_stream, Element, ElementStream};
pub use error::{Category, FarmError, FarmResult, PartialError, ShardError};
pub use farm::Farm;
pub use instrumentation::{
    CountingInstrumentation, Instrumentation, NopInstrumentation, TracingInstrumentation,
};
pub use memory::MemoryShard;
pub use reconcile::{reconcile, ReconciledPair, TupleSet};
pub use repair::maybe_repair;
pub use shard::Shard;
pub use tactic::{
    Dispatch, NoopTactic, PermitPool, RateLimitedTactic, ShardAction, Tactic, UnconditionalTactic,
};
pub use tuple::{
    Field, Key, KeyFieldScoreTxnValue, KeyFieldTxnValue, Score, SizeLimits, TransactionId,
};

#[cfg(test)]
mod tests;
