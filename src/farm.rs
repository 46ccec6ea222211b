// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The scatter/gather coordinator.
//!
//! Every farm operation runs the same way: snapshot the shard list, hand a
//! per-shard action to the operation's `Tactic`, and drain a shared result
//! queue until it closes. Each per-shard action owns a clone of the queue's
//! sender and drops it when its shard's stream ends, so the queue closes
//! exactly when the last shard has said its last word, whatever order they
//! finish in.
//!
//! Writes aggregate scalar counts through the agreement trackers; reads
//! aggregate tuple sets through the reconciler. Both classify the outcome the
//! same way:
//!
//!   1. no shard produced anything usable: `CompleteFailure`, no repair.
//!   2. some shard failed: `PartialError::Failures`, repair.
//!   3. shards disagreed: `PartialError::Disagreement` (writes), or silent
//!      read-repair of the difference (reads).
//!   4. otherwise: the agreed value.
//!
//! Shard errors are always considered ahead of agreement.

use crate::{
    maybe_repair, reconcile, Category, Dispatch, Element, ElementStream, FarmConfig, FarmError,
    FarmResult, Field, Instrumentation, Instruments, Key, KeyFieldScoreTxnValue, LargestInt,
    NopInstrumentation, Op, PartialError, PerOp, ReconciledPair, Shard, ShardAction, ShardError,
    SimilarInt, SizeLimits, Tactic, Tactics, TupleSet,
};
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::StreamExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

type ShardList = Arc<Vec<Arc<dyn Shard>>>;

fn unexpected(e: &Element, wanted: &str) -> ShardError {
    ShardError::Backend(format!(
        "expected {} element for key {}, got {}",
        wanted,
        e.key(),
        e.kind()
    ))
}

/// Per-call tally of a write-shaped operation.
#[derive(Default)]
struct CountTally {
    errors: Vec<ShardError>,
    amounts: Vec<i64>,
    similar: BTreeMap<Key, SimilarInt>,
    largest: BTreeMap<Key, LargestInt>,
}

impl CountTally {
    fn observe(&mut self, e: Element) {
        match e {
            Element::Error { error, .. } => self.errors.push(error),
            Element::Count { key, amount } => {
                self.amounts.push(amount);
                if !self.similar.entry(key.clone()).or_default().observe(amount) {
                    trace!("shards diverge on key {}", key);
                }
                self.largest.entry(key).or_default().add(amount);
            }
            other => self.errors.push(unexpected(&other, "count")),
        }
    }

    fn check_failures(&self) -> FarmResult<()> {
        if self.amounts.is_empty() {
            return Err(FarmError::complete_failure(&self.errors));
        }
        if !self.errors.is_empty() {
            return Err(PartialError::failures(&self.errors).into());
        }
        Ok(())
    }

    // Agreement is judged per key, and the per-key results summed. For the
    // usual single-key write that's just the one agreed count.
    fn classify(self) -> FarmResult<i64> {
        self.check_failures()?;
        let mut agreed = 0;
        let mut expected = 0;
        let mut disagreement = false;
        for (key, similar) in &self.similar {
            let largest = self
                .largest
                .get(key)
                .ok_or(FarmError::UnexpectedResults("untracked key"))?;
            expected += largest.value()?;
            match similar.value() {
                Ok(v) => agreed += v,
                Err(_) => disagreement = true,
            }
        }
        if disagreement {
            return Err(PartialError::Disagreement {
                category: Category::Store,
                expected,
                actual: self.amounts,
            }
            .into());
        }
        Ok(agreed)
    }

    // Repairs change nothing on shards that were already current, so their
    // counts differ whenever something was healed. Every shard answering is
    // enough; the per-key largest change is reported.
    fn settle(self) -> FarmResult<i64> {
        self.check_failures()?;
        self.largest.values().map(LargestInt::value).sum()
    }
}

/// Per-call tally of a read-shaped operation.
#[derive(Default)]
struct TupleTally {
    errors: Vec<ShardError>,
    sets: Vec<TupleSet>,
    retrieved: usize,
}

impl TupleTally {
    fn observe(&mut self, e: Element) {
        match e {
            Element::Error { error, .. } => self.errors.push(error),
            Element::Tuple { tuple, .. } => {
                self.retrieved += 1;
                self.sets.push(std::iter::once(tuple).collect());
            }
            Element::TupleList { tuples, .. } => {
                self.retrieved += tuples.len();
                self.sets.push(tuples.into_iter().collect());
            }
            other => self.errors.push(unexpected(&other, "tuple")),
        }
    }
}

/// What to do once a call has come back partial.
enum RepairPlan {
    /// Write these tuples back through `Shard::repair`.
    Write(Vec<KeyFieldScoreTxnValue>),
    /// Re-issue these deletes.
    Delete(Vec<KeyFieldScoreTxnValue>),
    /// Re-read the key, letting the read path repair what it finds.
    Read(Key),
}

struct FarmInner {
    shards: RwLock<ShardList>,
    tactics: Tactics,
    instruments: Instruments,
    limits: SizeLimits,
}

/// A `Farm` fans logical operations out across a set of replica shards and
/// folds their answers back into one. Clones share the same shards.
#[derive(Clone)]
pub struct Farm {
    inner: Arc<FarmInner>,
}

impl Farm {
    pub fn new(shards: Vec<Arc<dyn Shard>>, tactics: Tactics) -> Self {
        let nop: Arc<dyn Instrumentation> = Arc::new(NopInstrumentation);
        Farm::with_parts(shards, tactics, PerOp::all(nop), SizeLimits::default())
    }

    pub fn with_parts(
        shards: Vec<Arc<dyn Shard>>,
        tactics: Tactics,
        instruments: Instruments,
        limits: SizeLimits,
    ) -> Self {
        Farm {
            inner: Arc::new(FarmInner {
                shards: RwLock::new(Arc::new(shards)),
                tactics,
                instruments,
                limits,
            }),
        }
    }

    pub fn from_config(
        shards: Vec<Arc<dyn Shard>>,
        cfg: &FarmConfig,
        instruments: Instruments,
    ) -> FarmResult<Self> {
        Ok(Farm::with_parts(shards, cfg.tactics()?, instruments, cfg.limits))
    }

    fn snapshot(&self) -> ShardList {
        self.inner
            .shards
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn shard_count(&self) -> usize {
        self.snapshot().len()
    }

    /// Replace the shard set, returning the old one so the caller can close
    /// it. Calls already in flight keep the snapshot they started with; the
    /// caller is expected to have paused writes around the swap.
    pub fn topology(&self, shards: Vec<Arc<dyn Shard>>) -> Vec<Arc<dyn Shard>> {
        let mut guard = self
            .inner
            .shards
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        debug!("topology swap: {} -> {} shards", guard.len(), shards.len());
        let old = std::mem::replace(&mut *guard, Arc::new(shards));
        drop(guard);
        Arc::try_unwrap(old).unwrap_or_else(|shared| shared.as_ref().clone())
    }

    /// Close every shard, concurrently.
    pub async fn close(&self) -> FarmResult<()> {
        let shards = self.snapshot();
        let results = future::join_all(shards.iter().map(|s| s.close())).await;
        let errors: Vec<ShardError> = results.into_iter().filter_map(Result::err).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(FarmError::complete_failure(&errors))
        }
    }

    /// Run `op` against every shard the tactic picks, returning the queue
    /// their elements arrive on. `None` means the tactic skipped the call.
    fn scatter<F>(
        &self,
        tactic: &dyn Tactic,
        instr: &dyn Instrumentation,
        op: F,
    ) -> FarmResult<Option<mpsc::Receiver<Element>>>
    where
        F: Fn(&dyn Shard) -> ElementStream + Send + Sync + 'static,
    {
        let shards = self.snapshot();
        let (tx, rx) = mpsc::channel(shards.len().max(1));
        let op = Arc::new(op);
        let action: ShardAction = Arc::new(move |shard: Arc<dyn Shard>| {
            let tx = tx.clone();
            let op = op.clone();
            async move {
                let mut elements = op(&*shard);
                while let Some(e) = elements.next().await {
                    if tx.send(e).await.is_err() {
                        break;
                    }
                }
            }
            .boxed()
        });
        match tactic.dispatch(shards.as_slice(), action)? {
            Dispatch::Skipped => Ok(None),
            Dispatch::Launched(n) => {
                instr.send_to(n);
                Ok(Some(rx))
            }
        }
    }

    async fn write<F>(
        &self,
        kind: Op,
        op: F,
        judge: fn(CountTally) -> FarmResult<i64>,
        plan: Option<RepairPlan>,
    ) -> FarmResult<i64>
    where
        F: Fn(&dyn Shard) -> ElementStream + Send + Sync + 'static,
    {
        let instr = self.inner.instruments.get(kind).clone();
        let start = Instant::now();
        instr.call();
        let tactic = self.inner.tactics.get(kind).clone();
        let mut rx = match self.scatter(tactic.as_ref(), instr.as_ref(), op)? {
            Some(rx) => rx,
            None => {
                trace!("{} skipped by tactic", kind);
                return Ok(0);
            }
        };
        let mut tally = CountTally::default();
        while let Some(e) = rx.recv().await {
            tally.observe(e);
        }
        instr.duration(start.elapsed());
        match judge(tally) {
            Ok(n) => Ok(n),
            Err(err) => Err(self.partial(kind, err, plan)),
        }
    }

    // Report a failed call, starting a repair when there's a plan for one.
    fn partial(&self, kind: Op, err: FarmError, plan: Option<RepairPlan>) -> FarmError {
        debug!("{} failed: {}", kind, err);
        let instr = self.inner.instruments.get(kind);
        if err.is_partial() {
            instr.partial_failure();
        }
        match plan {
            Some(plan) => maybe_repair(err, || {
                instr.repair_required();
                self.clone().run_repair(plan)
            }),
            None => err,
        }
    }

    // Boxed so that read paths can spawn it without the future types of
    // `members` and `run_repair` referring to each other.
    fn run_repair(self, plan: RepairPlan) -> BoxFuture<'static, ()> {
        async move {
            let result = match plan {
                RepairPlan::Write(members) => self.repair(members).await,
                RepairPlan::Delete(members) => {
                    let limits = self.inner.limits;
                    self.write(
                        Op::Repair,
                        move |s: &dyn Shard| s.delete(members.clone(), limits),
                        CountTally::settle,
                        None,
                    )
                    .await
                }
                RepairPlan::Read(key) => {
                    self.members(&key).await.map(|ms| ms.len() as i64)
                }
            };
            match result {
                Ok(n) => debug!("repair settled, {} changed", n),
                Err(e) => warn!("repair failed: {}", e),
            }
        }
        .boxed()
    }

    /// Write `members` to every shard. Returns the number of members each
    /// shard changed, provided they all agree.
    pub async fn insert(&self, members: Vec<KeyFieldScoreTxnValue>) -> FarmResult<i64> {
        if members.is_empty() {
            return Ok(0);
        }
        let limits = self.inner.limits;
        let sent = members.clone();
        self.write(
            Op::Insert,
            move |s: &dyn Shard| s.insert(sent.clone(), limits),
            CountTally::classify,
            Some(RepairPlan::Write(members)),
        )
        .await
    }

    pub async fn delete(&self, members: Vec<KeyFieldScoreTxnValue>) -> FarmResult<i64> {
        if members.is_empty() {
            return Ok(0);
        }
        let limits = self.inner.limits;
        let sent = members.clone();
        self.write(
            Op::Delete,
            move |s: &dyn Shard| s.delete(sent.clone(), limits),
            CountTally::classify,
            Some(RepairPlan::Delete(members)),
        )
        .await
    }

    /// Undo an insert. Identical to `delete`.
    pub async fn rollback(&self, members: Vec<KeyFieldScoreTxnValue>) -> FarmResult<i64> {
        self.delete(members).await
    }

    /// Write back winning versions of `members`. Returns the most members
    /// any shard changed per key; shards that were already current changing
    /// fewer is the point, not a disagreement. A failed repair is reported
    /// but never repaired in turn.
    pub async fn repair(&self, members: Vec<KeyFieldScoreTxnValue>) -> FarmResult<i64> {
        if members.is_empty() {
            return Ok(0);
        }
        self.write(
            Op::Repair,
            move |s: &dyn Shard| s.repair(members.clone()),
            CountTally::settle,
            None,
        )
        .await
    }

    /// The number of members of `key`. A disagreement sends the key through
    /// read-repair.
    pub async fn size(&self, key: &Key) -> FarmResult<i64> {
        let k = key.clone();
        self.write(
            Op::Size,
            move |s: &dyn Shard| s.size(&k),
            CountTally::classify,
            Some(RepairPlan::Read(key.clone())),
        )
        .await
    }

    async fn read<F>(&self, kind: Op, op: F) -> FarmResult<Option<ReconciledPair>>
    where
        F: Fn(&dyn Shard) -> ElementStream + Send + Sync + 'static,
    {
        let instr = self.inner.instruments.get(kind).clone();
        let start = Instant::now();
        instr.call();
        let tactic = self.inner.tactics.get(kind).clone();
        let mut rx = match self.scatter(tactic.as_ref(), instr.as_ref(), op)? {
            Some(rx) => rx,
            None => {
                trace!("{} skipped by tactic", kind);
                return Ok(None);
            }
        };
        let mut tally = TupleTally::default();
        while let Some(e) = rx.recv().await {
            tally.observe(e);
        }
        instr.retrieved(tally.retrieved);
        instr.duration(start.elapsed());

        if tally.sets.is_empty() {
            return Err(self.partial(kind, FarmError::complete_failure(&tally.errors), None));
        }
        let pair = reconcile(&tally.sets);
        if !tally.errors.is_empty() {
            // We can't know what the failed shards hold, so offer them
            // everything the others agreed on.
            let plan = RepairPlan::Write(pair.union.into_iter().collect());
            let err = PartialError::failures(&tally.errors).into();
            return Err(self.partial(kind, err, Some(plan)));
        }
        if pair.needs_repair() {
            let candidates = pair.repair_candidates();
            debug!(
                "{} found {} tuples to repair across {} shards",
                kind,
                candidates.len(),
                tally.sets.len()
            );
            instr.repair_required();
            tokio::spawn(self.clone().run_repair(RepairPlan::Write(candidates)));
        }
        Ok(Some(pair))
    }

    /// Every member of `key`, reconciled across shards.
    pub async fn members(&self, key: &Key) -> FarmResult<Vec<KeyFieldScoreTxnValue>> {
        let k = key.clone();
        let union: Vec<KeyFieldScoreTxnValue> = self
            .read(Op::Members, move |s: &dyn Shard| s.members(&k))
            .await?
            .map(|pair| pair.union.into_iter().collect())
            .unwrap_or_default();
        self.inner.instruments.members.returned(union.len());
        Ok(union)
    }

    /// The freshest version of `field` in `key`, if any shard has one.
    pub async fn select(
        &self,
        key: &Key,
        field: &Field,
    ) -> FarmResult<Option<KeyFieldScoreTxnValue>> {
        let (k, f) = (key.clone(), field.clone());
        let winner = self
            .read(Op::Select, move |s: &dyn Shard| s.select(&k, &f))
            .await?
            .and_then(|pair| pair.union.into_iter().max_by(|a, b| a.score.cmp(&b.score)));
        self.inner.instruments.select.returned(winner.iter().count());
        Ok(winner)
    }

    /// Every key any shard holds.
    pub async fn keys(&self) -> FarmResult<Vec<Key>> {
        let instr = self.inner.instruments.keys.clone();
        let start = Instant::now();
        instr.call();
        let tactic = self.inner.tactics.keys.clone();
        let keys_of = |s: &dyn Shard| s.keys();
        let mut rx = match self.scatter(tactic.as_ref(), instr.as_ref(), keys_of)? {
            Some(rx) => rx,
            None => return Ok(Vec::new()),
        };
        let mut errors = Vec::new();
        let mut answered = 0;
        let mut keys = BTreeSet::new();
        while let Some(e) = rx.recv().await {
            match e {
                Element::Error { error, .. } => errors.push(error),
                Element::KeyList { keys: ks, .. } => {
                    answered += 1;
                    instr.retrieved(ks.len());
                    keys.extend(ks);
                }
                other => errors.push(unexpected(&other, "key-list")),
            }
        }
        instr.duration(start.elapsed());
        // Keys carry no versions, so there is nothing a repair could write.
        if answered == 0 {
            return Err(self.partial(Op::Keys, FarmError::complete_failure(&errors), None));
        }
        if !errors.is_empty() {
            return Err(self.partial(Op::Keys, PartialError::failures(&errors).into(), None));
        }
        instr.returned(keys.len());
        Ok(keys.into_iter().collect())
    }
}
