// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::*;
use async_trait::async_trait;
use futures::stream::StreamExt;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;
use tracing_subscriber::EnvFilter;

type Tuple = KeyFieldScoreTxnValue;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn t(key: &str, field: &str, score: f64, value: &str) -> Tuple {
    Tuple::new(key, field, score, "txn", value)
}

/// A fixed answer a `ScriptedShard` gives to every scalar request.
#[derive(Clone, Copy, Debug)]
enum Reply {
    Count(i64),
    Fail,
}

#[derive(Debug, Default)]
struct Calls {
    writes: AtomicUsize,
    repairs: AtomicUsize,
}

impl Calls {
    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
    fn repairs(&self) -> usize {
        self.repairs.load(Ordering::SeqCst)
    }
}

/// A shard that answers the same thing whatever it's asked.
struct ScriptedShard {
    reply: Reply,
    calls: Arc<Calls>,
}

impl ScriptedShard {
    fn new(reply: Reply) -> (Arc<dyn Shard>, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let shard = ScriptedShard {
            reply,
            calls: calls.clone(),
        };
        (Arc::new(shard) as Arc<dyn Shard>, calls)
    }

    fn answer(&self, key: Key) -> Element {
        match self.reply {
            Reply::Count(amount) => Element::Count { key, amount },
            Reply::Fail => Element::Error {
                key,
                error: std::io::Error::new(std::io::ErrorKind::Other, "disk on fire").into(),
            },
        }
    }

    fn per_key(&self, members: &[Tuple]) -> ElementStream {
        let keys: BTreeSet<Key> = members.iter().map(|t| t.key.clone()).collect();
        ready_stream(keys.into_iter().map(|k| self.answer(k)).collect())
    }

    fn tuples(&self, key: &Key) -> ElementStream {
        let key = key.clone();
        let e = match self.answer(key.clone()) {
            Element::Count { .. } => Element::TupleList {
                key,
                tuples: vec![],
            },
            other => other,
        };
        ready_stream(vec![e])
    }
}

#[async_trait]
impl Shard for ScriptedShard {
    fn insert(&self, members: Vec<Tuple>, _: SizeLimits) -> ElementStream {
        self.calls.writes.fetch_add(1, Ordering::SeqCst);
        self.per_key(&members)
    }
    fn delete(&self, members: Vec<Tuple>, _: SizeLimits) -> ElementStream {
        self.calls.writes.fetch_add(1, Ordering::SeqCst);
        self.per_key(&members)
    }
    fn repair(&self, members: Vec<Tuple>) -> ElementStream {
        self.calls.repairs.fetch_add(1, Ordering::SeqCst);
        self.per_key(&members)
    }
    fn members(&self, key: &Key) -> ElementStream {
        self.tuples(key)
    }
    fn select(&self, key: &Key, _: &Field) -> ElementStream {
        self.tuples(key)
    }
    fn keys(&self) -> ElementStream {
        let e = match self.answer(Key::default()) {
            Element::Count { key, .. } => Element::KeyList { key, keys: vec![] },
            other => other,
        };
        ready_stream(vec![e])
    }
    fn size(&self, key: &Key) -> ElementStream {
        ready_stream(vec![self.answer(key.clone())])
    }
    async fn close(&self) -> Result<(), ShardError> {
        Ok(())
    }
}

fn unconditional() -> Tactics {
    PerOp::all(Arc::new(UnconditionalTactic) as Arc<dyn Tactic>)
}

fn scripted(replies: &[Reply]) -> (Vec<Arc<dyn Shard>>, Vec<Arc<Calls>>) {
    replies.iter().map(|r| ScriptedShard::new(*r)).unzip()
}

fn memory_farm(n: usize) -> (Farm, Vec<MemoryShard>) {
    let shards: Vec<MemoryShard> = (0..n).map(|_| MemoryShard::new()).collect();
    let dyns = shards
        .iter()
        .map(|s| Arc::new(s.clone()) as Arc<dyn Shard>)
        .collect();
    (Farm::new(dyns, unconditional()), shards)
}

/// A memory farm whose `op` hooks are counted.
fn counted_memory_farm(n: usize, op: Op) -> (Farm, Vec<MemoryShard>, Arc<CountingInstrumentation>) {
    let shards: Vec<MemoryShard> = (0..n).map(|_| MemoryShard::new()).collect();
    let dyns = shards
        .iter()
        .map(|s| Arc::new(s.clone()) as Arc<dyn Shard>)
        .collect();
    let counting = Arc::new(CountingInstrumentation::default());
    let mut instruments = PerOp::all(Arc::new(NopInstrumentation) as Arc<dyn Instrumentation>);
    *instruments.get_mut(op) = counting.clone();
    let farm = Farm::with_parts(dyns, unconditional(), instruments, SizeLimits::default());
    (farm, shards, counting)
}

async fn seed(shard: &MemoryShard, members: Vec<Tuple>) {
    let out: Vec<Element> = shard.insert(members, SizeLimits::default()).collect().await;
    assert!(out.iter().all(|e| !e.is_error()));
}

async fn members_of(shard: &MemoryShard, key: &Key) -> Vec<Tuple> {
    let out: Vec<Element> = shard.members(key).collect().await;
    out.iter().flat_map(|e| e.tuples().to_vec()).collect()
}

/// Poll `check` until it holds, giving background repairs time to land.
async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    false
}

fn disagreement(e: &FarmError) -> Option<(i64, Vec<i64>)> {
    match e.as_partial() {
        Some(PartialError::Disagreement {
            expected, actual, ..
        }) => {
            let mut actual = actual.clone();
            actual.sort_unstable();
            Some((*expected, actual))
        }
        _ => None,
    }
}

#[tokio::test]
async fn agreeing_shards_return_the_count() {
    init_tracing();
    let (farm, shards) = memory_farm(3);
    let n = farm
        .insert(vec![t("k", "a", 1.0, "x"), t("k", "b", 1.0, "y")])
        .await;
    assert_eq!(n.ok(), Some(2));
    for s in &shards {
        assert_eq!(members_of(s, &"k".into()).await.len(), 2);
    }
}

#[tokio::test]
async fn counts_are_summed_across_keys() {
    init_tracing();
    let counting = Arc::new(CountingInstrumentation::default());
    let mut instruments = PerOp::all(Arc::new(NopInstrumentation) as Arc<dyn Instrumentation>);
    instruments.insert = counting.clone();
    let shards: Vec<Arc<dyn Shard>> = (0..3)
        .map(|_| Arc::new(MemoryShard::new()) as Arc<dyn Shard>)
        .collect();
    let farm = Farm::with_parts(shards, unconditional(), instruments, SizeLimits::default());

    let n = farm
        .insert(vec![
            t("a", "f", 1.0, "x"),
            t("a", "g", 1.0, "x"),
            t("b", "f", 1.0, "x"),
        ])
        .await;
    assert_eq!(n.ok(), Some(3));
    assert_eq!(CountingInstrumentation::get(&counting.calls), 1);
    assert_eq!(CountingInstrumentation::get(&counting.sent_to), 3);
    assert_eq!(CountingInstrumentation::get(&counting.durations), 1);
    assert_eq!(CountingInstrumentation::get(&counting.partial_failures), 0);
}

#[tokio::test]
async fn disagreement_reports_largest_and_repairs() {
    init_tracing();
    let (shards, calls) = scripted(&[Reply::Count(2), Reply::Count(2), Reply::Count(1)]);
    let counting = Arc::new(CountingInstrumentation::default());
    let mut instruments = PerOp::all(Arc::new(NopInstrumentation) as Arc<dyn Instrumentation>);
    instruments.insert = counting.clone();
    let farm = Farm::with_parts(shards, unconditional(), instruments, SizeLimits::default());

    let err = farm
        .insert(vec![t("k", "a", 1.0, "x")])
        .await
        .expect_err("shards disagreed");
    debug!("insert came back with {}", err);
    assert_eq!(disagreement(&err), Some((2, vec![1, 2, 2])));
    assert_eq!(err.as_partial().and_then(PartialError::expected), Some(2));
    assert!(eventually(|| calls.iter().all(|c| c.repairs() == 1)).await);
    assert_eq!(CountingInstrumentation::get(&counting.partial_failures), 1);
    assert_eq!(CountingInstrumentation::get(&counting.repairs_required), 1);
}

#[tokio::test]
async fn one_failing_shard_is_a_partial_failure() {
    init_tracing();
    let (shards, calls) = scripted(&[Reply::Count(1), Reply::Fail]);
    let farm = Farm::new(shards, unconditional());
    let err = farm
        .insert(vec![t("k", "a", 1.0, "x")])
        .await
        .expect_err("one shard failed");
    assert!(matches!(
        err.as_partial(),
        Some(PartialError::Failures { messages }) if messages.len() == 1
    ));
    assert!(err.to_string().contains("disk on fire"));
    assert!(eventually(|| calls.iter().all(|c| c.repairs() == 1)).await);
}

#[tokio::test]
async fn every_shard_failing_is_complete_and_unrepaired() {
    init_tracing();
    let (shards, calls) = scripted(&[Reply::Fail, Reply::Fail, Reply::Fail]);
    let farm = Farm::new(shards, unconditional());
    let err = farm
        .insert(vec![t("k", "a", 1.0, "x")])
        .await
        .expect_err("every shard failed");
    assert!(matches!(err, FarmError::CompleteFailure(_)));
    sleep(Duration::from_millis(20)).await;
    assert!(calls.iter().all(|c| c.repairs() == 0));
}

#[tokio::test]
async fn empty_batches_change_nothing() {
    let (shards, calls) = scripted(&[Reply::Count(1), Reply::Fail]);
    let farm = Farm::new(shards, unconditional());
    assert_eq!(farm.insert(vec![]).await.ok(), Some(0));
    assert_eq!(farm.delete(vec![]).await.ok(), Some(0));
    assert_eq!(farm.rollback(vec![]).await.ok(), Some(0));
    assert_eq!(farm.repair(vec![]).await.ok(), Some(0));
    assert!(calls.iter().all(|c| c.writes() == 0 && c.repairs() == 0));

    let farm = Farm::new(vec![], unconditional());
    assert_eq!(farm.insert(vec![]).await.ok(), Some(0));
    let r = farm.insert(vec![t("k", "a", 1.0, "x")]).await;
    assert!(matches!(r, Err(FarmError::CompleteFailure(_))));
}

#[tokio::test]
async fn no_shards_is_a_complete_failure() {
    let farm = Farm::new(vec![], unconditional());
    let r = farm.insert(vec![t("k", "a", 1.0, "x")]).await;
    assert!(matches!(r, Err(FarmError::CompleteFailure(_))));
    let r = farm.members(&"k".into()).await;
    assert!(matches!(r, Err(FarmError::CompleteFailure(_))));
}

#[tokio::test]
async fn rate_limit_rejects_before_any_shard_is_touched() {
    init_tracing();
    let (shards, calls) = scripted(&[Reply::Count(1), Reply::Count(1), Reply::Count(1)]);
    let pool = Arc::new(PermitPool::new(2, Duration::from_secs(3600)).expect("pool"));
    let mut tactics = unconditional();
    tactics.insert = Arc::new(RateLimitedTactic::new(pool));
    let farm = Farm::new(shards, tactics);

    let r = farm.insert(vec![t("k", "a", 1.0, "x")]).await;
    assert!(matches!(r, Err(FarmError::RateLimited { requested: 3 })));
    sleep(Duration::from_millis(20)).await;
    assert!(calls.iter().all(|c| c.writes() == 0 && c.repairs() == 0));

    // Other operations have their own tactic.
    assert_eq!(farm.delete(vec![t("k", "a", 1.0, "x")]).await.ok(), Some(1));
}

#[tokio::test]
async fn noop_tactics_skip_everything() {
    let (shards, calls) = scripted(&[Reply::Fail, Reply::Fail]);
    let farm = Farm::new(shards, PerOp::all(Arc::new(NoopTactic) as Arc<dyn Tactic>));
    assert_eq!(farm.insert(vec![t("k", "a", 1.0, "x")]).await.ok(), Some(0));
    assert_eq!(farm.size(&"k".into()).await.ok(), Some(0));
    assert_eq!(farm.members(&"k".into()).await.ok(), Some(vec![]));
    assert!(matches!(farm.select(&"k".into(), &"a".into()).await, Ok(None)));
    assert_eq!(farm.keys().await.ok(), Some(vec![]));
    assert!(calls.iter().all(|c| c.writes() == 0));
}

#[tokio::test]
async fn members_read_repairs_a_lagging_shard() {
    init_tracing();
    let (farm, shards, repairs) = counted_memory_farm(3, Op::Repair);
    let key = Key::from("k");
    let tuple = t("k", "a", 1.0, "x");
    seed(&shards[0], vec![tuple.clone()]).await;
    seed(&shards[1], vec![tuple.clone()]).await;

    let ms = farm.members(&key).await.expect("members");
    assert_eq!(ms, vec![tuple.clone()]);

    let mut healed = false;
    for _ in 0..200 {
        if members_of(&shards[2], &key).await == vec![tuple.clone()] {
            healed = true;
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    assert!(healed);

    // Only the lagging shard changed anything, and that is a success.
    assert!(eventually(|| CountingInstrumentation::get(&repairs.durations) == 1).await);
    assert_eq!(CountingInstrumentation::get(&repairs.calls), 1);
    assert_eq!(CountingInstrumentation::get(&repairs.partial_failures), 0);
    assert_eq!(CountingInstrumentation::get(&repairs.repairs_required), 0);
}

#[tokio::test]
async fn repair_settles_when_current_shards_change_nothing() {
    init_tracing();
    let (farm, shards, repairs) = counted_memory_farm(3, Op::Repair);
    let tuple = t("k", "a", 1.0, "x");
    seed(&shards[0], vec![tuple.clone()]).await;
    seed(&shards[1], vec![tuple.clone()]).await;

    assert_eq!(farm.repair(vec![tuple.clone()]).await.ok(), Some(1));
    assert_eq!(farm.repair(vec![tuple.clone()]).await.ok(), Some(0));
    assert_eq!(members_of(&shards[2], &"k".into()).await, vec![tuple]);
    assert_eq!(CountingInstrumentation::get(&repairs.partial_failures), 0);
}

#[tokio::test]
async fn delete_repair_settles_on_the_lagging_shard() {
    init_tracing();
    let (farm, shards, repairs) = counted_memory_farm(2, Op::Repair);
    let tuple = t("k", "a", 1.0, "x");
    seed(&shards[0], vec![tuple.clone()]).await;

    // Only one shard holds the tuple, so the delete disagrees and re-issues.
    let err = farm.delete(vec![tuple]).await.expect_err("one shard had nothing");
    assert_eq!(disagreement(&err), Some((1, vec![0, 1])));
    assert!(eventually(|| CountingInstrumentation::get(&repairs.durations) == 1).await);
    assert_eq!(CountingInstrumentation::get(&repairs.partial_failures), 0);
    assert!(members_of(&shards[0], &"k".into()).await.is_empty());
}

#[tokio::test]
async fn read_repair_pushes_the_higher_score() {
    init_tracing();
    let (farm, shards) = memory_farm(2);
    let key = Key::from("k");
    seed(&shards[0], vec![t("k", "a", 1.0, "x")]).await;
    seed(&shards[1], vec![t("k", "a", 5.0, "x")]).await;

    let winner = farm.select(&key, &"a".into()).await.expect("select");
    assert_eq!(winner.map(|w| w.score), Some(Score(5.0)));

    let mut healed = false;
    for _ in 0..200 {
        if members_of(&shards[0], &key).await == vec![t("k", "a", 5.0, "x")] {
            healed = true;
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    assert!(healed);
}

#[tokio::test]
async fn select_of_missing_field_is_none() {
    let (farm, _) = memory_farm(2);
    let r = farm.select(&"k".into(), &"nope".into()).await;
    assert!(matches!(r, Ok(None)));
}

#[tokio::test]
async fn keys_are_unioned() {
    let (farm, shards) = memory_farm(2);
    seed(&shards[0], vec![t("a", "f", 1.0, "x")]).await;
    seed(&shards[1], vec![t("b", "f", 1.0, "x"), t("a", "g", 1.0, "x")]).await;
    let keys = farm.keys().await.expect("keys");
    assert_eq!(keys, vec![Key::from("a"), Key::from("b")]);
}

#[tokio::test]
async fn size_disagreement_heals_through_read_repair() {
    init_tracing();
    let (farm, shards) = memory_farm(2);
    let key = Key::from("k");
    seed(&shards[0], vec![t("k", "a", 1.0, "x"), t("k", "b", 1.0, "y")]).await;
    seed(&shards[1], vec![t("k", "a", 1.0, "x")]).await;

    let err = farm.size(&key).await.expect_err("sizes differ");
    assert_eq!(disagreement(&err), Some((2, vec![1, 2])));

    let mut agreed = None;
    for _ in 0..200 {
        if let Ok(n) = farm.size(&key).await {
            agreed = Some(n);
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(agreed, Some(2));
}

#[tokio::test]
async fn partial_read_still_fails_the_call() {
    init_tracing();
    let (mut shards, calls) = scripted(&[Reply::Fail]);
    let good = MemoryShard::new();
    seed(&good, vec![t("k", "a", 1.0, "x")]).await;
    shards.push(Arc::new(good));
    let farm = Farm::new(shards, unconditional());

    let err = farm.members(&"k".into()).await.expect_err("one shard failed");
    assert!(matches!(err.as_partial(), Some(PartialError::Failures { .. })));
    assert!(eventually(|| calls[0].repairs() == 1).await);
}

#[tokio::test]
async fn rollback_undoes_an_insert() {
    let (farm, _) = memory_farm(3);
    let key = Key::from("k");
    let tuple = t("k", "a", 1.0, "x");
    assert_eq!(farm.insert(vec![tuple.clone()]).await.ok(), Some(1));
    assert_eq!(farm.rollback(vec![tuple]).await.ok(), Some(1));
    assert_eq!(farm.members(&key).await.ok(), Some(vec![]));
    assert_eq!(farm.size(&key).await.ok(), Some(0));
}

#[tokio::test]
async fn size_limits_reach_the_shards() {
    let shards: Vec<Arc<dyn Shard>> = (0..2)
        .map(|_| Arc::new(MemoryShard::new()) as Arc<dyn Shard>)
        .collect();
    let limits = SizeLimits {
        max_value_bytes: 4,
        ..SizeLimits::default()
    };
    let nop = Arc::new(NopInstrumentation) as Arc<dyn Instrumentation>;
    let farm = Farm::with_parts(shards, unconditional(), PerOp::all(nop), limits);
    let r = farm.insert(vec![t("k", "a", 1.0, "far too long")]).await;
    assert!(matches!(r, Err(FarmError::CompleteFailure(ref m)) if m.contains("exceeds limit")));
    assert_eq!(farm.insert(vec![t("k", "a", 1.0, "ok")]).await.ok(), Some(1));
}

#[tokio::test]
async fn topology_swaps_the_shard_set() {
    let (farm, _) = memory_farm(1);
    let replacement: Vec<Arc<dyn Shard>> = (0..2)
        .map(|_| Arc::new(MemoryShard::new()) as Arc<dyn Shard>)
        .collect();
    let old = farm.topology(replacement);
    assert_eq!(old.len(), 1);
    assert_eq!(farm.shard_count(), 2);
    assert_eq!(farm.insert(vec![t("k", "a", 1.0, "x")]).await.ok(), Some(1));
    for s in old {
        assert!(s.close().await.is_ok());
    }
}

#[tokio::test]
async fn close_closes_every_shard() {
    let (farm, shards) = memory_farm(2);
    assert!(farm.close().await.is_ok());
    let out: Vec<Element> = shards[0].size(&"k".into()).collect().await;
    assert!(matches!(out[0].error(), Some(ShardError::Closed)));
    assert!(matches!(farm.close().await, Err(FarmError::CompleteFailure(_))));
}

#[tokio::test]
async fn configured_farm_honours_per_op_strategies() {
    let cfg: FarmConfig = serde_json::from_str(
        r#"{
            "delete": {"strategy": "noop"},
            "insert": {"tactic": "rate-limited",
                       "requests_per_duration": 2, "requests_duration_ms": 3600000}
        }"#,
    )
    .expect("parse");
    let shards: Vec<Arc<dyn Shard>> = (0..2)
        .map(|_| Arc::new(MemoryShard::new()) as Arc<dyn Shard>)
        .collect();
    let tracing_ops: Instruments = PerOp::try_from_fn(|op| {
        let sink = Arc::new(TracingInstrumentation::new(op.name()));
        Ok::<_, FarmError>(sink as Arc<dyn Instrumentation>)
    })
    .expect("instruments");
    let farm = Farm::from_config(shards, &cfg, tracing_ops).expect("farm");

    let tuple = t("k", "a", 1.0, "x");
    assert_eq!(farm.insert(vec![tuple.clone()]).await.ok(), Some(1));
    assert_eq!(farm.delete(vec![tuple.clone()]).await.ok(), Some(0));
    assert_eq!(farm.members(&"k".into()).await.ok(), Some(vec![tuple.clone()]));
    assert!(matches!(
        farm.insert(vec![tuple]).await,
        Err(FarmError::RateLimited { requested: 2 })
    ));
}
