// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! An in-process `Shard`.
//!
//! Each key maps fields to their current tuple. Writes are latest-wins by
//! score, and deletes leave a tombstone score behind so that an older insert
//! arriving late can't resurrect the field.
//!
//! Tombstones are kept for the life of the shard, including for keys that
//! held nothing when the delete arrived, so the map only grows. That is fine
//! for an in-process store that lives as long as a test or a cache; a
//! persistent shard would want a trim watermark. Keys with no live members are
//! not reported by `keys()`.

use crate::{
    ready_stream, Element, ElementStream, Field, Key, KeyFieldScoreTxnValue, Score, Shard,
    ShardError, SizeLimits,
};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use im::OrdMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::trace;

#[derive(Clone, Debug, Default)]
struct KeyState {
    members: OrdMap<Field, KeyFieldScoreTxnValue>,
    tombstones: OrdMap<Field, Score>,
}

impl KeyState {
    fn write(&mut self, t: KeyFieldScoreTxnValue) -> bool {
        if let Some(dead) = self.tombstones.get(&t.field) {
            if *dead >= t.score {
                return false;
            }
        }
        let stale = match self.members.get(&t.field) {
            Some(cur) => cur.score > t.score || *cur == t,
            None => false,
        };
        if stale {
            return false;
        }
        self.members.insert(t.field.clone(), t);
        true
    }

    fn remove(&mut self, t: &KeyFieldScoreTxnValue) -> bool {
        let dead = match self.tombstones.get(&t.field) {
            Some(s) if *s > t.score => *s,
            _ => t.score,
        };
        self.tombstones.insert(t.field.clone(), dead);
        let covered = match self.members.get(&t.field) {
            Some(cur) => t.score >= cur.score,
            None => false,
        };
        if covered {
            self.members.remove(&t.field);
        }
        covered
    }
}

#[derive(Debug, Default)]
struct Inner {
    keys: Mutex<OrdMap<Key, KeyState>>,
    closed: AtomicBool,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, OrdMap<Key, KeyState>> {
        self.keys.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_open(&self) -> Result<(), ShardError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ShardError::Closed)
        } else {
            Ok(())
        }
    }

    fn insert_key(
        &self,
        key: &Key,
        members: Vec<KeyFieldScoreTxnValue>,
        limits: SizeLimits,
    ) -> Result<i64, ShardError> {
        self.check_open()?;
        if let Some(why) = members.iter().find_map(|t| limits.violation(t)) {
            return Err(ShardError::TooLarge(why));
        }
        let mut keys = self.lock();
        let mut state = keys.get(key).cloned().unwrap_or_default();
        let mut changed = 0;
        for t in members {
            if state.write(t) {
                changed += 1;
            }
        }
        if !limits.admits_members(state.members.len()) {
            return Err(ShardError::TooLarge(format!(
                "{} members exceeds limit of {}",
                state.members.len(),
                limits.max_members_per_key
            )));
        }
        keys.insert(key.clone(), state);
        Ok(changed)
    }

    fn delete_key(
        &self,
        key: &Key,
        members: Vec<KeyFieldScoreTxnValue>,
    ) -> Result<i64, ShardError> {
        self.check_open()?;
        let mut keys = self.lock();
        let mut state = keys.get(key).cloned().unwrap_or_default();
        let mut changed = 0;
        for t in &members {
            if state.remove(t) {
                changed += 1;
            }
        }
        keys.insert(key.clone(), state);
        Ok(changed)
    }

    fn snapshot(&self, key: &Key) -> Result<KeyState, ShardError> {
        self.check_open()?;
        Ok(self.lock().get(key).cloned().unwrap_or_default())
    }
}

fn by_key(members: Vec<KeyFieldScoreTxnValue>) -> BTreeMap<Key, Vec<KeyFieldScoreTxnValue>> {
    let mut groups: BTreeMap<Key, Vec<KeyFieldScoreTxnValue>> = BTreeMap::new();
    for t in members {
        groups.entry(t.key.clone()).or_default().push(t);
    }
    groups
}

fn count(key: Key, r: Result<i64, ShardError>) -> Element {
    match r {
        Ok(amount) => Element::Count { key, amount },
        Err(error) => Element::Error { key, error },
    }
}

/// A `Shard` held entirely in memory. Clones share the same storage.
#[derive(Clone, Debug, Default)]
pub struct MemoryShard {
    inner: Arc<Inner>,
}

impl MemoryShard {
    pub fn new() -> Self {
        MemoryShard::default()
    }

    fn per_key<F>(&self, members: Vec<KeyFieldScoreTxnValue>, f: F) -> ElementStream
    where
        F: Fn(&Inner, &Key, Vec<KeyFieldScoreTxnValue>) -> Result<i64, ShardError>
            + Send
            + Sync
            + 'static,
    {
        let inner = self.inner.clone();
        stream::iter(by_key(members))
            .map(move |(key, group)| {
                let r = f(&*inner, &key, group);
                trace!("memory shard key {} -> {:?}", key, r);
                count(key, r)
            })
            .boxed()
    }
}

#[async_trait]
impl Shard for MemoryShard {
    fn insert(&self, members: Vec<KeyFieldScoreTxnValue>, limits: SizeLimits) -> ElementStream {
        self.per_key(members, move |inner, key, group| {
            inner.insert_key(key, group, limits)
        })
    }

    fn delete(&self, members: Vec<KeyFieldScoreTxnValue>, _limits: SizeLimits) -> ElementStream {
        self.per_key(members, |inner, key, group| inner.delete_key(key, group))
    }

    fn repair(&self, members: Vec<KeyFieldScoreTxnValue>) -> ElementStream {
        self.per_key(members, |inner, key, group| {
            inner.insert_key(key, group, SizeLimits::default())
        })
    }

    fn members(&self, key: &Key) -> ElementStream {
        let key = key.clone();
        let element = match self.inner.snapshot(&key) {
            Ok(state) => Element::TupleList {
                tuples: state.members.values().cloned().collect(),
                key,
            },
            Err(error) => Element::Error { key, error },
        };
        ready_stream(vec![element])
    }

    fn select(&self, key: &Key, field: &Field) -> ElementStream {
        let key = key.clone();
        let element = match self.inner.snapshot(&key) {
            Ok(state) => Element::TupleList {
                tuples: state.members.get(field).cloned().into_iter().collect(),
                key,
            },
            Err(error) => Element::Error { key, error },
        };
        ready_stream(vec![element])
    }

    fn keys(&self) -> ElementStream {
        let key = Key::default();
        let element = match self.inner.check_open() {
            Ok(()) => Element::KeyList {
                keys: self
                    .inner
                    .lock()
                    .iter()
                    .filter(|(_, s)| !s.members.is_empty())
                    .map(|(k, _)| k.clone())
                    .collect(),
                key,
            },
            Err(error) => Element::Error { key, error },
        };
        ready_stream(vec![element])
    }

    fn size(&self, key: &Key) -> ElementStream {
        let key = key.clone();
        let r = self
            .inner
            .snapshot(&key)
            .map(|state| state.members.len() as i64);
        ready_stream(vec![count(key, r)])
    }

    async fn close(&self) -> Result<(), ShardError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(ShardError::Closed);
        }
        Ok(())
    }
}
