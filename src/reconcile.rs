// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Read-repair reconciliation.
//!
//! Each shard answers a read with its own `TupleSet`. Treated as a map from
//! identity (a tuple without its score) to score, each answer is an element of
//! a map lattice whose values join under `max`; the union of all answers is
//! just their join. The difference is every identity some shard is missing,
//! or holds at a score other shards don't share.

use crate::{KeyFieldScoreTxnValue, KeyFieldTxnValue, Score};
use pergola::{BTreeMapWithUnion, LatticeElt, MaxDef};
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

/// One shard's answer to a read, keyed by full identity.
pub type TupleSet = BTreeSet<KeyFieldScoreTxnValue>;

type IdentityScoresLD = BTreeMapWithUnion<KeyFieldTxnValue, MaxDef<Score>>;
type IdentityScoresLE = LatticeElt<IdentityScoresLD>;

fn identity_scores(set: &TupleSet) -> IdentityScoresLE {
    let mut elt = IdentityScoresLE::default();
    for t in set {
        let score = LatticeElt::new_from(t.score);
        let entry = elt.value.entry(t.identity()).or_insert_with(|| score.clone());
        *entry = &*entry + &score;
    }
    elt
}

/// The outcome of reconciling N shards' answers to the same read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconciledPair {
    /// One tuple per identity, carrying the highest score any shard had.
    pub union: TupleSet,
    /// Identities at least one shard lacks in exactly the winning form.
    pub difference: BTreeSet<KeyFieldTxnValue>,
}

impl ReconciledPair {
    /// The union's tuples whose identity is in the difference: what has to be
    /// written back for every shard to hold the winning versions.
    pub fn repair_candidates(&self) -> Vec<KeyFieldScoreTxnValue> {
        self.union
            .iter()
            .filter(|t| self.difference.contains(&t.identity()))
            .cloned()
            .collect()
    }

    pub fn needs_repair(&self) -> bool {
        !self.difference.is_empty()
    }
}

/// Merge the answers of `sets.len()` shards.
pub fn reconcile(sets: &[TupleSet]) -> ReconciledPair {
    let n = sets.len();
    let mut scores = IdentityScoresLE::default();
    let mut occurrences: BTreeMap<&KeyFieldScoreTxnValue, usize> = BTreeMap::new();
    for set in sets {
        scores = &scores + &identity_scores(set);
        for t in set {
            *occurrences.entry(t).or_insert(0) += 1;
        }
    }

    let union: TupleSet = scores
        .value
        .into_iter()
        .map(|(id, score)| id.with_score(score.value))
        .collect();
    let difference: BTreeSet<KeyFieldTxnValue> = occurrences
        .into_iter()
        .filter(|(_, count)| *count < n)
        .map(|(t, _)| t.identity())
        .collect();
    trace!(
        "reconciled {} sets into {} tuples, {} needing repair",
        n,
        union.len(),
        difference.len()
    );
    ReconciledPair { union, difference }
}
