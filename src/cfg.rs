// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Per-operation configuration of a `Farm`.
//!
//! Every farm operation has its own `StrategyConfig`, naming which shards it
//! goes to (all of them, or none) and how it gets there (unconditionally, or
//! behind a rate limiter). Configs are plain serde structs so they can be read
//! from whatever format the embedding service uses; building them into
//! `Tactics` is where names and rates get validated.

use crate::{
    FarmResult, Instrumentation, NoopTactic, PermitPool, RateLimitedTactic, SizeLimits, Tactic,
    UnconditionalTactic,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// The operations a farm performs.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Op {
    Insert,
    Delete,
    Repair,
    Members,
    Select,
    Keys,
    Size,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Op {
    pub const ALL: [Op; 7] = [
        Op::Insert,
        Op::Delete,
        Op::Repair,
        Op::Members,
        Op::Select,
        Op::Keys,
        Op::Size,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Op::Insert => "insert",
            Op::Delete => "delete",
            Op::Repair => "repair",
            Op::Members => "members",
            Op::Select => "select",
            Op::Keys => "keys",
            Op::Size => "size",
        }
    }
}

/// One `T` per `Op`.
#[derive(Clone, Debug, Default)]
pub struct PerOp<T> {
    pub insert: T,
    pub delete: T,
    pub repair: T,
    pub members: T,
    pub select: T,
    pub keys: T,
    pub size: T,
}

impl<T> PerOp<T> {
    pub fn get(&self, op: Op) -> &T {
        match op {
            Op::Insert => &self.insert,
            Op::Delete => &self.delete,
            Op::Repair => &self.repair,
            Op::Members => &self.members,
            Op::Select => &self.select,
            Op::Keys => &self.keys,
            Op::Size => &self.size,
        }
    }

    pub fn get_mut(&mut self, op: Op) -> &mut T {
        match op {
            Op::Insert => &mut self.insert,
            Op::Delete => &mut self.delete,
            Op::Repair => &mut self.repair,
            Op::Members => &mut self.members,
            Op::Select => &mut self.select,
            Op::Keys => &mut self.keys,
            Op::Size => &mut self.size,
        }
    }

    pub fn try_from_fn<F, E>(mut f: F) -> Result<Self, E>
    where
        F: FnMut(Op) -> Result<T, E>,
    {
        Ok(PerOp {
            insert: f(Op::Insert)?,
            delete: f(Op::Delete)?,
            repair: f(Op::Repair)?,
            members: f(Op::Members)?,
            select: f(Op::Select)?,
            keys: f(Op::Keys)?,
            size: f(Op::Size)?,
        })
    }
}

impl<T: Clone> PerOp<T> {
    pub fn all(t: T) -> Self {
        PerOp {
            insert: t.clone(),
            delete: t.clone(),
            repair: t.clone(),
            members: t.clone(),
            select: t.clone(),
            keys: t.clone(),
            size: t,
        }
    }
}

pub type Tactics = PerOp<Arc<dyn Tactic>>;
pub type Instruments = PerOp<Arc<dyn Instrumentation>>;

/// Which shards an operation is sent to.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    Noop,
    #[serde(alias = "all-shards")]
    All,
}

/// How an operation is dispatched to its shards.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TacticKind {
    Noop,
    Unconditional,
    RateLimited,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub strategy: Strategy,
    pub tactic: TacticKind,
    /// Permits refilled every `requests_duration_ms`, for `rate-limited`.
    pub requests_per_duration: u32,
    pub requests_duration_ms: u64,
    /// Reserved; shards are never counted towards a quorum.
    pub quorum: u32,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        StrategyConfig {
            strategy: Strategy::All,
            tactic: TacticKind::Unconditional,
            requests_per_duration: 0,
            requests_duration_ms: 0,
            quorum: 0,
        }
    }
}

impl StrategyConfig {
    pub fn noop() -> Self {
        StrategyConfig {
            strategy: Strategy::Noop,
            tactic: TacticKind::Noop,
            ..StrategyConfig::default()
        }
    }

    pub fn rate_limited(per: u32, duration: Duration) -> Self {
        StrategyConfig {
            tactic: TacticKind::RateLimited,
            requests_per_duration: per,
            requests_duration_ms: duration.as_millis() as u64,
            ..StrategyConfig::default()
        }
    }

    /// Build the tactic this config describes. A rate-limited tactic gets a
    /// fresh permit pool, shared by every call that goes through it.
    pub fn build(&self) -> FarmResult<Arc<dyn Tactic>> {
        let tactic: Arc<dyn Tactic> = match (self.strategy, self.tactic) {
            (Strategy::Noop, _) | (_, TacticKind::Noop) => Arc::new(NoopTactic),
            (Strategy::All, TacticKind::Unconditional) => Arc::new(UnconditionalTactic),
            (Strategy::All, TacticKind::RateLimited) => {
                let pool = PermitPool::new(
                    self.requests_per_duration,
                    Duration::from_millis(self.requests_duration_ms),
                )?;
                Arc::new(RateLimitedTactic::new(Arc::new(pool)))
            }
        };
        Ok(tactic)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FarmConfig {
    pub insert: StrategyConfig,
    pub delete: StrategyConfig,
    pub repair: StrategyConfig,
    pub members: StrategyConfig,
    pub select: StrategyConfig,
    pub keys: StrategyConfig,
    pub size: StrategyConfig,
    pub limits: SizeLimits,
}

impl FarmConfig {
    pub fn strategy(&self, op: Op) -> &StrategyConfig {
        match op {
            Op::Insert => &self.insert,
            Op::Delete => &self.delete,
            Op::Repair => &self.repair,
            Op::Members => &self.members,
            Op::Select => &self.select,
            Op::Keys => &self.keys,
            Op::Size => &self.size,
        }
    }

    pub fn tactics(&self) -> FarmResult<Tactics> {
        PerOp::try_from_fn(|op| self.strategy(op).build())
    }
}
