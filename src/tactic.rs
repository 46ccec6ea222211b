// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Fan-out policies.
//!
//! A `Tactic` decides whether, and how, a per-shard action runs against every
//! shard. It never waits for the actions it launches: synchronisation is the
//! caller's business, typically by letting each action own a clone of the
//! sender side of a result queue.

use crate::{FarmError, FarmResult, Shard};
use futures::future::BoxFuture;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::convert::TryFrom;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

/// The work to be done against one shard.
pub type ShardAction = Arc<dyn Fn(Arc<dyn Shard>) -> BoxFuture<'static, ()> + Send + Sync>;

/// What a tactic did with a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// No shard was touched, deliberately.
    Skipped,
    /// One action was launched per shard.
    Launched(usize),
}

pub trait Tactic: Send + Sync + fmt::Debug {
    fn dispatch(&self, shards: &[Arc<dyn Shard>], action: ShardAction) -> FarmResult<Dispatch>;
}

/// Disables an operation path entirely.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTactic;

impl Tactic for NoopTactic {
    fn dispatch(&self, _: &[Arc<dyn Shard>], _: ShardAction) -> FarmResult<Dispatch> {
        Ok(Dispatch::Skipped)
    }
}

/// Launches the action against every shard as its own task.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnconditionalTactic;

impl Tactic for UnconditionalTactic {
    fn dispatch(&self, shards: &[Arc<dyn Shard>], action: ShardAction) -> FarmResult<Dispatch> {
        for shard in shards {
            tokio::spawn(action(shard.clone()));
        }
        trace!("launched {} shard tasks", shards.len());
        Ok(Dispatch::Launched(shards.len()))
    }
}

/// A token bucket shared by every call of one operation type. It refills at
/// `per` permits every `duration` and never holds more than `per`.
pub struct PermitPool {
    limiter: DefaultDirectRateLimiter,
}

impl fmt::Debug for PermitPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermitPool").finish()
    }
}

impl PermitPool {
    pub fn new(per: u32, duration: Duration) -> FarmResult<Self> {
        let burst = NonZeroU32::new(per)
            .ok_or_else(|| FarmError::Config("rate limit needs a non-zero request count".into()))?;
        let quota = Quota::with_period(duration / per).ok_or_else(|| {
            FarmError::Config(format!(
                "rate limit of {} per {:?} has no usable refill period",
                per, duration
            ))
        })?;
        Ok(PermitPool {
            limiter: RateLimiter::direct(quota.allow_burst(burst)),
        })
    }

    /// Withdraw `n` permits at once, or none at all.
    pub fn try_withdraw(&self, n: usize) -> bool {
        if n == 0 {
            return true;
        }
        match u32::try_from(n).ok().and_then(NonZeroU32::new) {
            Some(n) => matches!(self.limiter.check_n(n), Ok(Ok(_))),
            None => false,
        }
    }
}

/// `UnconditionalTactic` behind a `PermitPool`: a batch that can't get one
/// permit per shard is rejected before any shard sees it.
#[derive(Clone, Debug)]
pub struct RateLimitedTactic {
    permits: Arc<PermitPool>,
    inner: UnconditionalTactic,
}

impl RateLimitedTactic {
    pub fn new(permits: Arc<PermitPool>) -> Self {
        RateLimitedTactic {
            permits,
            inner: UnconditionalTactic,
        }
    }
}

impl Tactic for RateLimitedTactic {
    fn dispatch(&self, shards: &[Arc<dyn Shard>], action: ShardAction) -> FarmResult<Dispatch> {
        if !self.permits.try_withdraw(shards.len()) {
            warn!("rate limited batch of {} shards", shards.len());
            return Err(FarmError::RateLimited {
                requested: shards.len(),
            });
        }
        self.inner.dispatch(shards, action)
    }
}
