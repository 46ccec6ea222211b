// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::FarmError;
use std::future::Future;
use tracing::debug;

/// If `err` is a `PartialError`, start `repair` as its own task and forget
/// about it. Either way `err` comes back untouched: the caller's failure and
/// the correction it provokes are decoupled, and the correction's outcome is
/// only visible through logs and instrumentation.
///
/// `repair` is only called when a repair is actually started.
pub fn maybe_repair<R, Fut>(err: FarmError, repair: R) -> FarmError
where
    R: FnOnce() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    if err.is_partial() {
        debug!("starting repair after: {}", err);
        tokio::spawn(repair());
    }
    err
}
