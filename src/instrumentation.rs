// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Hooks the farm fires as it works. Implementations must not block: they
/// are called inline on the coordinator's path.
pub trait Instrumentation: Send + Sync {
    fn call(&self);
    fn send_to(&self, n: usize);
    fn duration(&self, d: Duration);
    fn retrieved(&self, n: usize);
    fn returned(&self, n: usize);
    fn repair_required(&self);
    fn partial_failure(&self);
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NopInstrumentation;

impl Instrumentation for NopInstrumentation {
    fn call(&self) {}
    fn send_to(&self, _: usize) {}
    fn duration(&self, _: Duration) {}
    fn retrieved(&self, _: usize) {}
    fn returned(&self, _: usize) {}
    fn repair_required(&self) {}
    fn partial_failure(&self) {}
}

/// Emits each hook as a `tracing` event under a fixed operation name.
#[derive(Clone, Debug)]
pub struct TracingInstrumentation {
    op: &'static str,
}

impl TracingInstrumentation {
    pub fn new(op: &'static str) -> Self {
        TracingInstrumentation { op }
    }
}

impl Instrumentation for TracingInstrumentation {
    fn call(&self) {
        debug!(op = self.op, "call");
    }
    fn send_to(&self, n: usize) {
        debug!(op = self.op, n, "send_to");
    }
    fn duration(&self, d: Duration) {
        debug!(op = self.op, micros = d.as_micros() as u64, "duration");
    }
    fn retrieved(&self, n: usize) {
        debug!(op = self.op, n, "retrieved");
    }
    fn returned(&self, n: usize) {
        debug!(op = self.op, n, "returned");
    }
    fn repair_required(&self) {
        debug!(op = self.op, "repair_required");
    }
    fn partial_failure(&self) {
        debug!(op = self.op, "partial_failure");
    }
}

/// Plain counters, readable at any time.
#[derive(Debug, Default)]
pub struct CountingInstrumentation {
    pub calls: AtomicU64,
    pub sent_to: AtomicU64,
    pub durations: AtomicU64,
    pub retrieved: AtomicU64,
    pub returned: AtomicU64,
    pub repairs_required: AtomicU64,
    pub partial_failures: AtomicU64,
}

impl CountingInstrumentation {
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::SeqCst)
    }
}

impl Instrumentation for CountingInstrumentation {
    fn call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
    fn send_to(&self, n: usize) {
        self.sent_to.fetch_add(n as u64, Ordering::SeqCst);
    }
    fn duration(&self, _: Duration) {
        self.durations.fetch_add(1, Ordering::SeqCst);
    }
    fn retrieved(&self, n: usize) {
        self.retrieved.fetch_add(n as u64, Ordering::SeqCst);
    }
    fn returned(&self, n: usize) {
        self.returned.fetch_add(n as u64, Ordering::SeqCst);
    }
    fn repair_required(&self) {
        self.repairs_required.fetch_add(1, Ordering::SeqCst);
    }
    fn partial_failure(&self) {
        self.partial_failures.fetch_add(1, Ordering::SeqCst);
    }
}
