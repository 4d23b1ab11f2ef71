// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Operator-facing counters for the concentrator.
//!
//! Counters are plain relaxed atomics: they are observability hooks, not
//! synchronization. `buckets_dropped_on_shutdown` is the one to watch, it
//! counts buckets discarded because no final flush happens on exit.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ConcentratorTelemetry {
    spans_handled: AtomicU64,
    spans_unattributed: AtomicU64,
    spans_forwarded: AtomicU64,
    spans_dropped: AtomicU64,
    buckets_rotated: AtomicU64,
    buckets_emitted: AtomicU64,
    buckets_dropped_on_shutdown: AtomicU64,
    buckets_undeliverable: AtomicU64,
}

/// Point-in-time copy of [`ConcentratorTelemetry`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub spans_handled: u64,
    pub spans_unattributed: u64,
    pub spans_forwarded: u64,
    pub spans_dropped: u64,
    pub buckets_rotated: u64,
    pub buckets_emitted: u64,
    pub buckets_dropped_on_shutdown: u64,
    pub buckets_undeliverable: u64,
}

impl ConcentratorTelemetry {
    pub fn span_handled(&self) {
        self.spans_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn span_unattributed(&self) {
        self.spans_unattributed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn span_forwarded(&self) {
        self.spans_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn span_dropped(&self) {
        self.spans_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bucket_rotated(&self) {
        self.buckets_rotated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bucket_emitted(&self) {
        self.buckets_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn buckets_dropped_on_shutdown(&self, count: u64) {
        self.buckets_dropped_on_shutdown
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn bucket_undeliverable(&self) {
        self.buckets_undeliverable.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            spans_handled: self.spans_handled.load(Ordering::Relaxed),
            spans_unattributed: self.spans_unattributed.load(Ordering::Relaxed),
            spans_forwarded: self.spans_forwarded.load(Ordering::Relaxed),
            spans_dropped: self.spans_dropped.load(Ordering::Relaxed),
            buckets_rotated: self.buckets_rotated.load(Ordering::Relaxed),
            buckets_emitted: self.buckets_emitted.load(Ordering::Relaxed),
            buckets_dropped_on_shutdown: self.buckets_dropped_on_shutdown.load(Ordering::Relaxed),
            buckets_undeliverable: self.buckets_undeliverable.load(Ordering::Relaxed),
        }
    }
}
