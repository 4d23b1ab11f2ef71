// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Two-slot bucket rotation.
//!
//! One slot is the write target for incoming spans, the other holds the
//! bucket closed by the previous rotation until the next rotation emits it.
//! The write target is selected by an atomic index: span handlers perform a
//! single `Acquire` load, the rotating side a single `Release` store. Each
//! slot sits behind its own mutex, held only for one span update or one slot
//! swap, so a rotation waits for at most one in-flight span. New buckets are
//! built before a slot lock is taken.
//!
//! A span racing a rotation may be attributed to either the closing or the
//! new bucket. A bucket is moved out of its slot before it is emitted and
//! can never be written to afterwards.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

use crate::bucket::StatsBucket;
use crate::span::Span;
use crate::telemetry::ConcentratorTelemetry;

struct Slot<B> {
    bucket: B,
    opened_at: Instant,
    closed: bool,
}

impl<B: StatsBucket> Slot<B> {
    fn open(eps: f64) -> Self {
        Self {
            bucket: B::new(eps),
            opened_at: Instant::now(),
            closed: false,
        }
    }

    // Stamps the window length from a monotonic clock so wall-clock jumps
    // cannot produce negative durations.
    fn close(&mut self) {
        if self.closed {
            return;
        }
        let elapsed = i64::try_from(self.opened_at.elapsed().as_nanos()).unwrap_or(i64::MAX);
        self.bucket.set_duration(elapsed);
        self.closed = true;
    }

    fn into_encoded(mut self) -> B {
        self.close();
        self.bucket.encode();
        self.bucket
    }
}

pub struct BucketRing<B: StatsBucket> {
    slots: [Mutex<Option<Slot<B>>>; 2],
    current: AtomicUsize,
    eps: f64,
    telemetry: Arc<ConcentratorTelemetry>,
}

fn lock<T>(slot: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking bucket must not take span ingestion down with it.
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<B: StatsBucket> BucketRing<B> {
    /// Creates an empty ring. [`BucketRing::open_first`] populates slot 0.
    #[must_use]
    pub fn new(eps: f64, telemetry: Arc<ConcentratorTelemetry>) -> Self {
        Self {
            slots: [Mutex::new(None), Mutex::new(None)],
            current: AtomicUsize::new(0),
            eps,
            telemetry,
        }
    }

    /// Start-of-day: opens the first bucket in slot 0 and makes it current.
    pub fn open_first(&self) {
        *lock(&self.slots[0]) = Some(Slot::open(self.eps));
        self.current.store(0, Ordering::Release);
    }

    #[must_use]
    pub fn current_index(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    /// Routes a span into the current bucket.
    ///
    /// Returns `false` when no bucket is open (before start of day or after
    /// the ring has been drained).
    #[must_use]
    pub fn handle_span(&self, span: &Span) -> bool {
        let index = self.current.load(Ordering::Acquire);
        match lock(&self.slots[index]).as_mut() {
            Some(slot) => {
                slot.bucket.handle_span(span);
                self.telemetry.span_handled();
                true
            }
            None => {
                self.telemetry.span_unattributed();
                false
            }
        }
    }

    /// Closes the current bucket, opens a new one, and returns the bucket
    /// closed by the previous rotation, encoded and ready to emit.
    ///
    /// Returns `None` on the first rotation, when there is no closed bucket
    /// yet. Must only be called from a single task.
    pub fn rotate(&self) -> Option<B> {
        let current = self.current.load(Ordering::Acquire);
        let next = (current + 1) % 2;

        let opened = Slot::open(self.eps);
        let drained = lock(&self.slots[next]).replace(opened);

        if let Some(slot) = lock(&self.slots[current]).as_mut() {
            slot.close();
        }
        self.current.store(next, Ordering::Release);
        self.telemetry.bucket_rotated();

        drained.map(|slot| {
            debug_assert!(slot.closed, "only closed buckets may be emitted");
            slot.into_encoded()
        })
    }

    /// Empties both slots and returns their buckets, encoded, oldest first:
    /// the bucket closed by the last rotation, then the open one.
    pub fn drain(&self) -> Vec<B> {
        let current = self.current.load(Ordering::Acquire);
        let previous = (current + 1) % 2;

        let mut buckets = Vec::with_capacity(2);
        if let Some(slot) = lock(&self.slots[previous]).take() {
            buckets.push(slot.into_encoded());
        }
        if let Some(slot) = lock(&self.slots[current]).take() {
            buckets.push(slot.into_encoded());
        }
        buckets
    }

    /// Number of buckets held by the ring, open or closed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.slots.iter().filter(|slot| lock(*slot).is_some()).count()
    }

    #[cfg(test)]
    pub(crate) fn with_current<R>(&self, f: impl FnOnce(&B) -> R) -> Option<R> {
        let index = self.current.load(Ordering::Acquire);
        lock(&self.slots[index]).as_ref().map(|slot| f(&slot.bucket))
    }
}
