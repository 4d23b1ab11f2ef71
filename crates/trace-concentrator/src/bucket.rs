// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time-bucketed span statistics.
//!
//! The concentrator treats a bucket as opaque: it opens one with
//! [`StatsBucket::new`], feeds spans through [`StatsBucket::handle_span`],
//! stamps the window length when the bucket is closed and finally calls
//! [`StatsBucket::encode`] right before handing it downstream.
//! [`SpanStatsBucket`] is the implementation used by default.

use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

use crate::sketch::DurationSketch;
use crate::span::Span;

/// A mutable accumulator of span statistics over one time window.
pub trait StatsBucket: Send + 'static {
    /// Opens an empty bucket whose window starts now.
    ///
    /// `eps` is the approximation error bound of the bucket's summaries.
    fn new(eps: f64) -> Self
    where
        Self: Sized;

    /// Absorbs one span's contribution.
    fn handle_span(&mut self, span: &Span);

    /// Freezes the bucket for transmission. Called exactly once, after the
    /// duration has been stamped.
    fn encode(&mut self);

    /// Window start in nanoseconds since the Unix epoch.
    fn start(&self) -> i64;

    /// Window length in nanoseconds, zero until the bucket is closed.
    fn duration(&self) -> i64;

    fn set_duration(&mut self, duration: i64);
}

/// Spans are grouped by service, operation name and resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AggregationKey {
    pub service: String,
    pub name: String,
    pub resource: String,
}

impl AggregationKey {
    #[must_use]
    pub fn from_span(span: &Span) -> Self {
        Self {
            service: span.service.clone(),
            name: span.name.clone(),
            resource: span.resource.clone(),
        }
    }
}

/// Aggregated statistics for a single [`AggregationKey`].
#[derive(Clone, Debug, Serialize)]
pub struct GroupedStats {
    #[serde(flatten)]
    pub key: AggregationKey,
    pub hits: u64,
    pub top_level_hits: u64,
    pub errors: u64,
    /// Sum of span durations, in nanoseconds.
    pub duration: i64,
    pub distribution: DurationSketch,
}

impl GroupedStats {
    fn new(key: AggregationKey, eps: f64) -> Self {
        Self {
            key,
            hits: 0,
            top_level_hits: 0,
            errors: 0,
            duration: 0,
            distribution: DurationSketch::new(eps),
        }
    }

    fn add(&mut self, span: &Span) {
        self.hits += 1;
        if span.is_top_level() {
            self.top_level_hits += 1;
        }
        if span.is_error() {
            self.errors += 1;
        }
        self.duration = self.duration.saturating_add(span.duration);
        #[allow(clippy::cast_precision_loss)]
        self.distribution.insert(span.duration as f64);
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SpanStatsBucket {
    start: i64,
    duration: i64,
    stats: Vec<GroupedStats>,
    #[serde(skip)]
    eps: f64,
    #[serde(skip)]
    groups: HashMap<AggregationKey, GroupedStats>,
    #[serde(skip)]
    encoded: bool,
}

impl SpanStatsBucket {
    /// Opens a bucket with an explicit window start.
    #[must_use]
    pub fn with_start(eps: f64, start: i64) -> Self {
        Self {
            start,
            duration: 0,
            stats: Vec::new(),
            eps,
            groups: HashMap::new(),
            encoded: false,
        }
    }

    #[must_use]
    pub fn is_encoded(&self) -> bool {
        self.encoded
    }

    /// Total number of spans absorbed, across all groups.
    #[must_use]
    pub fn hits(&self) -> u64 {
        if self.encoded {
            self.stats.iter().map(|s| s.hits).sum()
        } else {
            self.groups.values().map(|s| s.hits).sum()
        }
    }

    /// Stats for one group, whether or not the bucket has been encoded.
    #[must_use]
    pub fn group(&self, key: &AggregationKey) -> Option<&GroupedStats> {
        if self.encoded {
            self.stats.iter().find(|s| &s.key == key)
        } else {
            self.groups.get(key)
        }
    }

    /// Encoded stats sorted by key. Empty until [`StatsBucket::encode`] runs.
    #[must_use]
    pub fn stats(&self) -> &[GroupedStats] {
        &self.stats
    }
}

impl StatsBucket for SpanStatsBucket {
    fn new(eps: f64) -> Self {
        Self::with_start(eps, crate::now_ns())
    }

    fn handle_span(&mut self, span: &Span) {
        if self.encoded {
            debug!("Ignoring span {} for an already encoded bucket", span.span_id);
            return;
        }
        let eps = self.eps;
        self.groups
            .entry(AggregationKey::from_span(span))
            .or_insert_with_key(|key| GroupedStats::new(key.clone(), eps))
            .add(span);
    }

    fn encode(&mut self) {
        if self.encoded {
            return;
        }
        let mut stats: Vec<GroupedStats> = self.groups.drain().map(|(_, s)| s).collect();
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        self.stats = stats;
        self.encoded = true;
    }

    fn start(&self) -> i64 {
        self.start
    }

    fn duration(&self) -> i64 {
        self.duration
    }

    fn set_duration(&mut self, duration: i64) {
        self.duration = duration;
    }
}
