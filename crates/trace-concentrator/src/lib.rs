// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming trace stats concentrator.
//!
//! Spans arrive on a channel, are rolled up into fixed-duration stats buckets
//! and are republished unchanged for the trace write path. A flush scheduler
//! rotates a two-slot bucket ring on every tick and emits the bucket closed
//! one rotation earlier.
//!
//! ```text
//! in spans → Ingestor → BucketRing (current slot) ──→ out spans
//!                            ↑
//!       ticker/exit → FlushScheduler → rotate → out stats
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod bucket;
pub mod concentrator;
pub mod config;
pub mod errors;
pub mod flush_scheduler;
pub mod ingestor;
pub mod ring;
pub mod sketch;
pub mod span;
pub mod telemetry;

pub use bucket::{SpanStatsBucket, StatsBucket};
pub use concentrator::{Concentrator, ConcentratorWorkers};
pub use config::ConcentratorConfig;
pub use span::Span;

/// Nanoseconds per second conversion factor.
pub const S_TO_NS: i64 = 1_000_000_000;

/// Current wall-clock time in nanoseconds since the Unix epoch.
#[must_use]
pub fn now_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}
