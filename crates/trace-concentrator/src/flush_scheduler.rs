// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic bucket rotation and the shutdown protocol.
//!
//! The scheduler is a small state machine:
//!
//! ```text
//!            tick: rotate + emit
//!              ┌──────┐
//!              ▼      │
//!          Running ───┘ ── exit ──▶ Exiting ──▶ Stopped
//! ```
//!
//! Emission happens inside the tick handler, so a slow stats consumer delays
//! the next rotation instead of skipping it. On exit no final rotation takes
//! place unless `flush_on_shutdown` is set: downstream writers may already be
//! shutting down, and the buckets still held by the ring are dropped (and
//! counted). The outbound span channel is closed last.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bucket::StatsBucket;
use crate::config::MAX_BUCKET_DURATION_SECS;
use crate::ingestor::SpanOutlet;
use crate::ring::BucketRing;
use crate::telemetry::ConcentratorTelemetry;

const MIN_PERIOD: Duration = Duration::from_millis(1);
const MAX_PERIOD: Duration = Duration::from_secs(MAX_BUCKET_DURATION_SECS);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Running,
    Exiting,
    Stopped,
}

pub struct FlushScheduler<B: StatsBucket> {
    ring: Arc<BucketRing<B>>,
    out_stats: mpsc::Sender<B>,
    out_spans: SpanOutlet,
    exit: CancellationToken,
    period: Duration,
    flush_on_shutdown: bool,
    telemetry: Arc<ConcentratorTelemetry>,
}

pub struct FlushSchedulerConfig<B: StatsBucket> {
    pub ring: Arc<BucketRing<B>>,
    pub out_stats: mpsc::Sender<B>,
    pub out_spans: SpanOutlet,
    pub exit: CancellationToken,
    pub period: Duration,
    pub flush_on_shutdown: bool,
    pub telemetry: Arc<ConcentratorTelemetry>,
}

impl<B: StatsBucket> FlushScheduler<B> {
    /// The period is clamped so that the ticker's deadlines stay
    /// representable.
    #[must_use]
    pub fn new(config: FlushSchedulerConfig<B>) -> Self {
        let period = config.period.clamp(MIN_PERIOD, MAX_PERIOD);
        if period != config.period {
            warn!(
                "Flush period {:?} is out of range, using {:?}",
                config.period, period
            );
        }
        Self {
            ring: config.ring,
            out_stats: config.out_stats,
            out_spans: config.out_spans,
            exit: config.exit,
            period,
            flush_on_shutdown: config.flush_on_shutdown,
            telemetry: config.telemetry,
        }
    }

    pub async fn run(self) {
        // First rotation one full period after start.
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!("Flush scheduler started, period {:?}", self.period);
        let mut state = SchedulerState::Running;
        loop {
            state = match state {
                SchedulerState::Running => {
                    tokio::select! {
                        biased;
                        () = self.exit.cancelled() => SchedulerState::Exiting,
                        _ = ticker.tick() => {
                            self.flush().await;
                            SchedulerState::Running
                        }
                    }
                }
                SchedulerState::Exiting => {
                    self.shut_down().await;
                    SchedulerState::Stopped
                }
                SchedulerState::Stopped => break,
            };
        }
        debug!("Flush scheduler stopped");
    }

    async fn flush(&self) {
        let Some(bucket) = self.ring.rotate() else {
            debug!("Rotated first stats bucket, nothing to flush yet");
            return;
        };

        // Waiting on the stats consumer is backpressure, but it must not
        // hold shutdown hostage.
        tokio::select! {
            biased;
            sent = self.out_stats.send(bucket) => self.record_send(sent.is_ok()),
            () = self.exit.cancelled() => {
                warn!("Exit requested while the stats consumer was blocked, dropping a stats bucket");
                self.telemetry.buckets_dropped_on_shutdown(1);
            }
        }
    }

    fn record_send(&self, delivered: bool) {
        if delivered {
            self.telemetry.bucket_emitted();
            info!("Concentrator flushed a time bucket");
        } else {
            self.telemetry.bucket_undeliverable();
            warn!("Stats consumer dropped its receiver, discarding stats bucket");
        }
    }

    async fn shut_down(&self) {
        info!("Concentrator exiting");

        if self.flush_on_shutdown {
            let buckets = self.ring.drain();
            debug!("Flushing {} stats buckets on shutdown", buckets.len());
            for bucket in buckets {
                let sent = self.out_stats.send(bucket).await;
                self.record_send(sent.is_ok());
            }
        } else {
            let pending = self.ring.pending();
            if pending > 0 {
                warn!("Concentrator exiting without flushing {pending} stats buckets");
                self.telemetry.buckets_dropped_on_shutdown(pending as u64);
            }
        }

        if self.out_spans.close() {
            debug!("Closed outbound span channel");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::tests::{span, RecordingBucket};
    use tokio::task::JoinHandle;
    use tracing_test::traced_test;

    struct Harness {
        ring: Arc<BucketRing<RecordingBucket>>,
        telemetry: Arc<ConcentratorTelemetry>,
        exit: CancellationToken,
        stats_rx: mpsc::Receiver<RecordingBucket>,
        spans_rx: mpsc::Receiver<crate::span::Span>,
        outlet: SpanOutlet,
        task: JoinHandle<()>,
    }

    fn start(flush_on_shutdown: bool, stats_capacity: usize) -> Harness {
        start_with_period(flush_on_shutdown, stats_capacity, Duration::from_secs(2))
    }

    fn start_with_period(
        flush_on_shutdown: bool,
        stats_capacity: usize,
        period: Duration,
    ) -> Harness {
        let telemetry = Arc::new(ConcentratorTelemetry::default());
        let ring = Arc::new(BucketRing::new(0.01, Arc::clone(&telemetry)));
        ring.open_first();
        let (stats_tx, stats_rx) = mpsc::channel(stats_capacity);
        let (spans_tx, spans_rx) = mpsc::channel(8);
        let outlet = SpanOutlet::new(spans_tx);
        let exit = CancellationToken::new();

        let scheduler = FlushScheduler::new(FlushSchedulerConfig {
            ring: Arc::clone(&ring),
            out_stats: stats_tx,
            out_spans: outlet.clone(),
            exit: exit.clone(),
            period,
            flush_on_shutdown,
            telemetry: Arc::clone(&telemetry),
        });
        let task = tokio::spawn(scheduler.run());

        Harness {
            ring,
            telemetry,
            exit,
            stats_rx,
            spans_rx,
            outlet,
            task,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotates_on_each_tick() {
        let mut h = start(false, 8);
        assert!(h.ring.handle_span(&span(1)));

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(h.stats_rx.try_recv().is_err());
        assert_eq!(h.telemetry.snapshot().buckets_rotated, 1);

        assert!(h.ring.handle_span(&span(2)));
        tokio::time::sleep(Duration::from_secs(2)).await;
        let bucket = h.stats_rx.try_recv().expect("first bucket emitted");
        assert_eq!(bucket.span_ids, vec![1]);
        assert_eq!(bucket.duration, 2_000_000_000);

        h.exit.cancel();
        h.task.await.expect("scheduler task failed");
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_exit_drops_unflushed_buckets() {
        let mut h = start(false, 8);
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        h.exit.cancel();
        h.task.await.expect("scheduler task failed");

        assert!(h.stats_rx.try_recv().is_err());
        assert!(h.spans_rx.recv().await.is_none());
        assert!(h.outlet.is_closed());
        assert_eq!(h.telemetry.snapshot().buckets_dropped_on_shutdown, 2);
        assert!(logs_contain("without flushing 2 stats buckets"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_shutdown_emits_remaining_buckets() {
        let mut h = start(true, 8);
        assert!(h.ring.handle_span(&span(1)));
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(h.ring.handle_span(&span(2)));

        h.exit.cancel();
        h.task.await.expect("scheduler task failed");

        let first = h.stats_rx.try_recv().expect("closed bucket emitted");
        let second = h.stats_rx.try_recv().expect("open bucket emitted");
        assert_eq!(first.span_ids, vec![1]);
        assert_eq!(second.span_ids, vec![2]);
        assert_eq!(second.duration, 500_000_000);
        assert!(h.stats_rx.try_recv().is_err());
        assert_eq!(h.telemetry.snapshot().buckets_emitted, 2);
        assert!(h.spans_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_abandons_blocked_emission() {
        // The stats channel holds a single bucket and nobody reads it.
        let h = start(false, 1);

        // First tick emits nothing, second tick fills the channel, third tick
        // blocks on send.
        tokio::time::sleep(Duration::from_millis(6_500)).await;
        let snapshot = h.telemetry.snapshot();
        assert_eq!(snapshot.buckets_rotated, 3);
        assert_eq!(snapshot.buckets_emitted, 1);

        h.exit.cancel();
        h.task.await.expect("scheduler task failed");
        let snapshot = h.telemetry.snapshot();
        assert_eq!(snapshot.buckets_emitted, 1);
        // The blocked bucket plus the two still held by the ring.
        assert_eq!(snapshot.buckets_dropped_on_shutdown, 3);
        assert!(h.outlet.is_closed());
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_out_of_range_period_is_clamped() {
        let mut h = start_with_period(false, 8, Duration::MAX);
        assert!(logs_contain("is out of range"));

        tokio::time::sleep(Duration::from_secs(1)).await;
        h.exit.cancel();
        h.task.await.expect("scheduler must not panic on a huge period");

        assert_eq!(h.telemetry.snapshot().buckets_rotated, 0);
        assert!(h.spans_rx.recv().await.is_none());
    }
}
