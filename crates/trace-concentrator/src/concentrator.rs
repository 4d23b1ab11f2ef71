// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Concentrator facade.
//!
//! Binds the inbound span stream, the bucket ring and the two outbound
//! streams together. Lifecycle:
//!
//! 1. [`Concentrator::new`] with a configuration and an exit token
//! 2. [`Concentrator::init`] binds the channels, exactly once
//! 3. [`Concentrator::start`] opens the first bucket and spawns the span
//!    ingestor and the flush scheduler, returning their join handles
//! 4. cancelling the exit token stops the flush scheduler, which closes the
//!    outbound span channel; [`ConcentratorWorkers::wait_for_exit`] returns
//!    once that has happened
//!
//! The outbound stats channel is never closed by the workers. The
//! concentrator keeps a sender alive so the host decides when the stats
//! stream ends, by dropping the concentrator.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bucket::{SpanStatsBucket, StatsBucket};
use crate::config::ConcentratorConfig;
use crate::errors::ConcentratorError;
use crate::flush_scheduler::{FlushScheduler, FlushSchedulerConfig};
use crate::ingestor::{Ingestor, SpanOutlet};
use crate::ring::BucketRing;
use crate::span::Span;
use crate::telemetry::{ConcentratorTelemetry, TelemetrySnapshot};

struct Channels<B> {
    in_spans: mpsc::Receiver<Span>,
    out_stats: mpsc::Sender<B>,
    out_spans: mpsc::Sender<Span>,
}

pub struct Concentrator<B: StatsBucket = SpanStatsBucket> {
    config: ConcentratorConfig,
    exit: CancellationToken,
    ring: Arc<BucketRing<B>>,
    telemetry: Arc<ConcentratorTelemetry>,
    channels: Option<Channels<B>>,
    // Held so that the stats stream outlives the flush scheduler.
    out_stats: Option<mpsc::Sender<B>>,
    initialized: bool,
    started: bool,
}

impl<B: StatsBucket> Concentrator<B> {
    #[must_use]
    pub fn new(config: ConcentratorConfig, exit: CancellationToken) -> Self {
        let telemetry = Arc::new(ConcentratorTelemetry::default());
        let ring = Arc::new(BucketRing::new(config.eps, Arc::clone(&telemetry)));
        Self {
            config,
            exit,
            ring,
            telemetry,
            channels: None,
            out_stats: None,
            initialized: false,
            started: false,
        }
    }

    /// Binds the inbound span stream and the two outbound streams.
    pub fn init(
        &mut self,
        in_spans: mpsc::Receiver<Span>,
        out_stats: mpsc::Sender<B>,
        out_spans: mpsc::Sender<Span>,
    ) -> Result<(), ConcentratorError> {
        if self.initialized {
            return Err(ConcentratorError::AlreadyInitialized);
        }
        self.out_stats = Some(out_stats.clone());
        self.channels = Some(Channels {
            in_spans,
            out_stats,
            out_spans,
        });
        self.initialized = true;
        Ok(())
    }

    /// Opens the first bucket and spawns both workers on the current tokio
    /// runtime. Returns immediately.
    ///
    /// The configuration is checked again here since its fields are public.
    pub fn start(&mut self) -> Result<ConcentratorWorkers, ConcentratorError> {
        if self.started {
            return Err(ConcentratorError::AlreadyStarted);
        }
        self.config.validate()?;
        let channels = self
            .channels
            .take()
            .ok_or(ConcentratorError::NotInitialized)?;
        self.started = true;

        self.ring.open_first();
        let outlet = SpanOutlet::new(channels.out_spans);

        let ingestor = Ingestor::new(
            Arc::clone(&self.ring),
            channels.in_spans,
            outlet.clone(),
            Arc::clone(&self.telemetry),
        );
        let flush_scheduler = FlushScheduler::new(FlushSchedulerConfig {
            ring: Arc::clone(&self.ring),
            out_stats: channels.out_stats,
            out_spans: outlet,
            exit: self.exit.clone(),
            period: self.config.bucket_duration,
            flush_on_shutdown: self.config.flush_on_shutdown,
            telemetry: Arc::clone(&self.telemetry),
        });

        let workers = ConcentratorWorkers {
            ingestor: Some(tokio::spawn(ingestor.run())),
            flush_scheduler: Some(tokio::spawn(flush_scheduler.run())),
        };

        info!(
            "Concentrator started, bucket duration {:?}, eps {}",
            self.config.bucket_duration, self.config.eps
        );
        Ok(workers)
    }

    /// Adds a span to the current bucket.
    ///
    /// Returns `false` if no bucket is open, before [`Concentrator::start`]
    /// or after buckets were flushed on shutdown.
    #[must_use]
    pub fn handle_new_span(&self, span: &Span) -> bool {
        self.ring.handle_span(span)
    }

    #[must_use]
    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    #[must_use]
    pub fn config(&self) -> &ConcentratorConfig {
        &self.config
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started
    }
}

/// Join handles of the span ingestor and the flush scheduler.
pub struct ConcentratorWorkers {
    ingestor: Option<JoinHandle<()>>,
    flush_scheduler: Option<JoinHandle<()>>,
}

impl ConcentratorWorkers {
    /// Waits until the flush scheduler has exited, which guarantees the
    /// outbound span channel is closed.
    pub async fn wait_for_exit(&mut self) -> Result<(), ConcentratorError> {
        match self.flush_scheduler.take() {
            Some(handle) => handle
                .await
                .map_err(|e| ConcentratorError::WorkerPanicked(e.to_string())),
            None => Ok(()),
        }
    }

    /// Waits for both workers. The ingestor only ends once its inbound
    /// channel is closed, or on its first span after shutdown.
    pub async fn join(mut self) -> Result<(), ConcentratorError> {
        self.wait_for_exit().await?;
        match self.ingestor.take() {
            Some(handle) => handle
                .await
                .map_err(|e| ConcentratorError::WorkerPanicked(e.to_string())),
            None => Ok(()),
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.ingestor.as_ref().map_or(true, JoinHandle::is_finished)
            && self
                .flush_scheduler
                .as_ref()
                .map_or(true, JoinHandle::is_finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::tests::{span, RecordingBucket};
    use std::time::Duration;

    fn config() -> ConcentratorConfig {
        ConcentratorConfig::new(2, 0.01).expect("valid config")
    }

    fn channels() -> (
        (mpsc::Sender<Span>, mpsc::Receiver<Span>),
        (mpsc::Sender<RecordingBucket>, mpsc::Receiver<RecordingBucket>),
        (mpsc::Sender<Span>, mpsc::Receiver<Span>),
    ) {
        (mpsc::channel(8), mpsc::channel(8), mpsc::channel(8))
    }

    #[tokio::test]
    async fn test_start_requires_init() {
        let mut concentrator: Concentrator<RecordingBucket> =
            Concentrator::new(config(), CancellationToken::new());
        assert!(matches!(
            concentrator.start(),
            Err(ConcentratorError::NotInitialized)
        ));
        assert!(!concentrator.is_started());
    }

    #[tokio::test]
    async fn test_init_and_start_only_once() {
        let exit = CancellationToken::new();
        let mut concentrator: Concentrator<RecordingBucket> =
            Concentrator::new(config(), exit.clone());
        let ((_in_tx, in_rx), (stats_tx, _stats_rx), (spans_tx, _spans_rx)) = channels();
        concentrator
            .init(in_rx, stats_tx.clone(), spans_tx.clone())
            .expect("first init succeeds");

        let (_, second_rx) = mpsc::channel(1);
        assert!(matches!(
            concentrator.init(second_rx, stats_tx, spans_tx),
            Err(ConcentratorError::AlreadyInitialized)
        ));

        let mut workers = concentrator.start().expect("first start succeeds");
        assert!(matches!(
            concentrator.start(),
            Err(ConcentratorError::AlreadyStarted)
        ));

        exit.cancel();
        workers.wait_for_exit().await.expect("scheduler exits");
        // A second wait is a no-op.
        workers.wait_for_exit().await.expect("scheduler already exited");
    }

    #[tokio::test]
    async fn test_start_rejects_unrepresentable_bucket_duration() {
        let config = ConcentratorConfig {
            bucket_duration: Duration::MAX,
            ..config()
        };
        let mut concentrator: Concentrator<RecordingBucket> =
            Concentrator::new(config, CancellationToken::new());
        let ((in_tx, in_rx), (stats_tx, _stats_rx), (spans_tx, mut spans_rx)) = channels();
        concentrator
            .init(in_rx, stats_tx, spans_tx)
            .expect("init succeeds");

        assert!(matches!(
            concentrator.start(),
            Err(ConcentratorError::InvalidConfig(
                crate::errors::ConfigError::InvalidBucketDuration(_)
            ))
        ));
        assert!(!concentrator.is_started());
        assert!(!concentrator.handle_new_span(&span(1)));

        // Nothing was spawned, so the outbound span channel closes with the
        // concentrator instead of hanging.
        drop(in_tx);
        drop(concentrator);
        assert!(spans_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_handle_new_span_needs_open_bucket() {
        let mut concentrator: Concentrator<RecordingBucket> =
            Concentrator::new(config(), CancellationToken::new());
        assert!(!concentrator.handle_new_span(&span(1)));

        let ((_in_tx, in_rx), (stats_tx, _stats_rx), (spans_tx, _spans_rx)) = channels();
        concentrator
            .init(in_rx, stats_tx, spans_tx)
            .expect("init succeeds");
        let _workers = concentrator.start().expect("start succeeds");

        assert!(concentrator.handle_new_span(&span(2)));
        assert_eq!(
            concentrator.ring.with_current(|b| b.span_ids.clone()),
            Some(vec![2])
        );
        let snapshot = concentrator.telemetry();
        assert_eq!(snapshot.spans_handled, 1);
        assert_eq!(snapshot.spans_unattributed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_stream_outlives_workers() {
        let exit = CancellationToken::new();
        let mut concentrator: Concentrator<RecordingBucket> =
            Concentrator::new(config(), exit.clone());
        let ((in_tx, in_rx), (stats_tx, mut stats_rx), (spans_tx, mut spans_rx)) = channels();
        concentrator
            .init(in_rx, stats_tx, spans_tx)
            .expect("init succeeds");
        let workers = concentrator.start().expect("start succeeds");

        tokio::time::sleep(Duration::from_secs(1)).await;
        exit.cancel();
        drop(in_tx);
        workers.join().await.expect("workers exit");
        assert!(spans_rx.recv().await.is_none());

        assert!(matches!(
            stats_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));
        drop(concentrator);
        assert!(stats_rx.recv().await.is_none());
    }
}
