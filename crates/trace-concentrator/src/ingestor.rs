// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bucket::StatsBucket;
use crate::ring::BucketRing;
use crate::span::Span;
use crate::telemetry::ConcentratorTelemetry;

/// Shared ownership of the outbound span sender.
///
/// The ingestor sends through it, the flush scheduler closes it on exit.
/// Receivers observe the channel as closed once the outlet is closed and the
/// send that was in flight, if any, has completed.
#[derive(Clone, Debug)]
pub struct SpanOutlet {
    tx: Arc<Mutex<Option<mpsc::Sender<Span>>>>,
}

impl SpanOutlet {
    #[must_use]
    pub fn new(tx: mpsc::Sender<Span>) -> Self {
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// A sender for one send, or `None` once the outlet is closed.
    #[must_use]
    pub fn sender(&self) -> Option<mpsc::Sender<Span>> {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drops the outlet's sender. Returns `true` only for the call that
    /// actually closed it.
    pub fn close(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// Consumes inbound spans, attributes them to the current bucket and
/// republishes them, in arrival order, for the trace write path.
pub struct Ingestor<B: StatsBucket> {
    ring: Arc<BucketRing<B>>,
    in_spans: mpsc::Receiver<Span>,
    out_spans: SpanOutlet,
    telemetry: Arc<ConcentratorTelemetry>,
}

impl<B: StatsBucket> Ingestor<B> {
    #[must_use]
    pub fn new(
        ring: Arc<BucketRing<B>>,
        in_spans: mpsc::Receiver<Span>,
        out_spans: SpanOutlet,
        telemetry: Arc<ConcentratorTelemetry>,
    ) -> Self {
        Self {
            ring,
            in_spans,
            out_spans,
            telemetry,
        }
    }

    /// Runs until the inbound channel is closed by its producers.
    ///
    /// Never closes the outbound span channel. If shutdown already closed it,
    /// or the write path went away, the span is dropped and the loop ends.
    pub async fn run(mut self) {
        debug!("Span ingestor started");

        while let Some(span) = self.in_spans.recv().await {
            if !self.ring.handle_span(&span) {
                debug!(
                    "No open stats bucket, forwarding span {} without stats",
                    span.span_id
                );
            }

            let Some(tx) = self.out_spans.sender() else {
                self.telemetry.span_dropped();
                warn!("Outbound span channel closed by shutdown, span ingestor stopping");
                break;
            };
            if tx.send(span).await.is_err() {
                self.telemetry.span_dropped();
                warn!("Span writer dropped its receiver, span ingestor stopping");
                break;
            }
            self.telemetry.span_forwarded();
        }

        debug!("Span ingestor stopped");
    }
}
