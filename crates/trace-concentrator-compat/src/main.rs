// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use tokio_util::sync::CancellationToken;
use trace_concentrator::{Concentrator, ConcentratorConfig, Span, SpanStatsBucket};

const IN_SPANS_CAPACITY: usize = 1024;
const OUT_SPANS_CAPACITY: usize = 1024;
const OUT_STATS_CAPACITY: usize = 16;

#[tokio::main]
pub async fn main() {
    let log_level = env::var("DD_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    // Logs go to stderr, stdout carries the stats stream.
    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(log_level).expect("could not parse log level in configuration"),
        )
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match ConcentratorConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Error creating concentrator config: {e}");
            return;
        }
    };

    let (in_tx, in_rx) = mpsc::channel::<Span>(IN_SPANS_CAPACITY);
    let (stats_tx, stats_rx) = mpsc::channel::<SpanStatsBucket>(OUT_STATS_CAPACITY);
    let (spans_tx, spans_rx) = mpsc::channel::<Span>(OUT_SPANS_CAPACITY);

    let exit = CancellationToken::new();
    let mut concentrator: Concentrator<SpanStatsBucket> = Concentrator::new(config, exit.clone());
    if let Err(e) = concentrator.init(in_rx, stats_tx, spans_tx) {
        error!("Error initializing concentrator: {e}");
        return;
    }
    let mut workers = match concentrator.start() {
        Ok(workers) => workers,
        Err(e) => {
            error!("Error starting concentrator: {e}");
            return;
        }
    };

    let stats_writer = tokio::spawn(write_stats(stats_rx));
    let span_writer = tokio::spawn(write_spans(spans_rx));
    let reader = spawn_span_reader(in_tx, exit.clone());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received interrupt, shutting down"),
        () = exit.cancelled() => info!("Span input closed, shutting down"),
    }
    exit.cancel();

    if let Err(e) = workers.wait_for_exit().await {
        error!("Concentrator did not exit cleanly: {e}");
    }
    match span_writer.await {
        Ok(count) => debug!("Span writer received {count} spans"),
        Err(e) => error!("Span writer failed: {e}"),
    }

    let telemetry = concentrator.telemetry();
    // Dropping the concentrator ends the stats stream.
    drop(concentrator);
    if let Err(e) = stats_writer.await {
        error!("Stats writer failed: {e}");
    }
    reader.abort();

    info!(
        "Concentrator stopped: {} spans handled, {} buckets emitted, {} buckets dropped on shutdown",
        telemetry.spans_handled, telemetry.buckets_emitted, telemetry.buckets_dropped_on_shutdown
    );

    // A pending stdin read cannot be cancelled and would keep the runtime
    // from shutting down.
    std::process::exit(0);
}

/// Feeds newline-delimited JSON spans from stdin. End of input requests
/// shutdown.
fn spawn_span_reader(in_tx: mpsc::Sender<Span>, exit: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                () = exit.cancelled() => break,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match serde_json::from_str::<Span>(&line) {
                    Ok(span) => {
                        if in_tx.send(span).await.is_err() {
                            warn!("Span ingestor stopped, no longer reading input");
                            break;
                        }
                    }
                    Err(e) => warn!("Skipping malformed span: {e}"),
                },
                Ok(None) => {
                    debug!("Reached end of span input");
                    break;
                }
                Err(e) => {
                    error!("Failed to read span input: {e}");
                    break;
                }
            }
        }
        exit.cancel();
    })
}

/// Stand-in for the trace write path: drains forwarded spans until the
/// concentrator closes the stream.
async fn write_spans(mut spans_rx: mpsc::Receiver<Span>) -> u64 {
    let mut count = 0;
    while spans_rx.recv().await.is_some() {
        count += 1;
    }
    count
}

/// Writes every emitted stats bucket as one JSON line on stdout.
async fn write_stats(mut stats_rx: mpsc::Receiver<SpanStatsBucket>) {
    let mut stdout = tokio::io::stdout();
    while let Some(bucket) = stats_rx.recv().await {
        let mut line = match serde_json::to_vec(&bucket) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize stats bucket: {e}");
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = stdout.write_all(&line).await {
            error!("Failed to write stats bucket: {e}");
            continue;
        }
        if let Err(e) = stdout.flush().await {
            error!("Failed to flush stats output: {e}");
        }
    }
}
