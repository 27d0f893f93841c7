use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Instant;

use anyhow::{Context, Result};
use futures::{FutureExt, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ScanConfig;
use crate::connection::{ConnectionStats, Connector};
use crate::error::ProbeError;
use crate::probe::probe;
use crate::sink::ResultSink;
use crate::types::{ProbeStage, ScanResult, ScanSummary, Target};

/// Point-in-time copy of the progress counters.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub total: u64,
    pub completed: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl ProgressSnapshot {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.completed as f64 / self.total as f64 * 100.0
    }
}

/// Progress shared between probe workers and whoever reports on them.
///
/// Each host is recorded exactly once, under the lock.
#[derive(Debug, Default)]
pub struct ScanProgress {
    state: Mutex<ProgressSnapshot>,
}

impl ScanProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_total(&self, hosts: u64) {
        self.state.lock().await.total += hosts;
    }

    pub async fn record(&self, result: &ScanResult) -> ProgressSnapshot {
        let mut guard = self.state.lock().await;
        guard.completed += 1;
        if result.is_success() {
            guard.succeeded += 1;
        } else {
            guard.failed += 1;
        }
        *guard
    }

    pub async fn snapshot(&self) -> ProgressSnapshot {
        *self.state.lock().await
    }
}

/// Runs probes over a host list with a bounded number in flight.
#[derive(Debug, Clone)]
pub struct Scanner {
    config: ScanConfig,
    connector: Connector,
    progress: Arc<ScanProgress>,
    cancel: CancellationToken,
}

impl Scanner {
    pub fn new(config: ScanConfig) -> Self {
        let connector = Connector::new(config.timeout);
        Self {
            config,
            connector,
            progress: Arc::new(ScanProgress::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Report progress into an externally owned counter.
    pub fn with_progress(mut self, progress: Arc<ScanProgress>) -> Self {
        self.progress = progress;
        self
    }

    /// Stop dispatching new hosts once `cancel` fires. Probes already running finish normally.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Count connections into `stats`.
    pub fn with_connection_stats(mut self, stats: ConnectionStats) -> Self {
        self.connector = Connector::with_stats(self.config.timeout, stats);
        self
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn progress(&self) -> &Arc<ScanProgress> {
        &self.progress
    }

    pub fn connection_stats(&self) -> &ConnectionStats {
        self.connector.stats()
    }

    /// Start probing `targets` and return their results as they complete.
    ///
    /// - At most `concurrency` probes run at once, gated by a `Semaphore`.
    /// - Results arrive in completion order, not input order.
    /// - The stream ends once every dispatched probe has reported.
    /// - Dropping the stream stops dispatching further hosts.
    pub fn scan(&self, targets: Vec<Target>) -> ScanStream {
        let concurrency = self.config.effective_concurrency();
        let (tx, rx) = mpsc::channel(concurrency);
        let cancel = self.cancel.child_token();

        info!(hosts = targets.len(), concurrency, timeout = ?self.config.timeout, "starting scan");

        tokio::spawn(dispatch(
            targets,
            concurrency,
            self.connector.clone(),
            Arc::clone(&self.progress),
            cancel.clone(),
            tx,
        ));

        ScanStream {
            inner: ReceiverStream::new(rx),
            cancel,
        }
    }

    /// Scan `targets`, writing every success to `sink`.
    ///
    /// Results are consumed here one at a time, so sink writes never interleave. `on_result` is
    /// called after each result with the progress it produced.
    pub async fn run<S, F>(&self, targets: Vec<Target>, sink: &mut S, mut on_result: F) -> Result<ScanSummary>
    where
        S: ResultSink + ?Sized,
        F: FnMut(&ScanResult, &ProgressSnapshot),
    {
        let started = Instant::now();
        let mut summary = ScanSummary {
            scanned_total: targets.len() as u64,
            ..ScanSummary::default()
        };

        let mut results = self.scan(targets);
        while let Some(result) = results.next().await {
            if let Some(record) = result.record() {
                sink.write(&record)
                    .with_context(|| format!("failed to write result for {}", result.target()))?;
                summary.found_count += 1;
            } else {
                summary.failed_count += 1;
            }
            summary.scanned_done += 1;

            let snapshot = self.progress.snapshot().await;
            on_result(&result, &snapshot);
        }
        sink.flush().context("failed to flush results")?;

        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            done = summary.scanned_done,
            found = summary.found_count,
            failed = summary.failed_count,
            elapsed_ms = summary.elapsed_ms,
            "scan finished"
        );
        Ok(summary)
    }
}

async fn dispatch(
    targets: Vec<Target>,
    concurrency: usize,
    connector: Connector,
    progress: Arc<ScanProgress>,
    cancel: CancellationToken,
    tx: mpsc::Sender<ScanResult>,
) {
    progress.add_total(targets.len() as u64).await;

    let sem = Arc::new(Semaphore::new(concurrency));
    let mut set = JoinSet::new();

    for target in targets {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("scan cancelled, not dispatching remaining hosts");
                break;
            }
            permit = Arc::clone(&sem).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let connector = connector.clone();
        let progress = Arc::clone(&progress);
        let tx = tx.clone();

        set.spawn(async move {
            let _permit = permit; // keep permit until the probe completes

            let outcome = AssertUnwindSafe(probe(&connector, &target)).catch_unwind().await;
            let result = match outcome {
                Ok(result) => result,
                // The stage is unknown; a panicking probe still yields one result for its host.
                Err(_) => ScanResult::Failure {
                    target,
                    stage: ProbeStage::Connect,
                    error: ProbeError::Panicked,
                },
            };

            progress.record(&result).await;
            // The receiver may be gone if the caller stopped listening.
            let _ = tx.send(result).await;
        });
    }
    drop(tx);

    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "probe task did not complete");
        }
    }
}

/// Results of a running scan, in completion order.
///
/// Finite and single-use: once exhausted it stays exhausted.
#[derive(Debug)]
pub struct ScanStream {
    inner: ReceiverStream<ScanResult>,
    cancel: CancellationToken,
}

impl ScanStream {
    /// Stop dispatching hosts that have not started yet.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Stream for ScanStream {
    type Item = ScanResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for ScanStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;

    fn failure(host: &str) -> ScanResult {
        ScanResult::Failure {
            target: Target::new(host, 25565),
            stage: ProbeStage::Parse,
            error: ProbeError::Decode(DecodeError::Overrun),
        }
    }

    #[tokio::test]
    async fn progress_records_each_result_once() {
        let progress = ScanProgress::new();
        progress.add_total(3).await;
        progress.record(&failure("a")).await;
        let snap = progress.record(&failure("b")).await;
        assert_eq!(
            snap,
            ProgressSnapshot {
                total: 3,
                completed: 2,
                succeeded: 0,
                failed: 2
            }
        );
        assert!((snap.percent() - 66.666).abs() < 0.01);
    }

    #[tokio::test]
    async fn empty_host_list_finishes_immediately() {
        let scanner = Scanner::new(ScanConfig::default());
        let results: Vec<_> = scanner.scan(Vec::new()).collect().await;
        assert!(results.is_empty());
        assert_eq!(scanner.progress().snapshot().await.completed, 0);
    }

    #[tokio::test]
    async fn cancelled_scanner_dispatches_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let scanner = Scanner::new(ScanConfig::default()).with_cancel(cancel);
        let results: Vec<_> = scanner
            .scan(vec![Target::new("127.0.0.1", 1), Target::new("127.0.0.1", 2)])
            .collect()
            .await;
        assert!(results.is_empty());
        assert_eq!(scanner.connection_stats().opened(), 0);
    }
}
