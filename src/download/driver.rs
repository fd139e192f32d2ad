// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Drain loop that feeds the download queue's single-flight slot.
//!
//! The queue only holds state. [`DownloadDriver`] takes the next pending
//! entry, runs the network fetch with a progress callback wired back into
//! the queue, records the terminal status and moves on until nothing is
//! pending. [`DownloadDriver::spawn`] keeps that loop alive in the
//! background and wakes it whenever the queue changes.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::queue::{ClaimedDownload, DownloadQueue};
use super::types::{infer_phase, DownloadPhase, DownloadStatus, ProgressReport, RateTracker};
use crate::cancel::AbortSignal;

/// Pause between finishing one download and starting the next.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// One progress event from a fetcher.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchProgress {
    /// Human-readable status line
    pub status: String,
    /// Bytes done for the current layer/file, if known
    pub completed: Option<u64>,
    /// Total bytes for the current layer/file, if known
    pub total: Option<u64>,
    /// Phase, when the fetcher knows it
    pub phase: Option<DownloadPhase>,
}

impl FetchProgress {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            completed: None,
            total: None,
            phase: None,
        }
    }

    pub fn with_bytes(mut self, completed: u64, total: u64) -> Self {
        self.completed = Some(completed);
        self.total = Some(total);
        self
    }

    pub fn with_phase(mut self, phase: DownloadPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Download progress as a percentage (0-100).
    pub fn percentage(&self) -> Option<f64> {
        match (self.total, self.completed) {
            (Some(total), Some(completed)) if total > 0 => {
                Some((completed as f64 / total as f64) * 100.0)
            }
            _ => None,
        }
    }
}

/// Callback a fetcher calls for each progress event.
pub type ProgressFn = Box<dyn FnMut(FetchProgress) + Send>;

/// Future returned by [`ModelFetcher::fetch`].
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

/// Network operation that downloads one model.
///
/// Implementations must stop promptly once `signal` is aborted; returning an
/// error at that point is fine, the driver knows the entry was cancelled.
pub trait ModelFetcher: Send + Sync {
    fn fetch<'a>(&'a self, model: &'a str, signal: AbortSignal, progress: ProgressFn) -> FetchFuture<'a>;
}

/// What one [`DownloadDriver::drain`] pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl DrainSummary {
    fn record(&mut self, status: DownloadStatus) {
        match status {
            DownloadStatus::Completed => self.completed += 1,
            DownloadStatus::Failed => self.failed += 1,
            _ => self.cancelled += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }
}

/// Single-flight drain loop over a [`DownloadQueue`].
pub struct DownloadDriver {
    queue: Arc<DownloadQueue>,
    fetcher: Arc<dyn ModelFetcher>,
    settle_delay: Duration,
}

impl DownloadDriver {
    pub fn new(queue: Arc<DownloadQueue>, fetcher: Arc<dyn ModelFetcher>) -> Self {
        Self {
            queue,
            fetcher,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Process pending entries one at a time until none are left.
    ///
    /// Returns immediately if another driver already holds the slot.
    pub async fn drain(&self) -> DrainSummary {
        let mut summary = DrainSummary::default();

        while let Some(claimed) = self.queue.try_start_next() {
            let status = self.run_one(claimed).await;
            summary.record(status);

            if !self.settle_delay.is_zero() {
                tokio::time::sleep(self.settle_delay).await;
            }
        }

        if summary.total() > 0 {
            tracing::info!(
                completed = summary.completed,
                failed = summary.failed,
                cancelled = summary.cancelled,
                "download queue drained"
            );
        }
        summary
    }

    /// Run the drain loop in the background until `shutdown` fires.
    ///
    /// The worker subscribes to the queue and installs the queue's cancel
    /// handler; both wake it so newly queued entries start without polling.
    /// On shutdown the active download, if any, is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        let wake = Arc::new(Notify::new());

        let subscription = {
            let wake = Arc::clone(&wake);
            self.queue.subscribe(move |_| wake.notify_one())
        };
        {
            let wake = Arc::clone(&wake);
            self.queue.set_cancel_handler(move |id| {
                tracing::debug!(id, "download worker saw cancellation");
                wake.notify_one();
            });
        }

        tokio::spawn(async move {
            let _subscription = subscription;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.drain() => {}
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = wake.notified() => {}
                }
            }

            if let Some(id) = self.queue.current_download() {
                tracing::info!(id = %id, "cancelling active download on shutdown");
                self.queue.cancel_download(&id);
            }
            self.queue.clear_cancel_handler();
        })
    }

    async fn run_one(&self, claimed: ClaimedDownload) -> DownloadStatus {
        let ClaimedDownload { id, model_name, signal } = claimed;

        let progress: ProgressFn = {
            let queue = Arc::clone(&self.queue);
            let id = id.clone();
            let mut rate = LayerRate::default();
            let mut last_percent = 0.0;

            Box::new(move |event: FetchProgress| {
                if let Some(percent) = event.percentage() {
                    last_percent = percent;
                }
                let eta = rate.eta_at(Instant::now(), &event);
                let phase = event.phase.or_else(|| infer_phase(&event.status));

                let mut report = ProgressReport::new(last_percent, event.status).with_eta(eta);
                report.phase = phase;
                queue.report_progress(&id, report);
            })
        };

        let result = self.fetcher.fetch(&model_name, signal.clone(), progress).await;

        if signal.is_aborted() {
            // cancel_download already recorded the outcome.
            tracing::info!(id = %id, model = %model_name, "download stopped after cancellation");
            return DownloadStatus::Cancelled;
        }

        match result {
            Ok(()) => {
                self.queue.set_status(&id, DownloadStatus::Completed, None);
                tracing::info!(id = %id, model = %model_name, "download complete");
                DownloadStatus::Completed
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                tracing::warn!(id = %id, model = %model_name, error = %reason, "download failed");
                self.queue.set_status(&id, DownloadStatus::Failed, Some(reason));
                DownloadStatus::Failed
            }
        }
    }
}

/// Transfer rate for the layer currently being fetched.
///
/// Byte counts are per layer, so the clock restarts whenever the status line
/// (which names the layer digest) changes.
#[derive(Debug, Default)]
struct LayerRate {
    layer: Option<(String, RateTracker)>,
}

impl LayerRate {
    fn eta_at(&mut self, now: Instant, event: &FetchProgress) -> u64 {
        let Some(done) = event.completed else {
            return 0;
        };
        let same_layer = matches!(&self.layer, Some((status, _)) if *status == event.status);
        if !same_layer {
            self.layer = Some((event.status.clone(), RateTracker::started_at(now)));
        }
        let Some((_, tracker)) = &self.layer else {
            return 0;
        };
        tracker.sample_at(now, done, event.total).eta_seconds.unwrap_or(0)
    }
}
