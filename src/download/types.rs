// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download queue types.

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a queued download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Waiting in queue
    Pending,
    /// Transferring model data
    Downloading,
    /// Verifying / writing the model after transfer
    Processing,
    Completed,
    Failed,
    /// Stopped by the user
    Cancelled,
}

impl DownloadStatus {
    /// Completed, failed and cancelled entries only leave the queue by removal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Downloading or processing: the entry holds the single-flight slot.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Downloading | Self::Processing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase a driver reports alongside its progress text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadPhase {
    Downloading,
    Processing,
}

impl DownloadPhase {
    pub fn status(self) -> DownloadStatus {
        match self {
            Self::Downloading => DownloadStatus::Downloading,
            Self::Processing => DownloadStatus::Processing,
        }
    }
}

/// Derive a phase from free-form progress text.
///
/// [`DownloadQueue::update_progress`](super::DownloadQueue::update_progress)
/// applies it to every report, and the driver falls back to it when a fetch
/// event carries no phase. Callers that know their phase should send it in
/// [`ProgressReport::phase`] instead.
pub fn infer_phase(status_text: &str) -> Option<DownloadPhase> {
    let text = status_text.to_lowercase();
    if text.contains("downloading") {
        Some(DownloadPhase::Downloading)
    } else if text.contains("creating") || text.contains("processing") {
        Some(DownloadPhase::Processing)
    } else {
        None
    }
}

/// Clamp a percentage into `[0, 100]`. NaN becomes 0.
pub fn clamp_progress(progress: f64) -> f64 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 100.0)
    }
}

/// One progress update for a queue entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReport {
    /// Percentage; clamped by the queue.
    pub progress: f64,
    pub text: String,
    /// Seconds remaining, 0 when unknown.
    pub eta: u64,
    pub phase: Option<DownloadPhase>,
}

impl ProgressReport {
    pub fn new(progress: f64, text: impl Into<String>) -> Self {
        Self {
            progress,
            text: text.into(),
            eta: 0,
            phase: None,
        }
    }

    /// A report whose phase comes from [`infer_phase`] on its text.
    pub fn inferred(progress: f64, text: impl Into<String>, eta: u64) -> Self {
        let text = text.into();
        let phase = infer_phase(&text);
        Self { progress, text, eta, phase }
    }

    pub fn with_eta(mut self, eta: u64) -> Self {
        self.eta = eta;
        self
    }

    pub fn with_phase(mut self, phase: DownloadPhase) -> Self {
        self.phase = Some(phase);
        self
    }
}

/// Snapshot of one queue entry.
///
/// Listeners and [`DownloadQueue::queue`](super::DownloadQueue::queue) hand
/// out clones; changing one has no effect on the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedDownload {
    pub id: String,
    /// Model to fetch, including tag (e.g. "llama3:8b")
    pub model_name: String,
    pub status: DownloadStatus,
    /// 0-100
    pub progress: f64,
    pub progress_text: String,
    /// Seconds remaining, 0 when unknown
    pub eta: u64,
    /// Failure or cancellation reason
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set on the first move into downloading or processing
    pub started_at: Option<DateTime<Utc>>,
}

impl QueuedDownload {
    pub(crate) fn new(id: String, model_name: String) -> Self {
        Self {
            id,
            model_name,
            status: DownloadStatus::Pending,
            progress: 0.0,
            progress_text: "Queued".to_string(),
            eta: 0,
            error: None,
            created_at: Utc::now(),
            started_at: None,
        }
    }

    /// Formatted ETA, `None` when unknown.
    pub fn eta_string(&self) -> Option<String> {
        (self.eta > 0).then(|| format_eta(self.eta))
    }
}

/// Per-status totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Average transfer rate since a transfer started, for speed and ETA display.
#[derive(Debug, Clone, Copy)]
pub struct RateTracker {
    started: Instant,
}

/// Result of one [`RateTracker`] sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateSample {
    pub speed_bps: Option<u64>,
    pub eta_seconds: Option<u64>,
}

impl RateTracker {
    pub fn start() -> Self {
        Self::started_at(Instant::now())
    }

    pub fn started_at(started: Instant) -> Self {
        Self { started }
    }

    pub fn sample(&self, completed: u64, total: Option<u64>) -> RateSample {
        self.sample_at(Instant::now(), completed, total)
    }

    pub fn sample_at(&self, now: Instant, completed: u64, total: Option<u64>) -> RateSample {
        Self::sample_elapsed(now.saturating_duration_since(self.started), completed, total)
    }

    /// Rate and ETA for `completed` bytes after `elapsed`.
    pub fn sample_elapsed(elapsed: Duration, completed: u64, total: Option<u64>) -> RateSample {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return RateSample::default();
        }

        let speed = (completed as f64 / secs) as u64;
        let eta_seconds = match total {
            Some(total) if speed > 0 => {
                let remaining = total.saturating_sub(completed);
                Some((remaining as f64 / speed as f64) as u64)
            }
            _ => None,
        };

        RateSample {
            speed_bps: Some(speed),
            eta_seconds,
        }
    }
}

/// "12.5 MB/s" style speed.
pub fn format_speed(bps: u64) -> String {
    if bps >= 1_073_741_824 {
        format!("{:.1} GB/s", bps as f64 / 1_073_741_824.0)
    } else if bps >= 1_048_576 {
        format!("{:.1} MB/s", bps as f64 / 1_048_576.0)
    } else if bps >= 1024 {
        format!("{:.1} KB/s", bps as f64 / 1024.0)
    } else {
        format!("{} B/s", bps)
    }
}

/// "1h 5m" / "3m 20s" / "42s" style duration.
pub fn format_eta(secs: u64) -> String {
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classes() {
        assert!(DownloadStatus::Downloading.is_active());
        assert!(DownloadStatus::Processing.is_active());
        assert!(!DownloadStatus::Pending.is_active());

        for status in [DownloadStatus::Completed, DownloadStatus::Failed, DownloadStatus::Cancelled] {
            assert!(status.is_terminal());
            assert!(!status.is_active());
        }
        assert!(!DownloadStatus::Pending.is_terminal());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&DownloadStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
        assert_eq!(DownloadStatus::Processing.to_string(), "processing");
    }

    #[test]
    fn test_infer_phase_table() {
        assert_eq!(infer_phase("Downloading: 1.2GB / 8GB"), Some(DownloadPhase::Downloading));
        assert_eq!(infer_phase("DOWNLOADING model"), Some(DownloadPhase::Downloading));
        assert_eq!(infer_phase("Creating model in Ollama..."), Some(DownloadPhase::Processing));
        assert_eq!(infer_phase("processing layers"), Some(DownloadPhase::Processing));
        assert_eq!(infer_phase("Starting download..."), None);
        assert_eq!(infer_phase("Queued"), None);
        assert_eq!(infer_phase(""), None);
    }

    #[test]
    fn test_clamp_progress() {
        assert_eq!(clamp_progress(150.0), 100.0);
        assert_eq!(clamp_progress(-5.0), 0.0);
        assert_eq!(clamp_progress(42.5), 42.5);
        assert_eq!(clamp_progress(f64::NAN), 0.0);
        assert_eq!(clamp_progress(f64::INFINITY), 100.0);
    }

    #[test]
    fn test_progress_report_builders() {
        let report = ProgressReport::new(10.0, "pulling abc").with_eta(30).with_phase(DownloadPhase::Downloading);
        assert_eq!(report.eta, 30);
        assert_eq!(report.phase, Some(DownloadPhase::Downloading));

        let inferred = ProgressReport::inferred(99.0, "Creating model", 0);
        assert_eq!(inferred.phase, Some(DownloadPhase::Processing));
    }

    #[test]
    fn test_rate_sample() {
        let sample = RateTracker::sample_elapsed(Duration::from_secs(10), 1000, Some(3000));
        assert_eq!(sample.speed_bps, Some(100));
        assert_eq!(sample.eta_seconds, Some(20));

        let unknown_total = RateTracker::sample_elapsed(Duration::from_secs(2), 100, None);
        assert_eq!(unknown_total.speed_bps, Some(50));
        assert_eq!(unknown_total.eta_seconds, None);

        assert_eq!(RateTracker::sample_elapsed(Duration::ZERO, 100, Some(200)), RateSample::default());
    }

    #[test]
    fn test_formatting() {
        assert_eq!(format_speed(512), "512 B/s");
        assert_eq!(format_speed(2048), "2.0 KB/s");
        assert_eq!(format_speed(5 * 1_048_576), "5.0 MB/s");
        assert_eq!(format_eta(42), "42s");
        assert_eq!(format_eta(200), "3m 20s");
        assert_eq!(format_eta(3900), "1h 5m");
    }

    #[test]
    fn test_new_entry_defaults() {
        let entry = QueuedDownload::new("id-1".into(), "llama3:8b".into());
        assert_eq!(entry.status, DownloadStatus::Pending);
        assert_eq!(entry.progress, 0.0);
        assert_eq!(entry.progress_text, "Queued");
        assert!(entry.started_at.is_none());
        assert!(entry.eta_string().is_none());
    }
}
