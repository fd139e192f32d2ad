// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Model download queue for weenus
//!
//! This module provides serialized model downloads with:
//! - One active download at a time, the rest waiting in FIFO order
//! - Observable snapshots for progress bars and status lines
//! - Per-entry cancellation that reaches the in-flight request
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │ DownloadQueue   │◀────│ DownloadDriver  │
//! │ (state, slot)   │     │ (drain loop)    │
//! └────────┬────────┘     └────────┬────────┘
//!          │                       │
//!          ▼                       ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ Subscribers     │     │ ModelFetcher    │
//! │ (snapshots)     │     │ (OllamaClient)  │
//! └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use weenus::download::{DownloadDriver, DownloadQueue};
//! use weenus::ollama::OllamaClient;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let queue = Arc::new(DownloadQueue::new());
//! let fetcher = Arc::new(OllamaClient::new());
//!
//! // Watch progress
//! let _sub = queue.subscribe(|snapshot| {
//!     for entry in snapshot {
//!         println!("{} {} {:.0}%", entry.model_name, entry.status, entry.progress);
//!     }
//! });
//!
//! // Start the worker, then queue downloads
//! let shutdown = CancellationToken::new();
//! let worker = DownloadDriver::new(Arc::clone(&queue), fetcher).spawn(shutdown.clone());
//! queue.add_to_queue("qwen2.5-coder:7b")?;
//! # shutdown.cancel();
//! # worker.await?;
//! # Ok(())
//! # }
//! ```

pub mod driver;
pub mod queue;
pub mod types;

// Re-export commonly used items
pub use driver::{
    DownloadDriver, DrainSummary, FetchFuture, FetchProgress, ModelFetcher, ProgressFn,
    DEFAULT_SETTLE_DELAY,
};
pub use queue::{ClaimedDownload, DownloadQueue, CANCELLED_BY_USER};
pub use types::{
    format_eta, format_speed, infer_phase, DownloadPhase, DownloadStatus, ProgressReport,
    QueueCounts, QueuedDownload, RateSample, RateTracker,
};
