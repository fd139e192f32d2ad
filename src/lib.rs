// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! weenus - chat with local models served by Ollama
//!
//! The library holds the coordination core of the client: a single-flight
//! queue for model downloads and a coordinator for the one chat response
//! that may be streaming at a time. Both are plain state containers with
//! observers; network work is done by drivers that read from and report
//! into them.
//!
//! **Queue** -> **Driver** -> **Ollama** and **Ollama** -> **Relay** -> **Coordinator**
//!
//! # Core Modules
//!
//! - [`download`] - Download queue, phase inference and the drain loop
//! - [`streaming`] - Streaming response coordinator and stream relay
//! - [`ollama`] - Async Ollama client (pull, chat, tags)
//! - [`notify`] - Listener sets and subscription handles
//! - [`cancel`] - Abort signals over cancellation tokens
//! - [`config`] - `~/.weenus/config.json`
//! - [`app`] - Application context that owns the coordinators
//! - [`error`] - Typed errors and CLI error formatting

pub mod app;
pub mod cancel;
pub mod config;
pub mod download;
pub mod error;
pub mod notify;
pub mod ollama;
pub mod streaming;
pub mod sync;
pub mod types;

pub use types::Message;

// Re-export the coordinators and their drivers
pub use app::AppContext;
pub use cancel::AbortSignal;
pub use config::AppConfig;
pub use download::{
    infer_phase, DownloadDriver, DownloadPhase, DownloadQueue, DownloadStatus, DrainSummary,
    ModelFetcher, ProgressReport, QueuedDownload,
};
pub use notify::Subscription;
pub use ollama::{ChatOptions, OllamaClient, OllamaError};
pub use streaming::{relay_stream, StreamOutcome, StreamingCoordinator, StreamingSnapshot};

// Re-export error utilities
pub use error::{format_error, QueueError, StreamingError, ISSUES_URL};
