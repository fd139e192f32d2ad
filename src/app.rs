// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Application context: the one place the coordinators are created.
//!
//! Views and commands receive an [`AppContext`] (or the `Arc`s inside it)
//! instead of reaching for process-wide singletons, so tests can build as
//! many isolated contexts as they like.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::download::{DownloadDriver, DownloadQueue, ModelFetcher};
use crate::ollama::OllamaClient;
use crate::streaming::StreamingCoordinator;

#[derive(Debug, Clone)]
pub struct AppContext {
    pub config: AppConfig,
    pub downloads: Arc<DownloadQueue>,
    pub streaming: Arc<StreamingCoordinator>,
    pub ollama: Arc<OllamaClient>,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        let ollama = Arc::new(OllamaClient::with_url(config.ollama_url.as_str()));
        Self {
            config,
            downloads: Arc::new(DownloadQueue::new()),
            streaming: Arc::new(StreamingCoordinator::new()),
            ollama,
        }
    }

    /// Driver that pulls queued models through this context's Ollama client.
    pub fn download_driver(&self) -> DownloadDriver {
        self.download_driver_with(Arc::clone(&self.ollama) as Arc<dyn ModelFetcher>)
    }

    /// Driver over this context's queue using another fetcher.
    pub fn download_driver_with(&self, fetcher: Arc<dyn ModelFetcher>) -> DownloadDriver {
        DownloadDriver::new(Arc::clone(&self.downloads), fetcher).with_settle_delay(self.config.settle_delay())
    }

    /// Stop the streaming response and the active download, if any.
    ///
    /// Returns true if something was running.
    pub fn cancel_all(&self) -> bool {
        let mut cancelled = false;

        if self.streaming.is_streaming() {
            self.streaming.cancel_streaming();
            cancelled = true;
        }
        if let Some(id) = self.downloads.current_download() {
            self.downloads.cancel_download(&id);
            cancelled = true;
        }

        if cancelled {
            tracing::info!("cancelled in-flight work");
        }
        cancelled
    }
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new(AppConfig::default())
    }
}
