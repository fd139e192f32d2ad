// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Single-flight download queue.
//!
//! [`DownloadQueue`] is the state container behind the model library's
//! download panel. It never talks to the network itself: a driver (see
//! [`super::driver`]) pulls work from it and reports progress back.
//!
//! All entries and the single-flight marker live behind one lock, so a status
//! change and the marker update it implies are observed together. At most one
//! entry is ever `Downloading` or `Processing`.

use std::sync::{Arc, RwLock};

use chrono::Utc;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use super::types::{
    clamp_progress, DownloadPhase, DownloadStatus, ProgressReport, QueueCounts, QueuedDownload,
};
use crate::cancel::AbortSignal;
use crate::error::QueueError;
use crate::notify::{ListenerSet, Subscription};
use crate::sync::{resilient_read, resilient_write};

/// Reason recorded on entries cancelled through [`DownloadQueue::cancel_download`].
pub const CANCELLED_BY_USER: &str = "Cancelled by user";

type CancelHandler = Arc<dyn Fn(&str) + Send + Sync>;

struct Entry {
    download: QueuedDownload,
    token: CancellationToken,
}

#[derive(Default)]
struct QueueInner {
    entries: Vec<Entry>,
    /// Id holding the single-flight slot
    current: Option<String>,
    /// Bumped on every mutation; orders snapshots for listeners
    version: u64,
}

impl QueueInner {
    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.download.id == id)
    }

    fn slot_free_for(&self, id: &str) -> bool {
        self.current.as_deref().map_or(true, |current| current == id)
    }

    fn release(&mut self, id: &str) {
        if self.current.as_deref() == Some(id) {
            self.current = None;
        }
    }

    fn snapshot(&self) -> Vec<QueuedDownload> {
        self.entries.iter().map(|e| e.download.clone()).collect()
    }
}

/// A pending entry that [`DownloadQueue::try_start_next`] moved into
/// `Downloading` on behalf of a driver.
#[derive(Debug, Clone)]
pub struct ClaimedDownload {
    pub id: String,
    pub model_name: String,
    /// Fires when the user cancels this entry.
    pub signal: AbortSignal,
}

/// Ordered queue of model downloads, processed one at a time.
pub struct DownloadQueue {
    inner: RwLock<QueueInner>,
    listeners: ListenerSet<[QueuedDownload]>,
    cancel_handler: RwLock<Option<CancelHandler>>,
}

impl DownloadQueue {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(QueueInner::default()),
            listeners: ListenerSet::new(),
            cancel_handler: RwLock::new(None),
        }
    }

    /// Register a listener that receives the full queue after every change.
    ///
    /// Listeners run after the queue lock is released and may call back into
    /// the queue. The snapshot from such a nested change reaches every
    /// listener once the current round of notifications is done.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&[QueuedDownload]) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    /// Install the callback run when the user cancels an entry.
    ///
    /// There is one slot: installing a handler replaces the previous one. The
    /// handler is called after the entry has been marked cancelled (or
    /// removed, if it never started).
    pub fn set_cancel_handler<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let previous = resilient_write(&self.cancel_handler).replace(Arc::new(handler));
        if previous.is_some() {
            tracing::warn!("replacing existing download cancel handler; only one consumer is supported");
        }
    }

    pub fn clear_cancel_handler(&self) {
        resilient_write(&self.cancel_handler).take();
    }

    /// Append a pending download for `model_name` and return its id.
    ///
    /// The same model may be queued more than once; each call gets its own
    /// entry.
    pub fn add_to_queue(&self, model_name: impl Into<String>) -> Result<String, QueueError> {
        let model_name = model_name.into();
        if model_name.trim().is_empty() {
            return Err(QueueError::EmptyModelName);
        }

        let id = Self::generate_id(&model_name);
        let entry = Entry {
            download: QueuedDownload::new(id.clone(), model_name.clone()),
            token: CancellationToken::new(),
        };

        self.mutate(|inner| {
            inner.entries.push(entry);
            Some(())
        });
        tracing::info!(id = %id, model = %model_name, "queued download");
        Ok(id)
    }

    /// Record progress reported as free text; the phase is inferred from the
    /// text with [`infer_phase`](super::types::infer_phase).
    pub fn update_progress(&self, id: &str, progress: f64, status_text: &str, eta: u64) {
        self.report_progress(id, ProgressReport::inferred(progress, status_text, eta));
    }

    /// Record progress with an explicit phase.
    ///
    /// Terminal entries ignore reports. A phase that would move a pending
    /// entry into an active status is only applied while the single-flight
    /// slot is free.
    pub fn report_progress(&self, id: &str, report: ProgressReport) {
        self.mutate(|inner| {
            let idx = inner.position(id)?;
            let slot_free = inner.slot_free_for(id);

            let entry = &mut inner.entries[idx].download;
            if entry.status.is_terminal() {
                tracing::debug!(id, status = %entry.status, "ignoring progress for finished download");
                return None;
            }

            entry.progress = clamp_progress(report.progress);
            entry.progress_text = report.text;
            entry.eta = report.eta;

            let mut claim = false;
            if let Some(phase) = report.phase {
                let allowed = matches!(
                    (entry.status, phase),
                    (DownloadStatus::Pending, _) | (DownloadStatus::Downloading, DownloadPhase::Processing)
                );
                if allowed {
                    if entry.status == DownloadStatus::Pending && !slot_free {
                        tracing::debug!(id, "another download holds the slot; staying pending");
                    } else {
                        entry.status = phase.status();
                        if entry.started_at.is_none() {
                            entry.started_at = Some(Utc::now());
                        }
                        claim = true;
                    }
                }
            }

            if claim {
                inner.current = Some(id.to_string());
            }
            Some(())
        });
    }

    /// Set an entry's status directly.
    ///
    /// Terminal entries are frozen. Moving into an active status claims the
    /// single-flight slot and is refused while another entry holds it; moving
    /// into a terminal status releases the slot.
    pub fn set_status(&self, id: &str, status: DownloadStatus, error: Option<String>) {
        let applied = self.mutate(|inner| {
            let idx = inner.position(id)?;
            let slot_free = inner.slot_free_for(id);

            let entry = &mut inner.entries[idx].download;
            if entry.status.is_terminal() {
                tracing::debug!(id, from = %entry.status, to = %status, "download already finished");
                return None;
            }
            if entry.status == status && error.is_none() {
                return None;
            }

            match status {
                DownloadStatus::Pending => {
                    // Active entries never go back to the queue; pending ones carry no error.
                    tracing::debug!(id, from = %entry.status, "refusing move back to pending");
                    return None;
                }
                s if s.is_active() => {
                    if !slot_free {
                        tracing::debug!(id, "another download holds the slot");
                        return None;
                    }
                    entry.status = s;
                    if entry.started_at.is_none() {
                        entry.started_at = Some(Utc::now());
                    }
                    inner.current = Some(id.to_string());
                }
                s => {
                    entry.status = s;
                    // Only failed and cancelled entries carry an error.
                    if s != DownloadStatus::Completed && error.is_some() {
                        entry.error = error;
                    }
                    inner.release(id);
                }
            }
            Some(status)
        });

        if let Some(status) = applied {
            tracing::debug!(id, %status, "download status set");
        }
    }

    /// Cancel an entry at the user's request.
    ///
    /// Fires the entry's cancellation token so its network transfer stops.
    /// An active entry becomes `Cancelled`; a pending one is removed outright.
    /// Then the installed cancel handler, if any, is told the id.
    pub fn cancel_download(&self, id: &str) {
        let token = resilient_read(&self.inner)
            .entries
            .iter()
            .find(|e| e.download.id == id)
            .map(|e| e.token.clone());
        let Some(token) = token else {
            tracing::debug!(id, "cancel for unknown download");
            return;
        };

        token.cancel();

        let outcome = self.mutate(|inner| {
            let idx = inner.position(id)?;
            let status = inner.entries[idx].download.status;
            match status {
                DownloadStatus::Pending => {
                    inner.entries.remove(idx);
                    Some("removed")
                }
                s if s.is_active() => {
                    let entry = &mut inner.entries[idx].download;
                    entry.status = DownloadStatus::Cancelled;
                    entry.error = Some(CANCELLED_BY_USER.to_string());
                    inner.release(id);
                    Some("cancelled")
                }
                _ => None,
            }
        });
        if let Some(outcome) = outcome {
            tracing::info!(id, outcome, "download cancelled by user");
        }

        let handler = resilient_read(&self.cancel_handler).clone();
        if let Some(handler) = handler {
            handler(id);
        }
    }

    /// Remove an entry regardless of status. Its token is cancelled so an
    /// in-flight transfer does not outlive it.
    pub fn remove_from_queue(&self, id: &str) {
        self.mutate(|inner| {
            let idx = inner.position(id)?;
            let entry = inner.entries.remove(idx);
            entry.token.cancel();
            inner.release(id);
            Some(())
        });
    }

    /// Remove every `Completed` entry. Failed and cancelled entries stay.
    pub fn clear_completed(&self) {
        self.mutate(|inner| {
            let before = inner.entries.len();
            inner.entries.retain(|e| e.download.status != DownloadStatus::Completed);
            (inner.entries.len() != before).then_some(())
        });
    }

    /// Atomically move the first pending entry into `Downloading`.
    ///
    /// Returns `None` when a download is already active or nothing is
    /// pending. This is the race-free way for a driver to take work.
    pub fn try_start_next(&self) -> Option<ClaimedDownload> {
        let claimed = self.mutate(|inner| {
            if inner.current.is_some() {
                return None;
            }
            let entry = inner
                .entries
                .iter_mut()
                .find(|e| e.download.status == DownloadStatus::Pending)?;

            entry.download.status = DownloadStatus::Downloading;
            entry.download.progress_text = "Starting download...".to_string();
            entry.download.started_at = Some(Utc::now());

            let claimed = ClaimedDownload {
                id: entry.download.id.clone(),
                model_name: entry.download.model_name.clone(),
                signal: AbortSignal::new(&entry.token),
            };
            inner.current = Some(claimed.id.clone());
            Some(claimed)
        });

        if let Some(ref claimed) = claimed {
            tracing::info!(id = %claimed.id, model = %claimed.model_name, "starting download");
        }
        claimed
    }

    pub fn is_downloading(&self) -> bool {
        resilient_read(&self.inner).current.is_some()
    }

    /// Id of the entry holding the single-flight slot.
    pub fn current_download(&self) -> Option<String> {
        resilient_read(&self.inner).current.clone()
    }

    /// Id of the first pending entry in insertion order.
    pub fn next_pending(&self) -> Option<String> {
        resilient_read(&self.inner)
            .entries
            .iter()
            .find(|e| e.download.status == DownloadStatus::Pending)
            .map(|e| e.download.id.clone())
    }

    /// Copy of the queue in insertion order.
    pub fn queue(&self) -> Vec<QueuedDownload> {
        resilient_read(&self.inner).snapshot()
    }

    pub fn get(&self, id: &str) -> Option<QueuedDownload> {
        let inner = resilient_read(&self.inner);
        inner.position(id).map(|idx| inner.entries[idx].download.clone())
    }

    /// Signal tied to an entry's cancellation token, for wiring into the
    /// network call that fetches it.
    pub fn abort_signal(&self, id: &str) -> Option<AbortSignal> {
        let inner = resilient_read(&self.inner);
        inner.position(id).map(|idx| AbortSignal::new(&inner.entries[idx].token))
    }

    pub fn counts(&self) -> QueueCounts {
        let inner = resilient_read(&self.inner);
        let mut counts = QueueCounts::default();
        for entry in &inner.entries {
            match entry.download.status {
                DownloadStatus::Pending => counts.pending += 1,
                DownloadStatus::Downloading | DownloadStatus::Processing => counts.active += 1,
                DownloadStatus::Completed => counts.completed += 1,
                DownloadStatus::Failed => counts.failed += 1,
                DownloadStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        resilient_read(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply `change` under the lock. When it reports a change (`Some`), the
    /// new snapshot is published to listeners after the lock is released.
    fn mutate<R>(&self, change: impl FnOnce(&mut QueueInner) -> Option<R>) -> Option<R> {
        let (result, published) = {
            let mut inner = resilient_write(&self.inner);
            match change(&mut inner) {
                Some(result) => {
                    inner.version += 1;
                    (Some(result), Some((inner.version, inner.snapshot())))
                }
                None => (None, None),
            }
        };

        if let Some((version, snapshot)) = published {
            self.listeners.emit_versioned(version, snapshot.into_boxed_slice());
        }
        result
    }

    fn generate_id(model_name: &str) -> String {
        let suffix: u32 = rand::thread_rng().gen();
        format!("{}-{}-{:08x}", model_name, Utc::now().timestamp_millis(), suffix)
    }
}

impl Default for DownloadQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DownloadQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = resilient_read(&self.inner);
        f.debug_struct("DownloadQueue")
            .field("entries", &inner.entries.len())
            .field("current", &inner.current)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
