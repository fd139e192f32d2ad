// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Application-wide record of the in-flight chat response.
//!
//! The chat view, the sidebar and the stop button all read this state. The
//! task that owns the model stream writes to it and watches the abort signal
//! handed out by [`StreamingCoordinator::start_streaming`].

use std::sync::RwLock;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::cancel::AbortSignal;
use crate::error::StreamingError;
use crate::notify::{ListenerSet, Subscription};
use crate::sync::{resilient_read, resilient_write};

/// Copy of the streaming state handed to listeners.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamingSnapshot {
    pub is_streaming: bool,
    /// Chat receiving the response; `Some` exactly while streaming
    pub chat_id: Option<String>,
    /// Text accumulated so far
    pub current_response: String,
}

#[derive(Default)]
struct StreamInner {
    state: StreamingSnapshot,
    token: Option<CancellationToken>,
    version: u64,
    /// Bumped on every start; identifies the stream a chunk belongs to
    generation: u64,
}

impl StreamInner {
    /// Back to idle. Returns the token that was live, if any.
    fn clear(&mut self) -> Option<CancellationToken> {
        self.state = StreamingSnapshot::default();
        self.token.take()
    }
}

/// Tracks at most one streaming response at a time.
pub struct StreamingCoordinator {
    inner: RwLock<StreamInner>,
    listeners: ListenerSet<StreamingSnapshot>,
}

impl StreamingCoordinator {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StreamInner::default()),
            listeners: ListenerSet::new(),
        }
    }

    /// Register `listener` under `key`.
    ///
    /// Subscribing again with the same key replaces the earlier listener, so
    /// a view that re-mounts does not receive every update twice. Dropping
    /// the replaced [`Subscription`] leaves its successor in place.
    ///
    /// Listeners may call back into the coordinator, for example to end the
    /// stream when a stop sequence shows up.
    pub fn subscribe<F>(&self, key: impl Into<String>, listener: F) -> Subscription
    where
        F: Fn(&StreamingSnapshot) + Send + Sync + 'static,
    {
        self.listeners.subscribe_keyed(key, listener)
    }

    /// Begin streaming a response for `chat_id`.
    ///
    /// Fails if a response is already streaming; the caller should stop it
    /// first. The returned signal fires when the stream is cancelled or
    /// reset.
    pub fn start_streaming(&self, chat_id: impl Into<String>) -> Result<AbortSignal, StreamingError> {
        self.begin(chat_id).map(|(signal, _)| signal)
    }

    /// [`start_streaming`](Self::start_streaming) that also returns the
    /// stream's generation, for owners that write through the
    /// generation-checked methods below.
    pub(crate) fn begin(&self, chat_id: impl Into<String>) -> Result<(AbortSignal, u64), StreamingError> {
        let chat_id = chat_id.into();
        let mut active = None;

        let started = self.mutate(|inner| {
            if let Some(current) = &inner.state.chat_id {
                active = Some(current.clone());
                return None;
            }
            let token = CancellationToken::new();
            let signal = AbortSignal::new(&token);
            inner.token = Some(token);
            inner.generation += 1;
            inner.state = StreamingSnapshot {
                is_streaming: true,
                chat_id: Some(chat_id.clone()),
                current_response: String::new(),
            };
            Some((signal, inner.generation))
        });

        match started {
            Some(started) => {
                tracing::info!(chat_id = %chat_id, generation = started.1, "streaming started");
                Ok(started)
            }
            None => {
                let err = StreamingError::AlreadyStreaming {
                    chat_id: active.unwrap_or_default(),
                };
                tracing::debug!(requested = %chat_id, error = %err, "refusing to start second stream");
                Err(err)
            }
        }
    }

    /// Append a chunk of the response. Ignored when nothing is streaming.
    pub fn append_response(&self, chunk: &str) {
        if !self.push_chunk(None, chunk) {
            tracing::debug!(len = chunk.len(), "dropping chunk appended while idle");
        }
    }

    /// Append only if stream `generation` is still the live one. A chunk from
    /// a stream that was stopped (and maybe replaced) is dropped.
    pub(crate) fn append_to(&self, generation: u64, chunk: &str) -> bool {
        let applied = self.push_chunk(Some(generation), chunk);
        if !applied {
            tracing::debug!(generation, len = chunk.len(), "dropping chunk from stale stream");
        }
        applied
    }

    /// End stream `generation` if it is still the live one.
    pub(crate) fn end_if_current(&self, generation: u64) {
        let ended = self.mutate(|inner| {
            if !inner.state.is_streaming || inner.generation != generation {
                return None;
            }
            inner.clear();
            Some(())
        });
        if ended.is_some() {
            tracing::info!("streaming ended");
        }
    }

    /// Reset if stream `generation` is still the live one.
    pub(crate) fn reset_if_current(&self, generation: u64) {
        let reset = self.mutate(|inner| {
            if !inner.state.is_streaming || inner.generation != generation {
                return None;
            }
            if let Some(token) = inner.clear() {
                token.cancel();
            }
            Some(())
        });
        if reset.is_some() {
            tracing::debug!(generation, "streaming state reset after failure");
        }
    }

    /// Finish normally: back to idle without firing the abort signal.
    ///
    /// Does nothing (and notifies nobody) if already idle.
    pub fn end_streaming(&self) {
        let ended = self.mutate(|inner| {
            if !inner.state.is_streaming {
                return None;
            }
            inner.clear();
            Some(())
        });
        if ended.is_some() {
            tracing::info!("streaming ended");
        }
    }

    /// Stop at the user's request: fire the abort signal, then go idle.
    pub fn cancel_streaming(&self) {
        let cancelled = self.mutate(|inner| {
            if let Some(token) = &inner.token {
                token.cancel();
            }
            if !inner.state.is_streaming {
                return None;
            }
            let chat_id = inner.state.chat_id.clone();
            inner.clear();
            chat_id
        });
        if let Some(chat_id) = cancelled {
            tracing::info!(chat_id = %chat_id, "streaming cancelled");
        }
    }

    /// Force idle from any state. Fires the abort signal if a stream was
    /// live and always notifies.
    pub fn reset(&self) {
        self.mutate(|inner| {
            if let Some(token) = inner.clear() {
                token.cancel();
            }
            Some(())
        });
        tracing::debug!("streaming state reset");
    }

    pub fn is_streaming(&self) -> bool {
        resilient_read(&self.inner).state.is_streaming
    }

    pub fn response(&self) -> String {
        resilient_read(&self.inner).state.current_response.clone()
    }

    pub fn chat_id(&self) -> Option<String> {
        resilient_read(&self.inner).state.chat_id.clone()
    }

    /// Abort signal of the live stream, `None` when idle.
    pub fn abort_signal(&self) -> Option<AbortSignal> {
        resilient_read(&self.inner).token.as_ref().map(AbortSignal::new)
    }

    pub fn state(&self) -> StreamingSnapshot {
        resilient_read(&self.inner).state.clone()
    }

    fn push_chunk(&self, generation: Option<u64>, chunk: &str) -> bool {
        self.mutate(|inner| {
            let current = generation.map_or(true, |g| g == inner.generation);
            if !inner.state.is_streaming || !current {
                return None;
            }
            inner.state.current_response.push_str(chunk);
            Some(())
        })
        .is_some()
    }

    /// Run `change` under the lock. When it reports a change (`Some`), the
    /// new snapshot is published after the lock is released.
    fn mutate<R>(&self, change: impl FnOnce(&mut StreamInner) -> Option<R>) -> Option<R> {
        let (result, published) = {
            let mut inner = resilient_write(&self.inner);
            match change(&mut inner) {
                Some(result) => {
                    inner.version += 1;
                    (Some(result), Some((inner.version, inner.state.clone())))
                }
                None => (None, None),
            }
        };

        if let Some((version, snapshot)) = published {
            self.listeners.emit_versioned(version, Box::new(snapshot));
        }
        result
    }
}

impl Default for StreamingCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StreamingCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = resilient_read(&self.inner);
        f.debug_struct("StreamingCoordinator")
            .field("is_streaming", &inner.state.is_streaming)
            .field("chat_id", &inner.state.chat_id)
            .field("response_len", &inner.state.current_response.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder(coord: &StreamingCoordinator, key: &str) -> (Arc<Mutex<Vec<StreamingSnapshot>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sub = {
            let seen = Arc::clone(&seen);
            coord.subscribe(key, move |s| seen.lock().unwrap().push(s.clone()))
        };
        (seen, sub)
    }

    fn assert_invariant(s: &StreamingSnapshot) {
        assert_eq!(s.chat_id.is_some(), s.is_streaming, "chat id must track streaming: {:?}", s);
    }

    #[test]
    fn test_stream_then_end() {
        let coord = StreamingCoordinator::new();
        let (seen, _sub) = recorder(&coord, "chat-view");

        let signal = coord.start_streaming("c1").unwrap();
        coord.append_response("Hel");
        coord.append_response("lo");
        assert_eq!(coord.response(), "Hello");
        coord.end_streaming();

        assert!(!signal.is_aborted());
        assert_eq!(coord.state(), StreamingSnapshot::default());
        assert!(coord.abort_signal().is_none());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[2].current_response, "Hello");
        assert_eq!(seen[2].chat_id.as_deref(), Some("c1"));
        seen.iter().for_each(assert_invariant);
    }

    #[test]
    fn test_cancel_fires_signal_and_goes_idle() {
        let coord = StreamingCoordinator::new();
        let (seen, _sub) = recorder(&coord, "chat-view");

        let signal = coord.start_streaming("c1").unwrap();
        coord.append_response("partial");
        coord.cancel_streaming();

        assert!(signal.is_aborted());
        assert!(!coord.is_streaming());
        assert_eq!(coord.response(), "");
        assert!(coord.chat_id().is_none());
        let last = seen.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last, StreamingSnapshot::default());
    }

    #[test]
    fn test_second_start_is_refused() {
        let coord = StreamingCoordinator::new();
        let first = coord.start_streaming("c1").unwrap();
        coord.append_response("abc");

        let err = coord.start_streaming("c2").unwrap_err();
        assert_eq!(err, StreamingError::AlreadyStreaming { chat_id: "c1".into() });

        // The live stream is untouched.
        assert!(!first.is_aborted());
        assert_eq!(coord.chat_id().as_deref(), Some("c1"));
        assert_eq!(coord.response(), "abc");
    }

    #[test]
    fn test_restart_after_end_gets_fresh_signal() {
        let coord = StreamingCoordinator::new();
        let first = coord.start_streaming("c1").unwrap();
        coord.cancel_streaming();

        let second = coord.start_streaming("c1").unwrap();
        assert!(first.is_aborted());
        assert!(!second.is_aborted());
        assert_eq!(coord.response(), "");
    }

    #[test]
    fn test_append_while_idle_is_ignored() {
        let coord = StreamingCoordinator::new();
        let (seen, _sub) = recorder(&coord, "k");
        coord.append_response("stray");
        assert_eq!(coord.response(), "");
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_empty_chunk_still_notifies() {
        let coord = StreamingCoordinator::new();
        let _ = coord.start_streaming("c1").unwrap();
        let (seen, _sub) = recorder(&coord, "k");
        coord.append_response("");
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(coord.response(), "");
    }

    #[test]
    fn test_end_and_cancel_are_idempotent() {
        let coord = StreamingCoordinator::new();
        let (seen, _sub) = recorder(&coord, "k");

        coord.end_streaming();
        coord.cancel_streaming();
        assert!(seen.lock().unwrap().is_empty());

        let _ = coord.start_streaming("c1").unwrap();
        coord.end_streaming();
        coord.end_streaming();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_reset_always_notifies() {
        let coord = StreamingCoordinator::new();
        let (seen, _sub) = recorder(&coord, "k");

        coord.reset();
        assert_eq!(seen.lock().unwrap().len(), 1);

        let signal = coord.start_streaming("c9").unwrap();
        coord.reset();
        assert!(signal.is_aborted());
        assert_eq!(seen.lock().unwrap().len(), 3);
        assert_eq!(coord.state(), StreamingSnapshot::default());
    }

    #[test]
    fn test_keyed_subscribe_replaces_listener() {
        let coord = StreamingCoordinator::new();
        let (old, old_sub) = recorder(&coord, "chat-view");
        let (new, _new_sub) = recorder(&coord, "chat-view");
        let (other, _other_sub) = recorder(&coord, "sidebar");

        drop(old_sub);
        let _ = coord.start_streaming("c1").unwrap();

        assert!(old.lock().unwrap().is_empty());
        assert_eq!(new.lock().unwrap().len(), 1);
        assert_eq!(other.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_abort_signal_tracks_live_stream() {
        let coord = StreamingCoordinator::new();
        assert!(coord.abort_signal().is_none());

        let _ = coord.start_streaming("c1").unwrap();
        let observed = coord.abort_signal().unwrap();
        coord.cancel_streaming();
        assert!(observed.is_aborted());
    }

    #[test]
    fn test_listener_can_end_stream_on_stop_sequence() {
        let coord = Arc::new(StreamingCoordinator::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let seen = Arc::clone(&seen);
            let inner = Arc::downgrade(&coord);
            coord.subscribe("stop-watcher", move |s| {
                seen.lock().unwrap().push(s.clone());
                if s.current_response.ends_with("<eos>") {
                    if let Some(coord) = inner.upgrade() {
                        coord.end_streaming();
                    }
                }
            })
        };

        let signal = coord.start_streaming("c1").unwrap();
        coord.append_response("done");
        coord.append_response("<eos>");

        assert!(!coord.is_streaming());
        assert!(!signal.is_aborted());
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[2].current_response, "done<eos>");
        assert_eq!(seen[3], StreamingSnapshot::default());
    }

    #[test]
    fn test_stale_generation_cannot_touch_next_stream() {
        let coord = StreamingCoordinator::new();

        let (old_signal, old) = coord.begin("c1").unwrap();
        assert!(coord.append_to(old, "a"));
        coord.cancel_streaming();
        assert!(old_signal.is_aborted());

        let (new_signal, new) = coord.begin("c2").unwrap();
        assert_ne!(old, new);
        assert!(!coord.append_to(old, "late"));
        coord.end_if_current(old);
        coord.reset_if_current(old);

        assert!(coord.is_streaming());
        assert!(!new_signal.is_aborted());
        assert_eq!(coord.chat_id().as_deref(), Some("c2"));
        assert_eq!(coord.response(), "");

        // Ended normally, then replaced: the old owner still cannot write.
        coord.end_if_current(new);
        let (_third_signal, third) = coord.begin("c3").unwrap();
        assert!(!coord.append_to(new, "late"));
        assert!(coord.append_to(third, "ok"));
        assert_eq!(coord.response(), "ok");
    }
}
