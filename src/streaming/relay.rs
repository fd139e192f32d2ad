// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Stream owner: pumps model output into the coordinator.

use std::future::Future;

use futures_util::{Stream, StreamExt};

use super::coordinator::StreamingCoordinator;
use crate::cancel::AbortSignal;

/// How a relayed stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The model finished; full response text.
    Completed(String),
    /// The stream was cancelled; whatever arrived before that.
    Cancelled { partial: String },
}

impl StreamOutcome {
    pub fn text(&self) -> &str {
        match self {
            Self::Completed(text) => text,
            Self::Cancelled { partial } => partial,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Start streaming for `chat_id` and relay chunks until the stream ends or
/// the coordinator's abort signal fires.
///
/// `make_stream` receives the abort signal so the request it opens can be
/// torn down with the stream. Chunks are appended in arrival order and only
/// while this stream is still the live one, so a chunk that races a cancel
/// never lands in the next response. If something else ends the stream
/// (a listener that spots a stop sequence, say) the relay stops reading and
/// returns what was applied. On a transport error the coordinator is reset
/// and the error returned.
pub async fn relay_stream<F, Fut, S>(
    coordinator: &StreamingCoordinator,
    chat_id: &str,
    make_stream: F,
) -> anyhow::Result<StreamOutcome>
where
    F: FnOnce(AbortSignal) -> Fut,
    Fut: Future<Output = anyhow::Result<S>>,
    S: Stream<Item = anyhow::Result<String>>,
{
    let (signal, generation) = coordinator.begin(chat_id)?;

    let opened = tokio::select! {
        biased;
        _ = signal.aborted() => {
            return Ok(StreamOutcome::Cancelled { partial: String::new() });
        }
        opened = make_stream(signal.clone()) => opened,
    };
    let stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            coordinator.reset_if_current(generation);
            return Err(e.context("failed to open response stream"));
        }
    };
    tokio::pin!(stream);

    let mut text = String::new();
    loop {
        tokio::select! {
            biased;
            _ = signal.aborted() => break,
            next = stream.next() => match next {
                Some(Ok(chunk)) => {
                    if !coordinator.append_to(generation, &chunk) {
                        if signal.is_aborted() {
                            break;
                        }
                        tracing::debug!(chat_id, received = text.len(), "response stream ended elsewhere");
                        return Ok(StreamOutcome::Completed(text));
                    }
                    text.push_str(&chunk);
                }
                Some(Err(e)) => {
                    tracing::warn!(chat_id, error = %e, received = text.len(), "response stream failed");
                    coordinator.reset_if_current(generation);
                    return Err(e);
                }
                None => break,
            },
        }
    }

    if signal.is_aborted() {
        tracing::info!(chat_id, received = text.len(), "response stream stopped");
        return Ok(StreamOutcome::Cancelled { partial: text });
    }

    coordinator.end_if_current(generation);
    Ok(StreamOutcome::Completed(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamingError;
    use anyhow::anyhow;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    fn chunks(parts: &[&str]) -> Vec<anyhow::Result<String>> {
        parts.iter().map(|p| Ok(p.to_string())).collect()
    }

    #[tokio::test]
    async fn test_relay_completes_in_order() {
        let coord = StreamingCoordinator::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let seen = Arc::clone(&seen);
            coord.subscribe("chat-view", move |s| seen.lock().unwrap().push(s.current_response.clone()))
        };

        let outcome = relay_stream(&coord, "c1", |_signal| async {
            anyhow::Ok(tokio_stream::iter(chunks(&["Hel", "lo", " world"])))
        })
        .await
        .unwrap();

        assert_eq!(outcome, StreamOutcome::Completed("Hello world".into()));
        assert!(!coord.is_streaming());
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["", "Hel", "Hello", "Hello world", ""]
        );
    }

    #[tokio::test]
    async fn test_relay_returns_partial_on_cancel() {
        let coord = Arc::new(StreamingCoordinator::new());
        let (tx, rx) = mpsc::unbounded_channel::<anyhow::Result<String>>();

        let relay = {
            let coord = Arc::clone(&coord);
            tokio::spawn(async move {
                relay_stream(&coord, "c1", |_signal| async move { anyhow::Ok(UnboundedReceiverStream::new(rx)) }).await
            })
        };

        tx.send(Ok("Once upon".into())).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while coord.response() != "Once upon" {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("first chunk never arrived");

        coord.cancel_streaming();
        let outcome = tokio::time::timeout(Duration::from_secs(2), relay)
            .await
            .expect("relay did not stop")
            .unwrap()
            .unwrap();

        assert_eq!(outcome, StreamOutcome::Cancelled { partial: "Once upon".into() });
        assert!(outcome.is_cancelled());
        assert!(!coord.is_streaming());
        // Sender outlives the relay; the abort signal alone stopped it.
        drop(tx);
    }

    #[tokio::test]
    async fn test_relay_resets_on_transport_error() {
        let coord = StreamingCoordinator::new();
        let items = vec![Ok("partial".to_string()), Err(anyhow!("connection reset"))];

        let err = relay_stream(&coord, "c1", |_signal| async move { anyhow::Ok(tokio_stream::iter(items)) })
            .await
            .unwrap_err();

        assert!(err.to_string().contains("connection reset"));
        assert!(!coord.is_streaming());
        assert_eq!(coord.response(), "");
    }

    #[tokio::test]
    async fn test_relay_open_failure_resets() {
        let coord = StreamingCoordinator::new();
        let result = relay_stream(&coord, "c1", |_signal| async {
            Err::<tokio_stream::Iter<std::vec::IntoIter<anyhow::Result<String>>>, _>(anyhow!("model not found"))
        })
        .await;

        let err = result.unwrap_err();
        assert!(format!("{:#}", err).contains("model not found"));
        assert!(!coord.is_streaming());
    }

    #[tokio::test]
    async fn test_relay_refuses_while_streaming() {
        let coord = StreamingCoordinator::new();
        let live = coord.start_streaming("c1").unwrap();

        let err = relay_stream(&coord, "c2", |_signal| async { anyhow::Ok(tokio_stream::iter(chunks(&["x"]))) })
            .await
            .unwrap_err();

        assert_eq!(
            err.downcast_ref::<StreamingError>(),
            Some(&StreamingError::AlreadyStreaming { chat_id: "c1".into() })
        );
        assert!(!live.is_aborted());
        assert_eq!(coord.chat_id().as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_relay_stops_when_listener_ends_stream() {
        let coord = Arc::new(StreamingCoordinator::new());
        let _sub = {
            let inner = Arc::downgrade(&coord);
            coord.subscribe("stop-watcher", move |s| {
                if s.current_response.ends_with("<eos>") {
                    if let Some(coord) = inner.upgrade() {
                        coord.end_streaming();
                    }
                }
            })
        };

        let outcome = relay_stream(&coord, "c1", |_signal| async {
            anyhow::Ok(tokio_stream::iter(chunks(&["yes", "<eos>", "trailing"])))
        })
        .await
        .unwrap();

        assert_eq!(outcome, StreamOutcome::Completed("yes<eos>".into()));
        assert!(!coord.is_streaming());

        // The next stream starts clean.
        let next = relay_stream(&coord, "c2", |_signal| async { anyhow::Ok(tokio_stream::iter(chunks(&["ok"]))) })
            .await
            .unwrap();
        assert_eq!(next, StreamOutcome::Completed("ok".into()));
    }
}
