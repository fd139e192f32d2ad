// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cooperative cancellation.
//!
//! Both coordinators own a [`CancellationToken`] per unit of work. Network
//! code only ever sees an [`AbortSignal`], a read-only view of that token: it
//! can observe cancellation but cannot trigger it. Cancellation is advisory;
//! the owning task notices it at its next `select!` or explicit check.

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture, WaitForCancellationFutureOwned};

/// Observe-only handle to a cancellation token.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    token: CancellationToken,
}

impl AbortSignal {
    pub(crate) fn new(token: &CancellationToken) -> Self {
        Self { token: token.clone() }
    }

    /// A signal that is never aborted, for callers that run work outside a
    /// coordinator.
    pub fn never() -> Self {
        Self { token: CancellationToken::new() }
    }

    /// True once the owner has requested cancellation.
    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the owner requests cancellation.
    pub fn aborted(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Owned form of [`AbortSignal::aborted`] for `'static` streams.
    pub fn into_aborted(self) -> WaitForCancellationFutureOwned {
        self.token.cancelled_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_signal_reflects_token() {
        let token = CancellationToken::new();
        let signal = AbortSignal::new(&token);
        assert!(!signal.is_aborted());

        token.cancel();
        assert!(signal.is_aborted());
        // Clones taken before or after share the same state.
        assert!(signal.clone().is_aborted());
    }

    #[test]
    fn test_never_signal() {
        assert!(!AbortSignal::never().is_aborted());
    }

    #[tokio::test]
    async fn test_aborted_future_wakes_waiter() {
        let token = CancellationToken::new();
        let signal = AbortSignal::new(&token);

        let waiter = tokio::spawn(async move {
            signal.aborted().await;
            true
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        let woke = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake after cancel")
            .expect("waiter task panicked");
        assert!(woke);
    }
}
