// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Streaming chat responses.
//!
//! [`StreamingCoordinator`] holds the one response that may be streaming at
//! any time and tells subscribed views about every change.
//! [`relay_stream`] is the stream owner: it opens the model stream, feeds
//! chunks into the coordinator and stops when the user cancels.

pub mod coordinator;
pub mod relay;

pub use coordinator::{StreamingCoordinator, StreamingSnapshot};
pub use relay::{relay_stream, StreamOutcome};
