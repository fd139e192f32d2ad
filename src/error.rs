// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types and user-facing error formatting.
//!
//! Coordinator operations almost never fail: unknown ids are silent no-ops
//! and failures travel as data (`status`, `error`). The few operations that
//! can reject input return the typed errors below. The CLI renders anything
//! that reaches it with [`format_error`].

use thiserror::Error;

/// Where users should report bugs.
pub const ISSUES_URL: &str = "https://github.com/jeranaias/weenus/issues";

/// Rejections from the download queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("model name must not be empty")]
    EmptyModelName,
}

/// Rejections from the streaming coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamingError {
    /// A stream is already running; cancel or end it before starting another.
    #[error("a response is already streaming for chat {chat_id}")]
    AlreadyStreaming { chat_id: String },
}

/// Format an error with possible causes and suggested fixes.
///
/// ```
/// use weenus::error::format_error;
///
/// let text = format_error(
///     "Cannot reach Ollama",
///     &["Ollama is not running"],
///     &["Start it with: ollama serve"],
/// );
/// assert!(text.contains("1. Start it with: ollama serve"));
/// ```
pub fn format_error(title: &str, causes: &[&str], fixes: &[&str]) -> String {
    let mut output = format!("[✗] {}\n\n", title);

    if !causes.is_empty() {
        output.push_str("Possible causes:\n");
        for cause in causes {
            output.push_str(&format!("  - {}\n", cause));
        }
        output.push('\n');
    }

    if !fixes.is_empty() {
        output.push_str("Try these fixes:\n");
        for (i, fix) in fixes.iter().enumerate() {
            output.push_str(&format!("  {}. {}\n", i + 1, fix));
        }
        output.push('\n');
    }

    output.push_str(&format!("Need help? {}", ISSUES_URL));
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_error_sections() {
        let text = format_error(
            "Download failed",
            &["Model tag does not exist", "Disk is full"],
            &["Check the tag on ollama.com/library"],
        );

        assert!(text.starts_with("[✗] Download failed"));
        assert!(text.contains("  - Model tag does not exist"));
        assert!(text.contains("  - Disk is full"));
        assert!(text.contains("  1. Check the tag on ollama.com/library"));
        assert!(text.ends_with(ISSUES_URL));
    }

    #[test]
    fn test_format_error_without_hints() {
        let text = format_error("Stream aborted", &[], &[]);
        assert!(!text.contains("Possible causes:"));
        assert!(!text.contains("Try these fixes:"));
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(QueueError::EmptyModelName.to_string(), "model name must not be empty");
        let err = StreamingError::AlreadyStreaming { chat_id: "chat-1".into() };
        assert!(err.to_string().contains("chat-1"));
    }
}
