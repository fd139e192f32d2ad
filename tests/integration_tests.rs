//! Integration tests for weenus against a live Ollama server
//!
//! These tests drive the download queue and the streaming coordinator
//! through a real Ollama instance. They are marked with #[ignore] so they
//! don't run in CI without a server running.
//!
//! To run these tests:
//! 1. Start Ollama: ollama serve
//! 2. Run tests with: cargo test --test integration_tests -- --ignored
//!
//! `WEENUS_TEST_MODEL` selects the model (default: a small one).

use std::time::Duration;

use tokio::time::timeout;

use weenus::download::DownloadStatus;
use weenus::ollama::ChatOptions;
use weenus::{relay_stream, AppConfig, AppContext, Message, OllamaError, StreamOutcome};

fn test_model() -> String {
    std::env::var("WEENUS_TEST_MODEL").unwrap_or_else(|_| "qwen2.5:0.5b".to_string())
}

fn context() -> AppContext {
    AppContext::new(AppConfig {
        settle_delay_ms: 0,
        ..AppConfig::default()
    })
}

// =============================================================================
// Server Tests
// =============================================================================

#[tokio::test]
#[ignore]
async fn test_server_is_running() -> Result<(), Box<dyn std::error::Error>> {
    let ctx = context();
    assert!(ctx.ollama.is_running().await, "Ollama must be running on {}", ctx.ollama.base_url());

    let models = ctx.ollama.list_models_detailed().await?;
    for model in &models {
        assert!(!model.name.is_empty());
    }
    Ok(())
}

// =============================================================================
// Download Queue Tests
// =============================================================================

#[tokio::test]
#[ignore]
async fn test_pull_through_queue() -> Result<(), Box<dyn std::error::Error>> {
    let ctx = context();
    let id = ctx.downloads.add_to_queue(test_model())?;

    let summary = timeout(Duration::from_secs(1800), ctx.download_driver().drain()).await?;
    assert_eq!(summary.completed, 1, "pull failed: {:?}", ctx.downloads.get(&id));

    let entry = ctx.downloads.get(&id).expect("entry kept after completion");
    assert_eq!(entry.status, DownloadStatus::Completed);
    assert!(ctx.ollama.has_model(&test_model()).await?);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_pull_unknown_model_fails() -> Result<(), Box<dyn std::error::Error>> {
    let ctx = context();
    let id = ctx.downloads.add_to_queue("weenus-does-not-exist:0b")?;

    let summary = timeout(Duration::from_secs(60), ctx.download_driver().drain()).await?;
    assert_eq!(summary.failed, 1);

    let entry = ctx.downloads.get(&id).expect("failed entry kept");
    assert_eq!(entry.status, DownloadStatus::Failed);
    assert!(entry.error.is_some());
    Ok(())
}

// =============================================================================
// Streaming Tests
// =============================================================================

#[tokio::test]
#[ignore]
async fn test_chat_stream_completes() -> Result<(), Box<dyn std::error::Error>> {
    let ctx = context();
    let model = test_model();
    let messages = vec![Message::user("Reply with the single word: pong")];
    let options = ChatOptions {
        temperature: Some(0.0),
        seed: Some(7),
        num_predict: Some(16),
        ..ChatOptions::default()
    };

    let outcome = timeout(
        Duration::from_secs(120),
        relay_stream(&ctx.streaming, "it-chat", |signal| {
            ctx.ollama.chat_stream(&model, &messages, &options, signal)
        }),
    )
    .await??;

    match outcome {
        StreamOutcome::Completed(text) => assert!(!text.is_empty()),
        other => panic!("expected completion, got {:?}", other),
    }
    assert!(!ctx.streaming.is_streaming());
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_chat_stream_cancel_keeps_partial() -> Result<(), Box<dyn std::error::Error>> {
    let ctx = context();
    let model = test_model();
    let messages = vec![Message::user("Count from 1 to 500, one number per line.")];

    let streaming = ctx.streaming.clone();
    let stopper = tokio::spawn(async move {
        while streaming.response().len() < 20 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        streaming.cancel_streaming();
    });

    let outcome = timeout(
        Duration::from_secs(120),
        relay_stream(&ctx.streaming, "it-cancel", |signal| {
            ctx.ollama.chat_stream(&model, &messages, &ctx.config.chat_options, signal)
        }),
    )
    .await??;
    stopper.await?;

    match outcome {
        StreamOutcome::Cancelled { partial } => assert!(partial.len() >= 20),
        other => panic!("expected cancellation, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_chat_with_missing_model() -> Result<(), Box<dyn std::error::Error>> {
    let ctx = context();
    let messages = vec![Message::user("hi")];
    let options = ChatOptions::default();

    let err = relay_stream(&ctx.streaming, "it-missing", |signal| {
        ctx.ollama.chat_stream("weenus-does-not-exist:0b", &messages, &options, signal)
    })
    .await
    .expect_err("missing model must fail");

    let ollama = err.chain().find_map(|c| c.downcast_ref::<OllamaError>());
    assert!(matches!(ollama, Some(OllamaError::ModelNotFound(_))), "got {:#}", err);
    assert!(!ctx.streaming.is_streaming());
    Ok(())
}
