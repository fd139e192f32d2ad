// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::io::{AsyncBufReadExt, BufReader};

use weenus::download::{DownloadStatus, QueuedDownload};
use weenus::error::format_error;
use weenus::ollama::{ChatOptions, OllamaError};
use weenus::sync::resilient_lock;
use weenus::{relay_stream, AppConfig, AppContext, Message, StreamOutcome};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    pub const ERROR: i32 = 1;
    /// Invalid command line arguments
    pub const USAGE: i32 = 64;
    /// Ollama not running
    pub const SERVICE_UNAVAILABLE: i32 = 69;
    /// Invalid or unreadable config
    pub const CONFIG: i32 = 78;
    /// Interrupted by Ctrl+C while idle
    pub const INTERRUPTED: i32 = 130;
}

use exit_codes::*;

/// Spinner helpers for consistent progress indicators
mod spinner {
    use indicatif::{ProgressBar, ProgressStyle};
    use std::time::Duration;

    pub fn create(message: &str) -> ProgressBar {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner()
            .tick_chars("\u{28FB}\u{28F9}\u{28FC}\u{28F8}\u{28FE}\u{28F6}\u{28F7}\u{28E7}\u{28CF}\u{28DF} ")
            .template("{spinner:.cyan} {msg}")
        {
            spinner.set_style(style);
        }
        spinner.set_message(message.to_string());
        spinner.enable_steady_tick(Duration::from_millis(80));
        spinner
    }
}

/// weenus - chat with local models served by Ollama.
#[derive(Parser)]
#[command(name = "weenus")]
#[command(version = VERSION)]
#[command(about = "Chat with local models served by Ollama.")]
#[command(long_about = "weenus - chat with local models served by Ollama\n\n\
    Download models:     weenus pull llama3.2 qwen2.5-coder:7b\n\
    Interactive chat:    weenus chat --model llama3.2\n\
    One question:        weenus chat --model llama3.2 \"What is Rust?\"\n\
    Configure:           weenus config show\n\n\
    Ctrl+C stops the current download or response.")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Ollama base URL for this run (overrides config)
    #[arg(long, global = true)]
    url: Option<String>,

    /// Verbose mode: debug logging on stderr
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Download models, one at a time in the order given
    ///
    /// Examples:
    ///   weenus pull llama3.2
    ///   weenus pull qwen2.5-coder:7b phi3:mini
    Pull {
        /// Models to download (name[:tag])
        #[arg(required = true)]
        models: Vec<String>,
    },

    /// Chat with a model
    ///
    /// Examples:
    ///   weenus chat
    ///   weenus chat --model qwen2.5-coder:14b
    ///   weenus chat -m llama3.2 "Explain closures"
    ///   weenus chat --temperature 0.2 --stop "</answer>"
    Chat {
        /// Model to use (defaults to the configured model)
        #[arg(short, long)]
        model: Option<String>,
        #[command(flatten)]
        sampling: SamplingArgs,
        /// Ask this and exit instead of starting a session
        message: Option<String>,
    },

    /// Show or change configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Sampling options; anything set here overrides `chat_options` in the config.
#[derive(Args, Debug, Default)]
struct SamplingArgs {
    /// Sampling temperature (0-2)
    #[arg(long)]
    temperature: Option<f32>,
    /// Nucleus sampling cutoff (0-1)
    #[arg(long)]
    top_p: Option<f32>,
    /// Sample from the k most likely tokens
    #[arg(long)]
    top_k: Option<u32>,
    /// Penalty for repeated tokens
    #[arg(long)]
    repeat_penalty: Option<f32>,
    /// Seed for reproducible output
    #[arg(long)]
    seed: Option<i64>,
    /// Maximum tokens to generate (-1 for no limit)
    #[arg(long, allow_negative_numbers = true)]
    num_predict: Option<i32>,
    /// Stop sequence (repeatable)
    #[arg(long = "stop")]
    stop: Vec<String>,
}

impl SamplingArgs {
    fn into_options(self) -> ChatOptions {
        ChatOptions {
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            repeat_penalty: self.repeat_penalty,
            seed: self.seed,
            num_predict: self.num_predict,
            stop: self.stop,
        }
    }
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the current configuration
    Show,
    /// Set the Ollama base URL
    SetUrl { url: String },
    /// Set the model `chat` uses by default
    SetModel { model: String },
}

fn init_logging(verbose: bool, config: &AppConfig) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        config.tracing_level()
    };

    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(level)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "{}",
                format_error(
                    &format!("Could not load configuration: {:#}", e),
                    &["~/.weenus/config.json is not valid JSON"],
                    &["Fix or delete the file; defaults are used when it is missing"],
                )
            );
            std::process::exit(CONFIG);
        }
    };
    init_logging(cli.verbose, &config);

    let result = match cli.command {
        Commands::Config { action } => cmd_config(config, action),
        command => {
            let mut config = config;
            if let Some(url) = cli.url.as_deref() {
                if let Err(e) = config.set_ollama_url(url) {
                    eprintln!("{} {}", "[✗]".red(), e);
                    std::process::exit(USAGE);
                }
            }

            let ctx = AppContext::new(config);
            install_interrupt_handler(&ctx);

            match command {
                Commands::Pull { models } => cmd_pull(&ctx, models).await,
                Commands::Chat { model, sampling, message } => cmd_chat(&ctx, model, sampling, message).await,
                Commands::Config { .. } => Ok(()),
            }
        }
    };

    if let Err(e) = result {
        eprintln!();
        eprintln!("{}", describe_error(&e));
        std::process::exit(exit_code_for(&e));
    }
}

/// Ctrl+C stops whatever is in flight; with nothing running it exits.
fn install_interrupt_handler(ctx: &AppContext) {
    let ctx = ctx.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if !ctx.cancel_all() {
            std::process::exit(INTERRUPTED);
        }
    }) {
        tracing::warn!(error = %e, "could not install Ctrl+C handler");
    }
}

fn ollama_error(e: &anyhow::Error) -> Option<&OllamaError> {
    e.chain().find_map(|cause| cause.downcast_ref::<OllamaError>())
}

fn describe_error(e: &anyhow::Error) -> String {
    match ollama_error(e) {
        Some(OllamaError::NotRunning(_)) => format_error(
            "Ollama is not running",
            &[
                "Ollama is not installed (https://ollama.com/download)",
                "The Ollama service is stopped",
                "--url or the configured URL points at the wrong host",
            ],
            &["Start it with: ollama serve", "Check the URL with: weenus config show"],
        ),
        Some(OllamaError::ModelNotFound(model)) => {
            let pull = format!("Download it with: weenus pull {}", model);
            format_error(
                &format!("Model '{}' not found", model),
                &["The model name or tag is misspelled", "The model has not been downloaded yet"],
                &[pull.as_str(), "Browse models at https://ollama.com/library"],
            )
        }
        Some(OllamaError::Timeout(msg)) => format_error(
            msg,
            &["The model is very large or the machine is under load"],
            &["Try again, or use a smaller model"],
        ),
        _ => format_error(&format!("{:#}", e), &[], &[]),
    }
}

fn exit_code_for(e: &anyhow::Error) -> i32 {
    match ollama_error(e) {
        Some(OllamaError::NotRunning(_)) => SERVICE_UNAVAILABLE,
        _ => ERROR,
    }
}

async fn ensure_ollama(ctx: &AppContext) -> Result<()> {
    if ctx.ollama.is_running().await {
        Ok(())
    } else {
        Err(OllamaError::NotRunning(format!("no response from {}", ctx.ollama.base_url())).into())
    }
}

// ---------------------------------------------------------------------------
// pull
// ---------------------------------------------------------------------------

fn bar_style() -> Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template("  {prefix:<24} [{bar:30.cyan/blue}] {pos:>3}% | {msg}")?
        .progress_chars("█▓░"))
}

fn bar_message(entry: &QueuedDownload) -> String {
    match entry.status {
        DownloadStatus::Pending => "queued".dimmed().to_string(),
        DownloadStatus::Downloading => match entry.eta_string() {
            Some(eta) => format!("{} | ETA {}", entry.progress_text, eta),
            None => entry.progress_text.clone(),
        },
        DownloadStatus::Processing => entry.progress_text.clone(),
        DownloadStatus::Completed => "done".green().to_string(),
        DownloadStatus::Failed => format!("failed: {}", entry.error.as_deref().unwrap_or("unknown error"))
            .red()
            .to_string(),
        DownloadStatus::Cancelled => "cancelled".yellow().to_string(),
    }
}

async fn cmd_pull(ctx: &AppContext, models: Vec<String>) -> Result<()> {
    ensure_ollama(ctx).await?;

    let mut ids = Vec::with_capacity(models.len());
    for model in &models {
        ids.push(ctx.downloads.add_to_queue(model.as_str())?);
    }

    let multi = MultiProgress::new();
    let style = bar_style()?;
    let bars: HashMap<String, ProgressBar> = ctx
        .downloads
        .queue()
        .into_iter()
        .map(|entry| {
            let bar = multi.add(ProgressBar::new(100));
            bar.set_style(style.clone());
            bar.set_prefix(entry.model_name.clone());
            bar.set_message(bar_message(&entry));
            (entry.id, bar)
        })
        .collect();

    let _progress = ctx.downloads.subscribe(move |snapshot| {
        let present: Vec<&str> = snapshot.iter().map(|e| e.id.as_str()).collect();
        for entry in snapshot {
            let Some(bar) = bars.get(&entry.id) else { continue };
            if bar.is_finished() {
                continue;
            }
            bar.set_position(entry.progress as u64);
            if entry.status.is_terminal() {
                bar.finish_with_message(bar_message(entry));
            } else {
                bar.set_message(bar_message(entry));
            }
        }
        // Pending entries cancelled by the user leave the queue.
        for (id, bar) in &bars {
            if !bar.is_finished() && !present.contains(&id.as_str()) {
                bar.abandon_with_message("cancelled".yellow().to_string());
            }
        }
    });

    let summary = ctx.download_driver().drain().await;
    drop(multi);

    println!();
    println!(
        "{} completed, {} failed, {} cancelled",
        summary.completed.to_string().green(),
        summary.failed.to_string().red(),
        summary.cancelled.to_string().yellow()
    );

    if summary.failed > 0 {
        for entry in ctx.downloads.queue() {
            if entry.status == DownloadStatus::Failed {
                println!(
                    "  {} {}: {}",
                    "[✗]".red(),
                    entry.model_name,
                    entry.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        anyhow::bail!("{} of {} downloads failed", summary.failed, ids.len());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// chat
// ---------------------------------------------------------------------------

/// Prints each new slice of the streaming response and clears the
/// "Thinking..." spinner on the first one.
fn attach_printer(ctx: &AppContext, thinking: Arc<Mutex<Option<ProgressBar>>>) -> weenus::Subscription {
    let printed = AtomicUsize::new(0);

    ctx.streaming.subscribe("terminal", move |state| {
        if !state.is_streaming {
            printed.store(0, Ordering::SeqCst);
            if let Some(spinner) = resilient_lock(&thinking).take() {
                spinner.finish_and_clear();
            }
            return;
        }

        let from = printed.load(Ordering::SeqCst);
        if state.current_response.len() <= from {
            return;
        }
        if let Some(spinner) = resilient_lock(&thinking).take() {
            spinner.finish_and_clear();
        }
        print!("{}", &state.current_response[from..]);
        io::stdout().flush().ok();
        printed.store(state.current_response.len(), Ordering::SeqCst);
    })
}

/// Send `history` to the model and stream the reply. The reply (or the
/// partial reply, if stopped and configured to keep it) is appended to
/// `history`.
async fn ask(
    ctx: &AppContext,
    model: &str,
    options: &ChatOptions,
    chat_id: &str,
    history: &mut Vec<Message>,
) -> Result<()> {
    let thinking = Arc::new(Mutex::new(Some(spinner::create("Thinking..."))));
    let _printer = attach_printer(ctx, Arc::clone(&thinking));

    let conversation: &[Message] = history;
    let outcome = relay_stream(&ctx.streaming, chat_id, |signal| {
        ctx.ollama.chat_stream(model, conversation, options, signal)
    })
    .await;

    if let Some(spinner) = resilient_lock(&thinking).take() {
        spinner.finish_and_clear();
    }
    println!();

    match outcome? {
        StreamOutcome::Completed(text) => history.push(Message::assistant(text)),
        StreamOutcome::Cancelled { partial } => {
            println!("{}", "[stopped]".yellow());
            if ctx.config.keep_partial_responses && !partial.is_empty() {
                history.push(Message::assistant(partial));
            }
        }
    }
    Ok(())
}

async fn cmd_chat(
    ctx: &AppContext,
    model: Option<String>,
    sampling: SamplingArgs,
    message: Option<String>,
) -> Result<()> {
    let model = model
        .or_else(|| ctx.config.default_model.clone())
        .context("No model given. Use --model <name> or: weenus config set-model <name>")?;
    let options = ctx.config.chat_options.overlay(&sampling.into_options());
    options.validate().context("Invalid sampling options")?;

    ensure_ollama(ctx).await?;
    if !ctx.ollama.has_model(&model).await? {
        return Err(OllamaError::ModelNotFound(model).into());
    }

    let chat_id = format!("chat-{}", chrono::Utc::now().timestamp_millis());
    let mut history: Vec<Message> = Vec::new();

    if let Some(message) = message {
        history.push(Message::user(message));
        return ask(ctx, &model, &options, &chat_id, &mut history).await;
    }

    println!("{} {}", "Chatting with".dimmed(), model.cyan().bold());
    println!("{}", "Ctrl+C stops a response. /clear resets, /exit quits.".dimmed());
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{} ", ">".cyan().bold());
        io::stdout().flush().ok();

        let Some(line) = lines.next_line().await.context("Failed to read input")? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/exit" | "/quit" => break,
            "/clear" => {
                history.clear();
                println!("{}", "Conversation cleared.".dimmed());
                continue;
            }
            _ => {}
        }

        history.push(Message::user(line));
        if let Err(e) = ask(ctx, &model, &options, &chat_id, &mut history).await {
            if matches!(ollama_error(&e), Some(OllamaError::NotRunning(_))) {
                return Err(e);
            }
            eprintln!("{}", describe_error(&e));
            // Drop the unanswered question so the next turn starts clean.
            history.pop();
        }
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config(mut config: AppConfig, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let path = weenus::config::config_dir()?.join("config.json");
            println!("{} {}", "Config file:".dimmed(), path.display());
            println!();
            println!("  {:<24} {}", "ollama_url", config.ollama_url.cyan());
            println!(
                "  {:<24} {}",
                "default_model",
                config.default_model.as_deref().unwrap_or("(none)").cyan()
            );
            println!("  {:<24} {}", "settle_delay_ms", config.settle_delay_ms);
            println!("  {:<24} {}", "log_level", config.log_level);
            println!("  {:<24} {}", "keep_partial_responses", config.keep_partial_responses);
            let options = if config.chat_options.is_empty() {
                "(model defaults)".to_string()
            } else {
                serde_json::to_string(&config.chat_options)?
            };
            println!("  {:<24} {}", "chat_options", options);
        }
        ConfigAction::SetUrl { url } => {
            config.set_ollama_url(&url)?;
            config.save()?;
            println!("{} Ollama URL set to {}", "[✓]".green(), config.ollama_url.cyan());
        }
        ConfigAction::SetModel { model } => {
            let model = model.trim();
            if model.is_empty() {
                anyhow::bail!("model name must not be empty");
            }
            config.default_model = Some(model.to_string());
            config.save()?;
            println!("{} Default model set to {}", "[✓]".green(), model.cyan());
        }
    }
    Ok(())
}
