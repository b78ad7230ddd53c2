//! CLI binary for receipt-ledger.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig`, wires the HTTP collaborators, and prints results.

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use receipt_ledger::assistant::{AssistantBackend, ChatAssistant};
use receipt_ledger::clients::{
    GoogleSearch, HttpObjectStore, NotionRecordStore, OpenAiAssistants, SlackNotifier,
};
use receipt_ledger::pipeline::llm::models_from_config;
use receipt_ledger::pipeline::render::PdfiumRasterizer;
use receipt_ledger::pipeline::{detect, input};
use receipt_ledger::process::step_label;
use receipt_ledger::{
    Pipeline, PipelineComponents, PipelineConfig, ProgressCallback, ReceiptProcessor,
    StageProgressCallback, ThreadPolicy,
};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One spinner for the whole batch plus a log line per finished stage.
/// Runs report concurrently, so timings are keyed by file and stage.
struct CliProgressCallback {
    bar: ProgressBar,
    started: Mutex<HashMap<(String, String), Instant>>,
}

impl CliProgressCallback {
    fn new(total_files: usize) -> Arc<Self> {
        let bar = ProgressBar::new(total_files as u64);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:30.green/238}] {pos}/{len} receipts  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);
        bar.set_style(style);
        bar.set_prefix("Processing");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            started: Mutex::new(HashMap::new()),
        })
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl StageProgressCallback for CliProgressCallback {
    fn on_stage_start(&self, file: &str, stage: &str, index: usize, total: usize) {
        if let Ok(mut started) = self.started.lock() {
            started.insert((file.to_string(), stage.to_string()), Instant::now());
        }
        self.bar
            .set_message(format!("{file}: {} ({index}/{total})", step_label(stage)));
    }

    fn on_stage_complete(
        &self,
        file: &str,
        stage: &str,
        index: usize,
        total: usize,
        elapsed_ms: u64,
    ) {
        if let Ok(mut started) = self.started.lock() {
            started.remove(&(file.to_string(), stage.to_string()));
        }
        self.bar.println(format!(
            "  {} {file}  {index}/{total} {:<10} {}",
            green("✓"),
            stage,
            dim(&format!("{:.1}s", elapsed_ms as f64 / 1000.0)),
        ));
    }

    fn on_stage_error(&self, file: &str, stage: &str, index: usize, total: usize, error: &str) {
        let elapsed = self
            .started
            .lock()
            .ok()
            .and_then(|mut s| s.remove(&(file.to_string(), stage.to_string())))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        let first_line = error.lines().next().unwrap_or(error);
        let msg: String = if first_line.chars().count() > 80 {
            first_line.chars().take(79).chain(std::iter::once('…')).collect()
        } else {
            first_line.to_string()
        };
        self.bar.println(format!(
            "  {} {file}  {index}/{total} {:<10} {}  {}",
            red("✗"),
            stage,
            red(&msg),
            dim(&format!("{elapsed:.1}s")),
        ));
    }

    fn on_run_complete(&self, _file: &str, _success: bool) {
        self.bar.inc(1);
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Process a receipt photo and book it
  receipt-ledger lunch.jpg

  # Several receipts, three at a time
  receipt-ledger --concurrency 3 a.jpg b.pdf c.png

  # A private chat-platform file URL (downloaded with SLACK_BOT_TOKEN)
  receipt-ledger https://files.slack.com/files-pri/T1-F2/receipt.jpg

  # Run the pipeline only, print JSON, store nothing
  receipt-ledger --dry-run --json receipt.pdf

  # Only report whether each file is a PDF or an image (no API keys)
  receipt-ledger --detect-only *.jpg *.pdf

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI key (vision/text models and hosted assistant)
  OPENAI_ASSISTANT_ID     Hosted assistant; in-process assistant when unset
  OPENAI_THREAD_ID        Shared assistant thread (with --shared-thread)
  GOOGLE_SEARCH_API_KEY   Google Custom Search key
  SEARCH_ENGINE_ID        Google Custom Search engine id (cx)
  NOTION_API_KEY          Notion integration token
  NOTION_DATABASE_ID      Notion database receiving the records
  RECEIPT_STORAGE_URL     Base URL receipts are PUT to
  RECEIPT_STORAGE_TOKEN   Bearer token for the storage endpoint
  SLACK_BOT_TOKEN         Slack bot token (notifications and private downloads)
  SLACK_CHANNEL_ID        Slack channel for notifications
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  PDFIUM_LIB_PATH         Path to libpdfium
"#;

/// Read shared receipts, categorise them, and book them in the ledger.
#[derive(Parser, Debug)]
#[command(
    name = "receipt-ledger",
    version,
    about = "Extract, categorise and book receipt images and PDFs using Vision LLMs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local receipt files or HTTP/HTTPS URLs.
    #[arg(required = true)]
    inputs: Vec<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Vision model used to read the receipt.
    #[arg(long, env = "RECEIPT_VISION_MODEL")]
    vision_model: Option<String>,

    /// Text model used to infer the business category.
    #[arg(long, env = "RECEIPT_TEXT_MODEL")]
    text_model: Option<String>,

    /// Receipts processed at the same time.
    #[arg(short, long, env = "RECEIPT_CONCURRENCY", default_value_t = 2,
          value_parser = clap::value_parser!(u16).range(1..=32))]
    concurrency: u16,

    /// Retries per stage on transient failures.
    #[arg(long, env = "RECEIPT_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Per model call timeout in seconds.
    #[arg(long, env = "RECEIPT_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "RECEIPT_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Give up on account classification after this many seconds.
    #[arg(long, env = "RECEIPT_CLASSIFICATION_TIMEOUT", default_value_t = 120)]
    classification_timeout: u64,

    /// Fail when line items do not add up to the total.
    #[arg(long)]
    strict_totals: bool,

    /// Keep every classification in one assistant thread.
    #[arg(long)]
    shared_thread: bool,

    /// Path to a text file containing a custom extraction system prompt.
    #[arg(long, env = "RECEIPT_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Path to libpdfium.
    #[arg(long, env = "PDFIUM_LIB_PATH")]
    pdfium_lib: Option<PathBuf>,

    /// Print the file kind of each input and exit.
    #[arg(long)]
    detect_only: bool,

    /// Run the pipeline but upload, store and notify nothing.
    #[arg(long)]
    dry_run: bool,

    /// Print results as JSON.
    #[arg(long)]
    json: bool,

    /// Disable progress bar.
    #[arg(long)]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long)]
    quiet: bool,

    #[arg(long, env = "GOOGLE_SEARCH_API_KEY", hide_env_values = true)]
    google_api_key: Option<String>,
    #[arg(long, env = "SEARCH_ENGINE_ID")]
    search_engine_id: Option<String>,
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,
    #[arg(long, env = "OPENAI_ASSISTANT_ID")]
    assistant_id: Option<String>,
    #[arg(long, env = "OPENAI_THREAD_ID")]
    thread_id: Option<String>,
    #[arg(long, env = "NOTION_API_KEY", hide_env_values = true)]
    notion_api_key: Option<String>,
    #[arg(long, env = "NOTION_DATABASE_ID")]
    notion_database_id: Option<String>,
    #[arg(long, env = "RECEIPT_STORAGE_URL")]
    storage_url: Option<String>,
    #[arg(long, env = "RECEIPT_STORAGE_TOKEN", hide_env_values = true)]
    storage_token: Option<String>,
    #[arg(long, env = "SLACK_BOT_TOKEN", hide_env_values = true)]
    slack_bot_token: Option<String>,
    #[arg(long, env = "SLACK_CHANNEL_ID")]
    slack_channel: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.detect_only;
    let filter = if cli.verbose {
        "receipt_ledger=debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Detect-only mode ─────────────────────────────────────────────────
    if cli.detect_only {
        return detect_only(&cli).await;
    }

    // ── Cancellation ─────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nCancelling…");
                cancel.cancel();
            }
        });
    }

    // ── Build pipeline and processor ─────────────────────────────────────
    let progress = if show_progress {
        Some(CliProgressCallback::new(cli.inputs.len()))
    } else {
        None
    };
    let config = build_config(&cli, progress.clone().map(|p| p as ProgressCallback)).await?;
    let processor = Arc::new(build_processor(&cli, &config).await?);

    // ── Run ──────────────────────────────────────────────────────────────
    let results: Vec<_> = stream::iter(cli.inputs.iter().cloned())
        .map(|item| {
            let processor = Arc::clone(&processor);
            let cancel = cancel.clone();
            async move {
                let outcome = processor.process_input(&item, &cancel).await;
                (item, outcome)
            }
        })
        .buffered(cli.concurrency as usize)
        .collect()
        .await;

    if let Some(p) = &progress {
        p.finish();
    }

    let mut failed = 0usize;
    let mut json_rows = Vec::new();
    for (item, outcome) in &results {
        match outcome {
            Ok(done) => {
                if cli.json {
                    json_rows.push(serde_json::json!({
                        "input": item,
                        "output": done.output,
                        "file_url": done.file_url,
                        "record_id": done.record_id,
                    }));
                } else if !cli.quiet {
                    let receipt = &done.output.receipt;
                    eprintln!(
                        "{} {}  {} / {} / {}원 → {}",
                        green("✔"),
                        bold(&done.file_name),
                        receipt.merchant,
                        done.output.category,
                        receipt_ledger::record::format_amount(receipt.total),
                        bold(done.output.account.label.ledger_name()),
                    );
                    eprintln!("   {}", dim(&done.output.account.justification));
                }
            }
            Err(failure) => {
                failed += 1;
                if cli.json {
                    json_rows.push(serde_json::json!({
                        "input": item,
                        "error": failure.error.to_string(),
                        "stage": failure.stage,
                    }));
                } else {
                    eprintln!(
                        "{} {}  failed at {}: {}",
                        red("✘"),
                        bold(item),
                        failure.stage,
                        failure.error
                    );
                }
            }
        }
    }

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json_rows).context("Failed to serialise output")?
        );
    }

    if failed > 0 {
        bail!("{}/{} receipts failed", failed, results.len());
    }
    Ok(())
}

async fn detect_only(cli: &Cli) -> Result<()> {
    for item in &cli.inputs {
        let resolved =
            input::resolve_input(item, cli.slack_bot_token.as_deref(), cli.download_timeout)
                .await
                .with_context(|| format!("Failed to open {}", item))?;
        let upload = resolved
            .read_upload()
            .await
            .with_context(|| format!("Failed to read {}", item))?;
        let kind = detect::classify(&upload.bytes);
        if cli.json {
            println!(
                "{}",
                serde_json::json!({ "input": item, "kind": kind, "bytes": upload.bytes.len() })
            );
        } else {
            println!("{:<8} {}", kind.to_string(), item);
        }
    }
    Ok(())
}

/// Map CLI args to `PipelineConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .max_retries(cli.max_retries)
        .api_timeout_secs(cli.api_timeout)
        .download_timeout_secs(cli.download_timeout)
        .classification_timeout_secs(cli.classification_timeout)
        .strict_totals(cli.strict_totals);

    if let Some(ref p) = cli.provider {
        builder = builder.provider_name(p);
    }
    if let Some(ref m) = cli.vision_model {
        builder = builder.vision_model(m);
    }
    if let Some(ref m) = cli.text_model {
        builder = builder.text_model(m);
    }
    if let Some(ref path) = cli.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    Ok(builder.build()?)
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str> {
    match value.as_deref() {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => bail!("{} is not set", name),
    }
}

/// Wire models, collaborators and the pipeline.
async fn build_processor(cli: &Cli, config: &PipelineConfig) -> Result<ReceiptProcessor> {
    let (vision, text) = models_from_config(config)?;

    let search = GoogleSearch::new(
        required(&cli.google_api_key, "GOOGLE_SEARCH_API_KEY")?,
        required(&cli.search_engine_id, "SEARCH_ENGINE_ID")?,
    )?;

    let assistant: Arc<dyn AssistantBackend> = match &cli.assistant_id {
        Some(id) => Arc::new(OpenAiAssistants::new(
            required(&cli.openai_api_key, "OPENAI_API_KEY")?,
            id,
        )?),
        None => Arc::new(ChatAssistant::new(Arc::clone(&text))),
    };

    let mut config = config.clone();
    if cli.shared_thread {
        let thread = match &cli.thread_id {
            Some(id) if cli.assistant_id.is_some() => id.clone(),
            _ => assistant
                .create_thread()
                .await
                .context("Failed to create the shared assistant thread")?,
        };
        config.thread_policy = ThreadPolicy::Shared(thread);
    }

    let components = PipelineComponents {
        vision,
        text,
        search: Arc::new(search),
        assistant,
        rasterizer: Arc::new(PdfiumRasterizer::new(
            cli.pdfium_lib.clone(),
            config.max_rendered_pixels,
        )),
    };
    let pipeline = Arc::new(Pipeline::standard(components, &config)?);

    let mut processor = ReceiptProcessor::new(pipeline)
        .with_download_token(cli.slack_bot_token.clone())
        .with_download_timeout_secs(config.download_timeout_secs);

    if cli.dry_run {
        return Ok(processor);
    }

    let storage = HttpObjectStore::new(
        required(&cli.storage_url, "RECEIPT_STORAGE_URL")?,
        cli.storage_token.clone(),
    )?;
    let records = NotionRecordStore::new(
        required(&cli.notion_api_key, "NOTION_API_KEY")?,
        required(&cli.notion_database_id, "NOTION_DATABASE_ID")?,
    )?;
    processor = processor.with_persistence(Arc::new(storage), Arc::new(records));

    if let (Some(token), Some(channel)) = (&cli.slack_bot_token, &cli.slack_channel) {
        processor = processor.with_notifier(Arc::new(SlackNotifier::new(token, channel)?));
    }

    Ok(processor)
}
