//! Command-line front end: sends one prompt through a configured router.

use clap::Parser;
use futures_util::StreamExt;
use relay_core::{CancellationToken, ChatRequest, Message, StreamEvent};
use relay_router::{ModelRouter, RelayConfig};
use std::io::Write;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relay", about = "Send a prompt through the relay model router")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,

    /// Preferred backend, tried before `default` (repeatable)
    #[arg(short, long = "backend")]
    backends: Vec<String>,

    /// Print chunks as they arrive
    #[arg(long)]
    stream: bool,

    /// System prompt
    #[arg(long)]
    system: Option<String>,

    #[arg(long)]
    max_tokens: Option<u32>,

    #[arg(long)]
    temperature: Option<f32>,

    /// The user prompt
    prompt: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Credentials referenced by `api_key_env` may live in a local .env file.
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = RelayConfig::load(&cli.config).map_err(|e| {
        anyhow::anyhow!("Failed to load config '{}': {e}", cli.config.display())
    })?;
    info!(
        backends = config.backends.len(),
        config = %cli.config.display(),
        "Configuration loaded"
    );
    let router = config.into_router()?;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling request");
            trigger.cancel();
        }
    });

    let mut request = ChatRequest::new(vec![Message::user(cli.prompt)]).with_cancel(cancel);
    request.system = cli.system;
    request.max_output_tokens = cli.max_tokens;
    request.temperature = cli.temperature;

    if cli.stream {
        run_stream(&router, &cli.backends, &request).await
    } else {
        run_once(&router, &cli.backends, &request).await
    }
}

async fn run_once(
    router: &ModelRouter,
    backends: &[String],
    request: &ChatRequest,
) -> anyhow::Result<()> {
    let resp = router.call(backends, request).await?;
    info!(
        backend = %resp.backend,
        input_tokens = resp.usage.input_tokens,
        output_tokens = resp.usage.output_tokens,
        "Response received"
    );

    match resp.text {
        Some(text) => println!("{text}"),
        None => println!("{}", serde_json::to_string_pretty(&resp.content)?),
    }
    Ok(())
}

async fn run_stream(
    router: &ModelRouter,
    backends: &[String],
    request: &ChatRequest,
) -> anyhow::Result<()> {
    let mut handle = router.call_stream(backends, request).await?;
    info!(backend = %handle.backend, "Streaming");

    let mut stdout = std::io::stdout().lock();
    while let Some(event) = handle.next().await {
        match event? {
            StreamEvent::TextDelta { text } => {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            StreamEvent::ToolCallStart { name, .. } => {
                writeln!(stdout, "\n[tool call: {name}]")?;
            }
            StreamEvent::Usage { usage } => {
                info!(
                    input_tokens = usage.input_tokens,
                    output_tokens = usage.output_tokens,
                    "Usage"
                );
            }
            StreamEvent::Error { message } => {
                anyhow::bail!("Backend reported an error mid-stream: {message}");
            }
            _ => {}
        }
    }
    writeln!(stdout)?;
    Ok(())
}
