//! CLI binary for serving and inspecting Cardstream sessions.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use cardstream_engine::{ContentSource, StaticCatalog, StreamingConfig};
use cardstream_images::ImageServiceConfig;
use cardstream_server::{build_service, ServerConfig};
use cardstream_sse::{Frame, FrameDecoder, TranscriptChecker, TranscriptReport};
use cardstream_types::GenerationRequest;

#[derive(Parser)]
#[command(name = "cardstream", version, about = "Progressive card streaming over SSE")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(clap::Args, Clone)]
struct SessionArgs {
    /// Presentation topic
    #[arg(short, long, default_value = "AI in Product Discovery")]
    topic: String,

    /// Number of cards to generate
    #[arg(short, long, default_value = "6")]
    cards: usize,

    /// Generate an image per card
    #[arg(long)]
    images: bool,

    /// Image provider to request
    #[arg(long, default_value = "placeholder")]
    provider: String,

    /// Per-card stagger in milliseconds
    #[arg(long)]
    delay: Option<u64>,
}

impl SessionArgs {
    fn request(&self) -> GenerationRequest {
        let mut request = GenerationRequest::new(self.topic.clone(), self.cards);
        if self.images {
            request = request.with_images(self.provider.clone());
        }
        if let Some(delay) = self.delay {
            request = request.with_delay(delay);
        }
        request
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server
    Serve {
        /// Listen host (default: $HOST or 0.0.0.0)
        #[arg(long)]
        host: Option<String>,

        /// Listen port (default: $PORT or 3000)
        #[arg(short, long)]
        port: Option<u16>,

        /// Abort sessions still running after this many milliseconds
        #[arg(long)]
        session_timeout_ms: Option<u64>,

        /// Maximum concurrent sessions
        #[arg(long)]
        max_connections: Option<usize>,

        /// Heartbeat comment interval in milliseconds
        #[arg(long)]
        heartbeat_ms: Option<u64>,
    },

    /// List the built-in topics
    Topics,

    /// Run one session in-process and print its frames
    Stream {
        #[command(flatten)]
        session: SessionArgs,

        /// Print raw wire chunks instead of summaries
        #[arg(long)]
        raw: bool,
    },

    /// Open a session against a running server and check the frame order
    Probe {
        /// Server base URL
        #[arg(long, default_value = "http://localhost:3000")]
        url: String,

        #[command(flatten)]
        session: SessionArgs,

        /// Give up if the stream has not finished after this many milliseconds
        #[arg(long, default_value = "120000")]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = log_filter(cli.verbose, std::env::var("RUST_LOG").ok().as_deref());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve {
            host,
            port,
            session_timeout_ms,
            max_connections,
            heartbeat_ms,
        } => {
            let mut streaming = StreamingConfig::from_env();
            if let Some(ms) = session_timeout_ms {
                streaming.session_timeout = Duration::from_millis(ms);
            }
            if let Some(n) = max_connections {
                streaming.max_connections = n;
            }
            if let Some(ms) = heartbeat_ms {
                streaming.heartbeat_interval = Duration::from_millis(ms);
            }
            cmd_serve(host, port, streaming).await?;
        }
        Commands::Topics => cmd_topics(),
        Commands::Stream { session, raw } => cmd_stream(&session, raw).await?,
        Commands::Probe {
            url,
            session,
            timeout_ms,
        } => {
            let timeout = Duration::from_millis(timeout_ms);
            let report = tokio::time::timeout(timeout, cmd_probe(&url, &session))
                .await
                .with_context(|| format!("No complete stream within {timeout_ms} ms"))??;
            finish(report)?;
        }
    }

    Ok(())
}

/// `RUST_LOG` wins when it parses; otherwise `--verbose` picks debug or info.
fn log_filter(verbose: bool, rust_log: Option<&str>) -> EnvFilter {
    let default = if verbose { "debug" } else { "info" };
    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(default))
}

async fn cmd_serve(
    host: Option<String>,
    port: Option<u16>,
    streaming: StreamingConfig,
) -> anyhow::Result<()> {
    let mut config = ServerConfig::from_env();
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }

    tracing::info!(
        addr = %config.addr(),
        max_connections = streaming.max_connections,
        session_timeout_ms = streaming.session_timeout.as_millis() as u64,
        heartbeat_ms = streaming.heartbeat_interval.as_millis() as u64,
        "Starting Cardstream server"
    );
    let service = Arc::new(build_service(streaming, ImageServiceConfig::from_env()));
    cardstream_server::serve(config, service).await
}

fn cmd_topics() {
    for topic in StaticCatalog::new().topics() {
        println!("{topic}");
    }
}

async fn cmd_stream(args: &SessionArgs, raw: bool) -> anyhow::Result<()> {
    let service = build_service(StreamingConfig::from_env(), ImageServiceConfig::from_env());
    let mut stream = service.open(args.request())?;

    let mut decoder = FrameDecoder::new();
    let mut checker = TranscriptChecker::new().expect_images(args.images);
    while let Some(chunk) = stream.next_frame().await {
        if raw {
            print!("{chunk}");
        }
        decoder.push_str(&chunk);
        for frame in decoder.frames() {
            let frame = frame?;
            if !raw {
                println!("{}", describe(&frame));
            }
            checker.observe(&frame);
        }
    }

    finish(checker.report())
}

async fn cmd_probe(url: &str, args: &SessionArgs) -> anyhow::Result<TranscriptReport> {
    let endpoint = format!("{}/api/presentations/stream", url.trim_end_matches('/'));
    tracing::info!(%endpoint, topic = %args.topic, cards = args.cards, "Opening stream");
    let response = reqwest::Client::new()
        .post(&endpoint)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .json(&args.request())
        .send()
        .await
        .with_context(|| format!("Failed to reach {endpoint}"))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("Server rejected the session ({status}): {body}");
    }
    if let Some(id) = response.headers().get("x-connection-id") {
        println!("connection: {}", id.to_str().unwrap_or("?"));
    }

    let mut decoder = FrameDecoder::new();
    let mut checker = TranscriptChecker::new().expect_images(args.images);
    let mut body = std::pin::pin!(response.bytes_stream());
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("Stream interrupted")?;
        decoder.push_bytes(&chunk);
        for frame in decoder.frames() {
            match frame {
                Ok(frame) => {
                    println!("{}", describe(&frame));
                    checker.observe(&frame);
                }
                Err(e) => tracing::warn!(error = %e, "Unparsable frame"),
            }
        }
    }
    if !decoder.remainder().is_empty() {
        tracing::warn!(remainder = ?decoder.remainder(), "Stream ended mid-frame");
    }

    Ok(checker.report())
}

fn describe(frame: &Frame) -> String {
    match frame {
        Frame::Skeleton {
            card_count,
            connection_id,
            ..
        } => match connection_id {
            Some(id) => format!("[skeleton] {card_count} cards ({id})"),
            None => format!("[skeleton] {card_count} cards"),
        },
        Frame::Content { card_id, content } => {
            let title = content
                .get("title")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("");
            format!("[content]  {card_id} {title}")
        }
        Frame::Image { card_id, image } => {
            format!("[image]    {card_id} via {}", image.metadata.provider)
        }
        Frame::Error {
            card_id,
            error,
            code,
        } => {
            let scope = card_id
                .as_ref()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "session".into());
            format!("[error]    {scope}: {error} ({})", code.as_deref().unwrap_or("-"))
        }
        Frame::Done => "[done]".to_string(),
    }
}

fn finish(report: TranscriptReport) -> anyhow::Result<()> {
    println!(
        "\n{} frames: {} content, {} images, {} errors{}",
        report.frames,
        report.content_frames,
        report.image_frames,
        report.error_frames,
        if report.completed { "" } else { " (no done frame)" }
    );

    if report.is_clean() {
        return Ok(());
    }
    for violation in &report.violations {
        println!("  VIOLATION: {violation}");
    }
    std::process::exit(1);
}
