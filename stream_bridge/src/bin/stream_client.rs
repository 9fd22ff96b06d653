use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use stream_bridge::{
    dto::{InferenceResponse, StreamInferenceRequest},
    model::Mode,
};
use tracing::{info, warn};

/// Sends images and videos through a running stream bridge.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bridge base URL
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    url: String,
    /// Model requested for the session
    #[arg(long)]
    model: Option<String>,
    #[arg(long, value_enum, default_value = "detect")]
    mode: ModeArg,
    /// Skip the rendered overlay
    #[arg(long)]
    no_overlay: bool,
    /// Where overlays and rendered videos are written
    #[arg(long, default_value = "output")]
    output: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// One request, one response
    Infer { image: PathBuf },
    /// One image over server-sent events
    Stream { image: PathBuf },
    /// One image over newline-delimited JSON
    Reactive { image: PathBuf },
    /// A whole video over server-sent events
    Video { video: PathBuf },
    /// Several images, paced by the bridge
    Batch { images: Vec<PathBuf> },
    Health,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Detect,
    Track,
    Segment,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Detect => Mode::Detect,
            ModeArg::Track => Mode::Track,
            ModeArg::Segment => Mode::Segment,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let client = reqwest::Client::new();
    let base = args.url.trim_end_matches('/').to_string();

    let mut request = StreamInferenceRequest {
        model: args.model.clone(),
        mode: Some(args.mode.into()),
        return_overlay: Some(!args.no_overlay),
        ..Default::default()
    };

    match &args.command {
        Command::Health => {
            let body = client
                .get(format!("{}/health", base))
                .send()
                .await?
                .text()
                .await?;
            println!("{}", body);
        }
        Command::Infer { image } => {
            request.image = Some(read_base64(image)?);
            let response = client
                .post(format!("{}/api/v1/inference", base))
                .json(&request)
                .send()
                .await?;
            let response: InferenceResponse = response.json().await?;
            report("response", &response, &args.output)?;
        }
        Command::Stream { image } => {
            request.image = Some(read_base64(image)?);
            sse(&client, &format!("{}/api/v1/stream/inference/sse", base), &request, &args.output).await?;
        }
        Command::Reactive { image } => {
            request.image = Some(read_base64(image)?);
            ndjson(&client, &format!("{}/api/v1/stream/inference/reactive", base), &request, &args.output).await?;
        }
        Command::Video { video } => {
            request.video = Some(read_base64(video)?);
            sse(&client, &format!("{}/api/v1/stream/video/inference", base), &request, &args.output).await?;
        }
        Command::Batch { images } => {
            if images.is_empty() {
                bail!("batch needs at least one image");
            }
            request.images = images.iter().map(|p| read_base64(p)).collect::<Result<_>>()?;
            sse(&client, &format!("{}/api/v1/stream/batch/inference", base), &request, &args.output).await?;
        }
    }

    Ok(())
}

fn read_base64(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(STANDARD.encode(bytes))
}

async fn sse(
    client: &reqwest::Client,
    url: &str,
    request: &StreamInferenceRequest,
    output: &Path,
) -> Result<()> {
    let response = client.post(url).json(request).send().await?;
    if !response.status().is_success() {
        let status = response.status();
        bail!("{} returned {}: {}", url, status, response.text().await?);
    }

    let mut bytes = response.bytes_stream();
    let mut lines = LineBuffer::default();
    let mut parser = SseParser::default();
    while let Some(chunk) = bytes.next().await {
        for line in lines.push(&chunk?) {
            if let Some((event, data)) = parser.feed(&line) {
                handle_data(&event, &data, output)?;
            }
        }
    }
    Ok(())
}

async fn ndjson(
    client: &reqwest::Client,
    url: &str,
    request: &StreamInferenceRequest,
    output: &Path,
) -> Result<()> {
    let response = client.post(url).json(request).send().await?;
    if !response.status().is_success() {
        let status = response.status();
        bail!("{} returned {}: {}", url, status, response.text().await?);
    }

    #[derive(serde::Deserialize)]
    struct Line {
        name: String,
        payload: InferenceResponse,
    }

    let mut bytes = response.bytes_stream();
    let mut lines = LineBuffer::default();
    while let Some(chunk) = bytes.next().await {
        for line in lines.push(&chunk?) {
            if line.trim().is_empty() {
                continue;
            }
            let event: Line = serde_json::from_str(&line)?;
            report(&event.name, &event.payload, output)?;
        }
    }
    Ok(())
}

fn handle_data(event: &str, data: &str, output: &Path) -> Result<()> {
    match serde_json::from_str::<InferenceResponse>(data) {
        Ok(response) => report(event, &response, output),
        Err(e) => {
            warn!("Unreadable {} event: {}", event, e);
            Ok(())
        }
    }
}

fn report(event: &str, response: &InferenceResponse, output: &Path) -> Result<()> {
    info!(
        "[{}] success={} message={:?} frame={:?} detections={} runtime_ms={:?}",
        event,
        response.success,
        response.message,
        response.frame_index,
        response.detections.len(),
        response.runtime_ms
    );
    for detection in &response.detections {
        info!(
            "  {} ({}) score={:.2} box=({}, {}, {}, {}) track={:?}",
            detection.class_name,
            detection.class_id,
            detection.score,
            detection.x,
            detection.y,
            detection.width,
            detection.height,
            detection.track_id
        );
    }

    let frame = response.frame_index.unwrap_or(0);
    if let Some(overlay) = &response.overlay_image {
        save(output, &format!("overlay_{}.jpg", frame), overlay)?;
    }
    if let Some(video) = &response.rendered_video {
        save(output, &format!("video_{}.bin", frame), video)?;
    }
    Ok(())
}

fn save(dir: &Path, name: &str, encoded: &str) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(name);
    std::fs::write(&path, STANDARD.decode(encoded)?)?;
    info!("Saved {}", path.display());
    Ok(())
}

/// Splits a byte stream into lines, keeping partial lines between chunks.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}

/// Accumulates `event:` and `data:` fields until the blank line that ends
/// an event.
#[derive(Default)]
struct SseParser {
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    fn feed(&mut self, line: &str) -> Option<(String, String)> {
        if line.is_empty() {
            if self.data.is_empty() {
                self.event = None;
                return None;
            }
            let event = self.event.take().unwrap_or_else(|| "message".to_string());
            let data = std::mem::take(&mut self.data).join("\n");
            return Some((event, data));
        }
        if line.starts_with(':') {
            return None;
        }
        if let Some(event) = line.strip_prefix("event:") {
            self.event = Some(event.trim_start().to_string());
        } else if let Some(data) = line.strip_prefix("data:") {
            self.data.push(data.strip_prefix(' ').unwrap_or(data).to_string());
        }
        None
    }
}
