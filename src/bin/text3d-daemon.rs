//! text3d generation daemon: Unix socket, line-delimited JSON.
//!
//! Keeps the model bundle resident across requests. Each client connection
//! sends one JSON request line and receives one JSON response line, then
//! closes.
//!
//! # Socket path
//!
//! Default: `/tmp/text3d-gen.sock`. Override with `--socket`.
//!
//! # Protocol
//!
//! **Request** (one JSON line):
//! ```json
//! {
//!   "prompt": "a chair shaped like an avocado",
//!   "guidance_scale": 15.0,            // optional
//!   "seed": 42,                        // optional, null = random
//!   "formats": ["obj", "stl"],         // optional, default from config
//!   "output_dir": "/tmp/chair"         // optional, spool directory if omitted
//! }
//! ```
//!
//! **Response on success** (one JSON line):
//! ```json
//! {"ok": true, "artifacts": [{"format": "obj", "path": "/tmp/chair/a_chair_shaped_like_an_avocado.obj", "size_bytes": 41532}], "vertex_count": 482, "face_count": 960, "previews": 0, "elapsed_ms": 812}
//! ```
//!
//! **Response on error** (one JSON line):
//! ```json
//! {"ok": false, "stage": "validating", "error": "bad input: prompt is empty"}
//! ```
//!
//! # Example (shell)
//!
//! ```sh
//! echo '{"prompt":"a small toy car","formats":["stl"]}' \
//!   | socat - UNIX-CONNECT:/tmp/text3d-gen.sock
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use text3d_rs::{
    Error, Stage,
    config::{DevicePreference, PipelineConfig},
    manager::{GenerationManager, ManagerConfig},
    pipeline::{GenerationPipeline, GenerationRequest},
    writer::{Artifact, ArtifactDir},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{UnixListener, UnixStream},
};

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "text3d-daemon",
    about = "text3d generation daemon, resident model with a Unix socket JSON interface"
)]
struct Args {
    /// Unix socket path to listen on.
    #[arg(long, default_value = "/tmp/text3d-gen.sock")]
    socket: PathBuf,

    /// JSON pipeline configuration.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Execution device: auto, cpu, cuda[:N] or metal[:N].
    #[arg(long)]
    device: Option<DevicePreference>,

    /// Model backend.
    #[arg(long, default_value = "toy")]
    backend: String,

    /// Root for requests that do not name an output directory.
    /// Default: `<data_local_dir>/text3d/spool`.
    #[arg(long)]
    spool_dir: Option<PathBuf>,
}

// ── Wire types ───────────────────────────────────────────────────────────────

/// Response sent back to the client.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Response {
    Ok {
        ok: bool, // always true
        artifacts: Vec<Artifact>,
        vertex_count: usize,
        face_count: usize,
        previews: usize,
        elapsed_ms: u64,
    },
    Err {
        ok: bool, // always false
        #[serde(skip_serializing_if = "Option::is_none")]
        stage: Option<Stage>,
        error: String,
    },
}

impl Response {
    fn err(msg: impl Into<String>) -> Self {
        Self::Err {
            ok: false,
            stage: None,
            error: msg.into(),
        }
    }

    fn failed(error: &Error) -> Self {
        Self::Err {
            ok: false,
            stage: error.stage(),
            error: error.to_string(),
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(device) = args.device {
        config.device = device;
    }

    let spool = args.spool_dir.clone().unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("text3d/spool")
    });

    // Remove stale socket file if present.
    if args.socket.exists() {
        std::fs::remove_file(&args.socket)?;
    }

    // Bind the socket immediately so callers can connect right away.
    // Connections that arrive before loading completes will wait in the channel.
    let listener = UnixListener::bind(&args.socket)?;
    tracing::info!("Listening on {:?} (loading model...)", args.socket);

    let pipeline = GenerationPipeline::from_config(config, &args.backend)?;
    let manager = GenerationManager::start(Arc::new(pipeline), ManagerConfig::default()).await?;
    let spool = Arc::new(spool);

    tracing::info!(spool = %spool.display(), "Model ready");

    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let manager = manager.clone();
                let spool = Arc::clone(&spool);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, manager, &spool).await {
                        tracing::warn!("connection error: {e}");
                    }
                });
            }
            Err(e) => {
                tracing::error!("accept error: {e}");
            }
        }
    }
}

// ── Connection handler ────────────────────────────────────────────────────────

async fn handle_connection(
    stream: UnixStream,
    manager: GenerationManager,
    spool: &std::path::Path,
) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    // Read exactly one line (the JSON request).
    let line = match lines.next_line().await? {
        Some(l) if !l.trim().is_empty() => l,
        _ => {
            send_response(&mut writer, Response::err("empty request")).await?;
            return Ok(());
        }
    };

    let response = process_request(&line, &manager, spool).await;
    send_response(&mut writer, response).await?;
    Ok(())
}

async fn process_request(
    line: &str,
    manager: &GenerationManager,
    spool: &std::path::Path,
) -> Response {
    let mut request: GenerationRequest = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => return Response::err(format!("invalid JSON request: {e}")),
    };

    // Each spooled request gets its own uniquely named directory.
    if request.output_dir.is_none() {
        match ArtifactDir::spooled(spool) {
            Ok(dir) => request.output_dir = Some(dir.keep()),
            Err(e) => return Response::failed(&e),
        }
    }

    tracing::info!(
        prompt = %request.prompt,
        output = ?request.output_dir,
        "generating"
    );

    let result = match manager.generate(request).await {
        Ok(r) => r,
        Err(Error::Manager(ref reason)) => {
            // The worker thread is gone. Exit so a supervisor can restart the
            // process and reload the model.
            tracing::error!(%reason, "generation manager has shut down, exiting for restart");
            std::process::exit(1);
        }
        Err(e) => return Response::failed(&e),
    };

    let summary = result.summary();
    tracing::info!(
        artifacts = summary.artifacts.len(),
        elapsed_ms = summary.elapsed_ms,
        "done"
    );

    Response::Ok {
        ok: true,
        artifacts: summary.artifacts,
        vertex_count: summary.vertex_count,
        face_count: summary.face_count,
        previews: summary.previews,
        elapsed_ms: summary.elapsed_ms,
    }
}

async fn send_response(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    response: Response,
) -> anyhow::Result<()> {
    let mut json = serde_json::to_string(&response)?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    Ok(())
}
