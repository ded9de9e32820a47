use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use remote_cam::{CameraConfig, CameraController, PipelineSpec};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

const STATUS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "remote-cam")]
#[command(about = "Stream, record and capture frames from a camera reachable over ssh")]
#[command(version)]
struct Cli {
    /// Remote host as user@host (overrides CAMERA_REMOTE_HOST)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Output directory (overrides CAMERA_OUTPUT_DIR)
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the remote host answers over ssh
    Test,

    /// List the cameras attached to the remote host
    Info,

    /// Serve a live HLS stream until Ctrl-C
    Stream {
        #[command(flatten)]
        capture: CaptureArgs,
    },

    /// Capture a single jpeg frame
    Capture {
        #[command(flatten)]
        capture: CaptureArgs,
    },

    /// Capture several jpeg frames
    Frames {
        #[command(flatten)]
        capture: CaptureArgs,

        #[arg(short = 'n', long, default_value = "5")]
        count: u32,

        /// Seconds between frames
        #[arg(short, long)]
        interval: Option<f64>,
    },

    /// Record an mp4 of fixed length
    Record {
        #[command(flatten)]
        capture: CaptureArgs,

        /// Seconds (default from the capture defaults)
        #[arg(short, long)]
        duration: Option<u64>,
    },
}

#[derive(Args)]
struct CaptureArgs {
    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    #[arg(long)]
    framerate: Option<u32>,

    /// Bits per second
    #[arg(long)]
    bitrate: Option<u32>,
}

impl CaptureArgs {
    fn apply(&self, mut spec: PipelineSpec) -> PipelineSpec {
        spec.width = self.width.unwrap_or(spec.width);
        spec.height = self.height.unwrap_or(spec.height);
        spec.framerate = self.framerate.unwrap_or(spec.framerate);
        spec.bitrate = self.bitrate.unwrap_or(spec.bitrate);
        spec
    }
}

fn init_logging() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    let mut config = CameraConfig::from_env().context("loading configuration")?;
    if let Some(host) = cli.host {
        config.remote_host = host;
    }
    if let Some(output) = cli.output {
        config.output_dir = output;
    }
    let camera = CameraController::new(config);

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Ctrl-C received, stopping");
            cancel_clone.cancel();
        }
    });

    let result = run(&camera, cli.command, &cancel).await;
    camera.cleanup().await;
    result
}

async fn run(
    camera: &CameraController,
    command: Commands,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    match command {
        Commands::Test => {
            let connected = camera.test_connection().await;
            print_json(&serde_json::json!({
                "connected": connected,
                "remote_host": camera.config().remote_host,
            }))?;
            if !connected {
                anyhow::bail!("cannot reach {}", camera.config().remote_host);
            }
        }
        Commands::Info => {
            print_json(&camera.camera_info().await)?;
        }
        Commands::Stream { capture } => {
            let url = camera
                .start_stream(capture.apply(camera.spec()))
                .await
                .context("starting stream")?;
            print_json(&serde_json::json!({ "playlist_url": url }))?;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(STATUS_INTERVAL) => {
                        let status = camera.stream_status().await;
                        if !status.active {
                            print_json(&status)?;
                            anyhow::bail!(
                                "stream ended: {}",
                                status.last_error.unwrap_or_else(|| "no error reported".into())
                            );
                        }
                        log::info!(
                            "Stream: {} segments, latest {:?}",
                            status.segment_count,
                            status.latest_segment
                        );
                    }
                }
            }
            print_json(&camera.stop_stream().await)?;
        }
        Commands::Capture { capture } => {
            let frame = camera
                .capture_frame(capture.apply(camera.spec()))
                .await
                .context("capturing frame")?;
            print_json(&serde_json::json!({ "frame": frame }))?;
        }
        Commands::Frames {
            capture,
            count,
            interval,
        } => {
            let interval = interval
                .map(Duration::try_from_secs_f64)
                .transpose()
                .context("interval must be a positive number of seconds")?;
            let frames = camera
                .capture_frames(capture.apply(camera.spec()), count, interval)
                .await
                .context("capturing frames")?;
            print_json(&serde_json::json!({ "frames": frames }))?;
        }
        Commands::Record { capture, duration } => {
            let mut spec = capture.apply(camera.spec());
            spec.duration = duration;
            let id = camera
                .start_recording(spec)
                .await
                .context("starting recording")?;

            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            let status = loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        match camera.stop_recording(&id).await {
                            Ok(status) => break status,
                            // finished on its own meanwhile
                            Err(_) => break camera.recording_status(&id).await?,
                        }
                    }
                    _ = ticker.tick() => {
                        let status = camera.recording_status(&id).await?;
                        if status.state.is_terminal() {
                            break status;
                        }
                        log::info!("Recording {}: {:.0}%", id, status.progress * 100.0);
                    }
                }
            };
            print_json(&status)?;
            if let Some(error) = status.last_error {
                anyhow::bail!("recording {} failed: {}", id, error);
            }
        }
    }
    Ok(())
}
