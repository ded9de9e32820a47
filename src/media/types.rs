use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CameraError;

/// Playlist written into a segmented output directory.
pub const PLAYLIST_NAME: &str = "stream.m3u8";
/// ffmpeg pattern for the rolling segments next to the playlist.
pub const SEGMENT_PATTERN: &str = "stream_%03d.ts";
/// Longest recording accepted, in seconds.
pub const MAX_RECORDING_SECS: u64 = 24 * 60 * 60;

// ============================================================================
// Capture parameters
// ============================================================================

/// Values used when a caller does not say otherwise.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaptureDefaults {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    // bps
    pub bitrate: u32,
    // seconds
    pub segment_duration: f64,
    pub playlist_size: u32,
    // seconds
    pub recording_duration: u64,
}

impl Default for CaptureDefaults {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            framerate: 15,
            bitrate: 2_000_000,
            segment_duration: 0.5,
            playlist_size: 6,
            recording_duration: 30,
        }
    }
}

impl CaptureDefaults {
    pub fn validate(&self) -> Result<(), CameraError> {
        PipelineSpec::from_defaults(self)
            .with_duration(self.recording_duration)
            .with_segments(self.segment_duration, self.playlist_size)
            .validate()
    }
}

/// What one pipeline captures. Immutable once the pipeline starts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    // bps
    pub bitrate: u32,
    /// Whole seconds; recordings only.
    #[serde(default)]
    pub duration: Option<u64>,
    /// Seconds per segment; streaming only.
    #[serde(default)]
    pub segment_duration: Option<f64>,
    /// Segments kept in the live playlist; streaming only.
    #[serde(default)]
    pub playlist_size: Option<u32>,
}

impl Default for PipelineSpec {
    fn default() -> Self {
        Self::from_defaults(&CaptureDefaults::default())
    }
}

impl PipelineSpec {
    pub fn new(width: u32, height: u32) -> Self {
        Self::default().with_resolution(width, height)
    }

    pub fn from_defaults(defaults: &CaptureDefaults) -> Self {
        Self {
            width: defaults.width,
            height: defaults.height,
            framerate: defaults.framerate,
            bitrate: defaults.bitrate,
            duration: None,
            segment_duration: None,
            playlist_size: None,
        }
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_framerate(mut self, framerate: u32) -> Self {
        self.framerate = framerate;
        self
    }

    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    pub fn with_duration(mut self, seconds: u64) -> Self {
        self.duration = Some(seconds);
        self
    }

    pub fn with_segments(mut self, segment_duration: f64, playlist_size: u32) -> Self {
        self.segment_duration = Some(segment_duration);
        self.playlist_size = Some(playlist_size);
        self
    }

    pub fn validate(&self) -> Result<(), CameraError> {
        if self.width == 0 || self.height == 0 {
            return Err(CameraError::InvalidSpec(format!(
                "resolution must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        if self.framerate == 0 {
            return Err(CameraError::InvalidSpec("framerate must be positive".into()));
        }
        if self.bitrate == 0 {
            return Err(CameraError::InvalidSpec("bitrate must be positive".into()));
        }
        if self.duration == Some(0) {
            return Err(CameraError::InvalidSpec("duration must be positive".into()));
        }
        if let Some(seconds) = self.duration.filter(|s| *s > MAX_RECORDING_SECS) {
            return Err(CameraError::InvalidSpec(format!(
                "duration {}s exceeds the {}s limit",
                seconds, MAX_RECORDING_SECS
            )));
        }
        if let Some(seconds) = self.segment_duration {
            if !seconds.is_finite() || seconds <= 0.0 {
                return Err(CameraError::InvalidSpec(format!(
                    "segment duration must be positive, got {}",
                    seconds
                )));
            }
        }
        if self.playlist_size == Some(0) {
            return Err(CameraError::InvalidSpec("playlist size must be positive".into()));
        }
        Ok(())
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration.map(Duration::from_secs)
    }

    pub fn segment_duration(&self) -> f64 {
        self.segment_duration
            .unwrap_or(CaptureDefaults::default().segment_duration)
    }

    pub fn playlist_size(&self) -> u32 {
        self.playlist_size
            .unwrap_or(CaptureDefaults::default().playlist_size)
    }

    /// Frames between key frames so every segment starts on one.
    pub fn intra_period(&self) -> u32 {
        ((self.framerate as f64 * self.segment_duration()) as u32).max(1)
    }
}

// ============================================================================
// Pipeline output
// ============================================================================

/// Where the encoder writes.
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineOutput {
    /// Live HLS: playlist plus rolling segments in `dir`.
    Segmented { dir: PathBuf },
    /// One mp4 file.
    File { path: PathBuf },
    /// `count` jpeg frames named `<prefix>_001.jpg`, ... in `dir`.
    Frames {
        dir: PathBuf,
        prefix: String,
        count: u32,
        interval: Option<Duration>,
    },
}

impl PipelineOutput {
    /// Path identifying this output; distinct pipelines never share it.
    pub fn key(&self) -> PathBuf {
        match self {
            PipelineOutput::Segmented { dir } => dir.join(PLAYLIST_NAME),
            PipelineOutput::File { path } => path.clone(),
            PipelineOutput::Frames { dir, prefix, .. } => dir.join(prefix),
        }
    }

    /// File whose appearance proves the remote side is delivering data.
    pub fn artifact(&self) -> Option<PathBuf> {
        match self {
            PipelineOutput::Segmented { dir } => Some(dir.join(PLAYLIST_NAME)),
            PipelineOutput::File { path } => Some(path.clone()),
            PipelineOutput::Frames { .. } => None,
        }
    }

    /// The encoder itself decides when the work is done.
    pub fn ends_with_encoder(&self) -> bool {
        matches!(self, PipelineOutput::Frames { .. })
    }

    /// Output with a natural end (timed recording, bounded frame count).
    pub fn is_finite(&self) -> bool {
        !matches!(self, PipelineOutput::Segmented { .. })
    }

    pub fn frame_pattern(dir: &Path, prefix: &str) -> PathBuf {
        dir.join(format!("{}_%03d.jpg", prefix))
    }

    pub fn frame_path(dir: &Path, prefix: &str, index: u32) -> PathBuf {
        dir.join(format!("{}_{:03}.jpg", prefix, index))
    }
}

/// Bounds applied while launching, supervising and stopping a pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineTiming {
    /// Output artifact must appear within this window.
    pub startup_timeout: Duration,
    /// Immediate exits inside this window count as failed starts.
    pub spawn_settle: Duration,
    /// Wait for a clean exit before killing a stage.
    pub stop_grace: Duration,
    pub poll_interval: Duration,
}

impl Default for PipelineTiming {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(10),
            spawn_settle: Duration::from_millis(500),
            stop_grace: Duration::from_secs(5),
            poll_interval: Duration::from_millis(200),
        }
    }
}

// ============================================================================
// State and status
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Stopped | PipelineState::Failed)
    }

    pub fn is_active(self) -> bool {
        matches!(self, PipelineState::Starting | PipelineState::Running)
    }

    pub fn can_transition_to(self, to: PipelineState) -> bool {
        use PipelineState::*;
        match (self, to) {
            (Starting, Running)
            | (Starting, Stopping)
            | (Running, Stopping)
            | (Stopping, Stopped) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl Display for PipelineState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Stopping => "stopping",
            PipelineState::Stopped => "stopped",
            PipelineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of one pipeline.
#[derive(Clone, Debug)]
pub struct PipelineStatus {
    pub id: String,
    pub state: PipelineState,
    pub elapsed: Duration,
    /// Ended because its finite work was done (duration reached, frames written).
    pub completed: bool,
    pub last_error: Option<CameraError>,
}

#[derive(Clone, Debug, Serialize)]
pub struct StreamStatus {
    pub active: bool,
    pub state: Option<PipelineState>,
    pub elapsed_secs: f64,
    pub playlist_url: Option<String>,
    pub output_dir: PathBuf,
    pub playlist_exists: bool,
    pub segment_count: usize,
    pub latest_segment: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RecordingStatus {
    pub recording_id: String,
    pub state: PipelineState,
    pub active: bool,
    pub elapsed_secs: f64,
    pub duration_secs: u64,
    pub remaining_secs: f64,
    pub progress: f64,
    pub output_path: PathBuf,
    pub last_error: Option<String>,
}

/// Result of a short one-off command on the remote host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct CameraInfo {
    pub connected: bool,
    pub remote_host: String,
    pub camera_list: Option<String>,
    pub error: Option<String>,
}
