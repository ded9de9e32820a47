use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::config::CameraConfig;
use crate::error::CameraError;
use crate::frame::FrameCapture;
use crate::manager::RecordingRegistry;
use crate::media::stage::{ProcessLauncher, StageLauncher};
use crate::media::types::{
    CameraInfo, CaptureDefaults, PipelineSpec, PipelineState, RecordingStatus, StreamStatus,
};
use crate::stream::{StreamSession, idle_status};

const CONNECTION_TEST: &str = "echo \"camera connection test\"";

/// Entry point for everything the camera can do.
///
/// At most one live stream exists at a time. Recordings run independently of
/// it and of each other; frame captures read the stream while it is live.
pub struct CameraController {
    config: CameraConfig,
    launcher: Arc<dyn StageLauncher>,
    defaults: RwLock<CaptureDefaults>,
    stream: Mutex<Option<Arc<StreamSession>>>,
    stream_seq: AtomicU64,
    recordings: RecordingRegistry,
    frames: FrameCapture,
}

impl CameraController {
    pub fn new(config: CameraConfig) -> Self {
        let launcher = Arc::new(ProcessLauncher::new(&config));
        Self::with_launcher(config, launcher)
    }

    pub fn with_launcher(config: CameraConfig, launcher: Arc<dyn StageLauncher>) -> Self {
        let recordings = RecordingRegistry::new(
            Arc::clone(&launcher),
            config.timing.clone(),
            config.recordings_dir(),
        );
        let frames = FrameCapture::new(
            Arc::clone(&launcher),
            config.timing.clone(),
            config.frames_dir(),
            config.frame_timeout,
        );
        Self {
            defaults: RwLock::new(config.defaults.clone()),
            config,
            launcher,
            stream: Mutex::new(None),
            stream_seq: AtomicU64::new(0),
            recordings,
            frames,
        }
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Defaults
    // ------------------------------------------------------------------------

    pub fn defaults(&self) -> CaptureDefaults {
        self.defaults.read().clone()
    }

    /// Replace the defaults used by later operations. Running pipelines keep theirs.
    pub fn set_defaults(&self, defaults: CaptureDefaults) -> Result<(), CameraError> {
        defaults.validate()?;
        log::info!("Camera: defaults now {:?}", defaults);
        *self.defaults.write() = defaults;
        Ok(())
    }

    /// A spec built from the current defaults.
    pub fn spec(&self) -> PipelineSpec {
        let defaults = self.defaults.read();
        PipelineSpec::from_defaults(&defaults)
            .with_segments(defaults.segment_duration, defaults.playlist_size)
    }

    // ------------------------------------------------------------------------
    // Remote host
    // ------------------------------------------------------------------------

    pub async fn test_connection(&self) -> bool {
        match self
            .launcher
            .run_remote(CONNECTION_TEST, self.config.connect_timeout)
            .await
        {
            Ok(output) if output.success => {
                log::info!("Camera: {} reachable", self.config.remote_host);
                true
            }
            Ok(output) => {
                log::warn!(
                    "Camera: connection to {} failed: {}",
                    self.config.remote_host,
                    output.stderr.trim()
                );
                false
            }
            Err(e) => {
                log::warn!("Camera: connection to {} failed: {}", self.config.remote_host, e);
                false
            }
        }
    }

    pub async fn camera_info(&self) -> CameraInfo {
        let command = format!("{} --list-cameras", self.config.info_program);
        let result = self
            .launcher
            .run_remote(&command, self.config.connect_timeout)
            .await;
        let remote_host = self.config.remote_host.clone();
        match result {
            Ok(output) if output.success => CameraInfo {
                connected: true,
                remote_host,
                camera_list: Some(output.stdout),
                error: None,
            },
            Ok(output) => CameraInfo {
                connected: false,
                remote_host,
                camera_list: None,
                error: Some(output.stderr),
            },
            Err(e) => CameraInfo {
                connected: false,
                remote_host,
                camera_list: None,
                error: Some(e.to_string()),
            },
        }
    }

    // ------------------------------------------------------------------------
    // Live stream
    // ------------------------------------------------------------------------

    /// Start the live stream; returns its playlist URL.
    pub async fn start_stream(&self, spec: PipelineSpec) -> Result<String, CameraError> {
        spec.validate()?;
        let session = {
            let mut slot = self.stream.lock();
            if let Some(current) = slot.as_ref() {
                if !current.pipeline().state().is_terminal() {
                    return Err(CameraError::AlreadyActive);
                }
            }
            let id = format!("stream_{}", self.stream_seq.fetch_add(1, Ordering::Relaxed));
            let session = Arc::new(StreamSession::new(id, spec, self.config.stream_dir()));
            *slot = Some(Arc::clone(&session));
            session
        };

        session
            .start(
                self.launcher.as_ref(),
                &self.config.timing,
                self.config.http_addr,
                self.config.public_url.as_deref(),
            )
            .await
    }

    /// Stop the live stream if there is one. Never fails.
    pub async fn stop_stream(&self) -> StreamStatus {
        let session = self.stream.lock().clone();
        match session {
            Some(session) => {
                session.stop().await;
                session.status().await
            }
            None => idle_status(&self.config.stream_dir()).await,
        }
    }

    pub async fn stream_status(&self) -> StreamStatus {
        let session = self.stream.lock().clone();
        match session {
            Some(session) => session.status().await,
            None => idle_status(&self.config.stream_dir()).await,
        }
    }

    // ------------------------------------------------------------------------
    // Frames
    // ------------------------------------------------------------------------

    pub async fn capture_frame(&self, spec: PipelineSpec) -> Result<PathBuf, CameraError> {
        let frames = self.capture_frames(spec, 1, None).await?;
        frames
            .into_iter()
            .next()
            .ok_or_else(|| CameraError::CaptureFailed("no frame was written".into()))
    }

    /// While a stream holds the camera, frames come from its playlist and
    /// `spec` is not used.
    pub async fn capture_frames(
        &self,
        spec: PipelineSpec,
        count: u32,
        interval: Option<Duration>,
    ) -> Result<Vec<PathBuf>, CameraError> {
        match self.live_playlist() {
            Some(playlist) => self.frames.extract(&playlist, count, interval).await,
            None => self.frames.capture(spec, count, interval).await,
        }
    }

    fn live_playlist(&self) -> Option<PathBuf> {
        let slot = self.stream.lock();
        slot.as_ref()
            .filter(|session| session.pipeline().state() == PipelineState::Running)
            .map(|session| session.playlist_path())
    }

    // ------------------------------------------------------------------------
    // Recordings
    // ------------------------------------------------------------------------

    /// Start a recording; without a duration the default one is used.
    pub async fn start_recording(&self, spec: PipelineSpec) -> Result<String, CameraError> {
        let spec = match spec.duration {
            Some(_) => spec,
            None => {
                let seconds = self.defaults.read().recording_duration;
                spec.with_duration(seconds)
            }
        };
        self.recordings.start_recording(spec).await
    }

    pub async fn stop_recording(&self, id: &str) -> Result<RecordingStatus, CameraError> {
        self.recordings.stop_recording(id).await
    }

    pub async fn recording_status(&self, id: &str) -> Result<RecordingStatus, CameraError> {
        self.recordings.get_status(id).await
    }

    pub async fn recordings(&self) -> Vec<RecordingStatus> {
        self.recordings.list().await
    }

    pub async fn sweep_recordings(&self) -> Vec<String> {
        self.recordings.sweep().await
    }

    /// Stop the stream and every recording, then forget finished recordings.
    pub async fn cleanup(&self) {
        log::info!("Camera: cleaning up");
        self.stop_stream().await;
        self.recordings.stop_all().await;
        self.recordings.sweep().await;
    }
}

#[cfg(test)]
#[path = "controller_test.rs"]
mod controller_test;
