use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::CameraError;
use crate::media::pipe::{PipelineHandle, describe, force_stop};
use crate::media::stage::StageLauncher;
use crate::media::types::{PipelineOutput, PipelineSpec, PipelineState, PipelineTiming};

static CAPTURE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Longest pause accepted between two frames.
pub const MAX_FRAME_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// One-shot still capture: start, write N jpeg frames, exit.
pub struct FrameCapture {
    launcher: Arc<dyn StageLauncher>,
    timing: PipelineTiming,
    dir: PathBuf,
    timeout: Duration,
}

impl FrameCapture {
    pub fn new(
        launcher: Arc<dyn StageLauncher>,
        timing: PipelineTiming,
        dir: PathBuf,
        timeout: Duration,
    ) -> Self {
        Self {
            launcher,
            timing,
            dir,
            timeout,
        }
    }

    /// Capture `count` frames, one every `interval` when given. Returns the frame paths.
    pub async fn capture(
        &self,
        spec: PipelineSpec,
        count: u32,
        interval: Option<Duration>,
    ) -> Result<Vec<PathBuf>, CameraError> {
        let window = self.window(count, interval)?;
        let (prefix, output) = self.prepare(count, interval).await?;

        let pipeline = PipelineHandle::new(prefix.clone(), spec, output);
        pipeline.launch(self.launcher.as_ref(), &self.timing).await?;

        let status = match pipeline.wait_timeout(window).await {
            Some(status) => status,
            None => {
                log::warn!("Frames {}: nothing after {:?}, giving up", prefix, window);
                let _ = pipeline.stop().await;
                return Err(CameraError::Timeout(format!("no frames within {:?}", window)));
            }
        };

        if status.state == PipelineState::Failed {
            return Err(match status.last_error {
                Some(CameraError::Timeout(msg)) => CameraError::Timeout(msg),
                Some(err @ CameraError::CaptureFailed(_)) => err,
                Some(err) => CameraError::CaptureFailed(err.to_string()),
                None => CameraError::CaptureFailed("frame pipeline failed".into()),
            });
        }
        self.collect(&prefix, count).await
    }

    /// Sample `count` frames from the playlist of a stream that already owns the camera.
    pub async fn extract(
        &self,
        playlist: &Path,
        count: u32,
        interval: Option<Duration>,
    ) -> Result<Vec<PathBuf>, CameraError> {
        let window = self.window(count, interval)?;
        let (prefix, output) = self.prepare(count, interval).await?;
        log::info!("Frames {}: reading {}", prefix, playlist.display());

        let mut stage = self.launcher.spawn_extractor(playlist, &output)?;
        let exit = match tokio::time::timeout(window, stage.wait()).await {
            Ok(exit) => exit?,
            Err(_) => {
                log::warn!("Frames {}: nothing after {:?}, giving up", prefix, window);
                force_stop(stage.as_mut(), self.timing.stop_grace).await;
                return Err(CameraError::Timeout(format!("no frames within {:?}", window)));
            }
        };
        if !exit.success() {
            return Err(CameraError::CaptureFailed(describe(stage.as_ref(), exit)));
        }
        self.collect(&prefix, count).await
    }

    /// How long a capture of `count` frames may take.
    fn window(&self, count: u32, interval: Option<Duration>) -> Result<Duration, CameraError> {
        if count == 0 {
            return Err(CameraError::InvalidSpec("frame count must be positive".into()));
        }
        let interval = interval.unwrap_or_default();
        if interval > MAX_FRAME_INTERVAL {
            return Err(CameraError::InvalidSpec(format!(
                "frame interval {:?} exceeds {:?}",
                interval, MAX_FRAME_INTERVAL
            )));
        }
        interval
            .checked_mul(count - 1)
            .and_then(|span| span.checked_add(self.timeout))
            .ok_or_else(|| {
                let reason = format!("{} frames every {:?} is too long", count, interval);
                CameraError::InvalidSpec(reason)
            })
    }

    async fn prepare(
        &self,
        count: u32,
        interval: Option<Duration>,
    ) -> Result<(String, PipelineOutput), CameraError> {
        if interval.is_some_and(|i| i.is_zero()) {
            return Err(CameraError::InvalidSpec("frame interval must be positive".into()));
        }
        tokio::fs::create_dir_all(&self.dir).await?;

        let prefix = format!(
            "frame_{}_{}",
            chrono::Local::now().format("%Y%m%d_%H%M%S"),
            CAPTURE_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let output = PipelineOutput::Frames {
            dir: self.dir.clone(),
            prefix: prefix.clone(),
            count,
            interval,
        };
        Ok((prefix, output))
    }

    async fn collect(&self, prefix: &str, count: u32) -> Result<Vec<PathBuf>, CameraError> {
        let mut frames = Vec::new();
        for index in 1..=count {
            let path = PipelineOutput::frame_path(&self.dir, prefix, index);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                frames.push(path);
            }
        }
        if frames.is_empty() {
            return Err(CameraError::CaptureFailed("no frames were written".into()));
        }
        log::info!("Frames {}: captured {}/{}", prefix, frames.len(), count);
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::media::testing::{FakeBehavior, FakeLauncher, fast_timing};

    fn frame_capture(launcher: &Arc<FakeLauncher>, dir: &Path, timeout: Duration) -> FrameCapture {
        FrameCapture::new(launcher.clone(), fast_timing(), dir.to_path_buf(), timeout)
    }

    #[tokio::test]
    async fn test_single_frame() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new());
        let frames = frame_capture(&launcher, dir.path(), Duration::from_secs(2))
            .capture(PipelineSpec::default(), 1, None)
            .await
            .unwrap();

        assert_eq!(frames.len(), 1);
        assert!(frames[0].exists());
        assert!(frames[0].to_string_lossy().ends_with("_001.jpg"));
        assert_eq!(launcher.running(), 0);
    }

    #[tokio::test]
    async fn test_several_frames_get_distinct_names() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new());
        let capture = frame_capture(&launcher, dir.path(), Duration::from_secs(2));

        let first = capture
            .capture(PipelineSpec::default(), 3, Some(Duration::from_millis(10)))
            .await
            .unwrap();
        let second = capture.capture(PipelineSpec::default(), 1, None).await.unwrap();
        assert_eq!(first.len(), 3);
        assert!(!first.contains(&second[0]));
    }

    #[tokio::test]
    async fn test_stalled_remote_times_out_within_bound() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new().with_encoder(FakeBehavior::Silent));
        let capture = frame_capture(&launcher, dir.path(), Duration::from_millis(300));

        let started = Instant::now();
        let err = capture.capture(PipelineSpec::default(), 1, None).await.unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(launcher.running(), 0);
    }

    #[tokio::test]
    async fn test_failing_encoder_is_capture_failure() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(
            FakeLauncher::new().with_encoder(FakeBehavior::ExitAfter(Duration::from_millis(50), 1)),
        );
        let err = frame_capture(&launcher, dir.path(), Duration::from_secs(2))
            .capture(PipelineSpec::default(), 1, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "capture_failed");
    }

    #[tokio::test]
    async fn test_missing_capture_program() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new().with_capture(FakeBehavior::SpawnError));
        let err = frame_capture(&launcher, dir.path(), Duration::from_secs(2))
            .capture(PipelineSpec::default(), 1, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "process_spawn_failed");
    }

    #[tokio::test]
    async fn test_zero_frames_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new());
        let err = frame_capture(&launcher, dir.path(), Duration::from_secs(2))
            .capture(PipelineSpec::default(), 0, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_spec");
    }

    #[tokio::test]
    async fn test_interval_out_of_range_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new());
        let capture = frame_capture(&launcher, dir.path(), Duration::from_secs(2));

        let err = capture
            .capture(PipelineSpec::default(), 3, Some(Duration::MAX))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_spec");
        assert!(launcher.processes().is_empty());
    }

    // ------------------------------------------------------------------------
    // From a live playlist
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_extract_from_playlist() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new());
        let playlist = dir.path().join("hls/stream.m3u8");

        let frames = frame_capture(&launcher, dir.path(), Duration::from_secs(2))
            .extract(&playlist, 2, Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.exists()));

        let journal = launcher.journal();
        assert!(journal.contains(&format!("extractor:reading {}", playlist.display())));
        assert!(!journal.iter().any(|e| e == "capture:spawned"));
    }

    #[tokio::test]
    async fn test_stalled_extract_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new().with_encoder(FakeBehavior::Silent));
        let capture = frame_capture(&launcher, dir.path(), Duration::from_millis(200));

        let started = Instant::now();
        let err = capture
            .extract(&dir.path().join("stream.m3u8"), 1, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(launcher.running(), 0);
    }

    #[tokio::test]
    async fn test_failing_extract_is_capture_failure() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(
            FakeLauncher::new().with_encoder(FakeBehavior::ExitAfter(Duration::from_millis(20), 1)),
        );
        let err = frame_capture(&launcher, dir.path(), Duration::from_secs(2))
            .extract(&dir.path().join("stream.m3u8"), 1, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "capture_failed");
    }
}
