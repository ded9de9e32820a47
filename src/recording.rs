use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::CameraError;
use crate::media::pipe::PipelineHandle;
use crate::media::stage::StageLauncher;
use crate::media::types::{
    PipelineOutput, PipelineSpec, PipelineStatus, PipelineTiming, RecordingStatus,
};

/// A timed recording into one mp4 file.
pub struct RecordingSession {
    pipeline: PipelineHandle,
    output_path: PathBuf,
    duration: Duration,
}

impl RecordingSession {
    /// `spec.duration` must be set; the registry fills it in from the defaults.
    pub fn new(id: impl Into<String>, spec: PipelineSpec, dir: &Path) -> Self {
        let id = id.into();
        let output_path = dir.join(format!("{}.mp4", id));
        let duration = spec.duration().unwrap_or_default();
        let output = PipelineOutput::File {
            path: output_path.clone(),
        };
        Self {
            pipeline: PipelineHandle::new(id, spec, output),
            output_path,
            duration,
        }
    }

    pub fn id(&self) -> &str {
        self.pipeline.id()
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn pipeline(&self) -> &PipelineHandle {
        &self.pipeline
    }

    pub fn is_terminal(&self) -> bool {
        self.pipeline.state().is_terminal()
    }

    pub async fn launch(
        &self,
        launcher: &dyn StageLauncher,
        timing: &PipelineTiming,
    ) -> Result<(), CameraError> {
        let dir = self.output_path.parent().unwrap_or_else(|| Path::new("."));
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            return Err(self.pipeline.fail(e.into()));
        }
        self.pipeline.launch(launcher, timing).await
    }

    pub async fn stop(&self) -> Result<PipelineStatus, CameraError> {
        self.pipeline.stop().await
    }

    pub fn status(&self) -> RecordingStatus {
        let status = self.pipeline.status();
        let progress = progress(&status, self.duration);
        let elapsed = status.elapsed.as_secs_f64();
        let remaining = if status.state.is_terminal() {
            0.0
        } else {
            (self.duration.as_secs_f64() - elapsed).max(0.0)
        };
        RecordingStatus {
            recording_id: status.id,
            state: status.state,
            active: status.state.is_active(),
            elapsed_secs: elapsed,
            duration_secs: self.duration.as_secs(),
            remaining_secs: remaining,
            progress,
            output_path: self.output_path.clone(),
            last_error: status.last_error.map(|e| e.to_string()),
        }
    }
}

/// Fraction of the duration recorded; exactly 1.0 once the full duration was captured.
pub fn progress(status: &PipelineStatus, duration: Duration) -> f64 {
    if status.completed {
        return 1.0;
    }
    if duration.is_zero() {
        return 0.0;
    }
    (status.elapsed.as_secs_f64() / duration.as_secs_f64()).min(1.0)
}
