use thiserror::Error;

/// Failure kinds surfaced by the camera core.
///
/// Cloneable so a pipeline can keep its last error and hand copies to every
/// status reader.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CameraError {
    #[error("a stream is already active")]
    AlreadyActive,

    #[error("recording not found: {0}")]
    NotFound(String),

    #[error("failed to start {stage} process: {reason}")]
    ProcessSpawnFailed { stage: &'static str, reason: String },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("capture failed: {0}")]
    CaptureFailed(String),

    #[error("encode failed: {0}")]
    EncodeFailed(String),

    #[error("pipeline {0} has already finished")]
    AlreadyTerminal(String),

    #[error("invalid pipeline spec: {0}")]
    InvalidSpec(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl CameraError {
    /// Short machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            CameraError::AlreadyActive => "already_active",
            CameraError::NotFound(_) => "not_found",
            CameraError::ProcessSpawnFailed { .. } => "process_spawn_failed",
            CameraError::Timeout(_) => "timeout",
            CameraError::CaptureFailed(_) => "capture_failed",
            CameraError::EncodeFailed(_) => "encode_failed",
            CameraError::AlreadyTerminal(_) => "already_terminal",
            CameraError::InvalidSpec(_) => "invalid_spec",
            CameraError::Io(_) => "io",
        }
    }

    pub(crate) fn spawn(stage: &'static str, program: &str, err: std::io::Error) -> Self {
        let reason = if err.kind() == std::io::ErrorKind::NotFound {
            format!("`{}` not found", program)
        } else {
            format!("`{}`: {}", program, err)
        };
        CameraError::ProcessSpawnFailed { stage, reason }
    }
}

impl From<std::io::Error> for CameraError {
    fn from(err: std::io::Error) -> Self {
        CameraError::Io(err.to_string())
    }
}
