pub mod api;
pub mod config;
pub mod controller;
pub mod error;
pub mod frame;
pub mod manager;
pub mod media;
pub mod recording;
pub mod stream;

pub use config::CameraConfig;
pub use controller::CameraController;
pub use error::CameraError;
pub use media::types::{
    CameraInfo, CaptureDefaults, PipelineSpec, PipelineState, RecordingStatus, StreamStatus,
};
