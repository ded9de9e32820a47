//! Two-stage capture pipeline: remote camera over ssh feeding a local encoder
//!
//! Data Flow:
//! ```text
//!   remote host                         local host
//! ┌──────────────────────┐  ssh stdout  ┌──────────────────┐
//! │ libcamera-vid -o -   │ ───────────► │ ffmpeg -i pipe:0 │ ──► stream.m3u8 + stream_NNN.ts
//! │ (h264 or mjpeg)      │  (pipe fd)   │                  │ ──► <id>.mp4
//! └──────────────────────┘              └──────────────────┘ ──► <prefix>_NNN.jpg
//!            ▲                                   ▲
//!            └──────── supervising task ─────────┘
//!                  (one per PipelineHandle)
//! ```
//!
//! Teardown always runs capture first: once ssh is gone the encoder sees end
//! of input and finalises its output before it is waited on.

pub mod capture;
pub mod encoder;
pub mod pipe;
pub mod stage;
#[cfg(test)]
pub(crate) mod testing;
pub mod types;
