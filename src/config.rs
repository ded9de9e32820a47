use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

use crate::media::types::{CaptureDefaults, PipelineTiming};

/// Everything the controller needs to reach the camera and place its output.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    /// `user@host` handed to ssh.
    pub remote_host: String,
    pub ssh_program: String,
    /// Options placed before the host on every ssh invocation.
    pub ssh_options: Vec<String>,
    pub capture_program: String,
    pub info_program: String,
    pub encoder_program: String,
    pub output_dir: PathBuf,
    pub http_addr: SocketAddr,
    /// Base URL clients use to reach the file server, when it differs from the bound address.
    pub public_url: Option<String>,
    pub defaults: CaptureDefaults,
    pub timing: PipelineTiming,
    pub frame_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            remote_host: "pi@camera.local".to_string(),
            ssh_program: "ssh".to_string(),
            ssh_options: vec!["-o".to_string(), "BatchMode=yes".to_string()],
            capture_program: "libcamera-vid".to_string(),
            info_program: "libcamera-hello".to_string(),
            encoder_program: "ffmpeg".to_string(),
            output_dir: PathBuf::from("camera_output"),
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            public_url: None,
            defaults: CaptureDefaults::default(),
            timing: PipelineTiming::default(),
            frame_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl CameraConfig {
    /// Defaults overridden by `CAMERA_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(host) = get("CAMERA_REMOTE_HOST") {
            config.remote_host = host;
        }
        if let Some(dir) = get("CAMERA_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(dir);
        }
        if let Some(addr) = get("CAMERA_HTTP_ADDR") {
            config.http_addr = addr
                .parse()
                .with_context(|| format!("CAMERA_HTTP_ADDR is not a socket address: {}", addr))?;
        }
        if let Some(url) = get("CAMERA_PUBLIC_URL") {
            config.public_url = Some(url.trim_end_matches('/').to_string());
        }
        if let Some(program) = get("CAMERA_SSH_PROGRAM") {
            config.ssh_program = program;
        }
        if let Some(program) = get("CAMERA_CAPTURE_PROGRAM") {
            config.capture_program = program;
        }
        if let Some(program) = get("CAMERA_ENCODER_PROGRAM") {
            config.encoder_program = program;
        }

        config.defaults.validate().context("invalid capture defaults")?;
        Ok(config)
    }

    pub fn stream_dir(&self) -> PathBuf {
        self.output_dir.join("hls")
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.output_dir.join("recordings")
    }

    pub fn frames_dir(&self) -> PathBuf {
        self.output_dir.join("frames")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let config = CameraConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.remote_host, "pi@camera.local");
        assert_eq!(config.http_addr.port(), 8000);
        assert_eq!(config.stream_dir(), PathBuf::from("camera_output/hls"));
        assert_eq!(config.recordings_dir(), PathBuf::from("camera_output/recordings"));
        assert!(config.public_url.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let config = CameraConfig::from_lookup(lookup(&[
            ("CAMERA_REMOTE_HOST", "me@10.0.0.7"),
            ("CAMERA_OUTPUT_DIR", "/var/cam"),
            ("CAMERA_HTTP_ADDR", "127.0.0.1:9000"),
            ("CAMERA_PUBLIC_URL", "http://cam.example/"),
            ("CAMERA_ENCODER_PROGRAM", " "),
        ]))
        .unwrap();
        assert_eq!(config.remote_host, "me@10.0.0.7");
        assert_eq!(config.frames_dir(), PathBuf::from("/var/cam/frames"));
        assert_eq!(config.http_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.public_url.as_deref(), Some("http://cam.example"));
        // blank values are ignored
        assert_eq!(config.encoder_program, "ffmpeg");
    }

    #[test]
    fn test_bad_http_addr_is_reported() {
        let err = CameraConfig::from_lookup(lookup(&[("CAMERA_HTTP_ADDR", "nope")])).unwrap_err();
        assert!(err.to_string().contains("CAMERA_HTTP_ADDR"));
    }
}
