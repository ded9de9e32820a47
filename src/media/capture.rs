use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::config::CameraConfig;
use crate::error::CameraError;
use crate::media::stage::{ByteStream, ChildStage};
use crate::media::types::{PipelineOutput, PipelineSpec, RemoteOutput};

/// Starts the camera on the remote host over ssh; video comes back on stdout.
pub struct RemoteCaptureLauncher {
    ssh_program: String,
    ssh_options: Vec<String>,
    remote_host: String,
    capture_program: String,
}

impl RemoteCaptureLauncher {
    pub fn new(config: &CameraConfig) -> Self {
        Self {
            ssh_program: config.ssh_program.clone(),
            ssh_options: config.ssh_options.clone(),
            remote_host: config.remote_host.clone(),
            capture_program: config.capture_program.clone(),
        }
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    /// Command line executed on the remote host.
    pub fn remote_command(&self, spec: &PipelineSpec, output: &PipelineOutput) -> String {
        let geometry = format!(
            "--framerate {} --width {} --height {}",
            spec.framerate, spec.width, spec.height
        );
        match output {
            PipelineOutput::Segmented { .. } => format!(
                "{} -t 0 --codec h264 --inline {} --intra {} --bitrate {} --nopreview -o -",
                self.capture_program,
                geometry,
                spec.intra_period(),
                spec.bitrate
            ),
            PipelineOutput::File { .. } => {
                // 0 = run until stopped
                let millis = spec.duration.unwrap_or(0).saturating_mul(1000);
                format!(
                    "{} -t {} --codec h264 --inline {} --bitrate {} --nopreview -o -",
                    self.capture_program, millis, geometry, spec.bitrate
                )
            }
            PipelineOutput::Frames { .. } => format!(
                "{} -t 0 --codec mjpeg {} --nopreview -o -",
                self.capture_program, geometry
            ),
        }
    }

    pub fn ssh_args(&self, extra_options: &[String], remote_command: &str) -> Vec<String> {
        let mut args = self.ssh_options.clone();
        args.extend_from_slice(extra_options);
        args.push(self.remote_host.clone());
        args.push(remote_command.to_string());
        args
    }

    pub fn spawn(
        &self,
        spec: &PipelineSpec,
        output: &PipelineOutput,
    ) -> Result<(ChildStage, ByteStream), CameraError> {
        let remote = self.remote_command(spec, output);
        log::info!("RemoteCapture: `{}` on {}", remote, self.remote_host);

        let mut child = Command::new(&self.ssh_program)
            .args(self.ssh_args(&[], &remote))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CameraError::spawn("capture", &self.ssh_program, e))?;

        let stdio: Result<Stdio, String> = match child.stdout.take() {
            Some(stdout) => stdout.try_into().map_err(|e: std::io::Error| e.to_string()),
            None => Err("stdout was not captured".to_string()),
        };
        match stdio {
            Ok(stdio) => Ok((ChildStage::new("capture", child), ByteStream::from_stdio(stdio))),
            Err(reason) => {
                let _ = child.start_kill();
                Err(CameraError::ProcessSpawnFailed {
                    stage: "capture",
                    reason,
                })
            }
        }
    }

    /// Run a one-off command remotely, giving up after `limit`.
    pub async fn run(
        &self,
        remote_command: &str,
        limit: Duration,
    ) -> Result<RemoteOutput, CameraError> {
        let connect_timeout = format!("ConnectTimeout={}", limit.as_secs().max(1));
        let args = self.ssh_args(&["-o".to_string(), connect_timeout], remote_command);

        let mut command = Command::new(&self.ssh_program);
        command.args(&args).stdin(Stdio::null()).kill_on_drop(true);

        let output = match tokio::time::timeout(limit, command.output()).await {
            Ok(result) => result.map_err(|e| CameraError::spawn("remote", &self.ssh_program, e))?,
            Err(_) => {
                return Err(CameraError::Timeout(format!(
                    "`{}` on {} did not return within {:?}",
                    remote_command, self.remote_host, limit
                )));
            }
        };

        Ok(RemoteOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
