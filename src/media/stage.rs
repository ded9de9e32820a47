use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr};

use crate::config::CameraConfig;
use crate::error::CameraError;
use crate::media::capture::RemoteCaptureLauncher;
use crate::media::encoder::LocalEncoder;
use crate::media::types::{PipelineOutput, PipelineSpec, RemoteOutput};

const STDERR_TAIL_LINES: usize = 20;

/// How a stage ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl StageExit {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signalled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for StageExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl Display for StageExit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => f.write_str("unknown exit"),
        }
    }
}

/// Bytes flowing from the capture stage into the encoder.
pub struct ByteStream(Option<Stdio>);

impl ByteStream {
    pub fn from_stdio(stdio: Stdio) -> Self {
        Self(Some(stdio))
    }

    /// No real pipe behind it; the encoder reads nothing.
    pub fn detached() -> Self {
        Self(None)
    }

    pub fn into_stdio(self) -> Stdio {
        self.0.unwrap_or_else(Stdio::null)
    }
}

/// One half of a pipeline: something that runs, can be asked to stop, and exits.
#[async_trait]
pub trait Stage: Send {
    fn name(&self) -> &str;

    fn pid(&self) -> Option<u32>;

    /// Ask for a clean exit (SIGTERM for processes).
    fn signal_stop(&mut self) -> io::Result<()>;

    /// Force the stage down without waiting.
    fn kill(&mut self) -> io::Result<()>;

    fn try_exit(&mut self) -> io::Result<Option<StageExit>>;

    async fn wait(&mut self) -> io::Result<StageExit>;

    /// Last lines the stage wrote to stderr.
    fn error_tail(&self) -> Option<String>;
}

/// Creates the two stages of a pipeline.
#[async_trait]
pub trait StageLauncher: Send + Sync {
    fn spawn_capture(
        &self,
        spec: &PipelineSpec,
        output: &PipelineOutput,
    ) -> Result<(Box<dyn Stage>, ByteStream), CameraError>;

    fn spawn_encoder(
        &self,
        spec: &PipelineSpec,
        output: &PipelineOutput,
        input: ByteStream,
    ) -> Result<Box<dyn Stage>, CameraError>;

    /// Pull frames out of an already running segmented output; `output` is `Frames`.
    fn spawn_extractor(
        &self,
        playlist: &Path,
        output: &PipelineOutput,
    ) -> Result<Box<dyn Stage>, CameraError>;

    /// Run a short command on the remote host.
    async fn run_remote(
        &self,
        command: &str,
        limit: Duration,
    ) -> Result<RemoteOutput, CameraError>;
}

// ============================================================================
// Child process stage
// ============================================================================

pub struct ChildStage {
    name: &'static str,
    child: Child,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl ChildStage {
    pub fn new(name: &'static str, mut child: Child) -> Self {
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(name, stderr, Arc::clone(&stderr_tail)));
        }
        Self {
            name,
            child,
            stderr_tail,
        }
    }
}

/// Keeps the stderr pipe empty so a chatty process never blocks on it.
async fn drain_stderr(name: &'static str, stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        log::debug!("{}: {}", name, line);
        let mut tail = tail.lock();
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

#[async_trait]
impl Stage for ChildStage {
    fn name(&self) -> &str {
        self.name
    }

    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    #[cfg(unix)]
    fn signal_stop(&mut self) -> io::Result<()> {
        // None once the child has been reaped
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(())
        } else {
            Err(err)
        }
    }

    #[cfg(not(unix))]
    fn signal_stop(&mut self) -> io::Result<()> {
        self.kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        match self.child.start_kill() {
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }

    fn try_exit(&mut self) -> io::Result<Option<StageExit>> {
        Ok(self.child.try_wait()?.map(StageExit::from))
    }

    async fn wait(&mut self) -> io::Result<StageExit> {
        Ok(self.child.wait().await?.into())
    }

    fn error_tail(&self) -> Option<String> {
        let tail = self.stderr_tail.lock();
        if tail.is_empty() {
            None
        } else {
            Some(tail.iter().cloned().collect::<Vec<_>>().join("\n"))
        }
    }
}

// ============================================================================
// ssh + ffmpeg launcher
// ============================================================================

/// Remote capture over ssh feeding a local ffmpeg.
pub struct ProcessLauncher {
    capture: RemoteCaptureLauncher,
    encoder: LocalEncoder,
}

impl ProcessLauncher {
    pub fn new(config: &CameraConfig) -> Self {
        Self {
            capture: RemoteCaptureLauncher::new(config),
            encoder: LocalEncoder::new(&config.encoder_program),
        }
    }
}

#[async_trait]
impl StageLauncher for ProcessLauncher {
    fn spawn_capture(
        &self,
        spec: &PipelineSpec,
        output: &PipelineOutput,
    ) -> Result<(Box<dyn Stage>, ByteStream), CameraError> {
        let (stage, stream) = self.capture.spawn(spec, output)?;
        Ok((Box::new(stage), stream))
    }

    fn spawn_encoder(
        &self,
        spec: &PipelineSpec,
        output: &PipelineOutput,
        input: ByteStream,
    ) -> Result<Box<dyn Stage>, CameraError> {
        Ok(Box::new(self.encoder.spawn(spec, output, input)?))
    }

    fn spawn_extractor(
        &self,
        playlist: &Path,
        output: &PipelineOutput,
    ) -> Result<Box<dyn Stage>, CameraError> {
        Ok(Box::new(self.encoder.spawn_extractor(playlist, output)?))
    }

    async fn run_remote(
        &self,
        command: &str,
        limit: Duration,
    ) -> Result<RemoteOutput, CameraError> {
        self.capture.run(command, limit).await
    }
}
