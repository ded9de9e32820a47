//! In-process stand-ins for the ssh capture and the local encoder.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::CameraError;
use crate::media::stage::{ByteStream, Stage, StageExit, StageLauncher};
use crate::media::types::{
    PLAYLIST_NAME, PipelineOutput, PipelineSpec, PipelineTiming, RemoteOutput,
};

const SIGTERM: i32 = 15;
const SIGKILL: i32 = 9;

#[derive(Clone, Debug, PartialEq)]
pub enum FakeBehavior {
    /// Works normally: encoder writes its output, both stop when asked.
    Run,
    /// Runs but the encoder never writes anything.
    Silent,
    /// Exits on its own with the code after the delay.
    ExitAfter(Duration, i32),
    /// Ignores terminate requests; only kill ends it.
    Stubborn,
    /// Cannot be started at all.
    SpawnError,
}

pub fn fast_timing() -> PipelineTiming {
    PipelineTiming {
        startup_timeout: Duration::from_secs(2),
        spawn_settle: Duration::ZERO,
        stop_grace: Duration::from_millis(300),
        poll_interval: Duration::from_millis(10),
    }
}

type Journal = Arc<Mutex<Vec<String>>>;

/// Inspection handle on one fake process.
#[derive(Clone)]
pub struct FakeProcess {
    pub name: &'static str,
    pub output: PathBuf,
    exit_tx: Arc<watch::Sender<Option<StageExit>>>,
    terminated: Arc<AtomicBool>,
    killed: Arc<AtomicBool>,
    journal: Journal,
}

impl FakeProcess {
    fn new(name: &'static str, output: PathBuf, journal: Journal) -> Self {
        let (exit_tx, _) = watch::channel(None);
        Self {
            name,
            output,
            exit_tx: Arc::new(exit_tx),
            terminated: Arc::new(AtomicBool::new(false)),
            killed: Arc::new(AtomicBool::new(false)),
            journal,
        }
    }

    fn exit(&self, exit: StageExit) {
        let changed = self.exit_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(exit);
                true
            } else {
                false
            }
        });
        if changed {
            self.journal.lock().push(format!("{}:exited", self.name));
        }
    }

    fn exit_after(&self, delay: Duration, exit: StageExit) {
        let process = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            process.exit(exit);
        });
    }

    pub fn exit_status(&self) -> Option<StageExit> {
        *self.exit_tx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.exit_status().is_none()
    }

    pub fn was_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

struct FakeStage {
    process: FakeProcess,
    behavior: FakeBehavior,
    exit_rx: watch::Receiver<Option<StageExit>>,
}

#[async_trait]
impl Stage for FakeStage {
    fn name(&self) -> &str {
        self.process.name
    }

    fn pid(&self) -> Option<u32> {
        self.process.is_running().then_some(4242)
    }

    fn signal_stop(&mut self) -> io::Result<()> {
        self.process.terminated.store(true, Ordering::SeqCst);
        self.process
            .journal
            .lock()
            .push(format!("{}:terminated", self.process.name));
        if self.behavior != FakeBehavior::Stubborn {
            self.process.exit(StageExit::signalled(SIGTERM));
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.process.killed.store(true, Ordering::SeqCst);
        self.process.exit(StageExit::signalled(SIGKILL));
        Ok(())
    }

    fn try_exit(&mut self) -> io::Result<Option<StageExit>> {
        Ok(*self.exit_rx.borrow())
    }

    async fn wait(&mut self) -> io::Result<StageExit> {
        let exit = self
            .exit_rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| io::Error::other("fake process vanished"))?;
        Ok((*exit).unwrap_or(StageExit::signalled(SIGKILL)))
    }

    fn error_tail(&self) -> Option<String> {
        match *self.exit_rx.borrow() {
            Some(exit) if exit.code.is_some_and(|c| c != 0) => {
                Some(format!("{}: simulated failure", self.process.name))
            }
            _ => None,
        }
    }
}

/// Launcher handing out fake stages; encoders end when their capture ends.
pub struct FakeLauncher {
    capture: Mutex<FakeBehavior>,
    encoder: Mutex<FakeBehavior>,
    journal: Journal,
    processes: Mutex<Vec<FakeProcess>>,
    captures: Mutex<HashMap<PathBuf, FakeProcess>>,
    remote_reply: Mutex<Result<RemoteOutput, CameraError>>,
    remote_delay: Mutex<Duration>,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self {
            capture: Mutex::new(FakeBehavior::Run),
            encoder: Mutex::new(FakeBehavior::Run),
            journal: Arc::new(Mutex::new(Vec::new())),
            processes: Mutex::new(Vec::new()),
            captures: Mutex::new(HashMap::new()),
            remote_reply: Mutex::new(Ok(RemoteOutput {
                success: true,
                code: Some(0),
                stdout: "ok\n".to_string(),
                stderr: String::new(),
            })),
            remote_delay: Mutex::new(Duration::ZERO),
        }
    }
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capture(self, behavior: FakeBehavior) -> Self {
        *self.capture.lock() = behavior;
        self
    }

    pub fn with_encoder(self, behavior: FakeBehavior) -> Self {
        *self.encoder.lock() = behavior;
        self
    }

    pub fn set_capture(&self, behavior: FakeBehavior) {
        *self.capture.lock() = behavior;
    }

    pub fn set_encoder(&self, behavior: FakeBehavior) {
        *self.encoder.lock() = behavior;
    }

    pub fn set_remote(&self, reply: Result<RemoteOutput, CameraError>, delay: Duration) {
        *self.remote_reply.lock() = reply;
        *self.remote_delay.lock() = delay;
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }

    pub fn processes(&self) -> Vec<FakeProcess> {
        self.processes.lock().clone()
    }

    pub fn process(&self, name: &str, output: &Path) -> Option<FakeProcess> {
        self.processes
            .lock()
            .iter()
            .rev()
            .find(|p| p.name == name && p.output == output)
            .cloned()
    }

    pub fn running(&self) -> usize {
        self.processes.lock().iter().filter(|p| p.is_running()).count()
    }

    fn start(
        &self,
        name: &'static str,
        output: &PipelineOutput,
        behavior: &FakeBehavior,
    ) -> FakeProcess {
        let process = FakeProcess::new(name, output.key(), Arc::clone(&self.journal));
        self.journal.lock().push(format!("{}:spawned", name));
        if let FakeBehavior::ExitAfter(delay, code) = behavior {
            process.exit_after(*delay, StageExit::code(*code));
        }
        self.processes.lock().push(process.clone());
        process
    }
}

fn spawn_error(stage: &'static str) -> CameraError {
    CameraError::ProcessSpawnFailed {
        stage,
        reason: "simulated spawn failure".to_string(),
    }
}

/// Put on disk what a working encoder would have produced.
fn write_output(output: &PipelineOutput) -> io::Result<()> {
    match output {
        PipelineOutput::Segmented { dir } => {
            std::fs::create_dir_all(dir)?;
            std::fs::write(dir.join("stream_000.ts"), b"ts")?;
            std::fs::write(
                dir.join(PLAYLIST_NAME),
                "#EXTM3U\n#EXT-X-VERSION:3\n#EXTINF:0.5,\nstream_000.ts\n",
            )
        }
        PipelineOutput::File { path } => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, b"mp4")
        }
        PipelineOutput::Frames {
            dir, prefix, count, ..
        } => {
            std::fs::create_dir_all(dir)?;
            for index in 1..=*count {
                std::fs::write(PipelineOutput::frame_path(dir, prefix, index), b"jpeg")?;
            }
            Ok(())
        }
    }
}

#[async_trait]
impl StageLauncher for FakeLauncher {
    fn spawn_capture(
        &self,
        _spec: &PipelineSpec,
        output: &PipelineOutput,
    ) -> Result<(Box<dyn Stage>, ByteStream), CameraError> {
        let behavior = self.capture.lock().clone();
        if behavior == FakeBehavior::SpawnError {
            return Err(spawn_error("capture"));
        }
        let process = self.start("capture", output, &behavior);
        self.captures.lock().insert(output.key(), process.clone());

        let exit_rx = process.exit_tx.subscribe();
        let stage = FakeStage {
            process,
            behavior,
            exit_rx,
        };
        Ok((Box::new(stage), ByteStream::detached()))
    }

    fn spawn_encoder(
        &self,
        _spec: &PipelineSpec,
        output: &PipelineOutput,
        _input: ByteStream,
    ) -> Result<Box<dyn Stage>, CameraError> {
        let behavior = self.encoder.lock().clone();
        if behavior == FakeBehavior::SpawnError {
            return Err(spawn_error("encoder"));
        }
        let process = self.start("encoder", output, &behavior);

        if behavior != FakeBehavior::Silent {
            write_output(output).map_err(CameraError::from)?;
        }

        if output.ends_with_encoder() && behavior == FakeBehavior::Run {
            process.exit(StageExit::code(0));
        } else if behavior != FakeBehavior::Stubborn {
            // end of input ends the encoder
            if let Some(capture) = self.captures.lock().get(&output.key()).cloned() {
                let encoder = process.clone();
                let mut capture_rx = capture.exit_tx.subscribe();
                tokio::spawn(async move {
                    if capture_rx.wait_for(Option::is_some).await.is_ok() {
                        encoder.exit(StageExit::code(0));
                    }
                });
            }
        }

        let exit_rx = process.exit_tx.subscribe();
        Ok(Box::new(FakeStage {
            process,
            behavior,
            exit_rx,
        }))
    }

    /// Follows the encoder behaviour; a running one writes every frame and exits.
    fn spawn_extractor(
        &self,
        playlist: &Path,
        output: &PipelineOutput,
    ) -> Result<Box<dyn Stage>, CameraError> {
        let behavior = self.encoder.lock().clone();
        if behavior == FakeBehavior::SpawnError {
            return Err(spawn_error("extractor"));
        }
        self.journal
            .lock()
            .push(format!("extractor:reading {}", playlist.display()));
        let process = self.start("extractor", output, &behavior);
        if behavior == FakeBehavior::Run {
            write_output(output).map_err(CameraError::from)?;
            process.exit(StageExit::code(0));
        }

        let exit_rx = process.exit_tx.subscribe();
        Ok(Box::new(FakeStage {
            process,
            behavior,
            exit_rx,
        }))
    }

    async fn run_remote(
        &self,
        command: &str,
        limit: Duration,
    ) -> Result<RemoteOutput, CameraError> {
        self.journal.lock().push(format!("remote:{}", command));
        let delay = *self.remote_delay.lock();
        if delay > limit {
            tokio::time::sleep(limit).await;
            return Err(CameraError::Timeout(format!("`{}` did not return", command)));
        }
        tokio::time::sleep(delay).await;
        self.remote_reply.lock().clone()
    }
}
