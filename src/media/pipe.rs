use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{Instant as TokioInstant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::CameraError;
use crate::media::stage::{Stage, StageExit, StageLauncher};
use crate::media::types::{
    PipelineOutput, PipelineSpec, PipelineState, PipelineStatus, PipelineTiming,
};

/// One capture + encode pipeline and its lifecycle.
///
/// Stages are owned by a supervising task once the pipeline is running; the
/// handle only reads status and requests a stop. Dropping the handle stops
/// the pipeline.
pub struct PipelineHandle {
    shared: Arc<Shared>,
    spec: PipelineSpec,
    output: PipelineOutput,
    cancel: CancellationToken,
    /// Set by the first of `launch` and `stop`; stages are never spawned after a stop.
    claimed: AtomicBool,
}

struct Shared {
    id: String,
    inner: Mutex<StatusInner>,
    state_tx: watch::Sender<PipelineState>,
}

struct StatusInner {
    state: PipelineState,
    transitions: Vec<(PipelineState, Instant)>,
    running_at: Option<Instant>,
    ended_at: Option<Instant>,
    last_error: Option<CameraError>,
    completed: bool,
}

impl Shared {
    fn transition(&self, to: PipelineState, error: Option<CameraError>) -> bool {
        {
            let mut inner = self.inner.lock();
            if !inner.state.can_transition_to(to) {
                log::debug!("Pipeline {}: ignoring {} -> {}", self.id, inner.state, to);
                return false;
            }
            let now = Instant::now();
            inner.state = to;
            inner.transitions.push((to, now));
            if to == PipelineState::Running {
                inner.running_at = Some(now);
            }
            if to.is_terminal() {
                inner.ended_at = Some(now);
            }
            if error.is_some() {
                inner.last_error = error;
            }
        }
        self.state_tx.send_replace(to);
        true
    }

    fn mark_completed(&self) {
        self.inner.lock().completed = true;
    }

    fn status(&self) -> PipelineStatus {
        let inner = self.inner.lock();
        let elapsed = match inner.running_at {
            Some(start) => inner
                .ended_at
                .unwrap_or_else(Instant::now)
                .saturating_duration_since(start),
            None => Duration::ZERO,
        };
        PipelineStatus {
            id: self.id.clone(),
            state: inner.state,
            elapsed,
            completed: inner.completed,
            last_error: inner.last_error.clone(),
        }
    }
}

impl PipelineHandle {
    pub fn new(id: impl Into<String>, spec: PipelineSpec, output: PipelineOutput) -> Self {
        let (state_tx, _) = watch::channel(PipelineState::Starting);
        let shared = Shared {
            id: id.into(),
            inner: Mutex::new(StatusInner {
                state: PipelineState::Starting,
                transitions: vec![(PipelineState::Starting, Instant::now())],
                running_at: None,
                ended_at: None,
                last_error: None,
                completed: false,
            }),
            state_tx,
        };
        Self {
            shared: Arc::new(shared),
            spec,
            output,
            cancel: CancellationToken::new(),
            claimed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn spec(&self) -> &PipelineSpec {
        &self.spec
    }

    pub fn output(&self) -> &PipelineOutput {
        &self.output
    }

    pub fn state(&self) -> PipelineState {
        self.shared.inner.lock().state
    }

    pub fn status(&self) -> PipelineStatus {
        self.shared.status()
    }

    pub fn last_error(&self) -> Option<CameraError> {
        self.shared.inner.lock().last_error.clone()
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Every state entered so far with the moment it was entered.
    pub fn transitions(&self) -> Vec<(PipelineState, Instant)> {
        self.shared.inner.lock().transitions.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.shared.state_tx.subscribe()
    }

    /// Spawn both stages and hand them to a supervising task.
    ///
    /// Returns once the pipeline is `Running`, or with the error that moved it
    /// to `Failed`.
    pub async fn launch(
        &self,
        launcher: &dyn StageLauncher,
        timing: &PipelineTiming,
    ) -> Result<(), CameraError> {
        let claimed = self.claimed.swap(true, Ordering::SeqCst);
        if claimed || self.state() != PipelineState::Starting {
            return Err(CameraError::AlreadyTerminal(self.shared.id.clone()));
        }
        if let Err(e) = self.spec.validate() {
            return Err(self.fail(e));
        }
        let deadline_after = match self.output {
            PipelineOutput::File { .. } => self.spec.duration(),
            _ => None,
        };

        log::info!(
            "Pipeline {}: launching {}x{}@{} -> {}",
            self.shared.id,
            self.spec.width,
            self.spec.height,
            self.spec.framerate,
            self.output.key().display()
        );

        let (mut capture, stream) = match launcher.spawn_capture(&self.spec, &self.output) {
            Ok(spawned) => spawned,
            Err(e) => return Err(self.fail(e)),
        };
        let mut encoder = match launcher.spawn_encoder(&self.spec, &self.output, stream) {
            Ok(encoder) => encoder,
            Err(e) => {
                force_stop(capture.as_mut(), timing.stop_grace).await;
                return Err(self.fail(e));
            }
        };

        if !timing.spawn_settle.is_zero() {
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(timing.spawn_settle) => {}
            }
        }

        let settle_error = settle_failure(capture.as_mut(), "capture")
            .or_else(|| settle_failure(encoder.as_mut(), "encoder"));
        if let Some(err) = settle_error {
            let _ = teardown(capture.as_mut(), encoder.as_mut(), timing.stop_grace).await;
            return Err(self.fail(err));
        }

        if self.cancel.is_cancelled() {
            log::info!("Pipeline {}: stopped while launching", self.shared.id);
            self.shared.transition(PipelineState::Stopping, None);
            let _ = teardown(capture.as_mut(), encoder.as_mut(), timing.stop_grace).await;
            self.shared.transition(PipelineState::Stopped, None);
            return Err(CameraError::AlreadyTerminal(self.shared.id.clone()));
        }

        self.shared.transition(PipelineState::Running, None);
        log::info!(
            "Pipeline {}: running (capture pid {:?}, encoder pid {:?})",
            self.shared.id,
            capture.pid(),
            encoder.pid()
        );

        let deadline = match deadline_after {
            Some(d) => match TokioInstant::now().checked_add(d) {
                Some(deadline) => Some(deadline),
                None => {
                    let err =
                        CameraError::InvalidSpec(format!("duration {:?} is out of range", d));
                    let _ = teardown(capture.as_mut(), encoder.as_mut(), timing.stop_grace).await;
                    return Err(self.fail(err));
                }
            },
            None => None,
        };
        let supervisor = Supervisor {
            shared: Arc::clone(&self.shared),
            capture,
            encoder,
            output: self.output.clone(),
            timing: timing.clone(),
            cancel: self.cancel.clone(),
            deadline,
            duration: deadline_after,
        };
        tokio::spawn(supervisor.run());
        Ok(())
    }

    /// Ordered stop. Resolves once the pipeline is terminal.
    pub async fn stop(&self) -> Result<PipelineStatus, CameraError> {
        if self.state().is_terminal() {
            return Err(CameraError::AlreadyTerminal(self.shared.id.clone()));
        }
        log::info!("Pipeline {}: stop requested", self.shared.id);
        self.cancel.cancel();
        if !self.claimed.swap(true, Ordering::SeqCst) {
            // nothing was spawned, so no supervisor will finish the job
            self.shared.transition(PipelineState::Stopping, None);
            self.shared.transition(PipelineState::Stopped, None);
        }
        Ok(self.wait().await)
    }

    pub async fn wait(&self) -> PipelineStatus {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|state| state.is_terminal()).await;
        self.status()
    }

    /// `None` if the pipeline is still not terminal after `limit`.
    pub async fn wait_timeout(&self, limit: Duration) -> Option<PipelineStatus> {
        tokio::time::timeout(limit, self.wait()).await.ok()
    }

    /// Move a pipeline that cannot go on to `Failed`, keeping `err` as its last error.
    pub(crate) fn fail(&self, err: CameraError) -> CameraError {
        self.claimed.store(true, Ordering::SeqCst);
        log::error!("Pipeline {}: {}", self.shared.id, err);
        self.shared.transition(PipelineState::Failed, Some(err.clone()));
        err
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ============================================================================
// Supervisor
// ============================================================================

enum Outcome {
    /// Stop was requested.
    Stopped,
    /// The finite work is done.
    Completed,
    Failed(CameraError),
}

struct Supervisor {
    shared: Arc<Shared>,
    capture: Box<dyn Stage>,
    encoder: Box<dyn Stage>,
    output: PipelineOutput,
    timing: PipelineTiming,
    cancel: CancellationToken,
    deadline: Option<TokioInstant>,
    duration: Option<Duration>,
}

impl Supervisor {
    async fn run(mut self) {
        let id = self.shared.id.clone();
        let cancel = self.cancel.clone();
        let startup_deadline = Instant::now() + self.timing.startup_timeout;
        let artifact = self.output.artifact();
        let mut artifact_seen = artifact.is_none();

        let mut ticker = tokio::time::interval(self.timing.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Outcome::Stopped,
                _ = sleep_until_opt(self.deadline) => {
                    log::info!("Pipeline {}: duration reached", id);
                    break Outcome::Completed;
                }
                _ = ticker.tick() => {}
            }

            if let Some(outcome) = self.check_exits() {
                break outcome;
            }

            if let Some(path) = artifact.as_ref().filter(|_| !artifact_seen) {
                if tokio::fs::try_exists(path).await.unwrap_or(false) {
                    log::info!("Pipeline {}: output appeared at {}", id, path.display());
                    artifact_seen = true;
                } else if Instant::now() >= startup_deadline {
                    break Outcome::Failed(CameraError::Timeout(format!(
                        "{} did not appear within {:?}",
                        path.display(),
                        self.timing.startup_timeout
                    )));
                }
            }
        };

        self.finish(outcome).await;
    }

    /// Interpret a stage that has already exited.
    fn check_exits(&mut self) -> Option<Outcome> {
        let encoder_exit = self.encoder.try_exit().ok().flatten();
        let capture_exit = self.capture.try_exit().ok().flatten();

        if let Some(exit) = encoder_exit {
            if !exit.success() {
                return Some(Outcome::Failed(CameraError::EncodeFailed(describe(
                    self.encoder.as_ref(),
                    exit,
                ))));
            }
            if self.output.ends_with_encoder() {
                return Some(Outcome::Completed);
            }
        }
        if let Some(exit) = capture_exit {
            if !exit.success() {
                return Some(Outcome::Failed(CameraError::CaptureFailed(describe(
                    self.capture.as_ref(),
                    exit,
                ))));
            }
            if let Some(outcome) = self.early_capture_end() {
                return Some(outcome);
            }
            if self.output.is_finite() {
                return Some(Outcome::Completed);
            }
            return Some(Outcome::Failed(CameraError::CaptureFailed(
                "capture ended unexpectedly".to_string(),
            )));
        }
        if encoder_exit.is_some() {
            return Some(Outcome::Failed(CameraError::EncodeFailed(
                "encoder exited while capture was still running".to_string(),
            )));
        }
        None
    }

    /// Failure for a timed capture that exited cleanly well short of its duration.
    ///
    /// The remote `-t` clock starts at spawn, ahead of `Running`, so exits within
    /// the settle window plus one poll of the deadline still count as done.
    fn early_capture_end(&self) -> Option<Outcome> {
        let duration = self.duration?;
        let elapsed = self.shared.status().elapsed;
        let slack = self.timing.spawn_settle + self.timing.poll_interval;
        if elapsed.saturating_add(slack) >= duration {
            return None;
        }
        Some(Outcome::Failed(CameraError::CaptureFailed(format!(
            "capture ended after {:.1}s of {}s",
            elapsed.as_secs_f64(),
            duration.as_secs()
        ))))
    }

    async fn finish(mut self, outcome: Outcome) {
        let id = self.shared.id.clone();
        self.shared.transition(PipelineState::Stopping, None);
        let grace = self.timing.stop_grace;
        let result = teardown(self.capture.as_mut(), self.encoder.as_mut(), grace).await;

        match (outcome, result) {
            (Outcome::Failed(err), _) | (_, Err(err)) => {
                log::error!("Pipeline {}: failed: {}", id, err);
                self.shared.transition(PipelineState::Failed, Some(err));
            }
            (Outcome::Completed, Ok(note)) => {
                self.shared.mark_completed();
                self.shared.transition(PipelineState::Stopped, note);
                log::info!("Pipeline {}: completed", id);
            }
            (Outcome::Stopped, Ok(note)) => {
                self.shared.transition(PipelineState::Stopped, note);
                log::info!("Pipeline {}: stopped", id);
            }
        }
    }
}

// ============================================================================
// Stage helpers
// ============================================================================

/// Capture first so the encoder sees end of input and can finalise.
///
/// `Ok(Some(_))` notes an encoder that had to be killed; its output may be
/// incomplete but the stop itself went through.
async fn teardown(
    capture: &mut dyn Stage,
    encoder: &mut dyn Stage,
    grace: Duration,
) -> Result<Option<CameraError>, CameraError> {
    stop_stage(capture, grace).await;

    match tokio::time::timeout(grace, encoder.wait()).await {
        Ok(Ok(exit)) if exit.success() => Ok(None),
        Ok(Ok(exit)) => Err(CameraError::EncodeFailed(describe(encoder, exit))),
        Ok(Err(e)) => Err(CameraError::Io(e.to_string())),
        Err(_) => {
            log::warn!("{}: did not finish within {:?}, killing", encoder.name(), grace);
            force_stop(encoder, grace).await;
            Ok(Some(CameraError::EncodeFailed(format!(
                "{} killed after {:?}, output may be incomplete",
                encoder.name(),
                grace
            ))))
        }
    }
}

async fn stop_stage(stage: &mut dyn Stage, grace: Duration) {
    if let Ok(Some(_)) = stage.try_exit() {
        return;
    }
    if let Err(e) = stage.signal_stop() {
        log::warn!("{}: terminate failed: {}", stage.name(), e);
    }
    if tokio::time::timeout(grace, stage.wait()).await.is_err() {
        log::warn!("{}: ignored terminate for {:?}, killing", stage.name(), grace);
        force_stop(stage, grace).await;
    }
}

pub(crate) async fn force_stop(stage: &mut dyn Stage, grace: Duration) {
    if let Err(e) = stage.kill() {
        log::warn!("{}: kill failed: {}", stage.name(), e);
    }
    let _ = tokio::time::timeout(grace, stage.wait()).await;
}

fn settle_failure(stage: &mut dyn Stage, label: &'static str) -> Option<CameraError> {
    match stage.try_exit() {
        Ok(Some(exit)) if !exit.success() => Some(CameraError::ProcessSpawnFailed {
            stage: label,
            reason: describe(stage, exit),
        }),
        _ => None,
    }
}

pub(crate) fn describe(stage: &dyn Stage, exit: StageExit) -> String {
    match stage.error_tail() {
        Some(tail) => format!("{} exited with {}: {}", stage.name(), exit, tail),
        None => format!("{} exited with {}", stage.name(), exit),
    }
}

async fn sleep_until_opt(deadline: Option<TokioInstant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "pipe_test.rs"]
mod pipe_test;
