use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::RwLock;

use crate::error::CameraError;
use crate::media::stage::StageLauncher;
use crate::media::types::{PipelineSpec, PipelineTiming, RecordingStatus};
use crate::recording::RecordingSession;

/// Concurrent recordings keyed by recording id.
pub struct RecordingRegistry {
    sessions: RwLock<HashMap<String, Arc<RecordingSession>>>,
    launcher: Arc<dyn StageLauncher>,
    timing: PipelineTiming,
    dir: PathBuf,
    last_token: AtomicI64,
}

impl RecordingRegistry {
    pub fn new(launcher: Arc<dyn StageLauncher>, timing: PipelineTiming, dir: PathBuf) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            launcher,
            timing,
            dir,
            last_token: AtomicI64::new(0),
        }
    }

    /// `rec_<unix millis>`, bumped past the previous id when the clock has not moved.
    fn next_id(&self) -> String {
        let now = chrono::Utc::now().timestamp_millis();
        let previous = self
            .last_token
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        format!("rec_{}", now.max(previous + 1))
    }

    /// Register and launch a recording. `spec.duration` must already be set.
    ///
    /// A recording that fails to launch stays registered as `Failed` until swept.
    pub async fn start_recording(&self, spec: PipelineSpec) -> Result<String, CameraError> {
        spec.validate()?;
        if spec.duration.is_none() {
            return Err(CameraError::InvalidSpec("recording needs a duration".into()));
        }

        let id = self.next_id();
        let session = Arc::new(RecordingSession::new(id.clone(), spec, &self.dir));
        self.sessions
            .write()
            .await
            .insert(id.clone(), Arc::clone(&session));

        log::info!(
            "Recording {}: {}s into {}",
            id,
            session.duration().as_secs(),
            session.output_path().display()
        );
        session.launch(self.launcher.as_ref(), &self.timing).await?;
        Ok(id)
    }

    pub async fn stop_recording(&self, id: &str) -> Result<RecordingStatus, CameraError> {
        let session = self.get(id).await?;
        session.stop().await?;
        Ok(session.status())
    }

    pub async fn get_status(&self, id: &str) -> Result<RecordingStatus, CameraError> {
        Ok(self.get(id).await?.status())
    }

    /// Every registered recording, oldest first.
    pub async fn list(&self) -> Vec<RecordingStatus> {
        let mut statuses: Vec<_> = self
            .sessions
            .read()
            .await
            .values()
            .map(|session| session.status())
            .collect();
        statuses.sort_by(|a, b| {
            a.recording_id
                .len()
                .cmp(&b.recording_id.len())
                .then_with(|| a.recording_id.cmp(&b.recording_id))
        });
        statuses
    }

    /// Drop finished and failed recordings; returns their ids.
    pub async fn sweep(&self) -> Vec<String> {
        let mut sessions = self.sessions.write().await;
        let terminal: Vec<String> = sessions
            .iter()
            .filter(|(_, session)| session.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &terminal {
            sessions.remove(id);
        }
        if !terminal.is_empty() {
            log::info!("Recordings: swept {}", terminal.join(", "));
        }
        terminal
    }

    /// Stop every recording still running, all at once.
    pub async fn stop_all(&self) {
        let active: Vec<Arc<RecordingSession>> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|session| !session.is_terminal())
            .cloned()
            .collect();
        if active.is_empty() {
            return;
        }
        log::info!("Recordings: stopping {} active", active.len());
        futures::future::join_all(active.iter().map(|session| session.stop())).await;
    }

    async fn get(&self, id: &str) -> Result<Arc<RecordingSession>, CameraError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CameraError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
#[path = "manager_test.rs"]
mod manager_test;
