use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::api::{FileServer, start_file_server};
use crate::error::CameraError;
use crate::media::pipe::PipelineHandle;
use crate::media::stage::StageLauncher;
use crate::media::types::{
    PLAYLIST_NAME, PipelineOutput, PipelineSpec, PipelineState, PipelineStatus, PipelineTiming,
    StreamStatus,
};

/// Live segmented stream plus the file server publishing it.
pub struct StreamSession {
    pipeline: PipelineHandle,
    dir: PathBuf,
    server: Arc<Mutex<Option<FileServer>>>,
    playlist_url: Mutex<Option<String>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl StreamSession {
    pub fn new(id: impl Into<String>, spec: PipelineSpec, dir: PathBuf) -> Self {
        let output = PipelineOutput::Segmented { dir: dir.clone() };
        Self {
            pipeline: PipelineHandle::new(id, spec, output),
            dir,
            server: Arc::new(Mutex::new(None)),
            playlist_url: Mutex::new(None),
            watcher: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        self.pipeline.id()
    }

    pub fn pipeline(&self) -> &PipelineHandle {
        &self.pipeline
    }

    pub fn is_active(&self) -> bool {
        self.pipeline.is_active()
    }

    pub fn playlist_path(&self) -> PathBuf {
        self.dir.join(PLAYLIST_NAME)
    }

    /// Launch the pipeline and serve its directory. Returns the playlist URL.
    pub async fn start(
        &self,
        launcher: &dyn StageLauncher,
        timing: &PipelineTiming,
        http_addr: SocketAddr,
        public_url: Option<&str>,
    ) -> Result<String, CameraError> {
        if let Err(e) = prepare_dir(&self.dir).await {
            return Err(self.pipeline.fail(e));
        }
        self.pipeline.launch(launcher, timing).await?;

        let server = match start_file_server(self.dir.clone(), http_addr).await {
            Ok(server) => server,
            Err(e) => {
                log::error!("Stream {}: {}", self.id(), e);
                let _ = self.pipeline.stop().await;
                return Err(e);
            }
        };
        let url = playlist_url(public_url, server.local_addr());
        *self.server.lock() = Some(server);
        *self.playlist_url.lock() = Some(url.clone());

        // the server goes away as soon as the pipeline ends on its own
        let mut state_rx = self.pipeline.subscribe();
        let slot = Arc::clone(&self.server);
        let id = self.id().to_string();
        let watcher = tokio::spawn(async move {
            let _ = state_rx.wait_for(|state| state.is_terminal()).await;
            let server = slot.lock().take();
            if let Some(server) = server {
                log::info!("Stream {}: pipeline ended, closing file server", id);
                server.shutdown().await;
            }
        });
        *self.watcher.lock() = Some(watcher);

        log::info!("Stream {}: live at {}", self.id(), url);
        Ok(url)
    }

    /// Stop the pipeline, then the file server. Safe to call repeatedly.
    pub async fn stop(&self) -> PipelineStatus {
        let status = match self.pipeline.stop().await {
            Ok(status) => status,
            Err(_) => self.pipeline.status(),
        };
        let server = self.server.lock().take();
        if let Some(server) = server {
            server.shutdown().await;
        }
        // may have picked up the server first
        let watcher = self.watcher.lock().take();
        if let Some(watcher) = watcher {
            let _ = watcher.await;
        }
        status
    }

    pub async fn status(&self) -> StreamStatus {
        let status = self.pipeline.status();
        let playlist_url = if status.state == PipelineState::Running {
            self.playlist_url.lock().clone()
        } else {
            None
        };
        let mut stream_status = idle_status(&self.dir).await;
        stream_status.active = status.state.is_active();
        stream_status.state = Some(status.state);
        stream_status.elapsed_secs = status.elapsed.as_secs_f64();
        stream_status.playlist_url = playlist_url;
        stream_status.last_error = status.last_error.map(|e| e.to_string());
        stream_status
    }
}

/// Status of a directory no stream is writing to.
pub async fn idle_status(dir: &Path) -> StreamStatus {
    let playlist_exists = tokio::fs::try_exists(dir.join(PLAYLIST_NAME))
        .await
        .unwrap_or(false);
    let segments = list_segments(dir).await;
    StreamStatus {
        active: false,
        state: None,
        elapsed_secs: 0.0,
        playlist_url: None,
        output_dir: dir.to_path_buf(),
        playlist_exists,
        segment_count: segments.len(),
        latest_segment: segments.last().cloned(),
        last_error: None,
    }
}

fn playlist_url(public_url: Option<&str>, bound: SocketAddr) -> String {
    match public_url {
        Some(base) => format!("{}/{}", base.trim_end_matches('/'), PLAYLIST_NAME),
        None if bound.ip().is_unspecified() => {
            format!("http://localhost:{}/{}", bound.port(), PLAYLIST_NAME)
        }
        None => format!("http://{}/{}", bound, PLAYLIST_NAME),
    }
}

/// Segment file names in write order.
async fn list_segments(dir: &Path) -> Vec<String> {
    let mut segments = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return segments;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".ts") {
            segments.push(name);
        }
    }
    // stream_999.ts < stream_1000.ts
    segments.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
    segments
}

/// Create the directory and drop what a previous stream left behind.
async fn prepare_dir(dir: &Path) -> Result<(), CameraError> {
    tokio::fs::create_dir_all(dir).await?;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let stale = path
            .extension()
            .is_some_and(|ext| ext == "ts" || ext == "m3u8");
        if stale {
            log::debug!("Stream: removing stale {}", path.display());
            tokio::fs::remove_file(&path).await?;
        }
    }
    Ok(())
}
