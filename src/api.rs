use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::error::CameraError;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP server exposing the playlist and segments of one directory.
pub struct FileServer {
    addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl FileServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut self.task).await.is_err() {
            log::warn!("File server: graceful shutdown timed out, aborting");
            self.task.abort();
        }
    }
}

impl Drop for FileServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ServeState {
    dir: PathBuf,
}

pub async fn start_file_server(dir: PathBuf, addr: SocketAddr) -> Result<FileServer, CameraError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| CameraError::Io(format!("cannot bind file server to {}: {}", addr, e)))?;
    let addr = listener.local_addr()?;

    let app = Router::new()
        .route("/{file}", get(serve_file))
        .with_state(Arc::new(ServeState { dir: dir.clone() }));

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    let task = tokio::spawn(async move {
        log::info!("File server: serving {} on {}", dir.display(), addr);
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
        {
            log::error!("File server: {}", e);
        }
        log::info!("File server: stopped");
    });

    Ok(FileServer { addr, cancel, task })
}

fn content_type(file: &str) -> &'static str {
    if file.ends_with(".m3u8") {
        "application/vnd.apple.mpegurl"
    } else if file.ends_with(".ts") {
        "video/mp2t"
    } else {
        "application/octet-stream"
    }
}

/// Plain file names only; nothing outside the served directory.
fn is_safe_name(file: &str) -> bool {
    !file.is_empty()
        && file != "."
        && file != ".."
        && !file.contains(['/', '\\'])
}

async fn serve_file(Path(file): Path<String>, State(state): State<Arc<ServeState>>) -> Response {
    if !is_safe_name(&file) {
        return (StatusCode::BAD_REQUEST, "bad file name").into_response();
    }

    let path = state.dir.join(&file);
    let handle = match tokio::fs::File::open(&path).await {
        Ok(handle) => handle,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return (StatusCode::NOT_FOUND, format!("{} not found", file)).into_response();
        }
        Err(e) => {
            log::warn!("File server: {}: {}", path.display(), e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response();
        }
    };

    (
        [
            (header::CONTENT_TYPE, content_type(&file)),
            (header::CACHE_CONTROL, "no-cache"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        Body::from_stream(ReaderStream::new(handle)),
    )
        .into_response()
}
