use std::{
    fmt,
    net::SocketAddr,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use axum::{
    Router,
    body::Body,
    extract::{self, State},
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use log::{debug, error, info};
use tokio::{fs::File, net::TcpListener};
use tokio_util::io::ReaderStream;

use crate::{
    Config, Error, FileSink, HttpSink, UploadLimits, UploadSchema, disk, memory, stream,
};

/// How `POST /upload` receives its parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Memory,
    Disk,
    Stream,
}

impl Strategy {
    pub const ALL: [Strategy; 3] = [Strategy::Memory, Strategy::Disk, Strategy::Stream];

    pub fn name(self) -> &'static str {
        match self {
            Strategy::Memory => "memory",
            Strategy::Disk => "disk",
            Strategy::Stream => "stream",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub sink: Arc<dyn FileSink>,
    pub schema: Arc<UploadSchema>,
    pub public_dir: Arc<PathBuf>,
    pub spool_dir: Arc<PathBuf>,
    pub limits: UploadLimits,
}

impl AppState {
    pub fn new(sink: Arc<dyn FileSink>, public_dir: impl Into<PathBuf>) -> Self {
        Self {
            sink,
            schema: Arc::new(UploadSchema::images()),
            public_dir: Arc::new(public_dir.into()),
            spool_dir: Arc::new(std::env::temp_dir()),
            limits: UploadLimits::default(),
        }
    }

    /// Directory where the disk strategy creates its temp files.
    pub fn with_spool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spool_dir = Arc::new(dir.into());
        self
    }

    pub fn with_limits(mut self, limits: UploadLimits) -> Self {
        self.limits = limits;
        self
    }
}

pub fn router(strategy: Strategy, state: AppState) -> Router {
    let upload = match strategy {
        Strategy::Memory => post(memory::upload),
        Strategy::Disk => post(disk::upload),
        Strategy::Stream => post(stream::upload),
    };

    Router::new()
        .route("/upload", upload)
        .route("/", get(index))
        .route("/{*path}", get(public_file))
        .with_state(state)
}

pub async fn serve(config: Config, strategy: Strategy) -> Result<(), Error> {
    let sink = HttpSink::new(&config.sink_url)?;
    let state =
        AppState::new(Arc::new(sink), config.public_dir.clone()).with_limits(config.limits);
    let app = router(strategy, state);

    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], config.port))).await?;
    info!(
        "{} upload server listening on {}, forwarding to {}",
        strategy,
        listener.local_addr()?,
        config.sink_url
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }
    info!("Shutting down");
}

async fn index(State(state): State<AppState>) -> Result<Response, StatusCode> {
    serve_file(&state.public_dir, "index.html").await
}

async fn public_file(
    State(state): State<AppState>,
    extract::Path(path): extract::Path<String>,
) -> Result<Response, StatusCode> {
    serve_file(&state.public_dir, &path).await
}

/// Streams a file from `root`. Anything that could escape `root` is a 404.
pub(crate) async fn serve_file(root: &Path, path: &str) -> Result<Response, StatusCode> {
    let relative = Path::new(path);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        debug!("Refusing public path {:?}", path);
        return Err(StatusCode::NOT_FOUND);
    }

    let full = root.join(relative);
    let file = File::open(&full).await.map_err(|_| StatusCode::NOT_FOUND)?;
    let metadata = file.metadata().await.map_err(|_| StatusCode::NOT_FOUND)?;
    if !metadata.is_file() {
        return Err(StatusCode::NOT_FOUND);
    }

    debug!("Serving {:?} ({} bytes)", full, metadata.len());
    let body = Body::from_stream(ReaderStream::new(file));
    let content_type = mime_guess::from_path(&full).first_or_octet_stream().to_string();
    Ok(([(CONTENT_TYPE, content_type)], body).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn public_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("public")
    }

    #[tokio::test]
    async fn test_serve_file_refuses_escapes() {
        for path in ["../Cargo.toml", "/etc/passwd", "./index.html", ""] {
            let result = serve_file(&public_dir(), path).await;
            assert_eq!(result.err(), Some(StatusCode::NOT_FOUND), "{path}");
        }
    }

    #[tokio::test]
    async fn test_serve_file_sets_content_type() {
        let response = serve_file(&public_dir(), "index.html").await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/html");
    }
}
