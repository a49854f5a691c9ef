//! HTTP front: viewer page, MJPEG stream, snapshot and health

pub mod page;
pub mod stream;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, State};
use axum::http::{header, Request, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time;
use tower::ServiceExt;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::pipeline::LatestFrameCache;
use crate::{ServerConfig, StreamConfig};

pub use stream::{ViewerGuard, ViewerStream};

/// How long open connections get to finish after shutdown is requested
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<LatestFrameCache>,
    pub stream: Arc<StreamConfig>,
    pub viewers: Arc<AtomicUsize>,
    pub shutdown: watch::Receiver<bool>,
}

/// Tells the server and every open stream to stop
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
    viewers: usize,
    has_frame: bool,
}

/// Routes of the viewer-facing server
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index).fallback(not_found))
        .route("/stream", get(mjpeg_stream).fallback(not_found))
        .route("/stream.mjpg", get(mjpeg_stream).fallback(not_found))
        .route("/snapshot.jpg", get(snapshot).fallback(not_found))
        .route("/health", get(health).fallback(not_found))
        .fallback(not_found)
        .with_state(state)
}

/// Bound listener plus the state its connections share
pub struct StreamServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: AppState,
    handle: ShutdownHandle,
}

impl StreamServer {
    /// Bind the listen socket. Failure here is fatal to the server.
    pub async fn bind(
        server: &ServerConfig,
        stream: &StreamConfig,
        cache: Arc<LatestFrameCache>,
    ) -> Result<Self> {
        let addr = SocketAddr::new(server.bind_ip, server.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::ListenFailure { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| Error::ListenFailure { addr, source })?;

        let (handle, shutdown) = ShutdownHandle::new();
        let state = AppState {
            cache,
            stream: Arc::new(stream.clone()),
            viewers: Arc::new(AtomicUsize::new(0)),
            shutdown,
        };

        info!(%local_addr, fps = stream.effective_fps(), "Stream server listening");

        Ok(Self {
            listener,
            local_addr,
            state,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.handle.clone()
    }

    /// Accept connections until [`ShutdownHandle::shutdown`] is called.
    ///
    /// Open connections then get [`SHUTDOWN_GRACE`] to finish; any still
    /// open after that (a viewer whose socket stopped draining) are dropped.
    pub async fn serve(self) -> Result<()> {
        let Self {
            listener,
            state,
            handle: _handle,
            ..
        } = self;
        let mut shutdown = state.shutdown.clone();
        let app = router(state);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        connections.spawn(serve_connection(stream, peer, app.clone(), shutdown.clone()));
                    }
                    Err(e) => {
                        warn!(error = %Error::SocketFailure(e), "Accept failed");
                        time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown_signal(&mut shutdown) => break,
            }
        }

        drop(listener);
        debug!(open = connections.len(), "Listener closed, draining connections");

        let drained = time::timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(open = connections.len(), "Dropping connections that did not finish");
            connections.shutdown().await;
        }

        info!("Stream server stopped");
        Ok(())
    }
}

/// Resolves once shutdown is requested or every handle is gone
async fn shutdown_signal(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) {
    let service = service_fn(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(peer));
        app.clone().oneshot(request)
    });

    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown_signal(&mut shutdown) => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(e) = result {
        debug!(%peer, error = %e, "Connection closed with error");
    }
}

async fn index() -> Html<&'static str> {
    Html(page::INDEX_HTML)
}

#[instrument(skip_all)]
async fn mjpeg_stream(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let guard = ViewerGuard::new(Arc::clone(&state.viewers), peer.map(|ConnectInfo(addr)| addr));
    ViewerStream::new(state.cache, &state.stream, state.shutdown, guard).into_response()
}

async fn snapshot(State(state): State<AppState>) -> Response {
    match state.cache.read() {
        Some(frame) => (
            [
                (header::CONTENT_TYPE, "image/jpeg"),
                (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            ],
            frame.data.clone(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "No frame yet",
        )
            .into_response(),
    }
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        viewers: state.viewers.load(Ordering::Relaxed),
        has_frame: state.cache.sequence().is_some(),
    })
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        "Not found",
    )
}
