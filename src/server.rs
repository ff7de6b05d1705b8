//! Transient HTTP audio server
//!
//! Cast receivers pull media over HTTP, so each playback spins up a small
//! single-file server on an ephemeral port. The file lives behind an opaque
//! token path, and an idle watchdog shuts the server down once the receiver
//! stops fetching.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::{Error, Result};

struct ServeState {
    file: PathBuf,
    content_type: &'static str,
    token: String,
    last_activity: Mutex<Instant>,
}

/// One-file HTTP server for a single playback
pub struct AudioServer {
    addr: SocketAddr,
    token: String,
    content_type: &'static str,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl AudioServer {
    /// Serve `file` on an ephemeral port until shut down or idle too long.
    ///
    /// # Errors
    ///
    /// Returns error if no port can be bound.
    pub async fn start(file: PathBuf, idle_timeout: Duration) -> Result<Self> {
        let content_type = content_type_for(&file);
        let token = uuid::Uuid::new_v4().simple().to_string();

        let state = Arc::new(ServeState {
            file,
            content_type,
            token: token.clone(),
            last_activity: Mutex::new(Instant::now()),
        });

        let app = Router::new()
            .route("/audio/{token}", get(serve_audio))
            .fallback(not_found)
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&state));

        let listener = bind_ephemeral().await?;
        let addr = listener
            .local_addr()
            .map_err(|e| Error::Server(format!("cannot resolve bound address: {e}")))?;

        let cancel = CancellationToken::new();
        let serve_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let shutdown = serve_cancel.clone();
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
            {
                tracing::error!(error = %e, "audio server failed");
            }
        });

        // Idle watchdog: no fetch within the timeout shuts the server down.
        let watchdog_cancel = cancel.clone();
        let watchdog_state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(2));
            loop {
                tokio::select! {
                    () = watchdog_cancel.cancelled() => return,
                    _ = tick.tick() => {}
                }
                let idle = watchdog_state
                    .last_activity
                    .lock()
                    .map(|t| t.elapsed())
                    .unwrap_or_default();
                if idle >= idle_timeout {
                    tracing::info!(idle_secs = idle.as_secs(), "audio server idle, shutting down");
                    watchdog_cancel.cancel();
                    return;
                }
            }
        });

        tracing::debug!(%addr, "audio server up");
        Ok(Self {
            addr,
            token,
            content_type,
            cancel,
            task,
        })
    }

    /// Port the server is listening on
    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// MIME type the server will report
    #[must_use]
    pub fn content_type(&self) -> &'static str {
        self.content_type
    }

    /// Audio URL as reachable from `ip`
    #[must_use]
    pub fn url_for(&self, ip: IpAddr) -> String {
        format!("http://{}:{}/audio/{}", ip, self.addr.port(), self.token)
    }

    /// Audio URL as reachable from the LAN
    #[must_use]
    pub fn url(&self) -> String {
        self.url_for(local_lan_ip())
    }

    /// Stop serving and release the port. Idempotent; safe to call on an
    /// already stopped server.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                tracing::debug!(error = %e, "audio server task ended abnormally");
            }
        }
    }
}

async fn bind_ephemeral() -> Result<tokio::net::TcpListener> {
    let any: SocketAddr = (Ipv4Addr::UNSPECIFIED, 0).into();
    match tokio::net::TcpListener::bind(any).await {
        Ok(listener) => Ok(listener),
        Err(first) => {
            tracing::warn!(error = %first, "audio server bind failed, retrying once");
            tokio::net::TcpListener::bind(any)
                .await
                .map_err(|e| Error::Server(format!("cannot bind audio server: {e}")))
        }
    }
}

async fn serve_audio(
    State(state): State<Arc<ServeState>>,
    Path(token): Path<String>,
) -> Response {
    if token != state.token {
        return StatusCode::NOT_FOUND.into_response();
    }
    if let Ok(mut last) = state.last_activity.lock() {
        *last = Instant::now();
    }
    match tokio::fs::read(&state.file).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, state.content_type)],
            bytes,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(file = %state.file.display(), error = %e, "audio file unreadable");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// MIME type by file extension; prepared audio is normally MP3
fn content_type_for(file: &std::path::Path) -> &'static str {
    match file
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("mp3") => "audio/mpeg",
        Some("ogg" | "oga") => "audio/ogg",
        Some("wav") => "audio/wav",
        Some("m4a") => "audio/mp4",
        Some("aiff" | "aif") => "audio/aiff",
        _ => "application/octet-stream",
    }
}

/// Best local address for URLs handed to devices on the LAN. Uses a
/// connected UDP socket to learn the preferred outbound interface; no
/// packets are sent.
#[must_use]
pub fn local_lan_ip() -> IpAddr {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map_or(IpAddr::V4(Ipv4Addr::LOCALHOST), |addr| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_types_by_extension() {
        assert_eq!(content_type_for(std::path::Path::new("a.mp3")), "audio/mpeg");
        assert_eq!(content_type_for(std::path::Path::new("a.OGG")), "audio/ogg");
        assert_eq!(
            content_type_for(std::path::Path::new("noext")),
            "application/octet-stream"
        );
    }
}
