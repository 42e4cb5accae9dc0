//! Remote control endpoint
//!
//! A small HTTP control plane for a live target process:
//!
//! | Route        | Action                                          |
//! |--------------|-------------------------------------------------|
//! | `GET /start` | start tracing                                   |
//! | `GET /stop`  | stop tracing and flush                          |
//! | `GET /trace` | flush, then return the trace log bytes verbatim |
//! | `GET /exit`  | terminate the process with exit code 4          |
//!
//! The server runs on its own thread with a current-thread runtime, so the
//! traced program's threads never service requests and requests are handled
//! one at a time.

use crate::config::RemoteConfig;
use crate::recorder::Recorder;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::io;
use std::net::SocketAddr;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// Exit code used by `GET /exit`
pub const EXIT_CODE: i32 = 4;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("failed to bind control endpoint on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to start control endpoint: {0}")]
    Runtime(#[source] io::Error),

    #[error("control request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("/{command} returned {status}: {message}")]
    Status {
        command: &'static str,
        status: u16,
        message: String,
    },
}

/// Routes for the control endpoint, bound to `recorder`
pub fn router(recorder: Recorder) -> Router {
    Router::new()
        .route("/start", get(start))
        .route("/stop", get(stop))
        .route("/trace", get(trace))
        .route("/exit", get(exit))
        .with_state(recorder)
}

fn failure(command: &str, err: impl std::fmt::Display) -> Response {
    warn!(command, error = %err, "remote command failed");
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
}

async fn start(State(recorder): State<Recorder>) -> Response {
    info!("remote start");
    match recorder.start_tracing() {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => failure("start", e),
    }
}

async fn stop(State(recorder): State<Recorder>) -> Response {
    info!("remote stop");
    match recorder.stop_tracing() {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => failure("stop", e),
    }
}

async fn trace(State(recorder): State<Recorder>) -> Response {
    if let Err(e) = recorder.flush() {
        return failure("trace", e);
    }
    let body = match std::fs::read(recorder.output_path()) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return failure("trace", e),
    };
    info!(bytes = body.len(), "remote trace fetch");
    ([(header::CONTENT_TYPE, TEXT_PLAIN)], body).into_response()
}

async fn exit() -> StatusCode {
    warn!(code = EXIT_CODE, "remote exit requested, terminating");
    std::process::exit(EXIT_CODE)
}

/// Running control endpoint
///
/// The server stops when the handle is shut down or dropped.
#[derive(Debug)]
pub struct RemoteHandle {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl RemoteHandle {
    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Stop accepting requests and wait for the server thread
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("control endpoint thread panicked");
            }
        }
    }
}

impl Drop for RemoteHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Bind `addr` and serve the control endpoint on a background thread
///
/// Binding happens before this returns, so an address in use is reported to
/// the caller rather than in the server thread.
pub fn listen(recorder: Recorder, addr: &str) -> Result<RemoteHandle, RemoteError> {
    let bind_err = |source| RemoteError::Bind {
        addr: addr.to_string(),
        source,
    };
    let listener = std::net::TcpListener::bind(addr).map_err(bind_err)?;
    listener.set_nonblocking(true).map_err(bind_err)?;
    let local_addr = listener.local_addr().map_err(bind_err)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .map_err(RemoteError::Runtime)?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let app = router(recorder);

    let thread = thread::Builder::new()
        .name("modscope-remote".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                let listener = match tokio::net::TcpListener::from_std(listener) {
                    Ok(listener) => listener,
                    Err(e) => {
                        error!(error = %e, "control endpoint listener unusable");
                        return;
                    }
                };
                let shutdown = async {
                    let _ = shutdown_rx.await;
                };
                if let Err(e) = axum::serve(listener, app)
                    .with_graceful_shutdown(shutdown)
                    .await
                {
                    error!(error = %e, "control endpoint stopped");
                }
            });
        })
        .map_err(RemoteError::Runtime)?;

    info!(addr = %local_addr, "control endpoint listening");
    Ok(RemoteHandle {
        local_addr,
        shutdown_tx: Some(shutdown_tx),
        thread: Some(thread),
    })
}

/// Serve the control endpoint on the address named by `config`
pub fn serve(recorder: Recorder, config: &RemoteConfig) -> Result<RemoteHandle, RemoteError> {
    listen(recorder, &config.bind_addr())
}

/// Blocking client for a control endpoint
#[derive(Debug, Clone)]
pub struct RemoteClient {
    base_url: String,
    http: reqwest::blocking::Client,
}

impl RemoteClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            http: reqwest::blocking::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL of the trace log, as accepted by the decoder
    pub fn trace_url(&self) -> String {
        format!("{}/trace", self.base_url)
    }

    fn command(&self, command: &'static str) -> Result<Vec<u8>, RemoteError> {
        let response = self
            .http
            .get(format!("{}/{}", self.base_url, command))
            .send()?;
        let status = response.status();
        let body = response.bytes()?.to_vec();
        if !status.is_success() {
            return Err(RemoteError::Status {
                command,
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body)
    }

    pub fn start(&self) -> Result<(), RemoteError> {
        self.command("start").map(drop)
    }

    pub fn stop(&self) -> Result<(), RemoteError> {
        self.command("stop").map(drop)
    }

    pub fn fetch_trace(&self) -> Result<Vec<u8>, RemoteError> {
        self.command("trace")
    }

    /// Terminate the target
    ///
    /// The target usually dies before answering, so a dropped connection
    /// counts as success. Failing to connect at all does not.
    pub fn exit(&self) -> Result<(), RemoteError> {
        match self.command("exit") {
            Ok(_) => Ok(()),
            Err(RemoteError::Request(e)) if !e.is_connect() && !e.is_builder() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
