//! Worker process bootstrap - runs inside a process the primary spawned.
//!
//! The parent side (spawning, exit handling) is in supervisor.rs.
//!
//! Lifecycle:
//! - Read `Init` from the control channel (stdin)
//! - Bind the shared port and report `Listening` (stdout)
//! - Serve the handler set until an exit is requested
//! - Report `Exiting` and hand the exit code back to the caller

use std::future::IntoFuture;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Extension, Router};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, stdin, stdout};
use tokio::sync::watch;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{ControlRequest, ControlResponse, WorkerId};
use crate::listener::{ListenSpec, bind_listener};

/// How long an after-response exit waits for open connections before
/// dropping them. Long enough to write the triggering response, short enough
/// that a stalled client cannot keep the worker alive.
pub const SELF_EXIT_FLUSH_WINDOW: Duration = Duration::from_millis(300);

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("control channel closed before Init was received")]
    NoInit,
    #[error("expected Init as first control message, got {0}")]
    UnexpectedMessage(String),
    #[error("control channel error: {0}")]
    Control(#[source] io::Error),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("server error: {0}")]
    Serve(#[source] io::Error),
}

/// How a requested exit treats in-flight work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitMode {
    /// Stop accepting, give responses already being written
    /// [`SELF_EXIT_FLUSH_WINDOW`] to reach the client.
    AfterResponse,
    /// Stop now and drop open connections.
    Immediate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitRequest {
    pub code: i32,
    pub mode: ExitMode,
    pub reason: String,
}

/// Handle for ending the current worker process.
///
/// Injected into every request as an axum `Extension`, so handlers can take
/// `Extension<WorkerControl>` to terminate their own worker.
#[derive(Clone)]
pub struct WorkerControl {
    worker_id: WorkerId,
    tx: Arc<watch::Sender<Option<ExitRequest>>>,
}

impl WorkerControl {
    pub fn new(worker_id: WorkerId) -> (Self, watch::Receiver<Option<ExitRequest>>) {
        let (tx, rx) = watch::channel(None);
        (
            Self {
                worker_id,
                tx: Arc::new(tx),
            },
            rx,
        )
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Exit with `code` once the current response has been flushed.
    pub fn request_exit(&self, code: i32) {
        self.submit(ExitRequest {
            code,
            mode: ExitMode::AfterResponse,
            reason: "self-termination requested".to_string(),
        });
    }

    /// Exit with code 0 without waiting for in-flight requests.
    pub fn exit_now(&self, reason: impl Into<String>) {
        self.submit(ExitRequest {
            code: 0,
            mode: ExitMode::Immediate,
            reason: reason.into(),
        });
    }

    /// First request wins; a later immediate request may still cut a
    /// pending after-response exit short.
    fn submit(&self, request: ExitRequest) {
        self.tx.send_if_modified(|current| {
            let replace = match current {
                None => true,
                Some(existing) => {
                    existing.mode == ExitMode::AfterResponse && request.mode == ExitMode::Immediate
                }
            };
            if replace {
                *current = Some(request);
            }
            replace
        });
    }
}

/// Run the worker side of the pool on this process's stdio.
///
/// Returns the exit code the process should terminate with.
pub async fn run_worker(router: Router) -> Result<i32, WorkerError> {
    let mut ctrl_reader = FramedRead::new(stdin(), JsonCodec::<ControlRequest>::new());
    let ctrl_writer = FramedWrite::new(stdout(), JsonCodec::<ControlResponse>::new());

    let (worker_id, listen) = match ctrl_reader.next().await {
        Some(Ok(ControlRequest::Init { worker_id, listen })) => (worker_id, listen),
        Some(Ok(other)) => return Err(WorkerError::UnexpectedMessage(format!("{other:?}"))),
        Some(Err(e)) => return Err(WorkerError::Control(e)),
        None => return Err(WorkerError::NoInit),
    };
    tracing::debug!(worker = %worker_id, ?listen, "Init received");

    serve_worker(worker_id, listen, router, ctrl_reader, ctrl_writer).await
}

/// Bind, serve and exit, over an arbitrary control channel.
pub async fn serve_worker<R, W>(
    worker_id: WorkerId,
    listen: ListenSpec,
    router: Router,
    ctrl_reader: FramedRead<R, JsonCodec<ControlRequest>>,
    mut ctrl_writer: FramedWrite<W, JsonCodec<ControlResponse>>,
) -> Result<i32, WorkerError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let pid = std::process::id();

    let listener = match bind_listener(&listen) {
        Ok(listener) => listener,
        Err(source) => {
            let addr = listen.addr();
            tracing::error!(worker = %worker_id, %addr, error = %source, "Failed to bind listener");
            let _ = ctrl_writer
                .send(ControlResponse::Fatal {
                    reason: format!("failed to bind {addr}: {source}"),
                })
                .await;
            return Err(WorkerError::Bind { addr, source });
        }
    };
    let addr = listener.local_addr().map_err(WorkerError::Serve)?;

    ctrl_writer
        .send(ControlResponse::Listening { pid, addr })
        .await
        .map_err(WorkerError::Control)?;
    tracing::info!(worker = %worker_id, pid, %addr, "worker {} started on port {}", pid, addr.port());

    let (control, exit_rx) = WorkerControl::new(worker_id);
    let ctrl_task = tokio::spawn(watch_control(ctrl_reader, control.clone()));
    let app = router.layer(Extension(control));

    let flushed = wait_for_exit(exit_rx.clone(), |_| true);
    let immediate = wait_for_exit(exit_rx.clone(), |r| r.mode == ExitMode::Immediate);
    let flush_window = {
        let rx = exit_rx.clone();
        async move {
            wait_for_exit(rx, |_| true).await;
            tokio::time::sleep(SELF_EXIT_FLUSH_WINDOW).await;
        }
    };
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(flushed)
        .into_future();

    tokio::select! {
        result = server => result.map_err(WorkerError::Serve)?,
        _ = immediate => tracing::debug!(worker = %worker_id, "Dropping open connections"),
        _ = flush_window => tracing::debug!(
            worker = %worker_id,
            "Flush window elapsed, dropping open connections"
        ),
    }
    ctrl_task.abort();

    let request = exit_rx.borrow().clone();
    let (code, reason) = match request {
        Some(r) => (r.code, r.reason),
        None => (0, "server stopped".to_string()),
    };

    tracing::info!(worker = %worker_id, pid, code, %reason, "Worker exiting");
    if let Err(e) = ctrl_writer
        .send(ControlResponse::Exiting {
            code,
            reason: reason.clone(),
        })
        .await
    {
        tracing::debug!(error = %e, "Could not report exit to primary");
    }

    Ok(code)
}

async fn wait_for_exit(
    mut rx: watch::Receiver<Option<ExitRequest>>,
    accept: fn(&ExitRequest) -> bool,
) {
    loop {
        if rx.borrow_and_update().as_ref().is_some_and(accept) {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn watch_control<R>(mut reader: FramedRead<R, JsonCodec<ControlRequest>>, control: WorkerControl)
where
    R: AsyncRead + Unpin,
{
    loop {
        match reader.next().await {
            Some(Ok(ControlRequest::Shutdown)) => {
                tracing::info!("Shutdown requested by primary");
                control.exit_now("shutdown requested by primary");
                break;
            }
            Some(Ok(ControlRequest::Init { .. })) => {
                tracing::warn!("Received Init after startup, ignoring");
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Control channel error");
                control.exit_now("control channel error");
                break;
            }
            None => {
                tracing::warn!("Control channel closed (primary died?), exiting");
                control.exit_now("primary gone");
                break;
            }
        }
    }
}
