//! Process entry points for both roles.
//!
//! The same binary runs as primary and as every worker. [`launch`] takes the
//! resolved [`Role`] and runs the matching bootstrap with its own runtime:
//! a multi-threaded one for the primary and a single-threaded one per worker.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tracing::info;

use crate::config::{LaunchOptions, ListenMode};
use crate::listener::ListenSpec;
use crate::role::Role;
use crate::spawner::SelfExecSpawner;
use crate::supervisor::PoolSupervisor;
use crate::worker;

/// Run this process in `role`.
///
/// The primary reads [`LaunchOptions`] from the environment and supervises
/// the pool until SIGINT/SIGTERM. A worker builds its handler set with
/// `handlers` and serves it. Returns the code the process should exit with.
pub fn launch<H>(role: Role, handlers: H) -> anyhow::Result<i32>
where
    H: FnOnce() -> Router,
{
    match role {
        Role::Primary => {
            let options = LaunchOptions::from_env()?;
            run_primary(options)?;
            Ok(0)
        }
        Role::Worker => run_worker_process(handlers()),
    }
}

/// Start the pool and block until it has shut down.
pub fn run_primary(options: LaunchOptions) -> anyhow::Result<()> {
    let rt = tokio::runtime::Runtime::new().context("failed to build primary runtime")?;

    rt.block_on(async move {
        let addr = options.server.socket_addr()?;
        let listener = PrimaryListener::open(options.listen_mode, addr)?;
        let spawner = Arc::new(SelfExecSpawner::current()?);

        info!(
            workers = options.pool.worker_count(),
            %addr,
            mode = ?options.listen_mode,
            "Starting pool"
        );

        let mut supervisor = PoolSupervisor::new(options.pool, listener.spec(), spawner)
            .with_restart_policy(options.restart);
        supervisor.initialize()?;
        supervisor.run(shutdown_signal()).await;

        drop(listener);
        info!("Pool shutdown complete");
        Ok::<(), anyhow::Error>(())
    })
}

/// Serve `router` as a pool worker on this process's stdio control channel.
pub fn run_worker_process(router: Router) -> anyhow::Result<i32> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build worker runtime")?;

    let result = rt.block_on(worker::run_worker(router));
    // The stdin reader is parked in a blocking thread; don't wait for it.
    rt.shutdown_background();

    Ok(result?)
}

/// What the primary holds on to for the pool's listening socket.
enum PrimaryListener {
    ReusePort(SocketAddr),
    #[cfg(unix)]
    Shared(crate::listener::SharedSocket),
}

impl PrimaryListener {
    fn open(mode: ListenMode, addr: SocketAddr) -> anyhow::Result<Self> {
        match mode {
            ListenMode::ReusePort => Ok(Self::ReusePort(addr)),
            #[cfg(unix)]
            ListenMode::Inherited => {
                let shared = crate::listener::SharedSocket::bind(addr)
                    .with_context(|| format!("failed to bind shared listener on {addr}"))?;
                Ok(Self::Shared(shared))
            }
            #[cfg(not(unix))]
            ListenMode::Inherited => {
                anyhow::bail!("inherited listen mode requires a unix platform")
            }
        }
    }

    fn spec(&self) -> ListenSpec {
        match self {
            Self::ReusePort(addr) => ListenSpec::ReusePort { addr: *addr },
            #[cfg(unix)]
            Self::Shared(shared) => shared.spec(),
        }
    }
}

/// Wait for SIGINT or SIGTERM.
///
/// If a handler cannot be installed the error is logged and that signal is
/// never reported; the other one still is.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}
