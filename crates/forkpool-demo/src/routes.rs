//! Demo handler set.

use std::time::{Duration, Instant};

use axum::extract::State;
use axum::routing::get;
use axum::{Extension, Router};
use forkpool::WorkerControl;

pub const BURN_MS_ENV: &str = "BURN_MS";

const DEFAULT_BURN: Duration = Duration::from_millis(100);

#[derive(Clone)]
struct DemoState {
    burn: Duration,
}

/// Handler set served by every worker.
pub fn router() -> Router {
    let burn = std::env::var(BURN_MS_ENV)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_BURN);
    with_burn(burn)
}

fn with_burn(burn: Duration) -> Router {
    Router::new()
        .route("/", get(busy))
        .route("/kill-process", get(kill_process))
        .route("/ping", get(ping))
        .with_state(DemoState { burn })
}

/// Burns CPU on the worker's only thread before answering.
async fn busy(State(state): State<DemoState>) -> String {
    let spins = burn_cpu(state.burn);
    tracing::trace!(spins, "burned");
    format!("response from: {}", std::process::id())
}

async fn kill_process(Extension(control): Extension<WorkerControl>) -> String {
    let pid = std::process::id();
    tracing::info!(pid, worker = %control.worker_id(), "Self-termination requested");
    control.request_exit(0);
    format!("process: {pid} died")
}

async fn ping() -> String {
    format!("pong from: {}", std::process::id())
}

fn burn_cpu(duration: Duration) -> u64 {
    let start = Instant::now();
    let mut spins: u64 = 0;
    while start.elapsed() < duration {
        for _ in 0..1024 {
            spins = std::hint::black_box(spins.wrapping_add(1));
        }
    }
    spins
}
