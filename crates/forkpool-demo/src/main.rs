//! forkpool-demo: one CPU-bound HTTP handler served by a pool of worker
//! processes, one per core.
//!
//! Environment:
//! - `PORT` / `HOST`: listen address (default 0.0.0.0:5000)
//! - `FORKPOOL_WORKERS`: pool size override (default: logical cores)
//! - `BURN_MS`: CPU time spent per `GET /` request
//! - `FORKPOOL_LOG` / `RUST_LOG` / `LOG_FORMAT=json`: logging

mod routes;

use std::io::IsTerminal;

use forkpool::Role;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("FORKPOOL_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        EnvFilter::new(format!(
            "forkpool={level},forkpool_demo={level}",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    // Workers inherit stderr, so every process in the pool logs to one sink.
    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry().with(filter).with(
            fmt::layer()
                .with_ansi(std::io::stderr().is_terminal())
                .with_writer(std::io::stderr),
        );
        let _ = subscriber.try_init();
    }
}

fn main() {
    init_tracing();

    let role = Role::resolve();
    if role.is_primary() {
        info!("forkpool-demo {}", env!("CARGO_PKG_VERSION"));
    }

    match forkpool::launch(role, routes::router) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!(?role, "{e:#}");
            std::process::exit(1);
        }
    }
}
