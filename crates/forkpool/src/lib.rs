//! forkpool: self-healing prefork pool of HTTP worker processes.
//!
//! One primary process spawns a fixed number of workers from its own
//! binary. Every worker serves the same axum handler set on one shared port.
//! When a worker exits for any reason the primary logs the exit and spawns
//! a replacement, so the pool stays at full size.

pub mod bridge;
pub mod config;
pub mod exit;
pub mod launch;
pub mod listener;
pub mod restart;
pub mod role;
pub mod spawner;
pub mod supervisor;
pub mod worker;

pub use bridge::protocol::{ControlRequest, ControlResponse, WorkerId};
pub use config::{ConfigError, LaunchOptions, ListenMode, PoolConfig, ServerConfig};
pub use exit::{ExitClass, ExitEvent};
pub use launch::{launch, run_primary, run_worker_process, shutdown_signal};
pub use listener::{ListenSpec, bind_listener};
pub use restart::{BackoffPolicy, RestartPolicy, RestartTracker};
pub use role::Role;
pub use spawner::{SelfExecSpawner, SpawnError, WorkerSpawnConfig, WorkerSpawner};
pub use supervisor::{ExitReport, PoolSupervisor, Replacement, SupervisorError, WorkerHandle};
pub use worker::{ExitMode, ExitRequest, WorkerControl, WorkerError, run_worker};
