//! Worker process creation.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::bridge::protocol::WorkerId;
use crate::role::{ROLE_ENV, Role};

#[derive(Debug, Clone)]
pub struct WorkerSpawnConfig {
    pub worker_id: WorkerId,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
///
/// Implementations must pipe stdin and stdout: they carry the control
/// channel. Stderr should be inherited so worker logs reach the primary's
/// log sink.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, config: &WorkerSpawnConfig) -> Result<Child, SpawnError>;
}

/// Re-executes the current binary in worker role.
pub struct SelfExecSpawner {
    program: PathBuf,
    args: Vec<OsString>,
}

impl SelfExecSpawner {
    /// Spawner for the running executable with the same arguments.
    pub fn current() -> Result<Self, SpawnError> {
        let program = std::env::current_exe()?;
        let args = std::env::args_os().skip(1).collect();
        Ok(Self { program, args })
    }

    /// Spawner for `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }
}

impl WorkerSpawner for SelfExecSpawner {
    fn spawn(&self, config: &WorkerSpawnConfig) -> Result<Child, SpawnError> {
        let marker = Role::Worker
            .marker()
            .ok_or_else(|| SpawnError::Other("worker role has no marker".to_string()))?;

        tracing::trace!(worker = %config.worker_id, program = %self.program.display(), "Executing worker");
        let child = Command::new(&self.program)
            .args(&self.args)
            .env(ROLE_ENV, marker)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        Ok(child)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn spawned_process_is_marked_as_worker() {
        // `env` prints its environment, which is what the child resolves its role from.
        let spawner = SelfExecSpawner::new("env");
        let mut child = spawner
            .spawn(&WorkerSpawnConfig {
                worker_id: WorkerId::new(1),
            })
            .unwrap();

        assert!(child.stdin.is_some());
        let mut output = String::new();
        child
            .stdout
            .take()
            .unwrap()
            .read_to_string(&mut output)
            .await
            .unwrap();
        assert!(child.wait().await.unwrap().success());

        let marker = output
            .lines()
            .find_map(|line| line.strip_prefix("FORKPOOL_ROLE="));
        assert_eq!(Role::from_marker(marker), Role::Worker);
    }

    #[test]
    fn current_keeps_the_running_executable() {
        let spawner = SelfExecSpawner::current().unwrap();
        assert_eq!(spawner.program, std::env::current_exe().unwrap());
        assert_eq!(spawner.args.len(), std::env::args_os().count() - 1);
    }
}
