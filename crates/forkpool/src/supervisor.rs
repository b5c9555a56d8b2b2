//! Pool supervisor - keeps the worker pool at its configured size.
//!
//! Flow:
//! 1. Spawn `worker_count` workers, each with its own control channel
//! 2. One watcher task per worker reports that worker's exit
//! 3. The event loop classifies each exit and spawns exactly one replacement
//! 4. On shutdown: stop respawning, ask workers to exit, kill stragglers

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{Notify, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{ControlRequest, ControlResponse, WorkerId};
use crate::config::PoolConfig;
use crate::exit::{ExitClass, ExitEvent};
use crate::listener::ListenSpec;
use crate::restart::{BackoffPolicy, RestartPolicy, RestartTracker};
use crate::spawner::{SpawnError, WorkerSpawnConfig, WorkerSpawner};

/// How long workers get to exit after `Shutdown` before they are killed.
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Supervisor-side record of one live worker process.
pub struct WorkerHandle {
    id: WorkerId,
    pid: Option<u32>,
    spawned_at: Instant,
    ctrl_tx: mpsc::UnboundedSender<ControlRequest>,
    kill: Arc<Notify>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn uptime(&self) -> Duration {
        self.spawned_at.elapsed()
    }

    /// Queue a control request. Returns false once the channel is gone.
    fn request(&self, request: ControlRequest) -> bool {
        self.ctrl_tx.send(request).is_ok()
    }

    fn kill(&self) {
        self.kill.notify_one();
    }
}

/// What the supervisor did about an exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replacement {
    /// A new worker was spawned while handling the exit.
    Spawned(WorkerId),
    /// A new worker will be spawned after this delay.
    Scheduled(Duration),
    /// The pool is shutting down; nothing replaces the worker.
    Suppressed,
}

/// Passed to exit observers, once per worker termination.
#[derive(Debug, Clone)]
pub struct ExitReport {
    pub event: ExitEvent,
    pub class: ExitClass,
    pub replacement: Replacement,
    /// Live workers right after the replacement decision.
    pub live_workers: usize,
}

type ExitObserver = Box<dyn Fn(&ExitReport) + Send + Sync>;

enum PoolEvent {
    Exited(ExitEvent),
    Respawn { attempt: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker {index} of {total}: {source}")]
    InitialSpawn {
        index: usize,
        total: usize,
        #[source]
        source: SpawnError,
    },
}

/// Maintains exactly `worker_count` live workers, healing every exit.
pub struct PoolSupervisor {
    config: PoolConfig,
    listen: ListenSpec,
    spawner: Arc<dyn WorkerSpawner>,
    restart: RestartPolicy,
    tracker: RestartTracker,
    spawn_retry: BackoffPolicy,
    shutdown_grace: Duration,
    workers: HashMap<WorkerId, WorkerHandle>,
    next_id: u64,
    events_tx: mpsc::UnboundedSender<PoolEvent>,
    events_rx: mpsc::UnboundedReceiver<PoolEvent>,
    observers: Vec<ExitObserver>,
    pending_respawns: usize,
    shutting_down: bool,
}

impl PoolSupervisor {
    pub fn new(config: PoolConfig, listen: ListenSpec, spawner: Arc<dyn WorkerSpawner>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            listen,
            spawner,
            restart: RestartPolicy::default(),
            tracker: RestartTracker::default(),
            spawn_retry: BackoffPolicy::exponential(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            workers: HashMap::new(),
            next_id: 1,
            events_tx,
            events_rx,
            observers: Vec::new(),
            pending_respawns: 0,
            shutting_down: false,
        }
    }

    pub fn with_restart_policy(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    /// Backoff between attempts when spawning a replacement fails.
    pub fn with_spawn_retry(mut self, backoff: BackoffPolicy) -> Self {
        self.spawn_retry = backoff;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Register an observer called once per worker termination, serially,
    /// after the replacement decision.
    pub fn on_exit(&mut self, observer: impl Fn(&ExitReport) + Send + Sync + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn live_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerHandle> {
        self.workers.values()
    }

    /// Spawn the initial pool. Returns once every spawn has been issued;
    /// workers bind their listeners on their own time.
    ///
    /// Must be called inside a tokio runtime.
    pub fn initialize(&mut self) -> Result<Vec<WorkerId>, SupervisorError> {
        let total = self.config.worker_count();
        let pid = std::process::id();
        tracing::info!(pid, workers = total, "primary {} initialising pool", pid);

        let mut ids = Vec::with_capacity(total);
        for index in 0..total {
            let id = self
                .spawn_worker()
                .map_err(|source| SupervisorError::InitialSpawn {
                    index,
                    total,
                    source,
                })?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Process exit events until `shutdown` resolves, then tear the pool down.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested, stopping worker pool");
                    break;
                }

                event = self.events_rx.recv() => match event {
                    Some(PoolEvent::Exited(event)) => self.handle_exit(event),
                    Some(PoolEvent::Respawn { attempt }) => self.handle_respawn(attempt),
                    None => break,
                },
            }
        }

        self.shutdown_workers().await;
    }

    fn spawn_worker(&mut self) -> Result<WorkerId, SpawnError> {
        let id = WorkerId::new(self.next_id);
        self.next_id += 1;

        let child = self.spawner.spawn(&WorkerSpawnConfig { worker_id: id })?;
        let pid = child.id();
        let spawned_at = Instant::now();

        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let _ = ctrl_tx.send(ControlRequest::Init {
            worker_id: id,
            listen: self.listen.clone(),
        });
        let kill = Arc::new(Notify::new());

        tokio::spawn(watch_worker(WorkerWatch {
            id,
            pid,
            child,
            spawned_at,
            ctrl_rx,
            kill: Arc::clone(&kill),
            events_tx: self.events_tx.clone(),
        }));

        self.workers.insert(
            id,
            WorkerHandle {
                id,
                pid,
                spawned_at,
                ctrl_tx,
                kill,
            },
        );
        tracing::debug!(worker = %id, ?pid, "Spawned worker");
        Ok(id)
    }

    fn handle_exit(&mut self, event: ExitEvent) {
        let class = event.classify();
        if self.workers.remove(&event.worker).is_none() {
            tracing::warn!(worker = %event.worker, "Exit reported for unknown worker");
        }

        let message = event.describe();
        let uptime_ms = event.uptime.as_millis() as u64;
        match class {
            ExitClass::CleanExit => tracing::info!(
                worker = %event.worker,
                class = %class,
                uptime_ms,
                reason = event.reason.as_deref(),
                "{}", message
            ),
            ExitClass::ErrorExit | ExitClass::Signaled => tracing::warn!(
                worker = %event.worker,
                class = %class,
                uptime_ms,
                reason = event.reason.as_deref(),
                "{}", message
            ),
        }

        let replacement = if self.shutting_down {
            Replacement::Suppressed
        } else {
            let rapid_exits = self.tracker.record_exit(event.uptime);
            let delay = self.restart.delay(rapid_exits);
            if delay.is_zero() {
                self.respawn(1)
            } else {
                tracing::info!(
                    delay_ms = delay.as_millis() as u64,
                    rapid_exits,
                    "Delaying replacement worker"
                );
                self.schedule_respawn(delay, 1);
                Replacement::Scheduled(delay)
            }
        };

        let report = ExitReport {
            event,
            class,
            replacement,
            live_workers: self.workers.len(),
        };
        for observer in &self.observers {
            observer(&report);
        }
    }

    fn handle_respawn(&mut self, attempt: u32) {
        self.pending_respawns = self.pending_respawns.saturating_sub(1);
        if self.shutting_down {
            return;
        }
        self.respawn(attempt);
    }

    fn respawn(&mut self, attempt: u32) -> Replacement {
        match self.spawn_worker() {
            Ok(id) => {
                tracing::info!(worker = %id, live = self.workers.len(), "Spawned replacement worker");
                Replacement::Spawned(id)
            }
            Err(e) => {
                let delay = self.spawn_retry.delay_for_attempt(attempt);
                tracing::error!(
                    error = %e,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    "Failed to spawn replacement worker"
                );
                self.schedule_respawn(delay, attempt.saturating_add(1));
                Replacement::Scheduled(delay)
            }
        }
    }

    fn schedule_respawn(&mut self, delay: Duration, attempt: u32) {
        self.pending_respawns += 1;
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(PoolEvent::Respawn { attempt });
        });
    }

    async fn shutdown_workers(&mut self) {
        self.shutting_down = true;
        if self.pending_respawns > 0 {
            tracing::debug!(pending = self.pending_respawns, "Dropping pending respawns");
        }
        if self.workers.is_empty() {
            return;
        }

        tracing::info!(workers = self.workers.len(), "Asking workers to shut down");
        for handle in self.workers.values() {
            if !handle.request(ControlRequest::Shutdown) {
                handle.kill();
            }
        }

        if self.drain_exits(self.shutdown_grace).await {
            return;
        }

        tracing::warn!(
            remaining = self.workers.len(),
            "Workers ignored shutdown, killing"
        );
        for handle in self.workers.values() {
            handle.kill();
        }
        if !self.drain_exits(KILL_WAIT).await {
            tracing::error!(
                remaining = self.workers.len(),
                "Workers still running after kill"
            );
        }
    }

    /// Handle exit events until no workers remain or `within` elapses.
    async fn drain_exits(&mut self, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        while !self.workers.is_empty() {
            match tokio::time::timeout_at(deadline, self.events_rx.recv()).await {
                Ok(Some(PoolEvent::Exited(event))) => self.handle_exit(event),
                Ok(Some(PoolEvent::Respawn { .. })) => {
                    self.pending_respawns = self.pending_respawns.saturating_sub(1);
                }
                Ok(None) | Err(_) => break,
            }
        }
        self.workers.is_empty()
    }
}

struct WorkerWatch {
    id: WorkerId,
    pid: Option<u32>,
    child: Child,
    spawned_at: Instant,
    ctrl_rx: mpsc::UnboundedReceiver<ControlRequest>,
    kill: Arc<Notify>,
    events_tx: mpsc::UnboundedSender<PoolEvent>,
}

/// Owns one worker process: feeds its control channel, reads its reports,
/// reaps it and forwards the exit to the supervisor.
async fn watch_worker(watch: WorkerWatch) {
    let WorkerWatch {
        id,
        pid,
        mut child,
        spawned_at,
        ctrl_rx,
        kill,
        events_tx,
    } = watch;

    let forwarder = child
        .stdin
        .take()
        .map(|stdin| tokio::spawn(forward_requests(id, stdin, ctrl_rx)));

    let mut reason: Option<String> = None;
    let mut killed = false;

    if let Some(stdout) = child.stdout.take() {
        let mut reader = FramedRead::new(stdout, JsonCodec::<ControlResponse>::new());
        loop {
            tokio::select! {
                msg = reader.next() => match msg {
                    Some(Ok(response)) => {
                        log_response(id, &response);
                        if let Some(r) = response.exit_reason() {
                            reason = Some(r.to_string());
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(worker = %id, error = %e, "Control channel error");
                        break;
                    }
                    None => break,
                },
                _ = kill.notified() => {
                    kill_child(id, &mut child);
                    killed = true;
                    break;
                }
            }
        }
    }

    let status = if killed {
        child.wait().await
    } else {
        loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = kill.notified() => kill_child(id, &mut child),
            }
        }
    };

    if let Some(forwarder) = forwarder {
        forwarder.abort();
    }

    let uptime = spawned_at.elapsed();
    let event = match status {
        Ok(status) => ExitEvent::from_status(id, pid, &status, uptime, reason),
        Err(e) => {
            tracing::error!(worker = %id, error = %e, "Failed to collect worker exit status");
            ExitEvent::unknown(id, pid, uptime, reason)
        }
    };

    if events_tx.send(PoolEvent::Exited(event)).is_err() {
        tracing::debug!(worker = %id, "Supervisor gone, dropping exit event");
    }
}

async fn forward_requests(
    id: WorkerId,
    stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<ControlRequest>,
) {
    let mut writer = FramedWrite::new(stdin, JsonCodec::<ControlRequest>::new());
    while let Some(request) = rx.recv().await {
        if let Err(e) = writer.send(request).await {
            tracing::debug!(worker = %id, error = %e, "Control channel closed, dropping requests");
            break;
        }
    }
}

fn kill_child(id: WorkerId, child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!(worker = %id, error = %e, "Kill failed (already exited?)");
    }
}

fn log_response(id: WorkerId, response: &ControlResponse) {
    match response {
        ControlResponse::Listening { pid, addr } => {
            tracing::debug!(worker = %id, pid, %addr, "Worker listening");
        }
        ControlResponse::Exiting { code, reason } => {
            tracing::debug!(worker = %id, code, %reason, "Worker announced exit");
        }
        ControlResponse::Fatal { reason } => {
            tracing::error!(worker = %id, %reason, "Worker reported fatal error");
        }
    }
}
