//! Worker process supervision.
//!
//! The supervisor owns N runtime workers: it launches them, runs the
//! readiness handshake, keeps a heartbeat, and replaces a worker that dies.
//! No request is ever dispatched to a worker that has not completed its
//! handshake: a worker is registered with the router in `Starting` state and
//! only promoted once `runtime/info` has answered.
//!
//! Workers are obtained through a [`WorkerLauncher`], so tests can supply
//! in-process stubs speaking the real wire protocol while production spawns
//! actual runtime processes.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{info, warn};

use strand_types::{EngineError, WorkerId};
use strand_wire::message::methods;

use crate::registry::StreamRegistry;
use crate::router::WorkerRouter;
use crate::transport::{RequestOptions, RpcTransport, TransportConfig, TransportState};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Number of workers to keep alive.
    pub workers: usize,
    /// Delay before restarting a crashed worker.
    pub restart_delay: Duration,
    pub heartbeat_interval: Duration,
    /// Consecutive heartbeat failures before the worker is declared dead.
    pub heartbeat_strikes: u32,
    pub handshake_timeout: Duration,
    /// Grace period between drain and forced termination at shutdown.
    pub shutdown_grace: Duration,
    pub transport: TransportConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            restart_delay: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_strikes: 2,
            handshake_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
            transport: TransportConfig::default(),
        }
    }
}

/// A freshly launched worker: its byte pipe plus process bookkeeping.
pub struct WorkerConnection {
    pub pid: Option<u32>,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// Present for real processes; kept for forced termination.
    pub process: Option<tokio::process::Child>,
}

/// Produces worker connections.
#[async_trait]
pub trait WorkerLauncher: Send + Sync + 'static {
    async fn launch(&self, worker_id: WorkerId) -> Result<WorkerConnection, EngineError>;
}

/// Launches real runtime processes with stdio pipes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, worker_id: WorkerId) -> Result<WorkerConnection, EngineError> {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .env("STRAND_WORKER_ID", worker_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for (key, value) in &self.envs {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| {
            warn!(worker_id, error = %e, "failed to spawn worker process");
            EngineError::WorkerUnavailable
        })?;
        let stdout = child.stdout.take().ok_or(EngineError::Internal)?;
        let stdin = child.stdin.take().ok_or(EngineError::Internal)?;
        Ok(WorkerConnection {
            pid: child.id(),
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            process: Some(child),
        })
    }
}

struct SupervisedWorker {
    transport: RpcTransport,
    process: Option<tokio::process::Child>,
    tasks: Vec<tokio::task::AbortHandle>,
}

#[derive(Default)]
struct SupervisorInner {
    workers: HashMap<WorkerId, SupervisedWorker>,
}

pub struct WorkerSupervisor {
    config: SupervisorConfig,
    launcher: Arc<dyn WorkerLauncher>,
    router: Arc<WorkerRouter>,
    registry: Arc<StreamRegistry>,
    inner: Mutex<SupervisorInner>,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for WorkerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("supervisor mutex poisoned");
        f.debug_struct("WorkerSupervisor")
            .field("workers", &inner.workers.len())
            .finish()
    }
}

impl WorkerSupervisor {
    pub fn new(
        config: SupervisorConfig,
        launcher: Arc<dyn WorkerLauncher>,
        router: Arc<WorkerRouter>,
        registry: Arc<StreamRegistry>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            launcher,
            router,
            registry,
            inner: Mutex::new(SupervisorInner::default()),
            shutdown_tx,
        })
    }

    /// Bring up the configured number of workers. Returns once every worker
    /// has either completed its handshake or failed (failed workers retry in
    /// the background).
    pub async fn start(self: &Arc<Self>) {
        let mut bring_ups = Vec::new();
        for worker_id in 0..self.config.workers as WorkerId {
            let supervisor = Arc::clone(self);
            bring_ups.push(tokio::spawn(async move {
                supervisor.bring_up(worker_id).await;
            }));
        }
        for task in bring_ups {
            let _ = task.await;
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Launch, connect, and handshake one worker. On failure, schedules a
    /// delayed retry.
    async fn bring_up(self: Arc<Self>, worker_id: WorkerId) {
        if self.is_shutting_down() {
            return;
        }

        let connection = match self.launcher.launch(worker_id).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(worker_id, error = %e, "worker launch failed");
                self.schedule_restart(worker_id);
                return;
            }
        };

        self.router.register_worker(worker_id, connection.pid);

        let (transport, events) = RpcTransport::connect(
            connection.reader,
            connection.writer,
            self.config.transport.clone(),
        );

        // Demultiplexed stream traffic flows into the registry; the pump
        // also fails this worker's streams when the pipe closes.
        let pump = tokio::spawn(Arc::clone(&self.registry).pump(worker_id, events));

        // Readiness handshake: the worker is not routable until this answers.
        let handshake = transport
            .request(
                methods::RUNTIME_INFO,
                serde_json::json!({}),
                RequestOptions {
                    timeout: Some(self.config.handshake_timeout),
                    ..RequestOptions::default()
                },
            )
            .await;

        let capabilities = match handshake {
            Ok(value) => value
                .get("capabilities")
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_owned))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default(),
            Err(e) => {
                warn!(worker_id, error = %e, "worker handshake failed");
                pump.abort();
                transport.close();
                self.router.mark_worker_failed(worker_id);
                self.schedule_restart(worker_id);
                return;
            }
        };

        transport.mark_ready();
        self.router.set_worker_ready(worker_id, capabilities);
        info!(worker_id, "worker ready");

        // Watch for the transport dying and heartbeat the worker.
        let monitor = {
            let supervisor = Arc::clone(&self);
            let mut state_rx = transport.watch_state();
            tokio::spawn(async move {
                loop {
                    if *state_rx.borrow() == TransportState::Closed {
                        supervisor.handle_worker_down(worker_id).await;
                        return;
                    }
                    if state_rx.changed().await.is_err() {
                        return;
                    }
                }
            })
        };
        let heartbeat = {
            let supervisor = Arc::clone(&self);
            let transport = transport.clone();
            tokio::spawn(async move {
                supervisor.heartbeat_loop(worker_id, transport).await;
            })
        };

        let mut inner = self.inner.lock().expect("supervisor mutex poisoned");
        inner.workers.insert(
            worker_id,
            SupervisedWorker {
                transport,
                process: connection.process,
                tasks: vec![pump.abort_handle(), monitor.abort_handle(), heartbeat.abort_handle()],
            },
        );
    }

    async fn heartbeat_loop(self: Arc<Self>, worker_id: WorkerId, transport: RpcTransport) {
        let mut strikes = 0u32;
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a fresh worker is not
        // probed before it settles.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if self.is_shutting_down() {
                return;
            }
            let reply = transport
                .request(
                    methods::WORKER_METRICS,
                    serde_json::json!({}),
                    RequestOptions {
                        timeout: Some(self.config.heartbeat_interval),
                        ..RequestOptions::default()
                    },
                )
                .await;
            match reply {
                Ok(value) => {
                    strikes = 0;
                    let active = value
                        .get("active_requests")
                        .and_then(|v| v.as_u64())
                        .map(|v| v as u32);
                    let total = value.get("total_requests").and_then(|v| v.as_u64());
                    self.router.record_heartbeat(worker_id, active, total);
                }
                Err(e) => {
                    strikes += 1;
                    warn!(worker_id, strikes, error = %e, "worker heartbeat failed");
                    if strikes >= self.config.heartbeat_strikes {
                        // Closing the transport cascades into the state
                        // monitor, which fails the worker and restarts it.
                        transport.close();
                        return;
                    }
                }
            }
        }
    }

    /// A worker's pipe closed: fail it everywhere and schedule a restart.
    ///
    /// Runs inside the worker's own monitor task, and `retire` aborts that
    /// task, so the restart is scheduled first and all tear-down is
    /// synchronous.
    async fn handle_worker_down(self: &Arc<Self>, worker_id: WorkerId) {
        self.router.mark_worker_failed(worker_id);
        if !self.is_shutting_down() {
            warn!(worker_id, "worker down; scheduling restart");
            self.schedule_restart(worker_id);
        }
        self.registry
            .fail_worker_streams(worker_id, EngineError::WorkerFailed)
            .await;
        self.retire(worker_id, false);
    }

    fn schedule_restart(self: &Arc<Self>, worker_id: WorkerId) {
        if self.is_shutting_down() {
            return;
        }
        let supervisor = Arc::clone(self);
        let delay = self.config.restart_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            supervisor.bring_up(worker_id).await;
        });
    }

    /// Tear down one worker's tasks; the process is reaped off-task.
    fn retire(&self, worker_id: WorkerId, kill_process: bool) {
        let worker = {
            let mut inner = self.inner.lock().expect("supervisor mutex poisoned");
            inner.workers.remove(&worker_id)
        };
        let Some(mut worker) = worker else { return };
        for task in &worker.tasks {
            task.abort();
        }
        worker.transport.close();
        if let Some(mut process) = worker.process.take() {
            tokio::spawn(async move {
                if kill_process {
                    let _ = process.kill().await;
                } else {
                    // The pipe already closed; reap without blocking long.
                    let _ = tokio::time::timeout(Duration::from_secs(1), process.wait()).await;
                }
            });
        }
    }

    /// Transport handle for a routed worker, if that worker is ready.
    pub fn transport(&self, worker_id: WorkerId) -> Option<RpcTransport> {
        let inner = self.inner.lock().expect("supervisor mutex poisoned");
        inner.workers.get(&worker_id).map(|w| w.transport.clone())
    }

    pub fn worker_count(&self) -> usize {
        self.inner.lock().expect("supervisor mutex poisoned").workers.len()
    }

    /// Graceful shutdown: drain every transport, wait out the grace period
    /// for in-flight requests, then force-close and terminate.
    pub async fn shutdown(self: &Arc<Self>) {
        let _ = self.shutdown_tx.send(true);

        let worker_ids: Vec<WorkerId> = {
            let inner = self.inner.lock().expect("supervisor mutex poisoned");
            inner.workers.keys().copied().collect()
        };
        for worker_id in &worker_ids {
            if let Some(transport) = self.transport(*worker_id) {
                transport.drain();
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        loop {
            let in_flight: usize = worker_ids
                .iter()
                .filter_map(|id| self.transport(*id))
                .map(|t| t.in_flight())
                .sum();
            if in_flight == 0 || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        for worker_id in worker_ids {
            self.retire(worker_id, true);
            self.router.unregister_worker(worker_id);
        }
        info!("worker supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RouterConfig;
    use strand_wire::{encode_frame, FrameDecoder, RpcResponse};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Launcher that hands out in-process stub workers answering the
    /// handshake and heartbeat RPCs.
    struct StubLauncher {
        launches: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl WorkerLauncher for StubLauncher {
        async fn launch(&self, _worker_id: WorkerId) -> Result<WorkerConnection, EngineError> {
            self.launches.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let (gateway_io, worker_io) = tokio::io::duplex(64 * 1024);
            tokio::spawn(run_stub_worker(worker_io));
            let (reader, writer) = tokio::io::split(gateway_io);
            Ok(WorkerConnection {
                pid: None,
                reader: Box::new(reader),
                writer: Box::new(writer),
                process: None,
            })
        }
    }

    async fn run_stub_worker(io: tokio::io::DuplexStream) {
        let (mut reader, mut writer) = tokio::io::split(io);
        // Worker-side parsing is raw: gateway requests carry both `id` and
        // `method`, a shape the gateway-side Inbound classifier never sees.
        let mut frames = FrameDecoder::new(1 << 20);
        let mut buf = vec![0u8; 8192];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            frames.push(&buf[..n]);
            while let Ok(Some(payload)) = frames.try_next() {
                let Ok(raw) = serde_json::from_slice::<serde_json::Value>(&payload) else {
                    continue;
                };
                let (Some(id), Some(method)) = (
                    raw.get("id").and_then(|v| v.as_u64()),
                    raw.get("method").and_then(|v| v.as_str()),
                ) else {
                    continue;
                };
                let result = match method {
                    methods::RUNTIME_INFO => {
                        serde_json::json!({ "capabilities": ["m1"] })
                    }
                    methods::WORKER_METRICS => {
                        serde_json::json!({ "active_requests": 0, "total_requests": 7 })
                    }
                    _ => serde_json::json!({ "ok": true }),
                };
                let response = RpcResponse {
                    id,
                    result: Some(result),
                    error: None,
                };
                let payload = serde_json::to_vec(&response).unwrap();
                if writer.write_all(&encode_frame(&payload)).await.is_err() {
                    return;
                }
            }
        }
    }

    fn harness() -> (
        Arc<WorkerSupervisor>,
        Arc<WorkerRouter>,
        Arc<std::sync::atomic::AtomicUsize>,
    ) {
        let router = WorkerRouter::new(RouterConfig::default());
        let registry = StreamRegistry::new();
        let launches = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let launcher = Arc::new(StubLauncher {
            launches: Arc::clone(&launches),
        });
        let supervisor = WorkerSupervisor::new(
            SupervisorConfig {
                workers: 2,
                restart_delay: Duration::from_millis(50),
                heartbeat_interval: Duration::from_millis(100),
                ..SupervisorConfig::default()
            },
            launcher,
            Arc::clone(&router),
            registry,
        );
        (supervisor, router, launches)
    }

    #[tokio::test]
    async fn start_brings_workers_to_ready() {
        let (supervisor, router, _) = harness();
        supervisor.start().await;
        assert_eq!(supervisor.worker_count(), 2);
        let views = router.workers();
        assert_eq!(views.len(), 2);
        assert!(views.iter().all(|w| w.status == "idle"));
        assert!(views.iter().all(|w| w.skills == ["m1"]));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn heartbeat_folds_metrics_into_router() {
        let (supervisor, router, _) = harness();
        supervisor.start().await;
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if router.workers().iter().any(|w| w.total_requests == 7) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("heartbeat metrics should appear");
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn dead_worker_is_failed_and_relaunched() {
        let (supervisor, router, launches) = harness();
        supervisor.start().await;
        let initial = launches.load(std::sync::atomic::Ordering::SeqCst);

        // Kill worker 0's pipe from underneath it.
        supervisor.transport(0).expect("worker 0 present").close();

        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if launches.load(std::sync::atomic::Ordering::SeqCst) > initial {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("worker should be relaunched");

        // And the replacement becomes routable again.
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let ready = router
                    .workers()
                    .iter()
                    .filter(|w| w.status == "idle")
                    .count();
                if ready == 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("replacement worker should become ready");
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_restarts() {
        let (supervisor, _, launches) = harness();
        supervisor.start().await;
        supervisor.shutdown().await;
        let after_shutdown = launches.load(std::sync::atomic::Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            launches.load(std::sync::atomic::Ordering::SeqCst),
            after_shutdown,
            "no relaunches after shutdown"
        );
        assert_eq!(supervisor.worker_count(), 0);
    }
}
