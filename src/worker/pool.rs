//! The plugin worker pool.
//!
//! With `max_process > 0` a launcher thread owns a pool of worker
//! subprocesses, assigns one call at a time to each, recycles workers
//! after a configurable number of calls, and forwards their replies
//! onto the bus. With `max_process <= 0` calls run inline in the
//! orchestrator process, the single-threaded cooperative fallback used
//! for debugging and tests.

use super::{bootstrap, PluginCall, PluginContext, WorkerReply, WorkerRequest, WORKER_ENV};
use crate::data::Identity;
use crate::error::{Error, Result};
use crate::messaging::{BusHandle, Message, Payload};
use crate::orchestrator::RpcExecutor;
use crate::plugin::PluginRegistry;
use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

const SHUTDOWN_GRACE_MS: u64 = 2_000;
const SHUTDOWN_POLL_MS: u64 = 10;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Maximum worker processes. Zero or negative selects inline mode.
    pub max_process: i32,
    /// Calls a worker serves before it is recycled. Zero disables
    /// recycling.
    pub refresh_after_tasks: u32,
    /// Worker runner executable. `None` re-invokes the current
    /// executable; a bare name is resolved on `$PATH`.
    pub worker_command: Option<PathBuf>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_process: 4,
            refresh_after_tasks: 1000,
            worker_command: None,
        }
    }
}

enum Mode {
    Inline {
        registry: Arc<PluginRegistry>,
        bus: BusHandle,
        rpc: Arc<RpcExecutor>,
    },
    Processes {
        tx: Sender<LauncherMsg>,
        launcher: Mutex<Option<JoinHandle<()>>>,
    },
}

/// Executes plugin callbacks, in worker subprocesses or inline.
pub struct WorkerPool {
    mode: Mode,
}

impl WorkerPool {
    /// Create a pool. Inline mode executes callbacks on the caller's
    /// thread; process mode starts a launcher thread that owns the
    /// worker subprocesses.
    pub fn new(
        config: WorkerPoolConfig,
        registry: Arc<PluginRegistry>,
        bus: BusHandle,
        rpc: Arc<RpcExecutor>,
    ) -> Self {
        if config.max_process <= 0 {
            debug!("worker pool running inline");
            return Self {
                mode: Mode::Inline { registry, bus, rpc },
            };
        }

        let (tx, rx) = channel();
        let self_tx = tx.clone();
        let launcher = std::thread::Builder::new()
            .name("plugin-launcher".to_string())
            .spawn(move || {
                Launcher::new(config, bus, rpc, rx, self_tx).run();
            })
            .expect("failed to spawn launcher thread");

        Self {
            mode: Mode::Processes {
                tx,
                launcher: Mutex::new(Some(launcher)),
            },
        }
    }

    /// Run one plugin callback.
    ///
    /// In process mode this only enqueues the call; results arrive
    /// later as bus messages. Inline mode executes the call before
    /// returning, with results already enqueued on the bus.
    pub fn run_plugin(&self, context: PluginContext, call: PluginCall) -> Result<()> {
        match &self.mode {
            Mode::Inline { registry, bus, rpc } => {
                let context =
                    context.with_in_process_channel(bus.clone(), Arc::clone(rpc));
                bootstrap(registry, context, &call);
                Ok(())
            }
            Mode::Processes { tx, .. } => tx
                .send(LauncherMsg::Run { context, call })
                .map_err(|_| Error::Fatal("plugin launcher is gone".to_string())),
        }
    }

    /// Stop the pool. Graceful stop drains outstanding calls; hard stop
    /// terminates workers after a short join window.
    pub fn stop(&self, wait: bool) -> Result<()> {
        match &self.mode {
            Mode::Inline { registry, .. } => {
                registry.clear_instances();
                Ok(())
            }
            Mode::Processes { tx, launcher } => {
                let _ = tx.send(LauncherMsg::Stop { wait });
                let handle = launcher
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take();
                if let Some(handle) = handle {
                    handle
                        .join()
                        .map_err(|_| Error::Fatal("plugin launcher panicked".to_string()))?;
                }
                Ok(())
            }
        }
    }
}

enum LauncherMsg {
    Run {
        context: PluginContext,
        call: PluginCall,
    },
    Stop {
        wait: bool,
    },
    WorkerDone {
        id: u64,
    },
    WorkerGone {
        id: u64,
    },
}

/// The call a busy worker is serving, kept so a dead worker's audit
/// still receives its ACK.
struct CurrentCall {
    audit_name: Option<String>,
    plugin_name: Option<String>,
    ack_identity: Option<Identity>,
}

struct WorkerHandle {
    child: Child,
    stdin: Arc<Mutex<Box<dyn Write + Send>>>,
    reader: Option<JoinHandle<()>>,
    tasks_served: u32,
    current: Option<CurrentCall>,
}

struct Launcher {
    config: WorkerPoolConfig,
    bus: BusHandle,
    rpc: Arc<RpcExecutor>,
    rx: Receiver<LauncherMsg>,
    self_tx: Sender<LauncherMsg>,
    workers: HashMap<u64, WorkerHandle>,
    idle: VecDeque<u64>,
    backlog: VecDeque<(PluginContext, PluginCall)>,
    next_id: u64,
}

impl Launcher {
    fn new(
        config: WorkerPoolConfig,
        bus: BusHandle,
        rpc: Arc<RpcExecutor>,
        rx: Receiver<LauncherMsg>,
        self_tx: Sender<LauncherMsg>,
    ) -> Self {
        Self {
            config,
            bus,
            rpc,
            rx,
            self_tx,
            workers: HashMap::new(),
            idle: VecDeque::new(),
            backlog: VecDeque::new(),
            next_id: 0,
        }
    }

    fn run(mut self) {
        debug!(max_process = self.config.max_process, "plugin launcher up");
        loop {
            let msg = match self.rx.recv() {
                Ok(msg) => msg,
                // The pool owner is gone; treat as a hard stop.
                Err(_) => {
                    self.shutdown(false);
                    return;
                }
            };
            match msg {
                LauncherMsg::Run { context, call } => {
                    self.backlog.push_back((context, call));
                    self.dispatch_backlog();
                }
                LauncherMsg::WorkerDone { id } => {
                    self.on_worker_done(id);
                    self.dispatch_backlog();
                }
                LauncherMsg::WorkerGone { id } => {
                    self.on_worker_gone(id);
                    self.dispatch_backlog();
                }
                LauncherMsg::Stop { wait } => {
                    self.shutdown(wait);
                    return;
                }
            }
        }
    }

    fn dispatch_backlog(&mut self) {
        while let Some((context, call)) = self.backlog.pop_front() {
            let worker_id = match self.idle.pop_front() {
                Some(id) => Some(id),
                None if self.workers.len() < self.config.max_process as usize => {
                    match self.spawn_worker() {
                        Ok(id) => Some(id),
                        Err(err) => {
                            error!(%err, "failed to spawn worker");
                            None
                        }
                    }
                }
                None => None,
            };

            let Some(worker_id) = worker_id else {
                self.backlog.push_front((context, call));
                return;
            };
            if let Err(err) = self.assign(worker_id, context, call) {
                error!(worker_id, %err, "failed to assign call to worker");
            }
        }
    }

    fn assign(&mut self, worker_id: u64, context: PluginContext, call: PluginCall) -> Result<()> {
        let current = CurrentCall {
            audit_name: context.audit_name().map(String::from),
            plugin_name: context.plugin_name().map(String::from),
            ack_identity: match &call {
                PluginCall::RecvInfo { item } => Some(item.identity().clone()),
                _ => None,
            },
        };
        let request = WorkerRequest::Call { context, call };
        let line = serde_json::to_string(&request)?;

        let worker = self
            .workers
            .get_mut(&worker_id)
            .ok_or_else(|| Error::Internal(format!("no such worker: {worker_id}")))?;
        {
            let mut stdin = worker.stdin.lock().unwrap_or_else(|e| e.into_inner());
            writeln!(stdin, "{line}").map_err(|e| Error::worker(e.to_string()))?;
            stdin.flush().map_err(|e| Error::worker(e.to_string()))?;
        }
        worker.current = Some(current);
        Ok(())
    }

    fn on_worker_done(&mut self, id: u64) {
        let recycle = {
            let Some(worker) = self.workers.get_mut(&id) else {
                return;
            };
            worker.current = None;
            worker.tasks_served += 1;
            self.config.refresh_after_tasks > 0
                && worker.tasks_served >= self.config.refresh_after_tasks
        };

        if recycle {
            debug!(worker_id = id, "recycling worker");
            if let Some(worker) = self.workers.remove(&id) {
                stop_worker(worker, true);
            }
        } else {
            self.idle.push_back(id);
        }
    }

    fn on_worker_gone(&mut self, id: u64) {
        let Some(worker) = self.workers.remove(&id) else {
            return;
        };
        self.idle.retain(|&other| other != id);
        warn!(worker_id = id, "worker exited unexpectedly");

        // A call died with the worker: surface the failure and keep the
        // audit's ACK accounting intact.
        if let Some(current) = &worker.current {
            if let Some(audit) = &current.audit_name {
                let mut message = Message::new(Payload::Error {
                    kind: "worker".to_string(),
                    message: "worker process died during plugin call".to_string(),
                    trace: String::new(),
                })
                .for_audit(audit.as_str());
                if let Some(plugin) = &current.plugin_name {
                    message = message.from_plugin(plugin.as_str());
                }
                let _ = self.bus.send(message);

                let mut ack = Message::ack(audit.as_str(), current.ack_identity.clone());
                if let Some(plugin) = &current.plugin_name {
                    ack = ack.from_plugin(plugin.as_str());
                }
                let _ = self.bus.send(ack);
            }
        }
        stop_worker(worker, false);
    }

    fn shutdown(&mut self, wait: bool) {
        debug!(wait, "plugin launcher stopping");
        if wait {
            // Drain the backlog and the in-flight calls.
            while !self.backlog.is_empty()
                || self.workers.values().any(|w| w.current.is_some())
            {
                self.dispatch_backlog();
                match self.rx.recv_timeout(Duration::from_millis(SHUTDOWN_GRACE_MS)) {
                    Ok(LauncherMsg::WorkerDone { id }) => self.on_worker_done(id),
                    Ok(LauncherMsg::WorkerGone { id }) => self.on_worker_gone(id),
                    Ok(LauncherMsg::Run { .. }) => {
                        warn!("plugin call submitted during shutdown, dropping");
                    }
                    Ok(LauncherMsg::Stop { .. }) => {}
                    Err(_) => {
                        warn!("timed out draining workers, terminating them");
                        break;
                    }
                }
            }
        }

        for (_, worker) in self.workers.drain() {
            stop_worker(worker, wait);
        }
    }

    fn spawn_worker(&mut self) -> Result<u64> {
        let id = self.next_id;
        self.next_id += 1;

        let command = resolve_worker_command(&self.config)?;
        let mut child = Command::new(&command)
            .env(WORKER_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                Error::worker(format!(
                    "failed to spawn worker ({}): {e}",
                    command.display()
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::worker("failed to get worker stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::worker("failed to get worker stdout".to_string()))?;
        let mut stdout = BufReader::new(stdout);

        // Ready handshake before the worker joins the pool.
        let mut line = String::new();
        let read = stdout
            .read_line(&mut line)
            .map_err(|e| Error::worker(format!("failed to read worker ready message: {e}")))?;
        if read == 0 {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::worker(
                "worker exited before sending ready message".to_string(),
            ));
        }
        match serde_json::from_str::<WorkerReply>(line.trim_end()) {
            Ok(WorkerReply::Ready) => {}
            other => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::worker(format!(
                    "expected worker ready message, got: {other:?}"
                )));
            }
        }

        let stdin: Arc<Mutex<Box<dyn Write + Send>>> = Arc::new(Mutex::new(Box::new(stdin)));
        let reader = spawn_reader(
            id,
            stdout,
            Arc::clone(&stdin),
            self.bus.clone(),
            Arc::clone(&self.rpc),
            self.self_tx.clone(),
        );

        debug!(worker_id = id, "worker up");
        self.workers.insert(
            id,
            WorkerHandle {
                child,
                stdin,
                reader: Some(reader),
                tasks_served: 0,
                current: None,
            },
        );
        Ok(id)
    }
}

/// Forward a worker's replies: messages onto the bus, RPCs to the
/// executor (blocking this service thread, never the orchestrator),
/// completion and exit events to the launcher.
fn spawn_reader(
    id: u64,
    mut stdout: BufReader<std::process::ChildStdout>,
    stdin: Arc<Mutex<Box<dyn Write + Send>>>,
    bus: BusHandle,
    rpc: Arc<RpcExecutor>,
    launcher: Sender<LauncherMsg>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("worker-{id}-reader"))
        .spawn(move || {
            loop {
                let mut line = String::new();
                match stdout.read_line(&mut line) {
                    Ok(0) | Err(_) => {
                        let _ = launcher.send(LauncherMsg::WorkerGone { id });
                        return;
                    }
                    Ok(_) => {}
                }
                let reply: WorkerReply = match serde_json::from_str(line.trim_end()) {
                    Ok(reply) => reply,
                    Err(err) => {
                        warn!(worker_id = id, %err, "undecodable worker reply");
                        continue;
                    }
                };
                match reply {
                    WorkerReply::Ready => {}
                    WorkerReply::Done => {
                        let _ = launcher.send(LauncherMsg::WorkerDone { id });
                    }
                    WorkerReply::Msg { message } => {
                        if let Payload::Rpc {
                            id: rpc_id,
                            request,
                            wants_reply,
                        } = message.payload()
                        {
                            let outcome = rpc.execute(
                                message.audit_name(),
                                message.plugin_name(),
                                request.clone(),
                            );
                            if *wants_reply {
                                let response = WorkerRequest::RpcResponse {
                                    id: *rpc_id,
                                    outcome: outcome.into(),
                                };
                                if let Ok(line) = serde_json::to_string(&response) {
                                    let mut stdin =
                                        stdin.lock().unwrap_or_else(|e| e.into_inner());
                                    let _ = writeln!(stdin, "{line}");
                                    let _ = stdin.flush();
                                }
                            }
                        } else if bus.send(message).is_err() {
                            warn!(worker_id = id, "bus closed, dropping worker message");
                        }
                    }
                }
            }
        })
        .expect("failed to spawn worker reader thread")
}

fn stop_worker(mut worker: WorkerHandle, graceful: bool) {
    if graceful {
        let stop = serde_json::to_string(&WorkerRequest::Stop).unwrap_or_default();
        let mut stdin = worker.stdin.lock().unwrap_or_else(|e| e.into_inner());
        let _ = writeln!(stdin, "{stop}");
        let _ = stdin.flush();
        drop(stdin);
        if let Err(err) = wait_for_exit_with_timeout(
            &mut worker.child,
            Duration::from_millis(SHUTDOWN_GRACE_MS),
        ) {
            warn!(%err, "worker did not stop gracefully");
        }
    } else {
        let _ = worker.child.kill();
        let _ = worker.child.wait();
    }
    if let Some(reader) = worker.reader.take() {
        let _ = reader.join();
    }
}

fn wait_for_exit_with_timeout(child: &mut Child, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return Ok(()),
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Error::worker(format!(
                        "worker did not exit within {}ms; process was terminated",
                        timeout.as_millis()
                    )));
                }
                std::thread::sleep(Duration::from_millis(SHUTDOWN_POLL_MS));
            }
            Err(e) => {
                return Err(Error::worker(format!(
                    "failed while waiting for worker to exit: {e}"
                )));
            }
        }
    }
}

fn resolve_worker_command(config: &WorkerPoolConfig) -> Result<PathBuf> {
    match &config.worker_command {
        None => std::env::current_exe()
            .map_err(|e| Error::worker(format!("cannot locate current executable: {e}"))),
        Some(command) if command.components().count() == 1 => which::which(command)
            .map_err(|e| Error::worker(format!("worker command not found: {e}"))),
        Some(command) => Ok(command.clone()),
    }
}
