//! The top-level orchestrator.
//!
//! The orchestrator owns the message bus, the worker pool, the plugin
//! registry, the network primitives and the running audits. Its
//! consumer loop routes every message:
//! 1. data messages go to their audit's coordinator;
//! 2. ACKs drive stage advancement;
//! 3. control and status traffic fans out to UI observers;
//! 4. the last audit closing ends the run.
//!
//! It also hosts the RPC surface plugins call back into: store queries,
//! cache access, slot acquisition and bulk calls.

use crate::audit::AuditManager;
use crate::config::{AuditConfig, OrchestratorConfig};
use crate::database::AuditStore;
use crate::error::{Error, Result};
use crate::messaging::{
    BusHandle, Message, MessageBus, MessageType, Payload, RpcFailure, RpcOutcome, RpcRequest,
    UiNotifier, WireOutcome,
};
use crate::net::{NetworkCache, SlotManager};
use crate::plugin::{PluginCategory, PluginRegistry, Stage};
use crate::scope::{DnsResolver, SystemResolver};
use crate::worker::{WorkerPool, WorkerPoolConfig};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Shared components handed to every audit coordinator.
#[derive(Clone)]
pub(crate) struct CoreHandles {
    pub registry: Arc<PluginRegistry>,
    pub pool: Arc<WorkerPool>,
    pub bus: BusHandle,
    pub rpc: Arc<RpcExecutor>,
    pub cache: Arc<NetworkCache>,
}

/// Executes plugin RPCs against the orchestrator's shared state.
///
/// Every call is a pure function of the shared components, so it can
/// run from a worker's service thread or inline in a plugin without
/// touching the orchestrator's own state. Store writes never happen
/// here; data injection goes through the bus so the coordinator stays
/// the single writer.
pub struct RpcExecutor {
    stores: Mutex<HashMap<String, Arc<AuditStore>>>,
    cache: Arc<NetworkCache>,
    slots: Arc<SlotManager>,
    bus: BusHandle,
}

impl RpcExecutor {
    pub fn new(cache: Arc<NetworkCache>, slots: Arc<SlotManager>, bus: BusHandle) -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
            cache,
            slots,
            bus,
        }
    }

    pub(crate) fn register_store(&self, audit: &str, store: Arc<AuditStore>) {
        self.stores
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(audit.to_string(), store);
    }

    pub(crate) fn unregister_store(&self, audit: &str) {
        self.stores
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(audit);
    }

    fn store_for(&self, audit: Option<&str>) -> std::result::Result<Arc<AuditStore>, RpcFailure> {
        let audit = audit.ok_or_else(|| RpcFailure {
            kind: "config".to_string(),
            message: "RPC without an audit context".to_string(),
            trace: String::new(),
        })?;
        self.stores
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(audit)
            .cloned()
            .ok_or_else(|| RpcFailure {
                kind: "config".to_string(),
                message: format!("no running audit named {audit}"),
                trace: String::new(),
            })
    }

    /// Execute one RPC. Errors come back as failures that preserve the
    /// original error kind; they never panic the caller's thread.
    pub fn execute(
        &self,
        audit: Option<&str>,
        plugin: Option<&str>,
        request: RpcRequest,
    ) -> RpcOutcome {
        debug!(audit, plugin, call = request.name(), "executing RPC");
        match request {
            RpcRequest::GetData { identity } => {
                let store = self.store_for(audit)?;
                let data = store
                    .get(&identity)
                    .map_err(|e| RpcFailure::from_error(&e))?;
                match data {
                    Some(data) => {
                        serde_json::to_value(data).map_err(|e| RpcFailure::from_error(&e.into()))
                    }
                    None => Err(RpcFailure {
                        kind: "not_found".to_string(),
                        message: format!("no data with identity {identity}"),
                        trace: String::new(),
                    }),
                }
            }
            RpcRequest::HasData { identity } => {
                let store = self.store_for(audit)?;
                let has = store
                    .has(&identity)
                    .map_err(|e| RpcFailure::from_error(&e))?;
                Ok(serde_json::Value::Bool(has))
            }
            RpcRequest::GetPendingData { stage } => {
                let store = self.store_for(audit)?;
                let stage = Stage::from_index(stage).ok_or_else(|| RpcFailure {
                    kind: "config".to_string(),
                    message: format!("no stage with index {stage}"),
                    trace: String::new(),
                })?;
                let pending = store
                    .get_pending(stage)
                    .map_err(|e| RpcFailure::from_error(&e))?;
                serde_json::to_value(pending).map_err(|e| RpcFailure::from_error(&e.into()))
            }
            RpcRequest::CacheGet {
                scheme,
                key,
                policy,
            } => {
                let audit = audit.ok_or_else(|| RpcFailure {
                    kind: "config".to_string(),
                    message: "cache access without an audit context".to_string(),
                    trace: String::new(),
                })?;
                let hit = self.cache.get(audit, &scheme, &key, policy);
                serde_json::to_value(hit).map_err(|e| RpcFailure::from_error(&e.into()))
            }
            RpcRequest::CacheSet {
                scheme,
                key,
                response,
                cacheable,
                policy,
            } => {
                let audit = audit.ok_or_else(|| RpcFailure {
                    kind: "config".to_string(),
                    message: "cache access without an audit context".to_string(),
                    trace: String::new(),
                })?;
                self.cache
                    .set(audit, &scheme, &key, response, cacheable, policy);
                Ok(serde_json::Value::Null)
            }
            RpcRequest::AcquireSlot { host } => {
                // Blocks the calling service thread until granted; the
                // grant is handed over by whichever thread frees a slot.
                let (tx, rx) = std::sync::mpsc::sync_channel(1);
                self.slots.acquire_with(
                    &host,
                    Box::new(move || {
                        let _ = tx.send(());
                    }),
                );
                rx.recv().map_err(|_| RpcFailure {
                    kind: "internal".to_string(),
                    message: "slot manager dropped while waiting".to_string(),
                    trace: String::new(),
                })?;
                Ok(serde_json::Value::Null)
            }
            RpcRequest::ReleaseSlot { host } => {
                self.slots.release(&host);
                Ok(serde_json::Value::Null)
            }
            RpcRequest::SendData { items } => {
                let audit = audit.ok_or_else(|| RpcFailure {
                    kind: "config".to_string(),
                    message: "data injection without an audit context".to_string(),
                    trace: String::new(),
                })?;
                let mut message = Message::data(audit, items);
                if let Some(plugin) = plugin {
                    message = message.from_plugin(plugin);
                }
                self.bus
                    .send(message)
                    .map_err(|e| RpcFailure::from_error(&e))?;
                Ok(serde_json::Value::Null)
            }
            RpcRequest::Bulk { requests } => {
                // A functional map: elements fail independently.
                let outcomes: Vec<serde_json::Value> = requests
                    .into_iter()
                    .map(|request| {
                        let outcome = self.execute(audit, plugin, request);
                        serde_json::to_value(WireOutcome::from(outcome))
                            .unwrap_or(serde_json::Value::Null)
                    })
                    .collect();
                Ok(serde_json::Value::Array(outcomes))
            }
        }
    }
}

/// Top-level dispatcher driving every audit to completion.
pub struct Orchestrator {
    bus: MessageBus,
    handles: CoreHandles,
    audits: AuditManager,
    ui: UiNotifier,
    resolver: Arc<dyn DnsResolver>,
}

impl Orchestrator {
    /// Build an orchestrator from its configuration, a pool
    /// configuration and a populated plugin registry.
    pub fn new(
        config: OrchestratorConfig,
        mut pool_config: WorkerPoolConfig,
        registry: PluginRegistry,
    ) -> Self {
        let bus = MessageBus::new();
        let registry = Arc::new(registry);
        let cache = Arc::new(NetworkCache::new());
        let slots = Arc::new(SlotManager::new(config.max_connections_per_host));
        let rpc = Arc::new(RpcExecutor::new(
            Arc::clone(&cache),
            Arc::clone(&slots),
            bus.handle(),
        ));
        if pool_config.worker_command.is_none() {
            pool_config.worker_command = config.worker_command.clone();
        }
        let pool = Arc::new(WorkerPool::new(
            pool_config,
            Arc::clone(&registry),
            bus.handle(),
            Arc::clone(&rpc),
        ));

        // UI plugins run in-process and observe control and status
        // traffic for the whole run.
        let mut ui = UiNotifier::new();
        for descriptor in registry.plugins(PluginCategory::Ui) {
            match registry.load(&descriptor.name) {
                Ok(instance) => ui.add_plugin(descriptor.clone(), instance),
                Err(err) => warn!(plugin = descriptor.name, %err, "failed to load UI plugin"),
            }
        }

        let handles = CoreHandles {
            registry,
            pool,
            bus: bus.handle(),
            rpc,
            cache,
        };

        Self {
            bus,
            handles,
            audits: AuditManager::new(),
            ui,
            resolver: Arc::new(SystemResolver),
        }
    }

    /// Replace the DNS resolver used during scope bootstrap.
    pub fn with_resolver(mut self, resolver: Arc<dyn DnsResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// A handle for injecting messages from outside the consumer loop
    /// (e.g. a Ctrl-C handler sending a stop).
    pub fn bus_handle(&self) -> BusHandle {
        self.bus.handle()
    }

    /// The RPC executor, for in-process plugin harnesses.
    pub fn rpc(&self) -> Arc<RpcExecutor> {
        Arc::clone(&self.handles.rpc)
    }

    /// Create and bootstrap a new audit. Its first data batch is
    /// scheduled immediately; the consumer loop drives it from there.
    pub fn enqueue_audit(&mut self, config: AuditConfig) -> Result<String> {
        let name = self
            .audits
            .new_audit(config, self.handles.clone(), self.resolver.as_ref())?;
        info!(audit = name, "audit started");
        Ok(name)
    }

    /// Synchronously route one message, bypassing the queue. The
    /// in-process fast path for high-priority traffic.
    pub fn dispatch_msg(&mut self, message: Message) -> Result<bool> {
        match message.message_type() {
            MessageType::Data => {
                let Some(audit_name) = message.audit_name().map(String::from) else {
                    warn!("data message with no target audit, dropping");
                    return Ok(false);
                };
                let outcome = match self.audits.get_mut(&audit_name) {
                    Some(audit) => audit.dispatch_data(&message),
                    None => {
                        warn!(audit = audit_name, "data message for unknown audit");
                        return Ok(false);
                    }
                };
                match outcome {
                    Ok(sent) => Ok(sent),
                    Err(err) => {
                        self.fail_audit(&audit_name, err);
                        Ok(false)
                    }
                }
            }
            MessageType::Control => self.dispatch_control(message),
            MessageType::Status => {
                self.ui.notify(&message);
                Ok(true)
            }
            MessageType::Rpc => {
                // RPCs are answered on worker service threads; one on
                // the bus means a protocol bug somewhere.
                warn!("RPC message on the bus, dropping");
                Ok(false)
            }
        }
    }

    fn dispatch_control(&mut self, message: Message) -> Result<bool> {
        match message.payload() {
            Payload::Ack { .. } => {
                let Some(audit_name) = message.audit_name().map(String::from) else {
                    warn!("ACK with no target audit, dropping");
                    return Ok(false);
                };
                let failed = match self.audits.get_mut(&audit_name) {
                    Some(audit) => audit.acknowledge(&message).err(),
                    None => {
                        warn!(audit = audit_name, "ACK for a finished audit");
                        None
                    }
                };
                if let Some(err) = failed {
                    self.fail_audit(&audit_name, err);
                }
                Ok(true)
            }
            Payload::StopAudit { finished } => {
                let finished = *finished;
                self.ui.notify(&message);
                if let Some(audit_name) = message.audit_name().map(String::from) {
                    info!(audit = audit_name, finished, "audit finished");
                    self.close_audit(&audit_name);
                } else {
                    warn!("stop-audit message with no audit name");
                }
                Ok(true)
            }
            Payload::Stop { finished } => {
                info!(finished = *finished, "orchestrator stop requested");
                self.ui.notify(&message);
                for name in self.audits.names() {
                    self.close_audit(&name);
                }
                Ok(true)
            }
            Payload::StartAudit { config } => {
                let config = (**config).clone();
                if let Err(err) = self.enqueue_audit(config) {
                    error!(%err, "failed to start audit");
                }
                Ok(true)
            }
            Payload::Error { kind, message: text, .. } => {
                error!(
                    audit = message.audit_name(),
                    plugin = message.plugin_name(),
                    kind = %kind,
                    "plugin error: {text}"
                );
                self.ui.notify(&message);
                Ok(true)
            }
            Payload::Warning { warnings } => {
                for record in warnings {
                    warn!(
                        audit = message.audit_name(),
                        plugin = message.plugin_name(),
                        "{}",
                        record.message
                    );
                }
                self.ui.notify(&message);
                Ok(true)
            }
            Payload::Log { .. } => {
                self.ui.notify(&message);
                Ok(true)
            }
            _ => {
                warn!(code = ?message.code(), "unroutable control message");
                Ok(false)
            }
        }
    }

    /// Consume messages until the last audit closes.
    pub fn run(&mut self) -> Result<()> {
        while self.audits.has_audits() {
            let message = self.bus.recv()?;
            self.dispatch_msg(message)?;
        }
        self.close();
        Ok(())
    }

    /// Convenience entry point: build, enqueue and run audits, taking
    /// the pool settings from the first audit's configuration. An empty
    /// registry is populated by walking the plugins folder (the
    /// audit's own folder when given, the orchestrator's otherwise).
    pub fn run_audits(
        config: OrchestratorConfig,
        mut registry: PluginRegistry,
        audits: Vec<AuditConfig>,
    ) -> Result<()> {
        if registry.is_empty() {
            let folder = audits
                .iter()
                .find_map(|audit| audit.plugins_folder.clone())
                .unwrap_or_else(|| config.plugins_folder.clone());
            registry.find_plugins(&crate::config::expand_path(&folder))?;
        }

        let pool_config = audits
            .first()
            .map(|audit| WorkerPoolConfig {
                max_process: audit.max_process,
                refresh_after_tasks: audit.refresh_after_tasks,
                worker_command: config.worker_command.clone(),
            })
            .unwrap_or_default();

        let mut orchestrator = Self::new(config, pool_config, registry);
        for audit in audits {
            orchestrator.enqueue_audit(audit)?;
        }
        orchestrator.run()
    }

    fn fail_audit(&mut self, name: &str, err: Error) {
        error!(audit = name, %err, "audit failed");
        self.close_audit(name);
    }

    fn close_audit(&mut self, name: &str) {
        self.handles.rpc.unregister_store(name);
        if let Some(mut audit) = self.audits.remove(name) {
            if let Err(err) = audit.close() {
                warn!(audit = name, %err, "error closing audit");
            }
        }
        self.handles.cache.clear_audit(name);
    }

    fn close(&mut self) {
        debug!("orchestrator shutting down");
        // Drain what the workers already produced, then stop them.
        while let Some(message) = self.bus.try_recv() {
            let _ = self.dispatch_msg(message);
        }
        if let Err(err) = self.handles.pool.stop(true) {
            warn!(%err, "error stopping worker pool");
        }
    }
}
