//! Per-call plugin execution context.
//!
//! Every plugin call receives a [`PluginContext`]: the audit it runs
//! for, the audit's configuration and scope, the plugin's descriptor,
//! and a channel back to the orchestrator. The context is installed in
//! a saved/restored thread-local slot for the lifetime of the call, so
//! plugin code reaches it without threading it through every function.
//! No ambient state survives across calls.

use crate::config::AuditConfig;
use crate::data::{Data, Identity};
use crate::error::{Error, Result};
use crate::messaging::{
    clamp_progress, BusHandle, Message, Payload, RpcOutcome, RpcRequest, WarningRecord,
};
use crate::net::{CachePolicy, CachedResponse};
use crate::plugin::PluginDescriptor;
use crate::scope::AuditScope;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// How a context reaches the orchestrator.
#[derive(Clone, Default)]
pub(crate) enum Channel {
    /// No channel; sends fail. The state of a freshly deserialized
    /// context before the worker attaches its pipes.
    #[default]
    Detached,
    /// Same process as the orchestrator: messages enqueue on the bus,
    /// RPCs execute inline to avoid self-deadlock.
    InProcess {
        bus: BusHandle,
        rpc: Arc<crate::orchestrator::RpcExecutor>,
    },
    /// Worker subprocess: JSON lines over the worker's pipes.
    Wire {
        writer: Arc<Mutex<Box<dyn Write + Send>>>,
        reader: Arc<Mutex<Box<dyn BufRead + Send>>>,
    },
}

/// Per-call scratch state, discarded when the call ends.
#[derive(Default)]
pub(crate) struct CallScratch {
    /// Temporary data items kept alive for the duration of one call.
    pub temp: HashMap<Identity, Data>,
    /// Local read-through view of the network cache.
    pub cache: HashMap<(String, String), CachedResponse>,
}

#[derive(Clone, Default)]
pub(crate) struct ContextRuntime {
    pub channel: Channel,
    pub scratch: Arc<Mutex<CallScratch>>,
    pub warnings: Arc<Mutex<Vec<WarningRecord>>>,
}

/// Execution context of one plugin call.
#[derive(Clone, Serialize, Deserialize)]
pub struct PluginContext {
    audit_name: Option<String>,
    audit_config: Option<AuditConfig>,
    scope: Option<AuditScope>,
    plugin: Option<PluginDescriptor>,
    #[serde(skip)]
    pub(crate) runtime: ContextRuntime,
}

impl PluginContext {
    /// A context bound to an audit.
    pub fn for_audit(
        audit_name: impl Into<String>,
        audit_config: AuditConfig,
        scope: AuditScope,
    ) -> Self {
        Self {
            audit_name: Some(audit_name.into()),
            audit_config: Some(audit_config),
            scope: Some(scope),
            plugin: None,
            runtime: ContextRuntime::default(),
        }
    }

    /// An empty context. Sends fail until a channel is attached.
    pub fn detached() -> Self {
        Self {
            audit_name: None,
            audit_config: None,
            scope: None,
            plugin: None,
            runtime: ContextRuntime::default(),
        }
    }

    /// Narrow the context to one plugin.
    pub fn for_plugin(mut self, plugin: PluginDescriptor) -> Self {
        self.plugin = Some(plugin);
        self
    }

    pub(crate) fn with_in_process_channel(
        mut self,
        bus: BusHandle,
        rpc: Arc<crate::orchestrator::RpcExecutor>,
    ) -> Self {
        self.runtime.channel = Channel::InProcess { bus, rpc };
        self
    }

    pub(crate) fn attach_wire(
        &mut self,
        writer: Arc<Mutex<Box<dyn Write + Send>>>,
        reader: Arc<Mutex<Box<dyn BufRead + Send>>>,
    ) {
        self.runtime.channel = Channel::Wire { writer, reader };
    }

    /// Name of the audit, if bound to one.
    pub fn audit_name(&self) -> Option<&str> {
        self.audit_name.as_deref()
    }

    /// The audit configuration.
    pub fn audit_config(&self) -> Option<&AuditConfig> {
        self.audit_config.as_ref()
    }

    /// The audit scope.
    pub fn scope(&self) -> Option<&AuditScope> {
        self.scope.as_ref()
    }

    /// Descriptor of the running plugin.
    pub fn plugin(&self) -> Option<&PluginDescriptor> {
        self.plugin.as_ref()
    }

    /// Name of the running plugin.
    pub fn plugin_name(&self) -> Option<&str> {
        self.plugin.as_ref().map(|p| p.name.as_str())
    }

    fn audit_name_required(&self) -> Result<&str> {
        self.audit_name
            .as_deref()
            .ok_or_else(|| Error::Internal("plugin context has no audit".to_string()))
    }

    /// Route a message to the orchestrator.
    ///
    /// In-process contexts enqueue on the bus; worker contexts write to
    /// their pipe. A send failure means the orchestrator is gone.
    pub fn send_msg(&self, message: Message) -> Result<()> {
        match &self.runtime.channel {
            Channel::Detached => Err(Error::Internal(
                "plugin context is not attached to an orchestrator".to_string(),
            )),
            Channel::InProcess { bus, .. } => bus.send(message),
            Channel::Wire { writer, .. } => {
                let line = serde_json::to_string(&super::WorkerReply::Msg { message })?;
                let mut writer = writer.lock().unwrap_or_else(|e| e.into_inner());
                writeln!(writer, "{line}").map_err(|e| Error::worker(e.to_string()))?;
                writer.flush().map_err(|e| Error::worker(e.to_string()))
            }
        }
    }

    /// Send data items produced by this plugin.
    pub fn send_data(&self, items: Vec<Data>) -> Result<()> {
        let audit = self.audit_name_required()?.to_string();
        let mut message = Message::data(audit, items);
        if let Some(name) = self.plugin_name() {
            message = message.from_plugin(name);
        }
        self.send_msg(message)
    }

    /// Acknowledge the item this call processed. Low priority; sent on
    /// every exit path by the call wrapper.
    pub fn send_ack(&self, identity: Option<Identity>) -> Result<()> {
        let audit = self.audit_name_required()?.to_string();
        let mut message = Message::ack(audit, identity);
        if let Some(name) = self.plugin_name() {
            message = message.from_plugin(name);
        }
        self.send_msg(message)
    }

    /// Report plugin progress, clamped to 0.0–100.0.
    pub fn report_progress(&self, identity: &Identity, progress: f32) -> Result<()> {
        let audit = self.audit_name_required()?.to_string();
        let mut message = Message::new(Payload::PluginStep {
            identity: identity.clone(),
            progress: clamp_progress(progress),
        })
        .for_audit(audit);
        if let Some(name) = self.plugin_name() {
            message = message.from_plugin(name);
        }
        self.send_msg(message)
    }

    /// Emit a log line for UI observers.
    pub fn log(&self, text: impl Into<String>, level: u8, is_error: bool) -> Result<()> {
        let mut message = Message::new(Payload::Log {
            text: text.into(),
            level,
            is_error,
        });
        if let Some(audit) = self.audit_name() {
            message = message.for_audit(audit);
        }
        if let Some(plugin) = self.plugin_name() {
            message = message.from_plugin(plugin);
        }
        self.send_msg(message)
    }

    /// Record a warning; the call wrapper forwards the batch as one
    /// warning message when the call ends.
    pub fn warn(&self, message: impl Into<String>, category: impl Into<String>) {
        let mut record = WarningRecord::new(message, category);
        if let Some(plugin) = self.plugin_name() {
            record.source = plugin.to_string();
        }
        self.runtime
            .warnings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }

    /// Keep a data item alive in the per-call scratch store.
    pub fn stash(&self, item: Data) {
        self.runtime
            .scratch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .temp
            .insert(item.identity().clone(), item);
    }

    /// Fetch a stashed item.
    pub fn stashed(&self, identity: &Identity) -> Option<Data> {
        self.runtime
            .scratch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .temp
            .get(identity)
            .cloned()
    }

    /// Fail with [`Error::NetworkOutOfScope`] when a target is outside
    /// the audit scope. Plugins call this before touching the network.
    pub fn ensure_in_scope(&self, target: &str) -> Result<()> {
        match &self.scope {
            Some(scope) if !scope.contains(target) => {
                Err(Error::NetworkOutOfScope(target.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Read a response through the per-call cache view, falling back to
    /// the shared cache. Hits are kept locally for the rest of the
    /// call; the view is discarded when the call ends.
    pub fn cache_get(
        &self,
        scheme: &str,
        key: &str,
        policy: CachePolicy,
    ) -> Result<Option<CachedResponse>> {
        if policy == CachePolicy::Skip {
            return Ok(None);
        }
        let local_key = (scheme.to_string(), key.to_string());
        {
            let scratch = self
                .runtime
                .scratch
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(hit) = scratch.cache.get(&local_key) {
                return Ok(Some(hit.clone()));
            }
        }
        let value = self.remote_call(RpcRequest::CacheGet {
            scheme: scheme.to_string(),
            key: key.to_string(),
            policy,
        })?;
        let hit: Option<CachedResponse> = serde_json::from_value(value)?;
        if let Some(response) = &hit {
            self.runtime
                .scratch
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .cache
                .insert(local_key, response.clone());
        }
        Ok(hit)
    }

    /// Write a response to the local view and the shared cache.
    pub fn cache_put(
        &self,
        scheme: &str,
        key: &str,
        response: CachedResponse,
        cacheable: bool,
        policy: CachePolicy,
    ) -> Result<()> {
        if policy != CachePolicy::Skip {
            self.runtime
                .scratch
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .cache
                .insert((scheme.to_string(), key.to_string()), response.clone());
        }
        self.async_remote_call(RpcRequest::CacheSet {
            scheme: scheme.to_string(),
            key: key.to_string(),
            response,
            cacheable,
            policy,
        })
    }

    /// Acquire a per-host connection slot. The guard releases the slot
    /// on every exit path, including panics unwinding through the
    /// callback.
    pub fn acquire_slot(&self, host: &str) -> Result<SlotLease> {
        self.remote_call(RpcRequest::AcquireSlot {
            host: host.to_string(),
        })?;
        Ok(SlotLease {
            context: self.clone(),
            host: host.to_string(),
        })
    }

    /// Make a synchronous remote call on the orchestrator. The result
    /// value depends on the call; errors re-raise with the original
    /// error kind.
    pub fn remote_call(&self, request: RpcRequest) -> Result<serde_json::Value> {
        match self.call_remote(request, true)? {
            Some(outcome) => outcome.map_err(Into::into),
            None => Err(Error::Internal("expected an RPC reply".to_string())),
        }
    }

    /// Make an asynchronous remote call; no response is awaited.
    pub fn async_remote_call(&self, request: RpcRequest) -> Result<()> {
        self.call_remote(request, false).map(|_| ())
    }

    /// Synchronous bulk call: the nested call runs per element and the
    /// reply lists one outcome per element.
    pub fn bulk_remote_call(&self, requests: Vec<RpcRequest>) -> Result<serde_json::Value> {
        self.remote_call(RpcRequest::Bulk { requests })
    }

    /// Asynchronous bulk call.
    pub fn async_bulk_remote_call(&self, requests: Vec<RpcRequest>) -> Result<()> {
        self.async_remote_call(RpcRequest::Bulk { requests })
    }

    fn call_remote(&self, request: RpcRequest, wants_reply: bool) -> Result<Option<RpcOutcome>> {
        match &self.runtime.channel {
            Channel::Detached => Err(Error::Internal(
                "plugin context is not attached to an orchestrator".to_string(),
            )),
            Channel::InProcess { rpc, .. } => {
                // Executing inline avoids deadlocking against our own
                // message queue.
                let outcome = rpc.execute(self.audit_name(), self.plugin_name(), request);
                Ok(wants_reply.then_some(outcome))
            }
            Channel::Wire { writer, reader } => {
                let id = Uuid::new_v4();
                let mut message = Message::new(Payload::Rpc {
                    id,
                    request,
                    wants_reply,
                });
                if let Some(audit) = self.audit_name() {
                    message = message.for_audit(audit);
                }
                if let Some(plugin) = self.plugin_name() {
                    message = message.from_plugin(plugin);
                }
                let line = serde_json::to_string(&super::WorkerReply::Msg { message })?;
                {
                    let mut writer = writer.lock().unwrap_or_else(|e| e.into_inner());
                    writeln!(writer, "{line}").map_err(|e| Error::worker(e.to_string()))?;
                    writer.flush().map_err(|e| Error::worker(e.to_string()))?;
                }
                if !wants_reply {
                    return Ok(None);
                }
                self.wait_for_rpc_reply(id, reader).map(Some)
            }
        }
    }

    /// Block on the worker's pipe until the response for `id` arrives.
    /// The launcher never assigns another call while this one runs, so
    /// the only legal inbound traffic is RPC responses and a stop.
    fn wait_for_rpc_reply(
        &self,
        id: Uuid,
        reader: &Arc<Mutex<Box<dyn BufRead + Send>>>,
    ) -> Result<RpcOutcome> {
        let mut reader = reader.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let mut line = String::new();
            let read = reader
                .read_line(&mut line)
                .map_err(|e| Error::worker(e.to_string()))?;
            if read == 0 {
                return Err(Error::worker(
                    "orchestrator closed the pipe while an RPC was pending".to_string(),
                ));
            }
            let request: super::WorkerRequest = serde_json::from_str(line.trim_end())?;
            match request {
                super::WorkerRequest::RpcResponse {
                    id: reply_id,
                    outcome,
                } if reply_id == id => {
                    let outcome: RpcOutcome = outcome.into();
                    return Ok(outcome);
                }
                super::WorkerRequest::RpcResponse { .. } => {
                    // Response for a stale call; drop it.
                    continue;
                }
                super::WorkerRequest::Stop => {
                    return Err(Error::worker(
                        "worker stopped while an RPC was pending".to_string(),
                    ));
                }
                super::WorkerRequest::Call { .. } => {
                    return Err(Error::worker(
                        "unexpected plugin call while an RPC was pending".to_string(),
                    ));
                }
            }
        }
    }

    /// Drain the warnings recorded during this call.
    pub(crate) fn take_warnings(&self) -> Vec<WarningRecord> {
        std::mem::take(
            &mut *self
                .runtime
                .warnings
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        )
    }

    /// Install a fresh scratch store and warning sink for a new call.
    pub(crate) fn reset_call_state(&mut self) {
        self.runtime.scratch = Arc::new(Mutex::new(CallScratch::default()));
        self.runtime.warnings = Arc::new(Mutex::new(Vec::new()));
    }
}

/// A held connection slot. Dropping it releases the slot.
pub struct SlotLease {
    context: PluginContext,
    host: String,
}

impl SlotLease {
    /// The host this slot is held on.
    pub fn host(&self) -> &str {
        &self.host
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        let _ = self.context.async_remote_call(RpcRequest::ReleaseSlot {
            host: self.host.clone(),
        });
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("audit_name", &self.audit_name)
            .field("plugin", &self.plugin.as_ref().map(|p| &p.name))
            .finish_non_exhaustive()
    }
}
