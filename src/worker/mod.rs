//! Plugin execution in isolated worker processes.
//!
//! Workers are separate OS processes speaking a JSON-lines protocol on
//! stdin/stdout. Each worker serves one plugin call at a time:
//!
//! 1. the parent writes a [`WorkerRequest::Call`] with the serialized
//!    [`PluginContext`] and the callback to invoke;
//! 2. the worker re-establishes the context, runs the callback, and
//!    streams back [`WorkerReply::Msg`] lines (result data, captured
//!    warnings, errors, RPCs), followed by the ACK and a final
//!    [`WorkerReply::Done`];
//! 3. RPCs block the worker until the parent writes the matching
//!    [`WorkerRequest::RpcResponse`].
//!
//! The same call wrapper ([`bootstrap`]) also backs the inline mode
//! used when `max_process <= 0`, where plugins run cooperatively in the
//! orchestrator process.

mod context;
mod pool;

pub use context::{PluginContext, SlotLease};
pub use pool::{WorkerPool, WorkerPoolConfig};

use crate::data::Data;
use crate::error::{Error, Result};
use crate::messaging::{Message, Payload, WarningRecord, WireOutcome};
use crate::plugin::{Plugin, PluginRegistry};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::io::{BufRead, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

/// Environment variable marking a process as a plugin worker.
pub const WORKER_ENV: &str = "ARGUS_WORKER";

/// One plugin callback invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "func", rename_all = "snake_case")]
pub enum PluginCall {
    /// `recv_info`: process one data item.
    RecvInfo { item: Data },
    /// `recv_msg`: observe a message.
    RecvMsg { message: Message },
    /// `generate_report`: render a report to a path.
    GenerateReport { path: PathBuf },
}

/// Parent-to-worker wire messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Run one plugin callback.
    Call {
        context: PluginContext,
        call: PluginCall,
    },
    /// Response to an RPC the worker issued.
    RpcResponse { id: Uuid, outcome: WireOutcome },
    /// Finish up and exit.
    Stop,
}

/// Worker-to-parent wire messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WorkerReply {
    /// The worker is up and reading requests.
    Ready,
    /// A routed message (data, control, status, or RPC).
    Msg { message: Message },
    /// The current call completed; the worker is idle again.
    Done,
}

/// Whether this process was spawned as a plugin worker.
pub fn is_worker_process() -> bool {
    std::env::var(WORKER_ENV).map(|v| v == "1").unwrap_or(false)
}

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<PluginContext>> = const { RefCell::new(Vec::new()) };
}

/// The context of the innermost plugin call running on this thread.
pub fn current_context() -> Option<PluginContext> {
    CONTEXT_STACK.with(|stack| stack.borrow().last().cloned())
}

/// Install a context for the duration of the returned guard.
pub(crate) fn install_context(context: PluginContext) -> ContextGuard {
    CONTEXT_STACK.with(|stack| stack.borrow_mut().push(context));
    ContextGuard
}

pub(crate) struct ContextGuard;

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Run one plugin callback with the full isolation contract.
///
/// The context is installed for the lifetime of the call and restored
/// afterwards; a fresh scratch store is attached; warnings are captured
/// and forwarded as one batch; callback errors and panics become error
/// messages; and the ACK is sent on every exit path, after any data the
/// call produced.
pub fn bootstrap(registry: &PluginRegistry, mut context: PluginContext, call: &PluginCall) {
    context.reset_call_state();
    let _guard = install_context(context.clone());

    let ack_identity = match call {
        PluginCall::RecvInfo { item } => Some(item.identity().clone()),
        _ => None,
    };

    let outcome = run_callback(registry, &context, call);

    // Forward captured warnings as a single batch.
    let warnings = context.take_warnings();
    if !warnings.is_empty() {
        send_or_log(&context, warning_message(&context, warnings));
    }

    // Failures become error messages; the audit carries on.
    if let Err(err) = outcome {
        send_or_log(&context, error_message(&context, &err));
    }

    // The ACK goes last, after any data this call emitted.
    if let Err(err) = context.send_ack(ack_identity) {
        warn!(%err, "failed to send ACK");
    }
}

fn run_callback(
    registry: &PluginRegistry,
    context: &PluginContext,
    call: &PluginCall,
) -> Result<()> {
    let descriptor = context
        .plugin()
        .ok_or_else(|| Error::Internal("plugin call without a plugin context".to_string()))?;
    let instance = registry.load(&descriptor.name)?;
    let mut plugin = instance.lock().unwrap_or_else(|e| e.into_inner());

    match call {
        PluginCall::RecvInfo { item } => {
            send_or_log(context, progress_message(context, item, 0.0, true));
            let produced = invoke(&mut **plugin, descriptor, |p| p.recv_info(item).map(Some))?;
            let mut result = produced.unwrap_or_default();
            // Echo the input item so attribute and link updates merge.
            result.push(item.clone());
            context.send_data(result)?;
            send_or_log(context, progress_message(context, item, 100.0, false));
            Ok(())
        }
        PluginCall::RecvMsg { message } => {
            invoke(&mut **plugin, descriptor, |p| p.recv_msg(message).map(|_| None))?;
            Ok(())
        }
        PluginCall::GenerateReport { path } => {
            invoke(&mut **plugin, descriptor, |p| {
                p.generate_report(path).map(|_| None)
            })?;
            Ok(())
        }
    }
}

/// Invoke a callback, converting panics into plugin errors.
fn invoke<F>(
    plugin: &mut dyn Plugin,
    descriptor: &crate::plugin::PluginDescriptor,
    f: F,
) -> Result<Option<Vec<Data>>>
where
    F: FnOnce(&mut dyn Plugin) -> Result<Option<Vec<Data>>>,
{
    match catch_unwind(AssertUnwindSafe(|| f(plugin))) {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err),
        Err(panic) => {
            let message = panic
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                .unwrap_or_else(|| "plugin panicked".to_string());
            Err(Error::plugin(descriptor.name.as_str(), message))
        }
    }
}

fn send_or_log(context: &PluginContext, message: Message) {
    if let Err(err) = context.send_msg(message) {
        warn!(%err, "failed to send plugin message");
    }
}

fn error_message(context: &PluginContext, err: &Error) -> Message {
    let trace = std::backtrace::Backtrace::force_capture().to_string();
    let mut message = Message::new(Payload::Error {
        kind: err.kind().to_string(),
        message: err.to_string(),
        trace,
    });
    if let Some(audit) = context.audit_name() {
        message = message.for_audit(audit);
    }
    if let Some(plugin) = context.plugin_name() {
        message = message.from_plugin(plugin);
    }
    message
}

fn warning_message(context: &PluginContext, warnings: Vec<WarningRecord>) -> Message {
    let mut message = Message::new(Payload::Warning { warnings });
    if let Some(audit) = context.audit_name() {
        message = message.for_audit(audit);
    }
    if let Some(plugin) = context.plugin_name() {
        message = message.from_plugin(plugin);
    }
    message
}

fn progress_message(
    context: &PluginContext,
    item: &Data,
    progress: f32,
    begin: bool,
) -> Message {
    let payload = if begin {
        Payload::PluginBegin {
            identity: item.identity().clone(),
            progress,
        }
    } else {
        Payload::PluginEnd {
            identity: item.identity().clone(),
            progress,
        }
    };
    let mut message = Message::new(payload);
    if let Some(audit) = context.audit_name() {
        message = message.for_audit(audit);
    }
    if let Some(plugin) = context.plugin_name() {
        message = message.from_plugin(plugin);
    }
    message
}

/// Main loop of a worker process.
///
/// Host binaries call this when [`is_worker_process`] is true, passing
/// the registry of plugins they can instantiate. Speaks the worker
/// protocol on this process's stdin/stdout until a stop request or
/// EOF; EOF means the parent died and the worker simply exits.
pub fn worker_main(registry: &PluginRegistry) -> Result<()> {
    let stdin: Arc<Mutex<Box<dyn BufRead + Send>>> =
        Arc::new(Mutex::new(Box::new(std::io::BufReader::new(
            std::io::stdin(),
        ))));
    let stdout: Arc<Mutex<Box<dyn Write + Send>>> =
        Arc::new(Mutex::new(Box::new(std::io::stdout())));

    serve(registry, stdin, stdout)
}

/// Protocol loop, split from [`worker_main`] so tests can run it over
/// in-memory pipes.
pub(crate) fn serve(
    registry: &PluginRegistry,
    reader: Arc<Mutex<Box<dyn BufRead + Send>>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
) -> Result<()> {
    write_reply(&writer, &WorkerReply::Ready)?;
    debug!("worker ready");

    loop {
        let mut line = String::new();
        let read = {
            let mut reader_guard = reader.lock().unwrap_or_else(|e| e.into_inner());
            reader_guard
                .read_line(&mut line)
                .map_err(|e| Error::worker(e.to_string()))?
        };
        if read == 0 {
            debug!("parent closed the pipe, worker exiting");
            return Ok(());
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            continue;
        }

        let request: WorkerRequest = match serde_json::from_str(trimmed) {
            Ok(request) => request,
            Err(err) => {
                warn!(%err, "undecodable worker request");
                continue;
            }
        };

        match request {
            WorkerRequest::Call { mut context, call } => {
                context.attach_wire(Arc::clone(&writer), Arc::clone(&reader));
                bootstrap(registry, context, &call);
                write_reply(&writer, &WorkerReply::Done)?;
            }
            WorkerRequest::RpcResponse { .. } => {
                warn!("RPC response outside of a call, dropping");
            }
            WorkerRequest::Stop => {
                debug!("worker stopping");
                return Ok(());
            }
        }
    }
}

fn write_reply(writer: &Arc<Mutex<Box<dyn Write + Send>>>, reply: &WorkerReply) -> Result<()> {
    let line = serde_json::to_string(reply)?;
    let mut writer = writer.lock().unwrap_or_else(|e| e.into_inner());
    writeln!(writer, "{line}").map_err(|e| Error::worker(e.to_string()))?;
    writer.flush().map_err(|e| Error::worker(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::MessageBus;
    use crate::plugin::testutil::{descriptor, StubPlugin};
    use crate::plugin::{BuiltinLoader, Stage};
    use crate::scope::AuditScope;
    use pretty_assertions::assert_eq;

    fn registry_with_stub<F>(produce: F) -> PluginRegistry
    where
        F: Fn(&Data) -> Result<Vec<Data>> + Send + Sync + Clone + 'static,
    {
        let loader = Arc::new(BuiltinLoader::new());
        loader.register(
            "spider",
            "Spider",
            Arc::new(move || {
                let produce = produce.clone();
                Box::new(StubPlugin {
                    accepted: None,
                    produce: Box::new(move |d| produce(d)),
                }) as Box<dyn Plugin>
            }),
        );
        let mut registry = PluginRegistry::new(loader);
        registry
            .register(descriptor("testing/recon/spider", Stage::Recon))
            .unwrap();
        registry
    }

    fn in_process_context(bus: &MessageBus) -> PluginContext {
        let executor = Arc::new(crate::orchestrator::RpcExecutor::new(
            Arc::new(crate::net::NetworkCache::new()),
            Arc::new(crate::net::SlotManager::new(4)),
            bus.handle(),
        ));
        PluginContext::for_audit(
            "audit-1",
            crate::config::AuditConfig::new(["example.com"]),
            AuditScope::permissive(),
        )
        .for_plugin(descriptor("testing/recon/spider", Stage::Recon))
        .with_in_process_channel(bus.handle(), executor)
    }

    fn drain(bus: &MessageBus) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Some(message) = bus.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[test]
    fn test_bootstrap_sends_data_then_ack() {
        let registry = registry_with_stub(|info| {
            Ok(vec![Data::url(&format!(
                "http://example.com/found-by-{}",
                info.subtype().label()
            ))
            .unwrap()])
        });
        let bus = MessageBus::new();
        let context = in_process_context(&bus);
        let item = Data::domain("example.com");

        bootstrap(&registry, context, &PluginCall::RecvInfo { item: item.clone() });

        let messages = drain(&bus);
        let codes: Vec<_> = messages.iter().map(|m| m.code()).collect();
        use crate::messaging::MessageCode;
        // begin, data, end, ack; data always precedes the ACK.
        let data_pos = codes.iter().position(|c| *c == MessageCode::Data).unwrap();
        let ack_pos = codes.iter().position(|c| *c == MessageCode::Ack).unwrap();
        assert!(data_pos < ack_pos);

        match messages[data_pos].payload() {
            Payload::Data { items } => {
                // Produced item plus the echoed input.
                assert_eq!(items.len(), 2);
                assert_eq!(items[1].identity(), item.identity());
            }
            other => panic!("expected data payload, got {other:?}"),
        }
        match messages[ack_pos].payload() {
            Payload::Ack { identity } => assert_eq!(identity.as_ref(), Some(item.identity())),
            other => panic!("expected ack payload, got {other:?}"),
        }
    }

    #[test]
    fn test_bootstrap_converts_error_to_message_and_still_acks() {
        let registry =
            registry_with_stub(|_| Err(Error::plugin("testing/recon/spider", "exploded")));
        let bus = MessageBus::new();
        let context = in_process_context(&bus);
        let item = Data::domain("example.com");

        bootstrap(&registry, context, &PluginCall::RecvInfo { item: item.clone() });

        let messages = drain(&bus);
        use crate::messaging::MessageCode;
        let error = messages
            .iter()
            .find(|m| m.code() == MessageCode::Error)
            .expect("expected an error message");
        match error.payload() {
            Payload::Error { kind, message, trace } => {
                assert_eq!(kind, "plugin");
                assert!(message.contains("exploded"));
                assert!(!trace.is_empty());
            }
            other => panic!("expected error payload, got {other:?}"),
        }
        assert!(messages.iter().any(|m| m.code() == MessageCode::Ack));
    }

    #[test]
    fn test_bootstrap_converts_panic_to_error() {
        let registry = registry_with_stub(|_| panic!("boom at runtime"));
        let bus = MessageBus::new();
        let context = in_process_context(&bus);

        bootstrap(
            &registry,
            context,
            &PluginCall::RecvInfo {
                item: Data::domain("example.com"),
            },
        );

        let messages = drain(&bus);
        use crate::messaging::MessageCode;
        let error = messages
            .iter()
            .find(|m| m.code() == MessageCode::Error)
            .expect("expected an error message");
        match error.payload() {
            Payload::Error { message, .. } => assert!(message.contains("boom at runtime")),
            other => panic!("expected error payload, got {other:?}"),
        }
        assert!(messages.iter().any(|m| m.code() == MessageCode::Ack));
    }

    #[test]
    fn test_context_stack_restores_after_call() {
        let registry = registry_with_stub(|_| {
            assert!(current_context().is_some());
            Ok(Vec::new())
        });
        let bus = MessageBus::new();
        let context = in_process_context(&bus);

        assert!(current_context().is_none());
        bootstrap(
            &registry,
            context,
            &PluginCall::RecvInfo {
                item: Data::domain("example.com"),
            },
        );
        assert!(current_context().is_none());
    }

    #[test]
    fn test_warnings_batched_into_one_message() {
        let registry = registry_with_stub(|_| {
            let context = current_context().expect("context installed");
            context.warn("weak TLS configuration", "runtime");
            context.warn("missing security headers", "runtime");
            Ok(Vec::new())
        });
        let bus = MessageBus::new();
        let context = in_process_context(&bus);

        bootstrap(
            &registry,
            context,
            &PluginCall::RecvInfo {
                item: Data::domain("example.com"),
            },
        );

        let messages = drain(&bus);
        use crate::messaging::MessageCode;
        let warnings: Vec<_> = messages
            .iter()
            .filter(|m| m.code() == MessageCode::Warning)
            .collect();
        assert_eq!(warnings.len(), 1);
        match warnings[0].payload() {
            Payload::Warning { warnings } => assert_eq!(warnings.len(), 2),
            other => panic!("expected warning payload, got {other:?}"),
        }
    }

    #[test]
    fn test_serve_over_in_memory_pipes() {
        use std::io::Cursor;

        let registry = registry_with_stub(|_| Ok(Vec::new()));

        let context = PluginContext::for_audit(
            "audit-1",
            crate::config::AuditConfig::new(["example.com"]),
            AuditScope::permissive(),
        )
        .for_plugin(descriptor("testing/recon/spider", Stage::Recon));
        let call = PluginCall::RecvInfo {
            item: Data::domain("example.com"),
        };

        let mut input = String::new();
        input.push_str(
            &serde_json::to_string(&WorkerRequest::Call { context, call }).unwrap(),
        );
        input.push('\n');
        input.push_str(&serde_json::to_string(&WorkerRequest::Stop).unwrap());
        input.push('\n');

        let reader: Arc<Mutex<Box<dyn BufRead + Send>>> =
            Arc::new(Mutex::new(Box::new(Cursor::new(input.into_bytes()))));

        // Writer that appends into a shared buffer.
        struct SharedBuf(Arc<Mutex<Vec<u8>>>);
        impl Write for SharedBuf {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let sink = Arc::new(Mutex::new(Vec::new()));
        let writer: Arc<Mutex<Box<dyn Write + Send>>> =
            Arc::new(Mutex::new(Box::new(SharedBuf(Arc::clone(&sink)))));

        serve(&registry, reader, writer).unwrap();

        let bytes = sink.lock().unwrap().clone();
        let lines: Vec<WorkerReply> = String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert!(matches!(lines[0], WorkerReply::Ready));
        assert!(matches!(lines.last(), Some(WorkerReply::Done)));
        // Between ready and done: status, data and ack messages.
        let msg_count = lines
            .iter()
            .filter(|l| matches!(l, WorkerReply::Msg { .. }))
            .count();
        assert!(msg_count >= 2, "expected data and ack messages");
    }
}
