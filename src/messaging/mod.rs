//! Typed messaging between the orchestrator, audits, plugins and UI
//! observers.
//!
//! - [`Message`]: routed envelopes with payload-driven type and code
//! - [`MessageBus`]: the FIFO queue the orchestrator consumes
//! - [`AuditNotifier`] / [`UiNotifier`]: plugin fanout
//! - [`RpcRequest`]: the callback surface plugins invoke remotely

mod bus;
mod message;
mod notifier;
pub(crate) mod rpc;

pub use bus::{BusHandle, MessageBus};
pub use message::{
    Message, MessageCode, MessageType, Payload, Priority, WarningRecord,
};
pub use notifier::{AuditNotifier, UiNotifier};
pub use rpc::{RpcFailure, RpcOutcome, RpcRequest, WireOutcome};

pub(crate) use message::clamp_progress;
