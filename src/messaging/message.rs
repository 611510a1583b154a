//! Typed messages exchanged between the orchestrator, audits, plugins
//! and UI observers.

use crate::config::AuditConfig;
use crate::data::{Data, Identity};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Top-level message family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Data,
    Control,
    Status,
    Rpc,
}

/// Message code within a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageCode {
    Data,
    Ack,
    StartAudit,
    StopAudit,
    Stop,
    Error,
    Warning,
    Log,
    PluginBegin,
    PluginStep,
    PluginEnd,
    StageUpdate,
    Rpc,
}

/// Delivery priority. Medium and low messages queue in FIFO order;
/// high-priority messages from the orchestrator process dispatch
/// synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

/// One captured warning from a plugin callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarningRecord {
    pub message: String,
    pub category: String,
    pub filename: String,
    pub line: u32,
    pub source: String,
}

impl WarningRecord {
    /// A warning with only a message and category.
    pub fn new(message: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: category.into(),
            filename: String::new(),
            line: 0,
            source: String::new(),
        }
    }
}

/// Message payload. The payload determines the message type and code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum Payload {
    /// Data items produced by a plugin or seeded from targets.
    Data { items: Vec<Data> },
    /// A plugin finished processing one item (successfully or not).
    Ack { identity: Option<Identity> },
    /// Request to start a new audit.
    StartAudit { config: Box<AuditConfig> },
    /// An audit ended; `finished` is false on cancellation.
    StopAudit { finished: bool },
    /// The orchestrator should stop; `finished` is false on
    /// cancellation.
    Stop { finished: bool },
    /// Uncaught plugin failure.
    Error {
        kind: String,
        message: String,
        trace: String,
    },
    /// Warnings captured during one plugin call.
    Warning { warnings: Vec<WarningRecord> },
    /// Free-form log line.
    Log {
        text: String,
        level: u8,
        is_error: bool,
    },
    /// A plugin started processing an item.
    PluginBegin { identity: Identity, progress: f32 },
    /// Plugin progress update, 0.0–100.0.
    PluginStep { identity: Identity, progress: f32 },
    /// A plugin finished an item.
    PluginEnd { identity: Identity, progress: f32 },
    /// The audit moved to a new stage.
    StageUpdate { stage: String },
    /// Remote procedure call (worker wire only).
    Rpc {
        id: Uuid,
        request: super::rpc::RpcRequest,
        /// Whether the caller waits for a response.
        wants_reply: bool,
    },
}

impl Payload {
    /// The message family of this payload.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Data { .. } => MessageType::Data,
            Self::Ack { .. }
            | Self::StartAudit { .. }
            | Self::StopAudit { .. }
            | Self::Stop { .. }
            | Self::Error { .. }
            | Self::Warning { .. }
            | Self::Log { .. } => MessageType::Control,
            Self::PluginBegin { .. }
            | Self::PluginStep { .. }
            | Self::PluginEnd { .. }
            | Self::StageUpdate { .. } => MessageType::Status,
            Self::Rpc { .. } => MessageType::Rpc,
        }
    }

    /// The message code of this payload.
    pub fn code(&self) -> MessageCode {
        match self {
            Self::Data { .. } => MessageCode::Data,
            Self::Ack { .. } => MessageCode::Ack,
            Self::StartAudit { .. } => MessageCode::StartAudit,
            Self::StopAudit { .. } => MessageCode::StopAudit,
            Self::Stop { .. } => MessageCode::Stop,
            Self::Error { .. } => MessageCode::Error,
            Self::Warning { .. } => MessageCode::Warning,
            Self::Log { .. } => MessageCode::Log,
            Self::PluginBegin { .. } => MessageCode::PluginBegin,
            Self::PluginStep { .. } => MessageCode::PluginStep,
            Self::PluginEnd { .. } => MessageCode::PluginEnd,
            Self::StageUpdate { .. } => MessageCode::StageUpdate,
            Self::Rpc { .. } => MessageCode::Rpc,
        }
    }
}

/// A routed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    payload: Payload,
    audit_name: Option<String>,
    plugin_name: Option<String>,
    priority: Priority,
}

impl Message {
    /// Create a message with medium priority and no routing names.
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            audit_name: None,
            plugin_name: None,
            priority: Priority::Medium,
        }
    }

    /// A data message carrying items for an audit.
    pub fn data(audit_name: impl Into<String>, items: Vec<Data>) -> Self {
        Self::new(Payload::Data { items }).for_audit(audit_name)
    }

    /// An acknowledgement for one processed item. Always low priority.
    pub fn ack(audit_name: impl Into<String>, identity: Option<Identity>) -> Self {
        Self::new(Payload::Ack { identity })
            .for_audit(audit_name)
            .with_priority(Priority::Low)
    }

    /// An audit-stop notification.
    pub fn stop_audit(audit_name: impl Into<String>, finished: bool) -> Self {
        Self::new(Payload::StopAudit { finished }).for_audit(audit_name)
    }

    /// An orchestrator-stop request.
    pub fn stop(finished: bool) -> Self {
        Self::new(Payload::Stop { finished }).with_priority(Priority::High)
    }

    /// Route the message to an audit.
    pub fn for_audit(mut self, audit_name: impl Into<String>) -> Self {
        self.audit_name = Some(audit_name.into());
        self
    }

    /// Record the plugin that sent the message.
    pub fn from_plugin(mut self, plugin_name: impl Into<String>) -> Self {
        self.plugin_name = Some(plugin_name.into());
        self
    }

    /// Set the delivery priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    pub fn code(&self) -> MessageCode {
        self.payload.code()
    }

    pub fn audit_name(&self) -> Option<&str> {
        self.audit_name.as_deref()
    }

    pub fn plugin_name(&self) -> Option<&str> {
        self.plugin_name.as_deref()
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }
}

/// Clamp a plugin progress value into the 0.0–100.0 range.
pub(crate) fn clamp_progress(progress: f32) -> f32 {
    progress.clamp(0.0, 100.0)
}
