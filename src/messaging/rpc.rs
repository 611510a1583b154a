//! Remote procedure calls from plugins to the orchestrator.
//!
//! Plugins running in worker processes cannot touch the audit store,
//! the response cache or the slot manager directly; they call back
//! through this typed surface. In-process plugins execute the same
//! calls inline, which avoids the producer/consumer self-deadlock of
//! routing an RPC through one's own message queue.

use crate::data::{Data, Identity};
use crate::net::{CachePolicy, CachedResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One remote procedure call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum RpcRequest {
    /// Fetch a data item from the audit store.
    GetData { identity: Identity },
    /// Whether the audit store holds an identity.
    HasData { identity: Identity },
    /// Identities not yet finished at the given stage index.
    GetPendingData { stage: i64 },
    /// Read from the shared network cache.
    CacheGet {
        scheme: String,
        key: String,
        policy: CachePolicy,
    },
    /// Write to the shared network cache.
    CacheSet {
        scheme: String,
        key: String,
        response: CachedResponse,
        cacheable: bool,
        policy: CachePolicy,
    },
    /// Acquire a connection slot on a host. Replies when granted.
    AcquireSlot { host: String },
    /// Release a previously acquired connection slot.
    ReleaseSlot { host: String },
    /// Schedule data items for processing without waiting.
    SendData { items: Vec<Data> },
    /// Map a nested call over independent argument sets. Elements fail
    /// independently; the reply is a list of per-element outcomes.
    Bulk { requests: Vec<RpcRequest> },
}

impl RpcRequest {
    /// Short name of the call, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetData { .. } => "get_data",
            Self::HasData { .. } => "has_data",
            Self::GetPendingData { .. } => "get_pending_data",
            Self::CacheGet { .. } => "cache_get",
            Self::CacheSet { .. } => "cache_set",
            Self::AcquireSlot { .. } => "acquire_slot",
            Self::ReleaseSlot { .. } => "release_slot",
            Self::SendData { .. } => "send_data",
            Self::Bulk { .. } => "bulk",
        }
    }
}

/// Error half of an RPC outcome. The original error kind survives the
/// wire so the caller can re-raise it faithfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcFailure {
    pub kind: String,
    pub message: String,
    pub trace: String,
}

impl RpcFailure {
    pub fn from_error(err: &crate::error::Error) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            trace: String::new(),
        }
    }
}

impl From<RpcFailure> for crate::error::Error {
    fn from(failure: RpcFailure) -> Self {
        crate::error::Error::rpc(failure.kind, failure.message)
    }
}

/// Result of one RPC: `(ok, value)` or `(err, failure)`.
pub type RpcOutcome = std::result::Result<Value, RpcFailure>;

/// Serializable form of an outcome for the worker wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WireOutcome {
    Ok { value: Value },
    Err { failure: RpcFailure },
}

impl From<RpcOutcome> for WireOutcome {
    fn from(outcome: RpcOutcome) -> Self {
        match outcome {
            Ok(value) => Self::Ok { value },
            Err(failure) => Self::Err { failure },
        }
    }
}

impl From<WireOutcome> for RpcOutcome {
    fn from(wire: WireOutcome) -> Self {
        match wire {
            WireOutcome::Ok { value } => Ok(value),
            WireOutcome::Err { failure } => Err(failure),
        }
    }
}
