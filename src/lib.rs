//! # argus-core
//!
//! The orchestration core of a web security-audit framework: a
//! scheduler, message bus, plugin worker pool, deduplicating data
//! graph and audit lifecycle manager that together drive concurrent
//! analysis plugins against a configured set of targets.
//!
//! ## Core Components
//!
//! - **Scope**: target classification and membership checks
//! - **Data**: identity-keyed audit knowledge with links and discovery
//! - **Database**: the per-audit store with stage and plugin bookkeeping
//! - **Plugin**: descriptors, registry, stages and the callback surface
//! - **Messaging**: typed messages, the bus, and plugin fanout
//! - **Worker**: isolated per-call plugin execution in subprocesses
//! - **Audit / Orchestrator**: stage pipeline and top-level dispatch
//!
//! ## Example
//!
//! ```rust,ignore
//! use argus_core::{AuditConfig, Orchestrator, OrchestratorConfig};
//!
//! let registry = build_registry()?; // descriptors + loader
//! Orchestrator::run_audits(
//!     OrchestratorConfig::default(),
//!     registry,
//!     vec![AuditConfig::new(["example.com"])],
//! )?;
//! ```
//!
//! Worker processes re-enter through [`worker::worker_main`]; host
//! binaries check [`worker::is_worker_process`] at startup.

pub mod audit;
pub mod config;
pub mod data;
pub mod database;
pub mod error;
pub mod messaging;
pub mod net;
pub mod orchestrator;
pub mod plugin;
pub mod scope;
pub mod worker;

// Re-exports for convenience
pub use audit::Audit;
pub use config::{AuditConfig, DnsResolution, OrchestratorConfig};
pub use data::{Data, Identity, Kind, Subtype, TypeTag};
pub use database::{AddOutcome, AuditStore};
pub use error::{Error, Result};
pub use messaging::{
    AuditNotifier, BusHandle, Message, MessageBus, MessageCode, MessageType, Payload, Priority,
    RpcFailure, RpcRequest, UiNotifier, WarningRecord,
};
pub use net::{CachePolicy, CachedResponse, ConnectionSlot, NetworkCache, SlotManager};
pub use orchestrator::{Orchestrator, RpcExecutor};
pub use plugin::{
    BuiltinLoader, Plugin, PluginCategory, PluginDescriptor, PluginFactory, PluginLoader,
    PluginRegistry, Stage,
};
pub use scope::{AuditScope, DnsResolver, SystemResolver};
pub use worker::{PluginCall, PluginContext, SlotLease, WorkerPool, WorkerPoolConfig};
