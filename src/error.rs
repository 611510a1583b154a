//! Error types for argus-core.

use thiserror::Error;

/// Result type alias using argus-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while orchestrating an audit.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration: bad targets, bad descriptor, unknown
    /// plugin name, cyclic dependencies.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The audit scope could not be built (e.g. unresolvable domain
    /// while DNS expansion was requested).
    #[error("Scope error: {0}")]
    Scope(String),

    /// A network operation targeted a host outside the audit scope.
    #[error("Host out of audit scope: {0}")]
    NetworkOutOfScope(String),

    /// Connection, TLS or timeout failure. The core does not retry.
    #[error("Network error: {0}")]
    Network(String),

    /// Uncaught failure inside a plugin callback.
    #[error("Plugin '{plugin}' failed: {message}")]
    Plugin { plugin: String, message: String },

    /// Audit database failure. Aborts the audit.
    #[error("Database error: {0}")]
    Database(String),

    /// Worker subprocess communication error.
    #[error("Worker communication error: {0}")]
    Worker(String),

    /// An RPC executed on the orchestrator failed; the original error
    /// kind is preserved for the caller.
    #[error("RPC error ({kind}): {message}")]
    Rpc { kind: String, message: String },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Orchestrator-process failure (bus closed, pool dead).
    /// Terminates the orchestrator.
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a scope error.
    pub fn scope(message: impl Into<String>) -> Self {
        Self::Scope(message.into())
    }

    /// Create a plugin error.
    pub fn plugin(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Plugin {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Create a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database(message.into())
    }

    /// Create a worker communication error.
    pub fn worker(message: impl Into<String>) -> Self {
        Self::Worker(message.into())
    }

    /// Create an RPC error preserving the original error kind.
    pub fn rpc(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rpc {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Short machine-readable name of this error's kind, used when
    /// marshaling errors across the RPC boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Scope(_) => "scope",
            Self::NetworkOutOfScope(_) => "network_out_of_scope",
            Self::Network(_) => "network",
            Self::Plugin { .. } => "plugin",
            Self::Database(_) => "database",
            Self::Worker(_) => "worker",
            Self::Rpc { .. } => "rpc",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
            Self::Fatal(_) => "fatal",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_names() {
        assert_eq!(Error::config("x").kind(), "config");
        assert_eq!(Error::scope("x").kind(), "scope");
        assert_eq!(Error::plugin("p", "boom").kind(), "plugin");
        assert_eq!(Error::rpc("database", "gone").kind(), "rpc");
    }

    #[test]
    fn test_plugin_error_display() {
        let err = Error::plugin("testing/recon/spider", "index out of range");
        let msg = err.to_string();
        assert!(msg.contains("testing/recon/spider"));
        assert!(msg.contains("index out of range"));
    }

    #[test]
    fn test_sqlite_error_maps_to_database() {
        let err: Error = rusqlite::Error::InvalidQuery.into();
        assert_eq!(err.kind(), "database");
    }
}
