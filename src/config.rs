//! Audit and orchestrator configuration.
//!
//! An [`AuditConfig`] describes one audit: its targets, scope options,
//! plugin selection and resource limits. It is immutable once the audit
//! has been constructed. The [`OrchestratorConfig`] carries the
//! process-wide settings shared by every audit.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// DNS expansion mode used while building the audit scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnsResolution {
    /// Never resolve target domains.
    Off,
    /// Resolve only domains not previously part of the scope (default).
    NewDomains,
    /// Resolve every domain in the scope.
    AllDomains,
}

impl Default for DnsResolution {
    fn default() -> Self {
        Self::NewDomains
    }
}

/// Configuration for a single audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Audit name. Autogenerated when empty.
    pub audit_name: Option<String>,
    /// User-supplied target strings (URLs, hostnames, IPs, CIDR blocks).
    pub targets: Vec<String>,
    /// Include subdomains of the target hostnames in the scope.
    pub include_subdomains: bool,
    /// Optional regex restricting which subdomains are considered
    /// interesting by crawling plugins. Opaque to the core.
    pub subdomain_regex: Option<String>,
    /// Maximum crawl depth. Read by crawling plugins, opaque to the core.
    pub depth: u32,
    /// Maximum number of URL resources admitted to the audit.
    /// Zero means unlimited.
    pub max_links: u64,
    /// Follow HTTP redirects. Read by plugins.
    pub follow_redirects: bool,
    /// Follow only the first redirect of each target URL.
    pub follow_first_redirect: bool,
    /// Proxy address, if any.
    pub proxy_addr: Option<String>,
    /// Proxy username.
    pub proxy_user: Option<String>,
    /// Proxy password.
    pub proxy_pass: Option<String>,
    /// Cookie header to attach to plugin requests.
    pub cookie: Option<String>,
    /// Use the shared network response cache.
    pub use_cache_db: bool,
    /// DNS expansion mode for the scope bootstrap.
    pub dns_resolution: DnsResolution,
    /// Plugins to enable. The special name "all" enables everything.
    pub enabled_plugins: Vec<String>,
    /// Plugins to disable. Applied after the enable list.
    pub disabled_plugins: Vec<String>,
    /// Folder to search for plugin descriptors. Falls back to the
    /// orchestrator-wide folder when unset.
    pub plugins_folder: Option<PathBuf>,
    /// Path of the audit database. In-memory when unset.
    pub audit_db: Option<PathBuf>,
    /// Report output paths handed to report plugins.
    pub reports: Vec<PathBuf>,
    /// Maximum number of worker processes. Zero or negative runs the
    /// plugins inline in the orchestrator process.
    pub max_process: i32,
    /// Number of calls a worker serves before it is recycled.
    pub refresh_after_tasks: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            audit_name: None,
            targets: Vec::new(),
            include_subdomains: false,
            subdomain_regex: None,
            depth: 5,
            max_links: 0,
            follow_redirects: true,
            follow_first_redirect: true,
            proxy_addr: None,
            proxy_user: None,
            proxy_pass: None,
            cookie: None,
            use_cache_db: true,
            dns_resolution: DnsResolution::NewDomains,
            enabled_plugins: vec!["all".to_string()],
            disabled_plugins: Vec::new(),
            plugins_folder: None,
            audit_db: None,
            reports: Vec::new(),
            max_process: 4,
            refresh_after_tasks: 1000,
        }
    }
}

impl AuditConfig {
    /// Create a configuration for the given targets with defaults.
    pub fn new<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Set the audit name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.audit_name = Some(name.into());
        self
    }

    /// Include subdomains in the scope.
    pub fn with_subdomains(mut self, include: bool) -> Self {
        self.include_subdomains = include;
        self
    }

    /// Set the DNS expansion mode.
    pub fn with_dns_resolution(mut self, mode: DnsResolution) -> Self {
        self.dns_resolution = mode;
        self
    }

    /// Set the maximum number of URL resources to admit.
    pub fn with_max_links(mut self, max_links: u64) -> Self {
        self.max_links = max_links;
        self
    }

    /// Set the worker process count.
    pub fn with_max_process(mut self, max_process: i32) -> Self {
        self.max_process = max_process;
        self
    }

    /// Restrict the enabled plugin set.
    pub fn with_enabled_plugins<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enabled_plugins = names.into_iter().map(Into::into).collect();
        self
    }
}

/// Process-wide orchestrator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Default folder to search for plugin descriptors.
    pub plugins_folder: PathBuf,
    /// Maximum concurrent outbound connections per host.
    pub max_connections_per_host: usize,
    /// Worker runner executable. `None` re-invokes the current
    /// executable; a bare name is resolved on `$PATH`.
    pub worker_command: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            plugins_folder: PathBuf::from("plugins"),
            max_connections_per_host: 4,
            worker_command: None,
        }
    }
}

impl OrchestratorConfig {
    /// Set the plugins folder.
    pub fn with_plugins_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.plugins_folder = folder.into();
        self
    }

    /// Set the per-host connection cap.
    pub fn with_max_connections_per_host(mut self, cap: usize) -> Self {
        self.max_connections_per_host = cap.max(1);
        self
    }
}

/// Expand `~` and environment variables in a user-supplied path.
pub fn expand_path(path: &std::path::Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(raw.as_ref()) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => path.to_path_buf(),
    }
}
