//! Audit scope computation and membership checks.
//!
//! A scope is built from the user-supplied target strings of an
//! [`AuditConfig`](crate::config::AuditConfig). Each target is
//! classified, in order, as: an IPv6 literal in brackets, a raw IP
//! address, a CIDR network, an absolute URL, or a domain name. Each
//! recognized target contributes hosts and synthetic web pages to the
//! scope; everything else is warned about and skipped.

use crate::config::{AuditConfig, DnsResolution};
use crate::data::Data;
use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::OnceLock;
use tracing::{debug, warn};

fn domain_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_\-.]*[A-Za-z0-9]$").unwrap())
}

/// Resolver seam used during scope bootstrap.
///
/// The core never talks to a DNS server directly; it queries through
/// this trait so tests can substitute fixed answers.
pub trait DnsResolver: Send + Sync {
    /// Resolve the A records (IPv4 addresses) of a domain.
    fn resolve_a(&self, domain: &str) -> Vec<IpAddr>;

    /// Resolve the AAAA records (IPv6 addresses) of a domain.
    fn resolve_aaaa(&self, domain: &str) -> Vec<IpAddr>;
}

/// Resolver backed by the operating system (getaddrinfo).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl SystemResolver {
    fn lookup(&self, domain: &str, want_v6: bool) -> Vec<IpAddr> {
        let query = format!("{domain}:0");
        match query.to_socket_addrs() {
            Ok(addrs) => addrs
                .map(|sa: SocketAddr| sa.ip())
                .filter(|ip| ip.is_ipv6() == want_v6)
                .collect(),
            Err(err) => {
                debug!(domain, %err, "DNS lookup failed");
                Vec::new()
            }
        }
    }
}

impl DnsResolver for SystemResolver {
    fn resolve_a(&self, domain: &str) -> Vec<IpAddr> {
        self.lookup(domain, false)
    }

    fn resolve_aaaa(&self, domain: &str) -> Vec<IpAddr> {
        self.lookup(domain, true)
    }
}

/// The set of hosts and web pages an audit is allowed to touch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditScope {
    domains: BTreeSet<String>,
    roots: BTreeSet<String>,
    addresses: BTreeSet<IpAddr>,
    web_pages: BTreeSet<String>,
    /// A permissive scope matches every target. Used for plugin
    /// contexts that exist before any audit scope does.
    permissive: bool,
}

impl AuditScope {
    /// Build the scope from an audit configuration.
    ///
    /// May issue DNS queries depending on `config.dns_resolution`. A
    /// domain that resolves to neither A nor AAAA records aborts the
    /// audit with [`Error::Scope`].
    pub fn new(config: &AuditConfig, resolver: &dyn DnsResolver) -> Result<Self> {
        let mut scope = Self::default();
        let mut new_domains = BTreeSet::new();

        for target in &config.targets {
            if !scope.classify_target(target, &mut new_domains) {
                warn!(target, "unrecognized audit target, skipping");
            }
        }

        if scope.domains.is_empty() && scope.addresses.is_empty() && scope.web_pages.is_empty() {
            if config.targets.is_empty() {
                return Err(Error::config("no targets given"));
            }
            return Err(Error::config(format!(
                "none of the {} targets could be parsed",
                config.targets.len()
            )));
        }

        if config.include_subdomains {
            scope.add_subdomain_roots(&new_domains);
        }

        let to_resolve: Vec<String> = match config.dns_resolution {
            DnsResolution::Off => Vec::new(),
            DnsResolution::NewDomains => new_domains.into_iter().collect(),
            DnsResolution::AllDomains => scope.domains.iter().cloned().collect(),
        };
        for domain in to_resolve {
            let v4 = resolver.resolve_a(&domain);
            let v6 = resolver.resolve_aaaa(&domain);
            if v4.is_empty() && v6.is_empty() {
                return Err(Error::scope(format!("cannot resolve: {domain}")));
            }
            scope.addresses.extend(v4);
            scope.addresses.extend(v6);
        }

        Ok(scope)
    }

    /// A scope that contains every target. Stand-in for contexts
    /// without an audit.
    pub fn permissive() -> Self {
        Self {
            permissive: true,
            ..Self::default()
        }
    }

    /// Classify a single target string. Returns false for strings that
    /// match none of the recognized forms.
    fn classify_target(&mut self, target: &str, new_domains: &mut BTreeSet<String>) -> bool {
        // IPv6 literal in brackets.
        if let Some(inner) = target
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
        {
            if let Ok(v6) = inner.parse::<Ipv6Addr>() {
                self.add_address(IpAddr::V6(v6));
                return true;
            }
            return false;
        }

        // Raw IPv4/IPv6 literal.
        if let Ok(address) = target.parse::<IpAddr>() {
            self.add_address(address);
            return true;
        }

        // CIDR network: every host address in range.
        if let Ok(network) = target.parse::<ipnet::IpNet>() {
            for address in network.hosts() {
                self.add_address(address);
            }
            return true;
        }

        // Absolute URL with scheme and host.
        if let Ok(parsed) = url::Url::parse(target) {
            match parsed.host() {
                Some(url::Host::Domain(host)) => {
                    self.web_pages.insert(parsed.to_string());
                    let host = host.to_lowercase();
                    if self.domains.insert(host.clone()) {
                        new_domains.insert(host);
                    }
                    return true;
                }
                Some(url::Host::Ipv4(v4)) => {
                    self.web_pages.insert(parsed.to_string());
                    self.addresses.insert(IpAddr::V4(v4));
                    return true;
                }
                Some(url::Host::Ipv6(v6)) => {
                    self.web_pages.insert(parsed.to_string());
                    self.addresses.insert(IpAddr::V6(v6));
                    return true;
                }
                None => return false,
            }
        }

        // Bare domain name.
        if domain_regex().is_match(target) {
            let domain = target.to_lowercase();
            if self.domains.insert(domain.clone()) {
                self.web_pages.insert(format!("http://{domain}/"));
                new_domains.insert(domain);
            }
            return true;
        }

        false
    }

    fn add_address(&mut self, address: IpAddr) {
        if self.addresses.insert(address) {
            self.web_pages.insert(match address {
                IpAddr::V4(v4) => format!("http://{v4}/"),
                IpAddr::V6(v6) => format!("http://[{v6}]/"),
            });
        }
    }

    /// Add every ancestor suffix of the given hostnames to the root
    /// set, so `x.example.com` matches a scope built for `example.com`.
    /// Suffixes keep at least two labels; a bare TLD never becomes a
    /// root.
    fn add_subdomain_roots(&mut self, hostnames: &BTreeSet<String>) {
        for hostname in hostnames {
            self.roots.insert(hostname.clone());
            let labels: Vec<&str> = hostname.split('.').collect();
            for start in 1..labels.len().saturating_sub(1) {
                let suffix = labels[start..].join(".");
                self.roots.insert(suffix.clone());
                self.domains.insert(suffix);
            }
        }
    }

    /// Test whether a target (URL, hostname or IP address) is in scope.
    ///
    /// The input is normalized the same way as during ingestion.
    /// Strings that are neither return false with a warning.
    pub fn contains(&self, target: &str) -> bool {
        if self.permissive {
            return true;
        }
        if target.is_empty() {
            return false;
        }

        // URLs are reduced to their host.
        let mut candidate = target.to_string();
        if let Ok(parsed) = url::Url::parse(target) {
            match parsed.host() {
                Some(url::Host::Domain(host)) => candidate = host.to_string(),
                Some(url::Host::Ipv4(v4)) => return self.addresses.contains(&IpAddr::V4(v4)),
                Some(url::Host::Ipv6(v6)) => return self.addresses.contains(&IpAddr::V6(v6)),
                None => return false,
            }
        }

        // IP literal, bracketed or plain.
        if let Some(inner) = candidate
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
        {
            if let Ok(v6) = inner.parse::<Ipv6Addr>() {
                return self.addresses.contains(&IpAddr::V6(v6));
            }
        }
        if let Ok(address) = candidate.parse::<IpAddr>() {
            return self.addresses.contains(&address);
        }

        // Domain name, optionally matching a subdomain root.
        if domain_regex().is_match(&candidate) {
            let host = candidate.to_lowercase();
            return self.domains.contains(&host)
                || self
                    .roots
                    .iter()
                    .any(|root| host.ends_with(&format!(".{root}")));
        }

        warn!(target, "cannot determine scope membership");
        false
    }

    /// Materialize the scope as seed data items: one IP resource per
    /// address, one domain resource per domain, one URL resource per
    /// web page.
    pub fn targets(&self) -> Vec<Data> {
        let mut result = Vec::new();
        result.extend(self.addresses.iter().map(|address| Data::ip(*address)));
        result.extend(self.domains.iter().map(|domain| Data::domain(domain)));
        for page in &self.web_pages {
            match Data::url(page) {
                Ok(data) => result.push(data),
                Err(err) => warn!(url = page, %err, "skipping unparseable scope URL"),
            }
        }
        result
    }

    /// Domains in scope.
    pub fn domains(&self) -> &BTreeSet<String> {
        &self.domains
    }

    /// IP addresses in scope.
    pub fn addresses(&self) -> &BTreeSet<IpAddr> {
        &self.addresses
    }

    /// Web pages in scope.
    pub fn web_pages(&self) -> &BTreeSet<String> {
        &self.web_pages
    }
}
