//! The audit data model.
//!
//! Every piece of knowledge produced during an audit is a [`Data`] item:
//! a tagged record with a stable content-derived [`Identity`], a set of
//! links to other items, and a list of items discovered alongside it.
//!
//! The model distinguishes:
//! - identity-bearing fields, frozen at construction and hashed into the
//!   identity;
//! - free attributes, mutable and merged last-wins;
//! - labels, a monotonic set merged by union;
//! - links, undirected edges kept consistent on both endpoints.

mod identity;

pub use identity::Identity;

use crate::scope::AuditScope;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

/// Top-level classification of a data item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Information,
    Resource,
    Vulnerability,
}

impl Kind {
    /// Canonical lowercase label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Information => "information",
            Self::Resource => "resource",
            Self::Vulnerability => "vulnerability",
        }
    }
}

/// Concrete subtype of a data item. Each subtype belongs to exactly
/// one [`Kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subtype {
    // Resources
    IpAddress,
    Domain,
    Url,
    BaseUrl,
    // Informations
    HttpRequest,
    HttpResponse,
    DnsRecord,
    Text,
    // Vulnerabilities
    UrlDisclosure,
    SuspiciousUrl,
    WeakCredential,
}

impl Subtype {
    /// The kind this subtype belongs to.
    pub fn kind(&self) -> Kind {
        match self {
            Self::IpAddress | Self::Domain | Self::Url | Self::BaseUrl => Kind::Resource,
            Self::HttpRequest | Self::HttpResponse | Self::DnsRecord | Self::Text => {
                Kind::Information
            }
            Self::UrlDisclosure | Self::SuspiciousUrl | Self::WeakCredential => {
                Kind::Vulnerability
            }
        }
    }

    /// Canonical lowercase label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::IpAddress => "ip_address",
            Self::Domain => "domain",
            Self::Url => "url",
            Self::BaseUrl => "base_url",
            Self::HttpRequest => "http_request",
            Self::HttpResponse => "http_response",
            Self::DnsRecord => "dns_record",
            Self::Text => "text",
            Self::UrlDisclosure => "url_disclosure",
            Self::SuspiciousUrl => "suspicious_url",
            Self::WeakCredential => "weak_credential",
        }
    }

    /// The `(kind, subtype)` tag of this subtype.
    pub fn tag(&self) -> TypeTag {
        TypeTag {
            kind: self.kind(),
            subtype: *self,
        }
    }
}

/// A `(kind, subtype)` pair, used by plugins to declare accepted inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeTag {
    pub kind: Kind,
    pub subtype: Subtype,
}

/// One unit of audit knowledge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Data {
    subtype: Subtype,
    identity: Identity,
    identity_fields: BTreeMap<String, String>,
    #[serde(default)]
    attributes: BTreeMap<String, Value>,
    #[serde(default)]
    labels: BTreeSet<String>,
    #[serde(default)]
    links: BTreeSet<Identity>,
    #[serde(default)]
    discovered: Vec<Data>,
    #[serde(skip)]
    scope_hint: OnceLock<bool>,
}

impl Data {
    fn build(subtype: Subtype, identity_fields: BTreeMap<String, String>) -> Self {
        let identity = Identity::compute(
            subtype.kind().label(),
            subtype.label(),
            &identity_fields,
        );
        Self {
            subtype,
            identity,
            identity_fields,
            attributes: BTreeMap::new(),
            labels: BTreeSet::new(),
            links: BTreeSet::new(),
            discovered: Vec::new(),
            scope_hint: OnceLock::new(),
        }
    }

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// A URL resource. The URL string is normalized through the parser,
    /// so equivalent spellings share an identity.
    pub fn url(raw: &str) -> crate::error::Result<Self> {
        let parsed = url::Url::parse(raw)
            .map_err(|e| crate::error::Error::config(format!("invalid URL {raw:?}: {e}")))?;
        if !parsed.has_host() {
            return Err(crate::error::Error::config(format!(
                "URL has no host: {raw:?}"
            )));
        }
        Ok(Self::build(
            Subtype::Url,
            Self::fields(&[("url", parsed.as_str()), ("method", "GET")]),
        ))
    }

    /// A base URL resource (scheme + host + port, path stripped).
    pub fn base_url(raw: &str) -> crate::error::Result<Self> {
        let mut parsed = url::Url::parse(raw)
            .map_err(|e| crate::error::Error::config(format!("invalid URL {raw:?}: {e}")))?;
        parsed.set_path("/");
        parsed.set_query(None);
        parsed.set_fragment(None);
        Ok(Self::build(
            Subtype::BaseUrl,
            Self::fields(&[("url", parsed.as_str())]),
        ))
    }

    /// A domain name resource. Stored lowercase.
    pub fn domain(name: &str) -> Self {
        Self::build(
            Subtype::Domain,
            Self::fields(&[("name", &name.to_lowercase())]),
        )
    }

    /// An IP address resource.
    pub fn ip(address: std::net::IpAddr) -> Self {
        Self::build(
            Subtype::IpAddress,
            Self::fields(&[("address", &address.to_string())]),
        )
    }

    /// An HTTP request. Identity covers method, URL and body.
    pub fn http_request(method: &str, url: &str, body: Option<&str>) -> Self {
        Self::build(
            Subtype::HttpRequest,
            Self::fields(&[
                ("method", method),
                ("url", url),
                ("body", body.unwrap_or_default()),
            ]),
        )
    }

    /// An HTTP response, linked to the request that produced it.
    pub fn http_response(request: &Identity, status: u16, body: &[u8]) -> Self {
        let digest = crate::net::cache_digest(&[body]);
        let mut data = Self::build(
            Subtype::HttpResponse,
            Self::fields(&[
                ("request", request.as_str()),
                ("status", &status.to_string()),
                ("body_digest", &digest),
            ]),
        );
        data.links.insert(request.clone());
        data
    }

    /// A DNS record.
    pub fn dns_record(record_type: &str, name: &str, value: &str) -> Self {
        Self::build(
            Subtype::DnsRecord,
            Self::fields(&[
                ("type", record_type),
                ("name", &name.to_lowercase()),
                ("value", value),
            ]),
        )
    }

    /// A free-form text information item.
    pub fn text(content: &str) -> Self {
        Self::build(Subtype::Text, Self::fields(&[("content", content)]))
    }

    /// A vulnerability of the given subtype found on a target item.
    pub fn vulnerability(subtype: Subtype, target: &Identity) -> Self {
        debug_assert_eq!(subtype.kind(), Kind::Vulnerability);
        let mut data = Self::build(
            subtype,
            Self::fields(&[("target", target.as_str())]),
        );
        data.links.insert(target.clone());
        data
    }

    /// The item's identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The item's kind.
    pub fn kind(&self) -> Kind {
        self.subtype.kind()
    }

    /// The item's subtype.
    pub fn subtype(&self) -> Subtype {
        self.subtype
    }

    /// The item's `(kind, subtype)` tag.
    pub fn tag(&self) -> TypeTag {
        self.subtype.tag()
    }

    /// Read an identity-bearing field.
    pub fn identity_field(&self, key: &str) -> Option<&str> {
        self.identity_fields.get(key).map(String::as_str)
    }

    /// Read a mutable attribute.
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Set a mutable attribute. Identity is unaffected.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: Value) {
        self.attributes.insert(key.into(), value);
    }

    /// Add a label. Labels only ever grow.
    pub fn add_label(&mut self, label: impl Into<String>) {
        self.labels.insert(label.into());
    }

    /// Whether the item carries the given label.
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    /// Identities of the items linked to this one.
    pub fn links(&self) -> &BTreeSet<Identity> {
        &self.links
    }

    /// Link two items. Both endpoints are updated; relinking is a no-op.
    pub fn link(&mut self, other: &mut Data) {
        if self.identity != other.identity {
            self.links.insert(other.identity.clone());
            other.links.insert(self.identity.clone());
        }
    }

    /// Record a one-sided link by identity. Used by the store when the
    /// other endpoint is merged separately.
    pub fn add_link(&mut self, other: Identity) {
        if other != self.identity {
            self.links.insert(other);
        }
    }

    /// Items produced transiently alongside this one.
    pub fn discovered(&self) -> &[Data] {
        &self.discovered
    }

    /// Attach an item discovered alongside this one.
    pub fn add_discovery(&mut self, item: Data) {
        self.discovered.push(item);
    }

    /// The host or URL this item is judged against for scope purposes,
    /// if it has one. Items without a subject (text, responses) are
    /// always considered in scope; they only exist attached to items
    /// that were.
    pub fn scope_subject(&self) -> Option<&str> {
        match self.subtype {
            Subtype::Url | Subtype::BaseUrl | Subtype::HttpRequest => self.identity_field("url"),
            Subtype::Domain | Subtype::DnsRecord => self.identity_field("name"),
            Subtype::IpAddress => self.identity_field("address"),
            _ => None,
        }
    }

    /// Whether the item is inside the audit scope. Computed once per
    /// instance and cached.
    pub fn is_in_scope(&self, scope: &AuditScope) -> bool {
        *self.scope_hint.get_or_init(|| match self.scope_subject() {
            Some(subject) => scope.contains(subject),
            None => true,
        })
    }

    /// Merge another record with the same identity into this one.
    ///
    /// Attributes are taken last-wins from `other`, labels and links are
    /// unioned, and unseen discoveries are appended. Merging is
    /// commutative and idempotent over the stored state.
    pub fn merge(&mut self, other: &Data) {
        debug_assert_eq!(self.identity, other.identity);
        for (key, value) in &other.attributes {
            self.attributes.insert(key.clone(), value.clone());
        }
        self.labels.extend(other.labels.iter().cloned());
        self.links.extend(other.links.iter().cloned());
        let known: BTreeSet<Identity> = self
            .discovered
            .iter()
            .map(|d| d.identity.clone())
            .collect();
        for item in &other.discovered {
            if !known.contains(&item.identity) {
                self.discovered.push(item.clone());
            }
        }
    }
}
