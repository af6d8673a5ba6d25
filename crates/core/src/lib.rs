//! Keel core types: resource identity, documents, change events and snapshots.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod backoff;
mod error;
mod fingerprint;

pub use backoff::{env_parse, Backoff};
pub use error::{KeelError, KeelResult};
pub use fingerprint::{Fingerprint, Fingerprinter};

pub mod prelude {
    pub use super::{
        Backoff, ChangeEvent, ChangeKind, Fingerprint, Fingerprinter, KeelError, KeelResult, LabelSelector, Metadata,
        Resource, ResourceRef, Snapshot,
    };
}

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9]([-a-zA-Z0-9]*[a-zA-Z0-9])?$").expect("static regex"));
static API_VERSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[\.a-z0-9]([-\.a-z0-9]*[\.a-z0-9])?(/[\.a-z0-9]([-\.a-z0-9]*[\.a-z0-9])?)*$").expect("static regex")
});

/// Check a kind/namespace/name against the identifier grammar.
pub fn validate_identifier(value: &str, what: &str) -> KeelResult<()> {
    if IDENTIFIER.is_match(value) {
        Ok(())
    } else {
        Err(KeelError::validation(what, format!("invalid identifier {:?}", value)))
    }
}

pub fn validate_api_version(value: &str) -> KeelResult<()> {
    if API_VERSION.is_match(value) {
        Ok(())
    } else {
        Err(KeelError::validation("apiVersion", format!("invalid apiVersion {:?}", value)))
    }
}

/// Identity of a resource. Unique within a store; never changes once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind: kind.into(), namespace: None, name: name.into() }
    }

    pub fn namespaced(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind: kind.into(), namespace: Some(namespace.into()), name: name.into() }
    }

    pub fn validate(&self) -> KeelResult<()> {
        validate_identifier(&self.kind, "kind")?;
        if let Some(ns) = &self.namespace {
            validate_identifier(ns, "namespace")?;
        }
        validate_identifier(&self.name, "name")
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

impl FromStr for ResourceRef {
    type Err = KeelError;

    /// Accepts `Kind/name` or `Kind/namespace/name`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        let key = match parts.as_slice() {
            [kind, name] => ResourceRef::new(*kind, *name),
            [kind, ns, name] => ResourceRef::namespaced(*kind, *ns, *name),
            _ => return Err(KeelError::validation("ref", format!("expected Kind/name or Kind/ns/name, got {:?}", s))),
        };
        key.validate()?;
        Ok(key)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// RFC 3339 time the resource was marked for deletion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<String>,
}

/// A declared resource document. `spec` belongs to the caller's domain and is never
/// interpreted here; `status` carries observed state and is not part of the content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
}

impl Resource {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            metadata: Metadata { name: name.into(), ..Default::default() },
            spec: Value::Null,
            status: None,
        }
    }

    pub fn in_namespace(mut self, ns: impl Into<String>) -> Self {
        self.metadata.namespace = Some(ns.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_spec(mut self, spec: Value) -> Self {
        self.spec = spec;
        self
    }

    pub fn key(&self) -> ResourceRef {
        ResourceRef { kind: self.kind.clone(), namespace: self.metadata.namespace.clone(), name: self.metadata.name.clone() }
    }

    pub fn is_deleting(&self) -> bool { self.metadata.deletion_timestamp.is_some() }

    /// Fingerprint of spec + metadata; status is excluded.
    pub fn content_fingerprint(&self) -> Fingerprint { Fingerprint::of_value(&self.content()) }

    /// The versioned content as one JSON value.
    pub fn content(&self) -> Value {
        serde_json::json!({
            "apiVersion": self.api_version,
            "kind": self.kind,
            "metadata": self.metadata,
            "spec": self.spec,
        })
    }

    pub fn validate(&self) -> KeelResult<()> {
        validate_api_version(&self.api_version)?;
        self.key().validate()
    }
}

/// Equality label selector; an empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelSelector(pub BTreeMap<String, String>);

impl LabelSelector {
    pub fn everything() -> Self { Self::default() }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Emitted once per successful store write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeEvent {
    pub key: ResourceRef,
    pub change: ChangeKind,
    pub version: u64,
    /// Content fingerprint after the write; `None` for deletes.
    pub fingerprint: Option<Fingerprint>,
}

/// Point-in-time copy of store contents.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub version: u64,
    pub items: Vec<Arc<Resource>>,
}

impl Snapshot {
    /// Resources of `kind`, optionally restricted to a namespace, whose labels match.
    pub fn matching<'a>(
        &'a self,
        kind: &'a str,
        namespace: Option<&'a str>,
        labels: &'a LabelSelector,
    ) -> impl Iterator<Item = &'a Arc<Resource>> + 'a {
        self.items.iter().filter(move |r| {
            r.kind == kind
                && namespace.map_or(true, |ns| r.metadata.namespace.as_deref() == Some(ns))
                && labels.matches(&r.metadata.labels)
        })
    }
}
