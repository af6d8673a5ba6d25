//! Keel schema: turn raw documents into validated resources.
//!
//! Parsing goes through a `KindRegistry` (known kinds, scope, default namespace) and
//! then an `AdmissionChain`. Nothing that fails either step reaches the store.

#![forbid(unsafe_code)]

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use keel_core::{validate_api_version, validate_identifier, KeelError, KeelResult, Resource};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub const DEFAULT_NAMESPACE: &str = "default";

/// Conversion between raw documents and resources.
pub trait Schema: Send + Sync {
    fn parse(&self, raw: &str) -> KeelResult<Resource>;
    fn serialize(&self, resource: &Resource) -> KeelResult<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Format {
    Json,
    Yaml,
}

impl Format {
    /// Guess from a file extension; anything that is not `.json` is treated as YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Format::Json,
            _ => Format::Yaml,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KindInfo {
    pub api_version: String,
    pub kind: String,
    pub namespaced: bool,
    /// JSON Schema for `spec`; enforced with the `jsonschema-validate` feature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_schema: Option<Value>,
}

impl KindInfo {
    pub fn namespaced(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { api_version: api_version.into(), kind: kind.into(), namespaced: true, spec_schema: None }
    }

    pub fn cluster(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { api_version: api_version.into(), kind: kind.into(), namespaced: false, spec_schema: None }
    }

    pub fn with_spec_schema(mut self, schema: Value) -> Self {
        self.spec_schema = Some(schema);
        self
    }
}

type KindKey = (String, String);

/// Known resource kinds, keyed by `(apiVersion, kind)`.
pub struct KindRegistry {
    kinds: FxHashMap<KindKey, KindInfo>,
    default_namespace: String,
    #[cfg(feature = "jsonschema-validate")]
    compiled: FxHashMap<KindKey, Arc<jsonschema::JSONSchema>>,
}

impl fmt::Debug for KindRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<String> = self.kinds.keys().map(|(v, k)| format!("{}/{}", v, k)).collect();
        kinds.sort();
        f.debug_struct("KindRegistry").field("kinds", &kinds).field("default_namespace", &self.default_namespace).finish()
    }
}

impl Default for KindRegistry {
    fn default() -> Self { Self::new(DEFAULT_NAMESPACE) }
}

impl KindRegistry {
    /// A registry holding only the built-in cluster-scoped `v1/Namespace` kind.
    pub fn new(default_namespace: impl Into<String>) -> Self {
        let mut reg = Self {
            kinds: FxHashMap::default(),
            default_namespace: default_namespace.into(),
            #[cfg(feature = "jsonschema-validate")]
            compiled: FxHashMap::default(),
        };
        reg.kinds.insert(("v1".into(), "Namespace".into()), KindInfo::cluster("v1", "Namespace"));
        reg
    }

    pub fn default_namespace(&self) -> &str { &self.default_namespace }

    pub fn register(&mut self, info: KindInfo) -> KeelResult<()> {
        validate_api_version(&info.api_version)?;
        validate_identifier(&info.kind, "kind")?;
        let key = (info.api_version.clone(), info.kind.clone());
        #[cfg(feature = "jsonschema-validate")]
        if let Some(schema) = &info.spec_schema {
            let compiled = spec_check::compile(schema)
                .map_err(|e| KeelError::Config(format!("{}/{}: invalid spec schema: {}", info.api_version, info.kind, e)))?;
            self.compiled.insert(key.clone(), Arc::new(compiled));
        }
        debug!(api_version = %info.api_version, kind = %info.kind, namespaced = info.namespaced, "kind registered");
        self.kinds.insert(key, info);
        Ok(())
    }

    pub fn with(mut self, info: KindInfo) -> KeelResult<Self> {
        self.register(info)?;
        Ok(self)
    }

    pub fn get(&self, api_version: &str, kind: &str) -> Option<&KindInfo> {
        self.kinds.get(&(api_version.to_string(), kind.to_string()))
    }

    pub fn len(&self) -> usize { self.kinds.len() }

    pub fn is_empty(&self) -> bool { self.kinds.is_empty() }

    /// Check a resource against its kind, filling in the default namespace.
    pub fn normalize(&self, mut resource: Resource) -> KeelResult<Resource> {
        validate_api_version(&resource.api_version)?;
        let info = self.get(&resource.api_version, &resource.kind).ok_or_else(|| {
            KeelError::validation(
                resource.key().to_string(),
                format!("unknown kind {}/{}", resource.api_version, resource.kind),
            )
        })?;
        match (info.namespaced, resource.metadata.namespace.is_some()) {
            (true, false) => resource.metadata.namespace = Some(self.default_namespace.clone()),
            (false, true) => {
                return Err(KeelError::validation(
                    resource.key().to_string(),
                    format!("{} is cluster scoped and cannot have a namespace", resource.kind),
                ))
            }
            _ => {}
        }
        resource.validate()?;
        #[cfg(feature = "jsonschema-validate")]
        if let Some(compiled) = self.compiled.get(&(resource.api_version.clone(), resource.kind.clone())) {
            let issues = spec_check::issues(compiled, &resource.spec);
            if !issues.is_empty() {
                return Err(KeelError::validation(resource.key().to_string(), issues.join("; ")));
            }
        }
        Ok(resource)
    }
}

#[cfg(feature = "jsonschema-validate")]
mod spec_check {
    use jsonschema::{Draft, JSONSchema};
    use serde_json::Value;

    pub(crate) fn compile(schema: &Value) -> Result<JSONSchema, String> {
        JSONSchema::options().with_draft(Draft::Draft7).compile(schema).map_err(|e| e.to_string())
    }

    pub(crate) fn issues(compiled: &JSONSchema, spec: &Value) -> Vec<String> {
        match compiled.validate(spec) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .map(|err| {
                    let path = err.instance_path.to_string();
                    if path.is_empty() {
                        format!("spec: {}", err)
                    } else {
                        format!("spec{}: {}", path, err)
                    }
                })
                .collect(),
        }
    }
}

/// The JSON/YAML document schema backed by a kind registry.
#[derive(Debug)]
pub struct DocumentSchema {
    registry: KindRegistry,
    format: Format,
}

impl DocumentSchema {
    pub fn new(registry: KindRegistry, format: Format) -> Self { Self { registry, format } }

    pub fn registry(&self) -> &KindRegistry { &self.registry }

    pub fn format(&self) -> Format { self.format }

    /// Convert an already-decoded document.
    pub fn from_value(&self, doc: Value) -> KeelResult<Resource> {
        let resource: Resource =
            serde_json::from_value(doc).map_err(|e| KeelError::validation("document", e.to_string()))?;
        self.registry.normalize(resource)
    }

    /// Parse every document in a (possibly multi-document) YAML or JSON string.
    /// Empty documents are skipped. The first invalid document fails the whole set.
    pub fn parse_all(&self, raw: &str) -> KeelResult<Vec<Resource>> { self.parse_all_as(raw, self.format) }

    pub fn parse_all_as(&self, raw: &str, format: Format) -> KeelResult<Vec<Resource>> {
        let mut out = Vec::new();
        match format {
            Format::Json => {
                let doc: Value = serde_json::from_str(raw).map_err(|e| KeelError::validation("document", e.to_string()))?;
                match doc {
                    Value::Array(items) => {
                        for item in items {
                            out.push(self.from_value(item)?);
                        }
                    }
                    other => out.push(self.from_value(other)?),
                }
            }
            Format::Yaml => {
                for (i, de) in serde_yaml::Deserializer::from_str(raw).enumerate() {
                    let doc = serde_yaml::Value::deserialize(de)
                        .map_err(|e| KeelError::validation(format!("document {}", i), e.to_string()))?;
                    if doc.is_null() {
                        continue;
                    }
                    let json = serde_json::to_value(doc)
                        .map_err(|e| KeelError::validation(format!("document {}", i), e.to_string()))?;
                    out.push(self.from_value(json)?);
                }
            }
        }
        Ok(out)
    }
}

impl Default for DocumentSchema {
    fn default() -> Self { Self::new(KindRegistry::default(), Format::Yaml) }
}

impl Schema for DocumentSchema {
    fn parse(&self, raw: &str) -> KeelResult<Resource> {
        let mut docs = self.parse_all(raw)?;
        match docs.len() {
            1 => Ok(docs.remove(0)),
            n => Err(KeelError::validation("document", format!("expected exactly one resource, found {}", n))),
        }
    }

    fn serialize(&self, resource: &Resource) -> KeelResult<String> {
        let out = match self.format {
            Format::Json => serde_json::to_string_pretty(resource).map_err(|e| e.to_string()),
            Format::Yaml => serde_yaml::to_string(resource).map_err(|e| e.to_string()),
        };
        out.map_err(|e| KeelError::validation(resource.key().to_string(), e))
    }
}

/// Read a manifest file and parse every resource in it, using the file extension
/// to pick JSON or YAML.
pub fn load_manifest(schema: &DocumentSchema, path: &Path) -> Result<Vec<Resource>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading manifest {}", path.display()))?;
    schema
        .parse_all_as(&raw, Format::from_path(path))
        .with_context(|| format!("parsing manifest {}", path.display()))
}

/// Admission step: mutate or deny. An `Err` denies the resource.
pub trait Admission: Send + Sync {
    fn name(&self) -> &str;
    fn admit(&self, resource: Resource) -> Result<Resource>;
}

/// Ordered admission controllers. Each sees the previous one's output.
#[derive(Clone, Default)]
pub struct AdmissionChain {
    controllers: Vec<Arc<dyn Admission>>,
}

impl fmt::Debug for AdmissionChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.controllers.iter().map(|c| c.name()).collect();
        f.debug_struct("AdmissionChain").field("controllers", &names).finish()
    }
}

impl AdmissionChain {
    pub fn new() -> Self { Self::default() }

    pub fn push(&mut self, controller: Arc<dyn Admission>) { self.controllers.push(controller); }

    pub fn len(&self) -> usize { self.controllers.len() }

    pub fn is_empty(&self) -> bool { self.controllers.is_empty() }

    pub fn admit(&self, mut resource: Resource) -> KeelResult<Resource> {
        let key = resource.key();
        for c in &self.controllers {
            resource = c
                .admit(resource)
                .map_err(|e| KeelError::validation(key.to_string(), format!("denied by {}: {:#}", c.name(), e)))?;
            if resource.key() != key {
                return Err(KeelError::validation(
                    key.to_string(),
                    format!("admission controller {} changed the ref to {}", c.name(), resource.key()),
                ));
            }
        }
        Ok(resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use serde_json::json;

    fn registry() -> KindRegistry {
        KindRegistry::default()
            .with(KindInfo::namespaced("example.dev/v1", "File"))
            .and_then(|r| r.with(KindInfo::cluster("v1", "Number")))
            .unwrap()
    }

    #[test]
    fn parses_yaml_and_defaults_namespace() {
        let schema = DocumentSchema::new(registry(), Format::Yaml);
        let r = schema
            .parse("apiVersion: example.dev/v1\nkind: File\nmetadata:\n  name: file1\nspec:\n  path: /tmp/a\n")
            .unwrap();
        assert_eq!(r.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(r.spec, json!({"path": "/tmp/a"}));
        let back = schema.serialize(&r).unwrap();
        assert!(back.contains("namespace: default"));
    }

    #[test]
    fn rejects_unknown_kinds_and_bad_scope() {
        let schema = DocumentSchema::new(registry(), Format::Json);
        let unknown = schema.parse(r#"{"apiVersion":"v1","kind":"Mystery","metadata":{"name":"m"}}"#);
        assert!(matches!(unknown, Err(KeelError::Validation { .. })));
        let scoped = schema.parse(r#"{"apiVersion":"v1","kind":"Number","metadata":{"name":"n","namespace":"x"}}"#);
        assert!(matches!(scoped, Err(KeelError::Validation { .. })));
        let bad_name = schema.parse(r#"{"apiVersion":"v1","kind":"Number","metadata":{"name":"-n"}}"#);
        assert!(matches!(bad_name, Err(KeelError::Validation { .. })));
        let missing = schema.parse(r#"{"apiVersion":"v1","kind":"Number"}"#);
        assert!(matches!(missing, Err(KeelError::Validation { .. })));
    }

    #[test]
    fn namespace_kind_is_builtin() {
        let schema = DocumentSchema::default();
        let r = schema.parse("apiVersion: v1\nkind: Namespace\nmetadata:\n  name: team-a\n").unwrap();
        assert!(r.metadata.namespace.is_none());
    }

    #[test]
    fn multi_document_manifest() {
        let schema = DocumentSchema::new(registry(), Format::Yaml);
        let raw = "---\napiVersion: v1\nkind: Number\nmetadata: {name: a}\nspec: {value: 1}\n---\napiVersion: v1\nkind: Number\nmetadata: {name: b}\n";
        let docs = schema.parse_all(raw).unwrap();
        let names: Vec<&str> = docs.iter().map(|r| r.metadata.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(schema.parse(raw).is_err());
    }

    #[test]
    fn manifest_format_follows_extension() {
        let dir = std::env::temp_dir().join(format!("keel-schema-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("numbers.json");
        std::fs::write(&path, r#"[{"apiVersion":"v1","kind":"Number","metadata":{"name":"a"}}]"#).unwrap();
        let schema = DocumentSchema::new(registry(), Format::Yaml);
        let docs = load_manifest(&schema, &path).unwrap();
        assert_eq!(docs.len(), 1);
        assert!(load_manifest(&schema, &dir.join("missing.yaml")).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    struct Stamp;
    impl Admission for Stamp {
        fn name(&self) -> &str { "stamp" }
        fn admit(&self, resource: Resource) -> Result<Resource> { Ok(resource.with_label("admitted", "yes")) }
    }

    struct Rename;
    impl Admission for Rename {
        fn name(&self) -> &str { "rename" }
        fn admit(&self, mut resource: Resource) -> Result<Resource> {
            resource.metadata.name.push_str("-x");
            Ok(resource)
        }
    }

    struct Deny;
    impl Admission for Deny {
        fn name(&self) -> &str { "deny" }
        fn admit(&self, resource: Resource) -> Result<Resource> {
            if resource.spec["value"].as_i64().unwrap_or(0) < 0 {
                bail!("negative values are not allowed");
            }
            Ok(resource)
        }
    }

    #[test]
    fn admission_mutates_denies_and_guards_ref() {
        let mut chain = AdmissionChain::new();
        chain.push(Arc::new(Stamp));
        chain.push(Arc::new(Deny));
        let ok = chain.admit(Resource::new("v1", "Number", "n").with_spec(json!({"value": 1}))).unwrap();
        assert_eq!(ok.metadata.labels.get("admitted").map(String::as_str), Some("yes"));

        let err = chain.admit(Resource::new("v1", "Number", "n").with_spec(json!({"value": -1}))).unwrap_err();
        assert!(err.to_string().contains("denied by deny"));

        chain.push(Arc::new(Rename));
        let err = chain.admit(Resource::new("v1", "Number", "n")).unwrap_err();
        assert!(err.to_string().contains("changed the ref"));
    }

    #[cfg(feature = "jsonschema-validate")]
    #[test]
    fn spec_schema_is_enforced() {
        let schema_doc = json!({"type": "object", "required": ["value"], "properties": {"value": {"type": "integer"}}});
        let reg = KindRegistry::default().with(KindInfo::cluster("v1", "Number").with_spec_schema(schema_doc)).unwrap();
        let schema = DocumentSchema::new(reg, Format::Json);
        assert!(schema.parse(r#"{"apiVersion":"v1","kind":"Number","metadata":{"name":"n"},"spec":{"value":2}}"#).is_ok());
        let err = schema
            .parse(r#"{"apiVersion":"v1","kind":"Number","metadata":{"name":"n"},"spec":{"value":"two"}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("spec/value"));
    }
}
