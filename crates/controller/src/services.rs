//! Per-kind pluggable services that reconcilers look up by type.

use std::any::{type_name, Any, TypeId};
use std::sync::Arc;

use keel_core::{KeelError, KeelResult, ResourceRef};
use keel_store::ResourceStore;
use rustc_hash::FxHashMap;

type Entry = (&'static str, Arc<dyn Any + Send + Sync>);

/// At most one service of each type per kind.
#[derive(Default)]
pub struct ServiceRegistry {
    services: FxHashMap<(String, TypeId), Entry>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.services.iter().map(|((kind, _), (name, _))| format!("{}:{}", kind, name)).collect();
        names.sort();
        f.debug_struct("ServiceRegistry").field("services", &names).finish()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn register<T: Any + Send + Sync>(&mut self, kind: impl Into<String>, service: Arc<T>) -> KeelResult<()> {
        let kind = kind.into();
        let key = (kind, TypeId::of::<T>());
        if self.services.contains_key(&key) {
            return Err(KeelError::Config(format!("service {} is already registered for kind {}", type_name::<T>(), key.0)));
        }
        self.services.insert(key, (type_name::<T>(), service));
        Ok(())
    }

    pub fn get<T: Any + Send + Sync>(&self, kind: &str) -> Option<Arc<T>> {
        let (_, svc) = self.services.get(&(kind.to_string(), TypeId::of::<T>()))?;
        Arc::clone(svc).downcast::<T>().ok()
    }

    pub fn len(&self) -> usize { self.services.len() }

    pub fn is_empty(&self) -> bool { self.services.is_empty() }
}

/// What a reconcile pass can reach besides the resource itself.
#[derive(Clone, Copy)]
pub struct ReconcileContext<'a> {
    pub key: &'a ResourceRef,
    /// Store version the pass started from.
    pub version: u64,
    store: &'a ResourceStore,
    services: &'a ServiceRegistry,
}

impl<'a> ReconcileContext<'a> {
    pub fn new(key: &'a ResourceRef, version: u64, store: &'a ResourceStore, services: &'a ServiceRegistry) -> Self {
        Self { key, version, store, services }
    }

    /// Read access to other resources.
    pub fn store(&self) -> &'a ResourceStore { self.store }

    /// The service of type `T` registered for the reconciled kind.
    pub fn service<T: Any + Send + Sync>(&self) -> Option<Arc<T>> { self.services.get::<T>(&self.key.kind) }

    pub fn service_for<T: Any + Send + Sync>(&self, kind: &str) -> Option<Arc<T>> { self.services.get::<T>(kind) }
}
