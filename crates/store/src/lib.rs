//! Keel store: sharded, versioned resource documents with per-kind change streams.
//!
//! Every applied write bumps one global version counter and emits exactly one
//! `ChangeEvent`. Events are sent while the shard lock is held, so subscribers see
//! writes to the same ref in order.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use keel_core::{ChangeEvent, ChangeKind, Fingerprint, KeelError, KeelResult, LabelSelector, Resource, ResourceRef, Snapshot};
use keel_persist::{now_ts, Persist, StoredResource};
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub type ChangeStream = mpsc::UnboundedReceiver<ChangeEvent>;

const DEFAULT_SHARDS: usize = 16;

#[derive(Clone)]
struct Entry {
    resource: Arc<Resource>,
    version: u64,
    fingerprint: Fingerprint,
}

struct Subscriber {
    kind: Option<String>,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

pub struct ResourceStore {
    shards: Vec<RwLock<FxHashMap<ResourceRef, Entry>>>,
    version: AtomicU64,
    subs: Mutex<Vec<Subscriber>>,
    persist: Option<Arc<dyn Persist>>,
}

impl Default for ResourceStore {
    fn default() -> Self { Self::new() }
}

impl ResourceStore {
    pub fn new() -> Self { Self::with_shards(DEFAULT_SHARDS) }

    pub fn with_shards(n: usize) -> Self {
        let n = n.clamp(1, u16::MAX as usize);
        Self {
            shards: (0..n).map(|_| RwLock::new(FxHashMap::default())).collect(),
            version: AtomicU64::new(0),
            subs: Mutex::new(Vec::new()),
            persist: None,
        }
    }

    /// Open a store backed by `persist`, restoring its rows without emitting events.
    pub fn with_persist(persist: Arc<dyn Persist>, shards: usize) -> KeelResult<Self> {
        let mut store = Self::with_shards(shards);
        let rows = persist.load_all().map_err(|e| KeelError::Persist(format!("{:#}", e)))?;
        // deletes leave no row behind, so their versions come from the high-water mark
        let mut max_version = persist.high_water().map_err(|e| KeelError::Persist(format!("{:#}", e)))?;
        let count = rows.len();
        for row in rows {
            let resource = Arc::new(row.resource);
            let key = resource.key();
            let fingerprint = resource.content_fingerprint();
            max_version = max_version.max(row.version);
            let shard = store.shard(&key);
            if let Ok(mut map) = shard.write() {
                map.insert(key, Entry { resource, version: row.version, fingerprint });
            }
        }
        store.version = AtomicU64::new(max_version);
        store.persist = Some(persist);
        info!(count, version = max_version, "store restored from persistence");
        Ok(store)
    }

    fn shard(&self, key: &ResourceRef) -> &RwLock<FxHashMap<ResourceRef, Entry>> {
        let idx = shard_index(key, self.shards.len());
        &self.shards[idx]
    }

    fn next_version(&self) -> u64 { self.version.fetch_add(1, Ordering::SeqCst) + 1 }

    /// Latest version handed out by any write.
    pub fn version(&self) -> u64 { self.version.load(Ordering::SeqCst) }

    /// Create or replace a resource (last writer wins). Returns the resulting version.
    ///
    /// Existing status and deletion marker are preserved. A write whose content equals
    /// the stored content is a no-op and emits no event.
    pub fn put(&self, resource: Resource) -> KeelResult<u64> { self.write(resource, None) }

    /// Like `put`, but reports `StoreConflict` when the stored version differs from `seen`
    /// (`0` meaning "expected absent"). The write is applied either way.
    pub fn put_at(&self, resource: Resource, seen: u64) -> KeelResult<u64> { self.write(resource, Some(seen)) }

    fn write(&self, mut resource: Resource, seen: Option<u64>) -> KeelResult<u64> {
        resource.validate()?;
        let key = resource.key();
        let mut map = self.shard(&key).write().map_err(|_| poisoned())?;
        let existing = map.get(&key).cloned();
        if let Some(prev) = &existing {
            resource.status = prev.resource.status.clone();
            if resource.metadata.deletion_timestamp.is_none() {
                resource.metadata.deletion_timestamp = prev.resource.metadata.deletion_timestamp.clone();
            }
        } else {
            resource.status = None;
        }
        let fingerprint = resource.content_fingerprint();
        let current = existing.as_ref().map(|e| e.version).unwrap_or(0);

        let written = match &existing {
            Some(prev) if prev.fingerprint == fingerprint => {
                debug!(%key, version = prev.version, "put is a no-op");
                prev.version
            }
            _ => {
                let change = if existing.is_some() { ChangeKind::Updated } else { ChangeKind::Created };
                let version = self.commit(&mut map, key.clone(), Arc::new(resource), fingerprint)?;
                self.emit(ChangeEvent { key: key.clone(), change, version, fingerprint: Some(fingerprint) });
                counter!("store_put_total", 1u64);
                version
            }
        };
        drop(map);

        match seen {
            Some(seen) if seen != current => {
                warn!(%key, seen, current, written, "stale writer replaced newer version");
                Err(KeelError::StoreConflict { key, seen, current, written })
            }
            _ => Ok(written),
        }
    }

    fn commit(
        &self,
        map: &mut FxHashMap<ResourceRef, Entry>,
        key: ResourceRef,
        resource: Arc<Resource>,
        fingerprint: Fingerprint,
    ) -> KeelResult<u64> {
        let version = self.next_version();
        if let Some(p) = &self.persist {
            let row = StoredResource { resource: (*resource).clone(), version, ts: now_ts() };
            p.save(&row).map_err(|e| KeelError::Persist(format!("{:#}", e)))?;
        }
        map.insert(key, Entry { resource, version, fingerprint });
        Ok(version)
    }

    /// Record observed state. Does not change the content fingerprint.
    pub fn put_status(&self, key: &ResourceRef, status: Value) -> KeelResult<u64> {
        let mut map = self.shard(key).write().map_err(|_| poisoned())?;
        let prev = map.get(key).cloned().ok_or_else(|| KeelError::NotFound(key.clone()))?;
        if prev.resource.status.as_ref() == Some(&status) {
            return Ok(prev.version);
        }
        let mut next = (*prev.resource).clone();
        next.status = Some(status);
        let version = self.commit(&mut map, key.clone(), Arc::new(next), prev.fingerprint)?;
        self.emit(ChangeEvent { key: key.clone(), change: ChangeKind::Updated, version, fingerprint: Some(prev.fingerprint) });
        counter!("store_status_total", 1u64);
        Ok(version)
    }

    /// Soft delete: stamp `metadata.deletionTimestamp` so controllers can finalize.
    pub fn mark_deleted(&self, key: &ResourceRef) -> KeelResult<u64> {
        let mut map = self.shard(key).write().map_err(|_| poisoned())?;
        let prev = map.get(key).cloned().ok_or_else(|| KeelError::NotFound(key.clone()))?;
        if prev.resource.is_deleting() {
            return Ok(prev.version);
        }
        let mut next = (*prev.resource).clone();
        next.metadata.deletion_timestamp = Some(chrono::Utc::now().to_rfc3339());
        let fingerprint = next.content_fingerprint();
        let version = self.commit(&mut map, key.clone(), Arc::new(next), fingerprint)?;
        info!(%key, version, "marked for deletion");
        self.emit(ChangeEvent { key: key.clone(), change: ChangeKind::Updated, version, fingerprint: Some(fingerprint) });
        Ok(version)
    }

    /// Remove a resource immediately.
    pub fn delete(&self, key: &ResourceRef) -> KeelResult<u64> {
        let mut map = self.shard(key).write().map_err(|_| poisoned())?;
        if !map.contains_key(key) {
            return Err(KeelError::NotFound(key.clone()));
        }
        let version = self.next_version();
        if let Some(p) = &self.persist {
            p.remove(key, version).map_err(|e| KeelError::Persist(format!("{:#}", e)))?;
        }
        map.remove(key);
        self.emit(ChangeEvent { key: key.clone(), change: ChangeKind::Deleted, version, fingerprint: None });
        counter!("store_delete_total", 1u64);
        Ok(version)
    }

    pub fn get(&self, key: &ResourceRef) -> KeelResult<Arc<Resource>> {
        self.get_versioned(key).map(|(r, _)| r).ok_or_else(|| KeelError::NotFound(key.clone()))
    }

    pub fn get_versioned(&self, key: &ResourceRef) -> Option<(Arc<Resource>, u64)> {
        let map = self.shard(key).read().ok()?;
        map.get(key).map(|e| (Arc::clone(&e.resource), e.version))
    }

    /// Snapshot of resources of `kind` whose labels match, ordered by ref.
    pub fn list(&self, kind: &str, selector: &LabelSelector) -> Vec<Arc<Resource>> {
        let mut out: Vec<Arc<Resource>> = Vec::new();
        for shard in &self.shards {
            if let Ok(map) = shard.read() {
                out.extend(
                    map.values()
                        .filter(|e| e.resource.kind == kind && selector.matches(&e.resource.metadata.labels))
                        .map(|e| Arc::clone(&e.resource)),
                );
            }
        }
        out.sort_by(|a, b| a.key().cmp(&b.key()));
        out
    }

    /// Copy of every resource, ordered by ref. Consistent per shard, not across shards.
    pub fn snapshot(&self) -> Snapshot {
        let version = self.version();
        let mut items: Vec<Arc<Resource>> = Vec::new();
        for shard in &self.shards {
            if let Ok(map) = shard.read() {
                items.extend(map.values().map(|e| Arc::clone(&e.resource)));
            }
        }
        items.sort_by(|a, b| a.key().cmp(&b.key()));
        Snapshot { version, items }
    }

    pub fn len(&self) -> usize { self.shards.iter().filter_map(|s| s.read().ok()).map(|m| m.len()).sum() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Stream change events for one kind.
    pub fn subscribe(&self, kind: &str) -> ChangeStream { self.add_subscriber(Some(kind.to_string())) }

    /// Stream change events for every kind.
    pub fn subscribe_all(&self) -> ChangeStream { self.add_subscriber(None) }

    fn add_subscriber(&self, kind: Option<String>) -> ChangeStream {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subs) = self.subs.lock() {
            subs.push(Subscriber { kind, tx });
            gauge!("store_subscribers", subs.len() as f64);
        }
        rx
    }

    fn emit(&self, ev: ChangeEvent) {
        let Ok(mut subs) = self.subs.lock() else { return };
        subs.retain(|s| {
            if s.kind.as_deref().map_or(true, |k| k == ev.key.kind) {
                s.tx.send(ev.clone()).is_ok()
            } else {
                !s.tx.is_closed()
            }
        });
        debug!(key = %ev.key, change = %ev.change, version = ev.version, "change emitted");
    }
}

fn poisoned() -> KeelError { KeelError::Persist("store shard lock poisoned".into()) }

/// FNV-1a over the rendered ref, modulo the shard count.
fn shard_index(key: &ResourceRef, shards: usize) -> usize {
    if shards <= 1 {
        return 0;
    }
    let mut h: u64 = 0xcbf29ce484222325;
    for part in [key.kind.as_str(), key.namespace.as_deref().unwrap_or(""), key.name.as_str()] {
        for b in part.as_bytes() {
            h ^= *b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        h ^= 0xff;
        h = h.wrapping_mul(0x100000001b3);
    }
    (h % shards as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn number(name: &str, v: i64) -> Resource { Resource::new("v1", "Number", name).with_spec(json!({ "value": v })) }

    #[test]
    fn put_get_versions_increase() {
        let s = ResourceStore::new();
        let v1 = s.put(number("a", 1)).unwrap();
        let v2 = s.put(number("b", 2)).unwrap();
        let v3 = s.put(number("a", 3)).unwrap();
        assert!(v1 < v2 && v2 < v3);
        let (a, va) = s.get_versioned(&ResourceRef::new("Number", "a")).unwrap();
        assert_eq!(a.spec["value"], 3);
        assert_eq!(va, v3);
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn identical_put_is_noop() {
        let s = ResourceStore::new();
        let mut rx = s.subscribe_all();
        let v1 = s.put(number("a", 1)).unwrap();
        let v2 = s.put(number("a", 1)).unwrap();
        assert_eq!(v1, v2);
        assert_eq!(rx.try_recv().unwrap().change, ChangeKind::Created);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn invalid_resource_never_enters_store() {
        let s = ResourceStore::new();
        let err = s.put(Resource::new("v1", "Number", "Bad_Name")).unwrap_err();
        assert!(matches!(err, KeelError::Validation { .. }));
        assert!(s.is_empty());
    }

    #[test]
    fn missing_refs_are_not_found() {
        let s = ResourceStore::new();
        let key = ResourceRef::new("Number", "x");
        assert_eq!(s.get(&key).unwrap_err(), KeelError::NotFound(key.clone()));
        assert!(matches!(s.delete(&key), Err(KeelError::NotFound(_))));
        assert!(matches!(s.put_status(&key, json!({})), Err(KeelError::NotFound(_))));
    }

    #[test]
    fn stale_writer_is_informed_but_wins() {
        let s = ResourceStore::new();
        let v1 = s.put(number("a", 1)).unwrap();
        let _v2 = s.put(number("a", 2)).unwrap();
        match s.put_at(number("a", 3), v1) {
            Err(KeelError::StoreConflict { seen, written, .. }) => {
                assert_eq!(seen, v1);
                assert_eq!(s.get_versioned(&ResourceRef::new("Number", "a")).unwrap().1, written);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        assert_eq!(s.get(&ResourceRef::new("Number", "a")).unwrap().spec["value"], 3);
        let current = s.version();
        assert!(s.put_at(number("a", 4), current).is_ok());
        assert!(s.put_at(number("z", 1), 0).is_ok());
    }

    #[test]
    fn status_is_inherited_and_not_content() {
        let s = ResourceStore::new();
        let key = ResourceRef::new("Number", "a");
        s.put(number("a", 1)).unwrap();
        let mut rx = s.subscribe("Number");
        s.put_status(&key, json!({"seen": 1})).unwrap();
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.fingerprint, Some(number("a", 1).content_fingerprint()));
        // a later put keeps status, caller-provided status is ignored
        let mut next = number("a", 2);
        next.status = Some(json!({"forged": true}));
        s.put(next).unwrap();
        assert_eq!(s.get(&key).unwrap().status, Some(json!({"seen": 1})));
    }

    #[test]
    fn mark_deleted_then_delete() {
        let s = ResourceStore::new();
        let key = ResourceRef::new("Number", "a");
        s.put(number("a", 1)).unwrap();
        let mut rx = s.subscribe("Number");
        let v = s.mark_deleted(&key).unwrap();
        assert!(s.get(&key).unwrap().is_deleting());
        assert_eq!(s.mark_deleted(&key).unwrap(), v);
        // marker survives a plain put
        s.put(number("a", 5)).unwrap();
        assert!(s.get(&key).unwrap().is_deleting());
        s.delete(&key).unwrap();
        let changes: Vec<ChangeKind> = std::iter::from_fn(|| rx.try_recv().ok()).map(|e| e.change).collect();
        assert_eq!(changes, vec![ChangeKind::Updated, ChangeKind::Updated, ChangeKind::Deleted]);
    }

    #[test]
    fn subscriptions_filter_by_kind_and_drop_closed() {
        let s = ResourceStore::new();
        let mut numbers = s.subscribe("Number");
        let files = s.subscribe("File");
        drop(files);
        s.put(Resource::new("v1", "File", "f")).unwrap();
        s.put(number("a", 1)).unwrap();
        let ev = numbers.try_recv().unwrap();
        assert_eq!(ev.key.kind, "Number");
        assert!(numbers.try_recv().is_err());
        assert_eq!(s.subs.lock().unwrap().len(), 1);
    }

    #[test]
    fn list_filters_by_labels() {
        let s = ResourceStore::new();
        s.put(number("a", 1).with_label("team", "x")).unwrap();
        s.put(number("b", 1)).unwrap();
        let sel = LabelSelector::everything().with("team", "x");
        let got: Vec<String> = s.list("Number", &sel).iter().map(|r| r.metadata.name.clone()).collect();
        assert_eq!(got, vec!["a".to_string()]);
        assert_eq!(s.list("Number", &LabelSelector::everything()).len(), 2);
        assert_eq!(s.snapshot().items.len(), 2);
    }

    #[test]
    fn restores_from_persistence() {
        let p = Arc::new(keel_persist::MemoryPersist::new());
        let s = ResourceStore::with_persist(p.clone(), 4).unwrap();
        s.put(number("a", 1)).unwrap();
        let v = s.put(number("b", 2)).unwrap();
        s.delete(&ResourceRef::new("Number", "a")).unwrap();
        assert_eq!(p.len(), 1);

        let again = ResourceStore::with_persist(p, 4).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again.get_versioned(&ResourceRef::new("Number", "b")).unwrap().1, v);
        assert!(again.put(number("c", 3)).unwrap() > v);
    }

    #[test]
    fn deleting_the_newest_row_keeps_versions_monotonic() {
        let p = Arc::new(keel_persist::MemoryPersist::new());
        let s = ResourceStore::with_persist(p.clone(), 4).unwrap();
        s.put(number("a", 1)).unwrap();
        let newest = s.put(number("b", 2)).unwrap();
        let deleted_at = s.delete(&ResourceRef::new("Number", "b")).unwrap();
        assert!(deleted_at > newest);

        let again = ResourceStore::with_persist(p, 4).unwrap();
        assert_eq!(again.version(), deleted_at);
        assert!(again.put(number("b", 3)).unwrap() > deleted_at);
    }

    #[test]
    fn shard_index_is_stable_and_bounded() {
        let k = ResourceRef::namespaced("File", "default", "file1");
        assert_eq!(shard_index(&k, 16), shard_index(&k, 16));
        assert!(shard_index(&k, 7) < 7);
        assert_eq!(shard_index(&k, 1), 0);
    }
}
