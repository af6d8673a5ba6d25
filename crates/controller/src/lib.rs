//! Keel controller: per-kind reconcile functions driven by the work queue.
//!
//! Each ref moves through `Pending -> Reconciling -> Succeeded | Failed`. Failures are
//! retried with capped exponential backoff until the attempt budget is spent; then the
//! failure is terminal. Succeeded and terminal states hold until the resource, or an
//! input of rules the ref derived from, changes.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::{Backoff, ChangeEvent, ChangeKind, Fingerprint, KeelError, KeelResult, LabelSelector, Resource, ResourceRef};
use keel_queue::{Lease, Reason, WorkQueue};
use keel_rules::engine::RuleOutput;
use keel_store::ResourceStore;
use metrics::{counter, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

mod derive;
mod diff;
mod events;
mod services;

pub use derive::{DeriveRequest, RuleClient};
pub use diff::{diff_summary, DiffSummary};
pub use events::{EngineEvent, EventSink, MemorySink, TracingSink};
pub use services::{ReconcileContext, ServiceRegistry};

/// apiVersion of resources written from rule outputs.
pub const DERIVED_API_VERSION: &str = "keel.dev/v1";
/// Label naming the rule a derived resource came from.
pub const DERIVED_BY_LABEL: &str = "keel.dev/derived-by";

/// What a reconcile pass asks the engine to do. Applied in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Create or replace a resource. Writing the reconciled ref itself is checked
    /// against the version the pass started from.
    Put(Resource),
    Delete(ResourceRef),
    /// Record observed state on the reconciled ref.
    SetStatus(Value),
    /// Run the rules producing these output types (all rules when empty) and store
    /// each output as a `keel.dev/v1` resource of the output type, named after the rule.
    Derive { outputs: Vec<String> },
    /// Reconcile again after the delay even if nothing changes.
    Requeue(Duration),
}

#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Kind handled by this reconciler.
    fn kind(&self) -> &str;

    /// Observed state of `desired`. Defaults to the stored status.
    async fn observe(&self, desired: &Resource) -> Result<Option<Value>> { Ok(desired.status.clone()) }

    async fn reconcile(&self, ctx: &ReconcileContext<'_>, desired: &Resource, observed: Option<&Value>) -> Result<Vec<Action>>;

    /// Called instead of `reconcile` once the resource is marked for deletion.
    /// The default removes it.
    async fn finalize(&self, _ctx: &ReconcileContext<'_>, desired: &Resource, _observed: Option<&Value>) -> Result<Vec<Action>> {
        Ok(vec![Action::Delete(desired.key())])
    }

    /// Called after the resource has left the store.
    async fn on_removed(&self, _key: &ResourceRef) -> Result<()> { Ok(()) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Reconciling,
    Succeeded,
    Failed { reason: String, terminal: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControllerStatus {
    #[serde(flatten)]
    pub phase: Phase,
    /// Consecutive failed attempts since the last change.
    pub attempts: u32,
    /// Content fingerprint of the last successfully reconciled version.
    pub fingerprint: Option<Fingerprint>,
    pub updated_at: DateTime<Utc>,
}

impl ControllerStatus {
    fn pending() -> Self { Self { phase: Phase::Pending, attempts: 0, fingerprint: None, updated_at: Utc::now() } }

    /// Succeeded and terminally failed refs ignore retries and resyncs-by-retry.
    pub fn is_absorbing(&self) -> bool {
        matches!(self.phase, Phase::Succeeded | Phase::Failed { terminal: true, .. })
    }

    pub fn is_terminal(&self) -> bool { matches!(self.phase, Phase::Failed { terminal: true, .. }) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    /// Attempts before a failure becomes terminal. At least 1.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self { Self { backoff: Backoff::default(), max_attempts: 5 } }
}

/// Which owners derived from which inputs.
#[derive(Debug, Default)]
struct Dependencies {
    inputs_of: FxHashMap<ResourceRef, (Vec<ResourceRef>, Vec<String>)>,
    by_kind: FxHashMap<String, FxHashSet<ResourceRef>>,
}

impl Dependencies {
    fn record(&mut self, owner: &ResourceRef, inputs: Vec<ResourceRef>, kinds: Vec<String>) {
        self.forget(owner);
        for kind in &kinds {
            self.by_kind.entry(kind.clone()).or_default().insert(owner.clone());
        }
        self.inputs_of.insert(owner.clone(), (inputs, kinds));
    }

    fn forget(&mut self, owner: &ResourceRef) {
        let Some((_, kinds)) = self.inputs_of.remove(owner) else { return };
        for kind in kinds {
            if let Some(set) = self.by_kind.get_mut(&kind) {
                set.remove(owner);
                if set.is_empty() {
                    self.by_kind.remove(&kind);
                }
            }
        }
    }

    /// Owners whose rule inputs select the kind of `key`. Kind granularity also covers
    /// resources that start or stop matching a selector.
    fn owners_of(&self, key: &ResourceRef) -> Vec<ResourceRef> {
        let mut owners: Vec<ResourceRef> = self.by_kind.get(&key.kind).map(|s| s.iter().cloned().collect()).unwrap_or_default();
        owners.retain(|o| o != key);
        owners.sort();
        owners
    }
}

enum PassError {
    Conflict,
    Failed(String),
    /// Retrying cannot help, e.g. a derive naming an output no rule produces.
    Fatal(String),
}

fn rules_err(e: KeelError) -> PassError {
    if e.is_fatal() {
        PassError::Fatal(e.to_string())
    } else {
        PassError::Failed(e.to_string())
    }
}

fn store_err(e: KeelError) -> PassError {
    match e {
        KeelError::StoreConflict { .. } => PassError::Conflict,
        other => PassError::Failed(other.to_string()),
    }
}

struct Pass {
    actions: usize,
    requeue: Option<Duration>,
    fingerprint: Fingerprint,
}

pub struct Controller {
    store: Arc<ResourceStore>,
    queue: WorkQueue,
    reconcilers: FxHashMap<String, Arc<dyn Reconciler>>,
    rules: Option<RuleClient>,
    services: Arc<ServiceRegistry>,
    sink: Arc<dyn EventSink>,
    policy: RetryPolicy,
    statuses: RwLock<FxHashMap<ResourceRef, ControllerStatus>>,
    deps: RwLock<Dependencies>,
    seen: Mutex<FxHashMap<ResourceRef, Fingerprint>>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller").field("kinds", &self.kinds()).field("policy", &self.policy).finish()
    }
}

impl Controller {
    pub fn new(store: Arc<ResourceStore>, queue: WorkQueue, sink: Arc<dyn EventSink>) -> Self {
        Self {
            store,
            queue,
            reconcilers: FxHashMap::default(),
            rules: None,
            services: Arc::new(ServiceRegistry::new()),
            sink,
            policy: RetryPolicy::default(),
            statuses: RwLock::new(FxHashMap::default()),
            deps: RwLock::new(Dependencies::default()),
            seen: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = RetryPolicy { max_attempts: policy.max_attempts.max(1), ..policy };
        self
    }

    pub fn with_rules(mut self, rules: RuleClient) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn with_services(mut self, services: Arc<ServiceRegistry>) -> Self {
        self.services = services;
        self
    }

    pub fn services(&self) -> &ServiceRegistry { &self.services }

    /// One reconciler per kind.
    pub fn register(&mut self, reconciler: Arc<dyn Reconciler>) -> KeelResult<()> {
        let kind = reconciler.kind().to_string();
        if self.reconcilers.contains_key(&kind) {
            return Err(KeelError::Config(format!("a reconciler for kind {} is already registered", kind)));
        }
        debug!(%kind, "reconciler registered");
        self.reconcilers.insert(kind, reconciler);
        Ok(())
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.reconcilers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn handles(&self, kind: &str) -> bool { self.reconcilers.contains_key(kind) }

    pub fn policy(&self) -> RetryPolicy { self.policy }

    pub fn status(&self, key: &ResourceRef) -> Option<ControllerStatus> { self.statuses_read().get(key).cloned() }

    pub fn statuses(&self) -> Vec<(ResourceRef, ControllerStatus)> {
        let mut out: Vec<(ResourceRef, ControllerStatus)> =
            self.statuses_read().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Resources `owner` was last derived from.
    pub fn dependencies_of(&self, owner: &ResourceRef) -> Vec<ResourceRef> {
        self.deps_read().inputs_of.get(owner).map(|(inputs, _)| inputs.clone()).unwrap_or_default()
    }

    fn statuses_read(&self) -> std::sync::RwLockReadGuard<'_, FxHashMap<ResourceRef, ControllerStatus>> {
        self.statuses.read().unwrap_or_else(|e| e.into_inner())
    }

    fn statuses_write(&self) -> std::sync::RwLockWriteGuard<'_, FxHashMap<ResourceRef, ControllerStatus>> {
        self.statuses.write().unwrap_or_else(|e| e.into_inner())
    }

    fn deps_read(&self) -> std::sync::RwLockReadGuard<'_, Dependencies> { self.deps.read().unwrap_or_else(|e| e.into_inner()) }

    fn deps_write(&self) -> std::sync::RwLockWriteGuard<'_, Dependencies> {
        self.deps.write().unwrap_or_else(|e| e.into_inner())
    }

    fn seen(&self) -> MutexGuard<'_, FxHashMap<ResourceRef, Fingerprint>> { self.seen.lock().unwrap_or_else(|e| e.into_inner()) }

    fn set_status(&self, key: &ResourceRef, phase: Phase, attempts: u32, fingerprint: Option<Fingerprint>) {
        let mut st = self.statuses_write();
        let entry = st.entry(key.clone()).or_insert_with(ControllerStatus::pending);
        entry.phase = phase;
        entry.attempts = attempts;
        if fingerprint.is_some() {
            entry.fingerprint = fingerprint;
        }
        entry.updated_at = Utc::now();
    }

    fn mark_pending(&self, key: &ResourceRef) {
        let mut st = self.statuses_write();
        let entry = st.entry(key.clone()).or_insert_with(ControllerStatus::pending);
        if entry.phase != Phase::Reconciling {
            entry.phase = Phase::Pending;
            entry.attempts = 0;
            entry.updated_at = Utc::now();
        }
    }

    /// Turn a store change into reconcile requests: the ref itself when its kind is
    /// handled, plus every owner that derived from that kind. Writes that leave the
    /// content fingerprint unchanged (status updates) are ignored.
    /// Returns how many refs were notified.
    pub fn handle_event(&self, ev: &ChangeEvent) -> usize {
        let reason = match ev.change {
            ChangeKind::Deleted => {
                self.seen().remove(&ev.key);
                Reason::Deleted
            }
            ChangeKind::Created | ChangeKind::Updated => {
                if let Some(fp) = ev.fingerprint {
                    let mut seen = self.seen();
                    if seen.get(&ev.key) == Some(&fp) {
                        trace!(key = %ev.key, "content unchanged; event ignored");
                        return 0;
                    }
                    seen.insert(ev.key.clone(), fp);
                }
                if ev.change == ChangeKind::Created {
                    Reason::Created
                } else {
                    Reason::Updated
                }
            }
        };

        let mut notified = 0;
        if self.handles(&ev.key.kind) {
            self.mark_pending(&ev.key);
            self.queue.enqueue(ev.key.clone(), reason);
            notified += 1;
        }
        let owners = self.deps_read().owners_of(&ev.key);
        for owner in owners {
            self.mark_pending(&owner);
            self.queue.enqueue(owner, Reason::Dependency(ev.key.clone()));
            notified += 1;
        }
        notified
    }

    /// Queue every stored resource of a handled kind.
    pub fn resync(&self) -> usize {
        let mut n = 0;
        for kind in self.kinds() {
            for r in self.store.list(kind, &LabelSelector::everything()) {
                let key = r.key();
                self.seen().insert(key.clone(), r.content_fingerprint());
                self.mark_pending(&key);
                self.queue.enqueue(key, Reason::Resync);
                n += 1;
            }
        }
        info!(count = n, "resync queued");
        n
    }

    /// Run one reconcile pass for a dequeued request and release the lease.
    pub async fn process(&self, lease: Lease) {
        let key = lease.key.clone();
        let Some(rec) = self.reconcilers.get(&key.kind).cloned() else {
            debug!(%key, "no reconciler for kind");
            lease.done();
            return;
        };
        let change = lease.has_change();
        let attempts = {
            let mut st = self.statuses_write();
            let entry = st.entry(key.clone()).or_insert_with(ControllerStatus::pending);
            if !change && entry.is_absorbing() {
                debug!(%key, reasons = ?lease.reasons, "settled; request ignored");
                drop(st);
                lease.done();
                return;
            }
            if change {
                entry.attempts = 0;
            }
            entry.phase = Phase::Reconciling;
            entry.updated_at = Utc::now();
            entry.attempts
        };

        let Some((desired, version)) = self.store.get_versioned(&key) else {
            self.removed(rec.as_ref(), &key).await;
            lease.done();
            return;
        };

        let started = Instant::now();
        let outcome = self.run(rec.as_ref(), &key, desired, version).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        histogram!("reconcile_latency_ms", elapsed_ms as f64);

        match outcome {
            Ok(pass) => {
                counter!("reconcile_total", 1u64, "outcome" => "success");
                self.set_status(&key, Phase::Succeeded, 0, Some(pass.fingerprint));
                self.sink.emit(EngineEvent::Reconciled { key: key.clone(), actions: pass.actions, elapsed_ms });
                if let Some(delay) = pass.requeue {
                    self.queue.enqueue_after(key.clone(), delay, Reason::Resync);
                }
            }
            Err(PassError::Conflict) => {
                counter!("reconcile_total", 1u64, "outcome" => "conflict");
                self.set_status(&key, Phase::Pending, attempts, None);
                self.sink.emit(EngineEvent::Conflict { key: key.clone() });
                self.queue.enqueue(key.clone(), Reason::Conflict);
            }
            Err(PassError::Failed(reason)) => self.failed(&key, attempts, reason, false),
            Err(PassError::Fatal(reason)) => self.failed(&key, attempts, reason, true),
        }
        lease.done();
    }

    fn failed(&self, key: &ResourceRef, attempts: u32, reason: String, fatal: bool) {
        counter!("reconcile_total", 1u64, "outcome" => "failure");
        let attempts = attempts.saturating_add(1);
        let terminal = fatal || attempts >= self.policy.max_attempts;
        let retry = if terminal { None } else { Some(self.policy.backoff.delay(attempts)) };
        if terminal {
            counter!("reconcile_terminal_total", 1u64);
        }
        self.set_status(key, Phase::Failed { reason: reason.clone(), terminal }, attempts, None);
        self.sink.emit(EngineEvent::ReconcileFailed {
            key: key.clone(),
            reason,
            attempts,
            terminal,
            retry_in_ms: retry.map(|d| d.as_millis() as u64),
        });
        if let Some(delay) = retry {
            self.queue.enqueue_after(key.clone(), delay, Reason::Retry(attempts));
        }
    }

    async fn removed(&self, rec: &dyn Reconciler, key: &ResourceRef) {
        if let Err(e) = rec.on_removed(key).await {
            warn!(%key, error = %format!("{:#}", e), "removal hook failed");
        }
        self.statuses_write().remove(key);
        self.deps_write().forget(key);
        self.sink.emit(EngineEvent::Removed { key: key.clone() });
    }

    async fn run(&self, rec: &dyn Reconciler, key: &ResourceRef, desired: Arc<Resource>, mut seen: u64) -> Result<Pass, PassError> {
        let observed = rec.observe(&desired).await.map_err(|e| PassError::Failed(format!("observe: {:#}", e)))?;
        let ctx = ReconcileContext::new(key, seen, &self.store, &self.services);
        let actions = if desired.is_deleting() {
            rec.finalize(&ctx, &desired, observed.as_ref()).await
        } else {
            rec.reconcile(&ctx, &desired, observed.as_ref()).await
        }
        .map_err(|e| PassError::Failed(format!("{:#}", e)))?;

        let count = actions.len();
        let mut requeue = None;
        for action in actions {
            trace!(%key, ?action, "apply");
            match action {
                Action::Put(resource) if resource.key() == *key => {
                    seen = self.store.put_at(resource, seen).map_err(store_err)?;
                }
                Action::Put(resource) => {
                    self.store.put(resource).map_err(store_err)?;
                }
                Action::Delete(target) => match self.store.delete(&target) {
                    Ok(v) if target == *key => seen = v,
                    Ok(_) | Err(KeelError::NotFound(_)) => {}
                    Err(e) => return Err(store_err(e)),
                },
                Action::SetStatus(status) => {
                    seen = self.store.put_status(key, status).map_err(store_err)?;
                }
                Action::Derive { outputs } => self.derive(key, &desired, outputs).await?,
                Action::Requeue(delay) => requeue = Some(delay),
            }
        }
        Ok(Pass { actions: count, requeue, fingerprint: desired.content_fingerprint() })
    }

    async fn derive(&self, key: &ResourceRef, desired: &Resource, outputs: Vec<String>) -> Result<(), PassError> {
        let client = self.rules.as_ref().ok_or_else(|| PassError::Failed("no rule service configured".into()))?;
        let report = client.derive(outputs, Some(key.clone())).await.map_err(rules_err)?;
        self.sink.emit(EngineEvent::rules_executed(Some(key.clone()), &report));

        let inputs: Vec<ResourceRef> = {
            let mut all: Vec<ResourceRef> = report.inputs.values().flatten().cloned().collect();
            all.sort();
            all.dedup();
            all
        };
        self.deps_write().record(key, inputs, report.selected_kinds.iter().cloned().collect());

        for (rule, out) in &report.outputs {
            self.store.put(derived_resource(desired, rule, out)).map_err(store_err)?;
        }

        if report.is_success() {
            return Ok(());
        }
        let mut parts: Vec<String> = report
            .failed
            .iter()
            .map(|(rule, reason)| KeelError::RuleExecution { rule: rule.clone(), reason: reason.clone() }.to_string())
            .collect();
        if !report.blocked.is_empty() {
            parts.push(format!("blocked: {}", report.blocked.iter().cloned().collect::<Vec<_>>().join(", ")));
        }
        Err(PassError::Failed(parts.join("; ")))
    }
}

/// The resource a rule output is stored as, in the owner's namespace.
fn derived_resource(owner: &Resource, rule: &str, out: &RuleOutput) -> Resource {
    let mut r = Resource::new(DERIVED_API_VERSION, out.output_type.clone(), rule)
        .with_label(DERIVED_BY_LABEL, rule)
        .with_spec((*out.value).clone());
    r.metadata.namespace = owner.metadata.namespace.clone();
    r
}
