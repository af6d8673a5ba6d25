//! Keel runtime: one explicit engine context wiring store, queue, controller and rule service.
//!
//! The resolved rule graph is published through an `ArcSwap` by a single service task that
//! follows store events; reconcilers reach it over the controller's derive channel. Several
//! engines can run side by side in one process.

#![forbid(unsafe_code)]

mod config;

pub use config::EngineConfig;
pub use keel_controller::DiffSummary;

use std::any::Any;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use keel_controller::{
    diff_summary, Controller, ControllerStatus, DeriveRequest, EventSink, Reconciler, RetryPolicy, RuleClient,
    ServiceRegistry, TracingSink,
};
use keel_core::{KeelError, KeelResult, Resource, ResourceRef};
use keel_queue::WorkQueue;
use keel_rules::{ExecutionReport, Rule, RuleCache, RuleEngine, RuleGraph};
use keel_schema::{Admission, AdmissionChain, DocumentSchema, Format, KindInfo, KindRegistry};
use keel_store::{ChangeStream, ResourceStore};
use metrics::{counter, gauge};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Collects everything an engine needs before `start`.
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<ResourceStore>>,
    rules: Vec<Rule>,
    reconcilers: Vec<Arc<dyn Reconciler>>,
    admission: AdmissionChain,
    kinds: Vec<KindInfo>,
    sink: Option<Arc<dyn EventSink>>,
    services: ServiceRegistry,
    service_error: Option<KeelError>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            rules: Vec::new(),
            reconcilers: Vec::new(),
            admission: AdmissionChain::new(),
            kinds: Vec::new(),
            sink: None,
            services: ServiceRegistry::new(),
            service_error: None,
        }
    }

    /// Use an existing (possibly persisted) store instead of a fresh in-memory one.
    pub fn store(mut self, store: Arc<ResourceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn reconciler(mut self, reconciler: Arc<dyn Reconciler>) -> Self {
        self.reconcilers.push(reconciler);
        self
    }

    pub fn admission(mut self, controller: Arc<dyn Admission>) -> Self {
        self.admission.push(controller);
        self
    }

    pub fn kind(mut self, info: KindInfo) -> Self {
        self.kinds.push(info);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Make `service` reachable from reconcilers of `kind` through their context.
    /// A second service of the same type for one kind fails `start`.
    pub fn service<T: Any + Send + Sync>(mut self, kind: impl Into<String>, service: Arc<T>) -> Self {
        if let Err(e) = self.services.register(kind, service) {
            self.service_error.get_or_insert(e);
        }
        self
    }

    /// Validate the configuration, build the rule graph and spawn the engine tasks.
    /// Must be called inside a tokio runtime. Cycles and duplicate registrations are fatal.
    pub fn start(self) -> KeelResult<Engine> {
        if let Some(e) = self.service_error {
            return Err(e);
        }
        let cfg = self.config;
        let store = self.store.unwrap_or_else(|| Arc::new(ResourceStore::with_shards(cfg.shards)));

        let mut registry = KindRegistry::new(cfg.default_namespace.clone());
        for info in self.kinds {
            registry.register(info)?;
        }
        let schema = DocumentSchema::new(registry, Format::Yaml);

        // Subscribe before the initial snapshot so no write falls between them.
        let rule_events = store.subscribe_all();
        let ctrl_events = store.subscribe_all();
        let graph = RuleGraph::build(self.rules, &store.snapshot())?;
        info!(rules = graph.len(), version = graph.resolved_at(), "rule graph built");

        let rule_engine = RuleEngine::new(Arc::new(RuleCache::new(cfg.rule_retry)), cfg.rule_workers);
        let published = Arc::new(ArcSwap::from_pointee(graph.clone()));
        let (client, requests) = RuleClient::channel(cfg.derive_capacity);

        let queue = WorkQueue::new();
        let sink = self.sink.unwrap_or_else(|| Arc::new(TracingSink));
        let mut controller = Controller::new(Arc::clone(&store), queue.clone(), sink)
            .with_policy(RetryPolicy { backoff: cfg.reconcile_backoff, max_attempts: cfg.max_attempts })
            .with_rules(client.clone())
            .with_services(Arc::new(self.services));
        for reconciler in self.reconcilers {
            controller.register(reconciler)?;
        }
        let controller = Arc::new(controller);

        let (stop_tx, stop_rx) = watch::channel(false);
        let services = vec![
            tokio::spawn(rule_service(
                Arc::clone(&store),
                rule_engine.clone(),
                Arc::clone(&published),
                graph,
                rule_events,
                requests,
                stop_rx.clone(),
            )),
            tokio::spawn(watch_store(Arc::clone(&controller), ctrl_events, stop_rx)),
        ];
        let workers: Vec<JoinHandle<()>> =
            (0..cfg.workers.max(1)).map(|worker| tokio::spawn(work(worker, Arc::clone(&controller), queue.clone()))).collect();

        let queued = controller.resync();
        info!(workers = cfg.workers, kinds = ?controller.kinds(), queued, "engine started");

        Ok(Engine {
            config: cfg,
            store,
            queue,
            controller,
            rule_engine,
            graph: published,
            rules: client,
            schema,
            admission: self.admission,
            stop: stop_tx,
            workers: Mutex::new(workers),
            services: Mutex::new(services),
        })
    }
}

/// Outcome of applying one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Applied {
    pub key: ResourceRef,
    pub version: u64,
    pub created: bool,
    /// Content changes relative to what was stored before.
    pub diff: DiffSummary,
}

impl Applied {
    pub fn is_unchanged(&self) -> bool { !self.created && self.diff.is_empty() }
}

/// A running engine. Call `shutdown` before dropping it; idle workers otherwise stay parked
/// on the queue until the runtime stops.
pub struct Engine {
    config: EngineConfig,
    store: Arc<ResourceStore>,
    queue: WorkQueue,
    controller: Arc<Controller>,
    rule_engine: RuleEngine,
    graph: Arc<ArcSwap<RuleGraph>>,
    rules: RuleClient,
    schema: DocumentSchema,
    admission: AdmissionChain,
    stop: watch::Sender<bool>,
    /// Queue workers; joined before the service tasks they call into.
    workers: Mutex<Vec<JoinHandle<()>>>,
    services: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder { EngineBuilder::new(config) }

    pub fn config(&self) -> &EngineConfig { &self.config }

    pub fn store(&self) -> &Arc<ResourceStore> { &self.store }

    pub fn queue(&self) -> &WorkQueue { &self.queue }

    pub fn controller(&self) -> &Arc<Controller> { &self.controller }

    pub fn rule_engine(&self) -> &RuleEngine { &self.rule_engine }

    pub fn schema(&self) -> &DocumentSchema { &self.schema }

    /// The graph as last resolved by the rule service.
    pub fn graph(&self) -> Arc<RuleGraph> { self.graph.load_full() }

    /// Parse a YAML/JSON manifest and put every resource it contains.
    /// All documents are validated before the first write.
    pub fn apply(&self, raw: &str) -> KeelResult<Vec<Applied>> {
        let admitted = self
            .schema
            .parse_all(raw)?
            .into_iter()
            .map(|r| self.admit(r))
            .collect::<KeelResult<Vec<_>>>()?;
        admitted.into_iter().map(|r| self.write(r)).collect()
    }

    /// Validate, admit and put one resource. Status belongs to controllers and is refused here.
    pub fn apply_resource(&self, resource: Resource) -> KeelResult<Applied> {
        let resource = self.schema.registry().normalize(resource)?;
        let resource = self.admit(resource)?;
        self.write(resource)
    }

    fn write(&self, resource: Resource) -> KeelResult<Applied> {
        let key = resource.key();
        let target = resource.content();
        let previous = self.store.get(&key).ok();
        let version = self.store.put(resource)?;
        let diff = match &previous {
            Some(prev) => diff_summary(&target, &prev.content()),
            None => diff_summary(&target, &json!({})),
        };
        let applied = Applied { key, version, created: previous.is_none(), diff };
        let outcome = if applied.created {
            "created"
        } else if applied.is_unchanged() {
            "unchanged"
        } else {
            "configured"
        };
        counter!("engine_apply_outcome_total", 1u64, "outcome" => outcome);
        debug!(key = %applied.key, version, outcome, adds = diff.adds, updates = diff.updates, removes = diff.removes, "applied");
        Ok(applied)
    }

    fn admit(&self, resource: Resource) -> KeelResult<Resource> {
        if resource.status.is_some() {
            return Err(KeelError::validation(resource.key().to_string(), "status cannot be set on apply"));
        }
        let admitted = self.admission.admit(resource)?;
        counter!("engine_apply_total", 1u64);
        Ok(admitted)
    }

    /// Without `force` the resource is only marked; its controller finalizes it.
    pub fn delete(&self, key: &ResourceRef, force: bool) -> KeelResult<u64> {
        if force {
            self.store.delete(key)
        } else {
            self.store.mark_deleted(key)
        }
    }

    /// Run the rules producing `outputs` (all rules when empty) against current state.
    pub async fn derive(&self, outputs: &[&str]) -> KeelResult<ExecutionReport> {
        self.rules.derive(outputs.iter().map(|s| s.to_string()).collect(), None).await
    }

    /// Drop cached results of one rule, forcing its next execution. For rule definition changes.
    /// Downstream rules are unaffected: they rerun only if the new output differs.
    pub fn invalidate_rule(&self, id: &str) -> KeelResult<usize> {
        let graph = self.graph();
        if graph.node(id).is_none() {
            return Err(KeelError::Config(format!("unknown rule {}", id)));
        }
        let dropped = self.rule_engine.cache().invalidate(id);
        info!(rule = %id, dropped, downstream = ?graph.downstream_of(id), "rule cache invalidated");
        Ok(dropped)
    }

    pub fn status(&self, key: &ResourceRef) -> Option<ControllerStatus> { self.controller.status(key) }

    /// Stop dequeuing and let in-flight reconciles finish, then stop the rule service and
    /// store watcher. Passes still running may derive, so the services outlive the workers.
    pub async fn shutdown(&self) {
        self.queue.shutdown();
        join(&self.workers).await;
        let _ = self.stop.send(true);
        join(&self.services).await;
        info!("engine stopped");
    }
}

async fn join(handles: &Mutex<Vec<JoinHandle<()>>>) {
    let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *handles.lock().unwrap_or_else(|e| e.into_inner()));
    for res in futures::future::join_all(handles).await {
        if let Err(e) = res {
            warn!(error = %e, "engine task ended abnormally");
        }
    }
}

/// Owns the working graph. Store events mark nodes dirty; dirty nodes are re-resolved and the
/// graph republished before the next derive request runs.
async fn rule_service(
    store: Arc<ResourceStore>,
    engine: RuleEngine,
    published: Arc<ArcSwap<RuleGraph>>,
    mut graph: RuleGraph,
    mut events: ChangeStream,
    mut requests: mpsc::Receiver<DeriveRequest>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            Some(ev) = events.recv() => {
                graph.observe(&ev);
            }
            req = requests.recv() => {
                let Some(req) = req else { break };
                while let Ok(ev) = events.try_recv() {
                    graph.observe(&ev);
                }
                if graph.is_dirty() {
                    let refreshed = graph.refresh(&store.snapshot());
                    published.store(Arc::new(graph.clone()));
                    debug!(refreshed, version = graph.resolved_at(), "rule graph republished");
                }
                let current = published.load_full();
                let engine = engine.clone();
                // Executions run concurrently; the cache serializes equal fingerprints.
                tokio::spawn(async move {
                    let wanted: Vec<&str> = req.outputs.iter().map(String::as_str).collect();
                    let result = if wanted.is_empty() {
                        Ok(engine.execute(&current).await)
                    } else {
                        match current.reduce(&wanted) {
                            Ok(reduced) => Ok(engine.execute(&reduced).await),
                            Err(e) => Err(e),
                        }
                    };
                    counter!("derive_requests_total", 1u64, "outcome" => if result.is_ok() { "ok" } else { "error" });
                    let _ = req.reply.send(result);
                });
            }
        }
    }
    debug!("rule service stopped");
}

async fn watch_store(controller: Arc<Controller>, mut events: ChangeStream, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            ev = events.recv() => match ev {
                Some(ev) => {
                    controller.handle_event(&ev);
                }
                None => break,
            },
        }
    }
    debug!("store watcher stopped");
}

async fn work(worker: usize, controller: Arc<Controller>, queue: WorkQueue) {
    gauge!("engine_workers_busy", 0.0, "worker" => worker.to_string());
    while let Some(lease) = queue.dequeue().await {
        gauge!("engine_workers_busy", 1.0, "worker" => worker.to_string());
        controller.process(lease).await;
        gauge!("engine_workers_busy", 0.0, "worker" => worker.to_string());
    }
    debug!(worker, "worker stopped");
}
