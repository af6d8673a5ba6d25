use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use keel_controller::{Action, DiffSummary, EngineEvent, MemorySink, Phase, ReconcileContext, Reconciler};
use keel_core::{KeelError, Resource, ResourceRef};
use keel_rules::{NodeStatus, Rule, Selector};
use keel_runtime::{Engine, EngineBuilder, EngineConfig};
use keel_schema::KindInfo;
use serde_json::{json, Value};

/// Copies `spec` into `status`; converged when they match.
struct FileReconciler {
    calls: AtomicUsize,
}

#[async_trait]
impl Reconciler for FileReconciler {
    fn kind(&self) -> &str { "File" }

    async fn reconcile(&self, _ctx: &ReconcileContext<'_>, desired: &Resource, observed: Option<&Value>) -> Result<Vec<Action>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if observed == Some(&desired.spec) {
            return Ok(Vec::new());
        }
        Ok(vec![Action::SetStatus(desired.spec.clone())])
    }
}

/// Asks for the doubled sum of every Number.
struct ReportReconciler;

#[async_trait]
impl Reconciler for ReportReconciler {
    fn kind(&self) -> &str { "Report" }

    async fn reconcile(&self, _ctx: &ReconcileContext<'_>, _desired: &Resource, _observed: Option<&Value>) -> Result<Vec<Action>> {
        Ok(vec![Action::Derive { outputs: vec!["Doubled".into()] }])
    }
}

fn double_rule(calls: Arc<AtomicUsize>) -> Rule {
    Rule::new("double", [Selector::kind("Number")], "Doubled", move |inputs| {
        calls.fetch_add(1, Ordering::SeqCst);
        let sum: i64 = inputs.of_kind("Number").filter_map(|r| r.spec["value"].as_i64()).sum();
        Ok(json!({ "value": sum * 2 }))
    })
}

fn config() -> EngineConfig {
    EngineConfig {
        workers: 2,
        rule_workers: 2,
        max_attempts: 3,
        reconcile_backoff: keel_core::Backoff::new(Duration::from_millis(5), Duration::from_millis(20)),
        ..EngineConfig::default()
    }
}

fn builder() -> EngineBuilder {
    Engine::builder(config())
        .kind(KindInfo::namespaced("v1", "File"))
        .kind(KindInfo::namespaced("v1", "Report"))
        .kind(KindInfo::cluster("v1", "Number"))
}

/// Poll until `cond` holds, failing after two seconds.
async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_controller_converges_without_rules() {
    let calls = Arc::new(AtomicUsize::new(0));
    let rec = Arc::new(FileReconciler { calls: AtomicUsize::new(0) });
    let sink = Arc::new(MemorySink::new());
    let engine = builder().reconciler(rec.clone()).rule(double_rule(Arc::clone(&calls))).sink(sink.clone()).start().unwrap();

    engine
        .apply("apiVersion: v1\nkind: File\nmetadata:\n  name: motd\nspec:\n  content: hello\n")
        .unwrap();
    let key = ResourceRef::namespaced("File", "default", "motd");
    eventually("File to converge", || {
        engine.status(&key).map(|s| s.phase == Phase::Succeeded).unwrap_or(false)
            && engine.store().get(&key).map(|r| r.status.is_some()).unwrap_or(false)
    })
    .await;

    assert_eq!(engine.store().get(&key).unwrap().status, Some(json!({ "content": "hello" })));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(sink.events_for(&key).iter().any(|(_, e)| matches!(e, EngineEvent::Reconciled { .. })));
    engine.shutdown().await;
}

#[tokio::test]
async fn cycles_fail_at_start() {
    let err = builder()
        .rule(Rule::new("a", [Selector::output("Y")], "X", |_| Ok(json!(1))))
        .rule(Rule::new("b", [Selector::output("X")], "Y", |_| Ok(json!(2))))
        .start()
        .err()
        .unwrap();
    match err {
        KeelError::Cycle { rules } => {
            assert!(rules.contains(&"a".to_string()) && rules.contains(&"b".to_string()), "{:?}", rules);
        }
        other => panic!("expected a cycle, got {:?}", other),
    }
}

#[tokio::test]
async fn duplicate_reconcilers_fail_at_start() {
    let err = builder()
        .reconciler(Arc::new(ReportReconciler))
        .reconciler(Arc::new(ReportReconciler))
        .start()
        .err()
        .unwrap();
    assert!(matches!(err, KeelError::Config(_)), "{:?}", err);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn derive_follows_store_changes_and_reuses() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = builder().rule(double_rule(Arc::clone(&calls))).start().unwrap();

    engine.apply("apiVersion: v1\nkind: Number\nmetadata:\n  name: n1\nspec:\n  value: 21\n").unwrap();
    let report = engine.derive(&["Doubled"]).await.unwrap();
    assert_eq!(report.output("double"), Some(&json!({ "value": 42 })));
    assert_eq!(report.status("double"), Some(NodeStatus::Executed));

    let again = engine.derive(&["Doubled"]).await.unwrap();
    assert_eq!(again.status("double"), Some(NodeStatus::Reused));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    engine.apply_resource(Resource::new("v1", "Number", "n2").with_spec(json!({ "value": 4 }))).unwrap();
    let report = engine.derive(&[]).await.unwrap();
    assert_eq!(report.output("double"), Some(&json!({ "value": 50 })));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(engine.graph().node("double").unwrap().resources.len(), 2);

    let err = engine.derive(&["Missing"]).await.unwrap_err();
    assert!(matches!(err, KeelError::Config(_)), "{:?}", err);
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalidation_forces_the_next_run() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = builder().rule(double_rule(Arc::clone(&calls))).start().unwrap();
    engine.apply_resource(Resource::new("v1", "Number", "n1").with_spec(json!({ "value": 1 }))).unwrap();

    engine.derive(&[]).await.unwrap();
    assert!(engine.invalidate_rule("double").unwrap() >= 1);
    let report = engine.derive(&[]).await.unwrap();
    assert_eq!(report.status("double"), Some(NodeStatus::Executed));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    assert!(matches!(engine.invalidate_rule("nope"), Err(KeelError::Config(_))));
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconcilers_derive_through_the_rule_service() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = builder()
        .rule(double_rule(Arc::clone(&calls)))
        .reconciler(Arc::new(ReportReconciler))
        .start()
        .unwrap();

    engine.apply_resource(Resource::new("v1", "Number", "n1").with_spec(json!({ "value": 3 }))).unwrap();
    engine.apply_resource(Resource::new("v1", "Report", "weekly")).unwrap();
    let derived = ResourceRef::namespaced("Doubled", "default", "double");
    eventually("derived output", || engine.store().get(&derived).is_ok()).await;
    assert_eq!(engine.store().get(&derived).unwrap().spec, json!({ "value": 6 }));

    // a new Number re-triggers the owner and the output follows
    engine.apply_resource(Resource::new("v1", "Number", "n2").with_spec(json!({ "value": 5 }))).unwrap();
    eventually("re-derived output", || {
        engine.store().get(&derived).map(|r| r.spec == json!({ "value": 16 })).unwrap_or(false)
    })
    .await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn apply_rejects_bad_documents_before_writing() {
    let engine = builder().start().unwrap();

    let unknown = engine.apply("apiVersion: v1\nkind: Widget\nmetadata:\n  name: w\n");
    assert!(matches!(unknown, Err(KeelError::Validation { .. })));

    // the second document is invalid, so the first is not written either
    let mixed = "apiVersion: v1\nkind: Number\nmetadata:\n  name: ok\n---\napiVersion: v1\nkind: Number\nmetadata:\n  name: Not_Valid\n";
    assert!(engine.apply(mixed).is_err());

    let mut with_status = Resource::new("v1", "Number", "s");
    with_status.status = Some(json!({ "ready": true }));
    assert!(matches!(engine.apply_resource(with_status), Err(KeelError::Validation { .. })));

    assert!(engine.store().is_empty());
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn soft_delete_is_finalized_by_the_controller() {
    let sink = Arc::new(MemorySink::new());
    let engine = builder()
        .reconciler(Arc::new(FileReconciler { calls: AtomicUsize::new(0) }))
        .sink(sink.clone())
        .start()
        .unwrap();
    let key = ResourceRef::namespaced("File", "default", "tmp");
    engine.apply_resource(Resource::new("v1", "File", "tmp").with_spec(json!({ "content": "x" }))).unwrap();
    eventually("File to converge", || engine.status(&key).map(|s| s.phase == Phase::Succeeded).unwrap_or(false)).await;

    engine.delete(&key, false).unwrap();
    eventually("finalized removal", || engine.store().get(&key).is_err()).await;
    eventually("removed event", || {
        sink.events_for(&key).iter().any(|(_, e)| matches!(e, EngineEvent::Removed { .. }))
    })
    .await;

    assert!(matches!(engine.delete(&key, true), Err(KeelError::NotFound(_))));
    engine.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_every_task() {
    let engine = builder().rule(double_rule(Arc::new(AtomicUsize::new(0)))).start().unwrap();
    engine.shutdown().await;

    assert!(engine.queue().is_shutdown());
    assert!(matches!(engine.derive(&[]).await, Err(KeelError::Shutdown)));
    // a second shutdown has nothing left to join
    engine.shutdown().await;
}

#[tokio::test]
async fn engines_are_independent() {
    let one = builder().start().unwrap();
    let two = builder().start().unwrap();
    one.apply_resource(Resource::new("v1", "Number", "only-here")).unwrap();
    assert_eq!(one.store().len(), 1);
    assert!(two.store().is_empty());
    one.shutdown().await;
    two.shutdown().await;
}

/// Derives like `ReportReconciler`, but only after a slow external call.
struct SlowReport {
    started: AtomicBool,
}

#[async_trait]
impl Reconciler for SlowReport {
    fn kind(&self) -> &str { "Report" }

    async fn reconcile(&self, _ctx: &ReconcileContext<'_>, _desired: &Resource, _observed: Option<&Value>) -> Result<Vec<Action>> {
        self.started.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(vec![Action::Derive { outputs: vec!["Doubled".into()] }])
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_lets_in_flight_passes_derive() {
    let rec = Arc::new(SlowReport { started: AtomicBool::new(false) });
    let engine = builder().rule(double_rule(Arc::new(AtomicUsize::new(0)))).reconciler(rec.clone()).start().unwrap();
    engine.apply_resource(Resource::new("v1", "Number", "n1").with_spec(json!({ "value": 3 }))).unwrap();
    engine.apply_resource(Resource::new("v1", "Report", "weekly")).unwrap();
    eventually("slow pass to start", || rec.started.load(Ordering::SeqCst)).await;

    engine.shutdown().await;

    let key = ResourceRef::namespaced("Report", "default", "weekly");
    assert_eq!(engine.status(&key).map(|s| s.phase), Some(Phase::Succeeded));
    let derived = ResourceRef::namespaced("Doubled", "default", "double");
    assert_eq!(engine.store().get(&derived).unwrap().spec, json!({ "value": 6 }));
    assert!(matches!(engine.derive(&[]).await, Err(KeelError::Shutdown)));
}

/// Template shared by every `Greeting`.
struct Salutation(&'static str);

struct GreetingReconciler;

#[async_trait]
impl Reconciler for GreetingReconciler {
    fn kind(&self) -> &str { "Greeting" }

    async fn reconcile(&self, ctx: &ReconcileContext<'_>, desired: &Resource, observed: Option<&Value>) -> Result<Vec<Action>> {
        let salutation = ctx.service::<Salutation>().ok_or_else(|| anyhow::anyhow!("no salutation registered"))?;
        let text = json!({ "text": format!("{}, {}", salutation.0, desired.spec["to"].as_str().unwrap_or("world")) });
        if observed == Some(&text) {
            return Ok(Vec::new());
        }
        Ok(vec![Action::SetStatus(text)])
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn services_registered_on_the_builder_reach_reconcilers() {
    let engine = builder()
        .kind(KindInfo::namespaced("v1", "Greeting"))
        .service("Greeting", Arc::new(Salutation("Hello")))
        .reconciler(Arc::new(GreetingReconciler))
        .start()
        .unwrap();
    let key = ResourceRef::namespaced("Greeting", "default", "ada");
    engine.apply_resource(Resource::new("v1", "Greeting", "ada").with_spec(json!({ "to": "Ada" }))).unwrap();
    eventually("greeting status", || engine.store().get(&key).map(|r| r.status.is_some()).unwrap_or(false)).await;
    assert_eq!(engine.store().get(&key).unwrap().status, Some(json!({ "text": "Hello, Ada" })));
    engine.shutdown().await;

    let err = builder()
        .service("Greeting", Arc::new(Salutation("Hello")))
        .service("Greeting", Arc::new(Salutation("Hi")))
        .start()
        .err()
        .unwrap();
    assert!(matches!(err, KeelError::Config(_)), "{:?}", err);
}

#[tokio::test]
async fn apply_reports_what_changed() {
    let engine = builder().start().unwrap();
    let first = engine.apply_resource(Resource::new("v1", "Number", "n1").with_spec(json!({ "value": 1 }))).unwrap();
    assert!(first.created);
    assert_eq!(first.key, ResourceRef::new("Number", "n1"));

    let same = engine.apply("apiVersion: v1\nkind: Number\nmetadata:\n  name: n1\nspec:\n  value: 1\n").unwrap();
    assert_eq!(same.len(), 1);
    assert!(same[0].is_unchanged());
    assert_eq!(same[0].version, first.version);

    let changed = engine
        .apply_resource(Resource::new("v1", "Number", "n1").with_label("tier", "gold").with_spec(json!({ "value": 2 })))
        .unwrap();
    assert!(!changed.created);
    assert_eq!(changed.diff, DiffSummary { adds: 1, updates: 1, removes: 0 });
    assert!(changed.version > first.version);
    engine.shutdown().await;
}
