//! Concurrent rule execution.
//!
//! A node becomes ready once all its producers have succeeded. Ready nodes are
//! fingerprinted over their resolved resources and upstream outputs; cache hits are
//! reused, misses run on the blocking pool under a shared worker bound. A failure
//! blocks every transitive dependent while unrelated branches keep running.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use keel_core::{Fingerprint, Fingerprinter, ResourceRef};
use metrics::{counter, histogram};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::{CacheEntry, Outcome, RuleCache};
use crate::graph::{Node, RuleGraph};
use crate::{RuleInputs, Selector, UpstreamOutput};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    Executed,
    Reused,
    Failed(String),
    Blocked,
}

#[derive(Debug, Clone)]
pub struct RuleOutput {
    pub output_type: String,
    pub value: Arc<Value>,
    pub fingerprint: Fingerprint,
}

/// Per-node result of one pass over a graph. Every node lands in exactly one of
/// `executed`, `reused`, `failed` or `blocked`.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub executed: BTreeSet<String>,
    pub reused: BTreeSet<String>,
    pub failed: BTreeMap<String, String>,
    pub blocked: BTreeSet<String>,
    pub outputs: BTreeMap<String, RuleOutput>,
    /// Resources each node was evaluated over.
    pub inputs: BTreeMap<String, Vec<ResourceRef>>,
    /// Every kind named by a resource selector in the executed graph.
    pub selected_kinds: BTreeSet<String>,
}

impl ExecutionReport {
    pub fn status(&self, rule: &str) -> Option<NodeStatus> {
        if self.executed.contains(rule) {
            Some(NodeStatus::Executed)
        } else if self.reused.contains(rule) {
            Some(NodeStatus::Reused)
        } else if let Some(reason) = self.failed.get(rule) {
            Some(NodeStatus::Failed(reason.clone()))
        } else if self.blocked.contains(rule) {
            Some(NodeStatus::Blocked)
        } else {
            None
        }
    }

    pub fn is_success(&self) -> bool { self.failed.is_empty() && self.blocked.is_empty() }

    pub fn output(&self, rule: &str) -> Option<&Value> { self.outputs.get(rule).map(|o| o.value.as_ref()) }

    pub fn len(&self) -> usize { self.executed.len() + self.reused.len() + self.failed.len() + self.blocked.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// One-line summary for logs and CLI output.
    pub fn summary(&self) -> String {
        format!(
            "executed={} reused={} failed={} blocked={}",
            self.executed.len(),
            self.reused.len(),
            self.failed.len(),
            self.blocked.len()
        )
    }
}

enum TaskResult {
    Ran(CacheEntry),
    /// Another execution filled the cache while we waited for the claim.
    Found(CacheEntry),
}

#[derive(Clone)]
pub struct RuleEngine {
    cache: Arc<RuleCache>,
    permits: Arc<Semaphore>,
    workers: usize,
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine").field("workers", &self.workers).finish()
    }
}

impl RuleEngine {
    /// `workers` bounds concurrent rule invocations across every `execute` sharing this engine.
    pub fn new(cache: Arc<RuleCache>, workers: usize) -> Self {
        let workers = workers.max(1);
        Self { cache, permits: Arc::new(Semaphore::new(workers)), workers }
    }

    pub fn cache(&self) -> &Arc<RuleCache> { &self.cache }

    pub fn workers(&self) -> usize { self.workers }

    pub async fn execute(&self, graph: &RuleGraph) -> ExecutionReport {
        let started = std::time::Instant::now();
        let nodes = graph.nodes();
        let mut remaining: Vec<usize> = nodes.iter().map(|n| n.deps.len()).collect();
        let mut status: Vec<Option<NodeStatus>> = vec![None; nodes.len()];
        let mut results: Vec<Option<RuleOutput>> = vec![None; nodes.len()];
        let mut spawned = vec![false; nodes.len()];
        let mut ready: VecDeque<usize> = graph.order().iter().copied().filter(|&i| remaining[i] == 0).collect();
        let mut tasks: JoinSet<(usize, TaskResult)> = JoinSet::new();

        loop {
            while let Some(i) = ready.pop_front() {
                let node = &nodes[i];
                let id = node.rule.id();
                let (fp, upstream) = self.prepare(graph, node, &results);
                self.cache.mark_current(id, fp);
                match self.cache.lookup(id, &fp) {
                    Some(entry @ CacheEntry { outcome: Outcome::Success { .. }, .. }) => {
                        self.complete(graph, i, entry, NodeStatus::Reused, &mut status, &mut results, &mut remaining, &mut ready);
                    }
                    Some(CacheEntry { outcome: Outcome::Failure { reason, retry_at, .. }, .. }) if Instant::now() < retry_at => {
                        debug!(rule = id, "cached failure not yet due for retry");
                        status[i] = Some(NodeStatus::Failed(reason));
                        block_dependents(graph, i, &mut status);
                    }
                    _ => {
                        spawned[i] = true;
                        self.spawn(&mut tasks, i, node, fp, upstream);
                    }
                }
            }
            match tasks.join_next().await {
                None => break,
                Some(Ok((i, TaskResult::Ran(entry)))) => {
                    self.complete(graph, i, entry, NodeStatus::Executed, &mut status, &mut results, &mut remaining, &mut ready);
                }
                Some(Ok((i, TaskResult::Found(entry)))) => {
                    self.complete(graph, i, entry, NodeStatus::Reused, &mut status, &mut results, &mut remaining, &mut ready);
                }
                Some(Err(e)) => warn!(error = %e, "rule task aborted"),
            }
        }

        let mut report = ExecutionReport::default();
        for (i, node) in nodes.iter().enumerate() {
            let id = node.rule.id().to_string();
            report.inputs.insert(id.clone(), node.input_refs());
            for sel in node.rule.inputs() {
                if let Selector::Resources { kind, .. } = sel {
                    report.selected_kinds.insert(kind.clone());
                }
            }
            let st = status[i].take().unwrap_or_else(|| {
                if spawned[i] {
                    NodeStatus::Failed("aborted".into())
                } else {
                    NodeStatus::Blocked
                }
            });
            match st {
                NodeStatus::Executed => {
                    report.executed.insert(id.clone());
                }
                NodeStatus::Reused => {
                    report.reused.insert(id.clone());
                }
                NodeStatus::Failed(reason) => {
                    report.failed.insert(id.clone(), reason);
                }
                NodeStatus::Blocked => {
                    report.blocked.insert(id.clone());
                }
            }
            if let Some(out) = results[i].take() {
                report.outputs.insert(id, out);
            }
        }
        counter!("rules_executed_total", report.executed.len() as u64);
        counter!("rules_reused_total", report.reused.len() as u64);
        counter!("rules_failed_total", report.failed.len() as u64);
        counter!("rules_blocked_total", report.blocked.len() as u64);
        debug!(rules = nodes.len(), elapsed_ms = started.elapsed().as_millis() as u64, "{}", report.summary());
        report
    }

    /// Input fingerprint and upstream outputs for a node whose producers have all succeeded.
    fn prepare(&self, graph: &RuleGraph, node: &Node, results: &[Option<RuleOutput>]) -> (Fingerprint, Vec<UpstreamOutput>) {
        let mut fp = Fingerprinter::new();
        for r in &node.resources {
            fp = fp.member_fingerprint(r.key(), r.content_fingerprint());
        }
        let mut upstream = Vec::with_capacity(node.deps.len());
        for &d in &node.deps {
            let Some(out) = results[d].as_ref() else { continue };
            let producer = graph.nodes()[d].rule.id();
            fp = fp.member_fingerprint(format!("rule:{}", producer), out.fingerprint);
            upstream.push(UpstreamOutput {
                rule: producer.to_string(),
                output_type: out.output_type.clone(),
                value: Arc::clone(&out.value),
            });
        }
        (fp.finish(), upstream)
    }

    fn spawn(&self, tasks: &mut JoinSet<(usize, TaskResult)>, i: usize, node: &Node, fp: Fingerprint, outputs: Vec<UpstreamOutput>) {
        let cache = Arc::clone(&self.cache);
        let permits = Arc::clone(&self.permits);
        let func = node.rule.func();
        let id = node.rule.id().to_string();
        let inputs = RuleInputs { resources: node.resources.clone(), outputs };
        tasks.spawn(async move {
            let claim = cache.claim(&id, fp).await;
            if let Some(entry) = cache.lookup(&id, &fp) {
                let fresh = match &entry.outcome {
                    Outcome::Success { .. } => true,
                    Outcome::Failure { retry_at, .. } => Instant::now() < *retry_at,
                };
                if fresh {
                    return (i, TaskResult::Found(entry));
                }
            }
            let result = match permits.acquire_owned().await {
                Ok(_permit) => {
                    let started = std::time::Instant::now();
                    let res = match tokio::task::spawn_blocking(move || func(&inputs)).await {
                        Ok(Ok(v)) => Ok(v),
                        Ok(Err(e)) => Err(format!("{:#}", e)),
                        Err(_) => Err("rule panicked".to_string()),
                    };
                    histogram!("rule_exec_ms", started.elapsed().as_secs_f64() * 1000.0);
                    res
                }
                Err(_) => Err("executor closed".to_string()),
            };
            if let Err(reason) = &result {
                warn!(rule = %id, fingerprint = %fp, %reason, "rule failed");
            }
            let entry = cache.store(&id, fp, result);
            drop(claim);
            (i, TaskResult::Ran(entry))
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn complete(
        &self,
        graph: &RuleGraph,
        i: usize,
        entry: CacheEntry,
        ok_status: NodeStatus,
        status: &mut [Option<NodeStatus>],
        results: &mut [Option<RuleOutput>],
        remaining: &mut [usize],
        ready: &mut VecDeque<usize>,
    ) {
        let node = &graph.nodes()[i];
        match entry.outcome {
            Outcome::Success { value, output } => {
                status[i] = Some(ok_status);
                results[i] = Some(RuleOutput { output_type: node.rule.output().to_string(), value, fingerprint: output });
                for &d in &node.dependents {
                    remaining[d] -= 1;
                    if remaining[d] == 0 && status[d].is_none() {
                        ready.push_back(d);
                    }
                }
            }
            Outcome::Failure { reason, .. } => {
                status[i] = Some(NodeStatus::Failed(reason));
                block_dependents(graph, i, status);
            }
        }
    }
}

fn block_dependents(graph: &RuleGraph, i: usize, status: &mut [Option<NodeStatus>]) {
    for d in graph.downstream(i) {
        status[d].get_or_insert(NodeStatus::Blocked);
    }
}
