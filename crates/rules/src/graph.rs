//! Rule graph: an arena of nodes keyed by rule id.
//!
//! Rule-to-rule edges come from `Selector::Output` declarations, and from resource
//! selectors on a kind some rule outputs, and never change for the life of a graph. Resource edges are resolved against a store snapshot and
//! re-resolved lazily: `observe` marks nodes whose selectors cover a changed kind,
//! `refresh` re-resolves only those.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use keel_core::{ChangeEvent, KeelError, KeelResult, Resource, ResourceRef, Snapshot};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::{Rule, Selector};

#[derive(Debug, Clone)]
pub struct Node {
    pub rule: Rule,
    /// Producer nodes this node consumes outputs from.
    pub deps: Vec<usize>,
    pub dependents: Vec<usize>,
    /// Resources currently matching the node's selectors, ordered by ref.
    pub resources: Vec<Arc<Resource>>,
    dirty: bool,
}

impl Node {
    pub fn input_refs(&self) -> Vec<ResourceRef> { self.resources.iter().map(|r| r.key()).collect() }

    fn resolve(&mut self, snapshot: &Snapshot) {
        let mut seen: FxHashSet<ResourceRef> = FxHashSet::default();
        let mut out: Vec<Arc<Resource>> = Vec::new();
        for sel in self.rule.inputs() {
            if let Selector::Resources { kind, namespace, labels } = sel {
                for r in snapshot.matching(kind, namespace.as_deref(), labels) {
                    if seen.insert(r.key()) {
                        out.push(Arc::clone(r));
                    }
                }
            }
        }
        out.sort_by(|a, b| a.key().cmp(&b.key()));
        self.resources = out;
        self.dirty = false;
    }

    fn covers(&self, key: &ResourceRef) -> bool {
        self.rule.inputs().iter().any(|sel| match sel {
            Selector::Resources { kind, namespace, .. } => {
                *kind == key.kind && namespace.as_ref().map_or(true, |ns| key.namespace.as_ref() == Some(ns))
            }
            Selector::Output(_) => false,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RuleGraph {
    nodes: Vec<Node>,
    index: FxHashMap<String, usize>,
    order: Vec<usize>,
    resolved_at: u64,
}

impl RuleGraph {
    /// Build the graph and resolve every node against `snapshot`.
    ///
    /// Fails with `Config` for duplicate ids, self-consumption or outputs nobody
    /// produces, and with `Cycle` when rule outputs feed back into their own inputs.
    pub fn build(rules: impl IntoIterator<Item = Rule>, snapshot: &Snapshot) -> KeelResult<Self> {
        let mut nodes: Vec<Node> = Vec::new();
        let mut index: FxHashMap<String, usize> = FxHashMap::default();
        for rule in rules {
            if index.contains_key(rule.id()) {
                return Err(KeelError::Config(format!("duplicate rule id {}", rule.id())));
            }
            index.insert(rule.id().to_string(), nodes.len());
            nodes.push(Node { rule, deps: Vec::new(), dependents: Vec::new(), resources: Vec::new(), dirty: true });
        }

        let mut producers: FxHashMap<&str, Vec<usize>> = FxHashMap::default();
        for (i, n) in nodes.iter().enumerate() {
            producers.entry(n.rule.output()).or_default().push(i);
        }

        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        for (i, n) in nodes.iter().enumerate() {
            for sel in n.rule.inputs() {
                let ps = match sel {
                    Selector::Output(t) => producers.get(t.as_str()).ok_or_else(|| {
                        KeelError::Config(format!("rule {} selects output {} but no rule produces it", n.rule.id(), t))
                    })?,
                    // derived outputs are stored as resources of the output type
                    Selector::Resources { kind, .. } => match producers.get(kind.as_str()) {
                        Some(ps) => ps,
                        None => continue,
                    },
                };
                if ps.contains(&i) {
                    return Err(KeelError::Config(format!("rule {} consumes its own output {}", n.rule.id(), n.rule.output())));
                }
                deps[i].extend(ps.iter().copied());
            }
        }
        for (i, mut d) in deps.into_iter().enumerate() {
            d.sort_unstable();
            d.dedup();
            for &p in &d {
                nodes[p].dependents.push(i);
            }
            nodes[i].deps = d;
        }

        let order = topo_order(&nodes)?;
        let mut graph = Self { nodes, index, order, resolved_at: 0 };
        graph.refresh(snapshot);
        debug!(rules = graph.len(), version = snapshot.version, "rule graph built");
        Ok(graph)
    }

    pub fn len(&self) -> usize { self.nodes.len() }

    pub fn is_empty(&self) -> bool { self.nodes.is_empty() }

    pub fn nodes(&self) -> &[Node] { &self.nodes }

    pub fn node(&self, id: &str) -> Option<&Node> { self.index.get(id).map(|&i| &self.nodes[i]) }

    /// Node indices in dependency order.
    pub fn order(&self) -> &[usize] { &self.order }

    /// Store version the graph was last resolved against.
    pub fn resolved_at(&self) -> u64 { self.resolved_at }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> + '_ { self.nodes.iter().map(|n| &n.rule) }

    /// Mark nodes whose resource selectors cover the changed ref. Returns whether any did.
    pub fn observe(&mut self, ev: &ChangeEvent) -> bool {
        let mut any = false;
        for n in self.nodes.iter_mut().filter(|n| n.covers(&ev.key)) {
            n.dirty = true;
            any = true;
        }
        any
    }

    pub fn is_dirty(&self) -> bool { self.nodes.iter().any(|n| n.dirty) }

    /// Re-resolve dirty nodes against `snapshot`. Returns how many were refreshed.
    pub fn refresh(&mut self, snapshot: &Snapshot) -> usize {
        let mut count = 0;
        for n in self.nodes.iter_mut().filter(|n| n.dirty) {
            n.resolve(snapshot);
            count += 1;
        }
        self.resolved_at = snapshot.version;
        count
    }

    /// Rule ids that transitively consume the output of `id` (excluding `id`).
    pub fn downstream_of(&self, id: &str) -> BTreeSet<String> {
        let Some(&start) = self.index.get(id) else { return BTreeSet::new() };
        self.downstream(start).into_iter().map(|i| self.nodes[i].rule.id().to_string()).collect()
    }

    pub(crate) fn downstream(&self, start: usize) -> Vec<usize> {
        let mut seen = vec![false; self.nodes.len()];
        let mut out = Vec::new();
        let mut stack = self.nodes[start].dependents.clone();
        while let Some(i) = stack.pop() {
            if !std::mem::replace(&mut seen[i], true) {
                out.push(i);
                stack.extend(self.nodes[i].dependents.iter().copied());
            }
        }
        out
    }

    /// The subgraph needed to produce the given output types: their producers and
    /// everything those transitively consume.
    pub fn reduce(&self, outputs: &[&str]) -> KeelResult<RuleGraph> {
        let mut keep: BTreeSet<usize> = BTreeSet::new();
        let mut stack: Vec<usize> = Vec::new();
        for t in outputs {
            let producers: Vec<usize> = (0..self.nodes.len()).filter(|&i| self.nodes[i].rule.output() == *t).collect();
            if producers.is_empty() {
                return Err(KeelError::Config(format!("no rule produces output {}", t)));
            }
            stack.extend(producers);
        }
        while let Some(i) = stack.pop() {
            if keep.insert(i) {
                stack.extend(self.nodes[i].deps.iter().copied());
            }
        }

        let remap: FxHashMap<usize, usize> = keep.iter().enumerate().map(|(new, &old)| (old, new)).collect();
        let mut nodes: Vec<Node> = Vec::with_capacity(keep.len());
        let mut index: FxHashMap<String, usize> = FxHashMap::default();
        for &old in &keep {
            let src = &self.nodes[old];
            index.insert(src.rule.id().to_string(), nodes.len());
            nodes.push(Node {
                rule: src.rule.clone(),
                deps: src.deps.iter().filter_map(|d| remap.get(d).copied()).collect(),
                dependents: src.dependents.iter().filter_map(|d| remap.get(d).copied()).collect(),
                resources: src.resources.clone(),
                dirty: src.dirty,
            });
        }
        let order = self.order.iter().filter_map(|o| remap.get(o).copied()).collect();
        Ok(RuleGraph { nodes, index, order, resolved_at: self.resolved_at })
    }
}

/// Kahn's algorithm with a deterministic (id-ordered) ready set.
fn topo_order(nodes: &[Node]) -> KeelResult<Vec<usize>> {
    let mut indegree: Vec<usize> = nodes.iter().map(|n| n.deps.len()).collect();
    let mut ready: BTreeSet<(&str, usize)> =
        (0..nodes.len()).filter(|&i| indegree[i] == 0).map(|i| (nodes[i].rule.id(), i)).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(first) = ready.iter().next().copied() {
        ready.remove(&first);
        let i = first.1;
        order.push(i);
        for &d in &nodes[i].dependents {
            indegree[d] -= 1;
            if indegree[d] == 0 {
                ready.insert((nodes[d].rule.id(), d));
            }
        }
    }
    if order.len() == nodes.len() {
        return Ok(order);
    }
    let remaining: FxHashSet<usize> = (0..nodes.len()).filter(|&i| indegree[i] > 0).collect();
    Err(KeelError::Cycle { rules: find_cycle(nodes, &remaining) })
}

/// Walk producer edges inside the unsorted remainder until a node repeats.
/// Every remaining node has at least one remaining producer, so the walk cannot stall.
fn find_cycle(nodes: &[Node], remaining: &FxHashSet<usize>) -> Vec<String> {
    let Some(&start) = remaining.iter().min() else { return Vec::new() };
    let mut path: Vec<usize> = Vec::new();
    let mut pos: FxHashMap<usize, usize> = FxHashMap::default();
    let mut cur = start;
    loop {
        if let Some(&at) = pos.get(&cur) {
            let mut cycle: Vec<String> = path[at..].iter().map(|&i| nodes[i].rule.id().to_string()).collect();
            // path follows consumer -> producer; report in data-flow order
            cycle.reverse();
            return cycle;
        }
        pos.insert(cur, path.len());
        path.push(cur);
        match nodes[cur].deps.iter().copied().find(|d| remaining.contains(d)) {
            Some(next) => cur = next,
            None => return path.iter().map(|&i| nodes[i].rule.id().to_string()).collect(),
        }
    }
}
