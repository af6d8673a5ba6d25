//! Keel rules: pure computation steps over resources, wired into a DAG by their
//! declared input selectors and output types, memoized by input fingerprint.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use keel_core::{LabelSelector, Resource};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod cache;
pub mod engine;
pub mod graph;

pub use cache::{CacheEntry, Outcome, RuleCache};
pub use engine::{ExecutionReport, NodeStatus, RuleEngine};
pub use graph::{Node, RuleGraph};

/// What a rule reads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Selector {
    /// Live store resources of a kind, optionally namespace- and label-filtered.
    Resources { kind: String, namespace: Option<String>, labels: LabelSelector },
    /// Outputs of every rule declaring this output type.
    Output(String),
}

impl Selector {
    pub fn kind(kind: impl Into<String>) -> Self {
        Selector::Resources { kind: kind.into(), namespace: None, labels: LabelSelector::everything() }
    }

    pub fn output(output_type: impl Into<String>) -> Self { Selector::Output(output_type.into()) }

    pub fn in_namespace(self, ns: impl Into<String>) -> Self {
        match self {
            Selector::Resources { kind, labels, .. } => Selector::Resources { kind, namespace: Some(ns.into()), labels },
            other => other,
        }
    }

    pub fn with_label(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        match self {
            Selector::Resources { kind, namespace, labels } => {
                Selector::Resources { kind, namespace, labels: labels.with(key, value) }
            }
            other => other,
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Resources { kind, namespace, labels } => {
                write!(f, "{}", kind)?;
                if let Some(ns) = namespace {
                    write!(f, " in {}", ns)?;
                }
                if !labels.is_empty() {
                    let parts: Vec<String> = labels.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                    write!(f, " [{}]", parts.join(","))?;
                }
                Ok(())
            }
            Selector::Output(t) => write!(f, "output:{}", t),
        }
    }
}

/// An upstream rule's output, as seen by a consumer.
#[derive(Debug, Clone)]
pub struct UpstreamOutput {
    pub rule: String,
    pub output_type: String,
    pub value: Arc<Value>,
}

/// Resolved inputs handed to a rule function.
#[derive(Debug, Clone, Default)]
pub struct RuleInputs {
    pub resources: Vec<Arc<Resource>>,
    pub outputs: Vec<UpstreamOutput>,
}

impl RuleInputs {
    pub fn of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Resource> + 'a {
        self.resources.iter().filter(move |r| r.kind == kind).map(|r| r.as_ref())
    }

    pub fn outputs_of<'a: 'b, 'b>(&'a self, output_type: &'b str) -> impl Iterator<Item = &'a Value> + 'b {
        self.outputs.iter().filter(move |o| o.output_type == output_type).map(|o| o.value.as_ref())
    }

    /// The only output of `output_type`; errors when there are zero or several.
    pub fn output(&self, output_type: &str) -> Result<&Value> {
        let mut it = self.outputs_of(output_type);
        match (it.next(), it.next()) {
            (Some(v), None) => Ok(v),
            (None, _) => Err(anyhow!("no upstream output of type {}", output_type)),
            _ => Err(anyhow!("several upstream outputs of type {}", output_type)),
        }
    }
}

pub type RuleFn = Arc<dyn Fn(&RuleInputs) -> Result<Value> + Send + Sync>;

/// A pure function descriptor. Must not have side effects beyond its output.
#[derive(Clone)]
pub struct Rule {
    id: String,
    inputs: Vec<Selector>,
    output: String,
    func: RuleFn,
}

impl Rule {
    pub fn new<F>(id: impl Into<String>, inputs: impl IntoIterator<Item = Selector>, output: impl Into<String>, func: F) -> Self
    where
        F: Fn(&RuleInputs) -> Result<Value> + Send + Sync + 'static,
    {
        Self { id: id.into(), inputs: inputs.into_iter().collect(), output: output.into(), func: Arc::new(func) }
    }

    pub fn id(&self) -> &str { &self.id }

    pub fn inputs(&self) -> &[Selector] { &self.inputs }

    pub fn output(&self) -> &str { &self.output }

    pub(crate) fn func(&self) -> RuleFn { Arc::clone(&self.func) }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule").field("id", &self.id).field("inputs", &self.inputs).field("output", &self.output).finish()
    }
}
