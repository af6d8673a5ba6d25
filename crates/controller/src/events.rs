//! Observability hook: structured engine events and the sinks that receive them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use keel_core::ResourceRef;
use keel_rules::ExecutionReport;
use serde::Serialize;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Reconciled { key: ResourceRef, actions: usize, elapsed_ms: u64 },
    ReconcileFailed { key: ResourceRef, reason: String, attempts: u32, terminal: bool, retry_in_ms: Option<u64> },
    /// A write raced with another writer; the ref was re-queued.
    Conflict { key: ResourceRef },
    /// The resource is gone from the store.
    Removed { key: ResourceRef },
    RulesExecuted {
        requested_by: Option<ResourceRef>,
        executed: BTreeSet<String>,
        reused: BTreeSet<String>,
        failed: BTreeMap<String, String>,
        blocked: BTreeSet<String>,
    },
}

impl EngineEvent {
    pub fn rules_executed(requested_by: Option<ResourceRef>, report: &ExecutionReport) -> Self {
        EngineEvent::RulesExecuted {
            requested_by,
            executed: report.executed.clone(),
            reused: report.reused.clone(),
            failed: report.failed.clone(),
            blocked: report.blocked.clone(),
        }
    }

    /// The ref this event is about, if any.
    pub fn key(&self) -> Option<&ResourceRef> {
        match self {
            EngineEvent::Reconciled { key, .. }
            | EngineEvent::ReconcileFailed { key, .. }
            | EngineEvent::Conflict { key }
            | EngineEvent::Removed { key } => Some(key),
            EngineEvent::RulesExecuted { requested_by, .. } => requested_by.as_ref(),
        }
    }

    pub fn is_terminal_failure(&self) -> bool { matches!(self, EngineEvent::ReconcileFailed { terminal: true, .. }) }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: EngineEvent) {
        match &event {
            EngineEvent::Reconciled { key, actions, elapsed_ms } => info!(%key, actions, elapsed_ms, "reconciled"),
            EngineEvent::ReconcileFailed { key, reason, attempts, terminal: true, .. } => {
                error!(%key, %reason, attempts, "reconcile failed permanently")
            }
            EngineEvent::ReconcileFailed { key, reason, attempts, retry_in_ms, .. } => {
                warn!(%key, %reason, attempts, retry_in_ms = retry_in_ms.unwrap_or_default(), "reconcile failed")
            }
            EngineEvent::Conflict { key } => warn!(%key, "write conflict; requeued"),
            EngineEvent::Removed { key } => info!(%key, "removed"),
            EngineEvent::RulesExecuted { requested_by, executed, reused, failed, blocked } => info!(
                requested_by = %requested_by.as_ref().map(|k| k.to_string()).unwrap_or_default(),
                executed = executed.len(),
                reused = reused.len(),
                failed = failed.len(),
                blocked = blocked.len(),
                "rules executed"
            ),
        }
    }
}

/// Keeps every event in memory; the per-resource history view.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<(DateTime<Utc>, EngineEvent)>>,
}

impl MemorySink {
    pub fn new() -> Self { Self::default() }

    pub fn events(&self) -> Vec<EngineEvent> { self.lock().iter().map(|(_, e)| e.clone()).collect() }

    /// Events about `key`, oldest first, with the time they were emitted.
    pub fn events_for(&self, key: &ResourceRef) -> Vec<(DateTime<Utc>, EngineEvent)> {
        self.lock().iter().filter(|(_, e)| e.key() == Some(key)).cloned().collect()
    }

    pub fn len(&self) -> usize { self.lock().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn clear(&self) { self.lock().clear(); }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(DateTime<Utc>, EngineEvent)>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: EngineEvent) { self.lock().push((Utc::now(), event)); }
}
