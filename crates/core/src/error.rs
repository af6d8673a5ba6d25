use thiserror::Error;

use crate::ResourceRef;

/// Error taxonomy shared by every keel crate.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeelError {
    /// Malformed resource; rejected before it reaches the store.
    #[error("validation failed for {subject}: {reason}")]
    Validation { subject: String, reason: String },
    /// Rule graph construction found a cycle; fatal for that graph.
    #[error("rule graph has a cycle through: {}", .rules.join(" -> "))]
    Cycle { rules: Vec<String> },
    /// Invalid rule or engine configuration; fatal at build time.
    #[error("configuration: {0}")]
    Config(String),
    #[error("rule {rule} failed: {reason}")]
    RuleExecution { rule: String, reason: String },
    #[error("reconcile of {key} failed after {attempts} attempt(s): {reason}")]
    Reconcile { key: ResourceRef, attempts: u32, reason: String },
    /// The write was applied (last writer wins) but the caller's view was stale.
    #[error("write conflict on {key}: seen version {seen}, replaced version {current}, wrote {written}")]
    StoreConflict { key: ResourceRef, seen: u64, current: u64, written: u64 },
    #[error("{0} not found")]
    NotFound(ResourceRef),
    #[error("persistence: {0}")]
    Persist(String),
    #[error("engine is shut down")]
    Shutdown,
}

impl KeelError {
    pub fn validation(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        KeelError::Validation { subject: subject.into(), reason: reason.into() }
    }

    /// Fatal errors are never retried.
    pub fn is_fatal(&self) -> bool { matches!(self, KeelError::Cycle { .. } | KeelError::Config(_)) }
}

pub type KeelResult<T> = Result<T, KeelError>;
