//! Keel work queue: reconcile requests coalesced by resource ref, FIFO across refs,
//! with delayed re-enqueue for backoff.
//!
//! A ref that has been handed out is *active* until its `Lease` is released. Requests
//! for an active ref are parked and become pending again on release, so no ref is ever
//! processed by two workers at once.

#![forbid(unsafe_code)]

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use keel_core::ResourceRef;
use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Why a ref was queued.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reason {
    Created,
    Updated,
    Deleted,
    /// An input of rules this ref derived from changed.
    Dependency(ResourceRef),
    /// Backoff retry number n.
    Retry(u32),
    /// A write raced with another writer; re-diff.
    Conflict,
    Resync,
}

impl Reason {
    /// True for reasons that reflect new desired or upstream state (as opposed to retries).
    pub fn is_change(&self) -> bool { !matches!(self, Reason::Retry(_) | Reason::Conflict) }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::Created => f.write_str("created"),
            Reason::Updated => f.write_str("updated"),
            Reason::Deleted => f.write_str("deleted"),
            Reason::Dependency(k) => write!(f, "dependency {}", k),
            Reason::Retry(n) => write!(f, "retry #{}", n),
            Reason::Conflict => f.write_str("conflict"),
            Reason::Resync => f.write_str("resync"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileRequest {
    pub key: ResourceRef,
    pub reasons: SmallVec<[Reason; 2]>,
    pub enqueued_at: Instant,
}

impl ReconcileRequest {
    fn new(key: ResourceRef, reason: Reason) -> Self {
        let mut reasons = SmallVec::new();
        reasons.push(reason);
        Self { key, reasons, enqueued_at: Instant::now() }
    }

    fn merge(&mut self, reason: Reason) {
        if !self.reasons.contains(&reason) {
            self.reasons.push(reason);
        }
    }

    pub fn has_change(&self) -> bool { self.reasons.iter().any(Reason::is_change) }
}

struct Delayed {
    due: Instant,
    seq: u64,
    key: ResourceRef,
    reason: Reason,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool { self.due == other.due && self.seq == other.seq }
}
impl Eq for Delayed {}
impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}
impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering { self.due.cmp(&other.due).then(self.seq.cmp(&other.seq)) }
}

#[derive(Default)]
struct State {
    pending: FxHashMap<ResourceRef, ReconcileRequest>,
    order: VecDeque<ResourceRef>,
    active: FxHashSet<ResourceRef>,
    parked: FxHashMap<ResourceRef, ReconcileRequest>,
    delayed: BinaryHeap<Reverse<Delayed>>,
    seq: u64,
    shutdown: bool,
}

impl State {
    /// Returns true when a new pending entry was created.
    fn add(&mut self, key: ResourceRef, reason: Reason) -> bool {
        if let Some(req) = self.pending.get_mut(&key) {
            req.merge(reason);
            counter!("queue_coalesced_total", 1u64);
            return false;
        }
        if self.active.contains(&key) {
            match self.parked.get_mut(&key) {
                Some(req) => req.merge(reason),
                None => {
                    self.parked.insert(key.clone(), ReconcileRequest::new(key, reason));
                }
            }
            return false;
        }
        self.order.push_back(key.clone());
        self.pending.insert(key.clone(), ReconcileRequest::new(key, reason));
        true
    }

    fn promote_due(&mut self, now: Instant) -> bool {
        let mut added = false;
        while self.delayed.peek().map_or(false, |Reverse(d)| d.due <= now) {
            if let Some(Reverse(d)) = self.delayed.pop() {
                trace!(key = %d.key, "delayed request due");
                added |= self.add(d.key, d.reason);
            }
        }
        added
    }

    fn pop_ready(&mut self) -> Option<ReconcileRequest> {
        while let Some(key) = self.order.pop_front() {
            if let Some(req) = self.pending.remove(&key) {
                self.active.insert(key);
                return Some(req);
            }
        }
        None
    }

    fn next_due(&self) -> Option<Instant> { self.delayed.peek().map(|Reverse(d)| d.due) }
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

/// Cloneable handle; all clones share one queue.
#[derive(Clone)]
pub struct WorkQueue {
    shared: Arc<Shared>,
}

impl Default for WorkQueue {
    fn default() -> Self { Self::new() }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self { shared: Arc::new(Shared { state: Mutex::new(State::default()), notify: Notify::new() }) }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // Queue state stays consistent across a panicking holder; keep serving.
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `key`; coalesces with a pending request for the same ref.
    /// Returns false when merged, parked, or the queue is shut down.
    pub fn enqueue(&self, key: ResourceRef, reason: Reason) -> bool {
        let added = {
            let mut st = self.lock();
            if st.shutdown {
                return false;
            }
            debug!(%key, %reason, "enqueue");
            let added = st.add(key, reason);
            gauge!("queue_depth", st.pending.len() as f64);
            added
        };
        if added {
            self.shared.notify.notify_one();
        }
        added
    }

    /// Queue `key` once `delay` has elapsed.
    pub fn enqueue_after(&self, key: ResourceRef, delay: Duration, reason: Reason) {
        if delay.is_zero() {
            self.enqueue(key, reason);
            return;
        }
        {
            let mut st = self.lock();
            if st.shutdown {
                return;
            }
            st.seq += 1;
            let seq = st.seq;
            debug!(%key, %reason, delay_ms = delay.as_millis() as u64, "enqueue after delay");
            st.delayed.push(Reverse(Delayed { due: Instant::now() + delay, seq, key, reason }));
        }
        // a waiting worker recomputes its deadline
        self.shared.notify.notify_one();
    }

    /// Wait for the next due request. Returns `None` once the queue is shut down.
    pub async fn dequeue(&self) -> Option<Lease> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut st = self.lock();
                if st.shutdown {
                    return None;
                }
                st.promote_due(Instant::now());
                if let Some(request) = st.pop_ready() {
                    gauge!("queue_depth", st.pending.len() as f64);
                    // Leave a permit for the next waiter if more work is ready.
                    if !st.order.is_empty() {
                        self.shared.notify.notify_one();
                    }
                    return Some(Lease { queue: self.clone(), request, released: false });
                }
                st.next_due()
            };

            match next_due {
                Some(due) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(due) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    fn release(&self, key: &ResourceRef) {
        let requeued = {
            let mut st = self.lock();
            st.active.remove(key);
            match st.parked.remove(key) {
                Some(req) if !st.shutdown => {
                    st.order.push_back(key.clone());
                    st.pending.insert(key.clone(), req);
                    true
                }
                _ => false,
            }
        };
        if requeued {
            self.shared.notify.notify_one();
        }
    }

    /// Stop handing out work and wake every waiting worker.
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.shared.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool { self.lock().shutdown }

    /// Requests ready or parked behind an active ref (delayed requests excluded).
    pub fn len(&self) -> usize {
        let st = self.lock();
        st.pending.len() + st.parked.len()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn delayed_len(&self) -> usize { self.lock().delayed.len() }

    pub fn is_active(&self, key: &ResourceRef) -> bool { self.lock().active.contains(key) }
}

/// Exclusive claim on one ref; releasing it (explicitly or on drop) re-queues anything parked.
pub struct Lease {
    queue: WorkQueue,
    request: ReconcileRequest,
    released: bool,
}

impl Lease {
    pub fn request(&self) -> &ReconcileRequest { &self.request }

    pub fn done(mut self) {
        self.released = true;
        self.queue.release(&self.request.key);
    }
}

impl Deref for Lease {
    type Target = ReconcileRequest;

    fn deref(&self) -> &Self::Target { &self.request }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            self.queue.release(&self.request.key);
        }
    }
}
