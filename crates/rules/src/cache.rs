//! Memoized rule results keyed by `(rule id, input fingerprint)`.
//!
//! Entries are never mutated in place by readers. Writing a new result for a rule
//! marks its other entries stale; they stay addressable so a revert to earlier
//! inputs is served without re-running the rule. Only the most recently written
//! stale entries are kept per rule.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use keel_core::{Backoff, Fingerprint};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::debug;

const SHARDS: usize = 16;
/// Stale entries kept per rule besides the current one.
pub const DEFAULT_STALE_LIMIT: usize = 8;

#[derive(Debug, Clone)]
pub enum Outcome {
    Success { value: Arc<Value>, output: Fingerprint },
    /// `attempts` counts consecutive failures for the same fingerprint.
    Failure { reason: String, attempts: u32, retry_at: Instant },
}

impl Outcome {
    pub fn is_success(&self) -> bool { matches!(self, Outcome::Success { .. }) }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub rule: String,
    pub fingerprint: Fingerprint,
    pub outcome: Outcome,
    pub timestamp: DateTime<Utc>,
    pub stale: bool,
}

#[derive(Debug, Default)]
struct RuleEntries {
    current: Option<Fingerprint>,
    entries: FxHashMap<Fingerprint, CacheEntry>,
    /// Write order, oldest first.
    order: VecDeque<Fingerprint>,
}

impl RuleEntries {
    fn insert(&mut self, entry: CacheEntry) {
        let fp = entry.fingerprint;
        if self.entries.insert(fp, entry).is_some() {
            self.order.retain(|k| *k != fp);
        }
        self.order.push_back(fp);
    }

    /// Drop the oldest stale entries until at most `limit` remain besides the current one.
    fn evict(&mut self, limit: usize) -> usize {
        let mut excess = self.entries.len().saturating_sub(limit + 1);
        let mut evicted = 0;
        let mut i = 0;
        while excess > 0 && i < self.order.len() {
            if Some(self.order[i]) == self.current {
                i += 1;
                continue;
            }
            if let Some(fp) = self.order.remove(i) {
                self.entries.remove(&fp);
                evicted += 1;
                excess -= 1;
            }
        }
        evicted
    }
}

type InflightKey = (String, Fingerprint);
type InflightMap = FxHashMap<InflightKey, Arc<AsyncMutex<()>>>;

pub struct RuleCache {
    shards: Vec<RwLock<FxHashMap<String, RuleEntries>>>,
    inflight: Vec<Mutex<InflightMap>>,
    retry: Backoff,
    stale_limit: usize,
}

impl std::fmt::Debug for RuleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleCache").field("rules", &self.rule_count()).field("retry", &self.retry).finish()
    }
}

impl Default for RuleCache {
    fn default() -> Self { Self::new(Backoff::default()) }
}

impl RuleCache {
    pub fn new(retry: Backoff) -> Self {
        Self {
            shards: (0..SHARDS).map(|_| RwLock::new(FxHashMap::default())).collect(),
            inflight: (0..SHARDS).map(|_| Mutex::new(FxHashMap::default())).collect(),
            retry,
            stale_limit: DEFAULT_STALE_LIMIT,
        }
    }

    pub fn with_stale_limit(mut self, limit: usize) -> Self {
        self.stale_limit = limit;
        self
    }

    pub fn retry_policy(&self) -> Backoff { self.retry }

    fn shard_index(rule: &str) -> usize {
        // FNV-1a over the rule id
        let mut h: u64 = 0xcbf29ce484222325;
        for b in rule.as_bytes() {
            h ^= *b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        (h as usize) % SHARDS
    }

    fn inflight(&self, rule: &str) -> MutexGuard<'_, InflightMap> {
        self.inflight[Self::shard_index(rule)].lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn lookup(&self, rule: &str, fp: &Fingerprint) -> Option<CacheEntry> {
        let shard = self.shards[Self::shard_index(rule)].read().unwrap_or_else(|e| e.into_inner());
        shard.get(rule).and_then(|r| r.entries.get(fp)).cloned()
    }

    /// Entry for the rule's most recent input fingerprint, if any.
    pub fn current(&self, rule: &str) -> Option<CacheEntry> {
        let shard = self.shards[Self::shard_index(rule)].read().unwrap_or_else(|e| e.into_inner());
        let r = shard.get(rule)?;
        r.current.and_then(|fp| r.entries.get(&fp)).cloned()
    }

    /// Record that `fp` is the rule's current input set; every other entry becomes stale.
    pub fn mark_current(&self, rule: &str, fp: Fingerprint) {
        let mut shard = self.shards[Self::shard_index(rule)].write().unwrap_or_else(|e| e.into_inner());
        let r = shard.entry(rule.to_string()).or_default();
        if r.current == Some(fp) {
            return;
        }
        r.current = Some(fp);
        for (k, e) in r.entries.iter_mut() {
            e.stale = *k != fp;
        }
    }

    /// Store the result of running `rule` over inputs fingerprinted `fp`.
    pub fn store(&self, rule: &str, fp: Fingerprint, result: Result<Value, String>) -> CacheEntry {
        let mut shard = self.shards[Self::shard_index(rule)].write().unwrap_or_else(|e| e.into_inner());
        let r = shard.entry(rule.to_string()).or_default();
        let outcome = match result {
            Ok(v) => {
                counter!("rule_cache_store_total", 1u64, "outcome" => "success");
                let output = Fingerprint::of_value(&v);
                Outcome::Success { value: Arc::new(v), output }
            }
            Err(reason) => {
                counter!("rule_cache_store_total", 1u64, "outcome" => "failure");
                let attempts = match r.entries.get(&fp).map(|e| &e.outcome) {
                    Some(Outcome::Failure { attempts, .. }) => attempts.saturating_add(1),
                    _ => 1,
                };
                let retry_at = Instant::now() + self.retry.delay(attempts);
                Outcome::Failure { reason, attempts, retry_at }
            }
        };
        let entry = CacheEntry { rule: rule.to_string(), fingerprint: fp, outcome, timestamp: Utc::now(), stale: false };
        r.current = Some(fp);
        for e in r.entries.values_mut() {
            e.stale = true;
        }
        r.insert(entry.clone());
        let evicted = r.evict(self.stale_limit);
        if evicted > 0 {
            counter!("rule_cache_evicted_total", evicted as u64);
            debug!(rule, evicted, "stale cache entries evicted");
        }
        entry
    }

    /// Drop every entry for `rule`. Used when the rule definition itself changes.
    pub fn invalidate(&self, rule: &str) -> usize {
        let mut shard = self.shards[Self::shard_index(rule)].write().unwrap_or_else(|e| e.into_inner());
        let n = shard.remove(rule).map(|r| r.entries.len()).unwrap_or(0);
        if n > 0 {
            debug!(rule, entries = n, "rule cache invalidated");
        }
        n
    }

    pub fn rule_count(&self) -> usize {
        self.shards.iter().map(|s| s.read().unwrap_or_else(|e| e.into_inner()).len()).sum()
    }

    pub fn entry_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().unwrap_or_else(|e| e.into_inner()).values().map(|r| r.entries.len()).sum::<usize>())
            .sum()
    }

    /// Exclusive right to compute `(rule, fp)`. Concurrent claimants wait here and
    /// should consult the cache again once they hold the claim.
    pub async fn claim(self: &Arc<Self>, rule: &str, fp: Fingerprint) -> Claim {
        let key = (rule.to_string(), fp);
        let slot = {
            let mut map = self.inflight(rule);
            Arc::clone(map.entry(key.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))))
        };
        let guard = slot.lock_owned().await;
        Claim { cache: Arc::clone(self), key, guard }
    }
}

pub struct Claim {
    cache: Arc<RuleCache>,
    key: InflightKey,
    guard: OwnedMutexGuard<()>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        let mut map = self.cache.inflight(&self.key.0);
        let last = match map.get(&self.key) {
            // one reference in the map, one held by our guard: nobody is waiting
            Some(slot) => Arc::ptr_eq(slot, OwnedMutexGuard::mutex(&self.guard)) && Arc::strong_count(slot) == 2,
            None => false,
        };
        if last {
            map.remove(&self.key);
        }
    }
}
