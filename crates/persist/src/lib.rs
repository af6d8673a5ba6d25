//! Keel persistence: durable backing for the resource store.
//! The store writes through a `Persist` and restores from it on startup.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use keel_core::{Resource, ResourceRef};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One persisted resource row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResource {
    pub resource: Resource,
    pub version: u64,
    /// Seconds since epoch of the write.
    pub ts: i64,
}

pub trait Persist: Send + Sync {
    fn load_all(&self) -> Result<Vec<StoredResource>>;
    fn save(&self, row: &StoredResource) -> Result<()>;
    /// Drop the row for `key`, recording `version` (the delete's own version) so the
    /// counter survives a restart even when no row carries it.
    fn remove(&self, key: &ResourceRef, version: u64) -> Result<()>;
    /// Highest version recorded by `remove`; 0 when none.
    fn high_water(&self) -> Result<u64>;
}

/// Volatile backend, mainly for tests.
#[derive(Default)]
pub struct MemoryPersist {
    rows: Mutex<BTreeMap<ResourceRef, StoredResource>>,
    high_water: AtomicU64,
}

impl MemoryPersist {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.rows.lock().map(|r| r.len()).unwrap_or(0) }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl Persist for MemoryPersist {
    fn load_all(&self) -> Result<Vec<StoredResource>> {
        let rows = self.rows.lock().map_err(|_| anyhow!("memory persist lock poisoned"))?;
        Ok(rows.values().cloned().collect())
    }

    fn save(&self, row: &StoredResource) -> Result<()> {
        let mut rows = self.rows.lock().map_err(|_| anyhow!("memory persist lock poisoned"))?;
        rows.insert(row.resource.key(), row.clone());
        Ok(())
    }

    fn remove(&self, key: &ResourceRef, version: u64) -> Result<()> {
        let mut rows = self.rows.lock().map_err(|_| anyhow!("memory persist lock poisoned"))?;
        rows.remove(key);
        self.high_water.fetch_max(version, Ordering::SeqCst);
        Ok(())
    }

    fn high_water(&self) -> Result<u64> { Ok(self.high_water.load(Ordering::SeqCst)) }
}

/// SQLite-backed store. Simple, synchronous; one row per resource ref.
pub struct SqlitePersist {
    db: Mutex<rusqlite::Connection>,
}

impl SqlitePersist {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("KEEL_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS resources (
                key     TEXT PRIMARY KEY,
                kind    TEXT NOT NULL,
                version INTEGER NOT NULL,
                ts      INTEGER NOT NULL,
                body    BLOB NOT NULL
            )",
            [],
        )
        .context("creating resources table")?;
        db.execute("CREATE INDEX IF NOT EXISTS idx_resources_kind ON resources(kind)", []).ok();
        db.execute("CREATE TABLE IF NOT EXISTS meta (name TEXT PRIMARY KEY, value INTEGER NOT NULL)", [])
            .context("creating meta table")?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path, "sqlite persistence opened");
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("sqlite connection lock poisoned"))
    }
}

impl Persist for SqlitePersist {
    fn load_all(&self) -> Result<Vec<StoredResource>> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        let mut stmt = db.prepare("SELECT version, ts, body FROM resources ORDER BY key")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let version: i64 = row.get(0)?;
            let ts: i64 = row.get(1)?;
            let body: Vec<u8> = row.get(2)?;
            let resource: Resource =
                serde_json::from_str(&maybe_decompress(&body)).context("decoding persisted resource")?;
            out.push(StoredResource { resource, version: version as u64, ts });
        }
        histogram!("persist_load_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn save(&self, row: &StoredResource) -> Result<()> {
        let started = std::time::Instant::now();
        let key = row.resource.key();
        let body = maybe_compress(&serde_json::to_string(&row.resource)?);
        let db = self.conn()?;
        db.execute(
            "INSERT INTO resources(key, kind, version, ts, body) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(key) DO UPDATE SET version = excluded.version, ts = excluded.ts, body = excluded.body",
            (key.to_string(), &key.kind, row.version as i64, row.ts, &body),
        )
        .with_context(|| format!("saving {}", key))?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn remove(&self, key: &ResourceRef, version: u64) -> Result<()> {
        let db = self.conn()?;
        let tx = db.unchecked_transaction()?;
        tx.execute("DELETE FROM resources WHERE key = ?1", [key.to_string()])
            .with_context(|| format!("removing {}", key))?;
        tx.execute(
            "INSERT INTO meta(name, value) VALUES ('version', ?1)
             ON CONFLICT(name) DO UPDATE SET value = MAX(value, excluded.value)",
            [version as i64],
        )
        .context("recording version high-water mark")?;
        tx.commit()?;
        counter!("persist_remove_total", 1u64);
        Ok(())
    }

    fn high_water(&self) -> Result<u64> {
        let db = self.conn()?;
        let v: i64 = db.query_row("SELECT COALESCE((SELECT value FROM meta WHERE name = 'version'), 0)", [], |r| r.get(0))?;
        Ok(v.max(0) as u64)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".keel");
        let _ = std::fs::create_dir_all(&p);
        p.push("keel.db");
        return p.to_string_lossy().to_string();
    }
    "keel.db".to_string()
}

pub fn now_ts() -> i64 {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}

pub fn maybe_compress(json: &str) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("KEEL_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        return zstd::encode_all(json.as_bytes(), lvl).unwrap_or_else(|_| json.as_bytes().to_vec());
    }
    #[cfg(not(feature = "zstd"))]
    json.as_bytes().to_vec()
}

pub fn maybe_decompress(blob: &[u8]) -> String {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return String::from_utf8_lossy(&de).to_string();
        }
    }
    String::from_utf8_lossy(blob).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!(
            "keel-test-{}.db",
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
        );
        dir.join(f).to_string_lossy().to_string()
    }

    fn row(name: &str, version: u64, value: i64) -> StoredResource {
        StoredResource {
            resource: Resource::new("v1", "Number", name).with_spec(serde_json::json!({ "value": value })),
            version,
            ts: version as i64,
        }
    }

    #[test]
    fn sqlite_upsert_load_remove() {
        let s = SqlitePersist::open(&temp_db()).unwrap();
        s.save(&row("a", 1, 1)).unwrap();
        s.save(&row("b", 2, 2)).unwrap();
        s.save(&row("a", 3, 10)).unwrap();
        let rows = s.load_all().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].resource.metadata.name, "a");
        assert_eq!(rows[0].version, 3);
        assert_eq!(rows[0].resource.spec["value"], 10);

        assert_eq!(s.high_water().unwrap(), 0);
        s.remove(&ResourceRef::new("Number", "a"), 4).unwrap();
        let rows = s.load_all().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].resource.metadata.name, "b");
        assert_eq!(s.high_water().unwrap(), 4);
        // the mark never moves backwards
        s.remove(&ResourceRef::new("Number", "gone"), 2).unwrap();
        assert_eq!(s.high_water().unwrap(), 4);
    }

    #[test]
    fn memory_persist_keeps_latest() {
        let m = MemoryPersist::new();
        m.save(&row("a", 1, 1)).unwrap();
        m.save(&row("a", 2, 2)).unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(m.load_all().unwrap()[0].version, 2);
    }
}
