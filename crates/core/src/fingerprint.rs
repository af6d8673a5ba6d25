//! Content fingerprints over canonicalized JSON.
//!
//! Object keys are hashed in sorted order regardless of how the map was built, and
//! set members are sorted by key before hashing, so a fingerprint depends only on
//! the semantic contents.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of_value(v: &Value) -> Self {
        let mut h = Sha256::new();
        write_canonical(v, &mut h);
        Self(h.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self { Self(bytes) }

    pub fn as_bytes(&self) -> &[u8; 32] { &self.0 }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for b in self.0 {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 64 {
            return None;
        }
        let mut out = [0u8; 32];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = u8::from_str_radix(s.get(i * 2..i * 2 + 2)?, 16).ok()?;
        }
        Some(Self(out))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.to_hex()[..12]) }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "Fingerprint({})", self) }
}

/// Accumulates a set of keyed members and hashes them order-insensitively.
#[derive(Debug, Default, Clone)]
pub struct Fingerprinter {
    members: Vec<(String, Fingerprint)>,
}

impl Fingerprinter {
    pub fn new() -> Self { Self::default() }

    pub fn member(mut self, key: impl fmt::Display, content: &Value) -> Self {
        self.members.push((key.to_string(), Fingerprint::of_value(content)));
        self
    }

    /// Add a member whose content is already fingerprinted (e.g. an upstream rule output).
    pub fn member_fingerprint(mut self, key: impl fmt::Display, fp: Fingerprint) -> Self {
        self.members.push((key.to_string(), fp));
        self
    }

    pub fn len(&self) -> usize { self.members.len() }

    pub fn is_empty(&self) -> bool { self.members.is_empty() }

    pub fn finish(mut self) -> Fingerprint {
        self.members.sort();
        let mut h = Sha256::new();
        h.update((self.members.len() as u64).to_be_bytes());
        for (key, fp) in &self.members {
            write_str(key, &mut h);
            h.update(fp.as_bytes());
        }
        Fingerprint(h.finalize().into())
    }
}

fn write_str(s: &str, h: &mut Sha256) {
    h.update((s.len() as u64).to_be_bytes());
    h.update(s.as_bytes());
}

fn write_canonical(v: &Value, h: &mut Sha256) {
    match v {
        Value::Null => h.update(b"n"),
        Value::Bool(true) => h.update(b"t"),
        Value::Bool(false) => h.update(b"f"),
        Value::Number(n) => {
            h.update(b"d");
            write_str(&n.to_string(), h);
        }
        Value::String(s) => {
            h.update(b"s");
            write_str(s, h);
        }
        Value::Array(items) => {
            h.update(b"a");
            h.update((items.len() as u64).to_be_bytes());
            for item in items {
                write_canonical(item, h);
            }
        }
        Value::Object(map) => {
            h.update(b"o");
            h.update((map.len() as u64).to_be_bytes());
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for k in keys {
                write_str(k, h);
                if let Some(child) = map.get(k) {
                    write_canonical(child, h);
                }
            }
        }
    }
}
