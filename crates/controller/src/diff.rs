use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Counts of leaf-level differences between a target document and a base.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}

/// Summarize what turning `base` into `target` would change. Objects are compared
/// key by key, arrays index by index; anything else is a single update when unequal.
pub fn diff_summary(target: &Value, base: &Value) -> DiffSummary {
    fn walk(a: &Value, b: &Value, out: &mut DiffSummary) {
        match (a, b) {
            (Value::Object(ao), Value::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, out),
                        None => out.adds += 1,
                    }
                }
                out.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Value::Array(aa), Value::Array(bb)) => {
                out.updates += aa.iter().zip(bb.iter()).filter(|(x, y)| x != y).count();
                out.adds += aa.len().saturating_sub(bb.len());
                out.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => {
                if av != bv {
                    out.updates += 1;
                }
            }
        }
    }
    let mut out = DiffSummary::default();
    walk(target, base, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn counts_adds_updates_removes() {
        let base = json!({ "a": 1, "b": { "x": 1 }, "c": [1, 2, 3], "gone": true });
        let target = json!({ "a": 2, "b": { "x": 1, "y": 2 }, "c": [1, 9], "d": true });
        let s = diff_summary(&target, &base);
        // b.y and d added; a and c[1] updated; c[2] and gone removed
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 2 });
    }

    #[test]
    fn equal_documents_are_empty() {
        let v = json!({ "path": "/tmp/a", "content": "hi" });
        assert!(diff_summary(&v, &v).is_empty());
        assert_eq!(diff_summary(&json!("x"), &Value::Null).updates, 1);
    }
}
