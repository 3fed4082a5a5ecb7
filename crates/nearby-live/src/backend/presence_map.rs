//! Presence state keyed by presence key, with per-connection metas.
//!
//! A key stays present while it holds at least one meta. Metas carry the
//! transport's `phx_ref`; a re-announcement arrives as a join of the new ref
//! plus a leave of the old one, and must not drop the key.

use std::collections::BTreeMap;

use serde_json::Value;

const REF_FIELD: &str = "phx_ref";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceMap {
    entries: BTreeMap<String, Vec<Value>>,
}

impl PresenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `{ "<key>": [meta, ...] }`. Non-array values are skipped.
    pub fn from_payload(payload: &Value) -> Self {
        let mut entries = BTreeMap::new();
        if let Some(obj) = payload.as_object() {
            for (key, metas) in obj {
                if let Some(metas) = metas.as_array() {
                    if !metas.is_empty() {
                        entries.insert(key.clone(), metas.clone());
                    }
                }
            }
        }
        Self { entries }
    }

    pub fn to_payload(&self) -> Value {
        let obj = self
            .entries
            .iter()
            .map(|(k, metas)| (k.clone(), Value::Array(metas.clone())))
            .collect();
        Value::Object(obj)
    }

    /// Replace everything with a full snapshot.
    pub fn sync(&mut self, snapshot: PresenceMap) {
        self.entries = snapshot.entries;
    }

    /// Apply joined metas. Returns the keys that were not present before.
    pub fn join(&mut self, joins: &PresenceMap) -> Vec<String> {
        let mut newly_online = Vec::new();
        for (key, metas) in &joins.entries {
            let entry = self.entries.entry(key.clone()).or_default();
            if entry.is_empty() {
                newly_online.push(key.clone());
            }
            for meta in metas {
                match meta_ref(meta) {
                    Some(r) => {
                        entry.retain(|m| meta_ref(m) != Some(r));
                        entry.push(meta.clone());
                    }
                    // Without refs a key holds a single meta: the latest.
                    None => {
                        entry.clear();
                        entry.push(meta.clone());
                    }
                }
            }
        }
        newly_online
    }

    /// Apply left metas. Returns the keys that are no longer present.
    ///
    /// Metas with a ref remove only that ref; a meta without a ref removes
    /// the whole key.
    pub fn leave(&mut self, leaves: &PresenceMap) -> Vec<String> {
        let mut gone = Vec::new();
        for (key, metas) in &leaves.entries {
            let Some(entry) = self.entries.get_mut(key) else {
                continue;
            };
            for meta in metas {
                match meta_ref(meta) {
                    Some(r) => entry.retain(|m| meta_ref(m) != Some(r)),
                    None => entry.clear(),
                }
            }
            if entry.is_empty() {
                self.entries.remove(key);
                gone.push(key.clone());
            }
        }
        gone
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Most recent meta announced under `key`.
    pub fn latest(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).and_then(|metas| metas.last())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

fn meta_ref(meta: &Value) -> Option<&str> {
    meta.get(REF_FIELD).and_then(Value::as_str)
}
