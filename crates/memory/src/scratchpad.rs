//! Per-process scratchpad: the keyed string store swarm workers write
//! their results into, surfaced back to the loop through the dynamic
//! system state each turn.

use std::collections::BTreeMap;

use parking_lot::RwLock;

#[derive(Default)]
pub struct Scratchpad {
    entries: RwLock<BTreeMap<String, String>>,
}

impl Scratchpad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.write().insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Rendering used in the dynamic system state.
    pub fn list_all(&self) -> String {
        let entries = self.entries.read();
        if entries.is_empty() {
            return "None.".into();
        }
        entries
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_list_clear() {
        let pad = Scratchpad::new();
        assert_eq!(pad.list_all(), "None.");

        pad.set("api_docs", "summary text");
        pad.set("answer_1", "42");
        assert_eq!(pad.get("answer_1").as_deref(), Some("42"));

        let listing = pad.list_all();
        assert!(listing.contains("api_docs: summary text"));
        assert!(listing.contains("answer_1: 42"));

        pad.clear();
        assert!(pad.is_empty());
    }
}
