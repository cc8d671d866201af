//! The user profile: a small categorized key/value JSON document injected
//! into the identity prompt and updated by the `update_profile` tool and
//! high-confidence smart-memory facts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ghost_domain::Result;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::io::write_json_atomic;

/// Profile keys that imply a better-fitting category than the one the
/// model picked.
fn remap(key: &str) -> Option<(&'static str, &'static str)> {
    match key {
        "wife" => Some(("relationships", "wife")),
        "husband" => Some(("relationships", "husband")),
        "son" => Some(("relationships", "son")),
        "daughter" => Some(("relationships", "daughter")),
        "car" | "vehicle" => Some(("assets", "car")),
        "science" => Some(("interests", "science")),
        "interest" => Some(("interests", "general")),
        _ => None,
    }
}

fn default_profile() -> Value {
    serde_json::json!({
        "root": {"name": "User"},
        "relationships": {},
        "interests": {},
        "assets": {}
    })
}

/// Thread-safe profile store. The mutex covers whole read-modify-write
/// transactions; every write goes through tmp-file + rename.
pub struct ProfileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ProfileStore {
    pub fn open(memory_dir: &Path) -> Result<Self> {
        let path = memory_dir.join("user_profile.json");
        let store = Self {
            path,
            lock: Mutex::new(()),
        };
        if !store.path.exists() {
            write_json_atomic(&store.path, &default_profile())?;
        }
        Ok(store)
    }

    fn read_unlocked(&self) -> Value {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_else(default_profile)
    }

    pub fn load(&self) -> Value {
        let _guard = self.lock.lock();
        self.read_unlocked()
    }

    /// Set `category.key = value`, with the well-known key remapping.
    pub fn update(&self, category: &str, key: &str, value: &str) -> Result<String> {
        let _guard = self.lock.lock();
        let mut data = self.read_unlocked();

        let cat = category.trim().to_lowercase();
        let k = key.trim().to_lowercase();
        let v = value.trim().to_string();

        let (cat, k) = match remap(&k) {
            Some((c, k)) => (c.to_string(), k.to_string()),
            None => (cat, k),
        };

        let obj = data.as_object_mut().expect("profile root is an object");
        let entry = obj
            .entry(cat.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        entry
            .as_object_mut()
            .expect("category coerced to object")
            .insert(k.clone(), Value::String(v.clone()));

        write_json_atomic(&self.path, &data)?;
        Ok(format!("Synchronized: {cat}.{k} = {v}"))
    }

    pub fn delete(&self, category: &str, key: &str) -> Result<String> {
        let _guard = self.lock.lock();
        let mut data = self.read_unlocked();

        let cat = category.trim().to_lowercase();
        let k = key.trim().to_lowercase();

        let removed = data
            .get_mut(&cat)
            .and_then(|v| v.as_object_mut())
            .map(|obj| obj.remove(&k).is_some())
            .unwrap_or(false);

        if !removed {
            return Ok(format!("Profile key not found: {cat}.{k}"));
        }
        if data.get(&cat).and_then(|v| v.as_object()).map(|o| o.is_empty()) == Some(true) {
            data.as_object_mut().unwrap().remove(&cat);
        }
        write_json_atomic(&self.path, &data)?;
        Ok(format!("Removed from Profile: {cat}.{k}"))
    }

    /// Markdown-ish rendering substituted into the identity prompt.
    pub fn context_string(&self) -> String {
        let data = self.load();
        let Some(obj) = data.as_object() else {
            return String::new();
        };

        // Deterministic ordering for a cache-stable prompt prefix.
        let ordered: BTreeMap<&String, &Value> = obj.iter().collect();
        let mut lines = Vec::new();
        for (key, val) in ordered {
            match val {
                Value::Object(sub) if !sub.is_empty() => {
                    lines.push(format!("## {}:", capitalize(key)));
                    let sub_sorted: BTreeMap<&String, &Value> = sub.iter().collect();
                    for (sk, sv) in sub_sorted {
                        lines.push(format!("- {}: {}", sk, render_scalar(sv)));
                    }
                }
                Value::Array(items) if !items.is_empty() => {
                    let joined: Vec<String> = items.iter().map(render_scalar).collect();
                    lines.push(format!("## {}: {}", capitalize(key), joined.join(", ")));
                }
                Value::Object(_) | Value::Array(_) | Value::Null => {}
                other => lines.push(format!("{}: {}", capitalize(key), render_scalar(other))),
            }
        }
        lines.join("\n")
    }

    /// Best-effort location lookup across all categories, used by the
    /// weather tool when no location was given.
    pub fn find_location(&self) -> Option<String> {
        let data = self.load();
        let obj = data.as_object()?;

        for root_key in ["location", "city"] {
            if let Some(v) = obj
                .get("root")
                .and_then(|r| r.get(root_key))
                .and_then(|v| v.as_str())
            {
                return Some(v.to_string());
            }
        }

        let search_keys = ["location", "city", "address", "residence", "home"];
        for sub in obj.values() {
            if let Some(sub) = sub.as_object() {
                for (k, v) in sub {
                    if search_keys.contains(&k.to_lowercase().as_str()) {
                        if let Some(s) = v.as_str() {
                            return Some(s.to_string());
                        }
                    }
                }
            }
        }
        None
    }
}

fn capitalize(s: &str) -> String {
    let s = s.replace('_', " ");
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => s,
    }
}

fn render_scalar(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ProfileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn update_and_context_string() {
        let (_dir, store) = store();
        store.update("root", "name", "Vasilis").unwrap();
        store.update("preferences", "editor", "helix").unwrap();

        let ctx = store.context_string();
        assert!(ctx.contains("- name: Vasilis"));
        assert!(ctx.contains("## Preferences:"));
        assert!(ctx.contains("- editor: helix"));
    }

    #[test]
    fn well_known_keys_are_remapped() {
        let (_dir, store) = store();
        let msg = store.update("notes", "car", "an old Saab").unwrap();
        assert_eq!(msg, "Synchronized: assets.car = an old Saab");
        let data = store.load();
        assert_eq!(data["assets"]["car"], "an old Saab");
    }

    #[test]
    fn delete_removes_key_and_empty_category() {
        let (_dir, store) = store();
        store.update("projects", "main", "ghost").unwrap();
        let msg = store.delete("projects", "main").unwrap();
        assert!(msg.starts_with("Removed"));
        assert!(store.load().get("projects").is_none());

        let msg = store.delete("projects", "main").unwrap();
        assert!(msg.contains("not found"));
    }

    #[test]
    fn find_location_prefers_root() {
        let (_dir, store) = store();
        store.update("assets", "home", "Berlin").unwrap();
        store.update("root", "location", "Athens").unwrap();
        assert_eq!(store.find_location().as_deref(), Some("Athens"));
    }

    #[test]
    fn corrupt_file_degrades_to_default() {
        let (dir, store) = store();
        std::fs::write(dir.path().join("user_profile.json"), "{broken").unwrap();
        let data = store.load();
        assert_eq!(data["root"]["name"], "User");
    }
}
