use crate::errors::ToolError;
use crate::utils::fs_atomic::atomic_write_json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Cached facts about one machine. Every fact is optional; collection keeps
/// whatever the host reported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineInfo {
    pub name: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    /// Set once any machine has been collected over the wire.
    #[serde(default)]
    pub extended: bool,
    #[serde(default)]
    pub machines: Vec<MachineInfo>,
}

impl Inventory {
    pub fn get(&self, machine: &str) -> Option<&MachineInfo> {
        self.machines.iter().find(|m| m.name == machine)
    }
}

#[derive(Clone)]
pub struct InventoryStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl InventoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty inventory.
    pub fn load(&self) -> Result<Inventory, ToolError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Inventory::default()),
            Err(err) => return Err(err.into()),
        };
        serde_json::from_str(&raw)
            .map_err(|err| ToolError::internal(format!("Malformed inventory file: {}", err)))
    }

    pub fn get(&self, machine: &str) -> Result<Option<MachineInfo>, ToolError> {
        Ok(self.load()?.get(machine).cloned())
    }

    /// Replaces the entry for `info.name` and marks the inventory extended.
    pub fn upsert(&self, info: MachineInfo) -> Result<Inventory, ToolError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|err| err.into_inner());
        let mut inventory = self.load()?;
        inventory.machines.retain(|m| m.name != info.name);
        inventory.machines.push(info);
        inventory.machines.sort_by(|a, b| a.name.cmp(&b.name));
        inventory.extended = true;
        atomic_write_json(&self.path, &inventory)
            .map_err(|err| ToolError::internal(format!("Failed to save inventory: {}", err)))?;
        Ok(inventory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> InventoryStore {
        let dir = std::env::temp_dir().join(format!("fleetssh-inventory-{}", uuid::Uuid::new_v4()));
        InventoryStore::new(dir.join("inventory.json"))
    }

    fn info(name: &str, os: &str) -> MachineInfo {
        MachineInfo {
            name: name.to_string(),
            updated_at: Utc::now(),
            os: Some(os.to_string()),
            ..MachineInfo::default()
        }
    }

    #[test]
    fn missing_file_is_an_empty_inventory() {
        let store = store();
        let inventory = store.load().expect("load");
        assert!(!inventory.extended);
        assert!(inventory.machines.is_empty());
        assert_eq!(store.get("web1").expect("get"), None);
    }

    #[test]
    fn upsert_replaces_existing_entry() {
        let store = store();
        store.upsert(info("web1", "Debian 11")).expect("first");
        store.upsert(info("db", "Alpine")).expect("second");
        let inventory = store.upsert(info("web1", "Debian 12")).expect("replace");

        assert!(inventory.extended);
        assert_eq!(inventory.machines.len(), 2);
        let web1 = store.get("web1").expect("get").expect("cached");
        assert_eq!(web1.os.as_deref(), Some("Debian 12"));

        let raw = std::fs::read_to_string(store.path()).expect("raw");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["machines"][0]["name"], "db");
        assert!(value["machines"][0].get("cpu").is_none());
        if let Some(dir) = store.path().parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn malformed_file_is_an_error() {
        let store = store();
        if let Some(dir) = store.path().parent() {
            std::fs::create_dir_all(dir).expect("dir");
        }
        std::fs::write(store.path(), "{ nope").expect("write");
        let err = store.load().expect_err("malformed");
        assert_eq!(err.code, "INTERNAL");
        if let Some(dir) = store.path().parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}
