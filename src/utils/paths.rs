use std::env;
use std::path::{Path, PathBuf};

pub const APP_DIR_NAME: &str = ".fleetssh";

pub fn normalize_env_path(value: Option<String>) -> Option<PathBuf> {
    let raw = value?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lowered = trimmed.to_lowercase();
    if lowered == "undefined" || lowered == "null" {
        return None;
    }
    Some(PathBuf::from(trimmed))
}

fn resolve_home_dir() -> Option<PathBuf> {
    normalize_env_path(env::var("HOME").ok())
}

pub fn resolve_base_dir() -> PathBuf {
    if let Some(path) = normalize_env_path(env::var("FLEETSSH_HOME").ok()) {
        return path;
    }
    if let Some(home) = resolve_home_dir() {
        return home.join(APP_DIR_NAME);
    }
    env::temp_dir().join("fleetssh")
}

/// Directory layout rooted at one base directory.
#[derive(Debug, Clone)]
pub struct StateLayout {
    base: PathBuf,
}

impl StateLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn from_env() -> Self {
        Self::new(resolve_base_dir())
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn config_path(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.base.join("sessions")
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.base.join("pending")
    }

    pub fn transfer_logs_dir(&self) -> PathBuf {
        self.base.join("transfer-logs")
    }

    pub fn transfer_log_path(&self, session_id: &str) -> PathBuf {
        self.transfer_logs_dir().join(format!("{}.log", session_id))
    }

    pub fn inventory_path(&self) -> PathBuf {
        self.base.join("inventory.json")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.base.join("runs")
    }

    pub fn run_dir(&self, session_id: &str) -> PathBuf {
        self.runs_dir().join(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_env_path_ignores_placeholders() {
        assert_eq!(normalize_env_path(None), None);
        assert_eq!(normalize_env_path(Some("  ".to_string())), None);
        assert_eq!(normalize_env_path(Some("null".to_string())), None);
        assert_eq!(normalize_env_path(Some("Undefined".to_string())), None);
        assert_eq!(
            normalize_env_path(Some(" /srv/state ".to_string())),
            Some(PathBuf::from("/srv/state"))
        );
    }

    #[test]
    fn layout_places_entities_under_base() {
        let layout = StateLayout::new("/x");
        assert_eq!(layout.transfer_log_path("abc"), PathBuf::from("/x/transfer-logs/abc.log"));
        assert_eq!(layout.run_dir("abc"), PathBuf::from("/x/runs/abc"));
        assert_eq!(layout.pending_dir(), PathBuf::from("/x/pending"));
        assert_eq!(layout.inventory_path(), PathBuf::from("/x/inventory.json"));
    }
}
