use std::path::{Path, PathBuf};

pub fn expand_home_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let Ok(home) = std::env::var("HOME") else {
        return path.to_path_buf();
    };
    match path.to_str() {
        Some("~") => PathBuf::from(home),
        Some(text) => match text.strip_prefix("~/") {
            Some(rest) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        None => path.to_path_buf(),
    }
}

/// Expands `~`, `~/x`, `$HOME`, `${HOME}` and their `/x` forms against `home`.
pub fn expand_home_shorthand(raw: &str, home: &str) -> String {
    let raw = raw.trim();
    if raw == "~" || raw == "$HOME" || raw == "${HOME}" {
        return home.to_string();
    }
    for prefix in ["~/", "$HOME/", "${HOME}/"] {
        if let Some(rest) = raw.strip_prefix(prefix) {
            return format!("{}/{}", home.trim_end_matches('/'), rest);
        }
    }
    raw.to_string()
}
