use std::path::PathBuf;

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> String {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.to_string_lossy().to_string();
        }
    }
    if let Some(suffix) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(suffix).to_string_lossy().to_string();
        }
    }
    path.to_string()
}

/// Platform cache root for arca, e.g. `~/.cache/arca`.
pub(super) fn default_cache_root() -> Option<PathBuf> {
    dirs::cache_dir().map(|d| d.join("arca"))
}
