use std::path::{Path, PathBuf};

/// Application directory (~/.workspace-chat)
pub fn app_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(".workspace-chat")
}

/// config.json path
pub fn config_json_path() -> PathBuf {
    app_dir().join("config.json")
}

/// Default directory for persisted conversations
pub fn conversations_dir() -> PathBuf {
    app_dir().join("conversations")
}

/// Resolve the data directory, preferring an explicit override.
pub fn data_dir_or_default(override_dir: Option<&Path>) -> PathBuf {
    override_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(conversations_dir)
}
