//! Key/value persistence consumed by the conversation store.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use dashmap::DashMap;

use crate::error::PersistenceError;

/// Load/save contract for conversation state.
///
/// Calls are synchronous; they run between chunk awaits, never while a
/// stream is being polled.
#[cfg_attr(test, mockall::automock)]
pub trait Persistence: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>, PersistenceError>;
    fn save(&self, key: &str, value: &str) -> Result<(), PersistenceError>;
}

/// One `<key>.json` file per key under a base directory.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    base_path: PathBuf,
}

impl FilePersistence {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn init(&self) -> io::Result<()> {
        fs::create_dir_all(&self.base_path)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.base_path.join(format!("{}.json", file_name))
    }
}

impl Persistence for FilePersistence {
    fn load(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        match fs::read_to_string(self.key_path(key)) {
            Ok(content) => Ok(Some(content)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    fn save(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.base_path)?;
        let path = self.key_path(key);
        // Write then rename so a crash never leaves a truncated file behind.
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, value)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

/// In-process persistence for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    entries: DashMap<String, String>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|v| v.value().clone())
    }
}

impl Persistence for MemoryPersistence {
    fn load(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        Ok(self.get(key))
    }

    fn save(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn file_persistence_round_trips_values() {
        let dir = TempDir::new().unwrap();
        let persistence = FilePersistence::new(dir.path().join("data"));
        persistence.init().unwrap();

        assert!(persistence.load("conversations").unwrap().is_none());

        persistence.save("conversations", "[]").unwrap();
        assert_eq!(
            persistence.load("conversations").unwrap().as_deref(),
            Some("[]")
        );
        assert!(dir.path().join("data/conversations.json").exists());
        assert!(!dir.path().join("data/conversations.json.tmp").exists());
    }

    #[test]
    fn file_persistence_sanitizes_keys() {
        let dir = TempDir::new().unwrap();
        let persistence = FilePersistence::new(dir.path());

        persistence.save("../escape/key", "x").unwrap();
        assert!(dir.path().join("___escape_key.json").exists());
    }

    #[test]
    fn memory_persistence_overwrites() {
        let persistence = MemoryPersistence::new();
        persistence.save("k", "1").unwrap();
        persistence.save("k", "2").unwrap();
        assert_eq!(persistence.load("k").unwrap().as_deref(), Some("2"));
        assert!(persistence.load("missing").unwrap().is_none());
    }
}
