// Client-side persistence for bingo-link
// String keys to JSON text, kept outside process memory so state survives a restart

pub mod queue;
pub mod settings;

pub use queue::{PendingMessage, PersistentQueue, StoredQueue};
pub use settings::{load_or_create_player_id, FontSize, Language, Settings, Theme};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::warn;

// Fixed keys, shared with the web client's storage layout
pub const PLAYER_ID_KEY: &str = "bingo_player_id";
pub const ROOM_ID_KEY: &str = "bingo_room_id";
pub const PENDING_MESSAGES_KEY: &str = "bingo_pending_messages";
pub const SETTINGS_KEY: &str = "bingo_settings";

/// Key-value backing for persisted client state
pub trait Storage: Send {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str) -> Result<()>;
    fn remove(&mut self, key: &str) -> Result<()>;
}

/// Read and decode a JSON value; unreadable entries count as missing
pub fn load_json<T: DeserializeOwned>(store: &dyn Storage, key: &str) -> Option<T> {
    let text = store.get(key)?;
    match serde_json::from_str(&text) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring unreadable stored value for {}: {}", key, e);
            None
        }
    }
}

pub fn save_json<T: Serialize + ?Sized>(store: &mut dyn Storage, key: &str, value: &T) -> Result<()> {
    let text = serde_json::to_string(value).with_context(|| format!("encoding {}", key))?;
    store.set(key, &text)
}

/// Room the backend last assigned to this client
pub fn last_room_id(store: &dyn Storage) -> Option<String> {
    load_json(store, ROOM_ID_KEY)
}

pub fn save_room_id(store: &mut dyn Storage, room_id: &str) -> Result<()> {
    save_json(store, ROOM_ID_KEY, room_id)
}

/// One `<key>.json` file per key under a data directory
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating storage directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// The per-user data directory for bingo-link
    pub fn default_dir() -> PathBuf {
        let mut path = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("bingo-link");
        path
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        fs::read_to_string(self.path_for(key)).ok()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        // Write-then-rename so a crash never leaves a half-written entry
        let path = self.path_for(key);
        let tmp = self.dir.join(format!(".{}.json.tmp", key));
        fs::write(&tmp, value).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", key)),
        }
    }
}

/// In-memory storage; clones share the same entries
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries().get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.entries().remove(key);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn scratch_dir(name: &str) -> PathBuf {
    use rand::Rng;
    let suffix: u32 = rand::thread_rng().gen();
    std::env::temp_dir().join(format!("bingo-link-{}-{}-{:08x}", name, std::process::id(), suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_storage_set_get_remove() {
        let dir = scratch_dir("storage");
        let mut store = FileStorage::new(&dir).unwrap();

        assert_eq!(store.get("missing"), None);
        store.set("greeting", "\"selam\"").unwrap();
        assert_eq!(store.get("greeting").as_deref(), Some("\"selam\""));

        // A second handle on the same directory sees the same data
        let reopened = FileStorage::new(&dir).unwrap();
        assert_eq!(reopened.get("greeting").as_deref(), Some("\"selam\""));

        store.remove("greeting").unwrap();
        store.remove("greeting").unwrap();
        assert_eq!(store.get("greeting"), None);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_room_id_round_trip() {
        let mut store = MemoryStorage::new();
        assert_eq!(last_room_id(&store), None);
        save_room_id(&mut store, "room-42").unwrap();
        assert_eq!(last_room_id(&store).as_deref(), Some("room-42"));
        assert_eq!(store.get(ROOM_ID_KEY).as_deref(), Some("\"room-42\""));
    }

    #[test]
    fn test_unreadable_value_counts_as_missing() {
        let mut store = MemoryStorage::new();
        store.set(ROOM_ID_KEY, "{not json").unwrap();
        assert_eq!(last_room_id(&store), None);
    }

    #[test]
    fn test_memory_storage_clones_share_entries() {
        let mut a = MemoryStorage::new();
        let b = a.clone();
        a.set("k", "1").unwrap();
        assert_eq!(b.get("k").as_deref(), Some("1"));
    }
}
