use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::{Error, Result, SessionSnapshot};

/// Key the snapshot document is persisted under.
pub const SNAPSHOT_STORAGE_KEY: &str = "bloom.nip46.sessions.v1";

/// Single-document persistence seam for the session snapshot.
pub trait SnapshotStorage: Send + Sync {
    /// Missing or corrupt data reads as no snapshot, never an error.
    fn load(&self) -> Option<SessionSnapshot>;
    fn save(&self, snapshot: &SessionSnapshot) -> Result<()>;
}

pub struct FileSnapshotStorage {
    path: PathBuf,
    disabled: AtomicBool,
}

impl FileSnapshotStorage {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir)
            .map_err(|e| Error::Storage(format!("Failed to create directory: {e}")))?;
        let file_name = format!("{}.json", SNAPSHOT_STORAGE_KEY.replace(['/', '\\', ':'], "_"));
        Ok(Self {
            path: base_dir.join(file_name),
            disabled: AtomicBool::new(false),
        })
    }

    fn is_storage_full(err: &std::io::Error) -> bool {
        err.raw_os_error() == Some(28) || matches!(err.kind(), std::io::ErrorKind::StorageFull)
    }
}

impl SnapshotStorage for FileSnapshotStorage {
    fn load(&self) -> Option<SessionSnapshot> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("failed to read session snapshot: {e}");
                return None;
            }
        };

        match serde_json::from_str(&contents) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!("discarding corrupt session snapshot: {e}");
                None
            }
        }
    }

    fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        if self.disabled.load(Ordering::Relaxed) {
            return Ok(());
        }

        let json = serde_json::to_string(snapshot)?;
        match fs::write(&self.path, json) {
            Ok(()) => Ok(()),
            Err(e) if Self::is_storage_full(&e) => {
                // Degraded mode for the rest of the process lifetime.
                self.disabled.store(true, Ordering::Relaxed);
                tracing::warn!("storage quota exhausted, session persistence disabled: {e}");
                Ok(())
            }
            Err(e) => Err(Error::Storage(format!("Failed to write snapshot: {e}"))),
        }
    }
}

/// In-memory variant; clones on both save and load so callers can never
/// mutate the stored snapshot in place.
#[derive(Default)]
pub struct MemorySnapshotStorage {
    inner: Mutex<Option<SessionSnapshot>>,
}

impl MemorySnapshotStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStorage for MemorySnapshotStorage {
    fn load(&self) -> Option<SessionSnapshot> {
        self.inner.lock().unwrap().clone()
    }

    fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        *self.inner.lock().unwrap() = Some(snapshot.clone());
        Ok(())
    }
}
