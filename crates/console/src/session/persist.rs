// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session persistence: JSON file with atomic writes, or a shared in-memory slot.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::session::Session;

/// Where the session lives between restarts. One storage is shared by every
/// console instance of a profile.
pub trait SessionStorage: Send + Sync {
    fn load(&self) -> anyhow::Result<Option<Session>>;

    fn save(&self, session: &Session) -> anyhow::Result<()>;

    fn clear(&self) -> anyhow::Result<()>;

    /// Backing file, when there is one. Used to wire a file watcher.
    fn path(&self) -> Option<&Path> {
        None
    }
}

/// Session stored as `session.json` under a state directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// `<dir>/session.json`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join("session.json"))
    }
}

impl SessionStorage for FileStorage {
    fn load(&self) -> anyhow::Result<Option<Session>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if contents.trim().is_empty() {
            return Ok(None);
        }
        let session: Session = serde_json::from_str(&contents)?;
        Ok(Some(session))
    }

    /// Write tmp + rename. The temp name is unique per process and call so
    /// concurrent saves never share a partially written file.
    fn save(&self, session: &Session) -> anyhow::Result<()> {
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);

        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let json = serde_json::to_string_pretty(session)?;
        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp_name = format!(
            ".{}.{}.{}.tmp",
            self.path.file_name().unwrap_or_default().to_string_lossy(),
            std::process::id(),
            seq,
        );
        let tmp_path = self.path.with_file_name(tmp_name);
        std::fs::write(&tmp_path, json)?;
        restrict_permissions(&tmp_path)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> anyhow::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}

/// In-memory storage. Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    slot: Arc<Mutex<Option<Session>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for MemoryStorage {
    fn load(&self) -> anyhow::Result<Option<Session>> {
        Ok(self.slot.lock().clone())
    }

    fn save(&self, session: &Session) -> anyhow::Result<()> {
        *self.slot.lock() = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> anyhow::Result<()> {
        *self.slot.lock() = None;
        Ok(())
    }
}
