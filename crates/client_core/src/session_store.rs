//! Durable holder of the signed-in identity.
//!
//! The store keeps an in-memory copy so reads never touch the backend; writes
//! go through to the backend first and only then replace the cached value.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ChatError;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub token: String,
    pub display_name: String,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("display_name", &self.display_name)
            .finish()
    }
}

pub trait SessionBackend: Send + Sync {
    fn load(&self) -> Result<Option<Session>, ChatError>;
    fn save(&self, session: &Session) -> Result<(), ChatError>;
    fn clear(&self) -> Result<(), ChatError>;
}

/// Stores the session as a small JSON document on disk.
pub struct FileSessionBackend {
    path: PathBuf,
}

impl FileSessionBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionBackend for FileSessionBackend {
    fn load(&self) -> Result<Option<Session>, ChatError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_str::<Session>(&raw) {
            Ok(session) => Ok(Some(session)),
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    %err,
                    "ignoring unreadable session file"
                );
                Ok(None)
            }
        }
    }

    fn save(&self, session: &Session) -> Result<(), ChatError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_string_pretty(session)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serialized)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), ChatError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Process-local backend, used by tests and throwaway sessions.
#[derive(Default)]
pub struct MemorySessionBackend {
    slot: Mutex<Option<Session>>,
}

impl MemorySessionBackend {
    pub fn with_session(session: Session) -> Self {
        Self {
            slot: Mutex::new(Some(session)),
        }
    }
}

impl SessionBackend for MemorySessionBackend {
    fn load(&self) -> Result<Option<Session>, ChatError> {
        Ok(self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, session: &Session) -> Result<(), ChatError> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), ChatError> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

pub struct SessionStore {
    backend: Box<dyn SessionBackend>,
    current: RwLock<Option<Session>>,
}

impl SessionStore {
    pub fn open(backend: impl SessionBackend + 'static) -> Result<Self, ChatError> {
        let current = backend.load()?;
        Ok(Self {
            backend: Box::new(backend),
            current: RwLock::new(current),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            backend: Box::new(MemorySessionBackend::default()),
            current: RwLock::new(None),
        }
    }

    pub fn set_session(
        &self,
        token: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Result<(), ChatError> {
        let session = Session {
            token: token.into(),
            display_name: display_name.into(),
        };
        self.backend.save(&session)?;
        info!(display_name = %session.display_name, "session stored");
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(session);
        Ok(())
    }

    /// Forgets the session in memory even if the backend fails to delete it.
    pub fn clear_session(&self) -> Result<(), ChatError> {
        let had_session = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        if had_session {
            info!("session cleared");
        }
        self.backend.clear()
    }

    pub fn current_token(&self) -> Option<String> {
        self.current()
            .map(|session| session.token)
            .filter(|token| !token.is_empty())
    }

    pub fn display_name(&self) -> Option<String> {
        self.current().map(|session| session.display_name)
    }

    pub fn current(&self) -> Option<Session> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
#[path = "tests/session_store_tests.rs"]
mod tests;
