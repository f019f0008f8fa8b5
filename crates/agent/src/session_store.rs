use crate::crypto::{Cipher, CryptoError};

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tether_protocol::SessionToken;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session file I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("session file crypto: {0}")]
    Crypto(#[from] CryptoError),
    #[error("session file contents: {0}")]
    Format(#[from] serde_json::Error),
}

/// Persistence port for the resumable signaling session.
pub trait SessionStore: Send + Sync {
    fn load(&self) -> Result<Option<SessionToken>, StoreError>;
    fn save(&self, token: &SessionToken) -> Result<(), StoreError>;
    fn clear(&self) -> Result<(), StoreError>;
}

/// `$XDG_STATE_HOME/tether/session.bin`, else `~/.local/state/tether/session.bin`.
pub fn default_session_path() -> PathBuf {
    let base = std::env::var_os("XDG_STATE_HOME")
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local").join("state"))
        })
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    base.join("tether").join("session.bin")
}

/// Token stored as an encrypted blob; plaintext never reaches the disk.
pub struct EncryptedFileStore {
    path: PathBuf,
    cipher: Box<dyn Cipher>,
}

impl EncryptedFileStore {
    pub fn new(path: impl Into<PathBuf>, cipher: Box<dyn Cipher>) -> Self {
        Self {
            path: path.into(),
            cipher,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for EncryptedFileStore {
    fn load(&self) -> Result<Option<SessionToken>, StoreError> {
        let blob = match std::fs::read_to_string(&self.path) {
            Ok(blob) => blob,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let json = self.cipher.decrypt(&blob)?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    fn save(&self, token: &SessionToken) -> Result<(), StoreError> {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let blob = self.cipher.encrypt(&serde_json::to_string(token)?)?;
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        // Write-then-rename so a crash never leaves a truncated file behind.
        let tmp = self.path.with_extension("tmp");
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)?;
        file.write_all(blob.as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "Session token saved");
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local store for runs without a writable state directory.
#[derive(Default)]
pub struct MemoryStore {
    token: Mutex<Option<SessionToken>>,
}

impl MemoryStore {
    #[cfg(test)]
    pub fn with_token(token: SessionToken) -> Self {
        Self {
            token: Mutex::new(Some(token)),
        }
    }
}

impl SessionStore for MemoryStore {
    fn load(&self) -> Result<Option<SessionToken>, StoreError> {
        Ok(self.token.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, token: &SessionToken) -> Result<(), StoreError> {
        *self.token.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.token.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}
