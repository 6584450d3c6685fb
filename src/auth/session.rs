//! Session storage and management
//!
//! Persists every session obtained from the cloud to a YAML file, by default
//! `~/.cloudlink/cloud/auth.yaml`. The file holds a bearer secret, so both the
//! file and its directory are created owner-only.
//!
//! There is no file locking. Two sign-ins running at once on the same machine
//! race on load-modify-save and the later save wins; callers run one sign-in
//! at a time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use crate::Result;
use crate::error::Error;

#[cfg(unix)]
const STORE_FILE_MODE: u32 = 0o600;
#[cfg(unix)]
const STORE_DIR_MODE: u32 = 0o700;

/// One authenticated identity
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Stable identifier from the identity service
    pub user_id: String,

    /// Opaque bearer credential
    pub token: String,

    /// When this CLI received the session
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(user_id: String, token: String) -> Self {
        Self {
            user_id,
            token,
            created_at: Utc::now(),
        }
    }
}

// Keeps the token out of logs and panic messages.
impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Contents of the session store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Store {
    /// User ID of the active session, empty when nobody is signed in
    #[serde(default)]
    pub current: String,

    /// Sessions in the order they were obtained
    #[serde(default)]
    pub sessions: Vec<Session>,
}

impl Store {
    /// The session whose user is `current`
    pub fn current_session(&self) -> Result<&Session> {
        if self.current.is_empty() {
            return Err(Error::NoCurrentSession);
        }

        self.sessions
            .iter()
            .find(|session| session.user_id == self.current)
            .ok_or(Error::NoCurrentSession)
    }

    /// Make `session` the current one
    ///
    /// A previous session for the same user is dropped, so each user keeps a
    /// single credential and `sessions` stays in chronological order.
    pub fn record(&mut self, session: Session) {
        self.sessions.retain(|existing| existing.user_id != session.user_id);
        self.current = session.user_id.clone();
        self.sessions.push(session);
    }
}

/// Reads and writes the [`Store`] at a fixed path
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the store; a missing file is an empty store
    pub fn load(&self) -> Result<Store> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Store::default()),
            Err(source) => {
                return Err(Error::Io {
                    action: "read session store",
                    path: self.path.clone(),
                    source,
                })
            }
        };

        // serde_yaml rejects an empty document, an empty file is an empty store
        if content.trim().is_empty() {
            return Ok(Store::default());
        }

        serde_yaml::from_str(&content).map_err(|source| Error::StoreDecode {
            path: self.path.clone(),
            source,
        })
    }

    /// Write the store, creating its directory if needed
    ///
    /// The content goes to a sibling temporary file first and is renamed over
    /// the store, so readers never observe a half-written file.
    pub fn save(&self, store: &Store) -> Result<()> {
        let content = serde_yaml::to_string(store).map_err(Error::Encode)?;

        if let Some(parent) = self.path.parent() {
            create_private_dir(parent).map_err(|source| Error::Io {
                action: "create config directory",
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let tmp_path = self.path.with_extension("yaml.tmp");
        write_private_file(&tmp_path, content.as_bytes()).map_err(|source| Error::Io {
            action: "write session store",
            path: tmp_path.clone(),
            source,
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|source| {
            let _ = std::fs::remove_file(&tmp_path);
            Error::Io {
                action: "replace session store",
                path: self.path.clone(),
                source,
            }
        })?;

        tracing::debug!("Saved {} session(s) to {:?}", store.sessions.len(), self.path);
        Ok(())
    }

    /// Shortcut for `load()?.current_session()`
    pub fn current_session(&self) -> Result<Session> {
        self.load()?.current_session().cloned()
    }
}

fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(STORE_DIR_MODE);
    }

    builder.create(dir)
}

fn write_private_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(STORE_FILE_MODE);
    }

    let mut file = options.open(path)?;

    // mode() only applies on creation; tighten a leftover file too
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(STORE_FILE_MODE))?;
    }

    file.write_all(content)?;
    file.sync_all()
}
