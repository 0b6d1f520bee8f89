//! Persisted client identity record: the signed-in user's profile plus the
//! credential the authenticated client sends.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed reading identity record {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed parsing identity record {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed writing identity record {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("failed deleting identity record {path}: {source}")]
    Remove { path: PathBuf, source: io::Error },
    #[error("identity record lock poisoned")]
    Poisoned,
}

/// Signed-in user as known to the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// Profile plus bearer credential.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityRecord {
    pub user: UserProfile,
    pub credential: String,
}

/// In-memory identity mirrored to a JSON file.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    path: PathBuf,
    current: Arc<RwLock<Option<IdentityRecord>>>,
}

impl IdentityStore {
    /// Open the store and load any record persisted at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, IdentityError> {
        let path = path.into();
        let current = load_identity(&path)?;
        Ok(Self {
            path,
            current: Arc::new(RwLock::new(current)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> Option<IdentityRecord> {
        self.current.read().ok().and_then(|guard| guard.clone())
    }

    /// Bearer credential of the signed-in user, if any.
    pub fn credential(&self) -> Option<String> {
        self.current().map(|record| record.credential)
    }

    /// Persist the record to disk, then publish it in memory.
    pub fn set(&self, record: IdentityRecord) -> Result<(), IdentityError> {
        save_identity(&self.path, &record)?;
        *self.current.write().map_err(|_| IdentityError::Poisoned)? = Some(record);
        Ok(())
    }

    /// Forget the record in memory and on disk.
    ///
    /// Memory is cleared first so no caller picks up the credential while the
    /// file is being removed.
    pub fn clear(&self) -> Result<(), IdentityError> {
        let had_record = self
            .current
            .write()
            .map_err(|_| IdentityError::Poisoned)?
            .take()
            .is_some();
        clear_identity(&self.path)?;
        debug!(path = %self.path.display(), had_record, "cleared identity record");
        Ok(())
    }
}

fn load_identity(path: &Path) -> Result<Option<IdentityRecord>, IdentityError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(IdentityError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    serde_json::from_str::<IdentityRecord>(&raw)
        .map(Some)
        .map_err(|source| IdentityError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

fn save_identity(path: &Path, record: &IdentityRecord) -> Result<(), IdentityError> {
    let write_err = |source| IdentityError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }

    let encoded = serde_json::to_vec(record).map_err(|err| write_err(io::Error::other(err)))?;
    let temp_path = identity_temp_path(path);
    fs::write(&temp_path, encoded).map_err(write_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&temp_path, fs::Permissions::from_mode(0o600)).map_err(write_err)?;
    }

    if fs::rename(&temp_path, path).is_err() {
        // Windows does not allow replacing existing files via rename.
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                let _ = fs::remove_file(&temp_path);
                return Err(write_err(err));
            }
        }
        fs::rename(&temp_path, path).map_err(|err| {
            let _ = fs::remove_file(&temp_path);
            write_err(err)
        })?;
    }

    Ok(())
}

fn clear_identity(path: &Path) -> Result<(), IdentityError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(IdentityError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn identity_temp_path(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("identity.json");
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    parent.join(format!(".{file_name}.{now_nanos}.tmp"))
}
