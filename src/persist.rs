//! File-backed blob storage with atomic replacement and numbered backups.

use std::{
    fs::{self, OpenOptions},
    io::{self, Write as _},
    path::{Path, PathBuf},
};

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to rename {from} to {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read {path} and no backup could be recovered: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Keyed byte storage for a single document.
pub trait BlobStore: Send + Sync {
    /// Returns `None` when nothing has been written yet.
    fn read(&self) -> Result<Option<Vec<u8>>, PersistError>;

    fn write(&self, data: &[u8]) -> Result<(), PersistError>;

    fn exists(&self) -> bool;
}

/// A [`BlobStore`] over one file.
///
/// Writes go to `<file>.tmp` and are renamed over the target. Before each write the current file
/// is copied to `<file>.backup.1`, shifting older copies up to `<file>.backup.<backup_count>`.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
    backup_count: usize,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>, backup_count: usize) -> Self {
        Self {
            path: path.into(),
            backup_count,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self, n: usize) -> PathBuf {
        with_suffix(&self.path, &format!("backup.{n}"))
    }

    fn rotate_backups(&self) -> io::Result<()> {
        if self.backup_count == 0 || !self.path.exists() {
            return Ok(());
        }

        let oldest = self.backup_path(self.backup_count);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }

        for n in (1..self.backup_count).rev() {
            let from = self.backup_path(n);
            if from.exists() {
                fs::rename(&from, self.backup_path(n + 1))?;
            }
        }

        fs::copy(&self.path, self.backup_path(1))?;
        Ok(())
    }

    fn recover_from_backup(&self) -> Option<Vec<u8>> {
        (1..=self.backup_count).find_map(|n| {
            let backup = self.backup_path(n);
            let data = fs::read(&backup).ok()?;
            log::warn!("Recovered {} from {}", self.path.display(), backup.display());
            Some(data)
        })
    }
}

impl BlobStore for FileStore {
    fn read(&self) -> Result<Option<Vec<u8>>, PersistError> {
        match fs::read(&self.path) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => {
                log::error!("Failed to read {}: {source}", self.path.display());

                self.recover_from_backup()
                    .map(Some)
                    .ok_or_else(|| PersistError::Read {
                        path: self.path.clone(),
                        source,
                    })
            }
        }
    }

    fn write(&self, data: &[u8]) -> Result<(), PersistError> {
        ensure_parent_dir(&self.path)?;

        if let Err(err) = self.rotate_backups() {
            log::warn!("Failed to rotate backups of {}: {err}", self.path.display());
        }

        let staged = stage(&self.path, data, None)?;
        commit(&staged, &self.path)
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

pub(crate) fn ensure_parent_dir(path: &Path) -> Result<(), PersistError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|source| PersistError::CreateDir {
                path: parent.to_owned(),
                source,
            })
        }
        _ => Ok(()),
    }
}

/// Writes `data` to `<path>.tmp` and syncs it; `mode` sets Unix permissions on creation.
pub(crate) fn stage(path: &Path, data: &[u8], mode: Option<u32>) -> Result<PathBuf, PersistError> {
    let tmp = with_suffix(path, "tmp");

    let write = || -> io::Result<()> {
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);

        #[cfg(unix)]
        if let Some(mode) = mode {
            use std::os::unix::fs::{OpenOptionsExt as _, PermissionsExt as _};

            options.mode(mode);
            let mut file = options.open(&tmp)?;
            // mode() is filtered by the umask; make the result exact
            file.set_permissions(fs::Permissions::from_mode(mode))?;
            file.write_all(data)?;
            return file.sync_all();
        }

        #[cfg(not(unix))]
        let _ = mode;

        let mut file = options.open(&tmp)?;
        file.write_all(data)?;
        file.sync_all()
    };

    write().map_err(|source| {
        let _ = fs::remove_file(&tmp);
        PersistError::Write {
            path: tmp.clone(),
            source,
        }
    })?;

    Ok(tmp)
}

/// Renames a file produced by [`stage`] over its target.
pub(crate) fn commit(staged: &Path, path: &Path) -> Result<(), PersistError> {
    fs::rename(staged, path).map_err(|source| PersistError::Rename {
        from: staged.to_owned(),
        to: path.to_owned(),
        source,
    })
}
