//! Directories and symlinks.
//!
//! The tree itself lives in the backing root; these operations keep the
//! registry's entries in step with it.

use std::fs::{self, DirBuilder, ReadDir};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::error::{RegistryError, Result};
use crate::path;
use crate::record::{self, FileRecord, Ownership};
use crate::registry::Registry;

const BACKING_DIR_PERM: u32 = 0o700;

/// Handle returned by [`Registry::opendir`].
pub struct DirStream {
    key: String,
    entries: ReadDir,
}

impl DirStream {
    /// Registry key of the directory being listed.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Registry {
    /// Creates a symlink at `linkpath` pointing at `target`, which is stored
    /// verbatim.
    pub fn symlink(
        &self,
        linkpath: &str,
        target: impl AsRef<Path>,
        uid: u32,
        gid: u32,
        mode: u32,
    ) -> Result<()> {
        let key = Self::key(linkpath)?;
        if !record::is_symlink(mode) {
            return Err(RegistryError::BadArgs);
        }

        let _namespace = self.namespace.lock();
        if self.files.read().contains_key(&key) {
            return Err(RegistryError::Exists);
        }

        let full = self.root.full_path(&key)?;
        std::os::unix::fs::symlink(target.as_ref(), &full)?;

        let record = FileRecord::symlink(full, Ownership { mode, uid, gid });
        self.files.write().insert(key.clone(), Arc::new(record));
        debug!(path = %key, target = %target.as_ref().display(), "symlink");
        Ok(())
    }

    /// Copies the NUL-terminated target of `linkpath` into `buf` and returns
    /// the target's length. A buffer shorter than the target plus the NUL is
    /// left untouched and the error carries the size needed.
    pub fn readlink(&self, linkpath: &str, buf: &mut [u8]) -> Result<usize> {
        let key = Self::key(linkpath)?;
        let record = self.lookup(&key)?;
        if !record.is_symlink() {
            return Err(RegistryError::NotExists);
        }

        let full = record.path();
        let link_len = fs::symlink_metadata(&full)?.len() as usize;
        let required = link_len + 1;
        if buf.len() < required {
            return Err(RegistryError::NoMem {
                required: Some(required),
            });
        }

        let target = fs::read_link(&full)?;
        let target = target.as_os_str().as_bytes();
        if buf.len() < target.len() + 1 {
            // Link replaced by a longer one since the lstat.
            return Err(RegistryError::NoMem {
                required: Some(target.len() + 1),
            });
        }

        buf[..target.len()].copy_from_slice(target);
        buf[target.len()] = 0;
        Ok(target.len())
    }

    pub fn mkdir(&self, path: &str, uid: u32, gid: u32, mode: u32) -> Result<()> {
        let key = Self::key(path)?;
        if !record::is_directory(mode) {
            return Err(RegistryError::BadArgs);
        }

        let _namespace = self.namespace.lock();
        if self.files.read().contains_key(&key) {
            return Err(RegistryError::Exists);
        }

        let full = self.root.full_path(&key)?;
        DirBuilder::new().mode(BACKING_DIR_PERM).create(&full)?;

        let record = FileRecord::directory(full, Ownership { mode, uid, gid });
        self.files.write().insert(key.clone(), Arc::new(record));
        debug!(path = %key, mode = format_args!("{mode:o}"), uid, gid, "mkdir");
        Ok(())
    }

    /// Removes an empty directory. Fails with `NonEmpty` while any registered
    /// path lives below it.
    pub fn rmdir(&self, path: &str) -> Result<()> {
        let key = Self::key(path)?;
        let _namespace = self.namespace.lock();
        let record = self.lookup(&key)?;
        if !record.is_directory() {
            return Err(RegistryError::NotExists);
        }

        if self.files.read().keys().any(|child| path::is_below(child, &key)) {
            return Err(RegistryError::NonEmpty);
        }

        match fs::remove_dir(record.path()) {
            Ok(()) => {}
            Err(e) if matches!(e.raw_os_error(), Some(libc::ENOTEMPTY | libc::EEXIST)) => {
                return Err(RegistryError::NonEmpty);
            }
            Err(e) => return Err(e.into()),
        }

        self.unregister(&key, &record);
        debug!(path = %key, "rmdir");
        Ok(())
    }

    /// Moves `path` to `newpath`. Registered entries below a renamed
    /// directory move along with it.
    pub fn rename(&self, path: &str, newpath: &str) -> Result<()> {
        let key = Self::key(path)?;
        let new_key = Self::key(newpath)?;

        let _namespace = self.namespace.lock();
        let record = self.lookup(&key)?;
        if self.files.read().contains_key(&new_key) {
            return Err(RegistryError::Exists);
        }

        let new_full = self.root.full_path(&new_key)?;
        let moved = {
            let files = self.files.read();
            let mut moved = Vec::new();
            for child in files.keys().filter(|child| path::is_below(child, &key)) {
                let child_key = format!("{new_key}{}", &child[key.len()..]);
                let child_full = self.root.full_path(&child_key)?;
                moved.push((child.clone(), child_key, child_full));
            }
            moved
        };

        fs::rename(record.path(), &new_full)?;

        let mut files = self.files.write();
        for (child, child_key, child_full) in moved {
            if let Some(child_record) = files.remove(&child) {
                child_record.set_path(child_full);
                files.insert(child_key, child_record);
            }
        }

        files.remove(&key);
        record.set_path(new_full);
        files.insert(new_key.clone(), record);
        debug!(from = %key, to = %new_key, "rename");
        Ok(())
    }

    /// Starts listing a registered directory. The empty path is the root.
    pub fn opendir(&self, path: &str) -> Result<DirStream> {
        let key = path::normalize(path)?;
        let full = if key.is_empty() {
            self.root.full_path("")?
        } else {
            let record = self.lookup(&key)?;
            if !record.is_directory() {
                return Err(RegistryError::NotExists);
            }
            record.path()
        };

        let entries = fs::read_dir(full)?;
        Ok(DirStream { key, entries })
    }

    /// Next registered entry of `dir`, or `None` once the listing is done.
    /// Entries on disk the registry does not know about are skipped.
    pub fn readdir(&self, dir: &mut DirStream) -> Result<Option<String>> {
        for entry in dir.entries.by_ref() {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if self.files.read().contains_key(&path::join_key(&dir.key, &name)) {
                return Ok(Some(name));
            }
        }
        Ok(None)
    }

    pub fn closedir(&self, dir: DirStream) {
        debug!(path = %dir.key, "closedir");
    }
}
