//! The metadata registry.
//!
//! Maps relative paths to [`FileRecord`]s and owns them. File bytes live in
//! the backing root; mode, owner and group live only here. Namespace changes
//! are serialized by one registry-wide mutex, file I/O by the per-record lock.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::attr::FileAttributes;
use crate::buffer::ReadOutcome;
use crate::error::{RegistryError, Result};
use crate::handles::{Descriptor, OpenFile, OpenFileTable};
use crate::path::{self, BackingRoot};
use crate::record::{self, FileRecord, Ownership, RecordFlags, RegularFile};

/// Permission bits of every file the registry creates on disk. The logical
/// mode callers see is kept in the record.
const BACKING_FILE_PERM: u32 = 0o600;

pub struct Registry {
    pub(crate) root: BackingRoot,
    pub(crate) files: RwLock<HashMap<String, Arc<FileRecord>>>,
    pub(crate) namespace: Mutex<()>,
    pub(crate) handles: OpenFileTable,
}

impl Registry {
    /// Sets up an empty registry over the backing directory `root`.
    pub fn init(root: impl Into<PathBuf>) -> Result<Self> {
        let root = BackingRoot::new(root)?;
        info!(root = %root.path().display(), "registry initialized");
        Ok(Self {
            root,
            files: RwLock::new(HashMap::new()),
            namespace: Mutex::new(()),
            handles: OpenFileTable::new(),
        })
    }

    /// Releases every record, best-effort, and invalidates all descriptors.
    pub fn deinit(self) {
        drop(self);
    }

    fn teardown(&self) {
        let records = std::mem::take(&mut *self.files.write());
        for (key, record) in records {
            let Some(file) = record.as_regular() else {
                continue;
            };
            let path = record.path();
            if file.flags().tmpfile {
                remove_backing(&path);
            } else if !file.is_synced() {
                if let Err(e) = file.sync(&path) {
                    warn!(path = %key, error = %e, "failed to sync on deinit");
                }
            }
            file.discard();
        }
        self.handles.clear();
        debug!("registry torn down");
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn is_registered(&self, path: &str) -> bool {
        path::normalize(path).is_ok_and(|key| self.files.read().contains_key(&key))
    }

    /// Number of live descriptors across all records.
    pub fn open_descriptors(&self) -> usize {
        self.handles.len()
    }

    /// Key for an operation that cannot target the root itself.
    pub(crate) fn key(path: &str) -> Result<String> {
        let key = path::normalize(path)?;
        if key.is_empty() {
            return Err(RegistryError::BadArgs);
        }
        Ok(key)
    }

    pub(crate) fn lookup(&self, key: &str) -> Result<Arc<FileRecord>> {
        self.files
            .read()
            .get(key)
            .cloned()
            .ok_or(RegistryError::NotExists)
    }

    fn lookup_regular(&self, key: &str) -> Result<Arc<FileRecord>> {
        let record = self.lookup(key)?;
        if record.as_regular().is_none() {
            return Err(RegistryError::NotExists);
        }
        Ok(record)
    }

    /// Removes `key` if it still maps to `record`.
    pub(crate) fn unregister(&self, key: &str, record: &Arc<FileRecord>) {
        let mut files = self.files.write();
        if files.get(key).is_some_and(|current| Arc::ptr_eq(current, record)) {
            files.remove(key);
        }
    }

    fn key_of(&self, record: &Arc<FileRecord>) -> Option<String> {
        self.files
            .read()
            .iter()
            .find(|(_, candidate)| Arc::ptr_eq(candidate, record))
            .map(|(key, _)| key.clone())
    }

    /// Creates a regular file and opens it.
    pub fn create(&self, path: &str, uid: u32, gid: u32, mode: u32, flags: i32) -> Result<Descriptor> {
        let key = Self::key(path)?;
        if !record::is_regular(mode) {
            return Err(RegistryError::BadArgs);
        }

        let _namespace = self.namespace.lock();
        if self.files.read().contains_key(&key) {
            return Err(RegistryError::Exists);
        }

        let (flags, record_flags) = internalize_flags(flags)?;
        let full = self.root.full_path(&key)?;

        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(BACKING_FILE_PERM)
            .custom_flags(flags & !libc::O_ACCMODE)
            .open(&full)?;

        let record = Arc::new(FileRecord::regular(
            full,
            Ownership { mode, uid, gid },
            record_flags,
        ));
        let fd = match self.handles.open_handle(&record, flags) {
            Ok(fd) => fd,
            Err(e) => {
                remove_backing(&record.path());
                return Err(e);
            }
        };
        self.files.write().insert(key.clone(), record);

        debug!(path = %key, fd, mode = format_args!("{mode:o}"), uid, gid, ?record_flags, "created");
        Ok(fd)
    }

    /// Opens an already registered regular file. Creation and truncation
    /// flags are ignored.
    pub fn open(&self, path: &str, flags: i32) -> Result<Descriptor> {
        let key = Self::key(path)?;
        let record = self.lookup_regular(&key)?;
        let fd = self.handles.open_handle(&record, flags)?;
        debug!(path = %key, fd, "opened");
        Ok(fd)
    }

    fn descriptor(&self, fd: Descriptor) -> Result<(Arc<OpenFile>, Arc<FileRecord>)> {
        let handle = self.handles.get(fd)?;
        let record = handle.record().ok_or(RegistryError::BadArgs)?;
        Ok((handle, record))
    }

    /// Reads up to `buf.len()` bytes at `offset`.
    pub fn read(&self, fd: Descriptor, buf: &mut [u8], offset: u64) -> Result<ReadOutcome> {
        if buf.is_empty() {
            return Err(RegistryError::BadArgs);
        }
        let (handle, record) = self.descriptor(fd)?;
        if !handle.can_read() {
            return Err(RegistryError::Syscall(libc::EBADF));
        }
        let file = record.as_regular().ok_or(RegistryError::BadArgs)?;

        let outcome = file.read(&record.path(), buf, offset)?;
        record.set_cur_offset(offset + outcome.bytes as u64);
        Ok(outcome)
    }

    /// Writes all of `data` at `offset`, extending the file as needed.
    pub fn write(&self, fd: Descriptor, data: &[u8], offset: u64) -> Result<usize> {
        if data.is_empty() {
            return Err(RegistryError::BadArgs);
        }
        let (handle, record) = self.descriptor(fd)?;
        if !handle.can_write() {
            return Err(RegistryError::Syscall(libc::EBADF));
        }
        let file = record.as_regular().ok_or(RegistryError::BadArgs)?;

        let start = file.write(&record.path(), data, offset)?;
        record.set_cur_offset(start + data.len() as u64);
        Ok(data.len())
    }

    /// Flushes the in-memory content of `path` to the backing file.
    pub fn sync(&self, path: &str) -> Result<()> {
        let key = Self::key(path)?;
        let record = self.lookup_regular(&key)?;
        let file = record.as_regular().ok_or(RegistryError::NotExists)?;
        file.sync(&record.path())?;
        debug!(path = %key, "synced");
        Ok(())
    }

    /// Closes every descriptor of `path` and drops its buffer, syncing it
    /// first. Temporary files are deleted and unregistered instead.
    pub fn release(&self, path: &str) -> Result<()> {
        let key = Self::key(path)?;
        let record = self.lookup_regular(&key)?;
        let file = record.as_regular().ok_or(RegistryError::NotExists)?;

        let closed = if file.flags().tmpfile {
            let closed = self.handles.close_handle(&record);
            self.drop_tmpfile(&record, file);
            closed
        } else {
            let path = record.path();
            if !file.is_synced() {
                file.sync(&path)?;
            }
            let closed = self.handles.close_handle(&record);
            file.discard_if(&path, || self.handles.count_for(&record) == 0)?;
            closed
        };

        debug!(path = %key, closed, "released");
        if closed == 0 {
            return Err(RegistryError::NotOpen);
        }
        Ok(())
    }

    /// Closes one descriptor. Closing the last descriptor of a file syncs and
    /// frees its buffer; a temporary file is deleted.
    pub fn close(&self, fd: Descriptor) -> Result<()> {
        let (handle, remaining) = self.handles.close(fd)?;
        let Some(record) = handle.target() else {
            return Ok(());
        };
        debug!(fd, offset = record.cur_offset(), remaining, "descriptor closed");

        let Some(file) = record.as_regular() else {
            return Ok(());
        };
        if remaining > 0 {
            return Ok(());
        }

        if file.flags().tmpfile {
            self.drop_tmpfile(&record, file);
            return Ok(());
        }
        // A descriptor opened since keeps the buffer alive.
        file.discard_if(&record.path(), || self.handles.count_for(&record) == 0)?;
        Ok(())
    }

    fn drop_tmpfile(&self, record: &Arc<FileRecord>, file: &RegularFile) {
        remove_backing(&record.path());
        let _namespace = self.namespace.lock();
        if let Some(key) = self.key_of(record) {
            self.unregister(&key, record);
        }
        file.discard();
    }

    /// Logical mode, owner and group over the backing store's `lstat`.
    pub fn get_attr(&self, path: &str) -> Result<FileAttributes> {
        let key = Self::key(path)?;
        let record = self.lookup(&key)?;
        let metadata = fs::symlink_metadata(record.path())?;

        let mut attr = FileAttributes::from_metadata(&metadata).with_ownership(record.ownership());
        if let Some(len) = record.as_regular().and_then(RegularFile::loaded_len) {
            attr.size = len as u64;
        }
        Ok(attr)
    }

    /// Real attributes of the backing root.
    pub fn root_attr(&self) -> Result<FileAttributes> {
        let metadata = fs::metadata(self.root.path())?;
        Ok(FileAttributes::from_metadata(&metadata))
    }

    /// Replaces the logical mode. The file type cannot change; a mode without
    /// type bits only replaces the permission bits.
    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let key = Self::key(path)?;
        let record = self.lookup(&key)?;
        let current = record::file_type(record.ownership().mode);

        let mode = match record::file_type(mode) {
            0 => current | mode,
            requested if requested == current => mode,
            _ => return Err(RegistryError::BadArgs),
        };
        record.set_mode(mode);
        debug!(path = %key, mode = format_args!("{mode:o}"), "chmod");
        Ok(())
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        let key = Self::key(path)?;
        let record = self.lookup(&key)?;
        record.set_owner(uid, gid);
        debug!(path = %key, uid, gid, "chown");
        Ok(())
    }

    /// Deletes a file or symlink, invalidating its descriptors.
    pub fn unlink(&self, path: &str) -> Result<()> {
        let key = Self::key(path)?;
        let _namespace = self.namespace.lock();
        let record = self.lookup(&key)?;
        if record.is_directory() {
            return Err(RegistryError::Syscall(libc::EISDIR));
        }

        fs::remove_file(record.path())?;
        let closed = self.handles.close_handle(&record);
        if let Some(file) = record.as_regular() {
            file.discard();
        }
        self.unregister(&key, &record);
        debug!(path = %key, closed, "unlinked");
        Ok(())
    }

    /// Changes the content length of a regular file.
    pub fn truncate(&self, path: &str, size: u64) -> Result<()> {
        let key = Self::key(path)?;
        let record = self.lookup_regular(&key)?;
        let file = record.as_regular().ok_or(RegistryError::NotExists)?;
        file.truncate(&record.path(), size)?;
        debug!(path = %key, size, "truncated");
        Ok(())
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Strips the flags `create` handles itself. Returns what remains for the
/// real `open` together with the flags the record keeps.
fn internalize_flags(mut flags: i32) -> Result<(i32, RecordFlags)> {
    let mut record_flags = RecordFlags::default();

    // O_TMPFILE includes the O_DIRECTORY bit.
    if flags & libc::O_TMPFILE == libc::O_TMPFILE {
        flags &= !libc::O_TMPFILE;
        record_flags.tmpfile = true;
    }

    if flags & libc::O_ASYNC != 0 {
        return Err(RegistryError::Syscall(libc::EINVAL));
    }
    if flags & libc::O_DIRECTORY != 0 {
        return Err(RegistryError::Syscall(libc::ENOTDIR));
    }
    if flags & libc::O_NOCTTY != 0 {
        return Err(RegistryError::Syscall(libc::EINVAL));
    }
    if flags & libc::O_NOFOLLOW != 0 {
        return Err(RegistryError::Syscall(libc::ELOOP));
    }

    flags &= !(libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC);

    if flags & libc::O_APPEND != 0 {
        flags &= !libc::O_APPEND;
        record_flags.append = true;
    }
    // O_SYNC includes the O_DSYNC bit.
    if flags & libc::O_SYNC == libc::O_SYNC {
        flags &= !libc::O_SYNC;
        record_flags.sync = true;
    }
    if flags & libc::O_DSYNC == libc::O_DSYNC {
        flags &= !libc::O_DSYNC;
        record_flags.sync = true;
    }

    Ok((flags, record_flags))
}

/// Best-effort removal of a backing file nothing will flush to again.
fn remove_backing(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "failed to remove backing file");
    }
}
