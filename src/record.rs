use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

pub const S_IFMT: u32 = libc::S_IFMT as u32;
pub const S_IFREG: u32 = libc::S_IFREG as u32;
pub const S_IFDIR: u32 = libc::S_IFDIR as u32;
pub const S_IFLNK: u32 = libc::S_IFLNK as u32;

pub fn file_type(mode: u32) -> u32 {
    mode & S_IFMT
}

pub fn is_regular(mode: u32) -> bool {
    file_type(mode) == S_IFREG
}

pub fn is_directory(mode: u32) -> bool {
    file_type(mode) == S_IFDIR
}

pub fn is_symlink(mode: u32) -> bool {
    file_type(mode) == S_IFLNK
}

/// Logical metadata presented to callers in place of the real one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ownership {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Open flags a regular file internalized at creation time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecordFlags {
    /// Flush to the backing file after every write (`O_SYNC`/`O_DSYNC`).
    pub sync: bool,
    /// Delete the backing file on release (`O_TMPFILE`).
    pub tmpfile: bool,
    /// Writes land at the end of the content (`O_APPEND`).
    pub append: bool,
}

pub(crate) struct FileData {
    pub(crate) buffer: Option<Vec<u8>>,
    pub(crate) is_synced: bool,
}

pub struct RegularFile {
    pub(crate) flags: RecordFlags,
    pub(crate) data: RwLock<FileData>,
}

impl RegularFile {
    fn new(flags: RecordFlags) -> Self {
        Self {
            flags,
            data: RwLock::new(FileData {
                buffer: None,
                is_synced: true,
            }),
        }
    }

    pub fn flags(&self) -> RecordFlags {
        self.flags
    }
}

pub(crate) enum FileKind {
    Regular(RegularFile),
    Directory,
    Symlink,
}

/// Registry entry for one relative path.
pub struct FileRecord {
    path: RwLock<PathBuf>,
    ownership: RwLock<Ownership>,
    cur_offset: AtomicU64,
    kind: FileKind,
}

impl FileRecord {
    pub fn regular(path: PathBuf, ownership: Ownership, flags: RecordFlags) -> Self {
        Self::with_kind(path, ownership, FileKind::Regular(RegularFile::new(flags)))
    }

    pub fn directory(path: PathBuf, ownership: Ownership) -> Self {
        Self::with_kind(path, ownership, FileKind::Directory)
    }

    pub fn symlink(path: PathBuf, ownership: Ownership) -> Self {
        Self::with_kind(path, ownership, FileKind::Symlink)
    }

    fn with_kind(path: PathBuf, ownership: Ownership, kind: FileKind) -> Self {
        Self {
            path: RwLock::new(path),
            ownership: RwLock::new(ownership),
            cur_offset: AtomicU64::new(0),
            kind,
        }
    }

    /// Absolute backing path.
    pub fn path(&self) -> PathBuf {
        self.path.read().clone()
    }

    pub(crate) fn set_path(&self, path: PathBuf) {
        *self.path.write() = path;
    }

    pub fn ownership(&self) -> Ownership {
        *self.ownership.read()
    }

    pub(crate) fn set_mode(&self, mode: u32) {
        self.ownership.write().mode = mode;
    }

    pub(crate) fn set_owner(&self, uid: u32, gid: u32) {
        let mut ownership = self.ownership.write();
        ownership.uid = uid;
        ownership.gid = gid;
    }

    pub fn as_regular(&self) -> Option<&RegularFile> {
        match &self.kind {
            FileKind::Regular(file) => Some(file),
            _ => None,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, FileKind::Directory)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.kind, FileKind::Symlink)
    }

    pub fn cur_offset(&self) -> u64 {
        self.cur_offset.load(Ordering::Relaxed)
    }

    pub(crate) fn set_cur_offset(&self, offset: u64) {
        self.cur_offset.store(offset, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for FileRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            FileKind::Regular(_) => "regular",
            FileKind::Directory => "directory",
            FileKind::Symlink => "symlink",
        };
        f.debug_struct("FileRecord")
            .field("path", &*self.path.read())
            .field("ownership", &self.ownership())
            .field("kind", &kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_type_bits() {
        assert!(is_regular(0o100700));
        assert!(is_directory(0o040700));
        assert!(is_symlink(0o120600));
        assert!(!is_regular(0o040700));
        assert!(!is_regular(0o700));
    }

    #[test]
    fn ownership_updates() {
        let record = FileRecord::directory(
            PathBuf::from("/srv/d"),
            Ownership {
                mode: 0o040700,
                uid: 1000,
                gid: 1000,
            },
        );
        record.set_mode(0o040755);
        record.set_owner(0, 5);
        assert_eq!(
            record.ownership(),
            Ownership {
                mode: 0o040755,
                uid: 0,
                gid: 5
            }
        );
        assert!(record.is_directory());
        assert!(record.as_regular().is_none());
    }
}
