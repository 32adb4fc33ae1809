use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::record::Ownership;

/// `stat`-like view of a registered path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileAttributes {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub blocks: u64,
    pub blksize: u32,
    pub nlink: u32,
    pub ino: u64,
    pub rdev: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl FileAttributes {
    /// Real metadata as the backing store reports it.
    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            mode: metadata.mode(),
            uid: metadata.uid(),
            gid: metadata.gid(),
            size: metadata.size(),
            blocks: metadata.blocks(),
            blksize: metadata.blksize() as u32,
            nlink: metadata.nlink() as u32,
            ino: metadata.ino(),
            rdev: metadata.rdev(),
            atime: timestamp(metadata.atime(), metadata.atime_nsec()),
            mtime: timestamp(metadata.mtime(), metadata.mtime_nsec()),
            ctime: timestamp(metadata.ctime(), metadata.ctime_nsec()),
        }
    }

    /// Replaces mode, owner and group with the logical ones.
    pub fn with_ownership(mut self, ownership: Ownership) -> Self {
        self.mode = ownership.mode;
        self.uid = ownership.uid;
        self.gid = ownership.gid;
        self
    }

    pub fn perm(&self) -> u16 {
        (self.mode & 0o7777) as u16
    }
}

fn timestamp(secs: i64, nsecs: i64) -> SystemTime {
    let nsecs = nsecs.clamp(0, 999_999_999) as u32;
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + Duration::from_nanos(nsecs as u64)
    }
}
