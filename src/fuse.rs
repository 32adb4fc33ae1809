use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::attr::FileAttributes;
use crate::error::Result;
use crate::path::{self, PATH_MAX};
use crate::record::{self, S_IFDIR, S_IFLNK, S_IFREG};
use crate::registry::Registry;

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

/// FUSE frontend over a [`Registry`]. File handles are registry descriptors.
pub struct FsRootFs {
    registry: Arc<Registry>,
    /// inode -> path mapping
    inodes: RwLock<HashMap<u64, String>>,
    /// path -> inode mapping
    paths: RwLock<HashMap<String, u64>>,
    next_ino: AtomicU64,
    /// Directory listings taken at opendir, by directory handle
    listings: RwLock<HashMap<u64, Vec<(u64, FileType, String)>>>,
    next_dh: AtomicU64,
}

impl FsRootFs {
    pub fn new(registry: Arc<Registry>) -> Self {
        let mut inodes = HashMap::new();
        let mut paths = HashMap::new();

        inodes.insert(ROOT_INO, String::new());
        paths.insert(String::new(), ROOT_INO);

        Self {
            registry,
            inodes: RwLock::new(inodes),
            paths: RwLock::new(paths),
            next_ino: AtomicU64::new(ROOT_INO + 1),
            listings: RwLock::new(HashMap::new()),
            next_dh: AtomicU64::new(1),
        }
    }

    fn get_or_create_ino(&self, path: &str) -> u64 {
        if let Some(&ino) = self.paths.read().get(path) {
            return ino;
        }

        let mut paths = self.paths.write();
        let mut inodes = self.inodes.write();

        // Double-check after acquiring write lock
        if let Some(&ino) = paths.get(path) {
            return ino;
        }

        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        paths.insert(path.to_string(), ino);
        inodes.insert(ino, path.to_string());
        ino
    }

    fn get_path(&self, ino: u64) -> Option<String> {
        self.inodes.read().get(&ino).cloned()
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<String> {
        let parent = self.get_path(parent)?;
        let name = name.to_str()?;
        Some(path::join_key(&parent, name))
    }

    fn forget_path(&self, path: &str) {
        if let Some(ino) = self.paths.write().remove(path) {
            self.inodes.write().remove(&ino);
        }
    }

    /// Moves the inode of `from`, and of everything below it, to `to`.
    fn rename_path(&self, from: &str, to: &str) {
        let mut paths = self.paths.write();
        let mut inodes = self.inodes.write();

        if let Some(stale) = paths.remove(to) {
            inodes.remove(&stale);
        }

        let moved: Vec<String> = paths
            .keys()
            .filter(|p| p.as_str() == from || path::is_below(p, from))
            .cloned()
            .collect();
        for old in moved {
            if let Some(ino) = paths.remove(&old) {
                let new = format!("{to}{}", &old[from.len()..]);
                inodes.insert(ino, new.clone());
                paths.insert(new, ino);
            }
        }
    }

    fn attr(&self, ino: u64, path: &str) -> Result<FileAttr> {
        let attr = if ino == ROOT_INO {
            self.registry.root_attr()?
        } else {
            self.registry.get_attr(path)?
        };
        Ok(to_file_attr(ino, &attr))
    }

    fn entry(&self, path: &str) -> Result<FileAttr> {
        let ino = self.get_or_create_ino(path);
        self.attr(ino, path)
    }

    fn list(&self, path: &str) -> Result<Vec<(u64, FileType, String)>> {
        let mut dir = self.registry.opendir(path)?;
        let mut names = Vec::new();
        while let Some(name) = self.registry.readdir(&mut dir)? {
            names.push(name);
        }
        self.registry.closedir(dir);

        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let child = path::join_key(path, &name);
            let kind = match self.registry.get_attr(&child) {
                Ok(attr) => file_type(attr.mode),
                Err(e) => {
                    warn!(path = %child, error = %e, "skipping entry without attributes");
                    continue;
                }
            };
            entries.push((self.get_or_create_ino(&child), kind, name));
        }
        Ok(entries)
    }
}

fn file_type(mode: u32) -> FileType {
    match record::file_type(mode) {
        S_IFDIR => FileType::Directory,
        S_IFLNK => FileType::Symlink,
        _ => match mode & record::S_IFMT {
            m if m == libc::S_IFCHR as u32 => FileType::CharDevice,
            m if m == libc::S_IFBLK as u32 => FileType::BlockDevice,
            m if m == libc::S_IFIFO as u32 => FileType::NamedPipe,
            m if m == libc::S_IFSOCK as u32 => FileType::Socket,
            _ => FileType::RegularFile,
        },
    }
}

fn to_file_attr(ino: u64, attr: &FileAttributes) -> FileAttr {
    FileAttr {
        ino,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.ctime,
        kind: file_type(attr.mode),
        perm: attr.perm(),
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev as u32,
        blksize: attr.blksize,
        flags: 0,
    }
}

fn with_type(mode: u32, umask: u32, kind: u32) -> u32 {
    let perm = mode & 0o7777 & !umask;
    match record::file_type(mode) {
        0 => kind | perm,
        existing => existing | perm,
    }
}

impl Filesystem for FsRootFs {
    fn destroy(&mut self) {
        info!(open = self.registry.open_descriptors(), "filesystem unmounted");
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(child) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        debug!(path = %child, "FUSE lookup");

        if !self.registry.is_registered(&child) {
            reply.error(libc::ENOENT);
            return;
        }
        match self.entry(&child) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.get_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        debug!(path = %path, "FUSE getattr");

        match self.attr(ino, &path) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.get_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        debug!(path = %path, ?mode, ?uid, ?gid, ?size, "FUSE setattr");

        if ino == ROOT_INO {
            reply.error(libc::EPERM);
            return;
        }

        let result = (|| -> Result<FileAttr> {
            if let Some(size) = size {
                self.registry.truncate(&path, size)?;
            }
            if let Some(mode) = mode {
                self.registry.chmod(&path, mode)?;
            }
            if uid.is_some() || gid.is_some() {
                let current = self.registry.get_attr(&path)?;
                self.registry
                    .chown(&path, uid.unwrap_or(current.uid), gid.unwrap_or(current.gid))?;
            }
            self.attr(ino, &path)
        })();

        match result {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let Some(path) = self.get_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        debug!(path = %path, "FUSE readlink");

        let mut buf = vec![0u8; PATH_MAX];
        match self.registry.readlink(&path, &mut buf) {
            Ok(len) => reply.data(&buf[..len]),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(&mut self, req: &Request, parent: u64, name: &OsStr, mode: u32, umask: u32, reply: ReplyEntry) {
        let Some(child) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mode = with_type(mode, umask, S_IFDIR);
        debug!(path = %child, mode = format_args!("{mode:o}"), "FUSE mkdir");

        match self
            .registry
            .mkdir(&child, req.uid(), req.gid(), mode)
            .and_then(|()| self.entry(&child))
        {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(child) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        debug!(path = %child, "FUSE unlink");

        match self.registry.unlink(&child) {
            Ok(()) => {
                self.forget_path(&child);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(child) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        debug!(path = %child, "FUSE rmdir");

        match self.registry.rmdir(&child) {
            Ok(()) => {
                self.forget_path(&child);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn symlink(&mut self, req: &Request, parent: u64, link_name: &OsStr, target: &Path, reply: ReplyEntry) {
        let Some(child) = self.child_path(parent, link_name) else {
            reply.error(libc::ENOENT);
            return;
        };
        debug!(path = %child, target = %target.display(), "FUSE symlink");

        match self
            .registry
            .symlink(&child, target, req.uid(), req.gid(), S_IFLNK | 0o777)
            .and_then(|()| self.entry(&child))
        {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(old), Some(new)) = (self.child_path(parent, name), self.child_path(newparent, newname))
        else {
            reply.error(libc::ENOENT);
            return;
        };
        debug!(old = %old, new = %new, "FUSE rename");

        match self.registry.rename(&old, &new) {
            Ok(()) => {
                self.rename_path(&old, &new);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.get_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        debug!(path = %path, flags, "FUSE open");

        match self.registry.open(&path, flags) {
            Ok(fd) => reply.opened(fd as u64, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        if size == 0 {
            reply.data(&[]);
            return;
        }

        let mut buf = vec![0u8; size as usize];
        match self.registry.read(fh as usize, &mut buf, offset as u64) {
            Ok(outcome) => reply.data(&buf[..outcome.bytes]),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        if data.is_empty() {
            reply.written(0);
            return;
        }

        match self.registry.write(fh as usize, data, offset as u64) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn flush(&mut self, _req: &Request, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let Some(path) = self.get_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.registry.sync(&path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn fsync(&mut self, _req: &Request, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let Some(path) = self.get_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        debug!(path = %path, "FUSE fsync");
        match self.registry.sync(&path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!(fh, "FUSE release");
        match self.registry.close(fh as usize) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(path) = self.get_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        debug!(path = %path, "FUSE opendir");

        match self.list(&path) {
            Ok(entries) => {
                let dh = self.next_dh.fetch_add(1, Ordering::SeqCst);
                self.listings.write().insert(dh, entries);
                reply.opened(dh, 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(&mut self, _req: &Request, ino: u64, fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let listings = self.listings.read();
        let Some(listing) = listings.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };

        let parent_ino = self
            .get_path(ino)
            .and_then(|p| p.rsplit_once('/').map(|(parent, _)| parent.to_string()))
            .map_or(ROOT_INO, |parent| self.get_or_create_ino(&parent));

        let dots = [
            (ino, FileType::Directory, "."),
            (parent_ino, FileType::Directory, ".."),
        ];
        let entries = dots
            .into_iter()
            .chain(listing.iter().map(|(ino, kind, name)| (*ino, *kind, name.as_str())));

        for (i, (ino, kind, name)) in entries.enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, name) {
                break;
            }
        }

        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.listings.write().remove(&fh);
        reply.ok();
    }

    fn access(&mut self, _req: &Request, ino: u64, _mask: i32, reply: ReplyEmpty) {
        // Permission checks happen in the kernel (default_permissions) against
        // the logical attributes; only existence is checked here.
        match self.get_path(ino) {
            Some(path) if ino == ROOT_INO || self.registry.is_registered(&path) => reply.ok(),
            _ => reply.error(libc::ENOENT),
        }
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(child) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mode = with_type(mode, umask, S_IFREG);
        debug!(path = %child, mode = format_args!("{mode:o}"), flags, "FUSE create");

        let fd = match self.registry.create(&child, req.uid(), req.gid(), mode, flags) {
            Ok(fd) => fd,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        match self.entry(&child) {
            Ok(attr) => reply.created(&TTL, &attr, 0, fd as u64, 0),
            Err(e) => {
                if let Err(close_err) = self.registry.close(fd) {
                    warn!(path = %child, fd, error = %close_err, "failed to close after create");
                }
                reply.error(e.errno());
            }
        }
    }
}
