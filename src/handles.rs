//! Open-file table.
//!
//! Descriptors are indices into a dense slot array guarded by one lock. A
//! closed descriptor's slot is reused by a later open; trailing free slots are
//! dropped. Closing all descriptors of a record scans every slot, which is fine
//! for the handful of files a mount keeps open at once.

use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{RegistryError, Result};
use crate::record::FileRecord;

pub type Descriptor = usize;

const INITIAL_SLOTS: usize = 5;

/// One open instance of a file record.
#[derive(Debug)]
pub struct OpenFile {
    can_read: bool,
    can_write: bool,
    deleted: AtomicBool,
    file: Weak<FileRecord>,
}

impl OpenFile {
    fn new(file: &Arc<FileRecord>, flags: i32) -> Self {
        let (can_read, can_write) = match flags & libc::O_ACCMODE {
            libc::O_WRONLY => (false, true),
            libc::O_RDWR => (true, true),
            _ => (true, false),
        };
        Self {
            can_read,
            can_write,
            deleted: AtomicBool::new(false),
            file: Arc::downgrade(file),
        }
    }

    pub fn can_read(&self) -> bool {
        self.can_read
    }

    pub fn can_write(&self) -> bool {
        self.can_write
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// The record this descriptor refers to, unless it was released or
    /// unregistered since.
    pub fn record(&self) -> Option<Arc<FileRecord>> {
        if self.is_deleted() {
            return None;
        }
        self.file.upgrade()
    }

    /// The record regardless of the tombstone, for work that follows a close.
    pub(crate) fn target(&self) -> Option<Arc<FileRecord>> {
        self.file.upgrade()
    }

    fn refers_to(&self, record: &Arc<FileRecord>) -> bool {
        ptr::eq(self.file.as_ptr(), Arc::as_ptr(record))
    }

    fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }
}

struct Slots {
    entries: Vec<Option<Arc<OpenFile>>>,
    used: usize,
    allocated: usize,
}

impl Slots {
    fn compact(&mut self) {
        while matches!(self.entries.last(), Some(None)) {
            self.entries.pop();
        }
    }
}

pub struct OpenFileTable {
    slots: RwLock<Slots>,
}

impl OpenFileTable {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Slots {
                entries: Vec::with_capacity(INITIAL_SLOTS),
                used: 0,
                allocated: INITIAL_SLOTS,
            }),
        }
    }

    /// Registers a new open instance of `record` with the capabilities the
    /// access mode in `flags` grants.
    pub fn open_handle(&self, record: &Arc<FileRecord>, flags: i32) -> Result<Descriptor> {
        let handle = Arc::new(OpenFile::new(record, flags));
        let mut slots = self.slots.write();

        if slots.used == slots.allocated {
            let grow_by = slots.allocated;
            slots
                .entries
                .try_reserve_exact(grow_by)
                .map_err(|_| RegistryError::out_of_memory())?;
            slots.allocated += grow_by;
        }

        let fd = match slots.entries.iter().position(Option::is_none) {
            Some(free) => {
                slots.entries[free] = Some(handle);
                free
            }
            None => {
                slots.entries.push(Some(handle));
                slots.entries.len() - 1
            }
        };
        slots.used += 1;

        debug!(fd, used = slots.used, allocated = slots.allocated, "descriptor opened");
        Ok(fd)
    }

    pub fn get(&self, fd: Descriptor) -> Result<Arc<OpenFile>> {
        self.slots
            .read()
            .entries
            .get(fd)
            .and_then(Option::clone)
            .ok_or(RegistryError::BadArgs)
    }

    /// Closes a single descriptor. Also returns how many descriptors of the
    /// same record are still open, counted under the same lock.
    pub fn close(&self, fd: Descriptor) -> Result<(Arc<OpenFile>, usize)> {
        let mut slots = self.slots.write();
        let handle = slots
            .entries
            .get_mut(fd)
            .and_then(Option::take)
            .ok_or(RegistryError::BadArgs)?;
        handle.mark_deleted();
        slots.used -= 1;
        slots.compact();

        let remaining = slots
            .entries
            .iter()
            .flatten()
            .filter(|other| ptr::eq(other.file.as_ptr(), handle.file.as_ptr()))
            .count();
        Ok((handle, remaining))
    }

    /// Closes every descriptor referring to `record` and returns how many
    /// there were.
    pub fn close_handle(&self, record: &Arc<FileRecord>) -> usize {
        let mut slots = self.slots.write();
        let mut closed = 0;

        for slot in slots.entries.iter_mut() {
            if slot.as_ref().is_some_and(|handle| handle.refers_to(record)) {
                if let Some(handle) = slot.take() {
                    handle.mark_deleted();
                    closed += 1;
                }
            }
        }

        if closed > 0 {
            slots.used -= closed;
            slots.compact();
            debug!(closed, used = slots.used, "descriptors closed");
        }
        closed
    }

    pub fn count_for(&self, record: &Arc<FileRecord>) -> usize {
        self.slots
            .read()
            .entries
            .iter()
            .flatten()
            .filter(|handle| handle.refers_to(record))
            .count()
    }

    /// Invalidates every descriptor.
    pub fn clear(&self) {
        let mut slots = self.slots.write();
        for handle in slots.entries.drain(..).flatten() {
            handle.mark_deleted();
        }
        slots.used = 0;
    }

    pub fn len(&self) -> usize {
        self.slots.read().used
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn allocated(&self) -> usize {
        self.slots.read().allocated
    }
}

impl Default for OpenFileTable {
    fn default() -> Self {
        Self::new()
    }
}
