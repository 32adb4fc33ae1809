//! In-memory content of regular files.
//!
//! A buffer is materialized from the backing file on first read or write and
//! written back by [`RegularFile::sync`]. The record lock is taken in write
//! mode to load, grow or free the buffer and in read mode to copy out of it.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::{RwLockUpgradableReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::error::{RegistryError, Result};
use crate::record::{FileData, RegularFile};

/// Result of a read. `eof` is set when fewer bytes than requested were
/// available; the bytes that were copied are still valid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadOutcome {
    pub bytes: usize,
    pub eof: bool,
}

impl RegularFile {
    /// Loads the backing file's content if it is not loaded yet.
    fn ensure_loaded<'a>(data: &'a mut FileData, path: &Path) -> Result<&'a mut Vec<u8>> {
        if data.buffer.is_none() {
            data.buffer = Some(load(path)?);
            data.is_synced = true;
        }
        Ok(data.buffer.get_or_insert_with(Vec::new))
    }

    pub fn read(&self, path: &Path, buf: &mut [u8], offset: u64) -> Result<ReadOutcome> {
        let data = {
            let data = self.data.read();
            if data.buffer.is_some() {
                data
            } else {
                drop(data);
                let mut data = self.data.write();
                Self::ensure_loaded(&mut data, path)?;
                RwLockWriteGuard::downgrade(data)
            }
        };

        let content = data.buffer.as_deref().unwrap_or_default();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(content.len());
        let bytes = buf.len().min(content.len() - start);
        buf[..bytes].copy_from_slice(&content[start..start + bytes]);

        Ok(ReadOutcome {
            bytes,
            eof: bytes < buf.len(),
        })
    }

    /// Copies `src` at `offset`, growing the buffer first if needed. Returns
    /// the offset the data landed at, which differs from `offset` for append
    /// records.
    pub fn write(&self, path: &Path, src: &[u8], offset: u64) -> Result<u64> {
        let mut data = self.data.write();
        let buffer = Self::ensure_loaded(&mut data, path)?;

        let start = if self.flags.append {
            buffer.len()
        } else {
            usize::try_from(offset).map_err(|_| RegistryError::BadArgs)?
        };
        let end = start
            .checked_add(src.len())
            .ok_or(RegistryError::BadArgs)?;

        grow(buffer, end)?;
        buffer[start..end].copy_from_slice(src);
        data.is_synced = false;

        if self.flags.sync {
            flush(path, data.buffer.as_deref().unwrap_or_default())?;
            data.is_synced = true;
        }

        Ok(start as u64)
    }

    /// Writes the buffer back to the backing file. Nothing to do when the
    /// buffer was never loaded.
    pub fn sync(&self, path: &Path) -> Result<()> {
        let data = self.data.upgradable_read();
        let Some(content) = data.buffer.as_deref() else {
            return Ok(());
        };

        flush(path, content)?;
        let mut data = RwLockUpgradableReadGuard::upgrade(data);
        data.is_synced = true;
        Ok(())
    }

    /// Resizes the content to `size` bytes, in memory when loaded and on
    /// disk otherwise.
    pub fn truncate(&self, path: &Path, size: u64) -> Result<()> {
        let mut data = self.data.write();
        let Some(buffer) = data.buffer.as_mut() else {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(size)?;
            return Ok(());
        };

        let size = usize::try_from(size).map_err(|_| RegistryError::out_of_memory())?;
        if size > buffer.len() {
            grow(buffer, size)?;
        } else {
            buffer.truncate(size);
        }
        data.is_synced = false;
        Ok(())
    }

    /// Flushes pending writes and drops the buffer, but only if `idle` still
    /// holds once the record lock is taken. Returns whether the buffer went.
    pub(crate) fn discard_if(&self, path: &Path, idle: impl FnOnce() -> bool) -> Result<bool> {
        let mut data = self.data.write();
        if !idle() {
            return Ok(false);
        }
        if let Some(content) = data.buffer.as_deref() {
            if !data.is_synced {
                flush(path, content)?;
            }
        }
        data.buffer = None;
        data.is_synced = true;
        Ok(true)
    }

    /// Drops the in-memory content.
    pub(crate) fn discard(&self) {
        let mut data = self.data.write();
        data.buffer = None;
        data.is_synced = true;
    }

    pub fn is_synced(&self) -> bool {
        self.data.read().is_synced
    }

    /// Length of the loaded buffer, `None` while unloaded.
    pub fn loaded_len(&self) -> Option<usize> {
        self.data.read().buffer.as_ref().map(Vec::len)
    }
}

fn load(path: &Path) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let len = file.seek(SeekFrom::End(0))?;
    if len == 0 {
        return Ok(Vec::new());
    }
    file.seek(SeekFrom::Start(0))?;

    let len = usize::try_from(len).map_err(|_| RegistryError::out_of_memory())?;
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|_| RegistryError::out_of_memory())?;
    buffer.resize(len, 0);

    let mut filled = 0;
    while filled < len {
        match file.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    if filled < len {
        // File shrank between the seek and the read.
        buffer.truncate(filled);
        buffer.shrink_to_fit();
    }
    debug!(path = %path.display(), len = filled, "materialized buffer");
    Ok(buffer)
}

/// Makes room for `end` bytes. Capacity doubles from the current length until
/// it fits; an empty buffer gets exactly `end`. New bytes are zero.
fn grow(buffer: &mut Vec<u8>, end: usize) -> Result<()> {
    if end <= buffer.len() {
        return Ok(());
    }

    let target = if buffer.is_empty() {
        end
    } else {
        let mut capacity = buffer.len();
        while capacity < end {
            capacity = capacity
                .checked_mul(2)
                .ok_or_else(RegistryError::out_of_memory)?;
        }
        capacity
    };

    if target > buffer.capacity() {
        buffer
            .try_reserve_exact(target - buffer.len())
            .map_err(|_| RegistryError::out_of_memory())?;
    }
    buffer.resize(end, 0);
    Ok(())
}

fn flush(path: &Path, content: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new().write(true).truncate(true).open(path)?;
    file.write_all(content)?;
    file.sync_all()?;
    debug!(path = %path.display(), len = content.len(), "flushed buffer");
    Ok(())
}
