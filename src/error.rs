use std::io;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("invalid arguments")]
    BadArgs,

    #[error("path already registered")]
    Exists,

    #[error("path not registered or of the wrong type")]
    NotExists,

    /// Allocation failed, or a caller-supplied buffer is too small. In the
    /// latter case `required` carries the size that would have fit.
    #[error("out of memory (required: {required:?})")]
    NoMem { required: Option<usize> },

    #[error("directory not empty")]
    NonEmpty,

    #[error("system call failed: {}", io::Error::from_raw_os_error(*.0))]
    Syscall(i32),

    #[error("path has no open descriptors")]
    NotOpen,
}

pub type Result<T> = std::result::Result<T, RegistryError>;

impl RegistryError {
    pub fn out_of_memory() -> Self {
        RegistryError::NoMem { required: None }
    }

    /// errno value the FUSE adapter replies with.
    pub fn errno(&self) -> i32 {
        match self {
            RegistryError::BadArgs => libc::EFAULT,
            RegistryError::Exists => libc::EEXIST,
            RegistryError::NotExists => libc::ENOENT,
            RegistryError::NoMem { .. } => libc::ENOMEM,
            RegistryError::NonEmpty => libc::ENOTEMPTY,
            RegistryError::Syscall(errno) => *errno,
            RegistryError::NotOpen => libc::EBADF,
        }
    }
}

impl From<io::Error> for RegistryError {
    fn from(e: io::Error) -> Self {
        RegistryError::Syscall(e.raw_os_error().unwrap_or(libc::EIO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_keeps_errno() {
        let err = RegistryError::from(io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(err, RegistryError::Syscall(libc::EACCES));
        assert_eq!(err.errno(), libc::EACCES);
    }

    #[test]
    fn io_error_without_errno_is_eio() {
        let err = RegistryError::from(io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(err.errno(), libc::EIO);
    }

    #[test]
    fn fixed_posix_equivalents() {
        assert_eq!(RegistryError::BadArgs.errno(), libc::EFAULT);
        assert_eq!(RegistryError::NotExists.errno(), libc::ENOENT);
        assert_eq!(RegistryError::Exists.errno(), libc::EEXIST);
        assert_eq!(RegistryError::out_of_memory().errno(), libc::ENOMEM);
        assert_eq!(
            RegistryError::NoMem { required: Some(12) }.errno(),
            libc::ENOMEM
        );
        assert_eq!(RegistryError::NonEmpty.errno(), libc::ENOTEMPTY);
    }
}
