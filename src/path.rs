use std::path::{Path, PathBuf};

use crate::error::{RegistryError, Result};

/// Longest absolute path, including the terminating NUL, the kernel accepts.
pub const PATH_MAX: usize = libc::PATH_MAX as usize;

/// The real directory that holds file bytes.
#[derive(Clone, Debug)]
pub struct BackingRoot {
    root: PathBuf,
}

impl BackingRoot {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let len = root.as_os_str().len();
        if len == 0 || len > PATH_MAX - 1 {
            return Err(RegistryError::BadArgs);
        }
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Absolute backing path for a registry key (or any relative request
    /// path). Exactly one slash separates root and request path.
    pub fn full_path(&self, rel: &str) -> Result<PathBuf> {
        let rel = rel.trim_start_matches('/');
        let full = if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        };

        if full.as_os_str().len() > PATH_MAX - 1 {
            return Err(RegistryError::BadArgs);
        }
        Ok(full)
    }
}

/// Canonical registry key: no leading, trailing or repeated slashes. The
/// empty key is the root directory. `..` components are rejected so a key can
/// never resolve outside the backing root.
pub fn normalize(path: &str) -> Result<String> {
    let mut key = String::with_capacity(path.len());
    for component in path.split('/') {
        match component {
            "" | "." => continue,
            ".." => return Err(RegistryError::BadArgs),
            name => {
                if !key.is_empty() {
                    key.push('/');
                }
                key.push_str(name);
            }
        }
    }
    Ok(key)
}

/// Whether `key` lives somewhere below the directory `dir`.
pub fn is_below(key: &str, dir: &str) -> bool {
    if dir.is_empty() {
        return !key.is_empty();
    }
    key.len() > dir.len() && key.starts_with(dir) && key.as_bytes()[dir.len()] == b'/'
}

/// Child key of `dir` named `name`.
pub fn join_key(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_without_trailing_slash() {
        let root = BackingRoot::new("fsroot-root").unwrap();
        assert_eq!(root.full_path("foo").unwrap(), PathBuf::from("fsroot-root/foo"));
        assert_eq!(root.full_path("/foo").unwrap(), PathBuf::from("fsroot-root/foo"));
    }

    #[test]
    fn root_with_trailing_slash() {
        let root = BackingRoot::new("/srv/root/").unwrap();
        assert_eq!(root.full_path("/a/b").unwrap(), PathBuf::from("/srv/root/a/b"));
        assert_eq!(root.full_path("a").unwrap(), PathBuf::from("/srv/root/a"));
    }

    #[test]
    fn empty_request_is_the_root() {
        let root = BackingRoot::new("/srv/root").unwrap();
        assert_eq!(root.full_path("").unwrap(), PathBuf::from("/srv/root"));
    }

    #[test]
    fn rejects_empty_and_oversized_roots() {
        assert_eq!(BackingRoot::new("").unwrap_err(), RegistryError::BadArgs);
        let long = "r".repeat(PATH_MAX);
        assert_eq!(BackingRoot::new(long).unwrap_err(), RegistryError::BadArgs);
    }

    #[test]
    fn rejects_oversized_full_paths() {
        let root = BackingRoot::new("/srv").unwrap();
        let rel = "x".repeat(PATH_MAX);
        assert_eq!(root.full_path(&rel).unwrap_err(), RegistryError::BadArgs);
    }

    #[test]
    fn normalize_strips_slashes() {
        assert_eq!(normalize("/foo//bar/").unwrap(), "foo/bar");
        assert_eq!(normalize("./foo").unwrap(), "foo");
        assert_eq!(normalize("/").unwrap(), "");
        assert_eq!(normalize("a/../b").unwrap_err(), RegistryError::BadArgs);
    }

    #[test]
    fn descendants() {
        assert!(is_below("dir/a", "dir"));
        assert!(is_below("dir/a/b", "dir"));
        assert!(!is_below("dir", "dir"));
        assert!(!is_below("directory", "dir"));
        assert!(is_below("anything", ""));
        assert_eq!(join_key("", "a"), "a");
        assert_eq!(join_key("d", "a"), "d/a");
    }
}
