//! A FUSE filesystem that keeps file ownership and mode in memory.
//!
//! Files are stored in a backing directory with the daemon's own credentials;
//! the uid, gid and mode a caller sets are recorded in a [`Registry`] and
//! reported back instead of the real ones.

pub mod attr;
pub mod buffer;
pub mod dirops;
pub mod error;
pub mod fuse;
pub mod handles;
pub mod path;
pub mod record;
pub mod registry;
pub mod runtime;

pub use attr::FileAttributes;
pub use buffer::ReadOutcome;
pub use dirops::DirStream;
pub use error::{RegistryError, Result};
pub use handles::Descriptor;
pub use record::{Ownership, RecordFlags};
pub use registry::Registry;
