use std::path::PathBuf;

use fuser::MountOption;
use thiserror::Error;

pub const ROOT_ENV: &str = "FSROOTD_ROOT";

const DEFAULT_FSNAME: &str = "fsroot";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing mount point")]
    MissingMountpoint,

    #[error("missing backing root (pass it as an argument or set {ROOT_ENV})")]
    MissingRoot,

    #[error("{0} requires a value")]
    MissingValue(String),

    #[error("unknown argument: {0}")]
    UnknownArgument(String),
}

/// What the daemon mounts, and how.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountConfig {
    pub mountpoint: PathBuf,
    pub root: PathBuf,
    pub fsname: String,
    pub allow_other: bool,
    pub auto_unmount: bool,
}

/// Outcome of argument parsing.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Mount(MountConfig),
    Help,
}

impl MountConfig {
    /// Parses `[--allow-other] [--auto-unmount] [--fsname NAME] <mountpoint>
    /// [root]`. The root falls back to `env_root`.
    pub fn parse<I>(args: I, env_root: Option<PathBuf>) -> Result<Command, ConfigError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut positional = Vec::new();
        let mut fsname = DEFAULT_FSNAME.to_string();
        let mut allow_other = false;
        let mut auto_unmount = false;
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--allow-other" => allow_other = true,
                "--auto-unmount" => auto_unmount = true,
                "--fsname" => {
                    fsname = args
                        .next()
                        .ok_or_else(|| ConfigError::MissingValue(arg.clone()))?;
                }
                "--help" | "-h" => return Ok(Command::Help),
                other if other.starts_with('-') => {
                    return Err(ConfigError::UnknownArgument(other.to_string()));
                }
                _ => positional.push(PathBuf::from(arg)),
            }
        }

        let mut positional = positional.into_iter();
        let mountpoint = positional.next().ok_or(ConfigError::MissingMountpoint)?;
        let root = positional
            .next()
            .or(env_root.filter(|p| !p.as_os_str().is_empty()))
            .ok_or(ConfigError::MissingRoot)?;
        if let Some(extra) = positional.next() {
            return Err(ConfigError::UnknownArgument(extra.display().to_string()));
        }

        Ok(Command::Mount(Self {
            mountpoint,
            root,
            fsname,
            allow_other,
            auto_unmount,
        }))
    }

    /// Parses the process arguments and environment.
    pub fn from_env() -> Result<Command, ConfigError> {
        Self::parse(
            std::env::args().skip(1),
            std::env::var_os(ROOT_ENV).map(PathBuf::from),
        )
    }

    pub fn mount_options(&self) -> Vec<MountOption> {
        let mut options = vec![
            MountOption::FSName(self.fsname.clone()),
            MountOption::DefaultPermissions,
        ];
        if self.allow_other {
            options.push(MountOption::AllowOther);
        }
        if self.auto_unmount {
            options.push(MountOption::AutoUnmount);
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn positional_mountpoint_and_root() {
        let cmd = MountConfig::parse(args(&["/mnt/fs", "/srv/root"]), None).unwrap();
        let Command::Mount(config) = cmd else {
            panic!("expected mount");
        };
        assert_eq!(config.mountpoint, PathBuf::from("/mnt/fs"));
        assert_eq!(config.root, PathBuf::from("/srv/root"));
        assert_eq!(config.fsname, "fsroot");
        assert_eq!(
            config.mount_options(),
            vec![MountOption::FSName("fsroot".into()), MountOption::DefaultPermissions]
        );
    }

    #[test]
    fn root_from_environment() {
        let cmd = MountConfig::parse(args(&["/mnt/fs"]), Some(PathBuf::from("/srv/env"))).unwrap();
        let Command::Mount(config) = cmd else {
            panic!("expected mount");
        };
        assert_eq!(config.root, PathBuf::from("/srv/env"));
    }

    #[test]
    fn flags_become_mount_options() {
        let cmd = MountConfig::parse(
            args(&["--allow-other", "--fsname", "devices", "--auto-unmount", "/mnt", "/srv"]),
            None,
        )
        .unwrap();
        let Command::Mount(config) = cmd else {
            panic!("expected mount");
        };
        assert_eq!(
            config.mount_options(),
            vec![
                MountOption::FSName("devices".into()),
                MountOption::DefaultPermissions,
                MountOption::AllowOther,
                MountOption::AutoUnmount,
            ]
        );
    }

    #[test]
    fn errors() {
        assert_eq!(MountConfig::parse(args(&[]), None), Err(ConfigError::MissingMountpoint));
        assert_eq!(MountConfig::parse(args(&["/mnt"]), None), Err(ConfigError::MissingRoot));
        assert_eq!(
            MountConfig::parse(args(&["/mnt"]), Some(PathBuf::new())),
            Err(ConfigError::MissingRoot)
        );
        assert_eq!(
            MountConfig::parse(args(&["--fsname"]), None),
            Err(ConfigError::MissingValue("--fsname".into()))
        );
        assert_eq!(
            MountConfig::parse(args(&["--verbose", "/mnt"]), None),
            Err(ConfigError::UnknownArgument("--verbose".into()))
        );
        assert_eq!(MountConfig::parse(args(&["-h"]), None), Ok(Command::Help));
    }
}
