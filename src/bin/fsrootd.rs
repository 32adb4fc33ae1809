use std::sync::Arc;

use fsroot::Registry;
use fsroot::fuse::FsRootFs;
use fsroot::runtime::{Command, MountConfig, ROOT_ENV};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match MountConfig::from_env() {
        Ok(Command::Mount(config)) => config,
        Ok(Command::Help) => {
            print_help();
            return;
        }
        Err(e) => {
            eprintln!("fsrootd: {e}");
            print_help();
            std::process::exit(2);
        }
    };

    let registry = match Registry::init(&config.root) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            eprintln!("fsrootd: invalid root {}: {e}", config.root.display());
            std::process::exit(1);
        }
    };

    info!(
        mountpoint = %config.mountpoint.display(),
        root = %registry.root().display(),
        pid = std::process::id(),
        "fsrootd starting"
    );

    let fs = FsRootFs::new(Arc::clone(&registry));
    let session = match fuser::spawn_mount2(fs, &config.mountpoint, &config.mount_options()) {
        Ok(session) => session,
        Err(e) => {
            eprintln!("fsrootd: mount failed: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("fsrootd: failed to wait for shutdown signal: {e}");
    }

    info!("unmounting");
    drop(session);

    match Arc::try_unwrap(registry) {
        Ok(registry) => registry.deinit(),
        // The session thread still holds a reference; dropping ours is enough.
        Err(registry) => drop(registry),
    }
    info!("fsrootd stopped");
}

fn print_help() {
    eprintln!(
        "Usage: fsrootd [--allow-other] [--auto-unmount] [--fsname NAME] <mountpoint> [root]\n\
         \n\
         The backing root may also be given in {ROOT_ENV}."
    );
}
