//! Mount propagation and bind-to-self preparation for the container
//! rootfs (SPEC_FULL.md §4.5). Pivoting into the rootfs and mounting its
//! actual content is the manager's job; this module only prepares the
//! mount tree so that job can proceed safely.

use std::path::Path;

use nix::mount::{mount, MsFlags};

use crate::config::BootstrapConfig;
use crate::error::{Context, Result};

/// Tracks which steps were deferred on the first pass because the
/// current euid may not yet have search permission into the rootfs's
/// ancestry (before user-ns ID mapping completes).
#[derive(Debug, Default)]
pub(crate) struct RootfsProgress {
    parent_made_private: bool,
    bind_self_done: bool,
    shiftfs_done: bool,
}

/// Runs the rootfs preparation steps that are safe to attempt immediately.
/// Returns the progress so a retry pass (`finish`) can complete whatever
/// was deferred, once privileges allow it.
pub(crate) fn prepare(config: &BootstrapConfig) -> Result<RootfsProgress> {
    let mut progress = RootfsProgress::default();
    if !config.prep_rootfs {
        return Ok(progress);
    }
    set_root_propagation(config.rootfs_prop)?;
    if config.make_parent_priv {
        progress.parent_made_private = make_parent_private(&config.parent_mount).is_ok();
    } else {
        progress.parent_made_private = true;
    }
    if progress.parent_made_private {
        run_bind_and_shiftfs(config, &mut progress);
    }
    Ok(progress)
}

/// Completes whatever `prepare` deferred. Called after user-ns ID mapping
/// has taken effect; failures here are fatal (SPEC_FULL.md §4.5).
pub(crate) fn finish(config: &BootstrapConfig, progress: &mut RootfsProgress) -> Result<()> {
    if !config.prep_rootfs {
        return Ok(());
    }
    if !progress.parent_made_private {
        if config.make_parent_priv {
            make_parent_private(&config.parent_mount)
                .context("making rootfs parent mount private")?;
        }
        progress.parent_made_private = true;
    }
    if !progress.bind_self_done || !progress.shiftfs_done {
        run_bind_and_shiftfs(config, progress);
        if !progress.bind_self_done {
            return Err(crate::error::Error::new("bind-mounting rootfs onto itself failed"));
        }
        if !progress.shiftfs_done {
            return Err(crate::error::Error::new("applying shiftfs mounts failed"));
        }
    }
    Ok(())
}

fn run_bind_and_shiftfs(config: &BootstrapConfig, progress: &mut RootfsProgress) {
    if !progress.bind_self_done {
        progress.bind_self_done = bind_self_onto_self().is_ok();
    }
    if progress.bind_self_done && !progress.shiftfs_done {
        progress.shiftfs_done = apply_shiftfs_mounts(config).is_ok();
    }
}

fn set_root_propagation(flags: u32) -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::from_bits_truncate(flags),
        None::<&str>,
    )
    .context("setting / mount propagation")
}

fn make_parent_private(parent_mount: &str) -> std::result::Result<(), nix::errno::Errno> {
    mount(
        None::<&str>,
        parent_mount,
        None::<&str>,
        MsFlags::MS_PRIVATE,
        None::<&str>,
    )
}

/// Binds `"."` onto `"."`, i.e. the rootfs (the caller's cwd) onto itself.
/// Uses the relative path, not the absolute rootfs path, because search
/// permission into the absolute ancestry may already be lost.
fn bind_self_onto_self() -> std::result::Result<(), nix::errno::Errno> {
    mount(
        Some("."),
        ".",
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
}

fn apply_shiftfs_mounts(config: &BootstrapConfig) -> std::result::Result<(), nix::errno::Errno> {
    for mountpoint in &config.shiftfs_mounts {
        if Path::new(mountpoint) == Path::new(&config.rootfs) {
            mount(Some("."), ".", Some("shiftfs"), MsFlags::empty(), None::<&str>)?;
        } else {
            mount(
                Some(mountpoint.as_str()),
                mountpoint.as_str(),
                Some("shiftfs"),
                MsFlags::empty(),
                None::<&str>,
            )?;
        }
    }
    Ok(())
}
