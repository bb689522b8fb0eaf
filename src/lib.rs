//! Native bootstrap executor for container namespace/rootfs/identity
//! setup, invoked as the first code of a container-runtime binary before
//! it hands control to its own higher-level startup logic.
//!
//! [`nsexec`] is the entire public surface: it reads its configuration
//! from an inherited descriptor, runs the PARENT/CHILD/INIT process-tree
//! protocol, and either terminates the current process (stages PARENT
//! and CHILD) or returns normally once the container's init process has
//! taken shape (stage INIT).

mod config;
mod error;
mod log;
mod nsjoin;
mod procfs;
mod rootfs;
mod stage;
mod sync;
mod syscall;

use std::env;
use std::fs::File;
use std::os::fd::FromRawFd;

pub use error::{BootstrapError, Error};

use log::{log_debug, LogSink};
use sync::SyncPair;

const INITPIPE_ENV: &str = "_LIBCONTAINER_INITPIPE";
const LOGPIPE_ENV: &str = "_LIBCONTAINER_LOGPIPE";

/// Guards against the `/proc/self/exe` re-exec hijack fixed by CVE-2019-5736.
/// Constructing the guarded binary is the manager's responsibility; this
/// crate only calls the seam so a caller can plug in the real check. The
/// default implementation performs no check and is meant to be replaced.
pub trait ClonedBinaryGuard {
    fn ensure_cloned_binary(&self) -> Result<(), Error>;
}

/// No-op implementation of [`ClonedBinaryGuard`], used when the caller has
/// not wired in the real re-exec guard.
pub struct NoClonedBinaryGuard;

impl ClonedBinaryGuard for NoClonedBinaryGuard {
    fn ensure_cloned_binary(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Runs the bootstrap protocol.
///
/// Returns `Ok(())` once this process is the container's init and the
/// namespace/rootfs/identity setup described by the manager's message has
/// completed. Stages prior to init never return: they terminate the
/// process directly (status 0 on success, 1 on any fatal error).
///
/// Returns immediately, with no side effects, if `_LIBCONTAINER_INITPIPE`
/// is not set in the environment — this is the path taken when the
/// binary is invoked for reasons other than starting or exec'ing into a
/// container.
pub fn nsexec() -> Result<(), Error> {
    nsexec_with_guard(&NoClonedBinaryGuard)
}

/// Like [`nsexec`], but with the CVE-2019-5736 guard supplied explicitly.
pub fn nsexec_with_guard(guard: &dyn ClonedBinaryGuard) -> Result<(), Error> {
    let log = open_log_sink();

    let Some(mut init_pipe) = open_init_pipe()? else {
        return Ok(());
    };

    guard.ensure_cloned_binary()?;
    log_debug!(log, "nsexec started");

    let config = config::read_config(&mut init_pipe)?;

    // Must happen before the process becomes non-dumpable: writing our
    // own oom_score_adj requires either being dumpable or privileged, and
    // every descendant inherits this value across fork(2) until stage 2
    // raises it to the configured value.
    procfs::write_oom_score_adj("-999")?;

    // Joining zero namespaces means no security-context switch is about
    // to happen, so leave the process dumpable — rootless containers
    // break otherwise (see SPEC_FULL.md §4.1).
    if !config.ns_paths.is_empty() {
        procfs::set_dumpable(false)?;
    }

    let child_sync = SyncPair::new()?;
    let grandchild_sync = SyncPair::new()?;

    stage::run_parent(config, child_sync, grandchild_sync, init_pipe, &log)
}

fn open_init_pipe() -> Result<Option<File>, Error> {
    match env::var(INITPIPE_ENV) {
        Ok(value) if value.is_empty() => Ok(None),
        Ok(value) => {
            let fd: std::os::fd::RawFd = value
                .parse()
                .map_err(|_| Error::new(format!("invalid {INITPIPE_ENV} value: {value}")))?;
            Ok(Some(unsafe { File::from_raw_fd(fd) }))
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => {
            Err(Error::new(format!("{INITPIPE_ENV} is not valid unicode")))
        }
    }
}

/// The log sink itself is unavailable if this fails, so a parse failure is
/// reported straight to stderr and the process exits immediately rather
/// than proceeding with logging silently disabled.
fn open_log_sink() -> LogSink {
    let Ok(value) = env::var(LOGPIPE_ENV) else {
        return LogSink::disabled();
    };
    match value.parse::<std::os::fd::RawFd>() {
        Ok(fd) => unsafe { LogSink::from_raw_fd(fd) },
        Err(_) => {
            eprintln!("nsexec: invalid {LOGPIPE_ENV} value: {value}");
            std::process::exit(1);
        }
    }
}
