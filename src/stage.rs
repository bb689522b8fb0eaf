//! The PARENT/CHILD/INIT state machine (SPEC_FULL.md §4.7). Each stage is
//! its own function; the "jump" between them is an ordinary `clone3(2)`
//! reparenting fork, with Rust's normal fork-then-branch-on-the-result
//! idiom standing in for the original's `setjmp`/`longjmp` dispatch (see
//! SPEC_FULL.md §9, §10.1 — no nonlocal jump is used anywhere here).

use std::fs::File;
use std::io::Read as _;

use nix::sched::{unshare, CloneFlags};
use nix::unistd::{setgid, setgroups, setsid, setuid, Gid, Pid, Uid};

use crate::config::{self, BootstrapConfig, CREATE_CGROUPNS};
use crate::error::{Context, Error, Result};
use crate::log::{log_fatal, LogSink};
use crate::nsjoin;
use crate::procfs::{self, DumpableGuard, SetgroupsPolicy};
use crate::rootfs::{self, RootfsProgress};
use crate::sync::{SyncChannel, SyncMessage, SyncPair};
use crate::syscall::{self, CloneArgs, CloneResult};

fn reparenting_clone_args() -> CloneArgs {
    let mut args = CloneArgs::default();
    args.flag_parent();
    args.exit_signal = nix::sys::signal::Signal::SIGCHLD as u64;
    args
}

fn kill(pid: Pid) {
    let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
}

/// Entry point for stage 0 (PARENT). Never returns in the ordinary sense:
/// either this process exits (0 on success, 1 on fatal error) or, several
/// generations later, the init stage returns through this same call chain
/// into the caller of [`crate::nsexec`].
pub(crate) fn run_parent(
    config: BootstrapConfig,
    child_sync: SyncPair,
    grandchild_sync: SyncPair,
    init_pipe: File,
    log: &LogSink,
) -> Result<()> {
    let _ = procfs::set_name("runc:[0:PARENT]");
    match unsafe { syscall::clone3(&reparenting_clone_args()) } {
        Ok(CloneResult::Child) => run_child(config, child_sync, grandchild_sync, init_pipe, log),
        Ok(CloneResult::Parent { child }) => {
            let result = parent_after_fork(&config, child_sync, grandchild_sync, child, init_pipe);
            match result {
                Ok(()) => unsafe { nix::libc::_exit(0) },
                Err(err) => {
                    log_fatal!(log, "parent stage: {err}");
                    kill(child);
                    unsafe { nix::libc::_exit(1) }
                }
            }
        }
        Err(errno) => {
            log_fatal!(log, "cloning child stage: {errno}");
            unsafe { nix::libc::_exit(1) }
        }
    }
}

fn parent_after_fork(
    config: &BootstrapConfig,
    child_sync: SyncPair,
    grandchild_sync: SyncPair,
    child: Pid,
    mut init_pipe: File,
) -> Result<()> {
    let mut chan = child_sync.keep_a();
    loop {
        match chan.recv()? {
            SyncMessage::UsermapPls => {
                if !config.uid_map.is_empty() {
                    if config.rootless_euid && !config.setgroups_requested {
                        procfs::write_setgroups(child, SetgroupsPolicy::Deny)?;
                    }
                }
                procfs::write_id_map(child, "uid", &config.uid_map, config.uid_map_path.as_deref())?;
                procfs::write_id_map(child, "gid", &config.gid_map, config.gid_map_path.as_deref())?;
                chan.send(SyncMessage::UsermapAck)?;
            }
            SyncMessage::RecvPidPls => {
                let grandchild = chan.recv_pid()?;
                chan.send(SyncMessage::RecvPidAck)?;
                config::write_pid_report(&mut init_pipe, grandchild.as_raw(), child.as_raw())?;
            }
            SyncMessage::ChildReady => break,
            other => {
                return Err(Error::new(format!(
                    "unexpected sync message in parent stage: {other:?}"
                )))
            }
        }
    }
    let mut gc_chan = grandchild_sync.keep_a();
    gc_chan.send(SyncMessage::Grandchild)?;
    match gc_chan.recv()? {
        SyncMessage::ChildReady => Ok(()),
        other => Err(Error::new(format!(
            "unexpected sync message on grandchild channel: {other:?}"
        ))),
    }
}

enum ChildOutcome {
    BecameInit(Result<()>),
    Exited(Result<()>),
}

/// Entry point for stage 1 (CHILD).
fn run_child(
    config: BootstrapConfig,
    child_sync: SyncPair,
    grandchild_sync: SyncPair,
    init_pipe: File,
    log: &LogSink,
) -> Result<()> {
    let outcome = run_child_body(config, child_sync, grandchild_sync, init_pipe, log);
    match outcome {
        ChildOutcome::BecameInit(result) => result,
        ChildOutcome::Exited(Ok(())) => unsafe { nix::libc::_exit(0) },
        ChildOutcome::Exited(Err(err)) => {
            log_fatal!(log, "child stage: {err}");
            unsafe { nix::libc::_exit(1) }
        }
    }
}

fn run_child_body(
    config: BootstrapConfig,
    child_sync: SyncPair,
    grandchild_sync: SyncPair,
    init_pipe: File,
    log: &LogSink,
) -> ChildOutcome {
    let mut chan = child_sync.keep_b();
    if let Err(err) = child_setup(&config, &mut chan) {
        return ChildOutcome::Exited(Err(err));
    }
    match unsafe { syscall::clone3(&reparenting_clone_args()) } {
        Ok(CloneResult::Child) => {
            // INIT does not participate on the child-sync channel.
            drop(chan);
            ChildOutcome::BecameInit(run_init(config, grandchild_sync, init_pipe, log))
        }
        Ok(CloneResult::Parent { child: grandchild }) => {
            let result = child_after_fork(&mut chan, grandchild);
            if result.is_err() {
                kill(grandchild);
            }
            ChildOutcome::Exited(result)
        }
        Err(errno) => ChildOutcome::Exited(Err(errno.into())),
    }
}

fn child_setup(config: &BootstrapConfig, chan: &mut SyncChannel) -> Result<()> {
    procfs::set_name("runc:[1:CHILD]")?;
    nsjoin::join_namespaces(&config.ns_paths)?;

    let mut remaining_flags = config.clone_flags;
    let mut new_userns = false;
    if remaining_flags & nix::libc::CLONE_NEWUSER as u32 != 0 {
        unshare(CloneFlags::CLONE_NEWUSER).context("unshare(user)")?;
        remaining_flags &= !(nix::libc::CLONE_NEWUSER as u32);
        new_userns = true;
    }
    if remaining_flags & nix::libc::CLONE_NEWNS as u32 != 0 {
        unshare(CloneFlags::CLONE_NEWNS).context("unshare(mount)")?;
        remaining_flags &= !(nix::libc::CLONE_NEWNS as u32);
    }

    let mut progress: RootfsProgress = rootfs::prepare(config)?;

    if new_userns {
        let joined = !config.ns_paths.is_empty();
        let guard = if joined {
            Some(DumpableGuard::set(true)?)
        } else {
            None
        };
        chan.send(SyncMessage::UsermapPls)?;
        chan.expect(SyncMessage::UsermapAck)?;
        drop(guard);
        syscall::setresuid_root().context("setresuid(0,0,0)")?;
    }

    rootfs::finish(config, &mut progress)?;

    let remaining = remaining_flags & !(nix::libc::CLONE_NEWCGROUP as u32);
    if remaining != 0 {
        unshare(CloneFlags::from_bits_truncate(remaining as i32)).context("unshare(remaining)")?;
    }
    Ok(())
}

fn child_after_fork(chan: &mut SyncChannel, grandchild: Pid) -> Result<()> {
    chan.send(SyncMessage::RecvPidPls)?;
    chan.send_pid(grandchild)?;
    match chan.recv()? {
        SyncMessage::RecvPidAck => {}
        other => {
            return Err(Error::new(format!(
                "expected RecvPidAck, got {other:?}"
            )))
        }
    }
    chan.send(SyncMessage::ChildReady)
}

/// Entry point for stage 2 (INIT). This is the only stage that returns
/// normally instead of terminating the process.
fn run_init(
    config: BootstrapConfig,
    grandchild_sync: SyncPair,
    mut init_pipe: File,
    _log: &LogSink,
) -> Result<()> {
    let mut chan = grandchild_sync.keep_b();
    procfs::set_name("runc:[2:INIT]")?;
    {
        let _guard = DumpableGuard::set(true)?;
        procfs::write_oom_score_adj(&config.oom_score_adj)?;
    }
    chan.expect(SyncMessage::Grandchild)?;

    setsid().context("setsid")?;
    setuid(Uid::from_raw(0)).context("setuid(0)")?;
    setgid(Gid::from_raw(0)).context("setgid(0)")?;

    if !config.rootless_euid && config.setgroups_requested {
        setgroups(&[]).context("setgroups(0, NULL)")?;
    }

    if config.clone_flags & nix::libc::CLONE_NEWCGROUP as u32 != 0 {
        let mut buf = [0u8; 1];
        init_pipe
            .read_exact(&mut buf)
            .context("reading cgroupns handshake byte")?;
        if buf[0] != CREATE_CGROUPNS {
            return Err(Error::new("unexpected byte on cgroupns handshake"));
        }
        unshare(CloneFlags::CLONE_NEWCGROUP).context("unshare(cgroup)")?;
    }

    chan.send(SyncMessage::ChildReady)?;
    Ok(())
}
