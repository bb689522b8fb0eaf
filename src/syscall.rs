//! Raw `clone3(2)` wrapper used by every stage transition, plus the one
//! libc call `nix` doesn't expose a safe wrapper for.

use nix::{errno::Errno, libc::syscall};

use crate::error::{Error, Result};

pub type Pid = nix::unistd::Pid;

#[repr(C, align(8))]
#[derive(Debug, Default)]
pub(crate) struct CloneArgs {
    pub flags: u64,
    pub pidfd: u64,
    pub child_tid: u64,
    pub parent_tid: u64,
    pub exit_signal: u64,
    pub stack: u64,
    pub stack_size: u64,
    pub tls: u64,
    pub set_tid: u64,
    pub set_tid_size: u64,
    pub cgroup: u64,
}

impl CloneArgs {
    /// Reparenting fork: the new process's parent is the calling process's
    /// parent, not the caller. Used for every stage transition so the
    /// topmost manager can reap both the first child and the final init.
    pub fn flag_parent(&mut self) {
        self.flags |= nix::libc::CLONE_PARENT as u64;
    }
}

pub(crate) enum CloneResult {
    Child,
    Parent { child: Pid },
}

/// # Safety
/// Must be called with no outstanding borrows that assume single-threaded,
/// single-owner state, since a successful call creates a second process
/// sharing the current address space up to this point (copy-on-write).
pub(crate) unsafe fn clone3(cl_args: &CloneArgs) -> std::result::Result<CloneResult, Errno> {
    let res = syscall(
        nix::libc::SYS_clone3,
        cl_args as *const CloneArgs,
        core::mem::size_of::<CloneArgs>(),
    );
    Errno::result(res).map(|v| match v {
        0 => CloneResult::Child,
        v => CloneResult::Parent {
            child: Pid::from_raw(v as nix::libc::pid_t),
        },
    })
}

/// `setresuid(0, 0, 0)`. Not wrapped by `nix`, so called directly; used
/// once the mapped user namespace makes uid 0 available to become root
/// inside it.
pub(crate) fn setresuid_root() -> Result<()> {
    let res = unsafe { nix::libc::setresuid(0, 0, 0) };
    Errno::result(res).map(|_| ()).map_err(Error::from)
}
